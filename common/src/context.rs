use crate::EXTENSION_NAME;
use kube::runtime::events::Reporter;

fn get_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()?
        .to_owned()
        .into()
}

/// Field manager used for every write issued by this process
pub fn get_client_name() -> String {
    match get_prog_name() {
        Some(p) if p == "crdgen" => format!("{EXTENSION_NAME}-crdgen"),
        _ => EXTENSION_NAME.to_string(),
    }
}

/// Identity of this replica, used as lease holder and event instance
pub fn get_instance_name() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_client_name(),
        instance: Some(get_instance_name()),
    }
}
