use common::{Cluster, Extension};
use kube::CustomResourceExt;

fn main() {
    for crd in [Extension::crd(), Cluster::crd()] {
        println!("---");
        match serde_yaml::to_string(&crd) {
            Ok(yaml) => print!("{yaml}"),
            Err(e) => {
                eprintln!("cannot render {}: {e}", crd.metadata.name.unwrap_or_default());
                std::process::exit(1);
            }
        }
    }
}
