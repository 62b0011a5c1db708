use crate::config::ExampleConfig;
use std::fmt;

#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum FieldErrorType {
    Required,
    Invalid,
}

impl fmt::Display for FieldErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldErrorType::Required => write!(f, "Required value"),
            FieldErrorType::Invalid => write!(f, "Invalid value"),
        }
    }
}

/// A validation failure bound to a field path
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct FieldError {
    pub path: String,
    pub error_type: FieldErrorType,
    pub detail: String,
}

impl FieldError {
    pub fn required(path: &str, detail: &str) -> Self {
        FieldError {
            path: path.to_string(),
            error_type: FieldErrorType::Required,
            detail: detail.to_string(),
        }
    }

    pub fn invalid(path: &str, detail: &str) -> Self {
        FieldError {
            path: path.to_string(),
            error_type: FieldErrorType::Invalid,
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.path, self.error_type, self.detail)
    }
}

/// Aggregate of field errors, rendered like the apimachinery aggregate
#[derive(Eq, PartialEq, Clone, Debug, Default)]
pub struct ErrorList(pub Vec<FieldError>);

impl ErrorList {
    pub fn push(&mut self, e: FieldError) {
        self.0.push(e);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [single] => write!(f, "{single}"),
            many => {
                let all: Vec<String> = many.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", all.join(", "))
            }
        }
    }
}

impl std::error::Error for ErrorList {}

/// Semantic checks over a decoded provider config
pub fn validate(cfg: &ExampleConfig) -> Result<(), ErrorList> {
    let mut errs = ErrorList::default();
    if cfg.foo.is_empty() {
        errs.push(FieldError::required("foo", "empty value specified"));
    }
    errs.into_result()
}
