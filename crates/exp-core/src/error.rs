use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed job directory name '{name}': {reason}")]
    MalformedIdentity { name: String, reason: &'static str },

    #[error("inconsistent data: {0}")]
    InconsistentData(String),

    #[error("invalid timestamp '{0}': expected YYYY_MM_DD_HH_MM_SS")]
    InvalidTimestamp(String),

    #[error("timestamp must not be empty")]
    EmptyTimestamp,

    #[error("template references unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("invalid parameter grid: {0}")]
    InvalidGrid(String),

    #[error("invalid config template: {0}")]
    InvalidTemplate(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
