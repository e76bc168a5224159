use std::fmt::{self, Display};

/// Errors produced by model constructors and the wire codec.
#[derive(Debug)]
pub enum ModelError {
    /// A required wire field is absent or empty.
    MissingField(&'static str),
    /// A wire field is present but cannot be interpreted.
    InvalidField { field: &'static str, reason: String },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::MissingField(field) => {
                write!(f, "missing wire field: {field}")
            }
            ModelError::InvalidField { field, reason } => {
                write!(f, "invalid wire field {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
