//! Condition errors

/// Error raised while compiling or evaluating a condition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Syntax error at {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("Undeclared reference to '{0}'")]
    UnknownVariable(String),

    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Function {name} failed: {message}")]
    Function { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConditionError>;

impl ConditionError {
    pub fn syntax<S: Into<String>>(pos: usize, message: S) -> Self {
        ConditionError::Syntax {
            pos,
            message: message.into(),
        }
    }

    pub fn type_error<S: Into<String>>(message: S) -> Self {
        ConditionError::Type(message.into())
    }
}
