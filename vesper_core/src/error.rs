use std::fmt::{self, Display};

/// Error raised by runtime operations outside of script code. Script-level
/// errors stay engine values and travel through `CallError::Script`.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misuse of the API: wrong arity, bad capacity, duplicate registration.
    Usage,
    /// Operation not permitted by the handle's capability view.
    Capability,
    /// Handle does not refer to a live runtime object of the expected kind.
    InvalidHandle,
    /// Allocation or thread creation failed.
    OutOfMemory,
    /// Value could not be moved between isolated heaps.
    Transfer,
    /// Failure reported by the underlying script engine.
    Engine,
}

impl RuntimeError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Usage,
        }
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Capability,
        }
    }

    pub fn invalid_handle(what: &str) -> Self {
        Self {
            message: format!("invalid {} handle", what),
            kind: ErrorKind::InvalidHandle,
        }
    }

    pub fn out_of_memory() -> Self {
        Self {
            message: "out of memory".to_string(),
            kind: ErrorKind::OutOfMemory,
        }
    }

    pub fn transfer(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Transfer,
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Engine,
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.kind == ErrorKind::Transfer
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Usage => write!(f, "usage error: {}", self.message),
            ErrorKind::Capability => write!(f, "capability error: {}", self.message),
            ErrorKind::InvalidHandle => write!(f, "{}", self.message),
            ErrorKind::OutOfMemory => write!(f, "{}", self.message),
            ErrorKind::Transfer => write!(f, "transfer error: {}", self.message),
            ErrorKind::Engine => write!(f, "engine error: {}", self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_kind() {
        assert_eq!(RuntimeError::usage("x").kind, ErrorKind::Usage);
        assert_eq!(RuntimeError::out_of_memory().kind, ErrorKind::OutOfMemory);
        assert!(RuntimeError::transfer("y").is_transfer());
        assert!(!RuntimeError::usage("z").is_transfer());
    }

    #[test]
    fn display_includes_message() {
        let err = RuntimeError::invalid_handle("channel");
        assert_eq!(err.to_string(), "invalid channel handle");
        let err = RuntimeError::transfer("value is not serializable");
        assert_eq!(err.to_string(), "transfer error: value is not serializable");
    }
}
