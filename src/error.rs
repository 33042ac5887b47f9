use thiserror::Error;

/// Gateway error taxonomy.
///
/// Connection-level failures are tolerated (the server is excluded from the
/// batch); invocation-level failures are converted to structured result
/// values at the seam where a model or human sees them next. Only internal
/// faults propagate as hard errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to '{server}': {reason}")]
    Connect { server: String, reason: String },

    #[error("'{0}' timed out")]
    Timeout(String),

    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    #[error("server '{0}' not found")]
    ServerNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("script rejected: {0}")]
    Script(String),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// True when the message points at an invalid enumerated value, which is
    /// the only failure class the invocation wrapper retries.
    pub fn is_enum_violation(&self) -> bool {
        match self {
            Self::Validation(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("enum")
                    || msg.contains("is not one of")
                    || msg.contains("invalid value")
                    || msg.contains("must be one of")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_violation_detection() {
        let e = GatewayError::Validation("\"foo\" is not one of [\"a\", \"b\"]".to_string());
        assert!(e.is_enum_violation());

        let e = GatewayError::Validation("missing required field 'name'".to_string());
        assert!(!e.is_enum_violation());

        // Only validation-class errors are ever retried.
        let e = GatewayError::Internal("enum".to_string());
        assert!(!e.is_enum_violation());
    }
}
