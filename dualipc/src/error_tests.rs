//! Tests for error handling

use crate::Error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::role_violation("notify_all", "initiator");
        assert_eq!(
            err.to_string(),
            "Operation 'notify_all' is not available to the initiator role"
        );

        let err = Error::remote_failure(None);
        assert_eq!(err.to_string(), "Remote handler failed: no handler installed");

        let err = Error::remote_failure(Some("division by zero".to_string()));
        assert_eq!(err.to_string(), "Remote handler failed: division by zero");

        let err = Error::timeout("invocation 17", 5000);
        assert_eq!(
            err.to_string(),
            "Operation timed out after 5000ms: invocation 17"
        );

        let err = Error::invalid_endpoint_name("");
        assert_eq!(err.to_string(), "Invalid endpoint name: \"\"");
    }

    #[test]
    fn test_error_is_retryable() {
        // Retryable errors
        assert!(Error::transport_msg("socket hiccup").is_retryable());
        assert!(Error::connection_msg("connection lost").is_retryable());
        assert!(Error::timeout("invoke", 1000).is_retryable());
        assert!(Error::runtime_msg("task failed").is_retryable());

        // Non-retryable errors
        assert!(!Error::role_violation("notify", "responder").is_retryable());
        assert!(!Error::remote_failure(None).is_retryable());
        assert!(!Error::invalid_endpoint_name("\n").is_retryable());
        assert!(!Error::serialization_msg("invalid format").is_retryable());
        assert!(!Error::configuration("invalid config", None).is_retryable());
        assert!(!Error::subscription_error("gone").is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::transport_msg("error").category(), "transport");
        assert_eq!(Error::role_violation("invoke", "responder").category(), "role");
        assert_eq!(Error::invalid_endpoint_name("").category(), "endpoint_name");
        assert_eq!(Error::remote_failure(None).category(), "remote");
        assert_eq!(Error::serialization_msg("err").category(), "serialization");
        assert_eq!(Error::connection_msg("err").category(), "connection");
        assert_eq!(Error::timeout("op", 1000).category(), "timeout");
        assert_eq!(Error::runtime_msg("err").category(), "runtime");
        assert_eq!(
            Error::configuration("err", None).category(),
            "configuration"
        );
        assert_eq!(Error::protocol("err", None, None).category(), "protocol");
        assert_eq!(Error::subscription_error("err").category(), "subscription");
    }

    #[test]
    fn test_error_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::NotFound, "socket not found");
        let err = Error::from(io_err);

        match err {
            Error::Io { message, source } => {
                assert!(message.contains("socket not found"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_context_fields() {
        let err = Error::configuration(
            "expected milliseconds",
            Some("DUALIPC_INVOKE_TIMEOUT_MS".to_string()),
        );
        match err {
            Error::Configuration { message, field } => {
                assert_eq!(message, "expected milliseconds");
                assert_eq!(field, Some("DUALIPC_INVOKE_TIMEOUT_MS".to_string()));
            }
            _ => panic!("Expected Configuration error"),
        }

        let err = Error::protocol(
            "invoke frame without a correlation id",
            Some("integer".to_string()),
            Some("\"abc\"".to_string()),
        );
        match err {
            Error::Protocol {
                message,
                expected,
                received,
            } => {
                assert_eq!(message, "invoke frame without a correlation id");
                assert_eq!(expected, Some("integer".to_string()));
                assert_eq!(received, Some("\"abc\"".to_string()));
            }
            _ => panic!("Expected Protocol error"),
        }
    }

    #[test]
    fn test_bincode_error_conversion() {
        let data = vec![0xFF, 0xFF, 0xFF, 0xFF]; // Invalid data
        let result: Result<String, bincode::Error> = bincode::deserialize(&data);

        if let Err(bincode_err) = result {
            let err: Error = bincode_err.into();
            assert!(matches!(err, Error::Serialization { .. }));
            assert!(err.to_string().contains("Bincode serialization failed"));
        }
    }

    #[test]
    fn test_json_error_conversion() {
        let result: Result<Vec<serde_json::Value>, serde_json::Error> =
            serde_json::from_slice(b"not json");
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { source: Some(_), .. }));
        assert!(err.to_string().contains("JSON serialization failed"));
    }

    #[test]
    fn test_custom_error_constructors() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::transport("bus join failed", io_err);
        assert!(matches!(
            err,
            Error::Transport {
                source: Some(_),
                ..
            }
        ));

        let runtime_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let err = Error::runtime("task timeout", runtime_err);
        assert!(matches!(
            err,
            Error::Runtime {
                source: Some(_),
                ..
            }
        ));
    }
}
