#[cfg(test)]
mod error_tests {
    use screenrec::errors::RecorderError;
    use std::error::Error;

    #[test]
    fn test_capability_unavailable_display() {
        let error = RecorderError::CapabilityUnavailable("no loopback".to_string());
        assert_eq!(error.to_string(), "Capability unavailable: no loopback");
        assert_eq!(error.kind(), "capability_unavailable");
    }

    #[test]
    fn test_configuration_rejected_display() {
        let error = RecorderError::ConfigurationRejected("odd width".to_string());
        assert!(error.to_string().contains("Configuration rejected"));
        assert!(error.to_string().contains("odd width"));
    }

    #[test]
    fn test_io_error_maps_to_stream_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume");
        let error: RecorderError = io.into();
        assert!(matches!(error, RecorderError::StreamIOFailure(_)));
        assert!(error.to_string().contains("read-only volume"));
    }

    #[test]
    fn test_error_debug_format() {
        let error = RecorderError::MergeFailure("Debug test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("MergeFailure"));
        assert!(debug_str.contains("Debug test"));
    }

    #[test]
    fn test_implements_error_trait() {
        let error = RecorderError::InvalidState("Error trait test".to_string());
        let _error_trait: &dyn Error = &error;
        assert!(error.source().is_none());
    }

    #[test]
    fn test_all_error_variants() {
        let errors = vec![
            RecorderError::CapabilityUnavailable("a".to_string()),
            RecorderError::ConfigurationRejected("b".to_string()),
            RecorderError::StreamIOFailure("c".to_string()),
            RecorderError::MergeFailure("d".to_string()),
            RecorderError::InvalidState("e".to_string()),
        ];
        let mut kinds: Vec<_> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len(), "every variant has its own kind");
        for error in &errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
