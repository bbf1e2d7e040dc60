use thiserror::Error;

/// Unified error type for the conductor library
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Configuration errors, raised at load time
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Run-scoped errors (duplicate enqueue, unknown run, bad transition)
    #[error("Run error: {run_id} - {message}")]
    Run {
        run_id: String,
        message: String,
    },

    /// Synchronous failure while handing a run to the execution backend
    #[error("Dispatch failed for run {run_id}: {message}")]
    Dispatch {
        run_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Slot-table invariant violations. These are programming-error class:
    /// the table refuses to proceed rather than silently correcting a count.
    #[error("Slot accounting error in {operation}: {message}")]
    Slots {
        operation: String,
        message: String,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Network/IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ConductorError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            expected: None,
            actual: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
            expected: None,
            actual: None,
        }
    }

    /// Create a run-scoped error
    pub fn run<S: Into<String>, M: Into<String>>(run_id: S, message: M) -> Self {
        Self::Run {
            run_id: run_id.into(),
            message: message.into(),
        }
    }

    /// Create a dispatch error
    pub fn dispatch<S: Into<String>, M: Into<String>>(run_id: S, message: M) -> Self {
        Self::Dispatch {
            run_id: run_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a dispatch error wrapping the backend's failure
    pub fn dispatch_with_source<
        S: Into<String>,
        M: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    >(
        run_id: S,
        message: M,
        source: E,
    ) -> Self {
        Self::Dispatch {
            run_id: run_id.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a slot accounting error
    pub fn slots<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Slots {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Dispatch { .. } | Self::Io { .. } => true,
            Self::Configuration { .. } | Self::Slots { .. } => false,
            Self::Run { .. } | Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Run { .. } => "run",
            Self::Dispatch { .. } => "dispatch",
            Self::Slots { .. } => "slots",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Convert from common error types
impl From<std::io::Error> for ConductorError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ConductorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ConductorError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
