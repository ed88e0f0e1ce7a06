use std::net::SocketAddr;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// tunsocks error types
///
/// Every variant describes a failure scoped to a single flow, except `Config`
/// which is only produced while building a handler.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid target: {message}")]
    InvalidTarget { message: String },

    #[error("Dial error: {message}")]
    Dial {
        message: String,
        proxy: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("proxy connection {local}->{remote} does not exist")]
    FlowNotFound {
        local: SocketAddr,
        remote: SocketAddr,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        protocol: Option<String>,
    },

    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        operation: Option<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS error: {0}")]
    Dns(#[from] tunsocks_dns::DnsError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with source
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_target<S: Into<String>>(message: S) -> Self {
        Self::InvalidTarget {
            message: message.into(),
        }
    }

    /// Create a new dial error against `proxy`
    pub fn dial<S: Into<String>, P: Into<String>>(message: S, proxy: P) -> Self {
        Self::Dial {
            message: message.into(),
            proxy: Some(proxy.into()),
            source: None,
        }
    }

    /// Create a new dial error with source
    pub fn dial_with_source<S, P, E>(message: S, proxy: P, source: E) -> Self
    where
        S: Into<String>,
        P: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Dial {
            message: message.into(),
            proxy: Some(proxy.into()),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            protocol: None,
        }
    }

    /// Create a new protocol error with protocol info
    pub fn protocol_with_info<S: Into<String>, P: Into<String>>(message: S, protocol: P) -> Self {
        Self::Protocol {
            message: message.into(),
            protocol: Some(protocol.into()),
        }
    }

    pub fn timeout<S: Into<String>, O: Into<String>>(message: S, operation: O) -> Self {
        Self::Timeout {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "CONFIG",
            Self::InvalidTarget { .. } => "INVALID_TARGET",
            Self::Dial { .. } => "DIAL",
            Self::Transport { .. } => "TRANSPORT",
            Self::FlowNotFound { .. } => "FLOW_NOT_FOUND",
            Self::Protocol { .. } => "PROTOCOL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Io(_) => "IO",
            Self::Dns(_) => "DNS",
        }
    }

    /// Check if this is a recoverable error
    ///
    /// Per-flow failures never take the process down; only configuration
    /// errors are unrecoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_not_found_message() {
        let err = Error::FlowNotFound {
            local: "10.0.0.2:5353".parse().unwrap(),
            remote: "8.8.8.8:53".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "proxy connection 10.0.0.2:5353->8.8.8.8:53 does not exist"
        );
        assert_eq!(err.code(), "FLOW_NOT_FOUND");
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_dial_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::dial_with_source("connect failed", "127.0.0.1:1080", io);
        assert_eq!(err.code(), "DIAL");
        assert!(err.source().is_some());
        assert!(!Error::config("bad").is_recoverable());
    }
}
