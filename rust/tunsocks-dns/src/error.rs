//! DNS error types

use thiserror::Error;

/// DNS operation result type
pub type Result<T> = std::result::Result<T, DnsError>;

/// DNS error types
#[derive(Error, Debug)]
pub enum DnsError {
    #[error("Fake-IP pool exhausted")]
    FakeIpExhausted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}
