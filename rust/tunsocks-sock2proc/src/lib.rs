use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum Sock2ProcError {
    #[error("Process not found")]
    ProcessNotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Invalid socket address")]
    InvalidSocketAddr,
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Not implemented for this platform")]
    NotImplemented,
}

/// Transport protocol of the socket being looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Find the process that owns the local socket `socket_addr`.
///
/// This walks OS tables and may block for a few milliseconds; call it off the
/// async executor.
pub fn find_process_by_socket(
    protocol: SocketProtocol,
    socket_addr: SocketAddr,
) -> Result<ProcessInfo, Sock2ProcError> {
    if socket_addr.port() == 0 {
        return Err(Sock2ProcError::InvalidSocketAddr);
    }

    #[cfg(target_os = "linux")]
    {
        platform::linux::find_process_by_socket(protocol, socket_addr)
    }
    #[cfg(target_os = "macos")]
    {
        platform::macos::find_process_by_socket(protocol, socket_addr)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = protocol;
        Err(Sock2ProcError::NotImplemented)
    }
}

#[cfg(target_os = "linux")]
mod platform {
    pub mod linux;
}

#[cfg(target_os = "macos")]
mod platform {
    pub mod macos;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_port_is_rejected() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            find_process_by_socket(SocketProtocol::Tcp, addr),
            Err(Sock2ProcError::InvalidSocketAddr)
        ));
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(SocketProtocol::Tcp.to_string(), "tcp");
        assert_eq!(SocketProtocol::Udp.to_string(), "udp");
    }
}
