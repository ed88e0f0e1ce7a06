use std::net::SocketAddr;
use std::process::Command;

use crate::{ProcessInfo, Sock2ProcError, SocketProtocol};

/// Parse `lsof -F pc` field output: a `p<pid>` line followed by `c<command>`
fn parse_lsof_fields(output: &str) -> Option<ProcessInfo> {
    let mut pid = None;
    for line in output.lines() {
        if let Some(value) = line.strip_prefix('p') {
            pid = value.trim().parse::<u32>().ok();
        } else if let Some(name) = line.strip_prefix('c') {
            if let Some(pid) = pid {
                return Some(ProcessInfo {
                    pid,
                    name: name.trim().to_string(),
                    exe_path: None,
                });
            }
        }
    }
    None
}

fn lsof_selector(protocol: SocketProtocol, socket_addr: SocketAddr) -> String {
    let proto = match protocol {
        SocketProtocol::Tcp => "TCP",
        SocketProtocol::Udp => "UDP",
    };
    match socket_addr {
        SocketAddr::V4(v4) => format!("{}@{}:{}", proto, v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("{}@[{}]:{}", proto, v6.ip(), v6.port()),
    }
}

/// Find process by socket address using lsof
pub fn find_process_by_socket(
    protocol: SocketProtocol,
    socket_addr: SocketAddr,
) -> Result<ProcessInfo, Sock2ProcError> {
    let output = Command::new("lsof")
        .args(["-n", "-P", "-F", "pc", "-i"])
        .arg(lsof_selector(protocol, socket_addr))
        .output()
        .map_err(|e| Sock2ProcError::SystemError(e.to_string()))?;

    // lsof exits non-zero when nothing matched.
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_lsof_fields(&stdout).ok_or(Sock2ProcError::ProcessNotFound)
}
