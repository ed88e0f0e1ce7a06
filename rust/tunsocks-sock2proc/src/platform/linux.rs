use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{ProcessInfo, Sock2ProcError, SocketProtocol};

fn socket_tables(protocol: SocketProtocol) -> [(&'static str, bool); 2] {
    match protocol {
        SocketProtocol::Tcp => [("/proc/net/tcp", false), ("/proc/net/tcp6", true)],
        SocketProtocol::Udp => [("/proc/net/udp", false), ("/proc/net/udp6", true)],
    }
}

/// Convert the kernel's hex notation (host-order 32-bit words) to an IPv4 address
fn hex_to_ipv4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let word = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(word.to_le_bytes()))
}

/// Convert the kernel's hex notation (four host-order 32-bit words) to an IPv6 address
fn hex_to_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Some(Ipv6Addr::from(octets))
}

/// Parse one row of /proc/net/{tcp,udp}[6] into (local address, inode)
fn parse_entry(line: &str, is_ipv6: bool) -> Option<(SocketAddr, u64)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (addr_hex, port_hex) = parts[1].split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if is_ipv6 {
        IpAddr::V6(hex_to_ipv6(addr_hex)?)
    } else {
        IpAddr::V4(hex_to_ipv4(addr_hex)?)
    };
    let inode = parts[9].parse::<u64>().ok()?;

    Some((SocketAddr::new(ip, port), inode))
}

fn same_socket(entry: SocketAddr, wanted: SocketAddr) -> bool {
    if entry.port() != wanted.port() {
        return false;
    }
    let entry_ip = match entry.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    };
    entry_ip == wanted.ip()
}

/// Find the socket inode for `addr`, preferring an exact match over a wildcard bind
fn find_inode(protocol: SocketProtocol, addr: SocketAddr) -> Result<u64, Sock2ProcError> {
    let mut wildcard = None;

    for (path, is_ipv6) in socket_tables(protocol) {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound && is_ipv6 => continue,
            Err(e) => return Err(Sock2ProcError::SystemError(e.to_string())),
        };

        for (entry, inode) in content
            .lines()
            .skip(1)
            .filter_map(|line| parse_entry(line, is_ipv6))
        {
            if inode == 0 {
                continue;
            }
            if same_socket(entry, addr) {
                return Ok(inode);
            }
            if wildcard.is_none() && entry.port() == addr.port() && entry.ip().is_unspecified() {
                wildcard = Some(inode);
            }
        }
    }

    wildcard.ok_or(Sock2ProcError::ProcessNotFound)
}

/// Find the process holding a descriptor for `socket:[inode]`
fn find_owner(inode: u64) -> Result<ProcessInfo, Sock2ProcError> {
    let needle = format!("socket:[{}]", inode);
    let entries = fs::read_dir("/proc").map_err(|e| Sock2ProcError::SystemError(e.to_string()))?;

    for entry in entries.flatten() {
        let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        // Processes of other users are unreadable without privileges.
        let fds = match fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };

        let owns = fds.flatten().any(|fd| {
            fs::read_link(fd.path())
                .map(|link| link.as_os_str() == needle.as_str())
                .unwrap_or(false)
        });
        if owns {
            return get_process_info(pid);
        }
    }

    Err(Sock2ProcError::ProcessNotFound)
}

fn get_process_info(pid: u32) -> Result<ProcessInfo, Sock2ProcError> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Sock2ProcError::PermissionDenied
        } else {
            Sock2ProcError::ProcessNotFound
        }
    })?;

    let name = status
        .lines()
        .find_map(|line| line.strip_prefix("Name:"))
        .map(|name| name.trim().to_string())
        .ok_or(Sock2ProcError::ProcessNotFound)?;

    let exe_path = fs::read_link(format!("/proc/{}/exe", pid))
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()));

    Ok(ProcessInfo {
        pid,
        name,
        exe_path,
    })
}

pub fn find_process_by_socket(
    protocol: SocketProtocol,
    socket_addr: SocketAddr,
) -> Result<ProcessInfo, Sock2ProcError> {
    let inode = find_inode(protocol, socket_addr)?;
    find_owner(inode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_entry() {
        let line = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0";
        let (addr, inode) = parse_entry(line, false).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(inode, 12345);
    }

    #[test]
    fn test_parse_ipv6_entry() {
        let line = "   1: 00000000000000000000000001000000:0035 00000000000000000000000000000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 777 2 0000000000000000 0";
        let (addr, inode) = parse_entry(line, true).unwrap();
        assert_eq!(addr, "[::1]:53".parse::<SocketAddr>().unwrap());
        assert_eq!(inode, 777);
    }

    #[test]
    fn test_parse_short_line() {
        assert!(parse_entry("sl local_address rem_address", false).is_none());
    }

    #[test]
    fn test_mapped_address_matches() {
        let mapped: SocketAddr = "[::ffff:10.0.0.2]:5000".parse().unwrap();
        let wanted: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        assert!(same_socket(mapped, wanted));
        assert!(!same_socket(mapped, "10.0.0.2:5001".parse().unwrap()));
    }
}
