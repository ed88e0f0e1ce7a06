use crate::conn::TargetAddr;
use crate::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};
use tunsocks_dns::FakeIpPool;

/// Reverse lookup from a synthetic address to the hostname it stands for
pub trait FakeDns: Send + Sync {
    fn ip_to_host(&self, ip: IpAddr) -> Option<String>;
}

impl FakeDns for FakeIpPool {
    fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => self.lookup(v4),
            IpAddr::V6(_) => None,
        }
    }
}

/// Translate `target` into the address handed to the proxy.
///
/// A known fake IP becomes its hostname with the original port; anything else
/// is dialed as the literal address.
pub fn resolve_target(fake_dns: Option<&dyn FakeDns>, target: SocketAddr) -> Result<TargetAddr> {
    let host = fake_dns.and_then(|dns| dns.ip_to_host(target.ip()));
    match host {
        Some(host) if host.is_empty() => Err(Error::invalid_target(format!(
            "fake IP {} maps to an empty host",
            target.ip()
        ))),
        Some(host) => Ok(TargetAddr::Domain(host, target.port())),
        None => Ok(TargetAddr::Ip(target)),
    }
}
