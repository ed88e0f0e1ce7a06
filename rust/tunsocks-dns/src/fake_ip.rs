//! Fake-IP pool for transparent proxying
//!
//! Fake-IP mode assigns virtual IP addresses to domain names, so that a flow
//! intercepted by destination IP can be redialed by its original domain name.

use crate::error::{DnsError, Result};
use dashmap::DashMap;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Default Fake-IP range (RFC 2544 benchmarking block)
pub const DEFAULT_FAKE_IP_RANGE: &str = "198.18.0.0/15";

/// Idle time after which a mapping may be recycled
pub const DEFAULT_FAKE_IP_TTL: Duration = Duration::from_secs(3600);

/// Fake-IP pool entry
#[derive(Debug, Clone)]
pub struct FakeIpEntry {
    /// The domain name
    pub domain: String,
    /// Time when this entry was created
    pub created_at: Instant,
    /// Last access time
    pub last_access: Instant,
}

impl FakeIpEntry {
    fn new(domain: String) -> Self {
        let now = Instant::now();
        Self {
            domain,
            created_at: now,
            last_access: now,
        }
    }
}

struct Allocator {
    next: u32,
    recycled: VecDeque<Ipv4Addr>,
}

/// Bidirectional domain <-> Fake-IP mapping
pub struct FakeIpPool {
    range: Ipv4Net,
    first: u32,
    last: u32,
    domain_to_ip: DashMap<String, Ipv4Addr>,
    ip_to_domain: DashMap<Ipv4Addr, FakeIpEntry>,
    // Serializes allocation; lookups never take it.
    allocator: Mutex<Allocator>,
    ttl: Duration,
    filter: Vec<String>,
}

impl FakeIpPool {
    /// Create a new Fake-IP pool over `range` (CIDR notation).
    ///
    /// The network address and the first host (the gateway) are never handed
    /// out, nor is the broadcast address.
    pub fn new(range: &str, filter: Vec<String>) -> Result<Self> {
        let range: Ipv4Net = range
            .trim()
            .parse()
            .map_err(|e| DnsError::Config(format!("Invalid Fake-IP range: {}", e)))?;

        if range.prefix_len() > 30 {
            return Err(DnsError::Config(format!(
                "Fake-IP range {} is too small",
                range
            )));
        }

        let first = u32::from(range.network()) + 2;
        let last = u32::from(range.broadcast()) - 1;

        info!(
            "Fake-IP pool initialized: range={}, size={}",
            range,
            last - first + 1
        );

        Ok(Self {
            range,
            first,
            last,
            domain_to_ip: DashMap::new(),
            ip_to_domain: DashMap::new(),
            allocator: Mutex::new(Allocator {
                next: first,
                recycled: VecDeque::new(),
            }),
            ttl: DEFAULT_FAKE_IP_TTL,
            filter: filter.into_iter().map(|p| p.to_lowercase()).collect(),
        })
    }

    /// Replace the idle TTL after which mappings may be recycled
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Check if a domain should be excluded from Fake-IP
    pub fn should_filter(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        self.filter.iter().any(|pattern| {
            if let Some(base) = pattern.strip_prefix("*.") {
                domain.len() > base.len() + 1 && domain.ends_with(&pattern[1..])
            } else if let Some(base) = pattern.strip_prefix("+.") {
                domain == base || domain.ends_with(&pattern[1..])
            } else {
                domain == *pattern
            }
        })
    }

    /// Allocate a Fake-IP for a domain, reusing the existing mapping if any
    pub fn allocate(&self, domain: &str) -> Result<Ipv4Addr> {
        let domain = normalize(domain)?;

        if let Some(ip) = self.touch(&domain) {
            trace!("Fake-IP cache hit: {} -> {}", domain, ip);
            return Ok(ip);
        }

        let mut alloc = self.allocator.lock();
        // Another task may have mapped the same domain while we waited.
        if let Some(ip) = self.touch(&domain) {
            return Ok(ip);
        }

        let ip = match self.next_free(&mut alloc) {
            Some(ip) => ip,
            None => {
                self.recycle_expired(&mut alloc);
                self.next_free(&mut alloc)
                    .ok_or(DnsError::FakeIpExhausted)?
            }
        };

        self.ip_to_domain.insert(ip, FakeIpEntry::new(domain.clone()));
        self.domain_to_ip.insert(domain.clone(), ip);

        debug!("Fake-IP allocated: {} -> {}", domain, ip);
        Ok(ip)
    }

    /// Lookup domain by Fake-IP
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.ip_to_domain.get_mut(&ip).map(|mut entry| {
            entry.last_access = Instant::now();
            entry.domain.clone()
        })
    }

    /// Lookup the Fake-IP currently assigned to a domain
    pub fn lookup_domain(&self, domain: &str) -> Option<Ipv4Addr> {
        let domain = normalize(domain).ok()?;
        self.domain_to_ip.get(&domain).map(|ip| *ip)
    }

    /// Check if an IP is in the Fake-IP range
    pub fn is_fake_ip(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(&ip)
    }

    pub fn range(&self) -> &Ipv4Net {
        &self.range
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of live mappings
    pub fn size(&self) -> usize {
        self.ip_to_domain.len()
    }

    /// Clear all mappings and restart allocation from the beginning of the range
    pub fn clear(&self) {
        let mut alloc = self.allocator.lock();
        self.domain_to_ip.clear();
        self.ip_to_domain.clear();
        alloc.recycled.clear();
        alloc.next = self.first;
        info!("Fake-IP pool cleared");
    }

    /// Recycle mappings idle for longer than the TTL, returning how many were freed
    pub fn cleanup_expired(&self) -> usize {
        let mut alloc = self.allocator.lock();
        self.recycle_expired(&mut alloc)
    }

    fn touch(&self, domain: &str) -> Option<Ipv4Addr> {
        let ip = *self.domain_to_ip.get(domain)?;
        if let Some(mut entry) = self.ip_to_domain.get_mut(&ip) {
            entry.last_access = Instant::now();
        }
        Some(ip)
    }

    fn next_free(&self, alloc: &mut Allocator) -> Option<Ipv4Addr> {
        if let Some(ip) = alloc.recycled.pop_front() {
            return Some(ip);
        }
        if alloc.next > self.last {
            return None;
        }
        let ip = Ipv4Addr::from(alloc.next);
        alloc.next += 1;
        Some(ip)
    }

    fn recycle_expired(&self, alloc: &mut Allocator) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();

        self.ip_to_domain.retain(|ip, entry| {
            if now.duration_since(entry.last_access) > self.ttl {
                expired.push((*ip, entry.domain.clone()));
                false
            } else {
                true
            }
        });

        for (ip, domain) in &expired {
            self.domain_to_ip.remove_if(domain, |_, mapped| mapped == ip);
            alloc.recycled.push_back(*ip);
        }

        if !expired.is_empty() {
            debug!("Fake-IP cleanup: recycled {} IPs", expired.len());
        }
        expired.len()
    }
}

fn normalize(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_lowercase();
    if domain.is_empty() || domain.len() > 253 {
        return Err(DnsError::InvalidDomain(domain));
    }
    Ok(domain)
}
