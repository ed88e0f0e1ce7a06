//! tunsocks DNS - Fake-IP mapping for transparent proxying
//!
//! Hands out synthetic IPv4 addresses for domain names so that intercepted
//! connections can later be redialed by hostname.
//!
//! ```text
//!   DNS query "example.com"          TCP/UDP flow to 198.18.0.5
//!            |                                  |
//!       +----v------+    ip -> domain     +-----v------+
//!       | allocate  | ------------------> |  lookup    |
//!       +-----------+    FakeIpPool       +------------+
//! ```

pub mod error;
pub mod fake_ip;

pub use error::{DnsError, Result};
pub use fake_ip::{FakeIpEntry, FakeIpPool, DEFAULT_FAKE_IP_RANGE, DEFAULT_FAKE_IP_TTL};
