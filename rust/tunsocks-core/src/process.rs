use crate::conn::Network;
use async_trait::async_trait;
use std::net::SocketAddr;
use tunsocks_sock2proc::find_process_by_socket;

/// Name reported when the owning process cannot be determined
pub const UNKNOWN_PROCESS: &str = "unknown";

/// Best-effort attribution of a local socket to the process that owns it
#[async_trait]
pub trait ProcessResolver: Send + Sync {
    /// Never fails; returns [`UNKNOWN_PROCESS`] when the lookup does.
    async fn process_name(&self, network: Network, local: SocketAddr) -> String;
}

/// Resolver backed by the OS socket tables
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessResolver;

#[async_trait]
impl ProcessResolver for SystemProcessResolver {
    async fn process_name(&self, network: Network, local: SocketAddr) -> String {
        let lookup =
            tokio::task::spawn_blocking(move || find_process_by_socket(network.into(), local))
                .await;

        match lookup {
            Ok(Ok(info)) if !info.name.is_empty() => info.name,
            Ok(Ok(_)) => UNKNOWN_PROCESS.to_string(),
            Ok(Err(e)) => {
                tracing::trace!("process lookup for {}://{} failed: {}", network, local, e);
                UNKNOWN_PROCESS.to_string()
            }
            Err(e) => {
                tracing::debug!("process lookup task failed: {}", e);
                UNKNOWN_PROCESS.to_string()
            }
        }
    }
}

/// Resolver that never looks anything up
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProcessResolver;

#[async_trait]
impl ProcessResolver for NoopProcessResolver {
    async fn process_name(&self, _network: Network, _local: SocketAddr) -> String {
        UNKNOWN_PROCESS.to_string()
    }
}
