//! Client credential issuance, as seen from the indexer.
//!
//! Certificate and profile generation live outside this crate; the router
//! only needs something it can ask to provision a client for this region.

use std::future::Future;
use std::pin::Pin;

use tracing::info;

/// Boxed future returned by [`ClientProvisioner`] methods.
pub type ProvisionFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;

/// Issues VPN credentials for a client subscription in the local region.
pub trait ClientProvisioner: Send + Sync {
    /// Generate (or regenerate) the client for `asset_name`, reachable at
    /// `host:port`. Returns an identifier for the generated client.
    fn generate<'a>(&'a self, asset_name: &'a [u8], host: &'a str, port: u16)
    -> ProvisionFuture<'a>;
}

/// Provisioner that only records the request. Used when credential issuance
/// runs as a separate service watching the same store.
#[derive(Debug, Default, Clone)]
pub struct LoggingProvisioner;

impl ClientProvisioner for LoggingProvisioner {
    fn generate<'a>(
        &'a self,
        asset_name: &'a [u8],
        host: &'a str,
        port: u16,
    ) -> ProvisionFuture<'a> {
        Box::pin(async move {
            let client_id = hex::encode(asset_name);
            info!(client = %client_id, %host, port, "client provisioning requested");
            Ok(client_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_provisioner_returns_hex_id() {
        let id = LoggingProvisioner
            .generate(b"abc", "us-east.test.domain", 443)
            .await
            .unwrap();
        assert_eq!(id, "616263");
    }
}
