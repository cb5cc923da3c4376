//! Peer registry write paths.
//!
//! The remote ledger is authoritative. A registration allocates an address,
//! writes the ledger, and only then touches the local cache and the live
//! endpoint. If the ledger write fails the address is handed back. Steps
//! after the ledger write are best-effort and reported as [`StepStatus`] so
//! the caller can see drift that a later rebuild or sync will repair.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vpn_core::{Config, WgSubnet};
use vpn_state::{ClientRecord, StateStore, WgPeer};

use crate::endpoint::PeerEndpoint;
use crate::error::{PeerError, PeerResult};
use crate::ledger::{PeerLedger, unix_now};

/// Length of a base64 WireGuard public key.
pub const WG_PUBKEY_LENGTH: usize = 44;

const WG_PUBKEY_BYTES: usize = 32;

pub const DEFAULT_MAX_DEVICES: usize = 3;

/// True for a 44-character base64 string decoding to 32 bytes.
pub fn is_valid_wg_pubkey(pubkey: &str) -> bool {
    pubkey.len() == WG_PUBKEY_LENGTH
        && STANDARD
            .decode(pubkey)
            .is_ok_and(|bytes| bytes.len() == WG_PUBKEY_BYTES)
}

/// Pubkey prefix safe to put in logs.
pub(crate) fn short_key(pubkey: &str) -> String {
    match pubkey.get(..8) {
        Some(prefix) if pubkey.len() > 8 => format!("{prefix}..."),
        _ => pubkey.to_string(),
    }
}

/// Outcome of a best-effort step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    /// Nothing to do, or no collaborator configured.
    Skipped,
    Failed(String),
}

impl StepStatus {
    fn from_result<E: fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => StepStatus::Done,
            Err(e) => StepStatus::Failed(e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub assigned_ip: String,
    pub device_count: usize,
    pub device_limit: usize,
    /// The pubkey was already registered to this client.
    pub existing: bool,
    pub cache: StepStatus,
    pub endpoint: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub remaining_devices: usize,
    pub cache: StepStatus,
    pub deallocate: StepStatus,
    pub endpoint: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Devices {
    pub devices: Vec<WgPeer>,
    pub limit: usize,
}

/// Instance-level settings for the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub region: String,
    pub subnet: WgSubnet,
    pub max_devices: usize,
    pub dns: String,
    pub server_pubkey: String,
    pub endpoint: String,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> PeerResult<Self> {
        let subnet = WgSubnet::parse(&config.wireguard.subnet).map_err(PeerError::Misconfigured)?;
        Ok(Self {
            region: config.vpn.region.clone(),
            subnet,
            max_devices: config.wireguard.max_devices,
            dns: config.wireguard.dns.clone(),
            server_pubkey: config.wireguard.server_pubkey.clone(),
            endpoint: config.wireguard.endpoint.clone(),
        })
    }
}

pub struct PeerRegistry {
    store: StateStore,
    ledger: Arc<PeerLedger>,
    endpoint: Option<Arc<dyn PeerEndpoint>>,
    settings: RegistrySettings,
}

impl PeerRegistry {
    pub fn new(
        store: StateStore,
        ledger: Arc<PeerLedger>,
        endpoint: Option<Arc<dyn PeerEndpoint>>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            store,
            ledger,
            endpoint,
            settings,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &StateStore {
        &self.store
    }

    pub(crate) fn ledger(&self) -> &PeerLedger {
        &self.ledger
    }

    /// A client that may use this instance right now.
    fn active_client(&self, asset_name: &[u8]) -> PeerResult<ClientRecord> {
        let client = self
            .store
            .client_by_asset_name(asset_name)?
            .ok_or_else(|| PeerError::NotFound("unknown client".to_string()))?;
        if client.is_expired(unix_now()) {
            return Err(PeerError::Expired);
        }
        if client.region != self.settings.region {
            return Err(PeerError::Forbidden(format!(
                "subscription is for region {}",
                client.region
            )));
        }
        Ok(client)
    }

    fn validate_pubkey(pubkey: &str) -> PeerResult<()> {
        if pubkey.is_empty() {
            return Err(PeerError::InvalidInput("wg_pubkey is required".to_string()));
        }
        if !is_valid_wg_pubkey(pubkey) {
            return Err(PeerError::InvalidInput("invalid wg_pubkey format".to_string()));
        }
        Ok(())
    }

    /// Register `pubkey` as a device of `asset_name`.
    pub async fn register_peer(
        &self,
        asset_name: &[u8],
        pubkey: &str,
        cancel: &CancellationToken,
    ) -> PeerResult<Registration> {
        Self::validate_pubkey(pubkey)?;
        self.active_client(asset_name)?;
        let limit = self.settings.max_devices;

        if let Some(existing) = self.store.wg_peer_by_pubkey(pubkey)? {
            if existing.asset_name != asset_name {
                warn!(
                    asset_name = %hex::encode(asset_name),
                    pubkey = %short_key(pubkey),
                    "registration attempt for key owned by another client"
                );
                return Err(PeerError::Forbidden("unable to register device".to_string()));
            }
            return Ok(Registration {
                assigned_ip: existing.assigned_ip,
                device_count: self.store.count_wg_peers_by_asset(asset_name)?,
                device_limit: limit,
                existing: true,
                cache: StepStatus::Skipped,
                endpoint: StepStatus::Skipped,
            });
        }

        let device_count = self.store.count_wg_peers_by_asset(asset_name)?;
        if device_count >= limit {
            return Err(PeerError::DeviceLimit { limit });
        }

        let region = &self.settings.region;
        let assigned_ip = self.store.allocate_ip(region, &self.settings.subnet)?;

        if let Err(e) = self
            .ledger
            .save_peer(asset_name, pubkey, &assigned_ip, cancel)
            .await
        {
            error!(error = %e, ip = %assigned_ip, "failed to save peer to ledger");
            if let Err(dealloc) = self.store.deallocate_ip(region, &assigned_ip) {
                error!(
                    ip = %assigned_ip,
                    error = %dealloc,
                    "failed to deallocate IP after ledger failure"
                );
            }
            return Err(e.into());
        }

        let peer = WgPeer {
            asset_name: asset_name.to_vec(),
            pubkey: pubkey.to_string(),
            assigned_ip: assigned_ip.clone(),
            created_at: unix_now(),
        };
        let cache = StepStatus::from_result(self.store.add_wg_peer(&peer));
        if let StepStatus::Failed(reason) = &cache {
            warn!(
                pubkey = %short_key(pubkey),
                error = %reason,
                "failed to cache peer locally, will rebuild from ledger"
            );
        }

        let endpoint = match &self.endpoint {
            Some(endpoint) => {
                StepStatus::from_result(endpoint.add_peer(pubkey, &assigned_ip).await.map(|_| ()))
            }
            None => StepStatus::Skipped,
        };
        if let StepStatus::Failed(reason) = &endpoint {
            error!(pubkey = %short_key(pubkey), error = %reason, "failed to add peer to endpoint");
        }

        info!(
            asset_name = %hex::encode(asset_name),
            pubkey = %short_key(pubkey),
            ip = %assigned_ip,
            "peer registered"
        );
        Ok(Registration {
            assigned_ip,
            device_count: device_count + 1,
            device_limit: limit,
            existing: false,
            cache,
            endpoint,
        })
    }

    /// Remove the device `pubkey` from `asset_name`.
    pub async fn remove_peer(
        &self,
        asset_name: &[u8],
        pubkey: &str,
        cancel: &CancellationToken,
    ) -> PeerResult<Removal> {
        Self::validate_pubkey(pubkey)?;
        let peer = match self.store.wg_peer_by_pubkey(pubkey)? {
            Some(peer) if peer.asset_name == asset_name => peer,
            Some(_) => {
                warn!(
                    asset_name = %hex::encode(asset_name),
                    pubkey = %short_key(pubkey),
                    "delete request for key owned by another client"
                );
                return Err(PeerError::NotFound("device not registered".to_string()));
            }
            None => return Err(PeerError::NotFound("peer not registered".to_string())),
        };

        self.ledger.remove_peer(asset_name, pubkey, cancel).await?;

        let cache = match self.store.delete_wg_peer(pubkey) {
            Ok(true) => StepStatus::Done,
            Ok(false) => StepStatus::Skipped,
            Err(e) => {
                warn!(pubkey = %short_key(pubkey), error = %e, "failed to delete cached peer");
                StepStatus::Failed(e.to_string())
            }
        };

        let deallocate = StepStatus::from_result(
            self.store
                .deallocate_ip(&self.settings.region, &peer.assigned_ip),
        );
        if let StepStatus::Failed(reason) = &deallocate {
            warn!(ip = %peer.assigned_ip, error = %reason, "failed to deallocate IP");
        }

        let endpoint = match &self.endpoint {
            Some(endpoint) => {
                StepStatus::from_result(endpoint.remove_peer(pubkey, &peer.assigned_ip).await)
            }
            None => StepStatus::Skipped,
        };
        if let StepStatus::Failed(reason) = &endpoint {
            error!(pubkey = %short_key(pubkey), error = %reason, "failed to remove peer from endpoint");
        }

        let remaining_devices = self.store.count_wg_peers_by_asset(asset_name)?;
        info!(
            asset_name = %hex::encode(asset_name),
            pubkey = %short_key(pubkey),
            remaining_devices,
            "peer removed"
        );
        Ok(Removal {
            remaining_devices,
            cache,
            deallocate,
            endpoint,
        })
    }

    /// Registered devices of `asset_name`.
    pub fn devices(&self, asset_name: &[u8]) -> PeerResult<Devices> {
        Ok(Devices {
            devices: self.store.wg_peers_by_asset(asset_name)?,
            limit: self.settings.max_devices,
        })
    }

    /// WireGuard client configuration for a registered device. The private
    /// key stays with the client and is left as a placeholder.
    pub fn profile(&self, asset_name: &[u8], pubkey: &str) -> PeerResult<String> {
        Self::validate_pubkey(pubkey)?;
        self.active_client(asset_name)?;
        let peer = match self.store.wg_peer_by_pubkey(pubkey)? {
            Some(peer) if peer.asset_name == asset_name => peer,
            Some(_) => return Err(PeerError::NotFound("device not registered".to_string())),
            None => {
                return Err(PeerError::NotFound(
                    "device not registered - register it first".to_string(),
                ));
            }
        };
        let settings = &self.settings;
        if settings.server_pubkey.is_empty() || settings.endpoint.is_empty() {
            error!(
                server_pubkey_set = !settings.server_pubkey.is_empty(),
                endpoint_set = !settings.endpoint.is_empty(),
                "WireGuard server configuration incomplete"
            );
            return Err(PeerError::Misconfigured(
                "server public key and endpoint are required".to_string(),
            ));
        }
        debug!(pubkey = %short_key(pubkey), "rendering WireGuard profile");
        Ok(format!(
            "[Interface]\n\
             PrivateKey = <REPLACE_WITH_YOUR_PRIVATE_KEY>\n\
             Address = {ip}/32\n\
             DNS = {dns}\n\
             \n\
             [Peer]\n\
             PublicKey = {server}\n\
             Endpoint = {endpoint}\n\
             AllowedIPs = 0.0.0.0/0\n\
             PersistentKeepalive = 25\n",
            ip = peer.assigned_ip,
            dns = settings.dns,
            server = settings.server_pubkey,
            endpoint = settings.endpoint,
        ))
    }
}
