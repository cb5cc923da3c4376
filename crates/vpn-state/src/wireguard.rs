//! WireGuard peer cache and per-region IP allocation.
//!
//! The peer rows here mirror the remote ledger and can be rebuilt from it.
//! A peer belongs to a region through its client's region; allocation scans
//! that live join rather than trusting the stored hint alone.

use std::collections::{HashMap, HashSet};

use redb::{ReadableDatabase, ReadableTable};
use tracing::{debug, info, warn};
use vpn_core::net::{self, FIRST_HOST_OCTET, WgSubnet};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::tables::*;
use crate::types::*;

/// Assigned IPs of all peers whose client is in `region`.
fn region_peer_ips<P, C>(peers: &P, clients: &C, region: &str) -> StateResult<Vec<String>>
where
    P: ReadableTable<&'static str, &'static [u8]>,
    C: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut client_regions: HashMap<Vec<u8>, Option<String>> = HashMap::new();
    let mut ips = Vec::new();
    for entry in peers.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let peer: WgPeer = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if !client_regions.contains_key(&peer.asset_name) {
            let client_region = match clients
                .get(peer.asset_name.as_slice())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    let client: ClientRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(client.region)
                }
                None => None,
            };
            client_regions.insert(peer.asset_name.clone(), client_region);
        }
        if client_regions
            .get(&peer.asset_name)
            .and_then(|r| r.as_deref())
            == Some(region)
        {
            ips.push(peer.assigned_ip);
        }
    }
    Ok(ips)
}

fn used_octets(ips: &[String]) -> HashSet<u8> {
    ips.iter().filter_map(|ip| net::last_octet(ip)).collect()
}

/// Parses the host octet of a peer IP, rejecting reserved addresses.
fn host_octet(ip: &str) -> StateResult<u8> {
    let octet = net::last_octet(ip)
        .ok_or_else(|| StateError::InvalidInput(format!("invalid IP format: {ip}")))?;
    if !net::is_host_octet(octet) {
        return Err(StateError::InvalidInput(format!(
            "IP octet {octet} out of valid range (2-254): reserved address"
        )));
    }
    Ok(octet)
}

impl StateStore {
    // ── Peers ──────────────────────────────────────────────────────

    /// Record a peer. Re-adding a pubkey for the same client updates its IP
    /// in place; a pubkey held by another client is a conflict.
    pub fn add_wg_peer(&self, peer: &WgPeer) -> StateResult<()> {
        if peer.pubkey.is_empty() || peer.asset_name.is_empty() {
            return Err(StateError::InvalidInput(
                "peer pubkey and asset name must not be empty".to_string(),
            ));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
            let existing: Option<WgPeer> = match table
                .get(peer.pubkey.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            let row = match existing {
                Some(current) if current.asset_name != peer.asset_name => {
                    return Err(StateError::PubkeyConflict {
                        pubkey: peer.pubkey.clone(),
                    });
                }
                Some(current) if current.assigned_ip == peer.assigned_ip => return Ok(()),
                Some(current) => WgPeer {
                    assigned_ip: peer.assigned_ip.clone(),
                    ..current
                },
                None => peer.clone(),
            };
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(peer.pubkey.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            asset_name = %hex::encode(&peer.asset_name),
            ip = %peer.assigned_ip,
            "wireguard peer stored"
        );
        Ok(())
    }

    /// Get a peer by public key.
    pub fn wg_peer_by_pubkey(&self, pubkey: &str) -> StateResult<Option<WgPeer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
        match table.get(pubkey).map_err(map_err!(Read))? {
            Some(guard) => {
                let peer: WgPeer =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(peer))
            }
            None => Ok(None),
        }
    }

    /// List every cached peer.
    pub fn list_wg_peers(&self) -> StateResult<Vec<WgPeer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let peer: WgPeer =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(peer);
        }
        Ok(results)
    }

    /// Peers registered under one client, oldest first.
    pub fn wg_peers_by_asset(&self, asset_name: &[u8]) -> StateResult<Vec<WgPeer>> {
        let mut peers: Vec<WgPeer> = self
            .list_wg_peers()?
            .into_iter()
            .filter(|p| p.asset_name == asset_name)
            .collect();
        peers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.pubkey.cmp(&b.pubkey))
        });
        Ok(peers)
    }

    pub fn count_wg_peers_by_asset(&self, asset_name: &[u8]) -> StateResult<usize> {
        Ok(self.wg_peers_by_asset(asset_name)?.len())
    }

    /// Delete a peer by public key. Returns true if it existed. The caller is
    /// responsible for releasing its IP with [`StateStore::deallocate_ip`].
    pub fn delete_wg_peer(&self, pubkey: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
            existed = table.remove(pubkey).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(existed, "wireguard peer deleted");
        Ok(existed)
    }

    /// Whether the local cache holds any peer at all.
    pub fn has_wg_peers(&self) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
        Ok(table.first().map_err(map_err!(Read))?.is_some())
    }

    /// Peers in `region` whose client subscription has ended.
    pub fn expired_wg_peers(&self, region: &str, now: u64) -> StateResult<Vec<WgPeer>> {
        self.peers_in_region(region, |client| client.is_expired(now))
    }

    /// Peers in `region` whose client subscription is still running.
    pub fn active_peers_for_region(&self, region: &str, now: u64) -> StateResult<Vec<WgPeer>> {
        self.peers_in_region(region, |client| client.is_active(now))
    }

    fn peers_in_region(
        &self,
        region: &str,
        keep: impl Fn(&ClientRecord) -> bool,
    ) -> StateResult<Vec<WgPeer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let peers = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
        let clients = txn.open_table(CLIENTS).map_err(map_err!(Table))?;
        let mut matched: HashMap<Vec<u8>, bool> = HashMap::new();
        let mut results = Vec::new();
        for entry in peers.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let peer: WgPeer =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            let include = match matched.get(&peer.asset_name) {
                Some(include) => *include,
                None => {
                    let include = match clients
                        .get(peer.asset_name.as_slice())
                        .map_err(map_err!(Read))?
                    {
                        Some(guard) => {
                            let client: ClientRecord = serde_json::from_slice(guard.value())
                                .map_err(map_err!(Deserialize))?;
                            client.region == region && keep(&client)
                        }
                        None => false,
                    };
                    matched.insert(peer.asset_name.clone(), include);
                    include
                }
            };
            if include {
                results.push(peer);
            }
        }
        Ok(results)
    }

    // ── IP pool ────────────────────────────────────────────────────

    /// Hand out the next free address in `region`.
    ///
    /// Runs in one write transaction: the pool row is read (or created at
    /// `.2`), used octets come from the peer/client join, and the scan starts
    /// at the hint and wraps from `.254` to `.2`. The hint moves to the octet
    /// after the one returned.
    pub fn allocate_ip(&self, region: &str, subnet: &WgSubnet) -> StateResult<String> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut pool = txn.open_table(WG_IP_POOL).map_err(map_err!(Table))?;
            let peers = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
            let clients = txn.open_table(CLIENTS).map_err(map_err!(Table))?;

            let hint = pool
                .get(region)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .filter(|octet| net::is_host_octet(*octet))
                .unwrap_or(FIRST_HOST_OCTET);
            let used = used_octets(&region_peer_ips(&peers, &clients, region)?);

            let mut current = hint;
            loop {
                if !used.contains(&current) {
                    break;
                }
                current = net::next_host_octet(current);
                if current == hint {
                    warn!(%region, "IP pool exhausted");
                    return Err(StateError::PoolExhausted(region.to_string()));
                }
            }
            found = current;
            pool.insert(region, net::next_host_octet(found))
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        let ip = subnet.address(found).to_string();
        debug!(%region, %ip, "allocated IP");
        Ok(ip)
    }

    /// Point the region's hint at `ip` so the next allocation retries it.
    pub fn deallocate_ip(&self, region: &str, ip: &str) -> StateResult<()> {
        let octet = host_octet(ip)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut pool = txn.open_table(WG_IP_POOL).map_err(map_err!(Table))?;
            pool.insert(region, octet).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%region, %ip, "deallocated IP");
        Ok(())
    }

    /// Reset the hint to one past the highest octet in use, or `.2` when the
    /// region has no peers. Returns the new hint.
    pub fn rebuild_ip_pool(&self, region: &str) -> StateResult<u8> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut pool = txn.open_table(WG_IP_POOL).map_err(map_err!(Table))?;
            let peers = txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
            let clients = txn.open_table(CLIENTS).map_err(map_err!(Table))?;

            let max_octet = used_octets(&region_peer_ips(&peers, &clients, region)?)
                .into_iter()
                .max();
            next = match max_octet {
                Some(max) => net::next_host_octet(max),
                None => FIRST_HOST_OCTET,
            };
            pool.insert(region, next).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%region, next_ip = next, "IP pool rebuilt");
        Ok(next)
    }

    /// The stored hint for `region`, if a pool row exists.
    pub fn ip_pool_hint(&self, region: &str) -> StateResult<Option<u8>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WG_IP_POOL).map_err(map_err!(Table))?;
        Ok(table
            .get(region)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value()))
    }
}
