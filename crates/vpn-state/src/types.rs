//! Domain types persisted by the state store.
//!
//! Byte fields (asset names, credentials) serialize as lowercase hex so the
//! stored JSON stays readable with `reference show` and friends.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use vpn_core::{ChainPosition, OutputRef, PricePlan};

use crate::error::{StateError, StateResult};

/// Serde helper for `Vec<u8>` fields stored as hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ── Cursor ─────────────────────────────────────────────────────────

/// A retained chain-sync resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorEntry {
    pub id: u64,
    pub position: ChainPosition,
}

// ── Reference data ─────────────────────────────────────────────────

/// The current plan catalog and region list, as last seen on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    /// Output that carried the reference token.
    pub output: OutputRef,
    /// Block the output was seen in. Absent for operator imports.
    #[serde(default)]
    pub position: Option<ChainPosition>,
    pub prices: Vec<PricePlan>,
    pub regions: Vec<String>,
}

impl ReferenceSnapshot {
    /// Rejects catalogs where one (duration, price) pair appears twice, which
    /// would make plan selection ambiguous.
    pub fn validate(&self) -> StateResult<()> {
        let mut seen = HashSet::with_capacity(self.prices.len());
        for plan in &self.prices {
            if !seen.insert((plan.duration, plan.price)) {
                return Err(StateError::InvalidInput(format!(
                    "duplicate plan {plan} in reference data"
                )));
            }
        }
        Ok(())
    }

    /// Index of the plan with this price and duration.
    pub fn plan_index(&self, price: i64, duration: i64) -> Option<usize> {
        self.prices
            .iter()
            .position(|p| p.price == price && p.duration == duration)
    }

    pub fn has_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region)
    }

    pub fn to_json_pretty(&self) -> StateResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| StateError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> StateResult<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| StateError::Deserialize(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

// ── Clients ────────────────────────────────────────────────────────

/// A subscription as observed on chain, keyed by asset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(with = "hex_bytes")]
    pub asset_name: Vec<u8>,
    /// Unix seconds.
    pub expiration: u64,
    #[serde(with = "hex_bytes")]
    pub credential: Vec<u8>,
    pub region: String,
    /// Output whose datum produced this record.
    pub origin: OutputRef,
}

impl ClientRecord {
    /// Ended strictly before `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration < now
    }

    /// Runs strictly past `now`. At `expiration == now` a client is
    /// neither active nor expired.
    pub fn is_active(&self, now: u64) -> bool {
        self.expiration > now
    }
}

// ── WireGuard ──────────────────────────────────────────────────────

/// A registered WireGuard device. Many peers may share one asset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgPeer {
    #[serde(with = "hex_bytes")]
    pub asset_name: Vec<u8>,
    pub pubkey: String,
    pub assigned_ip: String,
    /// Unix seconds.
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpn_core::{BlockHash, TxHash};

    fn snapshot(prices: &[(i64, i64)]) -> ReferenceSnapshot {
        ReferenceSnapshot {
            output: OutputRef::new(TxHash::new([1; 32]), 0),
            position: Some(ChainPosition::new(BlockHash::new([2; 32]), 100)),
            prices: prices
                .iter()
                .map(|&(duration, price)| PricePlan { duration, price })
                .collect(),
            regions: vec!["us-east".to_string()],
        }
    }

    #[test]
    fn plan_index_finds_unique_plans() {
        let snap = snapshot(&[(30, 5), (90, 12), (30, 6)]);
        snap.validate().unwrap();
        assert_eq!(snap.plan_index(5, 30), Some(0));
        assert_eq!(snap.plan_index(6, 30), Some(2));
        assert_eq!(snap.plan_index(7, 30), None);
        assert!(snap.has_region("us-east"));
        assert!(!snap.has_region("eu-west"));
    }

    #[test]
    fn duplicate_plans_fail_validation() {
        let snap = snapshot(&[(30, 5), (30, 5)]);
        assert!(matches!(snap.validate(), Err(StateError::InvalidInput(_))));
    }

    #[test]
    fn snapshot_json_import_export() {
        let snap = snapshot(&[(30, 5)]);
        let json = snap.to_json_pretty().unwrap();
        assert!(json.contains("\"regions\""));
        assert_eq!(ReferenceSnapshot::from_json(&json).unwrap(), snap);

        let no_position = format!(
            r#"{{"output":{{"tx_hash":"{}","index":1}},"prices":[{{"duration":1,"price":2}}],"regions":[]}}"#,
            "ab".repeat(32)
        );
        let imported = ReferenceSnapshot::from_json(&no_position).unwrap();
        assert_eq!(imported.position, None);
        assert_eq!(imported.output.index, 1);
    }

    #[test]
    fn client_record_hex_fields() {
        let record = ClientRecord {
            asset_name: vec![0xde, 0xad],
            expiration: 10,
            credential: vec![0x01],
            region: "us-east".to_string(),
            origin: OutputRef::new(TxHash::new([0; 32]), 2),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"dead\""));
        assert!(record.is_expired(11));
        assert!(!record.is_expired(9));
        assert!(record.is_active(9));
        assert!(!record.is_active(11));
    }

    #[test]
    fn client_expiring_now_is_neither_active_nor_expired() {
        let record = ClientRecord {
            asset_name: vec![0x01],
            expiration: 10,
            credential: vec![0x01],
            region: "us-east".to_string(),
            origin: OutputRef::new(TxHash::new([0; 32]), 0),
        };
        assert!(!record.is_expired(10));
        assert!(!record.is_active(10));
    }
}
