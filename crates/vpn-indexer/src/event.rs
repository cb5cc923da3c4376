//! Chain events delivered by a [`ChainSource`](crate::source::ChainSource).
//!
//! Events serialize as tagged JSON objects, one per line in a replay file:
//!
//! ```text
//! {"type":"status","slot":10,"block_hash":"…","tip_slot":20,"tip_reached":false}
//! {"type":"transaction","tx_hash":"…","block":{"hash":"…","slot":10},"outputs":[…]}
//! ```

use serde::{Deserialize, Serialize};
use vpn_core::{AssetId, BlockHash, ChainPosition, OutputRef, PolicyId, TxHash};

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEvent {
    Transaction(TransactionEvent),
    Status(SyncStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub tx_hash: TxHash,
    pub block: ChainPosition,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
}

impl TransactionEvent {
    pub fn output_ref(&self, output: &TxOutput) -> OutputRef {
        OutputRef::new(self.tx_hash, output.index)
    }
}

/// A produced transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    /// Bech32 address.
    pub address: String,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
    /// Inline datum CBOR.
    #[serde(default, with = "opt_hex_bytes")]
    pub datum: Option<Vec<u8>>,
}

impl TxOutput {
    /// Assets minted under `policy`, in output order.
    pub fn assets_under<'a>(
        &'a self,
        policy: &'a PolicyId,
    ) -> impl Iterator<Item = &'a AssetEntry> + 'a {
        self.assets.iter().filter(move |a| a.policy_id == *policy)
    }

    pub fn holds(&self, asset: &AssetId) -> bool {
        self.assets
            .iter()
            .any(|a| a.policy_id == asset.policy_id && a.name == asset.name && a.quantity > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    pub policy_id: PolicyId,
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
    pub quantity: u64,
}

/// Progress report from the chain follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub slot: u64,
    pub block_hash: BlockHash,
    pub tip_slot: u64,
    #[serde(default)]
    pub tip_reached: bool,
}

impl SyncStatus {
    pub fn position(&self) -> ChainPosition {
        ChainPosition::new(self.block_hash, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transaction_line() {
        let line = format!(
            r#"{{"type":"transaction","tx_hash":"{tx}","block":{{"hash":"{blk}","slot":7}},"outputs":[{{"index":1,"address":"addr_test1xyz","assets":[{{"policy_id":"{pol}","name":"61646d696e","quantity":1}}],"datum":"d87980"}}]}}"#,
            tx = "11".repeat(32),
            blk = "22".repeat(32),
            pol = "33".repeat(28),
        );
        let event: ChainEvent = serde_json::from_str(&line).unwrap();
        let ChainEvent::Transaction(tx) = event else {
            panic!("expected transaction");
        };
        assert_eq!(tx.block.slot, 7);
        let output = &tx.outputs[0];
        assert_eq!(output.assets[0].name, b"admin");
        assert_eq!(output.datum.as_deref(), Some(&[0xd8, 0x79, 0x80][..]));
        assert_eq!(tx.output_ref(output).to_string(), format!("{}#1", "11".repeat(32)));
    }

    #[test]
    fn parse_status_line_defaults_tip_flag() {
        let line = format!(
            r#"{{"type":"status","slot":5,"block_hash":"{}","tip_slot":9}}"#,
            "aa".repeat(32)
        );
        let event: ChainEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(
            event,
            ChainEvent::Status(SyncStatus {
                slot: 5,
                block_hash: BlockHash::new([0xaa; 32]),
                tip_slot: 9,
                tip_reached: false,
            })
        );
    }

    #[test]
    fn holds_checks_policy_and_name() {
        let policy = PolicyId::new([1; 28]);
        let output = TxOutput {
            index: 0,
            address: "addr".to_string(),
            assets: vec![
                AssetEntry {
                    policy_id: policy,
                    name: b"admin".to_vec(),
                    quantity: 1,
                },
                AssetEntry {
                    policy_id: PolicyId::new([2; 28]),
                    name: b"x".to_vec(),
                    quantity: 1,
                },
            ],
            datum: None,
        };
        assert!(output.holds(&AssetId::new(policy, b"admin".to_vec())));
        assert!(!output.holds(&AssetId::new(policy, b"other".to_vec())));
        assert_eq!(output.assets_under(&policy).count(), 1);
    }
}
