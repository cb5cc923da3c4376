//! Chain primitives: hashes, positions, asset identifiers, script addresses.
//!
//! All byte identifiers render as lowercase hex and serialize as hex strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors raised while parsing chain identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("invalid asset id '{0}': expected <policy hex>.<name hex>")]
    AssetId(String),

    #[error("invalid script address: {0}")]
    Address(String),

    #[error("invalid output reference '{0}': expected <tx hash>#<index>")]
    OutputRef(String),
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, ChainError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| ChainError::Length {
                    expected: $len,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ChainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| ChainError::Hex(e.to_string()))?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// Block header hash.
    BlockHash,
    32
);
fixed_bytes!(
    /// Transaction id.
    TxHash,
    32
);
fixed_bytes!(
    /// Minting policy id (script hash).
    PolicyId,
    28
);

/// A point on the chain: block hash plus absolute slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPosition {
    pub hash: BlockHash,
    pub slot: u64,
}

impl ChainPosition {
    pub fn new(hash: BlockHash, slot: u64) -> Self {
        Self { hash, slot }
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.slot)
    }
}

/// Reference to a transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_hash: TxHash,
    pub index: u32,
}

impl OutputRef {
    pub fn new(tx_hash: TxHash, index: u32) -> Self {
        Self { tx_hash, index }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.index)
    }
}

impl FromStr for OutputRef {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, index) = s
            .split_once('#')
            .ok_or_else(|| ChainError::OutputRef(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| ChainError::OutputRef(s.to_string()))?;
        Ok(Self::new(hash.parse()?, index))
    }
}

/// Native asset identifier: policy id plus asset name bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetId {
    pub policy_id: PolicyId,
    pub name: Vec<u8>,
}

impl AssetId {
    pub fn new(policy_id: PolicyId, name: impl Into<Vec<u8>>) -> Self {
        Self {
            policy_id,
            name: name.into(),
        }
    }

    pub fn name_hex(&self) -> String {
        hex::encode(&self.name)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.policy_id, self.name_hex())
    }
}

impl FromStr for AssetId {
    type Err = ChainError;

    /// Parses `<policy hex>.<asset name hex>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (policy, name) = s
            .split_once('.')
            .ok_or_else(|| ChainError::AssetId(s.to_string()))?;
        let policy_id: PolicyId = policy.parse()?;
        let name = hex::decode(name).map_err(|_| ChainError::AssetId(s.to_string()))?;
        if name.len() > 32 {
            return Err(ChainError::AssetId(s.to_string()));
        }
        Ok(Self { policy_id, name })
    }
}

/// A Shelley-era bech32 address whose payment credential is the script hash
/// of the client minting policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptAddress {
    bech32: String,
    header: u8,
    payment_hash: PolicyId,
}

impl ScriptAddress {
    pub fn parse(address: &str) -> Result<Self, ChainError> {
        let (_hrp, bytes) =
            bech32::decode(address).map_err(|e| ChainError::Address(e.to_string()))?;
        let header = *bytes
            .first()
            .ok_or_else(|| ChainError::Address("empty payload".to_string()))?;
        // Types 0..=7 carry a payment credential; 8+ are Byron and reward addresses.
        if header >> 4 > 7 {
            return Err(ChainError::Address(format!(
                "unsupported address type {}",
                header >> 4
            )));
        }
        if bytes.len() < 1 + PolicyId::LEN {
            return Err(ChainError::Address(format!(
                "payload too short: {} bytes",
                bytes.len()
            )));
        }
        let payment_hash = PolicyId::from_slice(&bytes[1..1 + PolicyId::LEN])?;
        Ok(Self {
            bech32: address.to_string(),
            header,
            payment_hash,
        })
    }

    /// The original bech32 form, used for address equality checks.
    pub fn as_str(&self) -> &str {
        &self.bech32
    }

    /// The payment credential hash; client assets are minted under this policy.
    pub fn payment_hash(&self) -> PolicyId {
        self.payment_hash
    }

    /// Whether the payment credential is a script rather than a key.
    pub fn is_script(&self) -> bool {
        (self.header >> 4) & 1 == 1
    }
}

impl fmt::Display for ScriptAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bech32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREPROD_SCRIPT: &str = "addr_test1zrmx2wvrdqurqgp2wg4v8v9g27zugxezyt75as9zkycyda2jduk3c6ecrpkrk8qqlr4ep37cx03ytlcn70n93zyemj6s4mgt63";
    const KEY_ADDRESS: &str = "addr_test1qpjwevqy6mh5hsnudjgpgrtfjwwxdtl7d73e9u0kxg9453jjduk3c6ecrpkrk8qqlr4ep37cx03ytlcn70n93zyemj6sasxnj5";

    #[test]
    fn parse_script_address_payment_hash() {
        let addr = ScriptAddress::parse(PREPROD_SCRIPT).unwrap();
        assert_eq!(
            addr.payment_hash().to_hex(),
            "f6653983683830202a722ac3b0a85785c41b2222fd4ec0a2b13046f5"
        );
        assert!(addr.is_script());
        assert_eq!(addr.as_str(), PREPROD_SCRIPT);
    }

    #[test]
    fn parse_key_address() {
        let addr = ScriptAddress::parse(KEY_ADDRESS).unwrap();
        assert_eq!(
            addr.payment_hash().to_hex(),
            "64ecb004d6ef4bc27c6c90140d69939c66affe6fa392f1f6320b5a46"
        );
        assert!(!addr.is_script());
    }

    #[test]
    fn parse_address_rejects_garbage() {
        assert!(matches!(
            ScriptAddress::parse("not-an-address"),
            Err(ChainError::Address(_))
        ));
        // Flip the last checksum character.
        let mut broken = PREPROD_SCRIPT.to_string();
        broken.pop();
        broken.push('q');
        assert!(ScriptAddress::parse(&broken).is_err());
    }

    #[test]
    fn asset_id_parses_policy_and_name() {
        let id: AssetId = "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b.61646d696e"
            .parse()
            .unwrap();
        assert_eq!(
            id.policy_id.to_hex(),
            "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b"
        );
        assert_eq!(id.name, b"admin");
        assert_eq!(
            id.to_string(),
            "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b.61646d696e"
        );
    }

    #[test]
    fn asset_id_rejects_malformed() {
        assert!("nodot".parse::<AssetId>().is_err());
        assert!("abcd.61".parse::<AssetId>().is_err());
        assert!(
            "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b.zz"
                .parse::<AssetId>()
                .is_err()
        );
    }

    #[test]
    fn hash_length_is_checked() {
        let err = "abcd".parse::<BlockHash>().unwrap_err();
        assert_eq!(
            err,
            ChainError::Length {
                expected: 32,
                actual: 2
            }
        );
        assert!(matches!("xyz".parse::<TxHash>(), Err(ChainError::Hex(_))));
    }

    #[test]
    fn output_ref_display_and_serde() {
        let out = OutputRef::new(TxHash::new([0xab; 32]), 3);
        assert_eq!(out.to_string(), format!("{}#3", "ab".repeat(32)));

        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains(&"ab".repeat(32)));
        let back: OutputRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn output_ref_parses_hash_and_index() {
        let text = format!("{}#7", "cd".repeat(32));
        let out: OutputRef = text.parse().unwrap();
        assert_eq!(out, OutputRef::new(TxHash::new([0xcd; 32]), 7));

        assert!(matches!(
            "cd".repeat(32).parse::<OutputRef>(),
            Err(ChainError::OutputRef(_))
        ));
        assert!(matches!(
            format!("{}#x", "cd".repeat(32)).parse::<OutputRef>(),
            Err(ChainError::OutputRef(_))
        ));
    }
}
