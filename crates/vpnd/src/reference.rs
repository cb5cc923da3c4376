//! Operator import and export of the reference data.

use std::path::Path;

use anyhow::{Context, bail};
use tracing::{info, warn};
use vpn_core::{OutputRef, decode_reference_flexible};
use vpn_state::{ReferenceSnapshot, StateStore};

/// Read a JSON snapshot as printed by `vpnd reference show`.
pub fn from_json_file(path: &Path) -> anyhow::Result<ReferenceSnapshot> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read reference snapshot {}", path.display()))?;
    Ok(ReferenceSnapshot::from_json(&json)?)
}

/// Read a hex-encoded reference datum and attribute it to `output`.
pub fn from_datum_hex_file(
    path: &Path,
    output: Option<OutputRef>,
) -> anyhow::Result<ReferenceSnapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read reference datum {}", path.display()))?;
    from_datum_hex(text.trim(), output)
}

pub fn from_datum_hex(hex_text: &str, output: Option<OutputRef>) -> anyhow::Result<ReferenceSnapshot> {
    let Some(output) = output else {
        bail!("a datum import needs the output that carried it (--output <tx hash>#<index>)");
    };
    let bytes = hex::decode(hex_text).context("reference datum is not valid hex")?;
    let decoded = decode_reference_flexible(&bytes)?;
    if !decoded.ambiguous_candidates.is_empty() {
        warn!(
            candidates = ?decoded.ambiguous_candidates,
            "imported datum had extra candidate lists; review the result"
        );
    }
    let snapshot = ReferenceSnapshot {
        output,
        position: None,
        prices: decoded.datum.prices,
        regions: decoded.datum.regions,
    };
    snapshot.validate()?;
    Ok(snapshot)
}

pub fn import(store: &StateStore, snapshot: &ReferenceSnapshot) -> anyhow::Result<()> {
    store.update_reference_data(snapshot)?;
    info!(
        output = %snapshot.output,
        prices = snapshot.prices.len(),
        regions = ?snapshot.regions,
        "reference data imported"
    );
    Ok(())
}

/// The stored snapshot as pretty JSON, or `null` when none is stored.
pub fn show(store: &StateStore) -> anyhow::Result<String> {
    match store.reference_data()? {
        Some(snapshot) => Ok(snapshot.to_json_pretty()?),
        None => Ok("null".to_string()),
    }
}
