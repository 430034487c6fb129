use crate::messages::control::relay::RelayId;
use serde::{Deserialize, Deserializer};
use tracing::debug;

/// Observed state of one relay as reported by the board. The firmware
/// also sends the remaining ON time which is not needed here.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    /// Relay channel, 1 based.
    pub id: RelayId,
    /// Observed state, true when the relay is closed.
    pub state: bool,
}

/// Status message received on the status topic. Any fields other
/// than `relays` (api key, device timestamp) are ignored.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayStatusMessage {
    /// Reports for zero or more relays. Entries that do not decode as a
    /// report are dropped, the rest of the message is kept.
    #[serde(default, deserialize_with = "skip_invalid_reports")]
    pub relays: Vec<RelayReport>,
}

/// Decode the `relays` array one entry at a time, dropping the entries
/// that are not a valid report.
fn skip_invalid_reports<'de, D>(deserializer: D) -> Result<Vec<RelayReport>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let mut reports = Vec::with_capacity(entries.len());
    for entry in entries {
        match RelayReport::deserialize(&entry) {
            Ok(report) => reports.push(report),
            Err(e) => debug!(%entry, error = %e, "Skipping invalid relay report"),
        }
    }
    Ok(reports)
}

impl RelayStatusMessage {
    /// Decode a raw MQTT payload.
    ///
    /// * `payload`: bytes received on the status topic.
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
