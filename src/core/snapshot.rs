use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// The `/connections` payload could not be decoded.
#[derive(Debug, Error)]
#[error("malformed connections payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Cumulative traffic counters as reported by Clash.
///
/// These are upstream totals since Clash started, not sums over the
/// connections currently listed in the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotTotals {
    pub download_total: u64,
    pub upload_total: u64,
}

/// A single active connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub id: String,
    pub upload: u64,
    pub download: u64,
    /// Upstream proxies the connection is routed through, in order.
    #[serde(deserialize_with = "null_as_empty")]
    pub chains: Vec<String>,
}

/// Full snapshot returned by `GET /connections`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionsSnapshot {
    #[serde(flatten)]
    pub totals: SnapshotTotals,
    #[serde(deserialize_with = "null_as_empty")]
    pub connections: Vec<Connection>,
}

impl ConnectionsSnapshot {
    /// Decode a raw response body.
    ///
    /// Fields Clash adds beyond the ones modelled here (`metadata`, `rule`,
    /// `start`, ...) are ignored.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
