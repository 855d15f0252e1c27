use std::collections::HashMap;

use super::snapshot::{Connection, ConnectionsSnapshot, SnapshotTotals};

/// Separator used to join an ordered proxy chain into a label value.
pub const CHAIN_SEPARATOR: &str = ",";

/// Per-chain totals over the connections in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainAggregate {
    pub connections: u64,
    pub upload: u64,
    pub download: u64,
}

impl ChainAggregate {
    fn add(&mut self, conn: &Connection) {
        self.connections += 1;
        self.upload = self.upload.saturating_add(conn.upload);
        self.download = self.download.saturating_add(conn.download);
    }
}

/// Label value for a chain. The empty chain maps to the empty key.
pub fn chain_key(chains: &[String]) -> String {
    chains.join(CHAIN_SEPARATOR)
}

/// Result of one aggregation pass, ready to be published.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub totals: SnapshotTotals,
    pub connections: Vec<Connection>,
    pub chains: HashMap<String, ChainAggregate>,
}

impl Report {
    /// Fold a snapshot into per-chain aggregates in a single pass.
    pub fn aggregate(snapshot: ConnectionsSnapshot) -> Self {
        let mut chains: HashMap<String, ChainAggregate> = HashMap::new();
        for conn in &snapshot.connections {
            chains.entry(chain_key(&conn.chains)).or_default().add(conn);
        }

        Self {
            totals: snapshot.totals,
            connections: snapshot.connections,
            chains,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
