/*!
   Per-path state tracked by the [`RelayerDriver`](super::RelayerDriver).
*/

use core::fmt::{self, Display};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/**
   The lifecycle of a relayer path. States only move forward, in the
   order they are declared, except that any state may move to `Failed`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathState {
    None,
    Added,
    Clients,
    Connected,
    Opened,
    Relaying,
    Stopped,
    Failed,
}

impl PathState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Added => "ADDED",
            Self::Clients => "CLIENTS",
            Self::Connected => "CONNECTED",
            Self::Opened => "OPENED",
            Self::Relaying => "RELAYING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrdering {
    Ordered,
    Unordered,
}

impl ChannelOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordered => "ordered",
            Self::Unordered => "unordered",
        }
    }
}

/// Options for the channel opened on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChannelOptions {
    pub source_port: String,
    pub destination_port: String,
    pub ordering: ChannelOrdering,
    pub version: String,
}

impl Default for CreateChannelOptions {
    fn default() -> Self {
        Self {
            source_port: "transfer".to_string(),
            destination_port: "transfer".to_string(),
            ordering: ChannelOrdering::Unordered,
            version: "ics20-1".to_string(),
        }
    }
}

/// The identifiers of one end of an established channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnd {
    pub port_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub a_side: ChannelEnd,
    pub b_side: ChannelEnd,
    pub ordering: ChannelOrdering,
    pub version: String,
}

/// A pair of identifiers, one on each chain of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPair {
    pub a: String,
    pub b: String,
}

/// Pending packet counts on a path, as seen by the relayer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingPackets {
    pub unreceived_packets: usize,
    pub unreceived_acks: usize,
}

/**
   Everything the driver knows about a path. The chains are identified
   by chain-id.
*/
#[derive(Debug, Clone)]
pub struct PathRecord {
    pub name: String,
    pub chain_a: String,
    pub chain_b: String,
    pub state: PathState,
    pub clients: Option<IdPair>,
    pub connections: Option<IdPair>,
    pub channels: Vec<ChannelInfo>,
    pub error: Option<Error>,
}

impl PathRecord {
    pub fn new(name: &str, chain_a: &str, chain_b: &str) -> Self {
        Self {
            name: name.to_string(),
            chain_a: chain_a.to_string(),
            chain_b: chain_b.to_string(),
            state: PathState::None,
            clients: None,
            connections: None,
            channels: Vec::new(),
            error: None,
        }
    }

    /// Whether the path has already reached `target` and need not move.
    pub fn has_reached(&self, target: PathState) -> bool {
        self.state != PathState::Failed && self.state >= target
    }
}

impl PendingPackets {
    pub fn is_empty(&self) -> bool {
        self.unreceived_packets == 0 && self.unreceived_acks == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(PathState::None < PathState::Added);
        assert!(PathState::Opened < PathState::Relaying);
        assert!(PathState::Relaying < PathState::Stopped);

        let mut record = PathRecord::new("gaia-osmo", "gaia-1", "osmosis-1");
        record.state = PathState::Opened;
        assert!(record.has_reached(PathState::Clients));
        assert!(!record.has_reached(PathState::Relaying));

        record.state = PathState::Failed;
        assert!(!record.has_reached(PathState::Added));
    }
}
