use std::fmt;

use serde::{Deserialize, Serialize};

/// Names one logical broker consumer: which caller key owns it, which queue
/// it drains, and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdentity {
    pub key: String,
    pub queue_name: String,
    pub owner_id: String,
}

impl ConnectionIdentity {
    pub fn new(
        key: impl Into<String>,
        owner_id: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            queue_name: queue_name.into(),
            owner_id: owner_id.into(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.owner_id, self.queue_name, self.key)
    }
}

/// Link-level state of a broker connection as published on the
/// `broker.connection.state` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LinkState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error,
    Disconnected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_display_includes_owner_and_queue() {
        let identity = ConnectionIdentity::new("c1", "ownerA", "Q1");
        assert_eq!(identity.to_string(), "ownerA@Q1 (c1)");
    }

    #[test]
    fn link_state_serializes_with_tag() {
        let json = serde_json::to_value(LinkState::Reconnecting { attempt: 3 }).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["attempt"], 3);

        let back: LinkState = serde_json::from_value(json).unwrap();
        assert_eq!(back, LinkState::Reconnecting { attempt: 3 });
    }

    #[test]
    fn only_connected_reports_connected() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(!LinkState::Reconnecting { attempt: 1 }.is_connected());
        assert!(!LinkState::Error.is_connected());
        assert!(!LinkState::Disconnected.is_connected());
    }
}
