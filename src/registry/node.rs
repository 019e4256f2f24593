//! Exit node model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Node lifecycle state. A node is `Connecting` between its register
/// message and the gateway's ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connecting,
    Active,
    Draining,
    Inactive,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Connecting => "connecting",
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// Client protocol a node can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks5,
}

/// Attributes a node presents at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub asn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<Protocol>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Http, Protocol::Socks5]
}

fn default_capacity() -> u32 {
    1
}

impl NodeAttributes {
    pub fn new(country: &str, city: &str, asn: u32) -> Self {
        NodeAttributes {
            country: country.to_string(),
            city: city.to_string(),
            asn,
            isp: None,
            connection_type: None,
            device_type: None,
            sdk_version: None,
            protocols: default_protocols(),
            capacity: default_capacity(),
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Canonical form stored in the registry
    pub fn normalized(mut self) -> Self {
        self.country = self.country.trim().to_ascii_uppercase();
        self.city = self.city.trim().to_string();
        if self.capacity == 0 {
            self.capacity = 1;
        }
        if self.protocols.is_empty() {
            self.protocols = default_protocols();
        }
        self.protocols.sort_unstable();
        self.protocols.dedup();
        self
    }

    pub fn supports(&self, protocol: Protocol) -> bool {
        self.protocols.contains(&protocol)
    }
}

/// Point-in-time copy of one registry entry
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub attrs: NodeAttributes,
    pub status: NodeStatus,
    /// Active client sessions at snapshot time
    pub sessions: u32,
    pub last_heartbeat: Instant,
    pub connected_at: Instant,
    pub connected_at_utc: DateTime<Utc>,
}

impl Node {
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Load ordering: lower `sessions / capacity` first.
    ///
    /// Compares by cross-multiplication so no float rounding can make two
    /// different loads compare equal.
    pub fn cmp_load(&self, other: &Node) -> Ordering {
        let lhs = self.sessions as u64 * other.attrs.capacity.max(1) as u64;
        let rhs = other.sessions as u64 * self.attrs.capacity.max(1) as u64;
        lhs.cmp(&rhs)
    }

    /// Selection ordering: least loaded, then freshest heartbeat, then node ID
    pub fn cmp_preference(&self, other: &Node) -> Ordering {
        self.cmp_load(other)
            .then_with(|| other.last_heartbeat.cmp(&self.last_heartbeat))
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn info(&self, now: Instant) -> NodeInfo {
        NodeInfo {
            id: self.id.clone(),
            country: self.attrs.country.clone(),
            city: self.attrs.city.clone(),
            asn: self.attrs.asn,
            isp: self.attrs.isp.clone(),
            protocols: self.attrs.protocols.clone(),
            status: self.status,
            sessions: self.sessions,
            capacity: self.attrs.capacity,
            heartbeat_age_secs: self.heartbeat_age(now).as_secs(),
            connected_at: self.connected_at_utc,
        }
    }
}

/// Node view for the status API
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub country: String,
    pub city: String,
    pub asn: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    pub protocols: Vec<Protocol>,
    pub status: NodeStatus,
    pub sessions: u32,
    pub capacity: u32,
    pub heartbeat_age_secs: u64,
    pub connected_at: DateTime<Utc>,
}
