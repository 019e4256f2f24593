//! Control channel messages
//!
//! One JSON object per line, shaped `{"type": ..., "data": {...}}`.

use crate::registry::NodeAttributes;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registration payload sent by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: String,
    #[serde(flatten)]
    pub attrs: NodeAttributes,
}

impl Registration {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::protocol("register: empty node_id"));
        }
        if self.node_id.len() > 128 {
            return Err(Error::protocol("register: node_id too long"));
        }
        let country = self.attrs.country.trim();
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::protocol(format!(
                "register: invalid country code {:?}",
                self.attrs.country
            )));
        }
        Ok(())
    }
}

/// Node -> gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeMessage {
    Register(Registration),
    Heartbeat { node_id: String },
    Pong { nonce: u64 },
    Error { message: String },
}

/// Gateway -> node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayMessage {
    Ack { node_id: String },
    Error { message: String },
    Ping { nonce: u64 },
    OpenTunnel { tunnel_id: String },
    Command { command: NodeCommand },
}

/// Maintenance command for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCommand {
    /// Stop selecting the node; existing sessions continue
    Drain,
    /// Make a drained node selectable again
    Resume,
    /// Close the control connection
    Disconnect,
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeCommand::Drain => "drain",
            NodeCommand::Resume => "resume",
            NodeCommand::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// First line a node writes on a reverse tunnel connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHello {
    pub tunnel_id: String,
    pub node_id: String,
}

impl NodeMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::protocol(format!("bad control message: {}", e)))
    }
}

impl GatewayMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
