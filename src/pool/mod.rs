//! Node selection and pre-provisioning
//!
//! - [`NodeIndex`]: criteria queries over a registry snapshot
//! - [`StickySessions`]: token to node affinity
//! - [`WarmPool`]: background-probed subset of nodes
//! - [`TunnelPool`]: pre-dialed reverse tunnels, with the fallback chain used by sessions

mod index;
mod sticky;
mod tunnel;
mod warm;

pub use index::{matches, normalize_city, MatchLevel, NodeIndex, Selection};
pub use sticky::StickySessions;
pub use tunnel::{
    ActiveTunnel, Tunnel, TunnelConnector, TunnelPool, TunnelPoolStats, TunnelSource, TunnelStream,
};
pub use warm::{Prober, WarmEntry, WarmPool, WarmStats};

use crate::registry::Protocol;

/// Targeting constraints for one selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    /// ISO country code, upper case
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub protocol: Option<Protocol>,
    /// Preferred node from a sticky session
    pub sticky_node: Option<String>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn country(mut self, country: &str) -> Self {
        self.country = Some(country.trim().to_ascii_uppercase());
        self
    }

    pub fn city(mut self, city: &str) -> Self {
        self.city = Some(city.to_string());
        self
    }

    pub fn asn(mut self, asn: u32) -> Self {
        self.asn = Some(asn);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn sticky(mut self, node_id: &str) -> Self {
        self.sticky_node = Some(node_id.to_string());
        self
    }

    /// Same targeting without affinity
    pub fn without_affinity(&self) -> Self {
        Criteria {
            sticky_node: None,
            ..self.clone()
        }
    }
}

/// Outcome of one strategy in an ordered chain
#[derive(Debug)]
pub(crate) enum Step<T> {
    Found(T),
    /// Nothing here; the reason is logged by the caller
    Continue(&'static str),
}
