//! Client credential parsing
//!
//! Username is the customer ID. Password is the API key optionally followed by
//! `-name-value` targeting pairs:
//!
//! ```text
//! acme:k3y
//! acme:k3y-country-us-city-new_york
//! acme:k3y-country-de-asn-3320-session-abc123-sesstype-sticky
//! ```

use crate::pool::Criteria;
use crate::registry::Protocol;
use crate::{Error, Result};
use base64::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Reuse the node bound to the session token
    #[default]
    Sticky,
    /// Fresh node per connection, token ignored
    Rotating,
    PerRequest,
}

impl SessionType {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sticky" => Ok(SessionType::Sticky),
            "rotating" => Ok(SessionType::Rotating),
            "per_request" | "perrequest" | "request" => Ok(SessionType::PerRequest),
            other => Err(Error::auth(format!("unknown session type {:?}", other))),
        }
    }
}

/// Targeting carried in the password
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targeting {
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<u32>,
    pub session: Option<String>,
    pub session_type: SessionType,
}

impl Targeting {
    /// Token to use for sticky affinity, if the session type honours it
    pub fn sticky_token(&self) -> Option<&str> {
        match self.session_type {
            SessionType::Sticky => self.session.as_deref(),
            _ => None,
        }
    }

    /// Selection criteria for `protocol`, without affinity
    pub fn criteria(&self, protocol: Protocol) -> Criteria {
        let mut criteria = Criteria::new().protocol(protocol);
        if let Some(country) = &self.country {
            criteria = criteria.country(country);
        }
        if let Some(city) = &self.city {
            criteria = criteria.city(city);
        }
        if let Some(asn) = self.asn {
            criteria = criteria.asn(asn);
        }
        criteria
    }
}

/// Parsed client credential. The key is kept only until it is hashed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub customer_id: String,
    pub api_key: String,
    pub targeting: Targeting,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("customer_id", &self.customer_id)
            .field("targeting", &self.targeting)
            .finish()
    }
}

impl Credential {
    pub fn parse(username: &str, password: &str) -> Result<Self> {
        let customer_id = username.trim();
        if customer_id.is_empty() {
            return Err(Error::auth("empty customer id"));
        }

        let mut parts = password.split('-');
        let api_key = parts.next().unwrap_or_default();
        if api_key.is_empty() {
            return Err(Error::auth("empty api key"));
        }

        let mut targeting = Targeting::default();
        let rest: Vec<&str> = parts.collect();
        if rest.len() % 2 != 0 {
            return Err(Error::auth("dangling targeting parameter"));
        }
        for pair in rest.chunks(2) {
            let (name, value) = (pair[0], pair[1]);
            if value.is_empty() {
                return Err(Error::auth(format!("empty value for {}", name)));
            }
            match name.to_ascii_lowercase().as_str() {
                "country" | "cc" => targeting.country = Some(value.to_ascii_uppercase()),
                "city" => targeting.city = Some(value.replace('_', " ")),
                "asn" => {
                    let digits = value.trim_start_matches(|c| c == 'a' || c == 'A' || c == 's' || c == 'S');
                    let asn = digits
                        .parse::<u32>()
                        .map_err(|_| Error::auth(format!("invalid asn {:?}", value)))?;
                    targeting.asn = Some(asn);
                }
                "session" => targeting.session = Some(value.to_string()),
                "sesstype" | "stype" => targeting.session_type = SessionType::parse(value)?,
                _ => {}
            }
        }

        Ok(Credential {
            customer_id: customer_id.to_string(),
            api_key: api_key.to_string(),
            targeting,
        })
    }

    /// Parse a `Proxy-Authorization: Basic ...` header value
    pub fn from_basic(header: &str) -> Result<Self> {
        let encoded = header
            .trim()
            .strip_prefix("Basic ")
            .or_else(|| header.trim().strip_prefix("basic "))
            .ok_or_else(|| Error::auth("unsupported proxy authorization scheme"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::auth("invalid base64 in proxy authorization"))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| Error::auth("proxy authorization is not utf-8"))?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or_else(|| Error::auth("proxy authorization missing ':'"))?;
        Self::parse(user, pass)
    }
}
