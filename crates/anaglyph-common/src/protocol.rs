//! Discovery payload advertised by connected peers.
//!
//! The payload is a short ASCII string carried in the advertisement:
//! `IP:<address>` for direct (LAN) transports and `Relay:<session>` for
//! relay transports. A scanning peer splits on the prefix and hands the
//! remainder, verbatim, to the matching join path.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for direct transports.
pub const LAN_PREFIX: &str = "IP:";
/// Prefix for relay transports.
pub const RELAY_PREFIX: &str = "Relay:";

/// How a scanning peer should join the advertised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    /// Connect directly to the advertised address.
    Lan,
    /// Join through the relay service using the advertised session id.
    Relay,
}

/// Tagged join target broadcast over the discovery radio.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DiscoveryPayload {
    /// `IP:` + dotted quad or hostname.
    Lan(String),
    /// `Relay:` + session identifier.
    Relay(String),
}

impl DiscoveryPayload {
    pub fn lan(address: impl Into<String>) -> Self {
        Self::Lan(address.into())
    }

    pub fn relay(session_id: impl Into<String>) -> Self {
        Self::Relay(session_id.into())
    }

    pub fn strategy(&self) -> JoinStrategy {
        match self {
            Self::Lan(_) => JoinStrategy::Lan,
            Self::Relay(_) => JoinStrategy::Relay,
        }
    }

    /// The connect argument: address for LAN, session id for relay.
    pub fn target(&self) -> &str {
        match self {
            Self::Lan(address) => address,
            Self::Relay(session) => session,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Lan(address) => format!("{LAN_PREFIX}{address}"),
            Self::Relay(session) => format!("{RELAY_PREFIX}{session}"),
        }
    }

    /// ASCII bytes as handed to the radio.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode().into_bytes())
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if !raw.is_ascii() {
            return Err(Error::protocol("discovery payload is not ASCII"));
        }
        let text = std::str::from_utf8(raw).map_err(Error::protocol)?;
        text.parse()
    }

    /// Rejects payloads that carry no usable connect argument.
    pub fn validate_target(&self) -> Result<()> {
        if self.target().trim().is_empty() {
            return Err(Error::protocol(format!(
                "discovery payload '{}' has an empty join target",
                self.encode()
            )));
        }
        Ok(())
    }
}

impl FromStr for DiscoveryPayload {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.is_ascii() {
            return Err(Error::protocol("discovery payload is not ASCII"));
        }
        if let Some(address) = s.strip_prefix(LAN_PREFIX) {
            Ok(Self::Lan(address.to_string()))
        } else if let Some(session) = s.strip_prefix(RELAY_PREFIX) {
            Ok(Self::Relay(session.to_string()))
        } else {
            Err(Error::protocol(format!("unknown discovery payload '{s}'")))
        }
    }
}

impl fmt::Display for DiscoveryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl TryFrom<String> for DiscoveryPayload {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DiscoveryPayload> for String {
    fn from(payload: DiscoveryPayload) -> Self {
        payload.encode()
    }
}
