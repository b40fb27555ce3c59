//! Logical endpoints and network backend identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::PubKey;

/// A logical endpoint: a visor public key plus a 16-bit port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr {
    /// Public key of the visor.
    #[serde(rename = "public_key")]
    pub pk: PubKey,
    /// Port on that visor.
    pub port: u16,
}

impl Addr {
    /// Create an address.
    pub fn new(pk: PubKey, port: u16) -> Self {
        Self { pk, port }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}:~", self.pk)
        } else {
            write!(f, "{}:{}", self.pk, self.port)
        }
    }
}

/// The network backend a transport runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Direct TCP with a static public key table.
    Stcp,
    /// Direct TCP with addresses from an address resolver.
    Stcpr,
    /// Direct UDP with addresses from an address resolver.
    Sudph,
    /// Multiplexed relay sessions.
    Dmsg,
}

impl NetworkType {
    /// Every known backend.
    pub const ALL: [NetworkType; 4] = [Self::Stcp, Self::Stcpr, Self::Sudph, Self::Dmsg];

    /// Wire name of the backend.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stcp => "stcp",
            Self::Stcpr => "stcpr",
            Self::Sudph => "sudph",
            Self::Dmsg => "dmsg",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown network name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network type: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for NetworkType {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownNetwork(s.to_string()))
    }
}
