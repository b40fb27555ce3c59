//! Canonical description of a transport between two visors.
//!
//! The transport ID is a UUIDv5 over the sorted edge keys and the network
//! name, so both edges derive the same ID without talking to each other.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransportError;
use crate::core::NetworkType;
use crate::crypto::{Keypair, PubKey, Sig};

/// Origin of a transport entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    /// Created by the visor's user.
    #[default]
    User,
    /// Created automatically to a publicly advertised visor.
    Automatic,
    /// Created by the network operators to improve resiliency.
    Skycoin,
}

impl Label {
    /// Wire name of the label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Automatic => "automatic",
            Self::Skycoin => "skycoin",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order two edge keys ascending.
pub fn sort_edges(a: PubKey, b: PubKey) -> [PubKey; 2] {
    if a <= b { [a, b] } else { [b, a] }
}

/// Deterministic ID of the transport between `a` and `b` over `network`.
///
/// Symmetric in `a` and `b`; differs between networks.
pub fn make_transport_id(a: PubKey, b: PubKey, network: NetworkType) -> Uuid {
    let [lo, hi] = sort_edges(a, b);
    let name = network.as_str().as_bytes();
    let mut bytes = Vec::with_capacity(lo.as_bytes().len() * 2 + name.len());
    bytes.extend_from_slice(lo.as_bytes());
    bytes.extend_from_slice(hi.as_bytes());
    bytes.extend_from_slice(name);
    Uuid::new_v5(&Uuid::nil(), &bytes)
}

/// Unsigned description of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Transport ID.
    #[serde(rename = "t_id")]
    pub id: Uuid,

    /// Edge keys, ascending.
    pub edges: [PubKey; 2],

    /// Network the transport runs over.
    #[serde(rename = "type")]
    pub network: NetworkType,

    /// Whether the transport is advertised publicly.
    #[serde(default = "default_public")]
    pub public: bool,

    /// Origin of the entry.
    #[serde(default)]
    pub label: Label,
}

fn default_public() -> bool {
    true
}

impl Entry {
    /// Entry for the transport between `a` and `b`.
    pub fn new(a: PubKey, b: PubKey, network: NetworkType, label: Label) -> Self {
        Self {
            id: make_transport_id(a, b, network),
            edges: sort_edges(a, b),
            network,
            public: true,
            label,
        }
    }

    /// The edge that is not `local`. Returns `local` if it is not an edge.
    pub fn remote_edge(&self, local: &PubKey) -> PubKey {
        self.edges
            .iter()
            .find(|pk| *pk != local)
            .copied()
            .unwrap_or(*local)
    }

    /// Position of `pk` among the edges.
    pub fn edge_index(&self, pk: &PubKey) -> Option<usize> {
        self.edges.iter().position(|edge| edge == pk)
    }

    /// Whether `pk` is an edge.
    pub fn has_edge(&self, pk: &PubKey) -> bool {
        self.edge_index(pk).is_some()
    }

    /// Whether `pk` is the lower of the two edges.
    pub fn is_least_significant_edge(&self, pk: &PubKey) -> bool {
        self.edge_index(pk) == Some(0)
    }

    /// Bytes covered by the edge signatures.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = self.id.as_bytes().to_vec();
        for edge in &self.edges {
            out.extend_from_slice(edge.as_bytes());
        }
        out.extend_from_slice(self.network.as_str().as_bytes());
        out
    }

    /// Sign the entry.
    pub fn signature(&self, keys: &Keypair) -> Sig {
        keys.sign(&self.to_binary())
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{} {}]",
            self.network, self.id, self.edges[0], self.edges[1]
        )
    }
}

/// An entry with the signatures of its edges, in edge order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    /// The signed entry.
    pub entry: Entry,

    /// Edge signatures, positioned like [`Entry::edges`].
    pub signatures: [Option<Sig>; 2],

    /// Registration time reported by transport discovery.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub registered: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl SignedEntry {
    /// Wrap `entry` and add the signature of `keys`.
    pub fn new(entry: Entry, keys: &Keypair) -> Result<Self, TransportError> {
        let mut se = Self {
            entry,
            signatures: [None, None],
            registered: 0,
        };
        se.sign(keys)?;
        Ok(se)
    }

    /// Add the signature of `keys` at its edge position.
    pub fn sign(&mut self, keys: &Keypair) -> Result<(), TransportError> {
        let idx = self
            .entry
            .edge_index(&keys.pk())
            .ok_or(TransportError::EdgeNotFound)?;
        self.signatures[idx] = Some(self.entry.signature(keys));
        Ok(())
    }

    /// Signature of `pk`, if present.
    pub fn signature(&self, pk: &PubKey) -> Option<Sig> {
        self.entry.edge_index(pk).and_then(|idx| self.signatures[idx])
    }

    /// Whether `pk` signed the entry.
    pub fn verify(&self, pk: &PubKey) -> bool {
        self.signature(pk)
            .is_some_and(|sig| pk.verify(&self.entry.to_binary(), &sig).is_ok())
    }
}

/// Liveness of a transport as reported to transport discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Transport ID.
    #[serde(rename = "t_id")]
    pub id: Uuid,
    /// Whether the transport is up.
    pub is_up: bool,
}
