//! Static key to address table used by `stcp`.

use std::collections::HashMap;

use crate::crypto::PubKey;

/// Bidirectional map between visor keys and `host:port` addresses.
#[derive(Debug, Clone, Default)]
pub struct PkTable {
    by_pk: HashMap<PubKey, String>,
    by_addr: HashMap<String, PubKey>,
}

impl PkTable {
    /// Build a table from `(key, address)` pairs. Later pairs win.
    pub fn new(entries: impl IntoIterator<Item = (PubKey, String)>) -> Self {
        let mut table = Self::default();
        for (pk, addr) in entries {
            table.insert(pk, addr);
        }
        table
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, pk: PubKey, addr: String) {
        if let Some(old) = self.by_pk.insert(pk, addr.clone()) {
            self.by_addr.remove(&old);
        }
        self.by_addr.insert(addr, pk);
    }

    /// Address of `pk`.
    pub fn addr(&self, pk: &PubKey) -> Option<&str> {
        self.by_pk.get(pk).map(String::as_str)
    }

    /// Key listening at `addr`.
    pub fn pk(&self, addr: &str) -> Option<PubKey> {
        self.by_addr.get(addr).copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.by_pk.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_pk.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_lookup_both_ways() {
        let pk = Keypair::generate().pk();
        let mut table = PkTable::new([(pk, "127.0.0.1:7033".to_string())]);
        assert_eq!(table.addr(&pk), Some("127.0.0.1:7033"));
        assert_eq!(table.pk("127.0.0.1:7033"), Some(pk));

        table.insert(pk, "127.0.0.1:7034".into());
        assert_eq!(table.pk("127.0.0.1:7033"), None);
        assert_eq!(table.len(), 1);
    }
}
