//! Identity sets that gate the reserved roles.
//!
//! Entries are either full peer identities or network-domain prefixes.
//! A peer identity embeds its domain as `<domain>,<host>`, so an entry
//! matches an identity equal to it or one that continues with a comma.
//! `1-ff00:0:11` therefore does not match `1-ff00:0:110,[10.0.0.1]`.

use std::collections::BTreeSet;

/// Externally computed set of privileged identities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySet {
    entries: BTreeSet<String>,
}

impl TopologySet {
    /// Build from entries; blank entries are dropped.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// `true` if `identity` belongs to the set.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.entries.iter().any(|entry| {
            identity
                .strip_prefix(entry.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(','))
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if the set has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
