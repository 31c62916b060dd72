//! The committed attribute blacklist.
//!
//! Shipped as `blacklist.toml` next to this crate so changes are reviewed
//! and versioned like any other code change.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::types::Attribute;

const BLACKLIST_TOML: &str = include_str!("../blacklist.toml");

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("failed to parse blacklist: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("blacklist entry is not a valid attribute: {0}")]
    BadEntry(String),
}

#[derive(Debug, Deserialize)]
struct BlacklistFile {
    version: u32,
    #[serde(default, rename = "entry")]
    entries: Vec<BlacklistEntry>,
}

#[derive(Debug, Deserialize)]
struct BlacklistEntry {
    attr: String,
    reason: String,
}

/// Attributes excluded from every review, with the reason for each.
#[derive(Debug, Clone)]
pub struct Blacklist {
    version: u32,
    entries: BTreeMap<Attribute, String>,
}

impl Blacklist {
    /// Parse the committed list. The file ships with the binary, so a parse
    /// failure is a bug, surfaced as an error rather than a panic.
    pub fn builtin() -> Result<Self, BlacklistError> {
        Self::parse(BLACKLIST_TOML)
    }

    fn parse(content: &str) -> Result<Self, BlacklistError> {
        let file: BlacklistFile = toml::from_str(content)?;
        let mut entries = BTreeMap::new();
        for entry in file.entries {
            let attr = entry
                .attr
                .parse::<Attribute>()
                .map_err(|_| BlacklistError::BadEntry(entry.attr.clone()))?;
            entries.insert(attr, entry.reason);
        }
        Ok(Self {
            version: file.version,
            entries,
        })
    }

    pub fn empty() -> Self {
        Self {
            version: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Ad-hoc list, used by tests.
    pub fn from_attrs<'a>(attrs: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            version: 0,
            entries: attrs
                .into_iter()
                .filter_map(|a| a.parse().ok().map(|attr| (attr, String::new())))
                .collect(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn contains(&self, attr: &Attribute) -> bool {
        self.entries.contains_key(attr)
    }

    pub fn reason(&self, attr: &Attribute) -> Option<&str> {
        self.entries.get(attr).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
