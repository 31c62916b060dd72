//! Package selection filters.
//!
//! Include patterns use search semantics (a match anywhere in the attribute
//! path selects it); skip patterns must match the full path.

use std::collections::BTreeSet;

use regex::{Regex, RegexSet};

use crate::blacklist::Blacklist;
use crate::types::Attribute;

/// Compiled include/skip selection for candidate attributes.
#[derive(Debug)]
pub struct PackageFilter {
    include: BTreeSet<Attribute>,
    include_regex: RegexSet,
    skip: BTreeSet<Attribute>,
    skip_regex: RegexSet,
}

/// What the filter decided for one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    /// Dropped by user-supplied include/skip options.
    Skipped,
    /// Dropped by the committed blacklist; reported in the result.
    Blacklisted,
}

impl PackageFilter {
    pub fn new(
        include: &[Attribute],
        include_regex: &[String],
        skip: &[Attribute],
        skip_regex: &[String],
    ) -> Result<Self, regex::Error> {
        // Validate each pattern individually so the error names the culprit.
        for pattern in include_regex.iter().chain(skip_regex) {
            Regex::new(pattern)?;
        }
        Ok(Self {
            include: include.iter().cloned().collect(),
            include_regex: RegexSet::new(include_regex)?,
            skip: skip.iter().cloned().collect(),
            // Skip patterns match the whole attribute path.
            skip_regex: RegexSet::new(skip_regex.iter().map(|p| format!("^(?:{p})$")))?,
        })
    }

    /// True when the user restricted the candidate set at all.
    pub fn has_includes(&self) -> bool {
        !self.include.is_empty() || !self.include_regex.is_empty()
    }

    /// Apply include set, skip set, then blacklist, in that order.
    pub fn decide(&self, attr: &Attribute, blacklist: &Blacklist) -> FilterDecision {
        if self.has_includes()
            && !self.include.contains(attr)
            && !self.include_regex.is_match(attr.as_str())
        {
            return FilterDecision::Skipped;
        }
        if self.skip.contains(attr) || self.skip_regex.is_match(attr.as_str()) {
            return FilterDecision::Skipped;
        }
        if blacklist.contains(attr) {
            return FilterDecision::Blacklisted;
        }
        FilterDecision::Keep
    }

    /// Partition candidates into (kept, blacklisted). Skipped attributes are
    /// dropped entirely.
    pub fn partition(
        &self,
        candidates: impl IntoIterator<Item = Attribute>,
        blacklist: &Blacklist,
    ) -> (BTreeSet<Attribute>, BTreeSet<Attribute>) {
        let mut kept = BTreeSet::new();
        let mut blacklisted = BTreeSet::new();
        for attr in candidates {
            match self.decide(&attr, blacklist) {
                FilterDecision::Keep => {
                    kept.insert(attr);
                }
                FilterDecision::Blacklisted => {
                    blacklisted.insert(attr);
                }
                FilterDecision::Skipped => {}
            }
        }
        (kept, blacklisted)
    }

    /// Attributes from the include set that are not in the candidate set.
    /// These are evaluated anyway so a typo shows up as non-existent instead
    /// of silently vanishing.
    pub fn missing_includes(&self, candidates: &BTreeSet<Attribute>) -> BTreeSet<Attribute> {
        self.include
            .iter()
            .filter(|a| !candidates.contains(*a))
            .cloned()
            .collect()
    }
}
