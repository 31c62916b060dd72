//! Core types for the review pipeline.
//!
//! An [`Attribute`] names a node in the package-set tree, a [`System`] names
//! a build platform, and every (attribute, system) pair ends up with exactly
//! one terminal [`Outcome`] in the [`ReviewResult`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid attribute path: {0}")]
    InvalidAttribute(String),
    #[error("unknown system or alias: {0}")]
    UnknownSystem(String),
    #[error("derivation metadata violates invariants for {attr}: {reason}")]
    InvalidMeta { attr: String, reason: String },
}

/// Dotted name selecting a node in the package-set tree, e.g.
/// `python3Packages.requests` or `pkg.passthru.tests.smoke`.
///
/// Segments must be non-empty and match `[A-Za-z_][A-Za-z0-9_-]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribute(String);

impl Attribute {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segments of the dotted path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Filesystem-safe name used for log files and result symlinks.
    pub fn file_name(&self) -> String {
        self.0.replace('.', "_")
    }

    fn valid_segment(seg: &str) -> bool {
        let mut chars = seg.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl FromStr for Attribute {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.split('.').all(Self::valid_segment) {
            return Err(TypeError::InvalidAttribute(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Attribute {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A target platform string (`x86_64-linux`, `aarch64-darwin`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct System(String);

impl System {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// All platforms the alias set expands to.
const KNOWN_SYSTEMS: &[&str] = &[
    "x86_64-linux",
    "aarch64-linux",
    "x86_64-darwin",
    "aarch64-darwin",
];

/// The platform of the machine running the review.
pub fn current_system() -> System {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => other,
    };
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    System(format!("{arch}-{os}"))
}

/// Expand a whitespace-separated list of systems and aliases into a sorted,
/// deduplicated list of concrete systems.
///
/// Recognised aliases: `current`, `all`, `linux`, `darwin`, `x64`, `aarch64`.
/// Anything else must be one of the known platform strings.
pub fn resolve_systems(spec: &str) -> Result<Vec<System>, TypeError> {
    let mut out = BTreeSet::new();
    for word in spec.split_whitespace() {
        match word {
            "current" => {
                out.insert(current_system());
            }
            "all" => {
                out.extend(KNOWN_SYSTEMS.iter().map(|s| System::new(*s)));
            }
            "linux" => {
                out.extend(
                    KNOWN_SYSTEMS
                        .iter()
                        .filter(|s| s.ends_with("-linux"))
                        .map(|s| System::new(*s)),
                );
            }
            "darwin" => {
                out.extend(
                    KNOWN_SYSTEMS
                        .iter()
                        .filter(|s| s.ends_with("-darwin"))
                        .map(|s| System::new(*s)),
                );
            }
            "x64" => {
                out.extend(
                    KNOWN_SYSTEMS
                        .iter()
                        .filter(|s| s.starts_with("x86_64-"))
                        .map(|s| System::new(*s)),
                );
            }
            "aarch64" => {
                out.extend(
                    KNOWN_SYSTEMS
                        .iter()
                        .filter(|s| s.starts_with("aarch64-"))
                        .map(|s| System::new(*s)),
                );
            }
            concrete if KNOWN_SYSTEMS.contains(&concrete) => {
                out.insert(System::new(concrete));
            }
            unknown => return Err(TypeError::UnknownSystem(unknown.to_string())),
        }
    }
    if out.is_empty() {
        out.insert(current_system());
    }
    Ok(out.into_iter().collect())
}

/// Resolved evaluation result for one (attribute, system) pair.
///
/// Invariants: `broken` implies no `drv_path`; a non-broken entry always has
/// one; an entry that does not exist is also broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DerivationMeta {
    pub exists: bool,
    pub broken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drv_path: Option<String>,
    #[serde(default)]
    pub out_paths: BTreeMap<String, String>,
    /// Set for derivations discovered under `passthru.tests`.
    #[serde(default)]
    pub is_test: bool,
}

impl DerivationMeta {
    pub fn validate(&self, attr: &Attribute) -> Result<(), TypeError> {
        let fail = |reason: &str| {
            Err(TypeError::InvalidMeta {
                attr: attr.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.broken && self.drv_path.is_some() {
            return fail("broken entry carries a drvPath");
        }
        if !self.broken && self.drv_path.is_none() {
            return fail("non-broken entry is missing its drvPath");
        }
        if !self.exists && !self.broken {
            return fail("nonexistent entry must be marked broken");
        }
        Ok(())
    }
}

/// Terminal classification of one (attribute, system) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Built,
    Failed,
    Broken,
    Blacklisted,
    NonExistent,
    Test,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Built => "built",
            Self::Failed => "failed",
            Self::Broken => "broken",
            Self::Blacklisted => "blacklisted",
            Self::NonExistent => "non-existent",
            Self::Test => "tests",
        }
    }

    pub const ALL: [Outcome; 6] = [
        Outcome::Built,
        Outcome::Failed,
        Outcome::Broken,
        Outcome::Blacklisted,
        Outcome::NonExistent,
        Outcome::Test,
    ];
}

/// Per-system outcome sets. An attribute appears in exactly one set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemResult {
    pub built: BTreeSet<Attribute>,
    pub failed: BTreeSet<Attribute>,
    pub broken: BTreeSet<Attribute>,
    pub blacklisted: BTreeSet<Attribute>,
    #[serde(rename = "non-existent")]
    pub non_existent: BTreeSet<Attribute>,
    pub tests: BTreeSet<Attribute>,
}

impl SystemResult {
    pub fn set(&self, outcome: Outcome) -> &BTreeSet<Attribute> {
        match outcome {
            Outcome::Built => &self.built,
            Outcome::Failed => &self.failed,
            Outcome::Broken => &self.broken,
            Outcome::Blacklisted => &self.blacklisted,
            Outcome::NonExistent => &self.non_existent,
            Outcome::Test => &self.tests,
        }
    }

    fn set_mut(&mut self, outcome: Outcome) -> &mut BTreeSet<Attribute> {
        match outcome {
            Outcome::Built => &mut self.built,
            Outcome::Failed => &mut self.failed,
            Outcome::Broken => &mut self.broken,
            Outcome::Blacklisted => &mut self.blacklisted,
            Outcome::NonExistent => &mut self.non_existent,
            Outcome::Test => &mut self.tests,
        }
    }

    /// Classify an attribute, removing it from any other set first so the
    /// sets stay disjoint.
    pub fn classify(&mut self, attr: Attribute, outcome: Outcome) {
        for o in Outcome::ALL {
            if o != outcome {
                self.set_mut(o).remove(&attr);
            }
        }
        self.set_mut(outcome).insert(attr);
    }

    pub fn outcome_of(&self, attr: &Attribute) -> Option<Outcome> {
        Outcome::ALL.into_iter().find(|o| self.set(*o).contains(attr))
    }

    pub fn is_empty(&self) -> bool {
        Outcome::ALL.iter().all(|o| self.set(*o).is_empty())
    }

    /// Total number of classified attributes.
    pub fn len(&self) -> usize {
        Outcome::ALL.iter().map(|o| self.set(*o).len()).sum()
    }
}

/// Aggregated review outcome across all requested systems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub systems: BTreeMap<System, SystemResult>,
    /// Set when the run was interrupted before all builds finished.
    #[serde(default)]
    pub incomplete: bool,
}

impl ReviewResult {
    pub fn system_mut(&mut self, system: &System) -> &mut SystemResult {
        self.systems.entry(system.clone()).or_default()
    }

    /// True when no attribute failed to build on any system.
    pub fn all_built(&self) -> bool {
        self.systems.values().all(|r| r.failed.is_empty())
    }
}

/// Pull-request metadata supplied by the code-host client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrSpec {
    pub number: u64,
    pub base_ref: String,
    pub head_sha: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
}
