pub mod blacklist;
pub mod config;
pub mod filter;
pub mod report;
pub mod types;

pub use blacklist::Blacklist;
pub use config::{BuildGraph, Checkout, Config, ConfigError, EvalSource};
pub use filter::{FilterDecision, PackageFilter};
pub use report::Report;
pub use types::{
    current_system, resolve_systems, Attribute, DerivationMeta, Outcome, PrSpec, ReviewResult,
    System, SystemResult,
};
