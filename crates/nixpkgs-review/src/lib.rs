pub mod build;
pub mod changeset;
pub mod cli;
pub mod eval;
pub mod git;
pub mod github;
pub mod process;
pub mod review;
pub mod shell;

pub use cli::{execute, Cli};
pub use process::ProcessRunner;
pub use review::{Review, ReviewError, Subject};
