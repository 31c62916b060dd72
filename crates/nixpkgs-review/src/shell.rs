//! Hand successful build outputs to `nix-shell`.
//!
//! The shell inherits the terminal instead of going through the piped
//! process runner; it is the one child the review does not capture.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use review_core::Attribute;

/// Launch a shell (or run a one-off command) with every built output on the
/// build inputs. Returns the shell's exit code.
pub async fn launch(
    review_dir: &Path,
    built: &[(Attribute, PathBuf)],
    run_command: Option<&str>,
    pr: Option<u64>,
) -> std::io::Result<i32> {
    if built.is_empty() {
        info!("nothing was built, skipping shell");
        return Ok(0);
    }

    let mut cmd = Command::new("nix-shell");
    cmd.arg("-p");
    for (_, path) in built {
        cmd.arg(path);
    }
    if let Some(run) = run_command {
        cmd.args(["--run", run]);
    }
    cmd.current_dir(review_dir);
    cmd.env("NIXPKGS_REVIEW_ROOT", review_dir);
    if let Some(number) = pr {
        cmd.env("PR", number.to_string());
    }

    info!(packages = built.len(), "entering review shell");
    let status = cmd.status().await?;
    Ok(status.code().unwrap_or(-1))
}
