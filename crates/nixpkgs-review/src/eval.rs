//! Evaluator dispatch: attribute names in, per-system derivation metadata out.
//!
//! The heavy lifting happens inside small generated expression files driven
//! by `nix eval --json`; this module writes the inputs, invokes the
//! evaluator, and strictly validates what comes back. A schema violation is
//! fatal: a partial attribute map would make the whole review incomplete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use review_core::{Attribute, Config, DerivationMeta, System};

use crate::process::{Cmd, ProcessError, ProcessRunner};

const EVAL_ATTRS_NIX: &str = include_str!("../nix/eval-attrs.nix");
const REBUILD_HASHES_NIX: &str = include_str!("../nix/rebuild-hashes.nix");
const LIST_ATTRS_NIX: &str = include_str!("../nix/list-attrs.nix");

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation failed: {0}")]
    Process(#[from] ProcessError),
    #[error("evaluator returned invalid data: {0}")]
    Schema(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EvalError>;

/// Names of the generated expression files inside the review directory.
#[derive(Debug, Clone)]
pub struct ExprFiles {
    pub eval_attrs: PathBuf,
    pub rebuild_hashes: PathBuf,
    pub list_attrs: PathBuf,
}

/// Write the evaluator expressions into `review_dir/nix/`.
pub fn write_expressions(review_dir: &Path) -> Result<ExprFiles> {
    let dir = review_dir.join("nix");
    std::fs::create_dir_all(&dir)?;
    let files = ExprFiles {
        eval_attrs: dir.join("eval-attrs.nix"),
        rebuild_hashes: dir.join("rebuild-hashes.nix"),
        list_attrs: dir.join("list-attrs.nix"),
    };
    std::fs::write(&files.eval_attrs, EVAL_ATTRS_NIX)?;
    std::fs::write(&files.rebuild_hashes, REBUILD_HASHES_NIX)?;
    std::fs::write(&files.list_attrs, LIST_ATTRS_NIX)?;
    Ok(files)
}

/// Dispatches attribute evaluation against the merged worktree.
#[derive(Debug)]
pub struct Evaluator<'a> {
    runner: &'a ProcessRunner,
    config: &'a Config,
    exprs: &'a ExprFiles,
}

impl<'a> Evaluator<'a> {
    pub fn new(runner: &'a ProcessRunner, config: &'a Config, exprs: &'a ExprFiles) -> Self {
        Self {
            runner,
            config,
            exprs,
        }
    }

    fn nix_eval_cmd(&self, expr: &Path, nixpkgs: &Path, system: &System) -> Cmd {
        Cmd::new("nix")
            .args([
                "--extra-experimental-features",
                "nix-command",
                "eval",
                "--json",
                "--option",
                "allow-import-from-derivation",
                "false",
                "--file",
            ])
            .arg(expr.display().to_string())
            .arg("--argstr")
            .arg("nixpkgsPath")
            .arg(nixpkgs.display().to_string())
            .arg("--argstr")
            .arg("system")
            .arg(system.as_str())
            .arg("--arg")
            .arg("nixpkgsConfig")
            .arg(self.config.nixpkgs_config())
    }

    /// Resolve the candidate attributes for one system.
    pub async fn evaluate_system(
        &self,
        nixpkgs: &Path,
        system: &System,
        attrs: &[Attribute],
    ) -> Result<BTreeMap<Attribute, DerivationMeta>> {
        let attrs_file = write_attrs_json(attrs)?;
        info!(system = %system, attrs = attrs.len(), "evaluating attributes");

        let cmd = self
            .nix_eval_cmd(&self.exprs.eval_attrs, nixpkgs, system)
            .arg("--argstr")
            .arg("attrsPath")
            .arg(attrs_file.path().display().to_string())
            .arg("--arg")
            .arg("includePassthruTests")
            .arg(if self.config.include_passthru_tests {
                "true"
            } else {
                "false"
            });
        let out = self.runner.run(cmd).await?;
        parse_eval_output(&out.stdout)
    }

    /// Map a chunk of attributes to their change hash in one checkout.
    /// `null` hashes (evaluation failures) come back as `None`.
    pub async fn rebuild_hashes(
        &self,
        nixpkgs: &Path,
        system: &System,
        attrs: &[Attribute],
    ) -> Result<BTreeMap<Attribute, Option<String>>> {
        let attrs_file = write_attrs_json(attrs)?;
        let cmd = self
            .nix_eval_cmd(&self.exprs.rebuild_hashes, nixpkgs, system)
            .arg("--argstr")
            .arg("attrsPath")
            .arg(attrs_file.path().display().to_string());
        let out = self.runner.run(cmd).await?;
        let hashes: BTreeMap<String, Option<String>> =
            serde_json::from_str(&out.stdout).map_err(|e| EvalError::Schema(e.to_string()))?;
        hashes
            .into_iter()
            .map(|(name, hash)| {
                name.parse::<Attribute>()
                    .map(|attr| (attr, hash))
                    .map_err(|e| EvalError::Schema(e.to_string()))
            })
            .collect()
    }

    /// Enumerate the buildable top-level attributes of a checkout.
    pub async fn list_attrs(&self, nixpkgs: &Path, system: &System) -> Result<Vec<Attribute>> {
        let cmd = self.nix_eval_cmd(&self.exprs.list_attrs, nixpkgs, system);
        let out = self.runner.run(cmd).await?;
        let names: Vec<String> =
            serde_json::from_str(&out.stdout).map_err(|e| EvalError::Schema(e.to_string()))?;
        debug!(system = %system, count = names.len(), "listed attributes");
        // Attributes that exist in the tree but fail our naming rules
        // (rare vendored names) are not reviewable; skip them.
        Ok(names
            .into_iter()
            .filter_map(|name| name.parse::<Attribute>().ok())
            .collect())
    }
}

fn write_attrs_json(attrs: &[Attribute]) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("nixpkgs-review-attrs")
        .suffix(".json")
        .tempfile()?;
    let names: Vec<&str> = attrs.iter().map(Attribute::as_str).collect();
    std::fs::write(file.path(), serde_json::to_vec(&names)?)?;
    Ok(file)
}

impl From<serde_json::Error> for EvalError {
    fn from(e: serde_json::Error) -> Self {
        EvalError::Schema(e.to_string())
    }
}

/// Parse and validate the evaluator's JSON output.
///
/// Every entry must satisfy the metadata invariants; any violation aborts
/// the review instead of producing a partial result.
pub fn parse_eval_output(json: &str) -> Result<BTreeMap<Attribute, DerivationMeta>> {
    let raw: BTreeMap<String, DerivationMeta> =
        serde_json::from_str(json).map_err(|e| EvalError::Schema(e.to_string()))?;
    let mut out = BTreeMap::new();
    for (name, meta) in raw {
        let attr = name
            .parse::<Attribute>()
            .map_err(|e| EvalError::Schema(e.to_string()))?;
        meta.validate(&attr)
            .map_err(|e| EvalError::Schema(e.to_string()))?;
        out.insert(attr, meta);
    }
    Ok(out)
}
