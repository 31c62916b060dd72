//! Change-set resolution: which attributes does this change rebuild?
//!
//! Two sources feed the candidate list. When a trusted CI evaluator already
//! ran against the head commit, its artifacts are authoritative. Otherwise a
//! two-pass local evaluation hashes every buildable attribute in the base
//! and merged checkouts and keeps the ones whose hash changed.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use review_core::{Attribute, Blacklist, Config, PackageFilter, PrSpec, System};

use crate::eval::{EvalError, Evaluator};
use crate::github::{changed_paths_from_zip, GithubClient, GithubError};
use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Github(#[from] GithubError),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// The resolved candidate set, plus the attributes the filters or a failed
/// evaluation chunk already classified.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub attrs: BTreeSet<Attribute>,
    /// Attributes whose evaluation chunk kept failing after the halving
    /// retry; they surface as broken without being built.
    pub broken: BTreeSet<Attribute>,
    /// Candidates removed by the committed blacklist.
    pub blacklisted: BTreeSet<Attribute>,
}

#[derive(Debug)]
pub struct Resolver<'a> {
    evaluator: &'a Evaluator<'a>,
    config: &'a Config,
}

impl<'a> Resolver<'a> {
    pub fn new(evaluator: &'a Evaluator<'a>, config: &'a Config) -> Self {
        Self { evaluator, config }
    }

    /// Candidate attributes from CI evaluator artifacts.
    ///
    /// Returns `None` when the requested systems are not all covered by a
    /// fresh, successful artifact; the caller falls back to local
    /// evaluation (or errors, when artifacts were explicitly requested).
    pub async fn from_ci_artifacts(
        &self,
        client: &GithubClient,
        pr: &PrSpec,
    ) -> Result<Option<BTreeSet<Attribute>>> {
        let runs = client.check_runs(&pr.head_sha).await?;
        let mut covered: BTreeSet<System> = BTreeSet::new();
        let mut covers_all = false;
        let mut rebuilds: BTreeSet<Attribute> = BTreeSet::new();

        for run in runs {
            if !run.succeeded() || !is_eval_check(&run.name) {
                continue;
            }
            let Some(url) = &run.details_url else {
                continue;
            };
            let bytes = match client.download(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(check = %run.name, error = %e, "failed to download artifact");
                    continue;
                }
            };
            let paths = match changed_paths_from_zip(&bytes) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(check = %run.name, error = %e, "unusable artifact");
                    continue;
                }
            };
            if paths.systems.is_empty() {
                covers_all = true;
            } else {
                covered.extend(paths.systems.iter().map(|s| System::new(s.as_str())));
            }
            rebuilds.extend(
                paths
                    .rebuilds
                    .iter()
                    .filter_map(|name| name.parse::<Attribute>().ok()),
            );
        }

        let missing: Vec<&System> = self
            .config
            .systems
            .iter()
            .filter(|s| !covers_all && !covered.contains(*s))
            .collect();
        if !missing.is_empty() {
            info!(?missing, "CI artifacts do not cover all requested systems");
            return Ok(None);
        }
        info!(count = rebuilds.len(), "resolved change set from CI artifacts");
        Ok(Some(rebuilds))
    }

    /// Candidate attributes from a two-pass local evaluation.
    ///
    /// The attribute universe comes from the merged checkout; each chunk is
    /// hashed in both checkouts and kept when the hashes differ. Returns the
    /// candidates plus the attributes whose chunks never evaluated.
    pub async fn from_local_eval(
        &self,
        base: &Path,
        merged: &Path,
    ) -> Result<(BTreeSet<Attribute>, BTreeSet<Attribute>)> {
        let system = self
            .config
            .systems
            .first()
            .cloned()
            .unwrap_or_else(review_core::current_system);
        let universe = self.evaluator.list_attrs(merged, &system).await?;
        info!(attrs = universe.len(), "hashing attribute universe");

        // 4x the core count bounds tail latency without flooding the
        // evaluator; the same figure caps concurrent chunk evaluations.
        let parallelism = 4 * num_cpus::get().max(1);
        let chunk_size = universe.len().div_ceil(parallelism).max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));

        let tasks = universe.chunks(chunk_size).map(|chunk| {
            let semaphore = Arc::clone(&semaphore);
            let system = system.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.diff_chunk(chunk, base, merged, &system).await
            }
        });

        let mut candidates = BTreeSet::new();
        let mut broken = BTreeSet::new();
        for outcome in join_all(tasks).await {
            let (chunk_candidates, chunk_broken) = outcome?;
            candidates.extend(chunk_candidates);
            broken.extend(chunk_broken);
        }
        info!(
            candidates = candidates.len(),
            broken = broken.len(),
            "resolved change set locally"
        );
        Ok((candidates, broken))
    }

    /// Hash one chunk in both checkouts. A failing chunk is split in half
    /// and each half retried once; a half that still fails marks all of its
    /// attributes broken.
    async fn diff_chunk(
        &self,
        chunk: &[Attribute],
        base: &Path,
        merged: &Path,
        system: &System,
    ) -> Result<(BTreeSet<Attribute>, BTreeSet<Attribute>)> {
        match self.hash_pair(chunk, base, merged, system).await {
            Ok(candidates) => Ok((candidates, BTreeSet::new())),
            Err(e) => {
                propagate_cancellation(&e)?;
                if chunk.len() <= 1 {
                    warn!(?chunk, error = %e, "attribute failed to evaluate");
                    return Ok((BTreeSet::new(), chunk.iter().cloned().collect()));
                }
                debug!(size = chunk.len(), error = %e, "chunk failed, retrying halves");
                let mut candidates = BTreeSet::new();
                let mut broken = BTreeSet::new();
                let (left, right) = chunk.split_at(chunk.len() / 2);
                for half in [left, right] {
                    match self.hash_pair(half, base, merged, system).await {
                        Ok(half_candidates) => candidates.extend(half_candidates),
                        Err(e) => {
                            propagate_cancellation(&e)?;
                            warn!(size = half.len(), error = %e, "subchunk failed to evaluate");
                            broken.extend(half.iter().cloned());
                        }
                    }
                }
                Ok((candidates, broken))
            }
        }
    }

    async fn hash_pair(
        &self,
        chunk: &[Attribute],
        base: &Path,
        merged: &Path,
        system: &System,
    ) -> std::result::Result<BTreeSet<Attribute>, EvalError> {
        let base_hashes = self.evaluator.rebuild_hashes(base, system, chunk).await?;
        let merged_hashes = self.evaluator.rebuild_hashes(merged, system, chunk).await?;
        Ok(chunk
            .iter()
            .filter(|attr| {
                let before = base_hashes.get(*attr).cloned().flatten();
                let after = merged_hashes.get(*attr).cloned().flatten();
                before != after
            })
            .cloned()
            .collect())
    }
}

fn propagate_cancellation(e: &EvalError) -> Result<()> {
    if matches!(e, EvalError::Process(ProcessError::Cancelled)) {
        return Err(ResolveError::Cancelled);
    }
    Ok(())
}

/// Check runs whose artifacts carry a change set.
fn is_eval_check(name: &str) -> bool {
    let name = name.to_lowercase();
    name.contains("eval") && (name.contains("combined") || name.contains("maintainer"))
}

/// Apply the user filters and the committed blacklist to the raw candidate
/// set, folding in explicitly requested packages so typos surface as
/// non-existent instead of disappearing.
pub fn apply_filters(
    raw: BTreeSet<Attribute>,
    chunk_broken: BTreeSet<Attribute>,
    filter: &PackageFilter,
    blacklist: &Blacklist,
) -> ChangeSet {
    let mut with_requested = raw;
    let requested_ghosts = filter.missing_includes(&with_requested);
    with_requested.extend(requested_ghosts);
    let (attrs, blacklisted) = filter.partition(with_requested, blacklist);
    let broken = chunk_broken
        .into_iter()
        .filter(|attr| attrs.contains(attr))
        .collect();
    ChangeSet {
        attrs,
        broken,
        blacklisted,
    }
}
