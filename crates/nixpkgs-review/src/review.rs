//! Review orchestration: the state machine connecting worktrees, change-set
//! resolution, evaluation, builds, and the report.
//!
//! One review owns its review directory and worktrees for the whole run.
//! Worktrees are removed on success and preserved on failure so a broken
//! merge or evaluation can be inspected afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use review_core::blacklist::BlacklistError;
use review_core::report::{write_attr_list, write_results_tree};
use review_core::{
    Attribute, Blacklist, Config, ConfigError, DerivationMeta, EvalSource, Outcome, PrSpec, Report,
    ReviewResult, System,
};

use crate::build::{BuildError, BuildOutcomes, BuildRequest, BuildScheduler};
use crate::changeset::{apply_filters, ChangeSet, Resolver, ResolveError};
use crate::eval::{write_expressions, EvalError, Evaluator};
use crate::git::{GitError, GitRepo, Worktree};
use crate::github::{resolve_token, GithubClient, GithubError};
use crate::process::{ProcessError, ProcessRunner};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Github(#[from] GithubError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Blacklist(#[from] BlacklistError),
    #[error("no fresh CI artifacts for {0}; rerun with --eval local")]
    NoArtifacts(String),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ResolveError> for ReviewError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Eval(e) => Self::Eval(e),
            ResolveError::Github(e) => Self::Github(e),
            ResolveError::Cancelled => Self::Cancelled,
        }
    }
}

impl ReviewError {
    /// Map onto the process exit-code contract.
    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() {
            return 130;
        }
        match self {
            Self::Config(_) => 2,
            Self::Github(_) => 3,
            Self::Git(_) | Self::Eval(_) | Self::NoArtifacts(_) => 1,
            Self::Cancelled => 130,
            Self::Build(_) | Self::Blacklist(_) | Self::Io(_) => 70,
        }
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
            || matches!(
                self,
                Self::Git(GitError::Process(ProcessError::Cancelled))
                    | Self::Eval(EvalError::Process(ProcessError::Cancelled))
                    | Self::Build(BuildError::Process(ProcessError::Cancelled))
            )
    }
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// What a single review run is about.
#[derive(Debug, Clone)]
pub enum Subject {
    Pr(u64),
    Rev(String),
    Wip { staged: bool },
}

impl Subject {
    fn dir_name(&self, head_sha: &str) -> String {
        match self {
            Self::Pr(number) => format!("pr-{number}"),
            Self::Rev(_) => format!("rev-{}", &head_sha[..head_sha.len().min(12)]),
            Self::Wip { .. } => format!("wip-{}", chrono::Utc::now().timestamp()),
        }
    }
}

/// Everything the caller needs after a finished review.
#[derive(Debug)]
pub struct ReviewOutcome {
    pub result: ReviewResult,
    pub review_dir: PathBuf,
    pub pr: Option<PrSpec>,
    /// Built attributes and their first output path, for the shell.
    pub built: Vec<(Attribute, PathBuf)>,
}

impl ReviewOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.result.all_built() {
            0
        } else {
            1
        }
    }
}

/// Root of the per-review cache directories.
pub fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nixpkgs-review")
}

#[derive(Debug)]
pub struct Review {
    runner: ProcessRunner,
    config: Config,
    blacklist: Blacklist,
    cache_root: PathBuf,
}

impl Review {
    pub fn new(runner: ProcessRunner, config: Config) -> Result<Self> {
        Ok(Self {
            runner,
            config,
            blacklist: Blacklist::builtin()?,
            cache_root: cache_root(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// GitHub client for the configured remote, when a review needs one.
    pub async fn github_client(&self) -> Result<GithubClient> {
        let token = resolve_token(&self.runner, self.config.token.as_deref()).await?;
        Ok(GithubClient::new(&self.config.remote, token)?)
    }

    /// Run the full pipeline for one subject.
    pub async fn run(&self, subject: Subject) -> Result<ReviewOutcome> {
        let cwd = std::env::current_dir()?;
        let repo = GitRepo::discover(self.runner.clone(), &cwd).await?;

        // Resolve base and head commits per mode.
        let (base_sha, head_sha, base_tip, pr) = self.resolve_commits(&repo, &subject).await?;
        let name = subject.dir_name(&head_sha);
        let review_dir = self.cache_root.join(&name);
        std::fs::create_dir_all(review_dir.join("logs"))?;
        info!(review = %name, base = %base_sha, head = %head_sha, "starting review");

        let worktree_root = repo.root().join(".review");
        let merged = self
            .prepare_merged_worktree(&repo, &worktree_root.join(&name), &subject, &base_tip, &head_sha)
            .await?;

        let exprs = write_expressions(&review_dir)?;
        let evaluator = Evaluator::new(&self.runner, &self.config, &exprs);
        let resolver = Resolver::new(&evaluator, &self.config);

        // Change-set resolution, with the optional base worktree it needs.
        let mut base_worktree = None;
        let changeset = self
            .resolve_changeset(
                &repo,
                &resolver,
                &subject,
                pr.as_ref(),
                &worktree_root.join(format!("{name}-base")),
                &base_sha,
                &merged,
                &mut base_worktree,
            )
            .await?;
        info!(
            candidates = changeset.attrs.len(),
            blacklisted = changeset.blacklisted.len(),
            "change set resolved"
        );

        // Per-system evaluation of the surviving candidates.
        let to_eval: Vec<Attribute> = changeset
            .attrs
            .iter()
            .filter(|attr| !changeset.broken.contains(*attr))
            .cloned()
            .collect();
        let mut metas: BTreeMap<System, BTreeMap<Attribute, DerivationMeta>> = BTreeMap::new();
        for system in &self.config.systems {
            let meta = evaluator
                .evaluate_system(&merged.path, system, &to_eval)
                .await?;
            metas.insert(system.clone(), meta);
        }

        // Build whatever evaluated to a derivation.
        let (mut result, requests) = classify_evaluated(&self.config.systems, &changeset, &metas);
        let scheduler = BuildScheduler::new(&self.runner, &self.config, review_dir.join("logs"));
        let outcomes = scheduler.build_all(requests).await?;
        let tails = outcomes.log_tails.clone();
        let built = fold_build_outcomes(&mut result, &metas, outcomes);

        // Persist the report and the results tree.
        let report = Report::new(pr.as_ref().map(|p| p.number), &self.config, &result);
        report.write(&review_dir, &tails)?;
        let outputs: BTreeMap<Attribute, PathBuf> = built.iter().cloned().collect();
        write_results_tree(&review_dir, &outputs)?;
        write_attr_list(
            &review_dir.join("attrs"),
            &built.iter().map(|(a, _)| a.clone()).collect::<Vec<_>>(),
        )?;
        info!(report = %review_dir.join("report.md").display(), "review finished");

        // Success: the worktrees have served their purpose.
        self.cleanup_worktrees(&repo, &merged, base_worktree.as_ref())
            .await;

        Ok(ReviewOutcome {
            result,
            review_dir,
            pr,
            built,
        })
    }

    async fn resolve_commits(
        &self,
        repo: &GitRepo,
        subject: &Subject,
    ) -> Result<(String, String, String, Option<PrSpec>)> {
        match subject {
            Subject::Pr(number) => {
                let client = self.github_client().await?;
                let pr = client.pull_request(*number).await?;
                let head_sha = repo
                    .fetch(
                        &self.config.remote,
                        &format!("pull/{number}/head"),
                        &number.to_string(),
                    )
                    .await?;
                let base_tip = repo
                    .fetch(
                        &self.config.remote,
                        &pr.base_ref,
                        &format!("{number}-base"),
                    )
                    .await?;
                let base_sha = repo.merge_base(&base_tip, &head_sha).await?;
                Ok((base_sha, head_sha, base_tip, Some(pr)))
            }
            Subject::Rev(rev) => {
                let head_sha = repo.rev_parse(rev).await?;
                let base_sha = repo.rev_parse(&format!("{rev}^")).await?;
                Ok((base_sha, head_sha.clone(), head_sha, None))
            }
            Subject::Wip { staged } => {
                let base_sha = repo.rev_parse("HEAD").await?;
                let head_sha = repo.commit_worktree_snapshot(*staged).await?;
                Ok((base_sha, head_sha.clone(), head_sha, None))
            }
        }
    }

    /// Materialise the "after" worktree. In `pr` mode with the merge
    /// checkout, this merges the head onto the base tip; a conflict aborts
    /// the run with the worktree preserved.
    async fn prepare_merged_worktree(
        &self,
        repo: &GitRepo,
        path: &Path,
        subject: &Subject,
        base_tip: &str,
        head_sha: &str,
    ) -> Result<Worktree> {
        let merge = matches!(subject, Subject::Pr(_))
            && self.config.checkout == review_core::Checkout::Merge;
        if merge {
            let worktree = repo.make_worktree(path, base_tip).await?;
            let merged_sha = repo.merge_into(&worktree, base_tip, head_sha).await?;
            Ok(Worktree {
                path: worktree.path,
                commit: merged_sha,
            })
        } else {
            Ok(repo.make_worktree(path, head_sha).await?)
        }
    }

    async fn resolve_changeset(
        &self,
        repo: &GitRepo,
        resolver: &Resolver<'_>,
        subject: &Subject,
        pr: Option<&PrSpec>,
        base_path: &Path,
        base_sha: &str,
        merged: &Worktree,
        base_worktree: &mut Option<Worktree>,
    ) -> Result<ChangeSet> {
        let filter = self.config.package_filter()?;

        // A trusted CI evaluator already computed the change set?
        if let (Subject::Pr(number), Some(pr)) = (subject, pr) {
            if matches!(self.config.eval, EvalSource::Auto | EvalSource::Ofborg) {
                let client = self.github_client().await?;
                if let Some(rebuilds) = resolver.from_ci_artifacts(&client, pr).await? {
                    return Ok(apply_filters(
                        rebuilds,
                        BTreeSet::new(),
                        &filter,
                        &self.blacklist,
                    ));
                }
                if self.config.eval == EvalSource::Ofborg {
                    return Err(ReviewError::NoArtifacts(format!("pr {number}")));
                }
            }
        }

        let base = repo.make_worktree(base_path, base_sha).await?;
        let (candidates, broken) = resolver.from_local_eval(&base.path, &merged.path).await?;
        *base_worktree = Some(base);
        Ok(apply_filters(candidates, broken, &filter, &self.blacklist))
    }

    async fn cleanup_worktrees(
        &self,
        repo: &GitRepo,
        merged: &Worktree,
        base: Option<&Worktree>,
    ) {
        repo.drop_worktree_logged(merged).await;
        if let Some(base) = base {
            repo.drop_worktree_logged(base).await;
        }
    }
}

/// Fold blacklist, chunk failures, and evaluation metadata into the result,
/// and produce the build requests for everything that resolved.
fn classify_evaluated(
    systems: &[System],
    changeset: &ChangeSet,
    metas: &BTreeMap<System, BTreeMap<Attribute, DerivationMeta>>,
) -> (ReviewResult, Vec<BuildRequest>) {
    let mut result = ReviewResult::default();
    let mut requests = Vec::new();

    for system in systems {
        let entry = result.system_mut(system);
        for attr in &changeset.blacklisted {
            entry.classify(attr.clone(), Outcome::Blacklisted);
        }
        for attr in &changeset.broken {
            entry.classify(attr.clone(), Outcome::Broken);
        }
        let Some(meta_map) = metas.get(system) else {
            continue;
        };
        for (attr, meta) in meta_map {
            if !meta.exists {
                entry.classify(attr.clone(), Outcome::NonExistent);
            } else if meta.broken {
                entry.classify(attr.clone(), Outcome::Broken);
            } else if let Some(drv_path) = &meta.drv_path {
                requests.push(BuildRequest {
                    attr: attr.clone(),
                    system: system.clone(),
                    drv_path: drv_path.clone(),
                    out_paths: meta.out_paths.clone(),
                    is_test: meta.is_test,
                });
            }
        }
    }
    (result, requests)
}

/// Merge build outcomes into the result and collect the built outputs.
fn fold_build_outcomes(
    result: &mut ReviewResult,
    metas: &BTreeMap<System, BTreeMap<Attribute, DerivationMeta>>,
    outcomes: BuildOutcomes,
) -> Vec<(Attribute, PathBuf)> {
    result.incomplete = outcomes.interrupted;
    let mut built: BTreeMap<Attribute, PathBuf> = BTreeMap::new();
    for (system, attr, outcome) in outcomes.outcomes {
        if matches!(outcome, Outcome::Built | Outcome::Test) {
            if let Some(path) = metas
                .get(&system)
                .and_then(|m| m.get(&attr))
                .and_then(|meta| meta.out_paths.values().next())
            {
                built.entry(attr.clone()).or_insert_with(|| PathBuf::from(path));
            }
        }
        result.system_mut(&system).classify(attr, outcome);
    }
    built.into_iter().collect()
}

/// Post the markdown report as a PR comment.
pub async fn post_report(client: &GithubClient, number: u64, review_dir: &Path) -> Result<()> {
    let report = std::fs::read_to_string(review_dir.join("report.md"))?;
    client.post_comment(number, &report).await?;
    Ok(())
}
