//! Git operations: fetches, merge bases, and ephemeral worktrees.
//!
//! All object-database writes go through [`GitRepo::fetch`], which holds a
//! lock so concurrent reviews never race on refs. Worktrees are detached
//! checkouts; the primary checkout's HEAD, index, and working tree are never
//! touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::{Cmd, ProcessError, ProcessRunner};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// A directory materialised at a specific commit, sharing the primary
/// checkout's object database.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub path: PathBuf,
    pub commit: String,
}

/// Handle on the nixpkgs checkout the review operates on.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
    runner: ProcessRunner,
    fetch_lock: Arc<Mutex<()>>,
}

impl GitRepo {
    /// Open the repository containing `dir`.
    pub async fn discover(runner: ProcessRunner, dir: &Path) -> Result<Self> {
        let out = runner
            .run(
                Cmd::new("git")
                    .args(["rev-parse", "--show-toplevel"])
                    .cwd(dir)
                    .allow_failure(),
            )
            .await?;
        if out.exit_code != 0 {
            return Err(GitError::NotARepo(dir.display().to_string()));
        }
        Ok(Self {
            root: PathBuf::from(out.stdout_trimmed()),
            runner,
            fetch_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        self.git_in(&self.root, args).await
    }

    async fn git_in(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let out = self
            .runner
            .run(Cmd::new("git").args(args.iter().copied()).cwd(cwd))
            .await
            .map_err(|e| match e {
                ProcessError::NonZero { code, stderr, .. } => GitError::CommandFailed(format!(
                    "git {} (exit {code}): {stderr}",
                    args.join(" ")
                )),
                other => GitError::Process(other),
            })?;
        Ok(out.stdout_trimmed().to_string())
    }

    /// Resolve a rev-spec to a commit sha.
    pub async fn rev_parse(&self, rev: &str) -> Result<String> {
        self.git(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .await
    }

    /// Fetch a refspec into the review ref namespace and return its sha.
    ///
    /// Serialised: fetches are the only writes to the shared object database.
    pub async fn fetch(&self, remote: &str, refspec: &str, slot: &str) -> Result<String> {
        let _guard = self.fetch_lock.lock().await;
        let target = format!("refs/nixpkgs-review/{slot}");
        info!(remote, refspec, target, "fetching");
        self.git(&[
            "fetch",
            "--force",
            remote,
            &format!("{refspec}:{target}"),
        ])
        .await?;
        self.git(&["rev-parse", &target]).await
    }

    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.git(&["merge-base", a, b]).await
    }

    /// Materialise a worktree at `path` pointing at `sha`.
    ///
    /// Idempotent: an existing worktree already at `sha` is reused; one at a
    /// different sha is reset in place.
    pub async fn make_worktree(&self, path: &Path, sha: &str) -> Result<Worktree> {
        if path.exists() {
            let head = self.git_in(path, &["rev-parse", "HEAD"]).await?;
            if head == sha {
                debug!(path = %path.display(), sha, "reusing worktree");
                return Ok(Worktree {
                    path: path.to_path_buf(),
                    commit: head,
                });
            }
            debug!(path = %path.display(), from = %head, to = %sha, "resetting worktree");
            self.git_in(path, &["checkout", "--detach", sha]).await?;
            self.git_in(path, &["reset", "--hard", sha]).await?;
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GitError::CommandFailed(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
            // Stale administrative entries block worktree add after a crash.
            self.git(&["worktree", "prune"]).await?;
            self.git(&[
                "worktree",
                "add",
                "--detach",
                &path.display().to_string(),
                sha,
            ])
            .await?;
        }
        Ok(Worktree {
            path: path.to_path_buf(),
            commit: sha.to_string(),
        })
    }

    /// Remove a worktree. The source checkout is never touched.
    pub async fn drop_worktree(&self, worktree: &Worktree) -> Result<()> {
        self.git(&[
            "worktree",
            "remove",
            "--force",
            &worktree.path.display().to_string(),
        ])
        .await
        .map(|_| ())
    }

    /// Remove a worktree, downgrading failure to a warning.
    pub async fn drop_worktree_logged(&self, worktree: &Worktree) {
        if let Err(e) = self.drop_worktree(worktree).await {
            warn!(path = %worktree.path.display(), error = %e, "failed to remove worktree");
        }
    }

    /// In `worktree`, merge `head_sha` onto `base_ref` and return the merge
    /// commit. On conflict the worktree is left in the conflicted state for
    /// inspection.
    pub async fn merge_into(
        &self,
        worktree: &Worktree,
        base_ref: &str,
        head_sha: &str,
    ) -> Result<String> {
        self.git_in(&worktree.path, &["checkout", "--detach", base_ref])
            .await?;
        let out = self
            .runner
            .run(
                Cmd::new("git")
                    .args(["merge", "--no-edit", head_sha])
                    .cwd(&worktree.path)
                    .env("GIT_AUTHOR_NAME", "nixpkgs-review")
                    .env("GIT_AUTHOR_EMAIL", "nixpkgs-review@localhost")
                    .env("GIT_COMMITTER_NAME", "nixpkgs-review")
                    .env("GIT_COMMITTER_EMAIL", "nixpkgs-review@localhost")
                    .allow_failure(),
            )
            .await?;
        if out.exit_code != 0 {
            return Err(GitError::MergeConflict(format!(
                "merging {head_sha} onto {base_ref}: {}",
                out.stdout.trim()
            )));
        }
        self.git_in(&worktree.path, &["rev-parse", "HEAD"]).await
    }

    /// Commit a snapshot of the current index (and, unless `staged`, the
    /// working tree) without touching the real index or HEAD.
    pub async fn commit_worktree_snapshot(&self, staged: bool) -> Result<String> {
        let tree = if staged {
            // write-tree reads the index without modifying it.
            self.git(&["write-tree"]).await?
        } else {
            let scratch_dir = tempfile::Builder::new()
                .prefix("nixpkgs-review-index")
                .tempdir()
                .map_err(|e| GitError::CommandFailed(format!("scratch index: {e}")))?;
            let scratch = scratch_dir.path().join("index");
            let scratch_path = scratch.display().to_string();

            // Seed the scratch index with the real one so staged changes
            // survive, then fold in the working tree.
            let index_path = self.git(&["rev-parse", "--git-path", "index"]).await?;
            let index_abs = self.root.join(index_path);
            if index_abs.exists() {
                std::fs::copy(&index_abs, &scratch)
                    .map_err(|e| GitError::CommandFailed(format!("copy index: {e}")))?;
            } else {
                self.git_env(&["read-tree", "HEAD"], &scratch_path).await?;
            }
            // Leftover review worktrees under .review/ are not part of the
            // snapshot.
            self.git_env(
                &["add", "-A", "--", ".", ":(exclude).review"],
                &scratch_path,
            )
            .await?;
            self.git_env(&["write-tree"], &scratch_path).await?
        };

        let head = self.rev_parse("HEAD").await?;
        let out = self
            .runner
            .run(
                Cmd::new("git")
                    .args(["commit-tree", &tree, "-p", &head, "-m", "nixpkgs-review wip"])
                    .cwd(&self.root)
                    .env("GIT_AUTHOR_NAME", "nixpkgs-review")
                    .env("GIT_AUTHOR_EMAIL", "nixpkgs-review@localhost")
                    .env("GIT_COMMITTER_NAME", "nixpkgs-review")
                    .env("GIT_COMMITTER_EMAIL", "nixpkgs-review@localhost"),
            )
            .await
            .map_err(|e| GitError::CommandFailed(format!("commit-tree: {e}")))?;
        Ok(out.stdout_trimmed().to_string())
    }

    async fn git_env(&self, args: &[&str], index_file: &str) -> Result<String> {
        let out = self
            .runner
            .run(
                Cmd::new("git")
                    .args(args.iter().copied())
                    .cwd(&self.root)
                    .env("GIT_INDEX_FILE", index_file),
            )
            .await
            .map_err(|e| GitError::CommandFailed(format!("git {}: {e}", args.join(" "))))?;
        Ok(out.stdout_trimmed().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(CancellationToken::new())
    }

    async fn sh(dir: &Path, script: &str) {
        let out = runner()
            .run(Cmd::new("sh").arg("-c").arg(script).cwd(dir))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
    }

    /// Git repository with one commit of `pkg1/default.nix`.
    async fn setup_repo() -> (TempDir, GitRepo) {
        let dir = TempDir::new().unwrap();
        sh(
            dir.path(),
            "git init -q -b main . \
             && git config user.email t@t && git config user.name t \
             && mkdir pkg1 && echo v1 > pkg1/default.nix \
             && git add . && git commit -q -m init",
        )
        .await;
        let repo = GitRepo::discover(runner(), dir.path()).await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn discover_rejects_non_repos() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GitRepo::discover(runner(), dir.path()).await,
            Err(GitError::NotARepo(_))
        ));
    }

    #[tokio::test]
    async fn fetch_populates_the_review_namespace() {
        let (_dir, repo) = setup_repo().await;
        let (_remote_dir, remote) = setup_repo().await;

        let sha = repo
            .fetch(&remote.root().display().to_string(), "main", "1")
            .await
            .unwrap();
        assert_eq!(sha, remote.rev_parse("HEAD").await.unwrap());
        assert_eq!(repo.rev_parse("refs/nixpkgs-review/1").await.unwrap(), sha);
    }

    #[tokio::test]
    async fn make_worktree_is_idempotent() {
        let (dir, repo) = setup_repo().await;
        let sha = repo.rev_parse("HEAD").await.unwrap();
        let path = dir.path().join(".review").join("wt");

        let wt = repo.make_worktree(&path, &sha).await.unwrap();
        assert_eq!(wt.commit, sha);
        assert!(path.join("pkg1/default.nix").exists());

        // Second call reuses the existing worktree.
        let again = repo.make_worktree(&path, &sha).await.unwrap();
        assert_eq!(again.commit, sha);
    }

    #[tokio::test]
    async fn make_worktree_resets_to_a_new_sha() {
        let (dir, repo) = setup_repo().await;
        let old = repo.rev_parse("HEAD").await.unwrap();
        let path = dir.path().join(".review").join("wt");
        repo.make_worktree(&path, &old).await.unwrap();

        sh(
            dir.path(),
            "echo v2 > pkg1/default.nix && git commit -qam update",
        )
        .await;
        let new = repo.rev_parse("HEAD").await.unwrap();

        let wt = repo.make_worktree(&path, &new).await.unwrap();
        assert_eq!(wt.commit, new);
        let content = std::fs::read_to_string(path.join("pkg1/default.nix")).unwrap();
        assert_eq!(content.trim(), "v2");
    }

    #[tokio::test]
    async fn drop_worktree_leaves_the_primary_checkout_alone() {
        let (dir, repo) = setup_repo().await;
        let head_before = repo.rev_parse("HEAD").await.unwrap();
        let sha = head_before.clone();
        let path = dir.path().join(".review").join("wt");

        let wt = repo.make_worktree(&path, &sha).await.unwrap();
        repo.drop_worktree(&wt).await.unwrap();

        assert!(!path.exists());
        assert_eq!(repo.rev_parse("HEAD").await.unwrap(), head_before);
        assert!(dir.path().join("pkg1/default.nix").exists());
    }

    #[tokio::test]
    async fn merge_into_produces_a_merge_commit() {
        let (dir, repo) = setup_repo().await;

        // Diverge base and head so the merge cannot fast-forward.
        sh(
            dir.path(),
            "git checkout -q -b feature \
             && mkdir pkg2 && echo v1 > pkg2/default.nix \
             && git add . && git commit -q -m feature \
             && git checkout -q main \
             && mkdir pkg3 && echo v1 > pkg3/default.nix \
             && git add . && git commit -q -m base-advance",
        )
        .await;
        let base = repo.rev_parse("main").await.unwrap();
        let head = repo.rev_parse("feature").await.unwrap();

        let path = dir.path().join(".review").join("wt");
        let wt = repo.make_worktree(&path, &base).await.unwrap();
        let merged = repo.merge_into(&wt, &base, &head).await.unwrap();

        assert_ne!(merged, base);
        assert_ne!(merged, head);
        assert!(path.join("pkg2/default.nix").exists());
        assert!(path.join("pkg3/default.nix").exists());
        assert_eq!(repo.merge_base(&merged, &base).await.unwrap(), base);
    }

    #[tokio::test]
    async fn merge_conflict_is_reported_and_preserved() {
        let (dir, repo) = setup_repo().await;
        let base = repo.rev_parse("HEAD").await.unwrap();

        sh(
            dir.path(),
            "git checkout -q -b feature \
             && echo feature > pkg1/default.nix && git commit -qam feature \
             && git checkout -q main \
             && echo main > pkg1/default.nix && git commit -qam main",
        )
        .await;
        let conflicting_base = repo.rev_parse("main").await.unwrap();
        let head = repo.rev_parse("feature").await.unwrap();

        let path = dir.path().join(".review").join("wt");
        let wt = repo.make_worktree(&path, &base).await.unwrap();
        let err = repo
            .merge_into(&wt, &conflicting_base, &head)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::MergeConflict(_)));

        // Conflict markers stay in place for post-mortem inspection.
        let content = std::fs::read_to_string(path.join("pkg1/default.nix")).unwrap();
        assert!(content.contains("<<<<<<<"));
    }

    #[tokio::test]
    async fn worktree_snapshot_captures_unstaged_changes() {
        let (dir, repo) = setup_repo().await;
        let head = repo.rev_parse("HEAD").await.unwrap();

        std::fs::write(dir.path().join("pkg1/default.nix"), "dirty\n").unwrap();
        let snapshot = repo.commit_worktree_snapshot(false).await.unwrap();

        assert_ne!(snapshot, head);
        // HEAD and the working tree are untouched.
        assert_eq!(repo.rev_parse("HEAD").await.unwrap(), head);
        let shown = repo
            .git(&["show", &format!("{snapshot}:pkg1/default.nix")])
            .await
            .unwrap();
        assert_eq!(shown, "dirty");
    }

    #[tokio::test]
    async fn staged_snapshot_ignores_the_working_tree() {
        let (dir, repo) = setup_repo().await;

        sh(
            dir.path(),
            "echo staged > pkg1/default.nix && git add pkg1/default.nix",
        )
        .await;
        std::fs::write(dir.path().join("pkg1/default.nix"), "unstaged\n").unwrap();

        let snapshot = repo.commit_worktree_snapshot(true).await.unwrap();
        let shown = repo
            .git(&["show", &format!("{snapshot}:pkg1/default.nix")])
            .await
            .unwrap();
        assert_eq!(shown, "staged");
    }
}
