//! Build scheduling: bounded-parallel `nix-build` over resolved derivations.
//!
//! The external builder handles dependency ordering; this layer only rate
//! limits, streams logs, and classifies outcomes. Build failures are data,
//! never errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use review_core::{Attribute, BuildGraph, Config, Outcome, System};

use crate::process::{Cmd, ProcessError, ProcessRunner};

/// Non-blank lines of a failed build kept for the markdown report.
const LOG_TAIL_LINES: usize = 30;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// One resolved derivation to realise.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub attr: Attribute,
    pub system: System,
    pub drv_path: String,
    pub out_paths: BTreeMap<String, String>,
    pub is_test: bool,
}

/// Everything the aggregator needs from the build stage.
#[derive(Debug, Default)]
pub struct BuildOutcomes {
    pub outcomes: Vec<(System, Attribute, Outcome)>,
    pub log_tails: BTreeMap<Attribute, String>,
    /// True when a SIGINT stopped the run before every build finished.
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct BuildScheduler<'a> {
    runner: &'a ProcessRunner,
    config: &'a Config,
    logs_dir: PathBuf,
    max_jobs: usize,
    builder: String,
}

impl<'a> BuildScheduler<'a> {
    pub fn new(runner: &'a ProcessRunner, config: &'a Config, logs_dir: PathBuf) -> Self {
        let max_jobs = max_jobs_from_args(&config.build_args)
            .unwrap_or_else(|| num_cpus::get().max(1));
        Self {
            runner,
            config,
            logs_dir,
            max_jobs,
            builder: "nix-build".to_string(),
        }
    }

    /// Build every request, deduplicating identical derivation paths.
    pub async fn build_all(&self, requests: Vec<BuildRequest>) -> Result<BuildOutcomes> {
        std::fs::create_dir_all(&self.logs_dir)?;

        // The same drvPath can back several attributes (aliases) and shows
        // up once per system; realise each derivation exactly once.
        let mut by_drv: BTreeMap<String, Vec<BuildRequest>> = BTreeMap::new();
        for request in requests {
            by_drv.entry(request.drv_path.clone()).or_default().push(request);
        }
        info!(
            derivations = by_drv.len(),
            max_jobs = self.max_jobs,
            "starting builds"
        );

        let funnel = self.start_nom_funnel().await;
        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let tasks = by_drv.into_iter().map(|(drv_path, group)| {
            let semaphore = Arc::clone(&semaphore);
            let sink = funnel.as_ref().map(|f| f.tx.clone());
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.build_one(&drv_path, group, sink).await
            }
        });

        let mut outcomes = BuildOutcomes::default();
        for result in join_all(tasks).await {
            let (group_outcomes, tails, interrupted) = result?;
            outcomes.outcomes.extend(group_outcomes);
            outcomes.log_tails.extend(tails);
            outcomes.interrupted |= interrupted;
        }

        if let Some(funnel) = funnel {
            drop(funnel.tx);
            let _ = funnel.task.await;
        }
        Ok(outcomes)
    }

    /// Realise one derivation and classify every attribute behind it.
    async fn build_one(
        &self,
        drv_path: &str,
        group: Vec<BuildRequest>,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<(
        Vec<(System, Attribute, Outcome)>,
        BTreeMap<Attribute, String>,
        bool,
    )> {
        let log_path = self.logs_dir.join(format!("{}.log", group[0].attr.file_name()));

        let mut cmd = Cmd::new(&self.builder)
            .args(["--no-link", "--keep-going"])
            .args(self.config.build_args.iter().cloned())
            .arg(drv_path)
            .tee(&log_path)
            .allow_failure();
        if let Some(sink) = sink {
            cmd = cmd.line_sink(sink);
        }

        let (exit_code, interrupted) = match self.runner.run(cmd).await {
            Ok(out) => (out.exit_code, false),
            Err(ProcessError::Cancelled) => {
                debug!(drv_path, "build interrupted");
                (-1, true)
            }
            Err(e) => return Err(e.into()),
        };

        // Fan the shared log out to every other attribute in the group.
        for request in group.iter().skip(1) {
            let copy = self.logs_dir.join(format!("{}.log", request.attr.file_name()));
            if copy != log_path && log_path.exists() {
                let _ = std::fs::copy(&log_path, &copy);
            }
        }

        let mut outcomes = Vec::new();
        let mut tails = BTreeMap::new();
        for request in group {
            let all_outputs_exist = request
                .out_paths
                .values()
                .all(|path| Path::new(path).exists());
            let outcome = if exit_code == 0 && all_outputs_exist {
                if request.is_test {
                    Outcome::Test
                } else {
                    Outcome::Built
                }
            } else {
                warn!(attr = %request.attr, system = %request.system, exit_code, "build failed");
                tails.insert(request.attr.clone(), read_log_tail(&log_path));
                Outcome::Failed
            };
            outcomes.push((request.system, request.attr, outcome));
        }
        Ok((outcomes, tails, interrupted))
    }

    /// Funnel all build output through a single nix-output-monitor process
    /// when requested and available.
    async fn start_nom_funnel(&self) -> Option<NomFunnel> {
        if self.config.build_graph != BuildGraph::Nom {
            return None;
        }
        let available = self
            .runner
            .run(Cmd::new("nom").arg("--version").allow_failure())
            .await
            .is_ok();
        if !available {
            debug!("nom not found on PATH, falling back to plain build output");
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = self.runner.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = runner.run(Cmd::new("nom").stdin_lines(rx).allow_failure()).await {
                warn!(error = %e, "nom funnel exited");
            }
        });
        Some(NomFunnel { tx, task })
    }
}

struct NomFunnel {
    tx: mpsc::UnboundedSender<String>,
    task: tokio::task::JoinHandle<()>,
}

/// Honor a `--max-jobs N` / `-j N` override passed through `build_args`.
fn max_jobs_from_args(args: &[String]) -> Option<usize> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--max-jobs" || arg == "-j" {
            return iter.next()?.parse().ok();
        }
        if let Some(value) = arg.strip_prefix("--max-jobs=") {
            return value.parse().ok();
        }
    }
    None
}

/// Last non-blank lines of a build log.
fn read_log_tail(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn attr(s: &str) -> Attribute {
        s.parse().unwrap()
    }

    #[test]
    fn max_jobs_override_variants() {
        let none: Vec<String> = vec![];
        assert_eq!(max_jobs_from_args(&none), None);
        assert_eq!(
            max_jobs_from_args(&["--max-jobs".into(), "4".into()]),
            Some(4)
        );
        assert_eq!(max_jobs_from_args(&["--max-jobs=8".into()]), Some(8));
        assert_eq!(max_jobs_from_args(&["-j".into(), "2".into()]), Some(2));
        assert_eq!(max_jobs_from_args(&["--keep-failed".into()]), None);
    }

    #[test]
    fn log_tail_drops_blank_lines_and_caps_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fail.log");
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("line {i}\n\n"));
        }
        std::fs::write(&path, content).unwrap();

        let tail = read_log_tail(&path);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), LOG_TAIL_LINES);
        assert_eq!(*lines.last().unwrap(), "line 99");
        assert!(!tail.contains("\n\n"));
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(read_log_tail(Path::new("/does/not/exist.log")), "");
    }

    fn scheduler_config(build_args: &[&str]) -> Config {
        Config {
            build_graph: BuildGraph::Nix,
            build_args: build_args.iter().map(|s| s.to_string()).collect(),
            ..Config::default()
        }
    }

    fn request(name: &str, drv: &str, out: &Path) -> BuildRequest {
        BuildRequest {
            attr: attr(name),
            system: System::new("x86_64-linux"),
            drv_path: drv.to_string(),
            out_paths: BTreeMap::from([("out".into(), out.display().to_string())]),
            is_test: false,
        }
    }

    /// Scheduler with `true`/`false` standing in for nix-build:
    /// classification only depends on the exit code and output existence.
    fn fake_scheduler<'a>(
        runner: &'a ProcessRunner,
        config: &'a Config,
        dir: &Path,
        builder: &str,
    ) -> BuildScheduler<'a> {
        std::fs::create_dir_all(dir.join("logs")).unwrap();
        let mut scheduler = BuildScheduler::new(runner, config, dir.join("logs"));
        scheduler.builder = builder.to_string();
        scheduler
    }

    #[tokio::test]
    async fn classification_follows_exit_code_and_outputs() {
        let dir = TempDir::new().unwrap();
        let out_path = dir.path().join("store-ok");
        std::fs::create_dir(&out_path).unwrap();

        let runner = ProcessRunner::new(CancellationToken::new());
        let config = scheduler_config(&[]);
        let scheduler = fake_scheduler(&runner, &config, dir.path(), "true");

        let ok = scheduler
            .build_one("drv-ok", vec![request("ok", "drv-ok", &out_path)], None)
            .await
            .unwrap();
        assert_eq!(ok.0[0].2, Outcome::Built);

        // Zero exit but a missing output is still a failure.
        let missing_output = dir.path().join("never-created");
        let failed = scheduler
            .build_one(
                "drv-missing",
                vec![request("missing", "drv-missing", &missing_output)],
                None,
            )
            .await
            .unwrap();
        assert_eq!(failed.0[0].2, Outcome::Failed);
    }

    #[tokio::test]
    async fn failed_build_records_a_log_tail() {
        let dir = TempDir::new().unwrap();
        let runner = ProcessRunner::new(CancellationToken::new());
        let config = scheduler_config(&[]);
        let scheduler = fake_scheduler(&runner, &config, dir.path(), "false");

        let (outcomes, tails, interrupted) = scheduler
            .build_one("drv-fail", vec![request("fail", "drv-fail", dir.path())], None)
            .await
            .unwrap();
        assert_eq!(outcomes[0].2, Outcome::Failed);
        assert!(!interrupted);
        assert!(tails.contains_key(&attr("fail")));
        assert!(dir.path().join("logs/fail.log").exists());
    }

    #[tokio::test]
    async fn test_attrs_classify_as_tests() {
        let dir = TempDir::new().unwrap();
        let out_path = dir.path().join("store-test");
        std::fs::create_dir(&out_path).unwrap();

        let runner = ProcessRunner::new(CancellationToken::new());
        let config = scheduler_config(&[]);
        let scheduler = fake_scheduler(&runner, &config, dir.path(), "true");

        let mut req = request("pkg1.passthru.tests.smoke", "drv-test", &out_path);
        req.is_test = true;
        let (outcomes, _, _) = scheduler.build_one("drv-test", vec![req], None).await.unwrap();
        assert_eq!(outcomes[0].2, Outcome::Test);
    }

    #[tokio::test]
    async fn shared_drv_classifies_every_attr() {
        let dir = TempDir::new().unwrap();
        let out_path = dir.path().join("store-shared");
        std::fs::create_dir(&out_path).unwrap();

        let runner = ProcessRunner::new(CancellationToken::new());
        let config = scheduler_config(&[]);
        let scheduler = fake_scheduler(&runner, &config, dir.path(), "true");

        let group = vec![
            request("alias1", "drv-shared", &out_path),
            request("alias2", "drv-shared", &out_path),
        ];
        let (outcomes, _, _) = scheduler.build_one("drv-shared", group, None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, _, o)| *o == Outcome::Built));
        // Both aliases got a log file.
        assert!(dir.path().join("logs/alias1.log").exists());
        assert!(dir.path().join("logs/alias2.log").exists());
    }

    #[tokio::test]
    async fn cancellation_marks_the_run_interrupted() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = ProcessRunner::new(cancel);
        let config = scheduler_config(&[]);
        let scheduler = fake_scheduler(&runner, &config, dir.path(), "true");

        let outcomes = scheduler
            .build_all(vec![request("pkg1", "drv1", dir.path())])
            .await
            .unwrap();
        assert!(outcomes.interrupted);
        assert_eq!(outcomes.outcomes[0].2, Outcome::Failed);
    }
}
