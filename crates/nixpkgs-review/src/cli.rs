//! Command-line surface and top-level dispatch.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::warn;

use review_core::{
    resolve_systems, Attribute, BuildGraph, Checkout, Config, ConfigError, EvalSource,
};

use crate::process::ProcessRunner;
use crate::review::{cache_root, post_report, Review, ReviewError, Subject};
use crate::shell;

/// Review nixpkgs changes by building every affected package.
#[derive(Debug, Parser)]
#[command(name = "nixpkgs-review")]
#[command(about = "Review nixpkgs pull requests by building changed packages")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Review one or more pull requests
    Pr {
        /// Pull request numbers
        #[arg(required = true)]
        numbers: Vec<u64>,

        /// How to check out the head: merged onto the base, or as-is
        #[arg(long, default_value = "merge", value_parser = parse_checkout)]
        checkout: Checkout,

        /// Change-set source: auto, ofborg, or local
        #[arg(long, default_value = "auto", value_parser = parse_eval_source)]
        eval: EvalSource,

        /// Post the report as a PR comment when done
        #[arg(long)]
        post_result: bool,

        /// Approve the PR after a fully successful review
        #[arg(long)]
        approve: bool,

        /// Merge the PR after a fully successful review
        #[arg(long)]
        merge: bool,

        #[command(flatten)]
        opts: ReviewOpts,
    },

    /// Review a local commit (base is REV^)
    Rev {
        /// Rev-spec of the commit to review
        rev: String,

        #[command(flatten)]
        opts: ReviewOpts,
    },

    /// Review uncommitted changes in the working tree
    Wip {
        /// Only include staged changes
        #[arg(long)]
        staged: bool,

        #[command(flatten)]
        opts: ReviewOpts,
    },

    /// Approve a pull request
    Approve {
        /// Pull request number (defaults to $PR inside a review shell)
        #[arg(env = "PR")]
        number: u64,

        #[command(flatten)]
        host: HostOpts,
    },

    /// Merge a pull request
    Merge {
        /// Pull request number (defaults to $PR inside a review shell)
        #[arg(env = "PR")]
        number: u64,

        #[command(flatten)]
        host: HostOpts,
    },

    /// Post the report of an earlier review as a PR comment
    PostResult {
        /// Pull request number (defaults to $PR inside a review shell)
        #[arg(env = "PR")]
        number: u64,

        #[command(flatten)]
        host: HostOpts,
    },

    /// Show the comments of a pull request
    Comments {
        /// Pull request number (defaults to $PR inside a review shell)
        #[arg(env = "PR")]
        number: u64,

        #[command(flatten)]
        host: HostOpts,
    },
}

/// Options shared by every review mode.
#[derive(Debug, Args)]
pub struct ReviewOpts {
    /// Systems to review: concrete triples or the aliases
    /// current, all, linux, darwin, x64, aarch64
    #[arg(long)]
    pub systems: Option<String>,

    /// Restrict the review to these attributes
    #[arg(long = "package", short = 'p')]
    pub package: Vec<String>,

    /// Restrict the review to attributes matching these regexes
    #[arg(long = "package-regex")]
    pub package_regex: Vec<String>,

    /// Skip these attributes
    #[arg(long = "skip-package")]
    pub skip_package: Vec<String>,

    /// Skip attributes fully matching these regexes
    #[arg(long = "skip-package-regex")]
    pub skip_package_regex: Vec<String>,

    /// Print the markdown report to stdout when done
    #[arg(long)]
    pub print_result: bool,

    /// Skip the interactive shell
    #[arg(long)]
    pub no_shell: bool,

    /// Run this command instead of the interactive shell
    #[arg(long)]
    pub run: Option<String>,

    /// Extra arguments passed verbatim to nix-build
    #[arg(long, allow_hyphen_values = true)]
    pub build_args: Option<String>,

    /// Build output frontend: nom or nix
    #[arg(long, value_parser = parse_build_graph)]
    pub build_graph: Option<BuildGraph>,

    /// Wrap the review shell in a sandbox
    #[arg(long)]
    pub sandbox: bool,

    /// GitHub remote of the package set
    #[arg(long)]
    pub remote: Option<String>,

    /// Extra nixpkgs config attrset, e.g. '{ cudaSupport = true; }'
    #[arg(long)]
    pub extra_nixpkgs_config: Option<String>,

    /// GitHub API token
    #[arg(long)]
    pub token: Option<String>,

    /// Also build passthru.tests of changed attributes
    #[arg(long)]
    pub with_passthru_tests: bool,

    /// Treat deprecated alias attributes as non-existent
    #[arg(long)]
    pub no_aliases: bool,

    /// Config file (default: $XDG_CONFIG_HOME/nixpkgs-review/config)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Remote and token, for the standalone GitHub subcommands.
#[derive(Debug, Args)]
pub struct HostOpts {
    /// GitHub remote of the package set
    #[arg(long, default_value = "https://github.com/NixOS/nixpkgs")]
    pub remote: String,

    /// GitHub API token
    #[arg(long)]
    pub token: Option<String>,
}

impl ReviewOpts {
    /// Merge the config file and CLI flags into the typed record.
    pub fn build_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => match default_config_file() {
                Some(path) if path.exists() => Config::from_file(&path)?,
                _ => Config::default(),
            },
        };

        if let Some(systems) = &self.systems {
            config.systems = resolve_systems(systems)?;
        }
        config.package = parse_attr_args(&self.package)?;
        config.package_regex.extend(self.package_regex.iter().cloned());
        config.skip_package = parse_attr_args(&self.skip_package)?;
        config
            .skip_package_regex
            .extend(self.skip_package_regex.iter().cloned());
        config.print_result |= self.print_result;
        config.no_shell |= self.no_shell;
        if self.run.is_some() {
            config.run_command.clone_from(&self.run);
        }
        if let Some(build_args) = &self.build_args {
            config
                .build_args
                .extend(build_args.split_whitespace().map(str::to_string));
        }
        if let Some(build_graph) = self.build_graph {
            config.build_graph = build_graph;
        }
        config.sandbox |= self.sandbox;
        if let Some(remote) = &self.remote {
            config.remote.clone_from(remote);
        }
        if self.extra_nixpkgs_config.is_some() {
            config
                .extra_nixpkgs_config
                .clone_from(&self.extra_nixpkgs_config);
        }
        if self.token.is_some() {
            config.token.clone_from(&self.token);
        }
        config.include_passthru_tests |= self.with_passthru_tests;
        if self.no_aliases {
            config.allow_aliases = false;
        }
        // Validate user regexes up front so typos fail before any fetch.
        config.package_filter()?;
        Ok(config)
    }
}

fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("nixpkgs-review/config"))
}

fn parse_attr_args(args: &[String]) -> Result<Vec<Attribute>, ConfigError> {
    args.iter()
        .map(|raw| raw.parse::<Attribute>().map_err(ConfigError::Type))
        .collect()
}

fn parse_checkout(s: &str) -> Result<Checkout, String> {
    match s {
        "merge" => Ok(Checkout::Merge),
        "commit" => Ok(Checkout::Commit),
        _ => Err(format!("expected 'merge' or 'commit', got '{s}'")),
    }
}

fn parse_eval_source(s: &str) -> Result<EvalSource, String> {
    match s {
        "auto" => Ok(EvalSource::Auto),
        "ofborg" => Ok(EvalSource::Ofborg),
        "local" => Ok(EvalSource::Local),
        _ => Err(format!("expected 'auto', 'ofborg' or 'local', got '{s}'")),
    }
}

fn parse_build_graph(s: &str) -> Result<BuildGraph, String> {
    match s {
        "nom" => Ok(BuildGraph::Nom),
        "nix" => Ok(BuildGraph::Nix),
        _ => Err(format!("expected 'nom' or 'nix', got '{s}'")),
    }
}

/// Dispatch a parsed command line. Returns the process exit code.
pub async fn execute(cli: Cli, runner: ProcessRunner) -> Result<i32, ReviewError> {
    match cli.command {
        Command::Pr {
            numbers,
            checkout,
            eval,
            post_result,
            approve,
            merge,
            opts,
        } => {
            let mut config = opts.build_config()?;
            config.checkout = checkout;
            config.eval = eval;
            config.post_result |= post_result;
            config.approve |= approve;
            config.merge |= merge;
            let review = Review::new(runner, config)?;

            let mut exit = 0;
            for number in numbers {
                let outcome = review.run(Subject::Pr(number)).await?;
                exit = exit.max(outcome.exit_code());
                finish_pr(&review, number, &outcome).await?;
                run_shell(&review, &outcome, Some(number)).await?;
            }
            Ok(exit)
        }

        Command::Rev { rev, opts } => {
            let config = opts.build_config()?;
            let review = Review::new(runner, config)?;
            let outcome = review.run(Subject::Rev(rev)).await?;
            print_result(&review, &outcome)?;
            run_shell(&review, &outcome, None).await?;
            Ok(outcome.exit_code())
        }

        Command::Wip { staged, opts } => {
            let config = opts.build_config()?;
            let review = Review::new(runner, config)?;
            let outcome = review.run(Subject::Wip { staged }).await?;
            print_result(&review, &outcome)?;
            run_shell(&review, &outcome, None).await?;
            Ok(outcome.exit_code())
        }

        Command::Approve { number, host } => {
            let client = host_client(&runner, &host).await?;
            client.approve(number, "").await?;
            Ok(0)
        }

        Command::Merge { number, host } => {
            let client = host_client(&runner, &host).await?;
            client.merge(number).await?;
            Ok(0)
        }

        Command::PostResult { number, host } => {
            let client = host_client(&runner, &host).await?;
            let review_dir = cache_root().join(format!("pr-{number}"));
            post_report(&client, number, &review_dir).await?;
            Ok(0)
        }

        Command::Comments { number, host } => {
            let client = host_client(&runner, &host).await?;
            for comment in client.comments(number).await? {
                println!("@{} ({}):", comment.user.login, comment.created_at);
                println!("{}\n", comment.body.trim_end());
            }
            Ok(0)
        }
    }
}

async fn host_client(
    runner: &ProcessRunner,
    host: &HostOpts,
) -> Result<crate::github::GithubClient, ReviewError> {
    let token = crate::github::resolve_token(runner, host.token.as_deref()).await?;
    Ok(crate::github::GithubClient::new(&host.remote, token)?)
}

/// Post-review PR actions: post the report, approve, merge.
async fn finish_pr(
    review: &Review,
    number: u64,
    outcome: &crate::review::ReviewOutcome,
) -> Result<(), ReviewError> {
    print_result(review, outcome)?;
    let config = review.config();
    if config.post_result {
        let client = review.github_client().await?;
        post_report(&client, number, &outcome.review_dir).await?;
    }
    if config.approve || config.merge {
        if outcome.exit_code() != 0 {
            warn!(number, "builds failed, skipping approve/merge");
            return Ok(());
        }
        let client = review.github_client().await?;
        if config.approve {
            client.approve(number, "").await?;
        }
        if config.merge {
            client.merge(number).await?;
        }
    }
    Ok(())
}

fn print_result(
    review: &Review,
    outcome: &crate::review::ReviewOutcome,
) -> Result<(), ReviewError> {
    if review.config().print_result {
        let report = std::fs::read_to_string(outcome.review_dir.join("report.md"))?;
        println!("{report}");
    }
    Ok(())
}

async fn run_shell(
    review: &Review,
    outcome: &crate::review::ReviewOutcome,
    pr: Option<u64>,
) -> Result<(), ReviewError> {
    let config = review.config();
    if config.no_shell {
        return Ok(());
    }
    shell::launch(
        &outcome.review_dir,
        &outcome.built,
        config.run_command.as_deref(),
        pr,
    )
    .await?;
    Ok(())
}
