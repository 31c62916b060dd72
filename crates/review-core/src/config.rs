//! Typed run configuration.
//!
//! Every recognised option is a field on [`Config`]; a key=value config file
//! (`$XDG_CONFIG_HOME/nixpkgs-review/config`) merges below CLI flags into the
//! same record. Unknown keys are a hard error, not a warning.

use std::path::Path;

use thiserror::Error;

use crate::filter::PackageFilter;
use crate::types::{resolve_systems, Attribute, System, TypeError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid value for {key}: {value} (expected one of {expected})")]
    InvalidVariant {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("unrecognised config option: {0}")]
    UnknownKey(String),
    #[error("invalid regex for {key}: {source}")]
    InvalidRegex {
        key: String,
        #[source]
        source: regex::Error,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// How the head commit is prepared in `pr` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkout {
    /// Merge the PR head onto its base branch before evaluating.
    #[default]
    Merge,
    /// Evaluate the PR head commit as-is.
    Commit,
}

impl Checkout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Commit => "commit",
        }
    }
}

/// Where the candidate attribute list comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalSource {
    /// Prefer CI artifacts, fall back to local evaluation.
    #[default]
    Auto,
    /// Require CI artifacts; missing or stale artifacts are an error.
    Ofborg,
    /// Always evaluate locally.
    Local,
}

impl EvalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Ofborg => "ofborg",
            Self::Local => "local",
        }
    }
}

/// Which frontend renders build output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildGraph {
    /// Funnel build output through nix-output-monitor when available.
    #[default]
    Nom,
    /// Plain nix-build output.
    Nix,
}

impl BuildGraph {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nom => "nom",
            Self::Nix => "nix",
        }
    }
}

/// Run configuration, merged from defaults, the config file, and CLI flags.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Config {
    pub checkout: Checkout,
    pub eval: EvalSource,
    pub systems: Vec<System>,
    pub package: Vec<Attribute>,
    pub package_regex: Vec<String>,
    pub skip_package: Vec<Attribute>,
    pub skip_package_regex: Vec<String>,
    pub post_result: bool,
    pub print_result: bool,
    pub approve: bool,
    pub merge: bool,
    pub no_shell: bool,
    pub run_command: Option<String>,
    pub build_args: Vec<String>,
    pub build_graph: BuildGraph,
    pub sandbox: bool,
    pub remote: String,
    pub extra_nixpkgs_config: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub include_passthru_tests: bool,
    pub allow_aliases: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkout: Checkout::Merge,
            eval: EvalSource::Auto,
            systems: vec![crate::types::current_system()],
            package: Vec::new(),
            package_regex: Vec::new(),
            skip_package: Vec::new(),
            skip_package_regex: Vec::new(),
            post_result: false,
            print_result: false,
            approve: false,
            merge: false,
            no_shell: false,
            run_command: None,
            build_args: Vec::new(),
            build_graph: BuildGraph::Nom,
            sandbox: false,
            remote: "https://github.com/NixOS/nixpkgs".to_string(),
            extra_nixpkgs_config: None,
            token: None,
            include_passthru_tests: false,
            allow_aliases: true,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Merge values from a key=value config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), &Self::unquote(value.trim()))?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "checkout" => {
                self.checkout = match value {
                    "merge" => Checkout::Merge,
                    "commit" => Checkout::Commit,
                    _ => {
                        return Err(ConfigError::InvalidVariant {
                            key: key.to_string(),
                            value: value.to_string(),
                            expected: "merge, commit",
                        })
                    }
                }
            }
            "eval" => {
                self.eval = match value {
                    "auto" => EvalSource::Auto,
                    "ofborg" => EvalSource::Ofborg,
                    "local" => EvalSource::Local,
                    _ => {
                        return Err(ConfigError::InvalidVariant {
                            key: key.to_string(),
                            value: value.to_string(),
                            expected: "auto, ofborg, local",
                        })
                    }
                }
            }
            "systems" => self.systems = resolve_systems(value)?,
            "package" => self.package = Self::parse_attrs(value)?,
            "package-regex" => self.package_regex = Self::parse_words(value),
            "skip-package" => self.skip_package = Self::parse_attrs(value)?,
            "skip-package-regex" => self.skip_package_regex = Self::parse_words(value),
            "post-result" => self.post_result = Self::parse_bool(key, value)?,
            "print-result" => self.print_result = Self::parse_bool(key, value)?,
            "approve" => self.approve = Self::parse_bool(key, value)?,
            "merge" => self.merge = Self::parse_bool(key, value)?,
            "no-shell" => self.no_shell = Self::parse_bool(key, value)?,
            "run" => {
                self.run_command = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "build-args" => self.build_args = Self::parse_words(value),
            "build-graph" => {
                self.build_graph = match value {
                    "nom" => BuildGraph::Nom,
                    "nix" => BuildGraph::Nix,
                    _ => {
                        return Err(ConfigError::InvalidVariant {
                            key: key.to_string(),
                            value: value.to_string(),
                            expected: "nom, nix",
                        })
                    }
                }
            }
            "sandbox" => self.sandbox = Self::parse_bool(key, value)?,
            "remote" => self.remote = value.to_string(),
            "extra-nixpkgs-config" => {
                self.extra_nixpkgs_config = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "token" => {
                self.token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "include-passthru-tests" => {
                self.include_passthru_tests = Self::parse_bool(key, value)?;
            }
            "allow-aliases" => self.allow_aliases = Self::parse_bool(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_words(value: &str) -> Vec<String> {
        value.split_whitespace().map(str::to_string).collect()
    }

    fn parse_attrs(value: &str) -> Result<Vec<Attribute>, ConfigError> {
        value
            .split_whitespace()
            .map(|w| w.parse::<Attribute>().map_err(ConfigError::Type))
            .collect()
    }

    /// Compile the package selection filters.
    pub fn package_filter(&self) -> Result<PackageFilter, ConfigError> {
        PackageFilter::new(
            &self.package,
            &self.package_regex,
            &self.skip_package,
            &self.skip_package_regex,
        )
        .map_err(|source| ConfigError::InvalidRegex {
            key: "package-regex".to_string(),
            source,
        })
    }

    /// The nixpkgs config attrset the evaluator is invoked with.
    pub fn nixpkgs_config(&self) -> String {
        let mut attrs = vec![
            "allowUnfree = true;".to_string(),
            "checkMeta = true;".to_string(),
            "allowBroken = false;".to_string(),
            format!(
                "allowAliases = {};",
                if self.allow_aliases { "true" } else { "false" }
            ),
        ];
        if let Some(extra) = &self.extra_nixpkgs_config {
            attrs.push(extra.trim().trim_start_matches('{').trim_end_matches('}').trim().to_string());
        }
        format!("{{ {} }}", attrs.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.checkout, Checkout::Merge);
        assert_eq!(config.eval, EvalSource::Auto);
        assert_eq!(config.build_graph, BuildGraph::Nom);
        assert!(config.allow_aliases);
        assert!(!config.include_passthru_tests);
        assert!(!config.sandbox);
        assert_eq!(config.remote, "https://github.com/NixOS/nixpkgs");
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
checkout=commit
eval=local
build-graph=nix
no-shell=true
build-args="--max-jobs 4"
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.checkout, Checkout::Commit);
        assert_eq!(config.eval, EvalSource::Local);
        assert_eq!(config.build_graph, BuildGraph::Nix);
        assert!(config.no_shell);
        assert_eq!(config.build_args, vec!["--max-jobs", "4"]);
    }

    #[test]
    fn parse_package_lists() {
        let mut config = Config::default();
        config
            .parse_content("package=hello python3Packages.requests\nskip-package=chromium")
            .unwrap();
        assert_eq!(config.package.len(), 2);
        assert_eq!(config.skip_package[0].as_str(), "chromium");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut config = Config::default();
        let err = config.parse_content("frobnicate=yes").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "frobnicate"));
    }

    #[test]
    fn invalid_variant_is_an_error() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("checkout=rebase"),
            Err(ConfigError::InvalidVariant { .. })
        ));
    }

    #[test]
    fn invalid_attribute_in_package_list_is_an_error() {
        let mut config = Config::default();
        assert!(config.parse_content("package=..bad").is_err());
    }

    #[test]
    fn nixpkgs_config_pins_review_settings() {
        let config = Config::default();
        let expr = config.nixpkgs_config();
        assert!(expr.contains("allowUnfree = true;"));
        assert!(expr.contains("checkMeta = true;"));
        assert!(expr.contains("allowBroken = false;"));
        assert!(expr.contains("allowAliases = true;"));
    }

    #[test]
    fn nixpkgs_config_merges_extra_attrs() {
        let config = Config {
            extra_nixpkgs_config: Some("{ cudaSupport = true; }".to_string()),
            allow_aliases: false,
            ..Config::default()
        };
        let expr = config.nixpkgs_config();
        assert!(expr.contains("cudaSupport = true;"));
        assert!(expr.contains("allowAliases = false;"));
    }

    #[test]
    fn token_is_not_serialized() {
        let config = Config {
            token: Some("ghp_secret".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("ghp_secret"));
    }
}
