//! Review report: JSON schema, markdown rendering, results symlink tree.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::types::{Attribute, Outcome, ReviewResult, System, SystemResult};

/// Checklist appended to every posted report.
const REVIEWED_POINTS: &[&str] = &[
    "package name fits guidelines",
    "package version fits guidelines",
    "package builds on the reviewed platforms",
    "executables tested on the reviewed platforms",
    "meta fields are accurate",
];

/// The on-disk `report.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<u64>,
    pub systems: Vec<String>,
    pub checkout: String,
    #[serde(
        rename = "extraNixpkgsConfig",
        skip_serializing_if = "Option::is_none"
    )]
    pub extra_nixpkgs_config: Option<String>,
    pub result: BTreeMap<String, SystemResult>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Report {
    pub fn new(pr: Option<u64>, config: &Config, result: &ReviewResult) -> Self {
        Self {
            pr,
            systems: config.systems.iter().map(ToString::to_string).collect(),
            checkout: config.checkout.as_str().to_string(),
            extra_nixpkgs_config: config.extra_nixpkgs_config.clone(),
            result: result
                .systems
                .iter()
                .map(|(system, r)| (system.to_string(), r.clone()))
                .collect(),
            incomplete: result.incomplete,
        }
    }

    /// Write `report.json` and `report.md` into the review directory.
    pub fn write(
        &self,
        review_dir: &Path,
        log_tails: &BTreeMap<Attribute, String>,
    ) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(review_dir.join("report.json"), json)?;
        std::fs::write(review_dir.join("report.md"), self.render_markdown(log_tails))?;
        Ok(())
    }

    /// Render the human-readable markdown report.
    ///
    /// Single-system reports collapse the system axis; multi-system reports
    /// get one section per system.
    pub fn render_markdown(&self, log_tails: &BTreeMap<Attribute, String>) -> String {
        let mut md = String::new();
        match self.pr {
            Some(n) => md.push_str(&format!(
                "## `nixpkgs-review pr {n}` run on {}\n\n",
                self.systems.join(", ")
            )),
            None => md.push_str(&format!(
                "## `nixpkgs-review` run on {}\n\n",
                self.systems.join(", ")
            )),
        }
        if self.incomplete {
            md.push_str("**Interrupted: partial results only.**\n\n");
        }

        let single_system = self.result.len() == 1;
        for (system, result) in &self.result {
            if !single_system {
                md.push_str(&format!("### `{system}`\n\n"));
            }
            for outcome in Outcome::ALL {
                let set = result.set(outcome);
                if set.is_empty() {
                    continue;
                }
                md.push_str(&render_category(outcome, set, log_tails));
            }
        }

        md.push_str("---\n### Reviewed points\n");
        for point in REVIEWED_POINTS {
            md.push_str(&format!("- [ ] {point}\n"));
        }
        md
    }
}

fn category_label(outcome: Outcome, count: usize) -> String {
    let plural = if count == 1 { "package" } else { "packages" };
    match outcome {
        Outcome::Built => format!("{count} {plural} built"),
        Outcome::Failed => format!("{count} {plural} failed to build"),
        Outcome::Broken => format!("{count} {plural} marked as broken and skipped"),
        Outcome::Blacklisted => format!("{count} {plural} blacklisted"),
        Outcome::NonExistent => {
            format!("{count} {plural} were not found in the package set")
        }
        Outcome::Test => format!("{count} passthru {}", if count == 1 { "test" } else { "tests" }),
    }
}

fn render_category(
    outcome: Outcome,
    attrs: &std::collections::BTreeSet<Attribute>,
    log_tails: &BTreeMap<Attribute, String>,
) -> String {
    let mut md = String::new();
    md.push_str("<details>\n");
    md.push_str(&format!(
        "  <summary>{}:</summary>\n\n",
        category_label(outcome, attrs.len())
    ));
    for attr in attrs {
        md.push_str(&format!("  - {attr}\n"));
        if outcome == Outcome::Failed {
            if let Some(tail) = log_tails.get(attr) {
                if !tail.trim().is_empty() {
                    md.push_str("\n    <details>\n      <summary>build log</summary>\n\n");
                    md.push_str("    ```\n");
                    for line in tail.lines() {
                        md.push_str(&format!("    {line}\n"));
                    }
                    md.push_str("    ```\n    </details>\n");
                }
            }
        }
    }
    md.push_str("</details>\n\n");
    md
}

/// Create `results/<attr>` symlinks for every built attribute.
///
/// Existing links are replaced so a rerun refreshes the tree. Returns the
/// attributes that were actually linked.
pub fn write_results_tree(
    review_dir: &Path,
    outputs: &BTreeMap<Attribute, PathBuf>,
) -> std::io::Result<Vec<Attribute>> {
    let results = review_dir.join("results");
    std::fs::create_dir_all(&results)?;
    let mut linked = Vec::new();
    for (attr, target) in outputs {
        let link = results.join(attr.file_name());
        match std::fs::symlink_metadata(&link) {
            Ok(_) => std::fs::remove_file(&link)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &link)?;
        linked.push(attr.clone());
    }
    Ok(linked)
}

/// Append one line per attribute to a plain-text list the shell hook reads.
pub fn write_attr_list(path: &Path, attrs: &[Attribute]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    for attr in attrs {
        writeln!(file, "{attr}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReviewResult;
    use tempfile::TempDir;

    fn attr(s: &str) -> Attribute {
        s.parse().unwrap()
    }

    fn sample_result(system: &str) -> ReviewResult {
        let mut result = ReviewResult::default();
        let sys = System::new(system);
        let r = result.system_mut(&sys);
        r.classify(attr("pkg1"), Outcome::Built);
        r.classify(attr("pkg2"), Outcome::Failed);
        r.classify(attr("ghost"), Outcome::NonExistent);
        result
    }

    #[test]
    fn report_json_schema_round_trips() {
        let config = Config::default();
        let report = Report::new(Some(42), &config, &sample_result("x86_64-linux"));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["pr"], 42);
        assert_eq!(json["checkout"], "merge");
        let system = &json["result"]["x86_64-linux"];
        assert_eq!(system["built"][0], "pkg1");
        assert_eq!(system["failed"][0], "pkg2");
        assert_eq!(system["non-existent"][0], "ghost");
        // Lists are present for every category.
        assert!(system["broken"].as_array().unwrap().is_empty());
        assert!(system["blacklisted"].as_array().unwrap().is_empty());
        assert!(system["tests"].as_array().unwrap().is_empty());

        let back: Report = serde_json::from_value(json).unwrap();
        assert_eq!(back.pr, Some(42));
    }

    #[test]
    fn incomplete_flag_only_serialized_when_set() {
        let config = Config::default();
        let mut result = sample_result("x86_64-linux");
        let report = Report::new(None, &config, &result);
        assert!(!serde_json::to_string(&report).unwrap().contains("incomplete"));

        result.incomplete = true;
        let report = Report::new(None, &config, &result);
        assert!(serde_json::to_string(&report).unwrap().contains("incomplete"));
    }

    #[test]
    fn markdown_collapses_single_system() {
        let config = Config::default();
        let report = Report::new(Some(7), &config, &sample_result("x86_64-linux"));
        let md = report.render_markdown(&BTreeMap::new());
        assert!(md.contains("`nixpkgs-review pr 7`"));
        // No per-system heading for a single system.
        assert!(!md.contains("### `x86_64-linux`"));
        assert!(md.contains("1 package built"));
        assert!(md.contains("1 package failed to build"));
        assert!(md.contains("- [ ] package builds on the reviewed platforms"));
    }

    #[test]
    fn markdown_keeps_system_sections_for_multi_system() {
        let config = Config::default();
        let mut result = sample_result("x86_64-linux");
        result
            .system_mut(&System::new("aarch64-linux"))
            .classify(attr("pkg1"), Outcome::Failed);
        let report = Report::new(None, &config, &result);
        let md = report.render_markdown(&BTreeMap::new());
        assert!(md.contains("### `x86_64-linux`"));
        assert!(md.contains("### `aarch64-linux`"));
    }

    #[test]
    fn markdown_embeds_failure_log_tail() {
        let config = Config::default();
        let report = Report::new(None, &config, &sample_result("x86_64-linux"));
        let tails = BTreeMap::from([(attr("pkg2"), "error: meltdown\n".to_string())]);
        let md = report.render_markdown(&tails);
        assert!(md.contains("error: meltdown"));
        assert!(md.contains("<summary>build log</summary>"));
    }

    #[test]
    fn write_emits_both_files() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let report = Report::new(Some(1), &config, &sample_result("x86_64-linux"));
        report.write(dir.path(), &BTreeMap::new()).unwrap();
        assert!(dir.path().join("report.json").exists());
        assert!(dir.path().join("report.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn results_tree_links_built_outputs() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("store-pkg1");
        std::fs::create_dir(&store_path).unwrap();

        let outputs = BTreeMap::from([(attr("pkg1"), store_path.clone())]);
        let linked = write_results_tree(dir.path(), &outputs).unwrap();
        assert_eq!(linked, vec![attr("pkg1")]);

        let link = dir.path().join("results/pkg1");
        assert_eq!(std::fs::read_link(&link).unwrap(), store_path);

        // Rerun replaces the link instead of failing.
        write_results_tree(dir.path(), &outputs).unwrap();
    }
}
