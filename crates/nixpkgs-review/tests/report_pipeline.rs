//! End-to-end checks of the aggregation and report layer: outcome sets stay
//! disjoint and sorted, report.json matches the published schema, and the
//! results tree only links what was built.

use std::collections::BTreeMap;
use std::path::PathBuf;

use review_core::report::{write_attr_list, write_results_tree};
use review_core::{Attribute, Config, Outcome, Report, ReviewResult, System};
use tempfile::TempDir;

fn attr(s: &str) -> Attribute {
    s.parse().unwrap()
}

fn review_with_every_outcome(system: &System) -> ReviewResult {
    let mut result = ReviewResult::default();
    let entry = result.system_mut(system);
    entry.classify(attr("zpkg"), Outcome::Built);
    entry.classify(attr("apkg"), Outcome::Built);
    entry.classify(attr("fail1"), Outcome::Failed);
    entry.classify(attr("cursed"), Outcome::Broken);
    entry.classify(attr("evil"), Outcome::Blacklisted);
    entry.classify(attr("ghost"), Outcome::NonExistent);
    entry.classify(attr("apkg.passthru.tests.smoke"), Outcome::Test);
    result
}

#[test]
fn outcome_sets_are_disjoint_sorted_and_complete() {
    let system = System::new("x86_64-linux");
    let result = review_with_every_outcome(&system);
    let entry = &result.systems[&system];

    // Every attribute appears in exactly one outcome set.
    let mut seen = Vec::new();
    for outcome in Outcome::ALL {
        for a in entry.set(outcome) {
            assert_eq!(entry.outcome_of(a), Some(outcome));
            seen.push(a.clone());
        }
    }
    assert_eq!(seen.len(), entry.len());

    // Sets serialize sorted ascending with no duplicates.
    let json = serde_json::to_value(entry).unwrap();
    let built: Vec<String> = serde_json::from_value(json["built"].clone()).unwrap();
    let mut sorted = built.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(built, sorted);
    assert_eq!(built, vec!["apkg", "zpkg"]);
}

#[test]
fn report_json_round_trips_with_published_field_names() {
    let system = System::new("x86_64-linux");
    let result = review_with_every_outcome(&system);
    let config = Config::default();
    let report = Report::new(Some(9001), &config, &result);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["pr"], 9001);
    assert_eq!(json["checkout"], "merge");
    for key in [
        "built",
        "failed",
        "broken",
        "blacklisted",
        "non-existent",
        "tests",
    ] {
        assert!(
            json["result"]["x86_64-linux"][key].is_array(),
            "missing result key {key}"
        );
    }
    assert_eq!(json["result"]["x86_64-linux"]["non-existent"][0], "ghost");

    // Rerunning the serialisation is bit-identical: the report carries no
    // wall-clock fields.
    let again = serde_json::to_value(&report).unwrap();
    assert_eq!(json, again);
}

#[test]
fn markdown_report_lists_every_category_and_checklist() {
    let system = System::new("x86_64-linux");
    let result = review_with_every_outcome(&system);
    let config = Config::default();
    let report = Report::new(None, &config, &result);

    let tails = BTreeMap::from([(attr("fail1"), "make: *** [all] Error 2".to_string())]);
    let md = report.render_markdown(&tails);

    assert!(md.contains("2 packages built"));
    assert!(md.contains("1 package failed to build"));
    assert!(md.contains("1 package marked as broken and skipped"));
    assert!(md.contains("1 package blacklisted"));
    assert!(md.contains("1 package were not found in the package set"));
    assert!(md.contains("1 passthru test"));
    assert!(md.contains("make: *** [all] Error 2"));
    assert!(md.contains("### Reviewed points"));
}

#[cfg(unix)]
#[test]
fn review_dir_layout_matches_the_contract() {
    let dir = TempDir::new().unwrap();
    let review_dir = dir.path().join("pr-1");
    std::fs::create_dir_all(review_dir.join("logs")).unwrap();

    let system = System::new("x86_64-linux");
    let result = review_with_every_outcome(&system);
    let config = Config::default();
    let report = Report::new(Some(1), &config, &result);
    report.write(&review_dir, &BTreeMap::new()).unwrap();

    // Fake store paths for the built attributes.
    let store = dir.path().join("store");
    std::fs::create_dir_all(store.join("apkg")).unwrap();
    std::fs::create_dir_all(store.join("zpkg")).unwrap();
    let outputs: BTreeMap<Attribute, PathBuf> = BTreeMap::from([
        (attr("apkg"), store.join("apkg")),
        (attr("zpkg"), store.join("zpkg")),
    ]);
    let linked = write_results_tree(&review_dir, &outputs).unwrap();
    write_attr_list(&review_dir.join("attrs"), &linked).unwrap();

    assert!(review_dir.join("report.json").exists());
    assert!(review_dir.join("report.md").exists());
    assert!(review_dir.join("logs").is_dir());

    // Every reported built attribute has a valid results symlink.
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(review_dir.join("report.json")).unwrap())
            .unwrap();
    for built in parsed["result"]["x86_64-linux"]["built"].as_array().unwrap() {
        let link = review_dir.join("results").join(built.as_str().unwrap());
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(link.exists(), "symlink target missing for {built}");
    }

    let attrs = std::fs::read_to_string(review_dir.join("attrs")).unwrap();
    assert_eq!(attrs, "apkg\nzpkg\n");
}
