//! End-to-end runs over real temporary source and target trees.

use ctxport_ir::{GapCategory, Gaps};
use ctxport_migrate::backup::BackupManager;
use ctxport_migrate::rules::SectionRules;
use ctxport_migrate::{
    ArtifactWriter, FsWriter, Orchestrator, Outcome, RuleSet, RunManifest, RunStatus, Stage,
    TranspileError, TranspileParams,
};
use serde::Serialize;
use ctxport_test_utils::{tree_contents, tree_dirs, TestFixture};
use serde_json::{json, Value};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

fn params(fx: &TestFixture) -> TranspileParams {
    TranspileParams {
        source_root: fx.source.clone(),
        target_root: fx.target.clone(),
        ..Default::default()
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn qa_fixture() -> TestFixture {
    let fx = TestFixture::new().unwrap();
    fx.write_agent_xml(
        "qa-agent",
        "  <model>sonnet</model>\n  <tools>\n    <tool>bash</tool>\n    <tool>read</tool>\n  </tools>",
    )
    .unwrap();
    fx.write_source(
        "agents/broken.xml",
        "<agent>\n  <model>haiku</model>\n</agent>\n",
    )
    .unwrap();
    fx
}

#[test]
fn qa_agent_scenario() {
    let fx = qa_fixture();
    let report = Orchestrator::new().run(&params(&fx)).unwrap();

    assert_eq!(report.status(), RunStatus::SuccessWithWarnings);
    assert_eq!(report.parse_errors.len(), 1);
    assert_eq!(
        report.parse_errors[0].file,
        Path::new("agents/broken.xml")
    );

    let tools = report
        .gaps
        .approximation("agents.qa-agent.tools")
        .expect("tools approximation recorded");
    assert_eq!(tools.category, GapCategory::PlatformDifference);
    assert_eq!(tools.substituted, json!(["bash", "read"]));
    assert!(report.gaps.unmapped_field("agents.qa-agent.tools").is_none());

    let agents = read_json(&fx.target.join("agents.json"));
    let list = agents["agents"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], json!("qa-agent"));
    assert_eq!(list[0]["tools"], json!(["bash", "read"]));
    assert_eq!(list[0]["model"], json!("anthropic/claude-sonnet-4-5"));
    assert_eq!(list[0]["temperature"], json!(0.7));
}

#[test]
fn second_run_is_a_no_op_until_forced() {
    let fx = qa_fixture();
    let orchestrator = Orchestrator::new();

    let first = orchestrator.run(&params(&fx)).unwrap();
    assert_eq!(first.outcome, Outcome::Written);
    let after_first = tree_contents(&fx.target);

    let second = orchestrator.run(&params(&fx)).unwrap();
    assert_eq!(second.outcome, Outcome::Skipped);
    assert_eq!(tree_contents(&fx.target), after_first);

    let forced = orchestrator
        .run(&TranspileParams {
            force: true,
            ..params(&fx)
        })
        .unwrap();
    assert_eq!(forced.outcome, Outcome::Written);
    assert_eq!(forced.decision_reason, "forced");
    assert_eq!(forced.output_hash, first.output_hash);
}

#[test]
fn source_edit_and_deleted_artifact_trigger_regeneration() {
    let fx = qa_fixture();
    let orchestrator = Orchestrator::new();
    orchestrator.run(&params(&fx)).unwrap();

    fx.write_command_md("deploy.md", "Deploy", "Deploy $ARGUMENTS\n")
        .unwrap();
    let changed = orchestrator.run(&params(&fx)).unwrap();
    assert_eq!(changed.decision_reason, "source changed");
    assert!(fx.target.join("commands.json").is_file());

    std::fs::remove_file(fx.target.join("commands.json")).unwrap();
    let repaired = orchestrator.run(&params(&fx)).unwrap();
    assert_eq!(
        repaired.decision_reason,
        "target artifacts missing: commands.json"
    );
    assert!(fx.target.join("commands.json").is_file());
}

#[test]
fn override_changes_only_the_overridden_leaf() {
    let fx = TestFixture::new().unwrap();
    fx.write_agent_xml("alpha", "  <model>opus</model>").unwrap();
    fx.write_agent_xml("beta", "  <model>haiku</model>\n  <description>Second</description>")
        .unwrap();
    fx.write_agent_xml("gamma", "  <temperature>0.5</temperature>")
        .unwrap();
    let rules = fx.tempdir.path().join("rules.toml");
    std::fs::write(&rules, "[agents.defaults]\ntemperature = 0.25\n").unwrap();

    let baseline_target = fx.tempdir.path().join("baseline");
    Orchestrator::new()
        .run(&TranspileParams {
            target_root: baseline_target.clone(),
            ..params(&fx)
        })
        .unwrap();
    Orchestrator::new()
        .run(&TranspileParams {
            rules_override: Some(rules),
            ..params(&fx)
        })
        .unwrap();

    let baseline = read_json(&baseline_target.join("agents.json"));
    let overridden = read_json(&fx.target.join("agents.json"));
    let (baseline, overridden) = (
        baseline["agents"].as_array().unwrap(),
        overridden["agents"].as_array().unwrap(),
    );
    assert_eq!(baseline.len(), overridden.len());

    for (before, after) in baseline.iter().zip(overridden) {
        let mut before = before.as_object().unwrap().clone();
        let mut after = after.as_object().unwrap().clone();
        if before["name"] == json!("gamma") {
            assert_eq!(after["temperature"], json!(0.5));
        } else {
            assert_eq!(before["temperature"], json!(0.7));
            assert_eq!(after["temperature"], json!(0.25));
        }
        before.remove("temperature");
        after.remove("temperature");
        assert_eq!(before, after);
    }
}

#[test]
fn rules_change_forces_regeneration() {
    let fx = qa_fixture();
    Orchestrator::new().run(&params(&fx)).unwrap();

    let rules = fx.tempdir.path().join("rules.json");
    std::fs::write(&rules, r#"{"agents": {"defaults": {"temperature": 0.1}}}"#).unwrap();
    let report = Orchestrator::new()
        .run(&TranspileParams {
            rules_override: Some(rules),
            ..params(&fx)
        })
        .unwrap();

    assert_eq!(report.decision_reason, "rules changed");
    let agents = read_json(&fx.target.join("agents.json"));
    assert_eq!(agents["agents"][0]["temperature"], json!(0.1));
}

/// Writes through to disk until the `fail_at`-th call.
struct FailingWriter {
    fail_at: usize,
    calls: AtomicUsize,
}

impl FailingWriter {
    fn new(fail_at: usize) -> Self {
        Self {
            fail_at,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ArtifactWriter for FailingWriter {
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            return Err(io::Error::other("simulated crash"));
        }
        FsWriter.write(path, contents)
    }
}

fn rich_fixture() -> TestFixture {
    let fx = qa_fixture();
    fx.write_command_md("git/commit.md", "Commit", "Commit with {{message}}\n")
        .unwrap();
    fx.write_json(
        "settings.json",
        r#"{"theme": {"name": "dark"}, "keybindings": {"submit": "ctrl+enter"}}"#,
    )
    .unwrap();
    fx.write_json(
        "models.json",
        r#"{"models": [{"name": "fast", "provider": "anthropic"}]}"#,
    )
    .unwrap();
    fx
}

#[test]
fn any_injected_failure_leaves_the_target_untouched() {
    // Four artifacts plus the manifest: fail at each write in turn.
    for fail_at in 1..=5 {
        let fx = rich_fixture();
        fx.write_target("agents.json", "{\"agents\": []}\n").unwrap();
        fx.write_target("settings.json", "{}\n").unwrap();
        let before = tree_contents(&fx.target);
        let dirs_before = tree_dirs(&fx.target);

        let err = Orchestrator::with_writer(FailingWriter::new(fail_at))
            .run(&params(&fx))
            .unwrap_err();

        let expected = if fail_at == 5 {
            Stage::PersistManifest
        } else {
            Stage::Write
        };
        match err {
            TranspileError::RolledBack { stage, .. } => assert_eq!(stage, expected),
            other => panic!("expected rollback at write {fail_at}, got {other}"),
        }
        assert_eq!(tree_contents(&fx.target), before, "write {fail_at}");
        assert_eq!(tree_dirs(&fx.target), dirs_before, "write {fail_at}");
    }
}

#[test]
fn snapshot_restores_pre_run_state_after_success() {
    let fx = rich_fixture();
    fx.write_target("settings.json", "{\"theme\": \"light\"}\n")
        .unwrap();
    let before = tree_contents(&fx.target);

    let report = Orchestrator::new().run(&params(&fx)).unwrap();
    let snapshot_dir = report.backup.expect("snapshot taken");

    let manager = BackupManager::new(&fx.target);
    let restored = manager.restore(&snapshot_dir).unwrap();
    assert_eq!(restored.restored, vec![Path::new("settings.json")]);
    assert!(restored.removed.iter().any(|p| p == Path::new("agents.json")));

    let after: std::collections::BTreeMap<_, _> = tree_contents(&fx.target)
        .into_iter()
        .filter(|(path, _)| !path.starts_with(".ctxport"))
        .collect();
    assert_eq!(after, before);
    assert!(RunManifest::load(&RunManifest::path_in(&fx.target))
        .unwrap()
        .is_none());
}

#[test]
fn dry_run_reports_diffs_against_existing_artifacts() {
    let fx = rich_fixture();
    fx.write_target("settings.json", "{\"theme\": \"light\"}\n")
        .unwrap();
    let before = tree_contents(&fx.target);

    let report = Orchestrator::new()
        .run(&TranspileParams {
            dry_run: true,
            ..params(&fx)
        })
        .unwrap();

    assert_eq!(report.outcome, Outcome::DryRun);
    let settings = report
        .changes
        .iter()
        .find(|c| c.artifact == "settings.json")
        .unwrap();
    assert!(settings.diff.contains("-{\"theme\": \"light\"}"));
    assert!(settings.diff.contains("+"));
    assert_eq!(tree_contents(&fx.target), before);
}

/// `(field, key, value)` for every IR leaf; object values count per key.
fn leaves(entity: &Value) -> Vec<(String, Option<String>, Value)> {
    let mut out = Vec::new();
    for (field, value) in entity.as_object().unwrap() {
        if matches!(field.as_str(), "name" | "source_file" | "origins") {
            continue;
        }
        match value {
            Value::Object(map) => out.extend(
                map.iter()
                    .map(|(k, v)| (field.clone(), Some(k.clone()), v.clone())),
            ),
            other => out.push((field.clone(), None, other.clone())),
        }
    }
    out
}

fn to_values<T: Serialize>(items: &[T]) -> Vec<Value> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).unwrap())
        .collect()
}

/// The leaf shows up under its target field, or inside the container it folds into.
fn emitted_has(
    rules: &SectionRules,
    emitted: &Value,
    field: &str,
    key: Option<&str>,
    value: &Value,
) -> bool {
    let target = rules.renames.get(field).map_or(field, String::as_str);
    let container = rules.folds.get(field).map(String::as_str);
    match key {
        None => {
            emitted.get(target).is_some_and(|v| !v.is_null())
                || container.is_some_and(|c| emitted[c][field] == *value)
        }
        Some(key) => [Some(target), container]
            .into_iter()
            .flatten()
            .any(|c| emitted[c][key] == *value),
    }
}

fn has_gap(gaps: &Gaps, field: &str, file: &Path) -> bool {
    gaps.unmapped
        .iter()
        .any(|g| g.field == field && g.source_file == file)
        || gaps
            .approximations
            .iter()
            .any(|g| g.field == field && g.source_file == file)
}

fn emitted_entity<'a>(doc: &'a Value, section: &str, name: &str, gaps: &Gaps) -> &'a Value {
    let target_name = gaps
        .approximation(&format!("{section}.{name}.name"))
        .and_then(|g| g.substituted.as_str())
        .unwrap_or(name);
    doc[section]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == target_name)
        .unwrap_or_else(|| panic!("{section}.{name} missing from the target"))
}

#[test]
fn every_ir_field_is_emitted_or_reported_as_a_gap() {
    let fx = rich_fixture();
    fx.write_agent_xml(
        "writer",
        "  <description>Drafts docs</description>\n  <model>opus</model>\n  \
         <max-tokens>4096</max-tokens>\n  <system-prompt>Write clearly.</system-prompt>\n  \
         <color>blue</color>",
    )
    .unwrap();
    fx.write_source(
        "commands/review.xml",
        "<command>\n  <name>review</name>\n  <agent>qa-agent</agent>\n  \
         <template>Review {{path}}</template>\n  <priority>high</priority>\n  \
         <variables><variable name=\"path\" type=\"string\" required=\"true\"/></variables>\n\
         </command>\n",
    )
    .unwrap();
    fx.write_json(
        "models.json",
        r#"{"models": [{"name": "fast", "provider": "anthropic", "endpoint": "https://api.example.com", "context": 200000}],
            "provider_defaults": {"retries": 2}}"#,
    )
    .unwrap();
    fx.write_json(
        "settings.json",
        r#"{"theme": {"name": "dark"}, "keybindings": {"submit": "ctrl+enter"},
            "permissions": {"bash": true, "edit": "ask"}, "telemetry": false}"#,
    )
    .unwrap();

    let ir = ctxport_parse::parse_source(&fx.source).unwrap().ir;
    let report = Orchestrator::new().run(&params(&fx)).unwrap();
    let rules = RuleSet::builtin();
    let gaps = &report.gaps;
    let mut checked = 0;

    for (section, rules, entities) in [
        ("agents", &rules.agents, to_values(&ir.agents)),
        ("commands", &rules.commands, to_values(&ir.commands)),
        ("models", &rules.models, to_values(&ir.models)),
    ] {
        let doc = read_json(&fx.target.join(format!("{section}.json")));
        for entity in &entities {
            let name = entity["name"].as_str().unwrap();
            let file = Path::new(entity["source_file"].as_str().unwrap());
            let emitted = emitted_entity(&doc, section, name, gaps);
            for (field, key, value) in leaves(entity) {
                let path = match &key {
                    Some(key) => format!("{section}.{name}.{field}.{key}"),
                    None => format!("{section}.{name}.{field}"),
                };
                assert!(
                    emitted_has(rules, emitted, &field, key.as_deref(), &value)
                        || has_gap(gaps, &path, file),
                    "{path} from {} was silently dropped",
                    file.display()
                );
                checked += 1;
            }
        }
    }

    let settings = read_json(&fx.target.join("settings.json"));
    let config = serde_json::to_value(&ir.config).unwrap();
    for (field, key, value) in leaves(&config) {
        let key = key.expect("config sections are maps");
        let file = ir.config.origin(&field, &key).unwrap();
        let path = format!("config.{field}.{key}");
        assert!(
            emitted_has(&rules.config, &settings, &field, Some(&key), &value)
                || has_gap(gaps, &path, file),
            "{path} from {} was silently dropped",
            file.display()
        );
        checked += 1;
    }

    assert!(checked >= 20, "only {checked} fields checked");
    assert!(has_gap(
        gaps,
        "config.permissions.edit",
        Path::new("settings.json")
    ));
    assert!(has_gap(
        gaps,
        "config.custom.provider_defaults",
        Path::new("models.json")
    ));
    assert_eq!(settings["custom"]["provider_defaults"], json!({"retries": 2}));
    assert_eq!(settings.get("permissions"), None);
}
