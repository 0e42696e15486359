//! Whole-tree parsing: malformed files never hide well-formed ones.

use ctxport_parse::{discover, parse_source, parse_tree};
use ctxport_test_utils::TestFixture;
use std::path::Path;

#[test]
fn valid_files_survive_a_malformed_neighbour() {
    let fixture = TestFixture::new().unwrap();
    fixture
        .write_agent_xml("alpha", "  <model>sonnet</model>")
        .unwrap();
    fixture
        .write_agent_xml("beta", "  <tools>bash</tools>")
        .unwrap();
    fixture
        .write_command_md("deploy.md", "Ship it", "Deploy $ARGUMENTS")
        .unwrap();
    fixture
        .write_source("agents/broken.xml", "<agent>\n  <model>opus</model>\n")
        .unwrap();

    let outcome = parse_source(&fixture.source).unwrap();

    assert_eq!(outcome.ir.agents.len(), 2);
    assert_eq!(outcome.ir.commands.len(), 1);
    assert_eq!(outcome.errors.len(), 1);
    let err = &outcome.errors[0];
    assert_eq!(err.file, Path::new("agents/broken.xml"));
    assert_eq!(err.line, Some(1));
}

#[test]
fn entities_are_ordered_by_sorted_source_path() {
    let fixture = TestFixture::new().unwrap();
    for name in ["zeta", "alpha", "mid"] {
        fixture.write_agent_xml(name, "").unwrap();
    }

    let outcome = parse_source(&fixture.source).unwrap();
    let names: Vec<_> = outcome.ir.agents.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

#[test]
fn every_format_contributes_to_one_ir() {
    let fixture = TestFixture::new().unwrap();
    fixture
        .write_agent_xml("qa-agent", "  <tools><tool>bash</tool></tools>")
        .unwrap();
    fixture
        .write_command_md("git/commit.md", "Commit", "Write a commit message")
        .unwrap();
    fixture
        .write_json(
            "models.json",
            r#"{"models": [{"name": "fast", "provider": "openai"}, {"provider": "x"}]}"#,
        )
        .unwrap();
    fixture
        .write_json(
            "settings.json",
            r#"{"permissions": {"bash": "ask"}, "keybindings": {"quit": "ctrl+q"}}"#,
        )
        .unwrap();
    fixture.write_source("README.txt", "ignored").unwrap();

    let outcome = parse_source(&fixture.source).unwrap();
    let ir = &outcome.ir;

    assert_eq!(ir.agents[0].name, "qa-agent");
    assert_eq!(ir.commands[0].name, "git:commit");
    assert_eq!(ir.models.len(), 1);
    assert_eq!(ir.config.keybindings["quit"], "ctrl+q");
    assert!(ir.config.permissions.contains_key("bash"));
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].file, Path::new("models.json"));
}

#[test]
fn parallel_parse_matches_repeated_runs() {
    let fixture = TestFixture::new().unwrap();
    for i in 0..40 {
        fixture
            .write_agent_xml(&format!("agent-{i:02}"), "  <model>haiku</model>")
            .unwrap();
        fixture
            .write_source(&format!("agents/bad-{i:02}.xml"), "<agent>")
            .unwrap();
    }

    let tree = discover(&fixture.source).unwrap();
    let first = parse_tree(&tree);
    let second = parse_tree(&tree);
    assert_eq!(first.ir.agents, second.ir.agents);
    assert_eq!(first.errors, second.errors);
    assert_eq!(first.ir.agents.len(), 40);
    assert_eq!(first.errors.len(), 40);
}

#[test]
fn ir_round_trips_through_json() {
    let fixture = TestFixture::new().unwrap();
    fixture
        .write_agent_xml("qa-agent", "  <temperature>0.5</temperature>")
        .unwrap();

    let ir = parse_source(&fixture.source).unwrap().ir;
    let json = ir.to_json_pretty().unwrap();
    assert_eq!(ctxport_ir::Ir::from_json(&json).unwrap(), ir);
}

#[test]
fn cdata_quoting_its_own_close_tag_still_parses() {
    let fixture = TestFixture::new().unwrap();
    fixture
        .write_agent_xml(
            "x",
            "  <system-prompt><![CDATA[Write </system-prompt> verbatim]]></system-prompt>",
        )
        .unwrap();

    let outcome = parse_tree(&discover(&fixture.source).unwrap());

    assert!(outcome.errors.is_empty(), "{:?}", outcome.errors);
    assert_eq!(outcome.ir.agents.len(), 1);
    assert_eq!(
        outcome.ir.agents[0].system_prompt.as_deref(),
        Some("Write </system-prompt> verbatim")
    );
}
