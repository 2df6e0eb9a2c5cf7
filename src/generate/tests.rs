use super::*;
use crate::cleanup::cleanup_generated;
use crate::coverage::EndpointDescriptor;
use crate::test_support::{
    code_turn, project_with_tests, ScriptedEngine, ScriptedRunner, USERS_TEST,
};
use std::fs;

const MARKER: &str = "# GENERATED_BY_AGENT";
const USERS_FILE: &str = "tests/api/test_users.py";

fn settings(max_generations: usize) -> GenerateSettings {
    GenerateSettings {
        max_generations,
        reasoning_timeout: Duration::from_secs(5),
        marker: MARKER.to_string(),
        base_url: "https://jsonplaceholder.typicode.com".to_string(),
    }
}

fn only(resource: &str) -> Catalog {
    let resources: Vec<EndpointDescriptor> = Catalog::builtin()
        .resources
        .into_iter()
        .filter(|r| r.name == resource)
        .collect();
    Catalog { resources }
}

fn candidate(name: &str) -> String {
    format!(
        "def {}(api_client):\n    response = api_client.get(f\"{{BASE_URL}}/users/999\")\n    assert response.status_code == 404\n",
        name
    )
}

fn snapshot_tree(root: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(root.join("tests"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().display().to_string(), fs::read(e.path()).unwrap()))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_quota_bounds_engine_calls() {
    let (dir, config) = project_with_tests();
    let engine = ScriptedEngine::new(
        (0..5)
            .map(|i| code_turn(&candidate(&format!("test_generated_{}", i))))
            .collect(),
    );
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::failing()).unwrap();
    let catalog = only("users");
    assert!(detect_gaps(&catalog, &CoverageIndex::scan(&ws, &config.api_base_url)).len() >= 5);

    let report = Generator::new(&engine, &mut ws, &catalog, settings(2))
        .run()
        .await;

    assert_eq!(engine.calls(), 2);
    assert_eq!(report.attempts_used, 2);
    assert_eq!(report.outcome, SessionOutcome::FailedQuotaExhausted);
    assert!(report.remaining.len() >= 3);
    assert!(report
        .gaps
        .iter()
        .all(|g| g.outcome() == Some(SessionOutcome::FailedRolledBack)));
}

#[tokio::test]
async fn test_syntax_invalid_candidate_never_writes() {
    let (dir, config) = project_with_tests();
    let before = snapshot_tree(dir.path());
    let engine = ScriptedEngine::new(vec![code_turn(
        "def test_get_user_not_found(api_client:\n    assert True\n",
    )]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;

    assert_eq!(report.gaps[0].status, GapStatus::Discarded);
    assert!(report.gaps[0]
        .detail
        .as_deref()
        .unwrap()
        .starts_with("SyntaxInvalid"));
    assert_eq!(snapshot_tree(dir.path()), before);
    assert!(ws.backups().records().is_empty());
    assert!(ws.runner().calls().is_empty());
}

#[tokio::test]
async fn test_failed_generation_rolls_back_only_its_own_insertion() {
    let (dir, config) = project_with_tests();
    let engine = ScriptedEngine::new(vec![
        code_turn(&candidate("test_get_user_not_found")),
        code_turn(&candidate("test_put_user_not_found")),
    ]);
    let runner = ScriptedRunner::new(|selector| Ok(selector.ends_with("::test_get_user_not_found")));
    let mut ws = Workspace::open(dir.path(), &config, runner).unwrap();
    let catalog = only("users");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(2))
        .run()
        .await;

    assert_eq!(report.gaps[0].status, GapStatus::Kept);
    assert_eq!(report.gaps[1].status, GapStatus::RolledBack);
    let content = fs::read_to_string(dir.path().join(USERS_FILE)).unwrap();
    assert!(content.contains(&format!("{}\ndef test_get_user_not_found(", MARKER)));
    assert!(!content.contains("test_put_user_not_found"));
    assert_eq!(content.matches(MARKER).count(), 1);
    assert!(content.starts_with("import requests"));
    assert_eq!(
        ws.runner().calls(),
        vec![
            "tests/api/test_users.py::test_get_user_not_found",
            "tests/api/test_users.py::test_put_user_not_found",
        ]
    );
}

#[tokio::test]
async fn test_duplicate_candidate_is_discarded_without_write() {
    let (dir, config) = project_with_tests();
    let before = snapshot_tree(dir.path());
    let engine = ScriptedEngine::new(vec![code_turn(&candidate("test_get_user"))]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;

    assert_eq!(report.gaps[0].status, GapStatus::Discarded);
    assert_eq!(report.attempts_used, 1);
    assert_eq!(snapshot_tree(dir.path()), before);
}

async fn discard_one(code: &str) -> (GapReport, bool) {
    let (dir, config) = project_with_tests();
    let before = snapshot_tree(dir.path());
    let engine = ScriptedEngine::new(vec![code_turn(code)]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    let mut report = Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;
    let untouched = snapshot_tree(dir.path()) == before
        && ws.backups().records().is_empty()
        && ws.runner().calls().is_empty();
    (report.gaps.remove(0), untouched)
}

#[tokio::test]
async fn test_candidate_with_leading_statements_is_discarded() {
    let code = format!("import pytest\n\n\n{}", candidate("test_get_user_not_found"));
    let (gap, untouched) = discard_one(&code).await;

    assert_eq!(gap.status, GapStatus::Discarded);
    let detail = gap.detail.unwrap();
    assert!(detail.starts_with("SyntaxInvalid"), "{}", detail);
    assert!(detail.contains("import_statement"), "{}", detail);
    assert!(untouched);
}

#[tokio::test]
async fn test_candidate_with_extra_functions_is_discarded() {
    let code = format!(
        "{}\n\ndef test_get_user(api_client):\n    assert True\n",
        candidate("test_get_user_not_found")
    );
    let (gap, untouched) = discard_one(&code).await;

    assert_eq!(gap.status, GapStatus::Discarded);
    let detail = gap.detail.unwrap();
    assert!(detail.contains("more than one function"), "{}", detail);
    assert!(untouched);
}

#[tokio::test]
async fn test_candidate_named_like_target_file_function_is_discarded() {
    let (gap, untouched) = discard_one(&candidate("test_list_users")).await;

    assert_eq!(gap.status, GapStatus::Discarded);
    assert_eq!(gap.function_name.as_deref(), Some("test_list_users"));
    assert!(gap.detail.unwrap().starts_with("duplicate"));
    assert!(untouched);
}

#[tokio::test]
async fn test_kept_candidate_is_removed_by_cleanup() {
    let (dir, config) = project_with_tests();
    let code = format!(
        "{}\n# note\n@pytest.mark.api\ndef test_get_user_not_found(api_client):\n    body = \"\"\"\nfirst\n\"\"\"\n    assert body\n",
        MARKER
    );
    let engine = ScriptedEngine::new(vec![code_turn(&code)]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;

    assert_eq!(report.gaps[0].status, GapStatus::Kept);
    let content = fs::read_to_string(dir.path().join(USERS_FILE)).unwrap();
    assert!(content.contains(&format!(
        "{}\n@pytest.mark.api\ndef test_get_user_not_found(",
        MARKER
    )));
    assert!(!content.contains("# note"));
    assert_eq!(content.matches(MARKER).count(), 1);

    let cleaned = cleanup_generated(&mut ws, MARKER, false).unwrap();
    assert_eq!(cleaned[0].removed, 1);
    assert_eq!(
        fs::read_to_string(dir.path().join(USERS_FILE)).unwrap(),
        USERS_TEST
    );
}

#[tokio::test]
async fn test_gap_satisfied_earlier_in_session_is_skipped_for_free() {
    let (dir, config) = project_with_tests();
    // The first accepted test is named for the second gap.
    let engine = ScriptedEngine::new(vec![
        code_turn(&candidate("test_put_user_not_found")),
        code_turn(&candidate("test_patch_user_not_found_case")),
    ]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(2))
        .run()
        .await;

    let statuses: Vec<_> = report.gaps.iter().map(|g| g.status.clone()).collect();
    assert_eq!(
        statuses,
        vec![GapStatus::Kept, GapStatus::Skipped, GapStatus::Kept]
    );
    assert_eq!(report.gaps[1].gap.canonical_name, "test_put_user_not_found");
    assert_eq!(engine.calls(), 2);
    assert_eq!(report.kept().count(), 2);
}

#[tokio::test]
async fn test_new_target_file_is_created_then_removed_on_failure() {
    let (dir, config) = project_with_tests();
    let engine = ScriptedEngine::new(vec![
        code_turn(&candidate("test_get_post_not_found")),
    ]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::failing()).unwrap();
    let catalog = only("posts");

    let report = Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;

    assert_eq!(report.gaps[0].file, "tests/api/test_auth.py");
    assert_eq!(report.gaps[0].status, GapStatus::RolledBack);
    assert!(!dir.path().join("tests/api/test_auth.py").exists());
}

#[tokio::test]
async fn test_engine_receives_exemplars_and_scenario() {
    let (dir, config) = project_with_tests();
    let engine = ScriptedEngine::new(vec![code_turn(&candidate("test_get_user_not_found"))]);
    let mut ws = Workspace::open(dir.path(), &config, ScriptedRunner::passing()).unwrap();
    let catalog = only("users");

    Generator::new(&engine, &mut ws, &catalog, settings(1))
        .run()
        .await;

    let request = &engine.requests()[0];
    assert_eq!(request.task, Task::Generate);
    assert!(request.context.contains("Request: GET /users/{id}"));
    assert!(request.context.contains("Expected status: 404"));
    assert!(request.context.contains("Function name: test_get_user_not_found"));
    let first_exemplar = request.context.find("Exemplar: tests/api/test_users.py").unwrap();
    let second_exemplar = request
        .context
        .find("Exemplar: tests/api/test_resources.py")
        .unwrap();
    assert!(first_exemplar < second_exemplar);
}

#[test]
fn test_ensure_marker_places_single_marker_first() {
    let code = "def test_x():\n    pass";
    assert_eq!(ensure_marker(code, MARKER), format!("{}\n{}", MARKER, code));
    let already = format!("{}\n{}", MARKER, code);
    assert_eq!(ensure_marker(&already, MARKER), already);
    let misplaced = format!("{}\n{}\n", code, MARKER);
    assert_eq!(ensure_marker(&misplaced, MARKER), format!("{}\n{}", MARKER, code));
}

#[test]
fn test_insert_block_separates_with_two_blank_lines() {
    assert_eq!(
        insert_block("a = 1\n", "# m\ndef test_x():\n    pass"),
        "a = 1\n\n\n# m\ndef test_x():\n    pass\n"
    );
    assert_eq!(insert_block("", "def test_x():\n    pass\n"), "def test_x():\n    pass\n");
}
