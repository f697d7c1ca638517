//! Chain analysis and commit over a scratch image directory.

use savior_common::SaviorError;
use savior_engine::testing::MemoryImageTool;
use savior_engine::{analyze_chains, commit_chains};
use std::path::Path;

fn touch(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), b"").unwrap();
    }
}

#[tokio::test]
async fn test_analyze_skips_settings_and_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["base", "mid", "leaf", "web.json", "leaf.tmp"]);
    std::fs::create_dir(dir.path().join("nested")).unwrap();

    let tool = MemoryImageTool::new()
        .with_image("base", None)
        .with_image("mid", Some("base"))
        .with_image("leaf", Some("mid"));

    let chains = analyze_chains(&tool, dir.path()).await.unwrap();

    assert_eq!(chains.len(), 1);
    assert_eq!(chains["base"].images(), ["base", "mid", "leaf"]);
    assert!(!tool.calls().iter().any(|call| call.contains('.')));
}

#[tokio::test]
async fn test_commit_runs_leaf_first_and_never_commits_base() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["a0", "a1", "a2", "b0"]);

    let tool = MemoryImageTool::new()
        .with_image("a0", None)
        .with_image("a1", Some("a0"))
        .with_image("a2", Some("a1"))
        .with_image("b0", None);

    let chains = commit_chains(&tool, dir.path()).await.unwrap();
    assert_eq!(chains.len(), 2);

    let commits: Vec<String> = tool
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("commit"))
        .collect();
    assert_eq!(commits, ["commit a2", "commit a1"]);
}

#[tokio::test]
async fn test_commit_rewrites_path_backing_references() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["base", "top"]);

    let tool = MemoryImageTool::new()
        .with_image("base", None)
        .with_image("top", Some("../images/old-domain/base"));

    commit_chains(&tool, dir.path()).await.unwrap();

    let calls = tool.calls();
    let rebase = calls.iter().position(|c| c == "rebase top").unwrap();
    let commit = calls.iter().position(|c| c == "commit top").unwrap();
    assert!(rebase < commit);
    assert!(!calls.iter().any(|c| c == "rebase base"));
}

#[tokio::test]
async fn test_commit_aborts_on_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["a0", "a1", "a2", "b0", "b1"]);

    let tool = MemoryImageTool::new()
        .with_image("a0", None)
        .with_image("a1", Some("a0"))
        .with_image("a2", Some("a1"))
        .with_image("b0", None)
        .with_image("b1", Some("b0"))
        .failing_on("commit", "a2");

    let err = commit_chains(&tool, dir.path()).await.unwrap_err();
    assert!(matches!(err, SaviorError::ImageTool(_)));

    let commits: Vec<String> = tool
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("commit"))
        .collect();
    assert_eq!(commits, ["commit a2"]);
}

#[tokio::test]
async fn test_missing_intermediate_stops_before_commit() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), &["a0", "a2"]);

    let tool = MemoryImageTool::new()
        .with_image("a0", None)
        .with_image("a2", Some("a1"));

    let err = commit_chains(&tool, dir.path()).await.unwrap_err();
    assert!(err.is_input_inconsistency());
    assert!(!tool.calls().iter().any(|call| call.starts_with("commit")));
}
