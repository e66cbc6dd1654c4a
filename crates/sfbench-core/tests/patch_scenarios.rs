//! End-to-end patch pipeline scenarios against real git repositories.

use sfbench_core::{apply_patch, clean_patch, SfBenchError};
use std::path::Path;
use std::process::Command;

fn run_git(repo_dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn make_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    run_git(dir.path(), &["init", "-b", "main"]);
    run_git(dir.path(), &["config", "user.name", "test-user"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["add", "-A"]);
    run_git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

const TRIGGER_DIFF: &str = "\
diff --git a/force-app/main/default/triggers/AccountTrigger.trigger b/force-app/main/default/triggers/AccountTrigger.trigger
--- a/force-app/main/default/triggers/AccountTrigger.trigger
+++ b/force-app/main/default/triggers/AccountTrigger.trigger
@@ -1,3 +1,4 @@
 trigger AccountTrigger on Account (before insert) {
+    AccountHandler.handle(Trigger.new);
     // existing logic
 }
";

const TRIGGER_FILE: &str = "\
trigger AccountTrigger on Account (before insert) {
    // existing logic
}
";

#[tokio::test]
async fn clean_patch_survives_model_noise() {
    let noisy = format!(
        "Sure! Here's how to fix the trigger:\n\n\
         1. Add the handler call\n\n\
         ```diff\n{TRIGGER_DIFF}```\n\n\
         This delegates the logic to the handler class."
    );
    let cleaned = clean_patch(&noisy);

    assert!(cleaned.starts_with("diff --git"));
    assert!(cleaned.contains("+    AccountHandler.handle(Trigger.new);"));
    assert!(!cleaned.contains("Sure!"));
    assert!(!cleaned.contains("```"));
    assert!(!cleaned.contains("delegates"));
    // Idempotent over the noisy input's cleaned form.
    assert_eq!(clean_patch(&cleaned), cleaned);
}

#[tokio::test]
async fn noisy_patch_applies_to_real_repo() {
    let repo = make_repo(&[(
        "force-app/main/default/triggers/AccountTrigger.trigger",
        TRIGGER_FILE,
    )]);

    let noisy = format!("```diff\n{TRIGGER_DIFF}```\n");
    apply_patch(repo.path(), &noisy, 60).await.unwrap();

    let patched = std::fs::read_to_string(
        repo.path()
            .join("force-app/main/default/triggers/AccountTrigger.trigger"),
    )
    .unwrap();
    assert!(patched.contains("AccountHandler.handle(Trigger.new);"));
}

#[tokio::test]
async fn prose_solution_fails_before_any_git_call() {
    // No git repository at all: rejection happens in the pipeline.
    let dir = tempfile::tempdir().unwrap();
    let err = apply_patch(dir.path(), "hello world", 60).await.unwrap_err();

    match err {
        SfBenchError::PatchApplication(msg) => {
            assert!(msg.contains("does not contain valid diff"))
        }
        other => panic!("expected PatchApplication, got {other:?}"),
    }
}

#[tokio::test]
async fn whitespace_damaged_patch_applies_via_fallback() {
    let repo = make_repo(&[(
        "force-app/main/default/triggers/AccountTrigger.trigger",
        TRIGGER_FILE,
    )]);

    // Trailing whitespace on context lines trips strict apply; the
    // whitespace-tolerant strategies recover it.
    let damaged = TRIGGER_DIFF.replace(
        " trigger AccountTrigger on Account (before insert) {",
        " trigger AccountTrigger on Account (before insert) {   ",
    );
    apply_patch(repo.path(), &damaged, 60).await.unwrap();

    let patched = std::fs::read_to_string(
        repo.path()
            .join("force-app/main/default/triggers/AccountTrigger.trigger"),
    )
    .unwrap();
    assert!(patched.contains("AccountHandler.handle"));
}

#[tokio::test]
async fn truncated_final_hunk_is_repaired() {
    let repo = make_repo(&[(
        "force-app/main/default/triggers/AccountTrigger.trigger",
        TRIGGER_FILE,
    )]);

    // Model output cut off right after a new hunk header.
    let truncated = format!("{TRIGGER_DIFF}@@ -10,3 +11,3 @@\n");
    apply_patch(repo.path(), &truncated, 60).await.unwrap();

    let patched = std::fs::read_to_string(
        repo.path()
            .join("force-app/main/default/triggers/AccountTrigger.trigger"),
    )
    .unwrap();
    assert!(patched.contains("AccountHandler.handle"));
}

#[tokio::test]
async fn second_diff_and_explanations_are_dropped() {
    let repo = make_repo(&[(
        "force-app/main/default/triggers/AccountTrigger.trigger",
        TRIGGER_FILE,
    )]);

    let multi = format!(
        "{TRIGGER_DIFF}\n\
         And here is an alternative approach:\n\
         diff --git a/other.cls b/other.cls\n\
         --- a/other.cls\n\
         +++ b/other.cls\n\
         @@ -1 +1 @@\n\
         -a\n\
         +b\n"
    );
    apply_patch(repo.path(), &multi, 60).await.unwrap();

    // Only the first diff landed.
    assert!(!repo.path().join("other.cls").exists());
}
