//! Patch pipeline: cleaning, structure validation, and multi-strategy
//! application of model-produced diffs.
//!
//! Model output is typically *mostly* a unified diff, wrapped in markdown
//! fences, interleaved with prose, or truncated mid-hunk. The cleaner
//! rewrites the text line-wise into the largest valid diff it contains;
//! application then walks a four-strategy ladder so a patch with minor
//! formatting damage still gets a fair chance. Only when every strategy
//! fails is the patch declared unapplicable, a model failure rather than a tool
//! error.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::domain::error::{Result, SfBenchError};
use crate::process::run_with_stdin;

/// Backoff base for pipeline retries (transient failures only).
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_ATTEMPTS: u32 = 3;

/// `1.` / `12)` style numbered-list payloads after a `+`/`-` sign.
static NUMBERED_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+[.)]").expect("static regex"));

/// Metadata line prefixes that survive inside a diff body.
const DIFF_METADATA_PREFIXES: &[&str] =
    &["index", "new file", "deleted file", "similarity", "rename"];

/// The four application strategies, tried in order.
const STRATEGIES: &[(&str, &[&str])] = &[
    (
        "git_apply_strict",
        &["apply", "--whitespace=fix", "--ignore-whitespace"],
    ),
    (
        "git_apply_reject",
        &["apply", "--whitespace=fix", "--ignore-whitespace", "--reject"],
    ),
    ("git_apply_3way", &["apply", "--3way", "--whitespace=fix"]),
    ("patch_fuzzy", &["--batch", "--fuzz=5", "-p1"]),
];

/// Rewrite model-produced diff text into the largest valid diff it
/// contains. Pure text transform: never errors, and idempotent
/// (`clean_patch(clean_patch(x)) == clean_patch(x)`).
pub fn clean_patch(patch: &str) -> String {
    let mut cleaned: Vec<String> = Vec::new();
    let mut in_diff = false;
    let mut last_was_hunk_header = false;
    let mut seen_first_diff = false;
    let mut diff_count = 0u32;

    for line in patch.lines() {
        // Markdown code fences never belong in a diff.
        if line.trim_start().starts_with("```") {
            continue;
        }

        if line.starts_with("diff --git") {
            diff_count += 1;
            if diff_count > 1 {
                // Models sometimes emit several diffs with explanations
                // between them; only the first complete diff is applied.
                break;
            }
            in_diff = true;
            seen_first_diff = true;
            last_was_hunk_header = false;
            cleaned.push(line.trim_end().to_string());
            continue;
        }

        if !seen_first_diff && (line.starts_with("---") || line.starts_with("+++")) {
            in_diff = true;
            seen_first_diff = true;
            last_was_hunk_header = false;
        }

        if !in_diff {
            // Prose before the first diff marker is dropped.
            if line.starts_with("diff")
                || line.starts_with("---")
                || line.starts_with("+++")
                || line.starts_with("@@")
                || line.starts_with("index")
            {
                cleaned.push(line.trim_end().to_string());
            }
            continue;
        }

        if line.starts_with("---") || line.starts_with("+++") {
            cleaned.push(line.trim_end().to_string());
            last_was_hunk_header = false;
            continue;
        }

        if line.starts_with("@@") {
            cleaned.push(line.trim_end().to_string());
            last_was_hunk_header = true;
            continue;
        }

        if line.starts_with(' ') || line.starts_with('+') || line.starts_with('-') {
            let trimmed = line.trim_end();

            if keep_signed_line(trimmed) {
                cleaned.push(trimmed.to_string());
            }
            last_was_hunk_header = false;
            continue;
        }

        if line.starts_with('\\') {
            // "\ No newline at end of file"
            cleaned.push(line.trim_end().to_string());
            last_was_hunk_header = false;
            continue;
        }

        // Blank line directly after a hunk header is a common malformation.
        if last_was_hunk_header && line.trim().is_empty() {
            continue;
        }

        // Inside the diff body, only metadata lines survive; anything else
        // is interleaved explanation.
        let stripped = line.trim();
        if !stripped.is_empty()
            && !DIFF_METADATA_PREFIXES
                .iter()
                .any(|p| stripped.starts_with(p))
        {
            continue;
        }

        cleaned.push(line.trim_end().to_string());
        last_was_hunk_header = false;
    }

    // Final sweep: standalone +/- whose predecessor is not diff context.
    let mut final_lines: Vec<String> = Vec::new();
    for line in cleaned {
        if (line == "+" || line == "-") && !final_lines.is_empty() {
            let prev = final_lines.last().map(String::as_str).unwrap_or("");
            let prev_is_context = prev.starts_with(' ')
                || prev.starts_with('+')
                || prev.starts_with('-')
                || prev.starts_with("@@")
                || prev.starts_with("diff");
            if !prev_is_context {
                continue;
            }
        }
        final_lines.push(line);
    }

    truncate_incomplete_tail(&mut final_lines);

    let mut result = final_lines.join("\n");
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Decide whether a trailing-stripped `+`/`-`/context line is real diff
/// content. Context lines (leading space) are kept when non-empty.
fn keep_signed_line(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if line == "+" || line == "-" {
        return false;
    }
    if !line.starts_with('+') && !line.starts_with('-') {
        // Context line; already known non-empty.
        return true;
    }

    let rest = line[1..].trim();
    if rest.is_empty() {
        return false;
    }
    // A single non-alphanumeric character is not code.
    if rest.chars().count() == 1 && !rest.chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return false;
    }
    // Numbered-list payloads ("+1. Deploy the bundle") are explanations.
    if NUMBERED_LIST.is_match(rest) {
        return false;
    }
    // Bulleted payloads likewise.
    if rest.starts_with("- ") || rest.starts_with("* ") {
        return false;
    }

    true
}

/// Strip an incomplete trailing hunk: a bare final `@@` header, a bare
/// file header, or a final hunk whose last line is not valid diff content.
fn truncate_incomplete_tail(lines: &mut Vec<String>) {
    loop {
        let Some(last) = lines.last().cloned() else {
            return;
        };

        if last.starts_with("@@") {
            warn!("patch ends with hunk header; removing incomplete final hunk");
            lines.pop();
            continue;
        }

        if last.starts_with("---") || last.starts_with("+++") {
            // A valid diff never ends on a file header; the pair is dangling.
            warn!("patch ends with file header without content; removing");
            lines.pop();
            continue;
        }

        return;
    }
}

/// Structure check over cleaned diff text.
///
/// Requires at least one real change line and either a `diff --git` header
/// or the file-header + hunk + content triple.
pub fn validate_patch_structure(cleaned: &str) -> Result<()> {
    if cleaned.trim().is_empty() {
        return Err(SfBenchError::PatchApplication(
            "patch is empty after cleaning - model generated empty or invalid patch".into(),
        ));
    }

    let has_diff_content = cleaned.lines().any(|line| {
        (line.starts_with('+') || line.starts_with('-') || line.starts_with("@@"))
            && !line.starts_with("+++")
            && !line.starts_with("---")
    });
    if !has_diff_content {
        return Err(SfBenchError::PatchApplication(
            "patch does not contain valid diff content - model did not generate a valid diff"
                .into(),
        ));
    }

    let has_diff_header = cleaned.lines().any(|l| l.starts_with("diff --git"));
    let has_file_headers = cleaned.lines().any(|l| l.starts_with("---"))
        && cleaned.lines().any(|l| l.starts_with("+++"));
    let has_hunk = cleaned.lines().any(|l| l.starts_with("@@"));
    let has_content = cleaned
        .lines()
        .any(|l| l.starts_with(' ') || l.starts_with('+') || l.starts_with('-'));

    if !(has_diff_header || (has_file_headers && has_hunk && has_content)) {
        return Err(SfBenchError::PatchApplication(
            "patch is incomplete or malformed: missing required diff structure".into(),
        ));
    }

    Ok(())
}

/// Apply a model-produced diff to a repository.
///
/// Cleans and validates the diff, probes it with `git apply --check`
/// (informational only), then walks the strategy ladder: strict git-apply,
/// `--reject`, `--3way`, and GNU `patch --fuzz=5`. The first success wins.
///
/// Exhaustion of all strategies is a [`SfBenchError::PatchApplication`]
/// failure, surfaced to the runner as FAIL.
pub async fn apply_patch(repo_dir: &Path, patch: &str, timeout_secs: u64) -> Result<()> {
    if patch.trim().is_empty() {
        return Err(SfBenchError::PatchApplication(
            "cannot apply empty patch - patch does not contain valid diff content".into(),
        ));
    }

    let cleaned = clean_patch(patch);
    validate_patch_structure(&cleaned)?;

    // Non-mutating probe. Its failure is informational: the fallback
    // strategies frequently succeed where the strict check does not.
    match run_with_stdin(
        "git",
        &["apply", "--check", "--whitespace=fix", "--ignore-whitespace"],
        &cleaned,
        repo_dir,
        timeout_secs,
    )
    .await
    {
        Ok(out) if out.exit_code == 0 => debug!("patch validation passed: git apply --check"),
        Ok(out) => {
            let preview: String = out.stderr.chars().take(200).collect();
            info!("patch validation check failed (will try fallback strategies): {preview}");
        }
        Err(e) => info!("patch validation probe error (will try fallback strategies): {e}"),
    }

    let mut last_error: Option<String> = None;
    let mut timed_out = 0usize;

    for (name, args) in STRATEGIES {
        let program = if *name == "patch_fuzzy" { "patch" } else { "git" };

        match run_with_stdin(program, args, &cleaned, repo_dir, timeout_secs).await {
            Ok(out) if out.exit_code == 0 => {
                if *name == "git_apply_strict" {
                    debug!("patch applied using strict strategy");
                } else {
                    info!(strategy = name, "patch applied using fallback strategy");
                }
                return Ok(());
            }
            Ok(out) => {
                let detail = if out.stderr.is_empty() {
                    if out.stdout.is_empty() {
                        format!("exit code: {}", out.exit_code)
                    } else {
                        out.stdout
                    }
                } else {
                    out.stderr
                };
                last_error = Some(detail);
            }
            Err(SfBenchError::Timeout { timeout_secs, .. }) => {
                timed_out += 1;
                warn!(strategy = name, "patch strategy timed out after {timeout_secs}s");
                last_error = Some(format!("strategy {name} timed out after {timeout_secs} seconds"));
            }
            Err(e) => {
                last_error = Some(format!("strategy {name} failed: {e}"));
            }
        }
    }

    if timed_out == STRATEGIES.len() {
        return Err(SfBenchError::PatchApplication(format!(
            "all {} patch strategies timed out after {timeout_secs} seconds each",
            STRATEGIES.len()
        )));
    }

    let last = last_error.unwrap_or_else(|| "unknown error".into());
    let excerpt: String = last.chars().take(300).collect();
    Err(SfBenchError::PatchApplication(format!(
        "failed to apply patch after trying {} strategies. Last error: {excerpt}. \
         All patch application strategies (strict, reject, 3-way merge, fuzzy) were attempted; \
         the patch structure is fundamentally invalid or does not match the repository state",
        STRATEGIES.len()
    )))
}

/// Apply with retry for transient failures only.
///
/// Patch-content failures ([`SfBenchError::PatchApplication`]) are
/// deterministic and never retried; the internal strategy ladder has
/// already given the patch every reasonable chance.
pub async fn apply_patch_with_retry(repo_dir: &Path, patch: &str, timeout_secs: u64) -> Result<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match apply_patch(repo_dir, patch, timeout_secs).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    attempt,
                    "transient patch failure: {e}; retrying in {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::run_command;

    const VALID_DIFF: &str = "\
diff --git a/hello.txt b/hello.txt
index 557db03..980a0d5 100644
--- a/hello.txt
+++ b/hello.txt
@@ -1 +1 @@
-Hello World
+Hello, World!
";

    async fn repo_with_file(name: &str, content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), content).unwrap();
        for cmd in [
            "git init -b main",
            "git config user.name test-user",
            "git config user.email test@example.com",
            "git add -A",
            "git commit -m initial",
        ] {
            run_command(cmd, Some(dir.path()), 30, false).await.unwrap();
        }
        dir
    }

    #[test]
    fn test_clean_is_idempotent() {
        let inputs = [
            VALID_DIFF.to_string(),
            format!("```diff\n{VALID_DIFF}```\n"),
            "random prose\nno diff here".to_string(),
            String::new(),
            format!("Here is the fix:\n\n{VALID_DIFF}\nHope that helps!"),
        ];
        for input in inputs {
            let once = clean_patch(&input);
            let twice = clean_patch(&once);
            assert_eq!(once, twice, "clean not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_clean_strips_markdown_fences() {
        let fenced = format!("```diff\n{VALID_DIFF}```");
        let cleaned = clean_patch(&fenced);
        assert!(!cleaned.contains("```"));
        assert!(cleaned.contains("diff --git"));
        assert!(cleaned.contains("+Hello, World!"));
    }

    #[test]
    fn test_clean_drops_leading_prose() {
        let noisy = format!("Sure! Here's the patch you asked for:\n\nApply with git.\n{VALID_DIFF}");
        let cleaned = clean_patch(&noisy);
        assert!(cleaned.starts_with("diff --git"));
    }

    #[test]
    fn test_clean_keeps_only_first_diff() {
        let double = format!("{VALID_DIFF}\nSome explanation.\ndiff --git a/b.txt b/b.txt\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-x\n+y\n");
        let cleaned = clean_patch(&double);
        assert_eq!(cleaned.matches("diff --git").count(), 1);
        assert!(!cleaned.contains("b.txt"));
    }

    #[test]
    fn test_clean_drops_malformed_sign_lines() {
        let noisy = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -1,2 +1,2 @@
 context
+
-
+
+real code line
+1. Deploy the LWC bundle
+- bullet explanation
+* another bullet
+;
";
        let cleaned = clean_patch(noisy);
        assert!(cleaned.contains("+real code line"));
        assert!(!cleaned.contains("+1. Deploy"));
        assert!(!cleaned.contains("+- bullet"));
        assert!(!cleaned.contains("+* another"));
        assert!(!cleaned.contains("+;"));
        for line in cleaned.lines() {
            assert_ne!(line, "+");
            assert_ne!(line, "-");
        }
    }

    #[test]
    fn test_clean_truncates_trailing_bare_hunk_header() {
        let truncated = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -1 +1 @@
-old
+new
@@ -10,3 +10,4 @@
";
        let cleaned = clean_patch(truncated);
        assert!(!cleaned.contains("@@ -10,3"));
        assert!(cleaned.contains("+new"));
    }

    #[test]
    fn test_clean_skips_blank_after_hunk_header() {
        let input = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n\n-old\n+new\n";
        let cleaned = clean_patch(input);
        let lines: Vec<&str> = cleaned.lines().collect();
        let hunk_idx = lines.iter().position(|l| l.starts_with("@@")).unwrap();
        assert_eq!(lines[hunk_idx + 1], "-old");
    }

    #[test]
    fn test_clean_preserves_no_newline_marker() {
        let input = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-old\n+new\n\\ No newline at end of file\n";
        let cleaned = clean_patch(input);
        assert!(cleaned.contains("\\ No newline at end of file"));
    }

    #[test]
    fn test_clean_ends_with_newline() {
        let input = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-old\n+new";
        assert!(clean_patch(input).ends_with('\n'));
    }

    #[test]
    fn test_structure_rejects_empty_and_prose() {
        assert!(matches!(
            validate_patch_structure(""),
            Err(SfBenchError::PatchApplication(_))
        ));

        let cleaned = clean_patch("hello world, this is not a diff");
        assert!(matches!(
            validate_patch_structure(&cleaned),
            Err(SfBenchError::PatchApplication(_))
        ));
    }

    #[test]
    fn test_structure_accepts_headerless_triple() {
        let patch = "--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-old\n+new\n";
        validate_patch_structure(patch).unwrap();
    }

    #[tokio::test]
    async fn test_apply_valid_patch_strict() {
        let repo = repo_with_file("hello.txt", "Hello World\n").await;
        apply_patch(repo.path(), VALID_DIFF, 60).await.unwrap();
        let content = std::fs::read_to_string(repo.path().join("hello.txt")).unwrap();
        assert_eq!(content, "Hello, World!\n");
    }

    #[tokio::test]
    async fn test_apply_fenced_patch() {
        let repo = repo_with_file("hello.txt", "Hello World\n").await;
        let fenced = format!("```diff\n{VALID_DIFF}```\n");
        apply_patch(repo.path(), &fenced, 60).await.unwrap();
        let content = std::fs::read_to_string(repo.path().join("hello.txt")).unwrap();
        assert_eq!(content, "Hello, World!\n");
    }

    #[tokio::test]
    async fn test_apply_empty_patch_fails_before_git() {
        // No repository needed: the pipeline rejects before any git call.
        let dir = tempfile::tempdir().unwrap();
        let err = apply_patch(dir.path(), "   \n", 60).await.unwrap_err();
        assert!(matches!(err, SfBenchError::PatchApplication(_)));
        assert!(err.to_string().contains("does not contain valid diff"));
    }

    #[tokio::test]
    async fn test_apply_prose_fails_as_patch_application() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_patch(dir.path(), "hello world", 60).await.unwrap_err();
        assert!(matches!(err, SfBenchError::PatchApplication(_)));
        assert!(err.to_string().contains("does not contain valid diff"));
        assert!(err.is_model_failure());
    }

    #[tokio::test]
    async fn test_apply_fences_only_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_patch(dir.path(), "```\n```\n", 60).await.unwrap_err();
        assert!(matches!(err, SfBenchError::PatchApplication(_)));
    }

    #[tokio::test]
    async fn test_apply_mismatched_patch_exhausts_ladder() {
        let repo = repo_with_file("other.txt", "unrelated\n").await;
        let err = apply_patch(repo.path(), VALID_DIFF, 60).await.unwrap_err();
        match err {
            SfBenchError::PatchApplication(msg) => {
                assert!(msg.contains("4 strategies"), "message was: {msg}")
            }
            other => panic!("expected PatchApplication, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_content_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let start = std::time::Instant::now();
        let err = apply_patch_with_retry(dir.path(), "garbage", 60)
            .await
            .unwrap_err();
        assert!(matches!(err, SfBenchError::PatchApplication(_)));
        // No backoff sleeps were taken.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
