//! Git subprocess helpers for the non-streaming paths (job-creation
//! pre-synthesis). The worker streams its own git output into the job
//! log instead.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// How much combined output to carry in an error message.
const SNIPPET_LIMIT: usize = 400;

pub async fn clone_repo(url: &str, dest: &Path) -> Result<()> {
    run_git(&["clone", url, &dest.to_string_lossy()], None).await
}

pub async fn checkout(repo_dir: &Path, rev: &str) -> Result<()> {
    run_git(&["-C", &repo_dir.to_string_lossy(), "checkout", rev], None).await
}

async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            combined_snippet(&output.stdout, &output.stderr)
        );
    }
    Ok(())
}

fn combined_snippet(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::new();
    combined.push_str(String::from_utf8_lossy(stdout).trim());
    let err = String::from_utf8_lossy(stderr);
    let err = err.trim();
    if !err.is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(err);
    }

    if combined.len() > SNIPPET_LIMIT {
        let mut cut = SNIPPET_LIMIT;
        while !combined.is_char_boundary(cut) {
            cut -= 1;
        }
        combined.truncate(cut);
        combined.push_str("...");
    }
    combined
}
