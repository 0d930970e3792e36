use std::time::Duration;

use tokio::process::Command;

/// Best-effort current branch of `working_dir`. Never panics or blocks
/// indefinitely: a 1-second wall-clock timeout wraps the subprocess, and any
/// failure (missing repo, non-zero exit, timeout) yields an empty string
/// (spec §4.7).
pub async fn current_branch(working_dir: &str) -> String {
    let probe = Command::new("git")
        .arg("rev-parse")
        .arg("--abbrev-ref")
        .arg("HEAD")
        .current_dir(working_dir)
        .output();

    match tokio::time::timeout(Duration::from_secs(1), probe).await {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_directory_yields_empty_string() {
        let branch = current_branch("/nonexistent/path/that/does/not/exist").await;
        assert_eq!(branch, "");
    }
}
