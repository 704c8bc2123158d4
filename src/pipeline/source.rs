//! Source checkout through the `git` command line tool.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to invoke git: {0}")]
    Spawn(#[from] std::io::Error),
    /// Non zero exit. Carries the tool's combined output.
    #[error("git {action} failed: {output}")]
    Failed {
        action: &'static str,
        output: String,
    },
}

#[async_trait]
pub trait SourceSync: Send + Sync {
    /// Shallow clone of `branch` into `checkout`.
    async fn clone_fresh(&self, repo_url: &str, branch: &str, checkout: &Path)
    -> Result<(), SourceError>;

    /// Fetches `branch` and hard resets the working copy to it.
    async fn update(&self, branch: &str, checkout: &Path) -> Result<(), SourceError>;
}

pub struct GitSource;

async fn run_git(action: &'static str, command: &mut Command) -> Result<(), SourceError> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    log::warn!("git {action} exited with {:?}", output.status.code());
    Err(SourceError::Failed {
        action,
        output: combined,
    })
}

#[async_trait]
impl SourceSync for GitSource {
    async fn clone_fresh(
        &self,
        repo_url: &str,
        branch: &str,
        checkout: &Path,
    ) -> Result<(), SourceError> {
        if let Some(parent) = checkout.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        log::info!("Cloning {repo_url} ({branch}) into {checkout:?}");
        run_git(
            "clone",
            Command::new("git")
                .args(["clone", "--depth", "1", "-b", branch, repo_url])
                .arg(checkout),
        )
        .await
    }

    async fn update(&self, branch: &str, checkout: &Path) -> Result<(), SourceError> {
        log::info!("Updating repository in {checkout:?}");
        run_git(
            "fetch",
            Command::new("git")
                .arg("-C")
                .arg(checkout)
                .args(["fetch", "origin", branch]),
        )
        .await?;
        run_git(
            "reset",
            Command::new("git")
                .arg("-C")
                .arg(checkout)
                .args(["reset", "--hard"])
                .arg(format!("origin/{branch}")),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_update_reports_git_output() {
        let dir = TempDir::new().unwrap();
        // Not a repository, so git exits non zero
        let err = GitSource
            .update("main", dir.path())
            .await
            .expect_err("update of a non repository must fail");
        match err {
            SourceError::Failed { action, output } => {
                assert_eq!(action, "fetch");
                assert!(!output.is_empty());
            }
            // git not installed on this machine
            SourceError::Spawn(_) => {}
        }
    }
}
