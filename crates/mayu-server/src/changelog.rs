//! Version-controlled log of cluster directory changes

use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },
}

/// Append-only record of changes to the cluster directory
pub trait ChangeLog: Send + Sync {
    /// Prepare `dir` for recording (called once for new clusters)
    fn init(&self, dir: &Path) -> Result<(), ChangeLogError>;

    /// Record the current content of `path` (inside `dir`) with `message`
    fn record(&self, dir: &Path, path: &Path, message: &str) -> Result<(), ChangeLogError>;
}

/// Used with `--no-git`
#[derive(Debug, Default, Clone)]
pub struct NoopChangeLog;

impl ChangeLog for NoopChangeLog {
    fn init(&self, _dir: &Path) -> Result<(), ChangeLogError> {
        Ok(())
    }

    fn record(&self, _dir: &Path, _path: &Path, _message: &str) -> Result<(), ChangeLogError> {
        Ok(())
    }
}

/// Commits every change to a git repository in the cluster directory
#[derive(Debug, Default, Clone)]
pub struct GitChangeLog;

impl GitChangeLog {
    fn git(&self, dir: &Path, args: &[&str]) -> Result<String, ChangeLogError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=mayu", "-c", "user.email=mayu@localhost"])
            .args(args)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            // committing an unchanged file is not an error
            if stdout.contains("nothing to commit") || stdout.contains("nothing added to commit") {
                return Ok(stdout);
            }
            return Err(ChangeLogError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

impl ChangeLog for GitChangeLog {
    fn init(&self, dir: &Path) -> Result<(), ChangeLogError> {
        if dir.join(".git").exists() {
            return Ok(());
        }
        self.git(dir, &["init"])?;
        debug!(dir = %dir.display(), "initialized git repository");
        Ok(())
    }

    fn record(&self, dir: &Path, path: &Path, message: &str) -> Result<(), ChangeLogError> {
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let relative = relative.to_string_lossy();
        self.git(dir, &["add", relative.as_ref()])?;
        self.git(dir, &["commit", "-m", message])?;
        debug!(path = %relative, message, "committed change");
        Ok(())
    }
}
