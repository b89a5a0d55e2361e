//! Remote filesystem helper
//!
//! Built on the remote shell primitive. All mutations run under `sudo`,
//! matching the privilege contract the pool's login user carries. Writes
//! are staged at `{target}.staging.{taskId}` and renamed into place so a
//! failure mid-write leaves the previous file intact.

use tracing::debug;

use crate::errors::ControlError;
use crate::render::Artifact;
use crate::ssh::shell::{CommandChannel, RunRequest};
use crate::utils::shell_quote;

/// Root of the per-component backup tree on every managed host
pub const BACKUP_ROOT: &str = "/opt/monitoring/backups";

/// Remote filesystem operations scoped to one task
pub struct RemoteFs<'a> {
    shell: &'a dyn CommandChannel,
    task_id: String,
}

impl<'a> RemoteFs<'a> {
    pub fn new(shell: &'a dyn CommandChannel, task_id: impl Into<String>) -> Self {
        Self {
            shell,
            task_id: task_id.into(),
        }
    }

    fn err(context: &str, stderr: &str) -> ControlError {
        ControlError::CommandFailed(format!("{}: {}", context, stderr.trim()))
    }

    /// Create a directory (and parents). Idempotent.
    pub async fn ensure_dir(&self, path: &str, mode: u32) -> Result<(), ControlError> {
        let cmd = format!(
            "sudo mkdir -p {} && sudo chmod {:o} {}",
            shell_quote(path),
            mode,
            shell_quote(path)
        );
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("mkdir {}", path), &output.stderr));
        }
        Ok(())
    }

    /// Staging location for an atomic write of `target`
    pub fn staging_path(&self, target: &str) -> String {
        format!("{}.staging.{}", target, self.task_id)
    }

    /// Write artifact bytes to the staging path via `tee` and fsync them.
    /// Returns the staging path; the destination is untouched until
    /// [`RemoteFs::commit`].
    pub async fn stage(&self, artifact: &Artifact) -> Result<String, ControlError> {
        let staging = self.staging_path(&artifact.target_path);
        let cmd = format!(
            "sudo tee {} > /dev/null && sync && sudo chmod {:o} {}",
            shell_quote(&staging),
            artifact.mode,
            shell_quote(&staging)
        );
        let output = self
            .shell
            .run(RunRequest::new(cmd).with_stdin(artifact.content.clone()))
            .await?;
        if !output.success() {
            return Err(Self::err(&format!("stage {}", staging), &output.stderr));
        }
        Ok(staging)
    }

    /// Atomically rename a staged file into place
    pub async fn commit(&self, staging: &str, target: &str) -> Result<(), ControlError> {
        let cmd = format!("sudo mv -f {} {}", shell_quote(staging), shell_quote(target));
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("rename into {}", target), &output.stderr));
        }
        Ok(())
    }

    /// Remove a staged file that will not be committed
    pub async fn discard(&self, staging: &str) -> Result<(), ControlError> {
        let cmd = format!("sudo rm -f {}", shell_quote(staging));
        let _ = self.shell.run_cmd(&cmd).await?;
        Ok(())
    }

    /// Stage, then atomically place an artifact, creating the parent
    /// directory first
    pub async fn write_file(&self, artifact: &Artifact) -> Result<(), ControlError> {
        if let Some(parent) = parent_dir(&artifact.target_path) {
            self.ensure_dir(&parent, 0o755).await?;
        }
        let staging = self.stage(artifact).await?;
        if let (Some(user), Some(group)) = (&artifact.owner_user, &artifact.owner_group) {
            self.chown(&staging, user, group).await?;
        }
        self.commit(&staging, &artifact.target_path).await
    }

    /// Backup directory for a component at a given timestamp
    pub fn backup_dir(component: &str, timestamp: &str) -> String {
        format!("{}/{}/{}", BACKUP_ROOT, component, timestamp)
    }

    /// Copy a file into a backup directory. A missing source is not an
    /// error; it returns `None`.
    pub async fn backup_file(
        &self,
        path: &str,
        backup_dir: &str,
    ) -> Result<Option<String>, ControlError> {
        if !self.exists(path).await? {
            debug!("no {} to back up", path);
            return Ok(None);
        }
        self.ensure_dir(backup_dir, 0o755).await?;
        let cmd = format!("sudo cp {} {}/", shell_quote(path), shell_quote(backup_dir));
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("backup {}", path), &output.stderr));
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        Ok(Some(format!("{}/{}", backup_dir, name)))
    }

    /// Copy a backup back over its original location
    pub async fn restore_file(&self, backup_path: &str, target: &str) -> Result<(), ControlError> {
        let cmd = format!(
            "sudo cp {} {}",
            shell_quote(backup_path),
            shell_quote(target)
        );
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("restore {}", target), &output.stderr));
        }
        Ok(())
    }

    /// Archive a directory as tar.gz into the backup directory
    pub async fn archive_dir(
        &self,
        dir: &str,
        backup_dir: &str,
        archive_name: &str,
    ) -> Result<Option<String>, ControlError> {
        let probe = self
            .shell
            .run_cmd(&format!("test -d {}", shell_quote(dir)))
            .await?;
        if !probe.success() {
            debug!("no data dir {} to archive", dir);
            return Ok(None);
        }
        self.ensure_dir(backup_dir, 0o755).await?;
        let dest = format!("{}/{}", backup_dir, archive_name);
        let cmd = format!(
            "sudo tar -czf {} -C {} .",
            shell_quote(&dest),
            shell_quote(dir)
        );
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("archive {}", dir), &output.stderr));
        }
        Ok(Some(dest))
    }

    pub async fn exists(&self, path: &str) -> Result<bool, ControlError> {
        let output = self
            .shell
            .run_cmd(&format!("test -f {}", shell_quote(path)))
            .await?;
        Ok(output.success())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), ControlError> {
        let cmd = format!("sudo chmod {:o} {}", mode, shell_quote(path));
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("chmod {}", path), &output.stderr));
        }
        Ok(())
    }

    pub async fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), ControlError> {
        let cmd = format!(
            "sudo chown {}:{} {}",
            shell_quote(user),
            shell_quote(group),
            shell_quote(path)
        );
        let output = self.shell.run_cmd(&cmd).await?;
        if !output.success() {
            return Err(Self::err(&format!("chown {}", path), &output.stderr));
        }
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), ControlError> {
        let cmd = format!("sudo rm -f {}", shell_quote(path));
        let _ = self.shell.run_cmd(&cmd).await?;
        Ok(())
    }
}

fn parent_dir(path: &str) -> Option<String> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(path[..idx].to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_dir() {
        assert_eq!(
            parent_dir("/etc/prometheus/prometheus.yml").as_deref(),
            Some("/etc/prometheus")
        );
        assert_eq!(parent_dir("/vmlinuz"), None);
        assert_eq!(parent_dir("relative.yml"), None);
    }

    #[test]
    fn test_backup_dir_layout() {
        assert_eq!(
            RemoteFs::backup_dir("prometheus", "20260301_120000"),
            "/opt/monitoring/backups/prometheus/20260301_120000"
        );
    }
}
