//! Scoped chroot sessions with managed bind mounts.
//!
//! A [`ChrootSession`] bind-mounts the kernel filesystems (and optionally the
//! package cache) into the chroot, runs commands inside it, and tears the
//! mounts down in reverse order on release. Releasing tolerates
//! "already unmounted" but never leaves a mount leaked: persistent failure is
//! a `MountLeak` and the workspace is marked dirty.
//!
//! At most one session is active process-wide. Nested acquisition fails with
//! `ChrootBusy`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::errors::BuildErrorKind;
use crate::process::{Cmd, CommandResult};
use crate::workspace::Workspace;

/// Kernel filesystems bound into the chroot, in mount order.
/// Unmount happens in reverse.
const KERNEL_MOUNTS: &[(&str, &str)] = &[
    ("/dev", "dev"),
    ("/dev/pts", "dev/pts"),
    ("/proc", "proc"),
    ("/sys", "sys"),
    ("/run", "run"),
];

/// Where the shared package cache appears inside the chroot.
pub const CHROOT_CACHE_DIR: &str = "var/cache/zforge";

static CHROOT_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug)]
pub struct ChrootSession {
    chroot: PathBuf,
    /// Mount targets in mount order.
    mounted: Vec<PathBuf>,
    released: bool,
}

impl ChrootSession {
    /// Enter the workspace chroot, establishing the bind mounts.
    ///
    /// `with_cache` additionally binds the workspace package cache to
    /// /var/cache/zforge inside the chroot.
    pub fn enter(workspace: &Workspace, with_cache: bool) -> Result<Self> {
        if CHROOT_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!("another chroot session is active")
                .context(BuildErrorKind::ChrootBusy));
        }

        let chroot = workspace.chroot_dir();
        let mut session = Self {
            chroot: chroot.clone(),
            mounted: Vec::new(),
            released: false,
        };

        let mut plan: Vec<(PathBuf, PathBuf)> = KERNEL_MOUNTS
            .iter()
            .map(|(src, dst)| (PathBuf::from(src), chroot.join(dst)))
            .collect();
        if with_cache {
            plan.push((workspace.cache_dir(), chroot.join(CHROOT_CACHE_DIR)));
        }

        for (source, target) in plan {
            if let Err(e) = session.bind_mount(&source, &target) {
                // Roll back whatever got mounted before reporting the failure.
                let teardown = session.unmount_all();
                CHROOT_ACTIVE.store(false, Ordering::SeqCst);
                session.released = true;
                if let Err(te) = teardown {
                    workspace.mark_dirty(&format!("{te:#}"));
                }
                return Err(e);
            }
        }

        Ok(session)
    }

    fn bind_mount(&mut self, source: &PathBuf, target: &PathBuf) -> Result<()> {
        std::fs::create_dir_all(target)
            .with_context(|| format!("creating mount point '{}'", target.display()))?;
        Cmd::new("mount")
            .arg("--bind")
            .arg_path(source)
            .arg_path(target)
            .error_msg(format!(
                "bind-mounting '{}' at '{}'",
                source.display(),
                target.display()
            ))
            .run()?;
        self.mounted.push(target.clone());
        Ok(())
    }

    /// Run a command inside the chroot, streaming output through the log
    /// with the idle watchdog armed.
    pub fn run<I, S>(&self, argv: I) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cmd(argv).run_streamed()
    }

    /// Run a command, tolerating non-zero exit.
    pub fn run_allow_fail<I, S>(&self, argv: I) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cmd(argv).allow_fail().run_streamed()
    }

    /// Run a shell script inside the chroot.
    pub fn run_script(&self, script: &str) -> Result<CommandResult> {
        self.cmd(["bash", "-c", script]).run_streamed()
    }

    /// Build a chroot command without running it, for callers that need
    /// extra environment or a custom idle timeout.
    pub fn cmd<I, S>(&self, argv: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Cmd::new("chroot")
            .arg_path(&self.chroot)
            .args(argv)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("LC_ALL", "C")
    }

    /// Tear down the bind mounts in reverse order.
    ///
    /// On persistent unmount failure the workspace is marked dirty and the
    /// error carries `MountLeak`.
    pub fn release(mut self, workspace: &Workspace) -> Result<()> {
        self.released = true;
        CHROOT_ACTIVE.store(false, Ordering::SeqCst);
        let result = self.unmount_all();
        if let Err(e) = &result {
            workspace.mark_dirty(&format!("{e:#}"));
        }
        result
    }

    fn unmount_all(&mut self) -> Result<()> {
        let mut leaked = Vec::new();
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = unmount(&target) {
                log::error!("failed to unmount '{}': {:#}", target.display(), e);
                leaked.push(target);
            }
        }
        if leaked.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} mount(s) could not be released: {}",
                leaked.len(),
                leaked
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
            .context(BuildErrorKind::MountLeak))
        }
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Unwind path: best-effort teardown so errors elsewhere don't leak
        // kernel mounts. Callers that want the result use release().
        if let Err(e) = self.unmount_all() {
            log::error!("chroot teardown during unwind failed: {e:#}");
        }
        CHROOT_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Unmount one target: plain umount, retry, then lazy unmount.
/// "Not mounted" counts as success.
fn unmount(target: &PathBuf) -> Result<()> {
    for attempt in 0..2 {
        let result = Cmd::new("umount").arg_path(target).allow_fail().run()?;
        if result.success() || not_mounted(&result) {
            return Ok(());
        }
        if attempt == 0 {
            std::thread::sleep(Duration::from_millis(500));
        }
    }
    log::warn!("falling back to lazy unmount for '{}'", target.display());
    let result = Cmd::new("umount")
        .arg("-l")
        .arg_path(target)
        .allow_fail()
        .run()?;
    if result.success() || not_mounted(&result) {
        return Ok(());
    }
    anyhow::bail!(
        "umount '{}' failed: {}",
        target.display(),
        result.stderr_trimmed()
    )
}

fn not_mounted(result: &CommandResult) -> bool {
    let stderr = result.stderr.to_ascii_lowercase();
    stderr.contains("not mounted") || stderr.contains("no mount point specified")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Mount syscalls need root; these tests cover the serialization guard and
    // the unmount tolerance logic, which do not.

    #[test]
    fn test_second_enter_is_chroot_busy() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();

        assert!(!CHROOT_ACTIVE.swap(true, Ordering::SeqCst));
        let err = ChrootSession::enter(&ws, false).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::ChrootBusy)
        );
        CHROOT_ACTIVE.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_unmount_tolerates_not_mounted() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("never-mounted");
        std::fs::create_dir(&target).unwrap();
        // umount on a plain directory reports "not mounted"; that is success.
        unmount(&target).unwrap();
    }

    #[test]
    fn test_chroot_cmd_sets_noninteractive_env() {
        let session = ChrootSession {
            chroot: PathBuf::from("/nonexistent"),
            mounted: Vec::new(),
            released: true,
        };
        // Only checks builder wiring; nothing is executed.
        let _cmd = session.cmd(["apt-get", "update"]);
    }
}
