//! Workspace layout and lifecycle.
//!
//! A workspace is a directory tree owned exclusively by one build: the chroot
//! under construction, the persistent package cache, ISO/EFI staging, the
//! squashfs overlay tree and the checkpoint records. It is created at build
//! start, retained on failure for post-mortem and resume, and destroyed only
//! on explicit clean.
//!
//! A workspace that failed mount teardown is marked dirty on disk and refuses
//! further use until cleaned.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::errors::BuildErrorKind;

const DIRTY_MARKER: &str = "DIRTY";
const CACHE_LOCK: &str = ".zforge-cache.lock";

/// Fixed subdirectories of the workspace root.
const SUBDIRS: &[&str] = &["chroot", "cache", "iso", "efi", "live", "state", "tmp"];

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    /// Held for the lifetime of the workspace when package caching is on.
    /// The cache is shared across builds but accessed serially.
    _cache_lock: Option<File>,
}

impl Workspace {
    /// Acquire the workspace at `root`, creating the layout if needed.
    ///
    /// Refuses a workspace whose previous teardown failed (`WorkspaceDirty`).
    /// When `use_cache` is set, takes an exclusive advisory lock on the cache
    /// directory so concurrent builds serialize on it.
    pub fn acquire(root: &Path, use_cache: bool) -> Result<Self> {
        if Self::is_dirty(root) {
            let reason = fs::read_to_string(root.join("state").join(DIRTY_MARKER))
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "workspace '{}' has leaked mounts from a previous run ({}); run with --clean after unmounting",
                root.display(),
                reason.trim()
            )
            .context(BuildErrorKind::WorkspaceDirty));
        }

        for sub in SUBDIRS {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("creating workspace directory '{}'", dir.display()))?;
        }

        let cache_lock = if use_cache {
            let lock_path = root.join("cache").join(CACHE_LOCK);
            let file = File::create(&lock_path)
                .with_context(|| format!("creating cache lock '{}'", lock_path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("locking package cache '{}'", lock_path.display()))?;
            Some(file)
        } else {
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            _cache_lock: cache_lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chroot_dir(&self) -> PathBuf {
        self.root.join("chroot")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn iso_dir(&self) -> PathBuf {
        self.root.join("iso")
    }

    pub fn efi_dir(&self) -> PathBuf {
        self.root.join("efi")
    }

    pub fn live_dir(&self) -> PathBuf {
        self.root.join("live")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Mount points currently active under the chroot, deepest first.
    ///
    /// Parses /proc/self/mounts rather than trusting our own bookkeeping:
    /// a previous crashed builder may have left mounts we never made.
    pub fn active_chroot_mounts(&self) -> Result<Vec<PathBuf>> {
        active_mounts_under(&self.chroot_dir())
    }

    /// Mark the workspace dirty; `acquire` will refuse it from now on.
    pub fn mark_dirty(&self, reason: &str) {
        let path = self.state_dir().join(DIRTY_MARKER);
        if let Err(e) = fs::write(&path, reason) {
            log::error!("failed to write dirty marker '{}': {}", path.display(), e);
        }
    }

    pub fn is_dirty(root: &Path) -> bool {
        root.join("state").join(DIRTY_MARKER).exists()
    }

    /// Destroy the workspace tree. Refuses while chroot mounts are active.
    pub fn destroy(root: &Path) -> Result<()> {
        let mounts = active_mounts_under(&root.join("chroot"))?;
        if !mounts.is_empty() {
            bail!(
                "refusing to delete workspace '{}': {} mount(s) still active under chroot (first: {})",
                root.display(),
                mounts.len(),
                mounts[0].display()
            );
        }
        if root.exists() {
            fs::remove_dir_all(root)
                .with_context(|| format!("removing workspace '{}'", root.display()))?;
        }
        Ok(())
    }
}

/// All mount points under `prefix` from /proc/self/mounts, deepest first so
/// they can be unmounted in order.
pub fn active_mounts_under(prefix: &Path) -> Result<Vec<PathBuf>> {
    let table = fs::read_to_string("/proc/self/mounts").context("reading /proc/self/mounts")?;
    Ok(mounts_under_from_table(&table, prefix))
}

fn mounts_under_from_table(table: &str, prefix: &Path) -> Vec<PathBuf> {
    let mut mounts: Vec<PathBuf> = table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .filter(|p| p.starts_with(prefix))
        .collect();
    mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    mounts
}

/// /proc/mounts octal-escapes spaces and tabs in paths.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.by_ref().take(3).collect();
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                continue;
            }
            out.push(c);
            out.push_str(&digits);
        } else {
            out.push(c);
        }
    }
    out
}
