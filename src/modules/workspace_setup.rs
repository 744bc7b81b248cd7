//! WorkspaceSetup: host prerequisites and workspace directory layout.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use crate::errors::BuildErrorKind;
use crate::pipeline::{BuildContext, BuildModule};
use crate::preflight;

pub struct WorkspaceSetup;

impl BuildModule for WorkspaceSetup {
    fn name(&self) -> &'static str {
        "WorkspaceSetup"
    }

    /// Idempotent: re-running on a prepared workspace is a no-op.
    fn execute(&self, ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
        let report = preflight::check_host(ctx.plan);
        report.print();
        if !report.all_passed() {
            let missing: Vec<String> = report
                .failures()
                .iter()
                .map(|c| c.name.clone())
                .collect();
            return Err(anyhow::anyhow!(
                "host prerequisites missing: {}",
                missing.join(", ")
            ))
            .context(BuildErrorKind::MissingRequired);
        }

        let tmp = ctx.workspace.tmp_dir();
        let mut perms = fs::metadata(&tmp)
            .with_context(|| format!("reading '{}'", tmp.display()))?
            .permissions();
        perms.set_mode(0o1777);
        fs::set_permissions(&tmp, perms)
            .with_context(|| format!("setting permissions on '{}'", tmp.display()))?;

        // Mount points must exist before debootstrap finishes so an aborted
        // bootstrap can still be entered for inspection.
        let chroot = ctx.workspace.chroot_dir();
        for sub in ["dev", "dev/pts", "proc", "sys", "run"] {
            fs::create_dir_all(chroot.join(sub))
                .with_context(|| format!("creating chroot mount point '{sub}'"))?;
        }

        println!("Workspace ready: {}", ctx.workspace.root().display());
        Ok(None)
    }
}
