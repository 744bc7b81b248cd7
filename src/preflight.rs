//! Host prerequisite checks.
//!
//! Run by the WorkspaceSetup module before anything touches the chroot:
//! missing host tools fail the build up front instead of five modules in.

use std::path::Path;

use crate::process;
use crate::spec::BuildPlan;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - build will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// Results of all preflight checks.
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .collect()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        for check in &self.checks {
            let status_str = match check.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Fail => "FAIL",
                CheckStatus::Warn => "WARN",
            };
            match &check.details {
                Some(details) => println!("  [{status_str}] {}: {details}", check.name),
                None => println!("  [{status_str}] {}", check.name),
            }
        }
    }
}

/// Run every host check relevant to the given plan.
pub fn check_host(plan: &BuildPlan) -> PreflightReport {
    let mut checks = Vec::new();

    if unsafe { libc::geteuid() } == 0 {
        checks.push(CheckResult::pass("root privilege"));
    } else {
        checks.push(CheckResult::fail(
            "root privilege",
            "debootstrap and chroot mounts require running as root",
        ));
    }

    // Required tools with package hints
    let required_tools = [
        ("debootstrap", "debootstrap", "Required to create the chroot"),
        ("chroot", "coreutils", "Required to enter the chroot"),
        ("mount", "mount", "Required for chroot bind mounts"),
        ("umount", "mount", "Required for chroot teardown"),
        (
            "mksquashfs",
            "squashfs-tools",
            "Required to create the live squashfs",
        ),
        (
            "unsquashfs",
            "squashfs-tools",
            "Required to inspect squashfs images",
        ),
        ("xorriso", "xorriso", "Required to create the ISO image"),
        ("mkfs.vfat", "dosfstools", "Required for the EFI boot image"),
        ("md5sum", "coreutils", "Required for the ISO checksum sidecars"),
        ("mmd", "mtools", "Required to populate the EFI boot image"),
        ("mcopy", "mtools", "Required to populate the EFI boot image"),
        ("curl", "curl", "Required to fetch bootloader release images"),
    ];

    for (tool, package, purpose) in required_tools {
        checks.push(check_tool_exists(tool, package, purpose, true));
    }

    checks.push(check_tool_exists(
        "unzip",
        "unzip",
        "Required to extract the OpenCore release archive",
        plan.bootloader_config.enable_opencore,
    ));

    if !plan.bootloader_config.uefi_only {
        let isolinux_paths = [
            "/usr/lib/ISOLINUX/isolinux.bin",
            "/usr/lib/syslinux/modules/bios/ldlinux.c32",
        ];
        let found = isolinux_paths.iter().all(|p| Path::new(p).exists());
        if found {
            checks.push(CheckResult::pass("isolinux BIOS boot files"));
        } else {
            checks.push(CheckResult::warn(
                "isolinux BIOS boot files",
                "Not found on the host - they will be taken from the chroot after Debootstrap",
            ));
        }
    }

    PreflightReport { checks }
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_all_passed() {
        let report = PreflightReport {
            checks: vec![CheckResult::pass("a"), CheckResult::warn("b", "minor")],
        };
        assert!(report.all_passed());

        let report = PreflightReport {
            checks: vec![CheckResult::pass("a"), CheckResult::fail("b", "gone")],
        };
        assert!(!report.all_passed());
        assert_eq!(report.failures().len(), 1);
    }

    #[test]
    fn test_missing_tool_is_failure() {
        let result = check_tool_exists("no_such_tool_xyz", "pkg", "testing", true);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.details.unwrap().contains("pkg"));
    }
}
