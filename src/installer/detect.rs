//! Importable-pool detection for the `zfspooldetect` step.
//!
//! Pools are scanned with `zpool import`, imported read-only without
//! mounting, inspected for existing root datasets, and exported again. The
//! report is published to globalstorage for the selection view.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::installer::globalstorage::GlobalStorage;
use crate::process::{run, Cmd};

pub const K_ZFS_POOLS: &str = "zfs_pools";
pub const K_ZFS_POOL_NAMES: &str = "zfs_pool_names";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolReport {
    pub name: String,
    pub health: String,
    pub existing_roots: Vec<RootDataset>,
    pub suitable_for_install: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootDataset {
    pub dataset: String,
    pub mountpoint: String,
    pub is_proxmox: bool,
}

/// Pool names offered by `zpool import`.
pub fn parse_importable_pools(zpool_import_output: &str) -> Vec<String> {
    zpool_import_output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            trimmed.strip_prefix("pool:").map(|name| name.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Health state from `zpool status` output.
pub fn parse_pool_health(zpool_status_output: &str) -> String {
    zpool_status_output
        .lines()
        .find_map(|line| line.trim().strip_prefix("state:"))
        .map(|state| state.trim().to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Candidate root datasets from `zfs list -H -o name,mountpoint` output:
/// anything under a ROOT container or mounted at /.
pub fn parse_root_datasets(zfs_list_output: &str) -> Vec<(String, String)> {
    zfs_list_output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let dataset = parts.next()?.trim();
            let mountpoint = parts.next()?.trim();
            if dataset.is_empty() {
                return None;
            }
            if dataset.contains("/ROOT/") || mountpoint == "/" {
                Some((dataset.to_string(), mountpoint.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Scan for importable pools and publish the report to globalstorage.
pub fn detect_pools(gs: &mut GlobalStorage) -> Result<Vec<PoolReport>> {
    // The zfs module may not be loaded yet on the live system.
    let _ = Cmd::new("modprobe").arg("zfs").allow_fail().run();

    let scan = Cmd::new("zpool").arg("import").allow_fail().run()?;
    let pools = parse_importable_pools(&scan.stdout);

    let mut reports = Vec::new();
    for pool in &pools {
        // Read-only, unmounted import keeps detection side-effect free.
        let imported = Cmd::new("zpool")
            .args(["import", "-o", "readonly=on", "-N"])
            .arg(pool)
            .allow_fail()
            .run()?;
        if !imported.success() {
            log::warn!("pool '{pool}' could not be imported: {}", imported.stderr_trimmed());
            continue;
        }

        let report = scan_pool(pool);
        let _ = run("zpool", ["export", pool.as_str()]);
        reports.push(report?);
    }

    gs.insert(K_ZFS_POOLS, serde_json::to_value(&reports).context("serializing pool report")?);
    gs.insert(
        K_ZFS_POOL_NAMES,
        json!(reports.iter().map(|r| r.name.clone()).collect::<Vec<_>>()),
    );
    Ok(reports)
}

fn scan_pool(pool: &str) -> Result<PoolReport> {
    let status = Cmd::new("zpool").args(["status", pool]).allow_fail().run()?;
    let health = parse_pool_health(&status.stdout);

    let list = Cmd::new("zfs")
        .args(["list", "-r", "-H", "-o", "name,mountpoint"])
        .arg(pool)
        .allow_fail()
        .run()?;

    let existing_roots: Vec<RootDataset> = parse_root_datasets(&list.stdout)
        .into_iter()
        .map(|(dataset, mountpoint)| {
            let is_proxmox = dataset_is_proxmox(&dataset);
            RootDataset {
                dataset,
                mountpoint,
                is_proxmox,
            }
        })
        .collect();

    // A healthy pool is installable whether or not something lives on it;
    // the selection view decides between new/replace/alongside.
    let suitable_for_install = health == "ONLINE";

    Ok(PoolReport {
        name: pool.to_string(),
        health,
        existing_roots,
        suitable_for_install,
    })
}

/// Mount the dataset at a scratch path and look for Proxmox indicators.
fn dataset_is_proxmox(dataset: &str) -> bool {
    let mount_dir = format!("/tmp/zforge_check_{}", dataset.replace('/', "_"));
    if std::fs::create_dir_all(&mount_dir).is_err() {
        return false;
    }

    let mounted = Cmd::new("mount")
        .args(["-t", "zfs", "-o", "ro"])
        .arg(dataset)
        .arg(&mount_dir)
        .allow_fail()
        .run()
        .map(|r| r.success())
        .unwrap_or(false);
    if !mounted {
        let _ = std::fs::remove_dir(&mount_dir);
        return false;
    }

    let indicators = ["etc/pve", "usr/bin/pvecm", "etc/proxmox-ve-release"];
    let is_pve = indicators
        .iter()
        .any(|marker| std::path::Path::new(&mount_dir).join(marker).exists());

    let _ = run("umount", [mount_dir.as_str()]);
    let _ = std::fs::remove_dir(&mount_dir);
    is_pve
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_importable_pools() {
        let output = "   pool: rpool\n     id: 1234567890\n  state: ONLINE\n\n   pool: tank\n     id: 987654\n  state: DEGRADED\n";
        assert_eq!(parse_importable_pools(output), vec!["rpool", "tank"]);
    }

    #[test]
    fn test_parse_importable_pools_empty() {
        assert!(parse_importable_pools("no pools available to import\n").is_empty());
    }

    #[test]
    fn test_parse_pool_health() {
        let output = "  pool: rpool\n state: ONLINE\nconfig:\n\n\tNAME  STATE\n\trpool ONLINE\n";
        assert_eq!(parse_pool_health(output), "ONLINE");
        assert_eq!(parse_pool_health("garbage"), "UNKNOWN");
    }

    #[test]
    fn test_parse_root_datasets() {
        let output = "rpool\tnone\n\
                      rpool/ROOT\tnone\n\
                      rpool/ROOT/pve\t/\n\
                      rpool/data\t/data\n\
                      tank/legacy\t/\n";
        let roots = parse_root_datasets(output);
        assert_eq!(
            roots,
            vec![
                ("rpool/ROOT/pve".to_string(), "/".to_string()),
                ("tank/legacy".to_string(), "/".to_string()),
            ]
        );
    }
}
