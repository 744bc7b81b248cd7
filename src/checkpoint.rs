//! Durable per-module checkpoint records.
//!
//! Each module's last completion is recorded under `state/checkpoints.json`
//! together with an opaque resume payload the module may hand back. The
//! pipeline runner is the only writer. `--resume` advances to the first
//! module whose record is not a success.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CHECKPOINT_FILE: &str = "checkpoints.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub status: CheckpointStatus,
    pub finished_at_utc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque module-owned payload (e.g. the resolved kernel version).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    /// ISO label + version tag of the build these records belong to.
    #[serde(default)]
    build_label: String,
    #[serde(default)]
    modules: BTreeMap<String, Checkpoint>,
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    data: StoreData,
}

impl CheckpointStore {
    /// Load the store from the workspace state directory, or start empty.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CHECKPOINT_FILE);
        let data = if path.is_file() {
            let bytes = fs::read(&path)
                .with_context(|| format!("reading checkpoint store '{}'", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing checkpoint store '{}'", path.display()))?
        } else {
            StoreData::default()
        };
        Ok(Self { path, data })
    }

    pub fn set_build_label(&mut self, label: &str) -> Result<()> {
        self.data.build_label = label.to_string();
        self.save()
    }

    pub fn build_label(&self) -> &str {
        &self.data.build_label
    }

    pub fn get(&self, module: &str) -> Option<&Checkpoint> {
        self.data.modules.get(module)
    }

    /// Resume payload for a module, regardless of its last status.
    pub fn resume_data(&self, module: &str) -> Option<&serde_json::Value> {
        self.get(module).and_then(|c| c.resume.as_ref())
    }

    pub fn is_success(&self, module: &str) -> bool {
        matches!(
            self.get(module).map(|c| c.status),
            Some(CheckpointStatus::Success)
        )
    }

    pub fn record_success(
        &mut self,
        module: &str,
        resume: Option<serde_json::Value>,
    ) -> Result<()> {
        self.record(
            module,
            Checkpoint {
                status: CheckpointStatus::Success,
                finished_at_utc: now_utc(),
                error: None,
                resume,
            },
        )
    }

    pub fn record_error(&mut self, module: &str, error: &str) -> Result<()> {
        // Keep the previous resume payload so a corrected rerun can pick up
        // where the module left off.
        let resume = self.resume_data(module).cloned();
        self.record(
            module,
            Checkpoint {
                status: CheckpointStatus::Error,
                finished_at_utc: now_utc(),
                error: Some(error.to_string()),
                resume,
            },
        )
    }

    pub fn record_skipped(&mut self, module: &str) -> Result<()> {
        self.record(
            module,
            Checkpoint {
                status: CheckpointStatus::Skipped,
                finished_at_utc: now_utc(),
                error: None,
                resume: None,
            },
        )
    }

    fn record(&mut self, module: &str, checkpoint: Checkpoint) -> Result<()> {
        self.data.modules.insert(module.to_string(), checkpoint);
        self.save()
    }

    /// All records, for `inspect-checkpoint`.
    pub fn statuses(&self) -> impl Iterator<Item = (&str, &Checkpoint)> {
        self.data.modules.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.data).context("serializing checkpoints")?;
        // Write-then-rename so a crash mid-save never corrupts the store.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("writing checkpoint store '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("publishing checkpoint store '{}'", self.path.display()))?;
        Ok(())
    }
}

fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_records_persist_across_loads() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = CheckpointStore::load(tmp.path()).unwrap();
            store
                .record_success("Debootstrap", Some(serde_json::json!({"completed": true})))
                .unwrap();
            store.record_error("ZFSBuild", "dkms build failed").unwrap();
            store.record_skipped("ProxmoxIntegration").unwrap();
        }

        let store = CheckpointStore::load(tmp.path()).unwrap();
        assert!(store.is_success("Debootstrap"));
        assert!(!store.is_success("ZFSBuild"));
        assert_eq!(
            store.get("ZFSBuild").unwrap().error.as_deref(),
            Some("dkms build failed")
        );
        assert_eq!(
            store.get("ProxmoxIntegration").unwrap().status,
            CheckpointStatus::Skipped
        );
        assert_eq!(
            store.resume_data("Debootstrap").unwrap()["completed"],
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_error_keeps_previous_resume_payload() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::load(tmp.path()).unwrap();
        store
            .record_success(
                "KernelAcquisition",
                Some(serde_json::json!({"kernel_version": "6.8.12"})),
            )
            .unwrap();
        store
            .record_error("KernelAcquisition", "headers package broken")
            .unwrap();

        assert_eq!(
            store.resume_data("KernelAcquisition").unwrap()["kernel_version"],
            serde_json::json!("6.8.12")
        );
    }

    #[test]
    fn test_timestamps_are_rfc3339() {
        let tmp = TempDir::new().unwrap();
        let mut store = CheckpointStore::load(tmp.path()).unwrap();
        store.record_success("WorkspaceSetup", None).unwrap();
        let stamp = &store.get("WorkspaceSetup").unwrap().finished_at_utc;
        assert!(stamp.ends_with('Z'), "expected UTC stamp, got {stamp}");
    }
}
