//! The globalstorage contract between installer view and job modules.
//!
//! View modules write a JSON map; job modules read it through the typed
//! accessors here. The key set is frozen together with the builder: both
//! sides are versioned as one.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::spec::RaidType;

// Pool creation
pub const K_OPERATION_MODE: &str = "zfs_operation_mode";
pub const K_NEW_POOL_NAME: &str = "zfs_new_pool_name";
pub const K_NEW_POOL_RAID: &str = "zfs_new_pool_raid_type";
pub const K_NEW_POOL_DISKS: &str = "zfs_new_pool_disks";
pub const K_NEW_POOL_COMMAND: &str = "zfs_new_pool_command";
pub const K_INSTALL_DATASET_RELATIVE: &str = "zfs_install_dataset_relative";

// Existing-pool installs
pub const K_INSTALL_POOL: &str = "install_pool";
pub const K_INSTALL_DATASET: &str = "install_dataset";
pub const K_INSTALL_MODE: &str = "install_mode";

// Dataset properties
pub const K_COMPRESSION: &str = "zfs_compression";
pub const K_RECORDSIZE: &str = "zfs_recordsize";
pub const K_ASHIFT: &str = "zfs_ashift";
pub const K_ATIME: &str = "zfs_atime";
pub const K_XATTR: &str = "zfs_xattr";
pub const K_DNODESIZE: &str = "zfs_dnodesize";
pub const K_ARC_MAX: &str = "zfs_arc_max";

// Encryption
pub const K_ENCRYPTION_ENABLED: &str = "zfs_encryption_enabled";
pub const K_ENCRYPTION_ALGORITHM: &str = "zfs_encryption_algorithm";
pub const K_ENCRYPTION_KEYFORMAT: &str = "zfs_encryption_keyformat";
pub const K_ENCRYPTION_KEYLOCATION: &str = "zfs_encryption_keylocation";
pub const K_ENCRYPTION_PASSPHRASE: &str = "zfs_encryption_passphrase";

// Installer-wide
pub const K_HARDENING_PROFILE: &str = "security_hardening_profile";
pub const K_TELEMETRY_CONSENT: &str = "telemetry_consent_given";
pub const K_TELEMETRY_ENDPOINT: &str = "telemetry_endpoint_url";
pub const K_ROOT_MOUNT_POINT: &str = "rootMountPoint";
pub const K_ISO_VERSION: &str = "iso_version";

// Bootloader
pub const K_BOOT_MODE: &str = "boot_mode";
pub const K_SECONDARY_BOOT_DEVICE: &str = "secondary_boot_device";
pub const K_ESP_DEVICE: &str = "esp_device";

/// Keys that must never survive past pool creation.
const EPHEMERAL_KEYS: &[&str] = &[K_ENCRYPTION_PASSPHRASE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    NewPool,
    ExistingPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    New,
    Replace,
    Alongside,
}

impl InstallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::New => "new",
            InstallMode::Replace => "replace",
            InstallMode::Alongside => "alongside",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GlobalStorage {
    map: Map<String, Value>,
}

impl GlobalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading globalstorage '{}'", path.display()))?;
        let map = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing globalstorage '{}'", path.display()))?;
        Ok(Self { map })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.map).context("serializing globalstorage")?;
        fs::write(path, json)
            .with_context(|| format!("writing globalstorage '{}'", path.display()))?;
        Ok(())
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    pub fn bool_value(&self, key: &str) -> bool {
        self.map.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.map
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str_value(key)
            .ok_or_else(|| anyhow::anyhow!("globalstorage key '{key}' is missing or not a string"))
    }

    pub fn operation_mode(&self) -> Result<OperationMode> {
        match self.require_str(K_OPERATION_MODE)? {
            "new_pool" => Ok(OperationMode::NewPool),
            "existing_pool" => Ok(OperationMode::ExistingPool),
            other => anyhow::bail!("invalid {K_OPERATION_MODE} '{other}'"),
        }
    }

    pub fn install_mode(&self) -> Result<InstallMode> {
        match self.require_str(K_INSTALL_MODE)? {
            "new" => Ok(InstallMode::New),
            "replace" => Ok(InstallMode::Replace),
            "alongside" => Ok(InstallMode::Alongside),
            other => anyhow::bail!("invalid {K_INSTALL_MODE} '{other}'"),
        }
    }

    pub fn raid_type(&self) -> Result<RaidType> {
        self.require_str(K_NEW_POOL_RAID)?.parse()
    }

    /// Clear passphrases and other ephemeral values. The installer pipeline
    /// calls this right after pool creation; the map must never hit
    /// persistent storage with them present.
    pub fn scrub_ephemeral(&mut self) {
        for key in EPHEMERAL_KEYS {
            self.map.remove(*key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}
