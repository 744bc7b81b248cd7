//! Pool-creation wizard state machine.
//!
//! Drives the `zfsrootselect` view: mode selection branches into the
//! new-pool or existing-pool path, every state can go back to its
//! predecessor, and reopening from `Confirmed` loses no collected input.

use anyhow::{bail, Result};
use serde_json::json;

use crate::installer::globalstorage::{self as gs_keys, GlobalStorage, InstallMode};
use crate::spec::RaidType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardState {
    ModeSelect,
    // New-pool path
    DisksSelected,
    RaidSelected,
    PropertiesSet,
    EncryptionSet,
    // Existing-pool path
    PoolSelected,
    InstallModeSelected,
    ExistingPropertiesSet,
    // Terminal
    Confirmed,
}

/// Collected wizard input. Fields stay populated across back transitions.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WizardData {
    pub new_pool: bool,
    pub pool_name: String,
    pub disks: Vec<String>,
    pub raid: Option<RaidType>,
    pub properties: Vec<(String, String)>,
    pub encryption_enabled: bool,
    pub passphrase: Option<String>,
    pub existing_pool: Option<String>,
    pub install_mode: Option<InstallMode>,
}

#[derive(Debug)]
pub struct PoolWizard {
    state: WizardState,
    pub data: WizardData,
    /// Stack of visited states for back transitions.
    history: Vec<WizardState>,
}

impl Default for PoolWizard {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolWizard {
    pub fn new() -> Self {
        Self {
            state: WizardState::ModeSelect,
            data: WizardData::default(),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    fn advance(&mut self, next: WizardState) {
        self.history.push(self.state);
        self.state = next;
    }

    /// Return to the previous state. Input already collected is kept; from
    /// `Confirmed` this reopens the last input step without data loss.
    pub fn back(&mut self) -> bool {
        match self.history.pop() {
            Some(previous) => {
                self.state = previous;
                true
            }
            None => false,
        }
    }

    pub fn choose_new_pool(&mut self, pool_name: &str, disks: Vec<String>) -> Result<()> {
        self.expect_state(WizardState::ModeSelect)?;
        if disks.is_empty() {
            bail!("at least one disk must be selected");
        }
        self.data.new_pool = true;
        self.data.pool_name = pool_name.to_string();
        self.data.disks = disks;
        self.advance(WizardState::DisksSelected);
        Ok(())
    }

    pub fn choose_existing_pool(&mut self, pool: &str) -> Result<()> {
        self.expect_state(WizardState::ModeSelect)?;
        self.data.new_pool = false;
        self.data.existing_pool = Some(pool.to_string());
        self.advance(WizardState::PoolSelected);
        Ok(())
    }

    pub fn select_raid(&mut self, raid: RaidType) -> Result<()> {
        self.expect_state(WizardState::DisksSelected)?;
        if self.data.disks.len() < raid.min_disks() {
            bail!(
                "{} requires at least {} disks",
                raid.as_str(),
                raid.min_disks()
            );
        }
        self.data.raid = Some(raid);
        self.advance(WizardState::RaidSelected);
        Ok(())
    }

    pub fn set_properties(&mut self, properties: Vec<(String, String)>) -> Result<()> {
        match self.state() {
            WizardState::RaidSelected => {
                self.data.properties = properties;
                self.advance(WizardState::PropertiesSet);
                Ok(())
            }
            WizardState::InstallModeSelected => {
                self.data.properties = properties;
                self.advance(WizardState::ExistingPropertiesSet);
                Ok(())
            }
            state => bail!("cannot set properties in state {state:?}"),
        }
    }

    /// Optional on the new-pool path.
    pub fn set_encryption(&mut self, passphrase: Option<String>) -> Result<()> {
        self.expect_state(WizardState::PropertiesSet)?;
        self.data.encryption_enabled = passphrase.is_some();
        self.data.passphrase = passphrase;
        self.advance(WizardState::EncryptionSet);
        Ok(())
    }

    pub fn select_install_mode(&mut self, mode: InstallMode) -> Result<()> {
        self.expect_state(WizardState::PoolSelected)?;
        self.data.install_mode = Some(mode);
        self.advance(WizardState::InstallModeSelected);
        Ok(())
    }

    /// Terminal transition; allowed from every fully-specified state.
    pub fn confirm(&mut self) -> Result<()> {
        match self.state() {
            WizardState::PropertiesSet | WizardState::EncryptionSet if self.data.new_pool => {}
            WizardState::InstallModeSelected | WizardState::ExistingPropertiesSet
                if !self.data.new_pool => {}
            state => bail!("cannot confirm from state {state:?}"),
        }
        self.advance(WizardState::Confirmed);
        Ok(())
    }

    /// Write the collected choices to globalstorage. Only valid once
    /// confirmed.
    pub fn write_globalstorage(&self, gs: &mut GlobalStorage) -> Result<()> {
        self.expect_state(WizardState::Confirmed)?;

        if self.data.new_pool {
            gs.insert(gs_keys::K_OPERATION_MODE, json!("new_pool"));
            gs.insert(gs_keys::K_NEW_POOL_NAME, json!(self.data.pool_name));
            gs.insert(gs_keys::K_NEW_POOL_DISKS, json!(self.data.disks));
            if let Some(raid) = self.data.raid {
                gs.insert(gs_keys::K_NEW_POOL_RAID, json!(raid.as_str()));
            }
            gs.insert(
                gs_keys::K_ENCRYPTION_ENABLED,
                json!(self.data.encryption_enabled),
            );
            if let Some(passphrase) = &self.data.passphrase {
                gs.insert(gs_keys::K_ENCRYPTION_PASSPHRASE, json!(passphrase));
            }
        } else {
            gs.insert(gs_keys::K_OPERATION_MODE, json!("existing_pool"));
            if let Some(pool) = &self.data.existing_pool {
                gs.insert(gs_keys::K_INSTALL_POOL, json!(pool));
            }
            if let Some(mode) = self.data.install_mode {
                gs.insert(gs_keys::K_INSTALL_MODE, json!(mode.as_str()));
            }
        }
        for (prop, value) in &self.data.properties {
            gs.insert(prop, json!(value));
        }
        Ok(())
    }

    fn expect_state(&self, expected: WizardState) -> Result<()> {
        if self.state() != expected {
            bail!(
                "invalid transition: expected {expected:?}, currently {:?}",
                self.state()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::globalstorage::K_OPERATION_MODE;

    fn disks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_pool_happy_path() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda", "sdb"])).unwrap();
        wizard.select_raid(RaidType::Mirror).unwrap();
        wizard
            .set_properties(vec![("zfs_compression".into(), "lz4".into())])
            .unwrap();
        wizard
            .set_encryption(Some("correct horse battery staple".into()))
            .unwrap();
        wizard.confirm().unwrap();
        assert_eq!(wizard.state(), WizardState::Confirmed);

        let mut gs = GlobalStorage::new();
        wizard.write_globalstorage(&mut gs).unwrap();
        assert_eq!(gs.str_value(K_OPERATION_MODE), Some("new_pool"));
        assert_eq!(gs.str_value("zfs_compression"), Some("lz4"));
    }

    #[test]
    fn test_encryption_step_is_optional() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda"])).unwrap();
        wizard.select_raid(RaidType::Stripe).unwrap();
        wizard.set_properties(vec![]).unwrap();
        wizard.confirm().unwrap();
        assert_eq!(wizard.state(), WizardState::Confirmed);
    }

    #[test]
    fn test_existing_pool_path() {
        let mut wizard = PoolWizard::new();
        wizard.choose_existing_pool("tank").unwrap();
        wizard.select_install_mode(InstallMode::Alongside).unwrap();
        wizard.confirm().unwrap();

        let mut gs = GlobalStorage::new();
        wizard.write_globalstorage(&mut gs).unwrap();
        assert_eq!(gs.str_value(K_OPERATION_MODE), Some("existing_pool"));
        assert_eq!(gs.str_value("install_mode"), Some("alongside"));
    }

    #[test]
    fn test_back_transitions_keep_data() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda", "sdb"])).unwrap();
        wizard.select_raid(RaidType::Mirror).unwrap();
        assert!(wizard.back());
        assert_eq!(wizard.state(), WizardState::DisksSelected);
        // Collected input survives the back transition.
        assert_eq!(wizard.data.disks, disks(&["sda", "sdb"]));
        assert_eq!(wizard.data.raid, Some(RaidType::Mirror));

        // And the path can be replayed forward.
        wizard.select_raid(RaidType::Raidz1).unwrap();
        assert_eq!(wizard.data.raid, Some(RaidType::Raidz1));
    }

    #[test]
    fn test_back_from_confirmed_reopens_without_loss() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda"])).unwrap();
        wizard.select_raid(RaidType::Stripe).unwrap();
        wizard.set_properties(vec![("zfs_atime".into(), "off".into())]).unwrap();
        wizard.confirm().unwrap();

        assert!(wizard.back());
        assert_eq!(wizard.state(), WizardState::PropertiesSet);
        assert_eq!(wizard.data.properties, vec![("zfs_atime".to_string(), "off".to_string())]);

        wizard.confirm().unwrap();
        assert_eq!(wizard.state(), WizardState::Confirmed);
    }

    #[test]
    fn test_back_at_start_is_a_noop() {
        let mut wizard = PoolWizard::new();
        assert!(!wizard.back());
        assert_eq!(wizard.state(), WizardState::ModeSelect);
    }

    #[test]
    fn test_raid_disk_minimums_enforced() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda"])).unwrap();
        assert!(wizard.select_raid(RaidType::Raidz2).is_err());
        assert_eq!(wizard.state(), WizardState::DisksSelected);
    }

    #[test]
    fn test_confirm_requires_complete_path() {
        let mut wizard = PoolWizard::new();
        wizard.choose_new_pool("rpool", disks(&["sda"])).unwrap();
        assert!(wizard.confirm().is_err());
    }

    #[test]
    fn test_globalstorage_requires_confirmed() {
        let wizard = PoolWizard::new();
        let mut gs = GlobalStorage::new();
        assert!(wizard.write_globalstorage(&mut gs).is_err());
    }
}
