//! Installer-side contracts: pool creation, wizard state machine, telemetry.

use serde_json::json;
use tempfile::TempDir;

use zforge::installer::globalstorage::*;
use zforge::installer::state::{PoolWizard, WizardState};
use zforge::installer::telemetry::{self, Hardware, Outcome};
use zforge::installer::zpool::{
    execute_plan, plan_pool_creation, PoolName, TARGET_ROOT,
};
use zforge::spec::RaidType;

/// The documented acceptance regex: `^[A-Za-z][A-Za-z0-9._-]*[A-Za-z0-9_.]$`.
fn matches_contract_regex(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    if !bytes[0].is_ascii_alphabetic() {
        return false;
    }
    let middle_ok = name[1..name.len() - 1]
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    let last = bytes[bytes.len() - 1];
    middle_ok && (last.is_ascii_alphanumeric() || matches!(last, b'.' | b'_'))
}

#[test]
fn test_pool_name_validation_agrees_with_contract_regex() {
    let samples = [
        "rpool", "tank", "bpool", "a1", "pool-name", "pool.name", "pool_name",
        "Pool9", "a-", "-a", "9pool", "a", "", "pool name", "pool/0", "päl",
        "z..z", "trailing-",
    ];
    for name in samples {
        assert_eq!(
            PoolName::parse(name).is_ok(),
            matches_contract_regex(name),
            "disagreement on '{name}'"
        );
    }
}

// Scenario: encrypted mirror creation from seeded globalstorage.
#[test]
fn test_encrypted_mirror_pool_creation_contract() {
    let mut gs = GlobalStorage::new();
    gs.insert(K_OPERATION_MODE, json!("new_pool"));
    gs.insert(K_NEW_POOL_NAME, json!("rpool"));
    gs.insert(K_NEW_POOL_RAID, json!("mirror"));
    gs.insert(K_NEW_POOL_DISKS, json!(["sda", "sdb"]));
    gs.insert(K_ASHIFT, json!("12"));
    gs.insert(K_COMPRESSION, json!("lz4"));
    gs.insert(K_ENCRYPTION_ENABLED, json!(true));
    gs.insert(K_ENCRYPTION_ALGORITHM, json!("aes-256-gcm"));
    gs.insert(K_ENCRYPTION_PASSPHRASE, json!("correct horse battery staple"));

    let mut plan = plan_pool_creation(&gs).unwrap();

    // The create argv honors RAID layout and the encryption contract.
    let argv = plan.create.join(" ");
    assert!(argv.contains("mirror sda sdb"));
    assert!(argv.contains("-O encryption=aes-256-gcm"));
    assert!(argv.contains("-O keyformat=passphrase"));
    assert!(argv.contains("-O keylocation=file:///run/.zforge-key"));
    assert!(argv.contains("-R /mnt/target"));

    // Drive the plan with a recording runner and a relocated keyfile.
    let tmp = TempDir::new().unwrap();
    let keyfile = tmp.path().join("zforge-key");
    plan.keyfile.as_mut().unwrap().path = keyfile.clone();

    let mut executed: Vec<String> = Vec::new();
    execute_plan(&plan, &mut |command| {
        if command[1] == "create" {
            assert!(keyfile.exists(), "keyfile must exist during zpool create");
        } else {
            assert!(!keyfile.exists(), "keyfile must be gone after create");
        }
        executed.push(command.join(" "));
        Ok(())
    })
    .unwrap();

    // After creation the keyfile path no longer exists...
    assert!(!keyfile.exists());
    // ...and the pool is told to prompt at boot.
    assert!(executed.contains(&"zfs set keylocation=prompt rpool".to_string()));
    // Dataset layout, export, altroot re-import.
    assert!(executed
        .iter()
        .any(|c| c == "zfs create -o canmount=off -o mountpoint=none rpool/ROOT"));
    assert!(executed
        .iter()
        .any(|c| c == "zfs create -o mountpoint=/ -o canmount=noauto rpool/ROOT/pve"));
    let export = executed.iter().position(|c| c == "zpool export rpool");
    let import = executed
        .iter()
        .position(|c| c == &format!("zpool import -R {TARGET_ROOT} rpool"));
    assert!(export.unwrap() < import.unwrap());

    // The passphrase is ephemeral: scrub must clear it before persistence.
    gs.scrub_ephemeral();
    assert!(!gs.contains(K_ENCRYPTION_PASSPHRASE));
}

#[test]
fn test_unencrypted_pool_has_no_key_options() {
    let mut gs = GlobalStorage::new();
    gs.insert(K_NEW_POOL_NAME, json!("tank"));
    gs.insert(K_NEW_POOL_RAID, json!("raidz2"));
    gs.insert(K_NEW_POOL_DISKS, json!(["sda", "sdb", "sdc", "sdd"]));

    let plan = plan_pool_creation(&gs).unwrap();
    assert!(plan.keyfile.is_none());
    let argv = plan.create.join(" ");
    assert!(!argv.contains("keylocation"));
    assert!(!argv.contains("keyformat"));
    assert!(argv.contains("raidz2 sda sdb sdc sdd"));
}

#[test]
fn test_invalid_pool_name_rejected_before_any_command() {
    let mut gs = GlobalStorage::new();
    gs.insert(K_NEW_POOL_NAME, json!("1badname"));
    gs.insert(K_NEW_POOL_RAID, json!("stripe"));
    gs.insert(K_NEW_POOL_DISKS, json!(["sda"]));
    assert!(plan_pool_creation(&gs).is_err());
}

// State machine: full new-pool walk with back transitions from confirmed.
#[test]
fn test_wizard_walks_and_reopens_without_loss() {
    let mut wizard = PoolWizard::new();
    wizard
        .choose_new_pool("rpool", vec!["sda".into(), "sdb".into()])
        .unwrap();
    wizard.select_raid(RaidType::Mirror).unwrap();
    wizard
        .set_properties(vec![
            ("zfs_compression".into(), "zstd-3".into()),
            ("zfs_ashift".into(), "12".into()),
        ])
        .unwrap();
    wizard.set_encryption(Some("hunter2hunter2".into())).unwrap();
    wizard.confirm().unwrap();

    // Reopen from confirmed: nothing is lost.
    assert!(wizard.back());
    assert_eq!(wizard.state(), WizardState::EncryptionSet);
    assert_eq!(wizard.data.passphrase.as_deref(), Some("hunter2hunter2"));
    assert_eq!(wizard.data.disks.len(), 2);

    wizard.confirm().unwrap();
    let mut gs = GlobalStorage::new();
    wizard.write_globalstorage(&mut gs).unwrap();

    assert_eq!(gs.str_value(K_OPERATION_MODE), Some("new_pool"));
    assert_eq!(gs.str_value(K_NEW_POOL_RAID), Some("mirror"));
    assert_eq!(gs.str_value("zfs_compression"), Some("zstd-3"));
    assert!(gs.bool_value(K_ENCRYPTION_ENABLED));

    // The wizard output feeds straight into pool creation.
    let plan = plan_pool_creation(&gs).unwrap();
    assert!(plan.create.join(" ").contains("mirror sda sdb"));
}

// Scenario: consent unchecked means no submission attempt at all.
#[test]
fn test_telemetry_without_consent_is_skipped() {
    let mut gs = GlobalStorage::new();
    gs.insert(K_TELEMETRY_CONSENT, json!(false));
    gs.insert(
        K_TELEMETRY_ENDPOINT,
        json!("https://telemetry.invalid/submit"),
    );

    let outcome = telemetry::run(&gs, Hardware::default(), "success");
    assert_eq!(outcome, Outcome::SkippedNoConsent);
}

#[test]
fn test_telemetry_failure_never_propagates() {
    let mut gs = GlobalStorage::new();
    gs.insert(K_TELEMETRY_CONSENT, json!(true));
    // A closed port on localhost: the POST fails fast, and run() absorbs it.
    gs.insert(K_TELEMETRY_ENDPOINT, json!("http://127.0.0.1:9/submit"));

    let outcome = telemetry::run(&gs, Hardware::default(), "success");
    assert_eq!(outcome, Outcome::Failed);
}

#[test]
fn test_globalstorage_file_round_trip_preserves_contract_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("globalstorage.json");

    let mut gs = GlobalStorage::new();
    gs.insert(K_OPERATION_MODE, json!("existing_pool"));
    gs.insert(K_INSTALL_POOL, json!("rpool"));
    gs.insert(K_INSTALL_DATASET, json!("rpool/ROOT/pve"));
    gs.insert(K_INSTALL_MODE, json!("alongside"));
    gs.insert(K_HARDENING_PROFILE, json!("server"));
    gs.save(&path).unwrap();

    let loaded = GlobalStorage::load(&path).unwrap();
    assert_eq!(loaded.operation_mode().unwrap(), OperationMode::ExistingPool);
    assert_eq!(loaded.install_mode().unwrap(), InstallMode::Alongside);
    assert_eq!(loaded.str_value(K_HARDENING_PROFILE), Some("server"));
}
