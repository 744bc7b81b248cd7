//! Pool creation contract: name validation, `zpool create` argv construction,
//! dataset layout and the ephemeral keyfile lifecycle.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use crate::installer::globalstorage::{self as gs_keys, GlobalStorage};
use crate::process;
use crate::spec::RaidType;

/// tmpfs-backed path the passphrase keyfile briefly lives at.
pub const KEYFILE_PATH: &str = "/run/.zforge-key";

/// Where the target system is assembled during installation.
pub const TARGET_ROOT: &str = "/mnt/target";

/// Default dataset for the installed root, relative to the pool.
pub const DEFAULT_INSTALL_DATASET: &str = "ROOT/pve";

/// Syntactically valid pool name: `^[A-Za-z][A-Za-z0-9._-]*[A-Za-z0-9_.]$`.
///
/// First character a letter, the rest alphanumeric plus `_-.`, and no
/// trailing hyphen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolName(String);

impl PoolName {
    pub fn parse(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.len() < 2 {
            bail!("pool name '{name}' is too short");
        }
        if !bytes[0].is_ascii_alphabetic() {
            bail!("pool name '{name}' must begin with a letter");
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            bail!("pool name '{name}' contains invalid character '{bad}'");
        }
        if bytes[bytes.len() - 1] == b'-' {
            bail!("pool name '{name}' must not end with a hyphen");
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionRequest {
    pub algorithm: String,
    pub passphrase: String,
}

/// Everything needed to build the `zpool create` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub name: PoolName,
    pub raid: RaidType,
    pub disks: Vec<String>,
    /// `-o ashift=N` when present.
    pub ashift: Option<u8>,
    /// Root filesystem properties applied with `-O`.
    pub fs_props: Vec<(String, String)>,
    pub encryption: Option<EncryptionRequest>,
    pub altroot: Option<String>,
    pub mountpoint: String,
    pub install_dataset: String,
}

impl CreateRequest {
    /// Build a request from the keys the view modules wrote.
    pub fn from_globalstorage(gs: &GlobalStorage) -> Result<Self> {
        let name = PoolName::parse(gs.require_str(gs_keys::K_NEW_POOL_NAME)?)?;
        let raid = gs.raid_type()?;
        let disks = gs.string_list(gs_keys::K_NEW_POOL_DISKS);
        if disks.is_empty() {
            bail!("no disks selected for the new pool");
        }
        if disks.len() < raid.min_disks() {
            bail!(
                "{} requires at least {} disks, got {}",
                raid.as_str(),
                raid.min_disks(),
                disks.len()
            );
        }

        let ashift = match gs.str_value(gs_keys::K_ASHIFT) {
            None | Some("auto") => None,
            Some(v) => Some(
                v.parse::<u8>()
                    .with_context(|| format!("invalid ashift '{v}'"))?,
            ),
        };

        let mut fs_props = vec![
            ("acltype".to_string(), "posixacl".to_string()),
            ("relatime".to_string(), "on".to_string()),
        ];
        for (key, prop) in [
            (gs_keys::K_COMPRESSION, "compression"),
            (gs_keys::K_RECORDSIZE, "recordsize"),
            (gs_keys::K_ATIME, "atime"),
            (gs_keys::K_XATTR, "xattr"),
            (gs_keys::K_DNODESIZE, "dnodesize"),
        ] {
            if let Some(value) = gs.str_value(key) {
                fs_props.push((prop.to_string(), value.to_string()));
            }
        }

        let encryption = if gs.bool_value(gs_keys::K_ENCRYPTION_ENABLED) {
            Some(EncryptionRequest {
                algorithm: gs
                    .str_value(gs_keys::K_ENCRYPTION_ALGORITHM)
                    .unwrap_or("aes-256-gcm")
                    .to_string(),
                passphrase: gs
                    .require_str(gs_keys::K_ENCRYPTION_PASSPHRASE)
                    .context("encryption enabled but no passphrase supplied")?
                    .to_string(),
            })
        } else {
            None
        };

        let install_dataset = gs
            .str_value(gs_keys::K_INSTALL_DATASET_RELATIVE)
            .unwrap_or(DEFAULT_INSTALL_DATASET)
            .to_string();

        Ok(Self {
            name,
            raid,
            disks,
            ashift,
            fs_props,
            encryption,
            altroot: Some(TARGET_ROOT.to_string()),
            mountpoint: "none".to_string(),
            install_dataset,
        })
    }

    /// The `zpool create` argv.
    pub fn create_argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = vec!["zpool".into(), "create".into(), "-f".into()];

        if let Some(altroot) = &self.altroot {
            argv.push("-R".into());
            argv.push(altroot.clone());
        }
        argv.push("-m".into());
        argv.push(self.mountpoint.clone());

        if let Some(ashift) = self.ashift {
            argv.push("-o".into());
            argv.push(format!("ashift={ashift}"));
        }

        for (prop, value) in &self.fs_props {
            argv.push("-O".into());
            argv.push(format!("{prop}={value}"));
        }

        if let Some(enc) = &self.encryption {
            for opt in [
                format!("encryption={}", enc.algorithm),
                "keyformat=passphrase".to_string(),
                format!("keylocation=file://{KEYFILE_PATH}"),
            ] {
                argv.push("-O".into());
                argv.push(opt);
            }
        }

        argv.push(self.name.as_str().to_string());

        if self.raid != RaidType::Stripe {
            argv.push(self.raid.as_str().to_string());
        }
        argv.extend(self.disks.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyfile {
    pub path: PathBuf,
    pub passphrase: String,
}

/// The ordered command sequence that creates and prepares a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolCreationPlan {
    /// Written with mode 0600 immediately before the create command and
    /// deleted immediately after it.
    pub keyfile: Option<Keyfile>,
    pub create: Vec<String>,
    /// Commands run after the keyfile is gone: keylocation reset, dataset
    /// layout, export and altroot re-import.
    pub post: Vec<Vec<String>>,
}

/// Plan pool creation from globalstorage.
pub fn plan_pool_creation(gs: &GlobalStorage) -> Result<PoolCreationPlan> {
    let request = CreateRequest::from_globalstorage(gs)?;
    Ok(plan_from_request(&request))
}

pub fn plan_from_request(request: &CreateRequest) -> PoolCreationPlan {
    let pool = request.name.as_str();
    let dataset = format!("{pool}/{}", request.install_dataset);

    let mut post: Vec<Vec<String>> = Vec::new();

    // Boot must prompt for the passphrase; the keyfile is only for create.
    if request.encryption.is_some() {
        post.push(argv(["zfs", "set", "keylocation=prompt", pool]));
    }

    // Container dataset, then the installed root.
    post.push(argv([
        "zfs",
        "create",
        "-o",
        "canmount=off",
        "-o",
        "mountpoint=none",
        &format!("{pool}/ROOT"),
    ]));
    post.push(argv([
        "zfs",
        "create",
        "-o",
        "mountpoint=/",
        "-o",
        "canmount=noauto",
        &dataset,
    ]));

    // Export/import cycle locks every mountpoint under the target root.
    post.push(argv(["zpool", "export", pool]));
    post.push(argv(["zpool", "import", "-R", TARGET_ROOT, pool]));
    post.push(argv(["zfs", "mount", &dataset]));

    PoolCreationPlan {
        keyfile: request.encryption.as_ref().map(|enc| Keyfile {
            path: PathBuf::from(KEYFILE_PATH),
            passphrase: enc.passphrase.clone(),
        }),
        create: request.create_argv(),
        post,
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Execute a creation plan with the given command runner.
///
/// The keyfile exists only across the create command: written with mode 0600
/// right before, removed right after, even when the create fails.
pub fn execute_plan(
    plan: &PoolCreationPlan,
    run: &mut dyn FnMut(&[String]) -> Result<()>,
) -> Result<()> {
    if let Some(keyfile) = &plan.keyfile {
        write_keyfile(keyfile)?;
    }

    let create_result = run(&plan.create);

    if let Some(keyfile) = &plan.keyfile {
        if let Err(e) = fs::remove_file(&keyfile.path) {
            log::error!(
                "failed to remove keyfile '{}': {}",
                keyfile.path.display(),
                e
            );
        }
    }
    create_result.context("zpool create failed")?;

    for command in &plan.post {
        run(command).with_context(|| format!("'{}' failed", command.join(" ")))?;
    }
    Ok(())
}

fn write_keyfile(keyfile: &Keyfile) -> Result<()> {
    fs::write(&keyfile.path, &keyfile.passphrase)
        .with_context(|| format!("writing keyfile '{}'", keyfile.path.display()))?;
    let mut perms = fs::metadata(&keyfile.path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(&keyfile.path, perms)
        .with_context(|| format!("restricting keyfile '{}'", keyfile.path.display()))?;
    Ok(())
}

/// Shell-out runner used by the `zforge-install create-pool` job.
pub fn run_command(command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    process::run(program, args.iter().map(String::as_str))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::globalstorage::*;
    use serde_json::json;

    fn seeded_storage() -> GlobalStorage {
        let mut gs = GlobalStorage::new();
        gs.insert(K_OPERATION_MODE, json!("new_pool"));
        gs.insert(K_NEW_POOL_NAME, json!("rpool"));
        gs.insert(K_NEW_POOL_RAID, json!("mirror"));
        gs.insert(K_NEW_POOL_DISKS, json!(["sda", "sdb"]));
        gs.insert(K_ASHIFT, json!("12"));
        gs.insert(K_COMPRESSION, json!("lz4"));
        gs
    }

    #[test]
    fn test_pool_name_rules() {
        for good in ["rpool", "tank", "pool_1", "a.b-c", "Zfs2"] {
            PoolName::parse(good).unwrap();
        }
        for bad in ["", "a", "1pool", "-pool", "pool-", "po ol", "rp/ool", "päl"] {
            assert!(PoolName::parse(bad).is_err(), "'{bad}' should be rejected");
        }
    }

    #[test]
    fn test_create_argv_plain_mirror() {
        let gs = seeded_storage();
        let request = CreateRequest::from_globalstorage(&gs).unwrap();
        let argv = request.create_argv();

        assert_eq!(&argv[..3], &["zpool", "create", "-f"]);
        assert!(argv.windows(2).any(|w| w == ["-R", TARGET_ROOT]));
        assert!(argv.windows(2).any(|w| w == ["-o", "ashift=12"]));
        assert!(argv.windows(2).any(|w| w == ["-O", "compression=lz4"]));
        let tail: Vec<&str> = argv.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["mirror", "sda", "sdb"]);
    }

    #[test]
    fn test_create_argv_stripe_has_no_vdev_keyword() {
        let mut gs = seeded_storage();
        gs.insert(K_NEW_POOL_RAID, json!("stripe"));
        gs.insert(K_NEW_POOL_DISKS, json!(["sda"]));
        let argv = CreateRequest::from_globalstorage(&gs)
            .unwrap()
            .create_argv();
        assert!(!argv.contains(&"stripe".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some("sda"));
    }

    #[test]
    fn test_encryption_options_and_key_lifecycle() {
        let mut gs = seeded_storage();
        gs.insert(K_ENCRYPTION_ENABLED, json!(true));
        gs.insert(K_ENCRYPTION_ALGORITHM, json!("aes-256-gcm"));
        gs.insert(
            K_ENCRYPTION_PASSPHRASE,
            json!("correct horse battery staple"),
        );

        let plan = plan_pool_creation(&gs).unwrap();
        let argv = &plan.create;
        assert!(argv.windows(2).any(|w| w == ["-O", "encryption=aes-256-gcm"]));
        assert!(argv.windows(2).any(|w| w == ["-O", "keyformat=passphrase"]));
        assert!(argv
            .windows(2)
            .any(|w| w == ["-O", "keylocation=file:///run/.zforge-key"]));

        // keylocation flips to prompt right after creation.
        assert_eq!(
            plan.post[0],
            vec!["zfs", "set", "keylocation=prompt", "rpool"]
        );
    }

    #[test]
    fn test_plan_dataset_layout_and_reimport() {
        let gs = seeded_storage();
        let plan = plan_pool_creation(&gs).unwrap();

        let rendered: Vec<String> = plan.post.iter().map(|c| c.join(" ")).collect();
        assert!(rendered
            .iter()
            .any(|c| c == "zfs create -o canmount=off -o mountpoint=none rpool/ROOT"));
        assert!(rendered
            .iter()
            .any(|c| c == "zfs create -o mountpoint=/ -o canmount=noauto rpool/ROOT/pve"));

        let export = rendered.iter().position(|c| c == "zpool export rpool").unwrap();
        let import = rendered
            .iter()
            .position(|c| c == "zpool import -R /mnt/target rpool")
            .unwrap();
        assert!(export < import);
    }

    #[test]
    fn test_execute_plan_keyfile_is_transient_and_0600() {
        let tmp = tempfile::TempDir::new().unwrap();
        let keyfile_path = tmp.path().join("key");

        let gs = {
            let mut gs = seeded_storage();
            gs.insert(K_ENCRYPTION_ENABLED, json!(true));
            gs.insert(K_ENCRYPTION_PASSPHRASE, json!("correct horse battery staple"));
            gs
        };
        let mut plan = plan_pool_creation(&gs).unwrap();
        plan.keyfile.as_mut().unwrap().path = keyfile_path.clone();

        let mut seen_mode = None;
        let mut commands = Vec::new();
        execute_plan(&plan, &mut |command| {
            if command[..2] == ["zpool".to_string(), "create".to_string()] {
                let meta = fs::metadata(&keyfile_path).expect("keyfile present during create");
                seen_mode = Some(meta.permissions().mode() & 0o777);
                assert_eq!(
                    fs::read_to_string(&keyfile_path).unwrap(),
                    "correct horse battery staple"
                );
            }
            commands.push(command.join(" "));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen_mode, Some(0o600));
        assert!(!keyfile_path.exists(), "keyfile must be deleted after create");
        assert_eq!(commands.len(), 1 + plan.post.len());
    }

    #[test]
    fn test_execute_plan_removes_keyfile_on_create_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let keyfile_path = tmp.path().join("key");

        let plan = PoolCreationPlan {
            keyfile: Some(Keyfile {
                path: keyfile_path.clone(),
                passphrase: "secret".to_string(),
            }),
            create: vec!["zpool".into(), "create".into()],
            post: vec![],
        };

        let result = execute_plan(&plan, &mut |_| anyhow::bail!("device busy"));
        assert!(result.is_err());
        assert!(!keyfile_path.exists());
    }

    #[test]
    fn test_mirror_needs_two_disks() {
        let mut gs = seeded_storage();
        gs.insert(K_NEW_POOL_DISKS, json!(["sda"]));
        assert!(CreateRequest::from_globalstorage(&gs).is_err());
    }
}
