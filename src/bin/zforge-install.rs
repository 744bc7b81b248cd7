//! zforge-install: installer-side job runner.
//!
//! Staged into the live rootfs; the Calamares job module descriptors invoke
//! it with a subcommand and the globalstorage JSON file the view modules
//! wrote.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use zforge::installer::bootloader::BootloaderInstall;
use zforge::installer::globalstorage::{self as gs_keys, GlobalStorage};
use zforge::installer::{detect, hardening, telemetry, zpool};
use zforge::process::Cmd;
use zforge::spec::HardeningProfile;

#[derive(Parser)]
#[command(name = "zforge-install", version, about = "Z-Forge installer job steps")]
struct Cli {
    /// Globalstorage JSON map shared with the view modules
    #[arg(long, global = true, default_value = "/run/zforge/globalstorage.json")]
    globalstorage: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for importable ZFS pools and publish the report
    DetectPools,
    /// Create the new pool and dataset layout selected in the wizard
    CreatePool,
    /// Install ZFSBootMenu (and optionally OpenCore) on the target
    InstallBootloader {
        #[arg(long, default_value = zpool::TARGET_ROOT)]
        target: PathBuf,
    },
    /// Apply the selected security hardening profile to the target
    ApplyHardening {
        #[arg(long, default_value = zpool::TARGET_ROOT)]
        target: PathBuf,
    },
    /// Submit the anonymized install report (consent-gated, never fatal)
    SubmitTelemetry {
        #[arg(long, default_value = "success")]
        status: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::DetectPools => {
            let mut gs = load_or_default(&cli.globalstorage)?;
            let reports = detect::detect_pools(&mut gs)?;
            gs.save(&cli.globalstorage)?;
            println!("{} importable pool(s) found", reports.len());
            for report in reports {
                println!(
                    "  {} ({}, {} existing root dataset(s))",
                    report.name,
                    report.health,
                    report.existing_roots.len()
                );
            }
            Ok(())
        }
        Commands::CreatePool => {
            let mut gs = GlobalStorage::load(&cli.globalstorage)?;
            let plan = zpool::plan_pool_creation(&gs)?;
            gs.insert(
                gs_keys::K_NEW_POOL_COMMAND,
                serde_json::json!(plan.create.clone()),
            );
            zpool::execute_plan(&plan, &mut zpool::run_command)?;

            // The passphrase must not outlive pool creation.
            gs.scrub_ephemeral();
            gs.save(&cli.globalstorage)?;
            println!("Pool created and mounted at {}", zpool::TARGET_ROOT);
            Ok(())
        }
        Commands::InstallBootloader { target } => {
            let gs = GlobalStorage::load(&cli.globalstorage)?;
            let install = BootloaderInstall::from_globalstorage(&gs, target);
            install.run()?;
            println!("Bootloader installed on {}", target.display());
            Ok(())
        }
        Commands::ApplyHardening { target } => {
            let gs = GlobalStorage::load(&cli.globalstorage)?;
            let profile: HardeningProfile = gs
                .str_value(gs_keys::K_HARDENING_PROFILE)
                .unwrap_or("none")
                .parse()?;
            hardening::write_assets(target, profile)?;
            println!("Hardening profile '{}' applied", profile.as_str());
            Ok(())
        }
        Commands::SubmitTelemetry { status } => {
            let gs = GlobalStorage::load(&cli.globalstorage)?;
            let hardware = collect_hardware(Path::new(zpool::TARGET_ROOT));
            telemetry::run(&gs, hardware, status);
            // Deliberately unconditional success: telemetry is never fatal.
            Ok(())
        }
    }
}

fn load_or_default(path: &Path) -> Result<GlobalStorage> {
    if path.exists() {
        GlobalStorage::load(path)
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        Ok(GlobalStorage::new())
    }
}

/// Anonymized hardware facts for the telemetry payload. Every probe is
/// best-effort; missing data degrades to defaults.
fn collect_hardware(target_root: &Path) -> telemetry::Hardware {
    let kernel = Cmd::new("chroot")
        .arg_path(target_root)
        .args(["uname", "-r"])
        .allow_fail()
        .run()
        .ok()
        .filter(|r| r.success())
        .map(|r| r.stdout_trimmed().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let cpu_family = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split(':').nth(1))
                .map(|model| telemetry::cpu_family(model.trim()))
        })
        .unwrap_or_else(|| "unknown".to_string());

    let ram_mib = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| kb / 1024)
        .unwrap_or(0);

    let disks = Cmd::new("lsblk")
        .args(["-b", "-d", "-n", "-o", "TRAN,SIZE,TYPE"])
        .allow_fail()
        .run()
        .ok()
        .filter(|r| r.success())
        .map(|r| parse_lsblk_disks(&r.stdout))
        .unwrap_or_default();

    telemetry::Hardware {
        kernel,
        cpu_family,
        ram_mib,
        disks,
    }
}

fn parse_lsblk_disks(output: &str) -> Vec<telemetry::Disk> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [tran, size, "disk"] => Some(telemetry::Disk {
                    r#type: tran.to_string(),
                    size_bucket: telemetry::size_bucket(size.parse().ok()?).to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}
