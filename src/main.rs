//! zforge: build bootable Proxmox VE installer ISOs with ZFS-on-root.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use zforge::checkpoint::CheckpointStore;
use zforge::errors::{exit_code, BuildErrorKind};
use zforge::pipeline::{self, BuildContext};
use zforge::spec::BuildPlan;
use zforge::workspace::Workspace;
use zforge::{cancel, process};

#[derive(Parser)]
#[command(name = "zforge", version, about = "Build Proxmox VE installer ISOs with ZFS-on-root")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the build pipeline
    Build {
        /// Build specification file
        #[arg(long, default_value = "build_spec.yml")]
        spec: PathBuf,
        /// Hardware overlay files merged onto the spec, in order
        #[arg(long = "overlay")]
        overlays: Vec<PathBuf>,
        /// Continue from the first module without a success checkpoint
        #[arg(long)]
        resume: bool,
        /// Delete the workspace before building
        #[arg(long)]
        clean: bool,
    },
    /// Print per-module checkpoint statuses
    InspectCheckpoint {
        /// Workspace directory (defaults to the spec's workspace_path)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Build specification file
        #[arg(long, default_value = "build_spec.yml")]
        spec: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    cancel::install_handlers();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Build {
            spec,
            overlays,
            resume,
            clean,
        } => cmd_build(&spec, &overlays, resume, clean),
        Commands::InspectCheckpoint { workspace, spec } => {
            cmd_inspect_checkpoint(workspace.as_deref(), &spec)
        }
    };

    if let Err(err) = result {
        let code = exit_code(&err);
        eprintln!("error: {err:#}");
        std::process::exit(code);
    }
}

fn cmd_build(
    spec: &std::path::Path,
    overlays: &[PathBuf],
    resume: bool,
    clean: bool,
) -> Result<()> {
    let plan = load_plan(spec, overlays)?;
    let root = plan.builder_config.workspace_path.clone();

    if clean {
        println!("Cleaning workspace {}", root.display());
        Workspace::destroy(&root).context(BuildErrorKind::WorkspaceDirty)?;
    }

    process::set_default_idle_timeout(std::time::Duration::from_secs(
        plan.builder_config.stall_timeout_secs,
    ));

    let workspace = Workspace::acquire(&root, plan.builder_config.cache_packages)?;
    let mut store = CheckpointStore::load(&workspace.state_dir())?;
    store.set_build_label(&format!(
        "{} {}",
        plan.builder_config.iso_label, plan.builder_config.version_tag
    ))?;

    let ctx = BuildContext {
        plan: &plan,
        workspace: &workspace,
    };

    let report = pipeline::run(&ctx, &mut store, resume).map_err(|e| {
        eprintln!("\nBuild failed. The workspace is retained for inspection;");
        eprintln!("fix the cause and re-run with --resume.");
        e
    })?;

    println!(
        "\nBuild complete: {} module(s) executed, {} skipped",
        report.executed.len(),
        report.skipped.len()
    );
    println!(
        "ISO: {}",
        root.join(&plan.builder_config.output_iso_name).display()
    );
    Ok(())
}

fn cmd_inspect_checkpoint(workspace: Option<&std::path::Path>, spec: &std::path::Path) -> Result<()> {
    let root = match workspace {
        Some(dir) => dir.to_path_buf(),
        None => load_plan(spec, &[])?.builder_config.workspace_path,
    };

    let state_dir = root.join("state");
    if !state_dir.exists() {
        println!("No checkpoints recorded under {}", root.display());
        return Ok(());
    }

    let store = CheckpointStore::load(&state_dir)?;
    if !store.build_label().is_empty() {
        println!("Build: {}", store.build_label());
    }
    for (module, checkpoint) in store.statuses() {
        let status = match checkpoint.status {
            zforge::checkpoint::CheckpointStatus::Success => "success",
            zforge::checkpoint::CheckpointStatus::Error => "error",
            zforge::checkpoint::CheckpointStatus::Skipped => "skipped",
        };
        print!("  {module:<22} {status:<8} {}", checkpoint.finished_at_utc);
        if let Some(resume) = &checkpoint.resume {
            for key in ["kernel_series", "kernel_release", "zfs_version"] {
                if let Some(value) = resume.get(key).and_then(|v| v.as_str()) {
                    print!("  {key}={value}");
                }
            }
        }
        println!();
        if let Some(error) = &checkpoint.error {
            let tail = process::tail_lines(error, process::STDERR_TAIL_LINES);
            for line in tail.lines() {
                println!("      {line}");
            }
        }
    }
    Ok(())
}

fn load_plan(spec: &std::path::Path, overlays: &[PathBuf]) -> Result<BuildPlan> {
    if !spec.exists() {
        println!(
            "Spec file '{}' not found, building with defaults",
            spec.display()
        );
        return BuildPlan::from_value(serde_yaml::Value::Mapping(Default::default()));
    }
    BuildPlan::load(spec, overlays)
}
