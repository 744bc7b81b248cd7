//! Module registry and pipeline runner.
//!
//! Modules run strictly sequentially in the order the spec declares them.
//! Enable flags skip, never reorder. Each enabled module receives its resume
//! payload (if a previous run recorded one), and its outcome is checkpointed
//! before the next module starts. The first error halts the pipeline.

use anyhow::Result;
use serde_json::Value;

use crate::cancel;
use crate::checkpoint::CheckpointStore;
use crate::errors::BuildErrorKind;
use crate::spec::BuildPlan;
use crate::workspace::Workspace;

/// Shared state handed to every module.
pub struct BuildContext<'a> {
    pub plan: &'a BuildPlan,
    pub workspace: &'a Workspace,
}

/// One stage of the build pipeline.
///
/// A module reads the plan, mutates the workspace, and may hand back a resume
/// payload that a rerun after failure will receive. Modules must verify their
/// own preconditions (the outputs of earlier stages) and fail with
/// `MissingRequired` when they are absent.
pub trait BuildModule {
    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &BuildContext, resume: Option<&Value>) -> Result<Option<Value>>;
}

/// Construct the module for a declared name.
pub fn module_by_name(name: &str) -> Option<Box<dyn BuildModule>> {
    use crate::modules;
    let module: Box<dyn BuildModule> = match name {
        "WorkspaceSetup" => Box::new(modules::workspace_setup::WorkspaceSetup),
        "Debootstrap" => Box::new(modules::debootstrap::Debootstrap),
        "KernelAcquisition" => Box::new(modules::kernel::KernelAcquisition),
        "ZFSBuild" => Box::new(modules::zfs_build::ZfsBuild),
        "DracutConfig" => Box::new(modules::dracut::DracutConfig),
        "ProxmoxIntegration" => Box::new(modules::proxmox::ProxmoxIntegration),
        "BootloaderSetup" => Box::new(modules::bootloader::BootloaderSetup),
        "LiveEnvironment" => Box::new(modules::live_env::LiveEnvironment),
        "CalamaresIntegration" => Box::new(modules::calamares::CalamaresIntegration),
        "SecurityHardening" => Box::new(modules::hardening::SecurityHardening),
        "EncryptionSupport" => Box::new(modules::hardening::EncryptionSupport),
        "ISOGeneration" => Box::new(modules::iso::IsoGeneration),
        _ => return None,
    };
    Some(module)
}

/// Outcome summary for the CLI.
#[derive(Debug, PartialEq, Eq)]
pub struct PipelineReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Run the pipeline described by the plan.
///
/// With `resume`, modules whose checkpoint is already a success are not
/// re-executed.
pub fn run(
    ctx: &BuildContext,
    store: &mut CheckpointStore,
    resume: bool,
) -> Result<PipelineReport> {
    let mut modules = Vec::new();
    for decl in &ctx.plan.modules {
        let module = module_by_name(&decl.name).ok_or_else(|| {
            anyhow::anyhow!("unknown module '{}' in spec", decl.name)
                .context(BuildErrorKind::Validation)
        })?;
        modules.push((module, decl.enabled));
    }

    run_modules(ctx, store, resume, &modules)
}

/// Inner runner, parameterized over the module set so tests can drive it
/// with stubs.
pub fn run_modules(
    ctx: &BuildContext,
    store: &mut CheckpointStore,
    resume: bool,
    modules: &[(Box<dyn BuildModule>, bool)],
) -> Result<PipelineReport> {
    let mut report = PipelineReport {
        executed: Vec::new(),
        skipped: Vec::new(),
    };

    for (module, enabled) in modules {
        let name = module.name();

        if cancel::is_cancelled() {
            store.record_error(name, "cancelled before start")?;
            return Err(anyhow::anyhow!("cancelled before module {name}")
                .context(BuildErrorKind::Cancelled));
        }

        if !enabled {
            log::info!("module {name}: disabled, skipping");
            store.record_skipped(name)?;
            report.skipped.push(name.to_string());
            continue;
        }

        if resume && store.is_success(name) {
            log::info!("module {name}: already complete, skipping (resume)");
            report.skipped.push(name.to_string());
            continue;
        }

        println!("==> {name}");
        let resume_data = store.resume_data(name).cloned();
        match module.execute(ctx, resume_data.as_ref()) {
            Ok(new_resume) => {
                store.record_success(name, new_resume)?;
                report.executed.push(name.to_string());
            }
            Err(e) => {
                let kind = crate::errors::kind_of(&e);
                store.record_error(name, &format!("{e:#}"))?;
                let err = e.context(format!("module {name} failed"));
                // Preserve an already-classified kind at the head of the chain.
                return Err(match kind {
                    Some(k) => err.context(k),
                    None => err,
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::BuildPlan;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn test_plan() -> BuildPlan {
        BuildPlan::from_value(serde_yaml::Value::Mapping(Default::default())).unwrap()
    }

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl BuildModule for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn execute(&self, _ctx: &BuildContext, _resume: Option<&Value>) -> Result<Option<Value>> {
            self.log.borrow_mut().push(self.name.to_string());
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            Ok(Some(serde_json::json!({"ran": self.name})))
        }
    }

    fn recorder(
        name: &'static str,
        fail: bool,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> Box<dyn BuildModule> {
        Box::new(Recorder {
            name,
            fail,
            log: Rc::clone(log),
        })
    }

    #[test]
    fn test_modules_run_in_declared_order() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();
        let plan = test_plan();
        let ctx = BuildContext {
            plan: &plan,
            workspace: &ws,
        };
        let mut store = CheckpointStore::load(&ws.state_dir()).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let modules = vec![
            (recorder("First", false, &log), true),
            (recorder("Second", false, &log), false),
            (recorder("Third", false, &log), true),
        ];

        let report = run_modules(&ctx, &mut store, false, &modules).unwrap();
        assert_eq!(*log.borrow(), vec!["First", "Third"]);
        assert_eq!(report.executed, vec!["First", "Third"]);
        assert_eq!(report.skipped, vec!["Second"]);
        assert!(store.is_success("First"));
        assert!(!store.is_success("Second"));
    }

    #[test]
    fn test_failure_halts_and_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();
        let plan = test_plan();
        let ctx = BuildContext {
            plan: &plan,
            workspace: &ws,
        };
        let mut store = CheckpointStore::load(&ws.state_dir()).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let modules = vec![
            (recorder("Ok", false, &log), true),
            (recorder("Boom", true, &log), true),
            (recorder("Never", false, &log), true),
        ];

        let err = run_modules(&ctx, &mut store, false, &modules).unwrap_err();
        assert!(format!("{err:#}").contains("module Boom failed"));
        assert_eq!(*log.borrow(), vec!["Ok", "Boom"]);
        assert!(store.is_success("Ok"));
        let boom = store.get("Boom").unwrap();
        assert!(boom.error.as_deref().unwrap().contains("simulated failure"));
        assert!(store.get("Never").is_none());
    }

    #[test]
    fn test_resume_skips_completed_modules() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();
        let plan = test_plan();
        let ctx = BuildContext {
            plan: &plan,
            workspace: &ws,
        };
        let mut store = CheckpointStore::load(&ws.state_dir()).unwrap();
        store
            .record_success("First", Some(serde_json::json!({"ran": "First"})))
            .unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let modules = vec![
            (recorder("First", false, &log), true),
            (recorder("Second", false, &log), true),
        ];

        let report = run_modules(&ctx, &mut store, true, &modules).unwrap();
        assert_eq!(*log.borrow(), vec!["Second"]);
        assert_eq!(report.skipped, vec!["First"]);
    }

    #[test]
    fn test_resume_of_fully_successful_pipeline_is_noop() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();
        let plan = test_plan();
        let ctx = BuildContext {
            plan: &plan,
            workspace: &ws,
        };
        let mut store = CheckpointStore::load(&ws.state_dir()).unwrap();
        store.record_success("First", None).unwrap();
        store.record_success("Second", None).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let modules = vec![
            (recorder("First", false, &log), true),
            (recorder("Second", false, &log), true),
        ];

        let report = run_modules(&ctx, &mut store, true, &modules).unwrap();
        assert!(log.borrow().is_empty());
        assert!(report.executed.is_empty());
    }

    #[test]
    fn test_unknown_module_in_plan_is_validation_error() {
        // BuildPlan::from_value already rejects unknown names, so drive the
        // outer runner with a hand-built plan to hit the registry check.
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::acquire(tmp.path(), false).unwrap();
        let mut plan = test_plan();
        plan.modules[0].name = "NoSuchModule".to_string();
        let ctx = BuildContext {
            plan: &plan,
            workspace: &ws,
        };
        let mut store = CheckpointStore::load(&ws.state_dir()).unwrap();

        let err = run(&ctx, &mut store, false).unwrap_err();
        assert_eq!(
            crate::errors::kind_of(&err),
            Some(BuildErrorKind::Validation)
        );
    }
}
