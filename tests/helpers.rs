//! Shared helpers for the integration tests.

use std::path::Path;
use tempfile::TempDir;

use zforge::spec::BuildPlan;
use zforge::workspace::Workspace;

/// A scratch workspace plus a defaulted build plan.
pub struct TestEnv {
    pub dir: TempDir,
    pub plan: BuildPlan,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let plan = plan_from_yaml("");
        Self { dir, plan }
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::acquire(self.dir.path(), false).expect("acquire workspace")
    }
}

/// Parse a spec snippet into a plan, treating an empty string as an empty
/// spec file.
pub fn plan_from_yaml(yaml: &str) -> BuildPlan {
    try_plan_from_yaml(yaml).expect("valid spec")
}

pub fn try_plan_from_yaml(yaml: &str) -> anyhow::Result<BuildPlan> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let value = if value.is_null() {
        serde_yaml::Value::Mapping(Default::default())
    } else {
        value
    };
    BuildPlan::from_value(value)
}

pub fn assert_file_contains(path: &Path, needle: &str) {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
    assert!(
        content.contains(needle),
        "expected '{}' to contain '{needle}', got:\n{content}",
        path.display()
    );
}
