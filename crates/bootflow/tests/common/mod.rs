use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write(&self, name: &str, content: &str) {
        let path = self.root.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// bootflow.yaml plus an empty template
    pub fn with_config(project: &str) -> Self {
        let project_dir = Self::new();
        project_dir.write(
            "bootflow.yaml",
            &format!(
                "project: {}\nssh_keys:\n  - ssh-ed25519 AAAAtest\ncloud_init: cloud-init.yaml\nenv_file: .env\n",
                project
            ),
        );
        project_dir.write("cloud-init.yaml", "");
        project_dir
    }

    pub fn write_state(&self, content: &str) {
        self.write(".bootflow/state.json", content);
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// `boot` running inside the project without a config override
    #[allow(deprecated)]
    pub fn boot(&self) -> Command {
        let mut cmd = Command::cargo_bin("boot").unwrap();
        cmd.current_dir(self.path())
            .env_remove("BOOTFLOW_CONFIG_PATH")
            .env_remove("RUST_LOG")
            .env("NO_COLOR", "1");
        cmd
    }
}
