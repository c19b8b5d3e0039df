pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 設定ファイルの直接指定に使う環境変数
pub const CONFIG_PATH_ENV: &str = "BOOTFLOW_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["bootflow.local.yaml", "bootflow.yaml"];

/// プロジェクト内の bootflow ディレクトリ名
const DOT_DIR: &str = ".bootflow";

/// スタック設定
///
/// 省略された項目はデフォルト値で補完され、ロード後は実行中に変更されない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// プロジェクト名（サーバー名・リソース名のプレフィックス）
    pub project: String,

    /// サーバータイプ (cpx11 = 2 vCPU, 2 GB RAM)
    pub server_type: String,

    /// ロケーション (fsn1 = Falkenstein)
    pub location: String,

    /// OS イメージ
    pub image: String,

    /// 登録する SSH 公開鍵
    pub ssh_keys: Vec<String>,

    /// バックアップボリュームのサイズ (GB)
    pub volume_size: u32,

    /// ボリュームを自動マウントするか
    pub automount: bool,

    /// cloud-init テンプレートのパス（設定ファイルからの相対パス）
    pub cloud_init: PathBuf,

    /// 変数を読み込む .env ファイルのパス（設定ファイルからの相対パス）
    pub env_file: PathBuf,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project: "bootflow".to_string(),
            server_type: "cpx11".to_string(),
            location: "fsn1".to_string(),
            image: "docker-ce".to_string(),
            ssh_keys: Vec::new(),
            volume_size: 10,
            automount: true,
            cloud_init: PathBuf::from("build/cloud-init.yaml"),
            env_file: PathBuf::from(".env"),
        }
    }
}

impl StackConfig {
    /// YAML 文字列からパース
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        // 空ファイルは全てデフォルト
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: StackConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid("project が空です".to_string()));
        }
        if self.volume_size == 0 {
            return Err(ConfigError::Invalid(
                "volume_size は 1 以上を指定してください".to_string(),
            ));
        }
        if self.ssh_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(ConfigError::Invalid("空の ssh_keys エントリがあります".to_string()));
        }
        Ok(())
    }

    /// サーバー名
    pub fn server_name(&self) -> String {
        self.project.clone()
    }

    /// n 番目の SSH 鍵の名前
    pub fn ssh_key_name(&self, index: usize) -> String {
        format!("{}-key-{}", self.project, index)
    }

    /// バックアップボリューム名
    pub fn volume_name(&self) -> String {
        format!("{}-backup", self.project)
    }
}

/// 読み込み済みのスタック設定
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: StackConfig,

    /// 設定ファイルのパス
    pub path: PathBuf,
}

impl LoadedConfig {
    /// 設定ファイルのあるディレクトリ
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// プロジェクトのルートディレクトリ
    ///
    /// `./.bootflow/` 内の設定ファイルはその親ディレクトリを指す。
    pub fn project_dir(&self) -> &Path {
        let base = self.base_dir();
        match (base.file_name(), base.parent()) {
            (Some(name), Some(parent)) if name == DOT_DIR => parent,
            _ => base,
        }
    }

    /// 設定ファイルからの相対パスを解決
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    pub fn cloud_init_path(&self) -> PathBuf {
        self.resolve(&self.config.cloud_init)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.resolve(&self.config.env_file)
    }
}

/// スタック設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 BOOTFLOW_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: bootflow.local.yaml, bootflow.yaml
/// 3. ./.bootflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/bootflow/bootflow.yaml (グローバル設定)
pub fn find_stack_file() -> Result<PathBuf> {
    let current_dir = std::env::current_dir()?;
    find_stack_file_from(&current_dir)
}

/// 指定ディレクトリを起点にスタック設定ファイルを探す
pub fn find_stack_file_from(dir: &Path) -> Result<PathBuf> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            path = %path.display(),
            "{} points to a missing file, falling back to discovery",
            CONFIG_PATH_ENV
        );
    }

    // 2. カレントディレクトリ、3. ./.bootflow/
    for base in [dir.to_path_buf(), dir.join(DOT_DIR)] {
        for filename in &CANDIDATES {
            let path = base.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    // 4. グローバル設定ファイル
    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("bootflow").join("bootflow.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::StackFileNotFound)
}

/// スタック設定ファイルを読み込む
pub fn load_stack_config(path: &Path) -> Result<LoadedConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = StackConfig::from_yaml(&content, path)?;
    tracing::debug!(path = %path.display(), project = %config.project, "Loaded stack config");
    Ok(LoadedConfig {
        config,
        path: path.to_path_buf(),
    })
}

/// 明示パスがあればそれを、なければ探索して読み込む
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_stack_file()?,
    };
    load_stack_config(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.server_type, "cpx11");
        assert_eq!(config.location, "fsn1");
        assert_eq!(config.image, "docker-ce");
        assert!(config.ssh_keys.is_empty());
        assert_eq!(config.volume_size, 10);
        assert!(config.automount);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
project: supreme-computing
image: ubuntu-24.04
ssh_keys:
  - "ssh-ed25519 AAAA user@host"
"#;
        let config = StackConfig::from_yaml(yaml, Path::new("bootflow.yaml")).unwrap();
        assert_eq!(config.project, "supreme-computing");
        assert_eq!(config.image, "ubuntu-24.04");
        assert_eq!(config.server_type, "cpx11");
        assert_eq!(config.ssh_keys.len(), 1);
        assert_eq!(config.ssh_key_name(0), "supreme-computing-key-0");
        assert_eq!(config.volume_name(), "supreme-computing-backup");
    }

    #[test]
    fn test_invalid_yaml() {
        let result = StackConfig::from_yaml("volume_size: lots", Path::new("bootflow.yaml"));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_zero_volume_size_rejected() {
        let result = StackConfig::from_yaml("volume_size: 0", Path::new("bootflow.yaml"));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bootflow.yaml");
        fs::write(&path, "cloud_init: templates/init.yaml\n").unwrap();

        let loaded = load_stack_config(&path).unwrap();
        assert_eq!(
            loaded.cloud_init_path(),
            temp_dir.path().join("templates/init.yaml")
        );
        assert_eq!(loaded.env_file_path(), temp_dir.path().join(".env"));
    }

    #[test]
    fn test_project_dir() {
        let at_root = LoadedConfig {
            config: StackConfig::default(),
            path: PathBuf::from("/srv/app/bootflow.yaml"),
        };
        assert_eq!(at_root.project_dir(), Path::new("/srv/app"));

        let in_dot_dir = LoadedConfig {
            config: StackConfig::default(),
            path: PathBuf::from("/srv/app/.bootflow/bootflow.yaml"),
        };
        assert_eq!(in_dot_dir.project_dir(), Path::new("/srv/app"));
        assert_eq!(in_dot_dir.base_dir(), Path::new("/srv/app/.bootflow"));
    }

    #[test]
    #[serial]
    fn test_find_stack_file_local_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("bootflow.yaml"), "project: a").unwrap();
        fs::write(temp_dir.path().join("bootflow.local.yaml"), "project: b").unwrap();

        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let result = find_stack_file_from(temp_dir.path()).unwrap();
            // bootflow.local.yaml が優先される
            assert!(result.ends_with("bootflow.local.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_stack_file_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join(".bootflow")).unwrap();
        fs::write(temp_dir.path().join(".bootflow/bootflow.yaml"), "").unwrap();

        temp_env::with_var_unset(CONFIG_PATH_ENV, || {
            let result = find_stack_file_from(temp_dir.path()).unwrap();
            assert!(result.ends_with(".bootflow/bootflow.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_stack_file_env_override() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "project: custom").unwrap();
        fs::write(temp_dir.path().join("bootflow.yaml"), "project: a").unwrap();

        temp_env::with_var(CONFIG_PATH_ENV, Some(config_path.as_os_str()), || {
            let result = find_stack_file_from(temp_dir.path()).unwrap();
            assert_eq!(result, config_path);
        });
    }

    #[test]
    #[serial]
    fn test_current_dir_discovery() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        fs::write(temp_dir.path().join("bootflow.yaml"), "project: here").unwrap();

        std::env::set_current_dir(&temp_dir).unwrap();
        let result = temp_env::with_var_unset(CONFIG_PATH_ENV, find_stack_file);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(result.unwrap().ends_with("bootflow.yaml"));
    }
}
