use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "スタック設定ファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: bootflow.local.yaml, bootflow.yaml\n\
        - ./.bootflow/ ディレクトリ\n\
        - ~/.config/bootflow/bootflow.yaml\n\
        または BOOTFLOW_CONFIG_PATH 環境変数で直接指定できます"
    )]
    StackFileNotFound,

    #[error("設定ファイルのパースに失敗しました: {path}\n理由: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("無効な設定: {0}")]
    Invalid(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
