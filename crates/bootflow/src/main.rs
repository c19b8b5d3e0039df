mod commands;
mod stack;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "boot")]
#[command(about = "サーバーとバックアップボリュームを依存順に立ち上げる", long_about = None)]
struct Cli {
    /// 設定ファイルのパス（省略時はカレントディレクトリから探索）
    #[arg(short, long, global = true, env = "BOOTFLOW_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// 使用する hcloud コンテキスト
    #[arg(long, global = true)]
    context: Option<String>,

    /// 詳細なログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 実行計画を表示（クラウドには触れない）
    Plan {
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// スタックを構築・更新
    Up {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
        /// 同時に操作するリソースの上限
        #[arg(short, long, default_value = "4")]
        parallel: usize,
    },
    /// リソースを削除
    Destroy {
        /// 削除するリソース名（指定しない場合は全リソース）
        resource: Option<String>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// cloud-init テンプレートを展開して表示
    Render {
        /// BACKUP_VOLUME_PATH に使うデバイスパス
        #[arg(long)]
        volume_path: Option<String>,
        /// 出力先ファイル（指定しない場合は標準出力）
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// サーバーの IP アドレスと状態を表示
    Outputs {
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログは stderr に出力（RUST_LOG が優先）
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Versionコマンド以外は設定ファイルが必要
    let load = || bootflow_config::load(cli.config.as_deref());
    let context = cli.context.as_deref();

    match cli.command {
        Commands::Version => {
            println!("bootflow {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Plan { json } => {
            commands::plan::handle(&load()?, context, json).await?;
        }
        Commands::Up { yes, parallel } => {
            commands::up::handle(&load()?, context, parallel, yes).await?;
        }
        Commands::Destroy { resource, yes } => {
            commands::destroy::handle(&load()?, context, resource, yes).await?;
        }
        Commands::Render {
            volume_path,
            output,
        } => {
            commands::render::handle(&load()?, volume_path, output).await?;
        }
        Commands::Outputs { json } => {
            commands::outputs::handle(&load()?, json).await?;
        }
    }

    Ok(())
}
