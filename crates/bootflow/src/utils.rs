use crate::stack;
use bootflow_cloud::{
    Cancellation, Decision, Plan, ProvisioningBackend, ReplaceOrder, ResourceOutcome, ResourceSet,
    RunReport, StackState, StateLock, StateManager,
};
use bootflow_cloud_hetzner::HcloudBackend;
use bootflow_config::LoadedConfig;
use bootflow_core::{Template, Variables};
use colored::Colorize;
use std::sync::Arc;

/// 読み込んだ設定ファイル情報を表示
pub fn print_loaded_config(loaded: &LoadedConfig) {
    println!("📄 読み込んだ設定ファイル:");
    println!("  • {}", loaded.path.display().to_string().cyan());

    let env_file = loaded.env_file_path();
    if env_file.exists() {
        println!("  • {} (変数)", env_file.display().to_string().cyan());
    }
    println!(
        "  • {} (cloud-init テンプレート)",
        loaded.cloud_init_path().display().to_string().cyan()
    );
}

/// .env ファイルの変数を読み込む（ファイルがなければ空）
pub fn load_variables(loaded: &LoadedConfig) -> anyhow::Result<Variables> {
    let path = loaded.env_file_path();
    if !path.exists() {
        tracing::debug!("Env file not found: {}", path.display());
        return Ok(Variables::new());
    }

    let env = bootflow_core::load_env_file(&path)?;
    for skipped in &env.skipped {
        eprintln!(
            "  ⚠ {}:{} を読み飛ばしました (KEY=VALUE 形式ではありません)",
            path.display(),
            skipped.line.to_string().yellow()
        );
    }
    Ok(env.into_vars())
}

/// cloud-init テンプレートを読み込む
pub fn load_template(loaded: &LoadedConfig) -> anyhow::Result<Template> {
    let path = loaded.cloud_init_path();
    bootflow_core::load_template(&path).map_err(|e| {
        anyhow::anyhow!(
            "cloud-init テンプレートを読み込めません: {}\n理由: {}",
            path.display(),
            e
        )
    })
}

/// 設定からリソース一式を組み立てる
pub fn build_resources(loaded: &LoadedConfig) -> anyhow::Result<ResourceSet> {
    let vars = load_variables(loaded)?;
    let template = load_template(loaded)?;
    Ok(stack::build(&loaded.config, &template, &vars))
}

/// 状態ファイルはプロジェクトのルートの .bootflow/ に置く
pub fn state_manager(loaded: &LoadedConfig) -> StateManager {
    StateManager::new(loaded.project_dir())
}

/// hcloud バックエンドを初期化
pub fn backend(context: Option<&str>) -> Arc<HcloudBackend> {
    let backend = match context {
        Some(context) => HcloudBackend::with_context(context),
        None => HcloudBackend::new(),
    };
    Arc::new(backend)
}

/// バックエンドの認証を確認する
pub async fn check_auth(backend: &dyn ProvisioningBackend) -> anyhow::Result<()> {
    println!();
    println!("{}", "Hetzner Cloud に接続中...".blue());
    let auth = backend.check_auth().await?;
    if !auth.authenticated {
        return Err(anyhow::anyhow!(
            "hcloud の認証に失敗しました: {}\nヒント: HCLOUD_TOKEN を設定するか `hcloud context create` を実行してください",
            auth.error.unwrap_or_default()
        ));
    }
    if let Some(account) = auth.account_info {
        println!("  ✓ コンテキスト: {}", account.cyan());
    }
    Ok(())
}

/// Ctrl-C で実行のキャンセルを要求する
pub fn cancel_on_ctrl_c(cancellation: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!(
                "{}",
                "中断を要求しました。実行中のリソースの完了を待っています...".yellow()
            );
            cancellation.cancel();
        }
    });
}

fn action_marker(decision: &Decision) -> colored::ColoredString {
    let marker = |symbol: &str| format!("{:>3}", symbol);
    match decision {
        Decision::Create => marker("+").green(),
        Decision::NoOp => marker("").normal(),
        Decision::UpdateInPlace { .. } => marker("~").yellow(),
        Decision::Replace {
            order: ReplaceOrder::CreateBeforeDelete,
            ..
        } => marker("+/-").magenta(),
        Decision::Replace {
            order: ReplaceOrder::DeleteBeforeCreate,
            ..
        } => marker("-/+").magenta(),
        Decision::Delete => marker("-").red(),
        Decision::DeleteRefused { .. } => marker("!").red().bold(),
        Decision::Blocked { .. } => marker("=").yellow(),
    }
}

/// 実行計画を表示
pub fn print_plan(plan: &Plan) {
    println!();
    println!("{}", "実行計画:".bold());
    for action in &plan.actions {
        let line = format!(
            "  {} {} ({})",
            action_marker(&action.decision),
            action.resource.cyan(),
            action.kind
        );
        match &action.decision {
            Decision::NoOp => println!("{}", line.dimmed()),
            Decision::UpdateInPlace { changed } => println!("{}  変更: {}", line, changed.join(", ")),
            Decision::Replace { triggers, .. } => {
                println!("{}  置き換え: {}", line, triggers.join(", "))
            }
            Decision::DeleteRefused { reason } => {
                println!("{}  {}", line, format!("拒否: {}", reason).red())
            }
            Decision::Blocked { reason } => {
                println!("{}  {}", line, format!("保留: {}", reason).yellow())
            }
            _ => println!("{}", line),
        }
    }

    println!();
    println!("  {}", plan.summary());
}

/// 実行結果を表示
pub fn print_report(report: &RunReport) {
    println!();
    println!("{}", "実行結果:".bold());
    for (name, outcome) in &report.outcomes {
        match outcome {
            ResourceOutcome::Unchanged => println!("  - {} (変更なし)", name),
            ResourceOutcome::Refused { reason } => {
                println!("  {} {} ({})", "!".yellow(), name.cyan(), reason)
            }
            ResourceOutcome::Failed { error, .. } => {
                println!("  {} {}: {}", "✗".red(), name.cyan(), error.red())
            }
            ResourceOutcome::Skipped { reason } => {
                println!("  {} {} (スキップ: {})", "-".yellow(), name.cyan(), reason)
            }
            other => println!("  {} {} ({})", "✓".green(), name.cyan(), other),
        }
    }
    println!();
    println!("  所要時間: {:.1}s", report.duration_ms as f64 / 1000.0);
}

/// 状態を保存してからロックを解放する
pub async fn persist(manager: &StateManager, report: &RunReport, lock: StateLock) -> anyhow::Result<()> {
    manager.save(&report.state).await?;
    tracing::debug!("State saved to {}", manager.state_path().display());
    lock.release().await?;
    Ok(())
}

/// サーバーの IP アドレスと状態
pub fn server_outputs(state: &StackState) -> Option<(Option<String>, Option<String>)> {
    let record = state.get_resource(stack::SERVER)?;
    Some((
        record.get_output::<String>("ipv4_address"),
        record.get_output::<String>("status"),
    ))
}
