use crate::utils;
use bootflow_cloud::{Cancellation, CloudError, Orchestrator, RunOptions};
use bootflow_config::LoadedConfig;
use colored::Colorize;

pub async fn handle(
    loaded: &LoadedConfig,
    context: Option<&str>,
    parallel: usize,
    yes: bool,
) -> anyhow::Result<()> {
    println!("{}", "スタックを構築します...".blue().bold());
    utils::print_loaded_config(loaded);

    let resources = utils::build_resources(loaded)?;
    let manager = utils::state_manager(loaded);
    let lock = manager.acquire_lock().await?;
    let prior = manager.load().await?;

    let backend = utils::backend(context);
    let cancellation = Cancellation::new();
    let orchestrator = Orchestrator::new(resources, backend.clone(), prior)?.with_options(
        RunOptions::new()
            .with_max_parallel(parallel)
            .with_cancellation(cancellation.clone()),
    );

    let plan = orchestrator.plan()?;
    utils::print_plan(&plan);

    if !plan.has_changes && plan.has_refusals() {
        lock.release().await?;
        return Err(anyhow::anyhow!(
            "保護されたリソースへの変更が拒否されたため、適用できる変更はありません"
        ));
    }

    if !plan.has_changes {
        println!();
        println!("{}", "✓ 変更はありません".green());
        lock.release().await?;
        return Ok(());
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        println!();
        let summary = plan.summary();
        if summary.replace > 0 || summary.delete > 0 {
            println!(
                "{}",
                "警告: 既存のリソースを削除・再作成します。".yellow()
            );
        }
        println!("実行するには --yes オプションを指定してください");
        lock.release().await?;
        return Ok(());
    }

    utils::check_auth(backend.as_ref()).await?;

    println!();
    println!("{}", "リソースを適用中...".blue());
    utils::cancel_on_ctrl_c(cancellation);
    let report = match orchestrator.apply().await {
        Ok(report) => report,
        Err(CloudError::Halted { source, report }) => {
            // 途中までに作成したリソースは記録しておく
            utils::persist(&manager, &report, lock).await?;
            utils::print_report(&report);
            return Err(anyhow::Error::from(*source));
        }
        Err(e) => return Err(e.into()),
    };

    utils::persist(&manager, &report, lock).await?;
    utils::print_report(&report);

    if report.cancelled {
        println!();
        println!("{}", "中断されました。未着手のリソースは次回の up で適用されます".yellow());
    }
    let failures = report.failures();
    if !failures.is_empty() {
        return Err(anyhow::anyhow!(
            "{} 個のリソースが目的の状態に到達しませんでした",
            failures.len()
        ));
    }

    println!();
    println!("{}", "✓ スタックの構築が完了しました".green().bold());
    if let Some((ip, status)) = utils::server_outputs(&report.state) {
        println!("  serverIp:     {}", ip.unwrap_or_else(|| "-".to_string()).cyan());
        println!("  serverStatus: {}", status.unwrap_or_else(|| "-".to_string()));
    }
    Ok(())
}
