use crate::utils;
use bootflow_cloud::{Orchestrator, ResourceOutcome, ResourceSet};
use bootflow_config::LoadedConfig;
use colored::Colorize;

pub async fn handle(
    loaded: &LoadedConfig,
    context: Option<&str>,
    resource: Option<String>,
    yes: bool,
) -> anyhow::Result<()> {
    println!("{}", "リソースを削除します...".red().bold());

    let manager = utils::state_manager(loaded);
    let lock = manager.acquire_lock().await?;
    let prior = manager.load().await?;

    if prior.resources.is_empty() {
        println!("管理中のリソースはありません");
        lock.release().await?;
        return Ok(());
    }

    // 保護フラグは状態ファイルの記録から判断する
    let backend = utils::backend(context);
    let orchestrator = Orchestrator::new(ResourceSet::new(), backend.clone(), prior)?;

    let targets: Vec<String> = resource.iter().cloned().collect();
    let plan = orchestrator.plan_destroy(&targets)?;
    utils::print_plan(&plan);

    if !yes {
        println!();
        println!(
            "{}",
            "警告: この操作はクラウド上のリソースを削除します。元に戻せません。".yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        lock.release().await?;
        return Ok(());
    }

    utils::check_auth(backend.as_ref()).await?;

    println!();
    println!("{}", "リソースを削除中...".blue());
    let report = match resource {
        Some(name) => orchestrator.delete(&name).await?,
        None => orchestrator.destroy(&[]).await?,
    };

    utils::persist(&manager, &report, lock).await?;
    utils::print_report(&report);

    // 保護による拒否は失敗として扱わない
    let failed = report
        .outcomes
        .values()
        .filter(|o| matches!(o, ResourceOutcome::Failed { .. } | ResourceOutcome::Skipped { .. }))
        .count();
    if failed > 0 {
        return Err(anyhow::anyhow!("{} 個のリソースを削除できませんでした", failed));
    }

    println!();
    println!("{}", "✓ 削除が完了しました".green().bold());
    Ok(())
}
