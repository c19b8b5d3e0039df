use crate::utils;
use bootflow_cloud::Orchestrator;
use bootflow_config::LoadedConfig;
use colored::Colorize;

pub async fn handle(loaded: &LoadedConfig, context: Option<&str>, json: bool) -> anyhow::Result<()> {
    let resources = utils::build_resources(loaded)?;
    let prior = utils::state_manager(loaded).load().await?;

    // 計画の作成ではバックエンドを呼び出さない
    let orchestrator = Orchestrator::new(resources, utils::backend(context), prior)?;
    let plan = orchestrator.plan()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{}", "実行計画を作成しました".blue().bold());
    utils::print_loaded_config(loaded);
    utils::print_plan(&plan);

    println!();
    if plan.has_changes {
        println!("適用するには {} を実行してください", "boot up --yes".cyan());
    } else {
        println!("{}", "✓ 変更はありません".green());
    }
    if plan.has_refusals() {
        println!(
            "{}",
            "警告: 保護されたリソースの削除・置き換えは実行されません".yellow()
        );
    }
    Ok(())
}
