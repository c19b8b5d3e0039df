use crate::utils;
use bootflow_config::LoadedConfig;
use colored::Colorize;

pub async fn handle(loaded: &LoadedConfig, json: bool) -> anyhow::Result<()> {
    let state = utils::state_manager(loaded).load().await?;
    let (ip, status) = utils::server_outputs(&state).unwrap_or((None, None));

    if json {
        let outputs = serde_json::json!({
            "serverIp": ip,
            "serverStatus": status,
        });
        println!("{}", serde_json::to_string_pretty(&outputs)?);
        return Ok(());
    }

    if state.resources.is_empty() {
        println!("管理中のリソースはありません");
        return Ok(());
    }

    println!("{}", "リソース:".bold());
    for (name, record) in &state.resources {
        println!(
            "  • {} ({}) id={} [{}]",
            name.cyan(),
            record.kind,
            record.id,
            record.status
        );
    }

    println!();
    println!("{}", "出力:".bold());
    println!("  serverIp:     {}", ip.unwrap_or_else(|| "-".to_string()).cyan());
    println!("  serverStatus: {}", status.unwrap_or_else(|| "-".to_string()));
    Ok(())
}
