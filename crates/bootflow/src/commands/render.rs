use crate::stack;
use crate::utils;
use bootflow_config::LoadedConfig;
use colored::Colorize;
use std::path::PathBuf;

/// cloud-init を展開して表示する
///
/// ボリュームパスは `--volume-path`、状態ファイルの記録の順に探す。
pub async fn handle(
    loaded: &LoadedConfig,
    volume_path: Option<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let vars = utils::load_variables(loaded)?;
    let template = utils::load_template(loaded)?;

    let volume_path = match volume_path {
        Some(path) => Some(path),
        None => utils::state_manager(loaded)
            .load()
            .await?
            .get_resource(stack::VOLUME)
            .and_then(|record| record.get_output::<String>("linux_device")),
    };
    if volume_path.is_none() && template.placeholders().contains(stack::VOLUME_PATH_VAR) {
        eprintln!(
            "  ⚠ {} はボリューム作成後に決まります。--volume-path で指定できます",
            stack::VOLUME_PATH_VAR.yellow()
        );
    }

    let text = stack::render_user_data(&template, &vars, volume_path.as_deref());

    match output {
        Some(path) => {
            std::fs::write(&path, text)?;
            eprintln!("✓ {} に書き出しました", path.display().to_string().cyan());
        }
        None => print!("{}", text),
    }
    Ok(())
}
