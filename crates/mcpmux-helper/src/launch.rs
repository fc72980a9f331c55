use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Everything needed to spawn a local MCP server process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Environment overlay applied on top of the inherited process env,
    /// in order (later entries win).
    pub env: Vec<(String, String)>,
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Resolve the spawn parameters for a local service.
///
/// `npx` is rewritten to `pnpm dlx` (dropping `-y`/`--yes`, which pnpm does
/// not accept). The working directory defaults to `<home>/mcp_plugins/<name>`
/// and the npm/uv cache defaults keep downloads inside it.
pub fn resolve_launch(
    service_name: &str,
    command: &str,
    args: &[String],
    cwd: Option<&str>,
    env: &HashMap<String, String>,
    home: &Path,
) -> LaunchPlan {
    let (program, args) = if command == "npx" {
        let mut rewritten = vec!["dlx".to_string()];
        rewritten.extend(
            args.iter()
                .filter(|arg| arg.as_str() != "-y" && arg.as_str() != "--yes")
                .cloned(),
        );
        ("pnpm".to_string(), rewritten)
    } else {
        (
            expand_tilde(command, home).to_string_lossy().into_owned(),
            args.to_vec(),
        )
    };

    let cwd = match cwd {
        Some(dir) => expand_tilde(dir, home),
        None => home.join("mcp_plugins").join(service_name),
    };

    let mut overlay: Vec<(String, String)> = env
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    overlay.sort();
    overlay.push((
        "npm_config_cache".to_string(),
        cwd.join(".npm-cache").to_string_lossy().into_owned(),
    ));
    overlay.push(("npm_config_prefer_offline".to_string(), "true".to_string()));
    overlay.push(("UV_LINK_MODE".to_string(), "copy".to_string()));
    if cfg!(target_os = "linux") {
        overlay.push((
            "NODE_OPTIONS".to_string(),
            "--openssl-legacy-provider".to_string(),
        ));
    }

    LaunchPlan {
        program,
        args,
        cwd,
        env: overlay,
    }
}
