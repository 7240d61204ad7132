pub mod inspect;
pub mod script;

pub use inspect::{ListEnvKeysTool, ListScriptsTool};
pub use script::{ExecuteCodeTool, RunScriptTool};

use serde_json::Value;

/// Reads a required string parameter.
pub(crate) fn required_str<'a>(params: &'a Value, name: &str) -> anyhow::Result<&'a str> {
    params[name]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {name}"))
}

/// Reads an optional array of strings; `null` or absent means empty.
pub(crate) fn optional_str_list(params: &Value, name: &str) -> anyhow::Result<Vec<String>> {
    match &params[name] {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("Parameter {name} must contain only strings"))
            })
            .collect(),
        _ => Err(anyhow::anyhow!("Parameter {name} must be an array of strings")),
    }
}

/// Engine over a temporary bundle root where "python" and "bash" are
/// `/bin/sh`, so test scripts are plain shell.
#[cfg(all(test, unix))]
pub(crate) fn test_context() -> (tempfile::TempDir, super::ToolContext) {
    use std::sync::Arc;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("skills");
    std::fs::create_dir_all(root.join("weather/scripts")).unwrap();
    std::fs::create_dir_all(root.join("calc")).unwrap();
    std::fs::write(root.join("weather/.env"), "API_KEY=secret-value\nREGION=eu\n").unwrap();
    std::fs::write(
        root.join("weather/scripts/report.sh"),
        "echo \"report for $1 in $REGION\"\n",
    )
    .unwrap();
    std::fs::write(root.join("weather/scripts/fail.sh"), "echo broken >&2; exit 4\n").unwrap();
    std::fs::write(root.join("weather/scripts/quiet.sh"), "true\n").unwrap();
    std::fs::write(root.join("calc/stats.py"), "MEAN = 1\n").unwrap();

    let mut config = crate::config::Config::default();
    config.storage.root = root;
    config.execution.cache_dir = dir.path().join("envs");
    config.execution.python = "/bin/sh".to_string();
    config.execution.bash = "/bin/sh".to_string();
    config.execution.timeout_secs = 10;

    let context = super::ToolContext {
        engine: Arc::new(crate::sandbox::Engine::new(&config)),
    };
    (dir, context)
}
