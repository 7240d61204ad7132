use async_trait::async_trait;
use serde_json::{json, Value};

use super::required_str;
use crate::tools::{Tool, ToolContext};

fn skill_name_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "skill_name": {
                "type": "string",
                "description": "Name of the skill"
            }
        },
        "required": ["skill_name"]
    })
}

/// Lists the variable names a skill's `.env` defines. Values are never
/// returned.
pub struct ListEnvKeysTool;

#[async_trait]
impl Tool for ListEnvKeysTool {
    fn name(&self) -> &str {
        "list_skill_env_keys"
    }

    fn description(&self) -> &str {
        "List the environment variable names defined in a skill's .env file. \
         Only the names are returned, never the values. Use this to check whether \
         a skill has the credentials its scripts need."
    }

    fn parameters_schema(&self) -> Value {
        skill_name_schema()
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let skill_name = required_str(&params, "skill_name")?;
        let keys = match context.engine.env_keys(skill_name) {
            Ok(keys) => keys,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        if keys.is_empty() {
            return Ok(format!("No environment variables set for skill '{skill_name}'"));
        }
        let mut output = format!("Environment variables for skill '{skill_name}':\n");
        for key in keys {
            output.push_str(&format!("  - {key}\n"));
        }
        Ok(output)
    }
}

/// Lists the runnable scripts in a skill.
pub struct ListScriptsTool;

#[async_trait]
impl Tool for ListScriptsTool {
    fn name(&self) -> &str {
        "list_skill_scripts"
    }

    fn description(&self) -> &str {
        "List the runnable scripts of a skill (Python, shell, JavaScript, or files \
         with a shebang or the executable bit), as paths relative to the skill. \
         Pass one of them as script_path to run_skill_script."
    }

    fn parameters_schema(&self) -> Value {
        skill_name_schema()
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let skill_name = required_str(&params, "skill_name")?;
        let scripts = match context.engine.list_scripts(skill_name) {
            Ok(scripts) => scripts,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        if scripts.is_empty() {
            return Ok(format!("No scripts found in skill '{skill_name}'"));
        }
        let mut output = format!("Scripts in skill '{skill_name}':\n");
        for script in scripts {
            output.push_str(&format!("  - {script}\n"));
        }
        Ok(output)
    }
}
