//! Builtin tools that execute code: bundle scripts and inline Python.
//!
//! Results are rendered as plain text for the calling agent. Errors that
//! concern the request itself (unknown bundle, escaping path, bad
//! reference) are rendered as `Error: ...` text instead of failing the
//! call, so the agent can correct itself.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{optional_str_list, required_str};
use crate::sandbox::{ExecutionResult, Reference};
use crate::tools::{Tool, ToolContext};

/// Renders an execution result for the caller.
pub fn format_result(header: &str, result: &ExecutionResult, timeout_secs: u64) -> String {
    let mut output = format!("{header}\nExit code: {}\n\n", result.exit_code);

    if !result.stdout.is_empty() {
        output.push_str(&format!("STDOUT:\n{}\n", result.stdout));
    }
    if !result.stderr.is_empty() {
        output.push_str(&format!("STDERR:\n{}\n", result.stderr));
    }
    if result.stdout.is_empty() && result.stderr.is_empty() {
        output.push_str("(No output)\n");
    }
    if result.truncated {
        output.push_str("... (output truncated)\n");
    }
    if result.timed_out {
        output.push_str(&format!(
            "Execution timed out after {timeout_secs}s and was killed.\n"
        ));
    }
    for warning in &result.warnings {
        output.push_str(&format!("Warning: {warning}\n"));
    }

    output
}

/// Runs a script stored in a skill bundle.
pub struct RunScriptTool;

#[async_trait]
impl Tool for RunScriptTool {
    fn name(&self) -> &str {
        "run_skill_script"
    }

    fn description(&self) -> &str {
        "Run a script stored in a skill. Python scripts (.py) may declare their \
         dependencies in an inline `# /// script` block; they are installed into an \
         isolated cached environment before the run. Shell (.sh) and JavaScript (.js) \
         scripts run with their interpreter; other files run directly. Variables from \
         the skill's .env file are available to the script. The script runs from its \
         own directory unless working_dir (relative to the skill) is given. \
         Returns the exit code, STDOUT and STDERR."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {
                    "type": "string",
                    "description": "Name of the skill holding the script"
                },
                "script_path": {
                    "type": "string",
                    "description": "Path of the script relative to the skill (e.g. 'scripts/report.py')"
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Command-line arguments passed to the script"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Working directory relative to the skill (defaults to the script's directory)"
                }
            },
            "required": ["skill_name", "script_path"]
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let skill_name = required_str(&params, "skill_name")?;
        let script_path = required_str(&params, "script_path")?;
        let args = optional_str_list(&params, "args")?;
        let working_dir = params["working_dir"].as_str().filter(|d| !d.is_empty());

        debug!("run_skill_script {skill_name}/{script_path}");
        let engine = &context.engine;
        match engine
            .run_script(skill_name, script_path, &args, working_dir)
            .await
        {
            Ok(result) => Ok(format_result(
                &format!("Script: {skill_name}/{script_path}"),
                &result,
                engine.execution().timeout_secs,
            )),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }
}

/// Runs inline Python with modules from skills importable.
pub struct ExecuteCodeTool;

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_python_code"
    }

    fn description(&self) -> &str {
        "Execute Python code directly, without creating a script file. The code may \
         declare dependencies in an inline `# /// script` block. Files from skills can be \
         made importable with skill_references in 'skill_name:path/to/file.py' form, e.g. \
         ['calculator:advanced/calculus.py'] allows `import calculus`. Dependencies \
         declared by referenced files are installed automatically, and the .env \
         variables of every referenced skill are available. When references disagree, \
         the later one in the list wins. Returns the exit code, STDOUT and STDERR."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute"
                },
                "skill_references": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Skill files to make importable, as 'skill_name:path/to/file.py'"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, params: Value, context: &ToolContext) -> anyhow::Result<String> {
        let code = required_str(&params, "code")?;
        let raw_references = optional_str_list(&params, "skill_references")?;

        let references = match raw_references
            .iter()
            .map(|r| Reference::parse(r))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(references) => references,
            Err(e) => return Ok(format!("Error: {e}")),
        };

        let engine = &context.engine;
        match engine.run_code(code, &references).await {
            Ok(result) => Ok(format_result(
                "Python Code Execution",
                &result,
                engine.execution().timeout_secs,
            )),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }
}
