mod bundle;
mod config;
mod error;
mod sandbox;
mod tools;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::sandbox::{Engine, ExecutionResult, Outcome, Reference};
use crate::tools::{ToolContext, ToolRegistry};

/// Config file used when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "~/.skillbox/config.toml";

/// Exit code when the user interrupts a run.
const INTERRUPTED_EXIT_CODE: i32 = 130;

fn print_help() {
    println!(
        "\
skillbox v{}

Runs scripts from skill bundles in isolated subprocesses, with per-bundle
secrets, inline dependency installation and cross-bundle imports.

USAGE:
    skillbox [OPTIONS] <COMMAND>

COMMANDS:
    tools                              Print the tool definitions as JSON
    call <TOOL> <JSON_PARAMS>          Invoke a tool and print its text output
    run <BUNDLE> <SCRIPT> [--cwd DIR] [-- ARGS...]
                                       Run a bundle script, print the result as JSON
    exec [--ref BUNDLE:PATH]... <FILE|->
                                       Run inline Python from a file or stdin
    keys <BUNDLE>                      List the .env variable names of a bundle
    scripts <BUNDLE>                   List the runnable scripts of a bundle
    bundles                            List the bundles

OPTIONS:
    -c, --config <PATH>    TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG        Log level filter for tracing (e.g. debug, skillbox=debug)
    SKILLBOX_DIR    Bundle root directory, overrides [storage] root

EXAMPLES:
    skillbox bundles
    skillbox run weather scripts/report.py -- Paris
    echo 'print(1 + 1)' | skillbox exec -
    skillbox exec --ref calculator:advanced/calculus.py analysis.py
    skillbox call list_skill_env_keys '{{\"skill_name\": \"weather\"}}'",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Tools,
    Call { tool: String, params: String },
    Run {
        bundle: String,
        script: String,
        cwd: Option<String>,
        args: Vec<String>,
    },
    Exec { references: Vec<String>, source: String },
    Keys(String),
    Scripts(String),
    Bundles,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut rest = args.iter();
    let name = loop {
        match rest.next().map(String::as_str) {
            Some("--config" | "-c") => {
                let path = rest.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                config = Some(PathBuf::from(path));
            }
            Some(flag) if flag.starts_with('-') => bail!("Unknown option: {flag}"),
            Some(name) => break name,
            None => bail!("Missing command (try --help)"),
        }
    };
    let rest: Vec<&String> = rest.collect();

    let positional = |idx: usize, what: &str| -> Result<String> {
        rest.get(idx)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("{name}: missing {what}"))
    };

    let command = match name {
        "tools" => Command::Tools,
        "bundles" => Command::Bundles,
        "keys" => Command::Keys(positional(0, "<BUNDLE>")?),
        "scripts" => Command::Scripts(positional(0, "<BUNDLE>")?),
        "call" => Command::Call {
            tool: positional(0, "<TOOL>")?,
            params: rest.get(1).map(|s| s.to_string()).unwrap_or_else(|| "{}".to_string()),
        },
        "run" => {
            let bundle = positional(0, "<BUNDLE>")?;
            let script = positional(1, "<SCRIPT>")?;
            let mut cwd = None;
            let mut args = Vec::new();
            let mut iter = rest.iter().skip(2);
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--cwd" => {
                        let dir = iter.next().ok_or_else(|| anyhow!("--cwd needs a directory"))?;
                        cwd = Some(dir.to_string());
                    }
                    "--" => {
                        args.extend(iter.by_ref().map(|s| s.to_string()));
                    }
                    other => args.push(other.to_string()),
                }
            }
            Command::Run {
                bundle,
                script,
                cwd,
                args,
            }
        }
        "exec" => {
            let mut references = Vec::new();
            let mut source = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--ref" | "-r" => {
                        let reference =
                            iter.next().ok_or_else(|| anyhow!("--ref needs BUNDLE:PATH"))?;
                        references.push(reference.to_string());
                    }
                    other if source.is_none() => source = Some(other.to_string()),
                    other => bail!("exec: unexpected argument {other}"),
                }
            }
            Command::Exec {
                references,
                source: source.ok_or_else(|| anyhow!("exec: missing <FILE|->"))?,
            }
        }
        other => bail!("Unknown command: {other} (try --help)"),
    };

    Ok(Cli { config, command })
}

/// Process exit code for a finished execution.
fn exit_code_for(result: &ExecutionResult) -> i32 {
    match result.outcome {
        Outcome::Completed => result.exit_code.clamp(0, 255),
        Outcome::TimedOut | Outcome::Failed => 1,
    }
}

fn read_source(source: &str) -> Result<String> {
    if source == "-" {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves to the execution's output, or `None` once `interrupt` fires.
/// The execution future is dropped before this returns, which kills its
/// process group and removes its overlay.
async fn unless_interrupted<F, I>(execution: F, interrupt: I) -> Option<F::Output>
where
    F: std::future::Future,
    I: std::future::Future,
{
    tokio::select! {
        result = execution => Some(result),
        _ = interrupt => None,
    }
}

/// Waits for an execution, or exits on Ctrl-C after stopping it.
async fn run_or_interrupt<F>(execution: F) -> Result<ExecutionResult>
where
    F: std::future::Future<Output = crate::error::Result<ExecutionResult>>,
{
    match unless_interrupted(execution, tokio::signal::ctrl_c()).await {
        Some(result) => Ok(result?),
        None => {
            warn!("Interrupted, execution stopped");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else, but not inside
    // arguments meant for a script
    for arg in args.iter().take_while(|a| a.as_str() != "--") {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("skillbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args(&args)?;
    let config_path = match cli.config {
        Some(path) => path,
        None => PathBuf::from(shellexpand::tilde(DEFAULT_CONFIG_PATH).into_owned()),
    };
    info!("Loading configuration from {}", config_path.display());
    let config = Config::load(&config_path)?;
    info!("Bundle root: {}", config.storage.root.display());

    let engine = Arc::new(Engine::new(&config));

    match cli.command {
        Command::Tools => {
            print_json(&ToolRegistry::with_builtins().tool_definitions())?;
        }
        Command::Call { tool, params } => {
            let registry = ToolRegistry::with_builtins();
            let tool = registry
                .get(&tool)
                .ok_or_else(|| anyhow!("Unknown tool: {tool} (see `skillbox tools`)"))?;
            let params: serde_json::Value =
                serde_json::from_str(&params).context("Tool parameters must be a JSON object")?;
            let context = ToolContext { engine };
            print!("{}", tool.execute(params, &context).await?);
        }
        Command::Run {
            bundle,
            script,
            cwd,
            args,
        } => {
            let result =
                run_or_interrupt(engine.run_script(&bundle, &script, &args, cwd.as_deref())).await?;
            print_json(&result)?;
            std::process::exit(exit_code_for(&result));
        }
        Command::Exec { references, source } => {
            let references = references
                .iter()
                .map(|r| Reference::parse(r))
                .collect::<crate::error::Result<Vec<_>>>()?;
            let code = read_source(&source)?;
            let result = run_or_interrupt(engine.run_code(&code, &references)).await?;
            print_json(&result)?;
            std::process::exit(exit_code_for(&result));
        }
        Command::Keys(bundle) => {
            for key in engine.env_keys(&bundle)? {
                println!("{key}");
            }
        }
        Command::Scripts(bundle) => {
            for script in engine.list_scripts(&bundle)? {
                println!("{script}");
            }
        }
        Command::Bundles => {
            for name in engine.store().list_bundle_names()? {
                println!("{name}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn finished(outcome: Outcome, exit_code: i32) -> ExecutionResult {
        ExecutionResult {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            timed_out: outcome == Outcome::TimedOut,
            outcome,
            warnings: Vec::new(),
            duration_ms: 0,
            started_at: String::new(),
        }
    }

    // ── parse_args ─────────────────────────────────────

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_args(&args(&["tools"])).unwrap().command, Command::Tools);
        assert_eq!(parse_args(&args(&["bundles"])).unwrap().command, Command::Bundles);
        assert_eq!(
            parse_args(&args(&["keys", "weather"])).unwrap().command,
            Command::Keys("weather".to_string())
        );
    }

    #[test]
    fn test_parse_config_flag() {
        let cli = parse_args(&args(&["--config", "/etc/skillbox.toml", "bundles"])).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/skillbox.toml")));
        assert!(parse_args(&args(&["--config"])).is_err());
    }

    #[test]
    fn test_parse_run_with_cwd_and_args() {
        let cli = parse_args(&args(&[
            "run", "weather", "report.py", "--cwd", "data", "--", "--city", "Paris",
        ]))
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Run {
                bundle: "weather".to_string(),
                script: "report.py".to_string(),
                cwd: Some("data".to_string()),
                args: args(&["--city", "Paris"]),
            }
        );
    }

    #[test]
    fn test_parse_exec_references() {
        let cli = parse_args(&args(&["exec", "--ref", "a:x.py", "-r", "b:y.py", "-"])).unwrap();
        assert_eq!(
            cli.command,
            Command::Exec {
                references: args(&["a:x.py", "b:y.py"]),
                source: "-".to_string(),
            }
        );
        assert!(parse_args(&args(&["exec", "--ref", "a:x.py"])).is_err());
        assert!(parse_args(&args(&["exec", "a.py", "b.py"])).is_err());
    }

    #[test]
    fn test_parse_call_defaults_to_empty_params() {
        let cli = parse_args(&args(&["call", "list_skill_scripts"])).unwrap();
        assert_eq!(
            cli.command,
            Command::Call {
                tool: "list_skill_scripts".to_string(),
                params: "{}".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["--bogus", "tools"])).is_err());
        assert!(parse_args(&args(&["run", "weather"])).is_err());
    }

    // ── interruption ───────────────────────────────────

    struct SetOnDrop(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_interrupt_drops_execution_before_returning() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = SetOnDrop(Arc::clone(&dropped));
        let execution = async move {
            let _guard = guard;
            std::future::pending::<()>().await
        };

        let outcome = unless_interrupted(execution, async {}).await;

        assert!(outcome.is_none());
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finished_execution_is_returned() {
        let outcome = unless_interrupted(async { 7 }, std::future::pending::<()>()).await;
        assert_eq!(outcome, Some(7));
    }

    // ── exit codes ─────────────────────────────────────

    #[test]
    fn test_exit_code_for() {
        assert_eq!(exit_code_for(&finished(Outcome::Completed, 0)), 0);
        assert_eq!(exit_code_for(&finished(Outcome::Completed, 3)), 3);
        assert_eq!(exit_code_for(&finished(Outcome::Completed, 300)), 255);
        assert_eq!(exit_code_for(&finished(Outcome::TimedOut, TIMEOUT_EXIT_CODE)), 1);
        assert_eq!(exit_code_for(&finished(Outcome::Failed, FAILURE_EXIT_CODE)), 1);
    }
}
