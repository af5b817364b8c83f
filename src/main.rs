use std::collections::BTreeSet;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolcell::{
    EngineConfig, EngineError, ExecutionRequest, SandboxEngine, apply_process_limits,
};

fn print_help() {
    println!(
        "\
toolcell v{}

Validate and run restricted scripts.

USAGE:
    toolcell [OPTIONS] <COMMAND>

COMMANDS:
    validate SCRIPT [MODULE...]   Print validation findings as JSON
                                  (exit code 1 when rejected)
    run REQUEST.json              Run a request and print the result as JSON
    limits                        Apply process limits and print their status

OPTIONS:
    -c, --config PATH    TOML configuration file [default: built-in defaults]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing (e.g. debug, toolcell=debug)",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Command {
    Validate { script: String, modules: Vec<String> },
    Run { request: String },
    Limits,
}

struct Cli {
    config: Option<String>,
    command: Command,
}

fn parse_args() -> Result<Cli> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("toolcell v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config = Some(args.next().context("--config needs a path")?);
            }
            _ => rest.push(arg),
        }
    }

    let mut rest = rest.into_iter();
    let command = match rest.next().as_deref() {
        Some("validate") => Command::Validate {
            script: rest.next().context("validate needs a script path")?,
            modules: rest.collect(),
        },
        Some("run") => Command::Run {
            request: rest.next().context("run needs a request path")?,
        },
        Some("limits") => Command::Limits,
        Some(other) => bail!("unknown command '{other}', see --help"),
        None => bail!("no command given, see --help"),
    };
    Ok(Cli { config, command })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = parse_args()?;

    // Logs go to stderr; stdout carries JSON only
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolcell=info")),
        )
        .init();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {path}");
            EngineConfig::load(path).with_context(|| format!("loading {path}"))?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Limits => {
            let status = apply_process_limits(&config.process);
            println!("{}", serde_json::to_string_pretty(status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { script, modules } => {
            let source =
                std::fs::read_to_string(&script).with_context(|| format!("reading {script}"))?;
            let engine = SandboxEngine::new(config)?;
            let modules: BTreeSet<String> = if modules.is_empty() {
                engine.module_table().module_names().map(str::to_string).collect()
            } else {
                modules.into_iter().collect()
            };
            let findings = engine.validate_only(&source, &modules);
            println!("{}", serde_json::to_string_pretty(&findings)?);
            Ok(if findings.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run { request } => {
            let text =
                std::fs::read_to_string(&request).with_context(|| format!("reading {request}"))?;
            let request: ExecutionRequest =
                serde_json::from_str(&text).context("parsing request")?;
            apply_process_limits(&config.process);
            let engine = SandboxEngine::new(config)?;

            match engine.execute(request).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(if result.success {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }
                Err(
                    e @ (EngineError::ValidationRejected(_) | EngineError::ModulesNotPermitted(_)),
                ) => {
                    let report = serde_json::json!({
                        "class": e.class(),
                        "message": e.to_string(),
                        "findings": e.findings(),
                    });
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}
