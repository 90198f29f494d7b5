// capgate-cli/src/main.rs
// ============================================================================
// Module: capgate CLI Entry Point
// Description: Command dispatcher for the capability gate.
// Purpose: Serve the gate, validate configuration, and inspect the registry.
// Dependencies: clap, capgate-config, capgate-core, capgate-server, tokio
// ============================================================================

//! ## Overview
//! `capgate serve` runs the gate server with the admin API and health
//! probe. `capgate config validate` loads and validates `capgate.toml`,
//! printing startup warnings for accepted but suspicious settings.
//! `capgate capabilities list` prints the effective registry as JSON.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use capgate_config::CapgateConfig;
use capgate_core::CapabilityRegistry;
use capgate_core::NoopAuditSink;
use capgate_core::RegistrySource;
use capgate_server::GateComponents;
use capgate_server::GateServer;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde_json::json;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "capgate", version, disable_help_subcommand = true)]
struct Cli {
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the capability gate server.
    Serve(ConfigArgs),
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Capability registry utilities.
    Capabilities {
        /// Selected capabilities subcommand.
        #[command(subcommand)]
        command: CapabilitiesCommand,
    },
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Validate a config file and print warnings.
    Validate(ValidateCommand),
}

/// Capabilities subcommands.
#[derive(Subcommand, Debug)]
enum CapabilitiesCommand {
    /// Print the effective capability registry as JSON.
    List(ConfigArgs),
}

/// Config path argument shared by commands.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Config file path (defaults to `CAPGATE_CONFIG`, then `./capgate.toml`).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Arguments for `config validate`.
#[derive(Args, Debug)]
struct ValidateCommand {
    /// Config path selection.
    #[command(flatten)]
    config: ConfigArgs,
    /// Exit non-zero when warnings are present.
    #[arg(long)]
    strict: bool,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => command_serve(&args).await,
        Commands::Config {
            command: ConfigCommand::Validate(command),
        } => command_config_validate(&command),
        Commands::Capabilities {
            command: CapabilitiesCommand::List(args),
        } => command_capabilities_list(&args),
    }
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Executes `serve`.
async fn command_serve(args: &ConfigArgs) -> CliResult<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    for line in warning_lines(&config) {
        write_stderr_line(&line).map_err(|err| CliError::new(output_error("stderr", &err)))?;
    }
    let bind = config.server.bind.clone();
    let server = GateServer::from_config(config)
        .map_err(|err| CliError::new(format!("server init failed: {err}")))?;
    write_stderr_line(&format!("capgate listening on {bind}"))
        .map_err(|err| CliError::new(output_error("stderr", &err)))?;
    server
        .serve(axum::Router::new())
        .await
        .map_err(|err| CliError::new(format!("server failed: {err}")))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `config validate`.
fn command_config_validate(command: &ValidateCommand) -> CliResult<ExitCode> {
    let config = load_config(command.config.config.as_deref())?;
    let warnings = warning_lines(&config);
    for line in &warnings {
        write_stderr_line(line).map_err(|err| CliError::new(output_error("stderr", &err)))?;
    }
    write_stdout_line("config ok").map_err(|err| CliError::new(output_error("stdout", &err)))?;
    if command.strict && !warnings.is_empty() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `capabilities list`.
fn command_capabilities_list(args: &ConfigArgs) -> CliResult<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let rendered = render_capabilities(&config)?;
    write_stdout_line(&rendered).map_err(|err| CliError::new(output_error("stdout", &err)))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Loads configuration from `path` or the default resolution chain.
fn load_config(path: Option<&Path>) -> CliResult<CapgateConfig> {
    CapgateConfig::load(path).map_err(|err| CliError::new(format!("config load failed: {err}")))
}

/// Formats config warnings for display.
fn warning_lines(config: &CapgateConfig) -> Vec<String> {
    config.warnings().iter().map(|warning| format!("warning: {warning}")).collect()
}

/// Loads the registry the server would start with and renders it as JSON.
fn render_capabilities(config: &CapgateConfig) -> CliResult<String> {
    let components = GateComponents::from_config(config)
        .map_err(|err| CliError::new(format!("backend init failed: {err}")))?;
    let registry = CapabilityRegistry::load(
        components.store,
        config.fallback_capabilities(),
        Arc::new(NoopAuditSink),
    );
    let snapshot = registry.snapshot();
    let source = match snapshot.source() {
        RegistrySource::Persisted => "persisted",
        RegistrySource::Fallback => "fallback",
    };
    let document = json!({
        "source": source,
        "capabilities": snapshot.capabilities(),
    });
    serde_json::to_string_pretty(&document)
        .map_err(|err| CliError::new(format!("json encode failed: {err}")))
}

/// Writes a line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Formats an output stream failure.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write to {stream}: {error}")
}

/// Reports an error and returns a failing exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(&format!("error: {message}"));
    ExitCode::FAILURE
}
