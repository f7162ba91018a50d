//! agent-workflow: run multi-agent workflows from the command line or serve them over MCP.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use agent_workflow_mcp::{
    AgentRegistry, AgentRuntime, AppConfig, EnvSecretStore, RegistryInvoker, WorkflowDefinition, WorkflowMcpServer,
};

/// Multi-agent workflow orchestration.
#[derive(Parser, Debug)]
#[command(name = "agent-workflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve MCP over stdio (default).
    Serve,
    /// Run a workflow definition and print the output as JSON.
    Run {
        /// Workflow definition (JSON).
        workflow: PathBuf,
        /// Value of `${user_input}`.
        #[arg(long, short, default_value = "")]
        input: String,
    },
    /// Validate a workflow definition against the configured agents.
    Validate {
        /// Workflow definition (JSON).
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries MCP traffic and command output.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt().json().with_env_filter(filter).with_writer(std::io::stderr).init();
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let config = match &args.config {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    let runtime = Arc::new(build_runtime(&config)?);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(agents = config.agents.len(), "Agent workflow server starting");
            let mut server = WorkflowMcpServer::new(runtime);
            server.run_stdio().await?;
        }
        Command::Run { workflow, input } => {
            let definition = read_workflow(&workflow)?;
            let output = runtime.engine().execute(&definition, &input).await;
            println!("{}", serde_json::to_string_pretty(&output)?);
            if !output.success {
                std::process::exit(1);
            }
        }
        Command::Validate { workflow } => {
            let definition = read_workflow(&workflow)?;
            runtime
                .engine()
                .validate(&definition)
                .with_context(|| format!("{} is invalid", workflow.display()))?;
            println!("{}: ok ({} top-level steps)", workflow.display(), definition.steps.len());
        }
    }

    Ok(())
}

fn build_runtime(config: &AppConfig) -> anyhow::Result<AgentRuntime> {
    let registry = AgentRegistry::from_config(&config.agents)?;
    let secrets = Arc::new(EnvSecretStore::new(config.secrets.env_prefix.clone()));
    let invoker = Arc::new(RegistryInvoker::with_config(registry, secrets, &config.engine));
    Ok(AgentRuntime::new(invoker, config))
}

fn read_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(WorkflowDefinition::from_json(&json)?)
}
