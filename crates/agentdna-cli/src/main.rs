//! AgentDNA CLI - sign and verify trust envelopes
//!
//! Commands:
//! - agentdna keygen - Create (or load) an agent identity
//! - agentdna did - Print the DID of an identity
//! - agentdna build host|remote - Sign an envelope and print it as JSON
//! - agentdna verify [FILE|-] - Verify an envelope and print the trust result
//! - agentdna history - Stream audit records as JSON lines

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentdna_core::{
    AgentdnaConfig, AuditFilter, BuildInput, Did, EnvelopeBuilder, EnvelopeKind, Identity,
    KeyStore, VerifyMode,
};

#[derive(Parser)]
#[command(name = "agentdna")]
#[command(about = "Signed trust envelopes for agent conversations", long_about = None)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the TOML configuration file
    #[arg(short, long, env = "AGENTDNA_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an identity if needed and print its DID and public key
    Keygen {
        /// Identity alias (defaults to agent.alias)
        #[arg(short, long)]
        alias: Option<String>,

        /// Key directory (defaults to agent.key_dir)
        #[arg(long)]
        key_dir: Option<PathBuf>,
    },

    /// Print the DID of an identity
    Did {
        #[arg(short, long)]
        alias: Option<String>,
    },

    /// Build and sign an envelope
    Build {
        #[command(subcommand)]
        command: BuildCommands,
    },

    /// Verify an envelope read from FILE (or stdin)
    Verify {
        /// Envelope file, or - for stdin
        #[arg(default_value = "-")]
        input: String,

        /// light or heavy (defaults to verify.default_mode)
        #[arg(short, long)]
        mode: Option<VerifyMode>,

        /// Required envelope kind: host_request or agent_response
        #[arg(short, long)]
        expect: Option<EnvelopeKind>,
    },

    /// Stream audit records from the configured ledger as JSON lines
    History {
        /// Only records whose peer is this DID
        #[arg(long)]
        signer: Option<Did>,

        /// Only verified (true) or unverified (false) records
        #[arg(long)]
        verified: Option<bool>,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Sign a host_request
    Host {
        #[arg(short, long)]
        alias: Option<String>,

        #[arg(short, long)]
        message: String,

        /// Conversation state as a JSON object
        #[arg(short, long, default_value = "{}")]
        state: String,
    },

    /// Sign an agent_response
    Remote {
        #[arg(short, long)]
        alias: Option<String>,

        /// The host message being answered
        #[arg(short, long)]
        message: String,

        #[arg(short, long)]
        response: String,

        /// The host's state block as JSON (object or null)
        #[arg(long, default_value = "null")]
        host_block: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level.as_str())),
        )
        .init();

    let mut stdout = std::io::stdout().lock();
    let code = run(cli, &mut stdout).await?;
    Ok(ExitCode::from(code))
}

/// Execute one command, writing its output to `out`. Returns the process exit status.
async fn run(cli: Cli, out: &mut dyn Write) -> anyhow::Result<u8> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Keygen { alias, key_dir } => {
            if let Some(alias) = alias {
                config.agent.alias = alias;
            }
            if let Some(dir) = key_dir {
                config.agent.key_dir = Some(dir);
            }
            let store = config.key_store();
            let identity = store.load(&config.agent.alias)?;
            writeln!(out, "alias:      {}", identity.alias())?;
            writeln!(out, "did:        {}", identity.did())?;
            writeln!(out, "public_key: {}", identity.public_key().to_hex())?;
            writeln!(out, "agent_id:   {}", identity.agent_id())?;
            writeln!(
                out,
                "key_file:   {}",
                store.key_path(&config.agent.alias).display()
            )?;
        }

        Commands::Did { alias } => {
            let identity = load_identity(&mut config, alias)?;
            writeln!(out, "{}", identity.did())?;
        }

        Commands::Build { command } => {
            let (alias, input) = match command {
                BuildCommands::Host {
                    alias,
                    message,
                    state,
                } => (alias, BuildInput::host(message, parse_json("--state", &state)?)),
                BuildCommands::Remote {
                    alias,
                    message,
                    response,
                    host_block,
                } => (
                    alias,
                    BuildInput::remote(message, response, parse_json("--host-block", &host_block)?),
                ),
            };
            let identity = load_identity(&mut config, alias)?;
            let envelope = EnvelopeBuilder::new(identity).build(input)?;
            out.write_all(&envelope.to_json_bytes()?)?;
            writeln!(out)?;
        }

        Commands::Verify {
            input,
            mode,
            expect,
        } => {
            let raw = read_input(&input)?;
            let mode = mode.unwrap_or(config.verify.default_mode);
            let verifier = config.build_verifier()?;
            let trust = verifier.handle(&raw, mode, expect).await?;
            serde_json::to_writer_pretty(&mut *out, &trust)?;
            writeln!(out)?;
            if !trust.verified() {
                return Ok(1);
            }
        }

        Commands::History { signer, verified } => {
            let ledger = config
                .build_ledger()?
                .context("no audit ledger configured (set [audit].backend)")?;
            let filter = AuditFilter {
                signer_id: signer,
                verified,
                ..AuditFilter::default()
            };
            let mut records = ledger.fetch_history(filter);
            while let Some(record) = records.try_next().await? {
                serde_json::to_writer(&mut *out, &record)?;
                writeln!(out)?;
            }
        }
    }

    Ok(0)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AgentdnaConfig> {
    let mut config = match path {
        Some(path) => AgentdnaConfig::load(path)?,
        None => AgentdnaConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn load_identity(config: &mut AgentdnaConfig, alias: Option<String>) -> anyhow::Result<Arc<Identity>> {
    if let Some(alias) = alias {
        config.agent.alias = alias;
    }
    Ok(config.load_identity()?)
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))
}

fn read_input(input: &str) -> anyhow::Result<Vec<u8>> {
    if input == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(input).with_context(|| format!("cannot read {input}"))
    }
}
