//! dbreach CLI Entry Point
//!
//! Subcommands:
//! - `probe` - Reachability diagnostics for the configured endpoint
//! - `discover` - Port discovery against the configured host
//! - `connect` - Acquire and validate a connection, report the server version
//! - `products` - Product-table operations over the validated connection
//! - `session` - JSON-RPC 2.0 over stdio with one connection cache per session
//!
//! All output to stdout is JSON-only. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dbreach::config::{self, Prompter, TerminalPrompter};
use dbreach::service::{DefaultService, ProbeRequest};
use dbreach::{session, DbReachError, ErrorEnvelope, ErrorInfo, Metadata, Settings, SuccessEnvelope};

/// dbreach - database endpoint discovery and validated connection reuse
#[derive(Parser)]
#[command(name = "dbreach")]
#[command(about = "Find a reachable database endpoint, connect with retries, and reuse only validated connections")]
#[command(version)]
struct Cli {
    /// Secrets file to use instead of the local and global ones
    #[arg(long, global = true)]
    secrets: Option<PathBuf>,

    /// Prompt for address, user or password when no other layer provides them
    #[arg(long, global = true)]
    interactive: bool,

    /// Skip port discovery and connect to the configured port only
    #[arg(long, global = true)]
    no_discovery: bool,

    /// Log verbosity on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diagnose reachability of the configured endpoint
    Probe {
        /// Probe another port on the configured host
        #[arg(long)]
        port: Option<u16>,

        /// Also attempt a TLS handshake
        #[arg(long)]
        tls: bool,

        /// Skip reading the server banner
        #[arg(long)]
        no_banner: bool,

        /// Connect timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Try the configured port, then the fallback ports, until one accepts
    Discover {
        /// Fallback ports to try (comma-separated)
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,
    },

    /// Acquire a validated connection and report the server version
    Connect,

    /// Product-table operations
    Products {
        #[command(subcommand)]
        action: ProductAction,
    },

    /// Serve JSON-RPC 2.0 requests over stdio
    Session,
}

#[derive(Subcommand)]
enum ProductAction {
    /// Distinct product names
    Names,

    /// All products with their descriptions
    List,

    /// Description of one product
    Show { name: String },

    /// Insert a product (description generated when omitted)
    Add {
        name: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// Replace a product's description
    Update {
        name: String,

        #[arg(long)]
        description: String,
    },

    /// Delete a product by name
    Delete { name: String },

    /// Generate a customer-facing explanation and log it
    Explain { name: String },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Probe { .. } => "probe",
            Self::Discover { .. } => "discover",
            Self::Connect => "connect",
            Self::Products { action } => match action {
                ProductAction::Names => "products.names",
                ProductAction::List => "products.list",
                ProductAction::Show { .. } => "products.describe",
                ProductAction::Add { .. } => "products.add",
                ProductAction::Update { .. } => "products.update",
                ProductAction::Delete { .. } => "products.delete",
                ProductAction::Explain { .. } => "products.explain",
            },
            Self::Session => "session",
        }
    }
}

/// Command payload plus the row count for listings
struct Output {
    data: Value,
    rows: Option<usize>,
}

impl Output {
    fn of(data: impl Serialize) -> Result<Self> {
        Ok(Self { data: serde_json::to_value(data)?, rows: None })
    }

    fn rows<T: Serialize>(rows: &[T]) -> Result<Self> {
        Ok(Self { data: serde_json::to_value(rows)?, rows: Some(rows.len()) })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli).await
}

/// Logs go to stderr; `RUST_LOG` overrides the `-v` level
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

async fn run(cli: Cli) -> ExitCode {
    let command = cli.command.name();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => return fail("", command, &err.into()),
    };
    let engine = settings.connection.engine.as_str();

    let mut service = match DefaultService::from_settings(settings) {
        Ok(service) => service,
        Err(err) => return fail(engine, command, &err.into()),
    };

    if matches!(cli.command, Commands::Session) {
        return match session::serve_stdio(&mut service).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error = %err, "session transport failed");
                ExitCode::FAILURE
            }
        };
    }

    let started = Instant::now();
    let outcome = execute(&mut service, cli.command).await;
    service.close().await;

    match outcome {
        Ok(output) => {
            let elapsed = elapsed_ms(started.elapsed());
            let meta = match output.rows {
                Some(rows) => Metadata::with_rows(elapsed, rows),
                None => Metadata::new(elapsed),
            };
            emit(&SuccessEnvelope::new(engine, command, output.data, meta));
            ExitCode::SUCCESS
        }
        Err(err) => fail(engine, command, &err),
    }
}

fn load_settings(cli: &Cli) -> dbreach::Result<Settings> {
    let secrets = config::load_secrets(cli.secrets.as_deref())?;
    let terminal = TerminalPrompter;
    let prompter: Option<&dyn Prompter> = if cli.interactive { Some(&terminal) } else { None };

    let mut settings = config::resolve(secrets, config::process_env, prompter)?;
    if cli.no_discovery {
        settings.discovery.enabled = false;
    }
    Ok(settings)
}

async fn execute(service: &mut DefaultService, command: Commands) -> Result<Output> {
    match command {
        Commands::Probe { port, tls, no_banner, timeout_secs } => {
            let request = ProbeRequest {
                port,
                tls: tls.then_some(true),
                read_banner: no_banner.then_some(false),
                timeout: timeout_secs.map(Duration::from_secs),
            };
            Output::of(service.probe(request).await)
        }
        Commands::Discover { ports } => Output::of(service.discover(ports).await),
        Commands::Connect => Output::of(service.connect().await?),
        Commands::Products { action } => match action {
            ProductAction::Names => Output::rows(&service.product_names().await?),
            ProductAction::List => Output::rows(&service.list_products().await?),
            ProductAction::Show { name } => Output::of(service.describe_product(&name).await?),
            ProductAction::Add { name, description } => Output::of(service.add_product(&name, description).await?),
            ProductAction::Update { name, description } => {
                Output::of(service.update_product(&name, &description).await?)
            }
            ProductAction::Delete { name } => Output::of(service.delete_product(&name).await?),
            ProductAction::Explain { name } => Output::of(service.explain_product(&name).await?),
        },
        Commands::Session => Err(DbReachError::invalid_input("session is not a one-shot command").into()),
    }
}

/// Print an error envelope and halt with status 1
fn fail(engine: &str, command: &str, err: &anyhow::Error) -> ExitCode {
    let info = match err.downcast_ref::<DbReachError>() {
        Some(err) => ErrorInfo::from(err),
        None => ErrorInfo::new("INTERNAL_ERROR", err.to_string()),
    };
    emit(&ErrorEnvelope::new(engine, command, info));
    ExitCode::FAILURE
}

fn emit(envelope: &impl Serialize) {
    match serde_json::to_string(envelope) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!(error = %e, "could not serialize output envelope");
            println!(r#"{{"ok":false,"error":{{"code":"INTERNAL_ERROR","message":"output serialization failed"}}}}"#);
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
