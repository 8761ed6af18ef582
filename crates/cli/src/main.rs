//! trpc CLI - Main Entry Point
//!
//! Runs declarative gRPC test specifications against live servers.

use std::path::PathBuf;

use clap::Parser;

use trpc_cli::config::RunnerConfig;
use trpc_cli::output::{print_error, render_error};
use trpc_cli::run::{collect_specs, run_all};

/// trpc - declarative gRPC test runner
#[derive(Parser)]
#[command(name = "trpc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Specification files, or directories searched for *.trpc files
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Configuration file
    #[arg(long, env = "TRPC_CONFIG", default_value = "trpc.toml")]
    config: PathBuf,

    /// Seconds allowed to establish a connection
    #[arg(long, allow_negative_numbers = true)]
    connect_timeout: Option<f64>,

    /// Overall deadline in seconds for each specification
    #[arg(long, allow_negative_numbers = true)]
    max_time: Option<f64>,

    /// HTTP/2 keep-alive ping interval in seconds
    #[arg(long, allow_negative_numbers = true)]
    keepalive_time: Option<f64>,

    /// Message size limit in bytes
    #[arg(long = "max-msg-sz", allow_negative_numbers = true)]
    max_message_size: Option<i64>,

    /// Query server reflection even when schema files are imported
    #[arg(long)]
    reflection: bool,

    /// Drop request fields the schema does not know
    #[arg(long)]
    allow_unknown_fields: bool,

    /// User-Agent sent on every connection
    #[arg(long)]
    user_agent: Option<String>,

    /// Header sent on every call, as "name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Header sent on reflection calls, as "name: value"
    #[arg(long = "reflect-header")]
    reflect_headers: Vec<String>,

    /// CA certificate used to verify servers
    #[arg(long)]
    cacert: Option<PathBuf>,

    /// Client certificate
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key
    #[arg(long)]
    key: Option<PathBuf>,

    /// Server name verified against the server certificate
    #[arg(long)]
    servername: Option<String>,

    /// Value of the :authority pseudo-header
    #[arg(long)]
    authority: Option<String>,

    /// Exit with 64 + <status code> when a test fails
    #[arg(long)]
    status_exit_code: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Flags override the configuration file
    fn apply(self, config: &mut RunnerConfig) -> Vec<PathBuf> {
        if let Some(value) = self.connect_timeout {
            config.connect_timeout = value;
        }
        if let Some(value) = self.max_time {
            config.max_time = value;
        }
        if let Some(value) = self.keepalive_time {
            config.keepalive_time = value;
        }
        if let Some(value) = self.max_message_size {
            config.max_message_size = value;
        }
        if self.reflection {
            config.reflection = Some(true);
        }
        config.allow_unknown_fields |= self.allow_unknown_fields;
        config.status_exit_code |= self.status_exit_code;
        if self.user_agent.is_some() {
            config.user_agent = self.user_agent;
        }
        config.headers.extend(self.headers);
        config.reflect_headers.extend(self.reflect_headers);

        let tls = &mut config.tls;
        tls.ca_cert = self.cacert.or(tls.ca_cert.take());
        tls.cert = self.cert.or(tls.cert.take());
        tls.key = self.key.or(tls.key.take());
        tls.server_name = self.servername.or(tls.server_name.take());
        tls.authority = self.authority.or(tls.authority.take());
        self.paths
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let mut config = RunnerConfig::load(&cli.config)?;
    let paths = cli.apply(&mut config);
    if let Err(err) = config.validate() {
        print_error(&render_error(&err, None));
        std::process::exit(err.exit_code());
    }

    let files = match collect_specs(&paths) {
        Ok(files) => files,
        Err(err) => {
            print_error(&render_error(&err, None));
            std::process::exit(err.exit_code());
        }
    };

    let code = run_all(&files, &config).await;
    std::process::exit(code);
}
