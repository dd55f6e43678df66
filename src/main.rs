use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::pipeline::{Admission, ClientRequest};
use turnstile::ratelimit::LimiterSet;

/// Operate Turnstile rate limit profiles against the configured stores.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run requests through a profile and print each admission
    Check {
        #[command(flatten)]
        request: RequestArgs,

        /// Request path, matched against skip rules
        #[arg(long, default_value = "/")]
        path: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },
    /// Clear the bucket a request maps to
    Reset {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// List the configured profiles
    Profiles,
}

#[derive(Debug, Args)]
struct RequestArgs {
    /// Profile name
    #[arg(long)]
    profile: String,

    /// Client address
    #[arg(long)]
    addr: IpAddr,

    /// Submitted field as name=value, repeatable
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
}

impl RequestArgs {
    fn to_request(&self) -> ClientRequest {
        self.fields
            .iter()
            .fold(ClientRequest::new(self.addr), |request, (name, value)| {
                request.with_field(name, value)
            })
    }
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TurnstileConfig::default(),
    };
    info!(profiles = config.profiles.len(), expiry = ?config.expiry, "Configuration loaded");

    match cli.command {
        Command::Profiles => {
            for profile in &config.profiles {
                println!("{}", serde_json::to_string(profile)?);
            }
        }
        Command::Reset { request } => {
            let limiters = LimiterSet::from_config(&config)?;
            let limiter = limiters.require(&request.profile)?;
            limiter.reset(&request.to_request()).await?;
            println!("{}", json!({ "profile": request.profile, "reset": true }));
        }
        Command::Check {
            request,
            path,
            count,
            interval_ms,
        } => {
            let limiters = LimiterSet::from_config(&config)?;
            limiters.start();

            let limiter = limiters.require(&request.profile)?;
            let client_request = request.to_request().with_path(path);
            let pause = Duration::from_millis(interval_ms);

            let run = async {
                for attempt in 1..=count {
                    let admission = limiter.admit(&client_request).await;
                    println!("{}", render(attempt, &admission));
                    if attempt < count && !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
            };

            tokio::select! {
                _ = run => {}
                _ = shutdown_signal() => {}
            }

            limiters.shutdown().await;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn render(attempt: u32, admission: &Admission) -> serde_json::Value {
    let headers: serde_json::Map<String, serde_json::Value> = admission
        .headers()
        .iter()
        .map(|(name, value)| (name.clone(), json!(value)))
        .collect();

    match admission {
        Admission::Proceed { .. } => json!({
            "attempt": attempt,
            "allowed": true,
            "headers": headers,
        }),
        Admission::Reject(rejection) => json!({
            "attempt": attempt,
            "allowed": false,
            "status": rejection.status,
            "headers": headers,
            "body": rejection.body,
        }),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
