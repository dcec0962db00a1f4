use clap::Parser;
use snippet_exec::{ExecutionConfig, RateLimitConfig, RateLimitPolicy, DEFAULT_BACKEND_URL};
use snippet_exec_server::{create_app, run_server};
use std::{net::SocketAddr, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to listen on
    #[arg(short, long, env = "SNIPPET_EXEC_ADDR", default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Piston-compatible execute endpoint
    #[arg(long, env = "PISTON_API_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Overall budget for one backend call, in milliseconds
    #[arg(long, env = "EXECUTION_TIMEOUT_MS", default_value = "10000")]
    timeout_ms: u64,

    /// Characters of program output kept before truncating
    #[arg(long, env = "MAX_OUTPUT_LENGTH", default_value = "10000")]
    max_output_length: usize,

    /// Maximum accepted source length in characters
    #[arg(long, env = "MAX_CODE_LENGTH", default_value = "100000")]
    max_code_length: usize,

    /// Execute requests allowed per client per window
    #[arg(long, env = "EXECUTE_RATE_LIMIT", default_value = "10")]
    execute_rate_limit: u32,

    /// API requests allowed per client per window
    #[arg(long, env = "API_RATE_LIMIT", default_value = "100")]
    api_rate_limit: u32,

    /// Rate limit window length in seconds
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    rate_limit_window_secs: u64,

    /// How often expired rate limit entries are purged, in seconds
    #[arg(long, env = "RATE_LIMIT_SWEEP_SECS", default_value = "300")]
    rate_limit_sweep_secs: u64,

    /// Send Strict-Transport-Security (only behind HTTPS)
    #[arg(long, env = "ENABLE_HSTS")]
    enable_hsts: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = ExecutionConfig::default()
        .with_backend_url(args.backend_url)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_max_output_length(args.max_output_length)
        .with_max_code_length(args.max_code_length);

    let window = Duration::from_secs(args.rate_limit_window_secs);
    let limits = RateLimitConfig {
        execute: RateLimitPolicy::new(args.execute_rate_limit, window),
        api: RateLimitPolicy::new(args.api_rate_limit, window),
        sweep_interval: Duration::from_secs(args.rate_limit_sweep_secs),
    };

    let app = create_app(config, limits, args.enable_hsts).await?;
    run_server(app, args.addr).await?;

    Ok(())
}
