//! searchd - A Pre-Fork Search Server
//!
//! This is the main entry point for the searchd server.
//! It parses the command line, binds the listening socket and hands over to
//! the master process, which forks the workers.

use searchd::config::{PoolConfig, ServerConfig};
use searchd::storage::{Backend, MemoryBackend};
use searchd::supervisor::{ProcessContext, Supervisor};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fetches the value of option `args[i]`, or exits with a message.
fn value<'a>(args: &'a [String], i: usize) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

/// Parses a numeric option, or exits with a message.
fn number<T: FromStr>(args: &[String], i: usize) -> T {
    value(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid number for {}", args[i]);
        std::process::exit(1);
    })
}

/// Parse configuration from command-line arguments
fn from_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => config.bind = value(&args, i).to_string(),
            "--workers" | "-n" => {
                let workers: usize = number(&args, i);
                if workers > ServerConfig::MAX_WORKERS {
                    eprintln!("Error: at most {} workers are supported", ServerConfig::MAX_WORKERS);
                    std::process::exit(1);
                }
                config.workers = workers;
            }
            "--timeout" | "-t" => {
                let secs: u64 = number(&args, i);
                config.conn.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "--task-timeout" | "-k" => config.task_timeout = Duration::from_secs(number(&args, i)),
            "--data-dir" | "-d" => config.data_dir = PathBuf::from(value(&args, i)),
            "--max-threads" => {
                config.pool = PoolConfig {
                    max_total: number(&args, i),
                    ..config.pool
                }
                .normalize();
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("searchd version {}", searchd::VERSION);
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 2;
    }

    config
}

fn print_help() {
    println!(
        r#"
searchd - A Pre-Fork Search Server

USAGE:
    searchd [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>          Port, host:port or Unix socket path (default: 8384)
    -n, --workers <N>          Worker processes, 0 = single process (default: 3)
    -t, --timeout <SECS>       Connection idle timeout, 0 = none (default: 5)
    -k, --task-timeout <SECS>  Cancel pool tasks running longer (default: 60)
    -d, --data-dir <DIR>       Directory of project homes (default: data)
        --max-threads <N>      Pool threads per worker (default: 32, max: 100)
    -v, --version              Print version information
    -h, --help                 Print this help message

EXAMPLES:
    searchd                              # 3 workers on port 8384
    searchd -b 127.0.0.1:8384 -n 0       # Single process, loopback only
    searchd -b /tmp/searchd.sock         # Listen on a Unix socket

SIGNALS:
    SIGINT    shutdown gracefully (finish live connections)
    SIGTERM   terminate immediately
"#
    );
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = from_args();

    // Set up logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!(
        version = searchd::VERSION,
        bind = %config.bind,
        workers = config.workers,
        max_threads = config.pool.max_total,
        "starting searchd"
    );

    // Bind before forking so every worker shares the socket
    let ctx = ProcessContext::bind(config)?;
    let supervisor = Supervisor::new(ctx, |config: &ServerConfig| -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new(config.cache_capacity))
    });
    supervisor.run()?;

    info!("server shutdown complete");
    Ok(())
}
