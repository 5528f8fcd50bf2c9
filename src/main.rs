use std::env;
use std::sync::Arc;

use drawdown::api::{SharedStore, run_cli, run_http_server};
use drawdown::store::{JsonFileStore, MemoryStore};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const STATE_PATH_VAR: &str = "DRAWDOWN_STATE";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn state_store() -> SharedStore {
    match env::var(STATE_PATH_VAR) {
        Ok(path) if !path.trim().is_empty() => {
            info!(%path, "persisting planner state to file");
            Arc::new(JsonFileStore::new(path))
        }
        _ => {
            info!("{STATE_PATH_VAR} not set, planner state kept in memory");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let raw_args: Vec<String> = env::args().collect();
    if raw_args.get(1).map(|s| s.as_str()) == Some("serve") {
        let port = raw_args
            .get(2)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8080);
        if let Err(e) = run_http_server(port, state_store()).await {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        }
        return;
    }

    match run_cli(raw_args) {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
