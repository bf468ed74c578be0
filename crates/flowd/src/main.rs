//! flowd - job orchestrator daemon.
//!
//! Starts the HTTP intake gateway and the runner loop side by side, shutting
//! both down on SIGINT. Grounded on `loopd/src/main.rs`'s manual
//! `tokio::runtime::Builder` + `tracing_subscriber::fmt` + `ctrl_c` shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flow_store::ArtifactStore;
use flowd::{runner::Runner, server, Config};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async_main(config));
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    if config.log_json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

async fn async_main(config: Config) {
    let registry = Arc::new(flow_workers::WorkerRegistry::new());
    flow_workers::register_builtin_workers(&registry);

    let runner = match Runner::new(config.clone(), registry).await {
        Ok(runner) => Arc::new(runner),
        Err(e) => {
            error!(error = %e, "failed to initialize runner");
            std::process::exit(1);
        }
    };

    let queue = match flow_queue::FileQueue::open(&config.queue_root) {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "failed to open queue for HTTP gateway");
            std::process::exit(1);
        }
    };
    let store = ArtifactStore::new(&config.artifacts_root);
    let app_state = Arc::new(server::AppState::new(config, queue, store));

    let shutdown = Arc::new(AtomicBool::new(false));
    let runner_shutdown = shutdown.clone();
    let runner_for_loop = runner.clone();

    tokio::select! {
        result = runner_for_loop.run_forever(runner_shutdown) => {
            if let Err(e) = result {
                error!(error = %e, "runner loop exited with an error");
            }
        }
        result = server::start_server(app_state) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP intake gateway exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        }
    }
}
