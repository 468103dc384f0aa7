use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use classroom_core::config::ClassroomConfig;
use classroom_lifecycle::{
    Db, LifecycleHandlers, LifecycleOrchestrator, SqliteClassStore, SqliteNotificationSink,
    SqliteReviewStore,
};
use classroom_scheduler::{Scheduler, SchedulingHealth, SqliteJobStore};
use tracing::{info, warn};

mod app;
mod http;

#[derive(Parser, Debug)]
#[command(
    name = "classroom-gateway",
    about = "Class lifecycle scheduler with a job admin HTTP surface",
    version
)]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long, env = "CLASSROOM_CONFIG")]
    config: Option<String>,

    /// Override `scheduler.worker_id`.
    #[arg(long)]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "classroom_gateway=info,classroom_scheduler=info,classroom_lifecycle=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let args = Args::parse();
    let mut config = ClassroomConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ClassroomConfig::default()
    });
    if let Some(worker_id) = args.worker_id {
        config.scheduler.worker_id = Some(worker_id);
    }

    // single SQLite file for jobs, classes, notifications and reviews
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = open_db(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    classroom_scheduler::db::init_db(&db)?;
    classroom_lifecycle::db::init_db(&db)?;
    info!("database migrations complete");

    // scheduler and lifecycle stores each get their own connection
    let jobs = Arc::new(SqliteJobStore::new(open_db(&db_path)?)?);
    let scheduler = Scheduler::new(jobs, &config.scheduler);
    let health = Arc::new(SchedulingHealth::new());
    let lifecycle = LifecycleOrchestrator::new(
        scheduler.clone(),
        Arc::clone(&health),
        config.lifecycle.clone(),
    );

    let lifecycle_db: Db = Arc::new(Mutex::new(open_db(&db_path)?));
    let classes = Arc::new(SqliteClassStore::new(Arc::clone(&lifecycle_db)));
    let notifications = Arc::new(SqliteNotificationSink::new(Arc::clone(&lifecycle_db)));
    let reviews = Arc::new(SqliteReviewStore::new(lifecycle_db));

    let handlers = Arc::new(LifecycleHandlers::new(
        classes.clone(),
        notifications,
        reviews.clone(),
        lifecycle.clone(),
    ));
    handlers.register(&scheduler, &config.scheduler.cleanup_cron)?;
    scheduler.start();
    info!(worker_id = %scheduler.worker_id(), "scheduler started");

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(
        config,
        scheduler.clone(),
        health,
        lifecycle,
        classes,
        reviews,
    ));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(%addr, "classroom gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining in-flight jobs");
    scheduler.stop().await;
    // job closures only hold weak references; release the handlers last
    drop(handlers);
    info!("shutdown complete");
    Ok(())
}

fn open_db(path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    // several connections share the file; wait out short write locks
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Create the parent directory of a file path if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "failed to create directory: {e}");
            }
        }
    }
}
