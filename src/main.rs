use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod answer;
mod archive;
mod bm25;
mod chunker;
mod config;
mod error;
mod ingest;
mod llm;
mod mail;
mod registry;
mod retriever;
mod router;
mod routes;
mod retry;
mod scheduler;
mod server;
mod state;
mod vector;

#[tokio::main]
async fn main() -> Result<()> {
    let log_dir = std::env::var("MAILRAG_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("mailrag").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".mailrag-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "mailrag-core.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mailrag_core=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry().with(env_filter).with(stdout_layer).with(file_layer).init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "mailrag_core::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();
    routes::health::init_shutdown_notify();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        worker_count = config.worker_count,
        poll_interval_secs = config.poll_interval_secs,
        log_dir = %log_dir,
        "mailrag-core starting"
    );

    let app_state = state::AppState::new(config).await?;
    let app = server::create_app(app_state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mailrag-core listening on {}", addr);

    let (mail_shutdown_tx, mail_shutdown_rx) = tokio::sync::watch::channel(false);
    let mail_state = app_state.clone();
    tokio::spawn(async move {
        let state_path = std::path::PathBuf::from(&mail_state.config.data_dir).join("mail_cursor.json");
        let mail_loop = mail::MailLoop::new(
            mail_state.config.clone(),
            mail_state.mail_transport.clone(),
            mail_state.archive.clone(),
            mail_state.registry.clone(),
            mail_state.scheduler.clone(),
            state_path,
        )
        .await;
        mail_loop.run(mail_shutdown_rx).await;
    });

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    let _ = mail_shutdown_tx.send(true);
    app_state.scheduler.shutdown(std::time::Duration::from_secs(30)).await;

    info!("mailrag-core shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c().await.expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("received HTTP shutdown request, initiating shutdown"); },
    }

    info!("shutdown signal received");
}
