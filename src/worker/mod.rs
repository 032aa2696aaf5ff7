//! Worker bootstrap, run once in a freshly forked subprocess.
//!
//! Order of operations: wait for `{type:"start", config}` on stdin, bind
//! the HTTP listener (probing random ports when the configured one is
//! taken and dynamic ports are allowed), register routes, report
//! `{type:"ready"}` on stdout, then initialize the plugin loader while the
//! server is already accepting (`/ready` answers "not-ready" until the
//! loader finishes). Shutdown begins on `{type:"shutdown"}`, stdin EOF
//! (the supervisor died), SIGTERM, or SIGINT; in-flight requests drain
//! while the gate answers 503.

pub mod http;

use std::io::ErrorKind;
use std::sync::Arc;

use anyhow::{bail, Context};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines, Stdin};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::cleanup::CleanupRegistry;
use crate::config::{Settings, WorkerConfig};
use crate::ipc::{self, ParentMsg, WorkerMsg};
use crate::plugin::loader::PluginLoader;
use crate::response::ResponseEngine;
use self::http::WorkerState;

/// Entry point for the `faaslet-worker` binary.
pub async fn run() -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let config = wait_for_start(&mut stdin).await?;
    serve(config, stdin).await
}

async fn wait_for_start(stdin: &mut Lines<BufReader<Stdin>>) -> anyhow::Result<WorkerConfig> {
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ParentMsg>(line) {
            Ok(ParentMsg::Start { config }) => return Ok(config),
            Ok(ParentMsg::Shutdown) => bail!("received shutdown before start"),
            Err(_) => warn!(%line, "unintelligible ipc line before start, ignoring"),
        }
    }
    bail!("parent closed stdin before sending start")
}

async fn serve(config: WorkerConfig, stdin: Lines<BufReader<Stdin>>) -> anyhow::Result<()> {
    if let Some(env) = &config.env {
        for (k, v) in env {
            std::env::set_var(k, v);
        }
    }
    let storage = config
        .storage
        .clone()
        .context("worker config has no storage root")?;

    let listener = bind(&config).await?;
    let port = listener.local_addr()?.port();
    let prefix = http::normalize_prefix(&config.url_prefix);
    let url = format!("http://{}:{}{}", config.host, port, prefix);

    let cleanup = CleanupRegistry::new();
    let engine = ResponseEngine::new(Settings::from_env(), cleanup);
    let loader = PluginLoader::new(storage, engine);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let state = Arc::new(WorkerState {
        loader: loader.clone(),
        shutting_down: shutdown_rx.clone(),
    });
    let app = http::router(state, &config.url_prefix);

    // stdout is the IPC channel; all writes funnel through one task
    let (ipc_tx, mut ipc_rx) = mpsc::unbounded_channel::<WorkerMsg>();
    tokio::spawn(async move {
        let mut out = BufWriter::new(tokio::io::stdout());
        while let Some(msg) = ipc_rx.recv().await {
            let line = ipc::encode(&msg);
            if out.write_all(line.as_bytes()).await.is_err()
                || out.write_all(b"\n").await.is_err()
                || out.flush().await.is_err()
            {
                break;
            }
        }
    });

    info!(%url, port, "worker listening");
    let _ = ipc_tx.send(WorkerMsg::Ready {
        url: url.clone(),
        port,
    });

    // plugin initialization happens while the server is already up; a
    // fatal loader error is forwarded to the parent and ends the worker
    {
        let loader = loader.clone();
        let ipc_tx = ipc_tx.clone();
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            if let Err(e) = loader.init().await {
                error!(error = %e, "plugin initialization failed");
                let _ = ipc_tx.send(WorkerMsg::Error {
                    error: e.to_string(),
                });
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // parent traffic after start: shutdown message, or EOF when it died
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        let mut stdin = stdin;
        tokio::spawn(async move {
            loop {
                match stdin.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ParentMsg>(line) {
                            Ok(ParentMsg::Shutdown) => {
                                info!("shutdown requested by supervisor");
                                break;
                            }
                            Ok(ParentMsg::Start { .. }) => {
                                warn!("duplicate start message ignored");
                            }
                            Err(_) => warn!(%line, "unintelligible ipc line, ignoring"),
                        }
                    }
                    Ok(None) | Err(_) => {
                        warn!("supervisor went away, shutting down");
                        break;
                    }
                }
            }
            let _ = shutdown_tx.send(true);
        });
    }

    // OS signals
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    let mut shutdown_rx = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("worker draining");
        })
        .await?;

    info!("worker stopped");
    Ok(())
}

/// Bind the configured address. On address-in-use with dynamic ports
/// enabled, probe random ephemeral ports in `[9000, 65535)`, decrementing
/// the attempt budget when one was configured. Any other bind error is
/// fatal.
async fn bind(config: &WorkerConfig) -> anyhow::Result<TcpListener> {
    match TcpListener::bind((config.host.as_str(), config.port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse && config.dynamic_port.is_enabled() => {
            let mut remaining = config.dynamic_port.attempts();
            loop {
                let port: u16 = rand::rng().random_range(9000..65535);
                match TcpListener::bind((config.host.as_str(), port)).await {
                    Ok(listener) => return Ok(listener),
                    Err(e) if e.kind() == ErrorKind::AddrInUse => {
                        if let Some(left) = remaining.as_mut() {
                            *left = left.saturating_sub(1);
                            if *left == 0 {
                                bail!("dynamic port probing exhausted its attempts");
                            }
                        }
                        warn!(port, "probed port in use, retrying");
                    }
                    Err(e) => {
                        return Err(e).context(format!("failed to bind {}:{}", config.host, port))
                    }
                }
            }
        }
        Err(e) => Err(e).context(format!(
            "failed to bind {}:{}",
            config.host, config.port
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicPort;

    fn config_on(port: u16, dynamic_port: DynamicPort) -> WorkerConfig {
        WorkerConfig {
            id: Some("w".into()),
            url_prefix: "api".into(),
            host: "127.0.0.1".into(),
            port,
            dynamic_port,
            storage: Some(std::env::temp_dir()),
            env: None,
        }
    }

    #[tokio::test]
    async fn bind_prefers_the_requested_port() {
        let listener = bind(&config_on(0, DynamicPort::Flag(false))).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn bind_probes_when_port_is_taken_and_dynamic_is_on() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let listener = bind(&config_on(port, DynamicPort::Flag(true))).await.unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert_ne!(bound, port);
        assert!((9000..65535).contains(&bound));
    }

    #[tokio::test]
    async fn bind_fails_fast_without_dynamic_ports() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(bind(&config_on(port, DynamicPort::Flag(false))).await.is_err());
    }
}
