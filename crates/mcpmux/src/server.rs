use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc, watch};

use crate::bridge::{Bridge, BridgeEvent};
use crate::config::BridgeConfig;

/// A running bridge: the actor task plus the TCP accept loop.
pub struct BridgeHandle {
    addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    shutdown_tx: watch::Sender<bool>,
    actor: tokio::task::JoinHandle<()>,
    acceptor: tokio::task::JoinHandle<()>,
}

/// Bind the listener and start serving. Returns once the socket is bound so
/// callers (and tests) can read the actual address.
pub async fn start(cfg: BridgeConfig) -> Result<BridgeHandle> {
    let listener = TcpListener::bind((cfg.bind.as_str(), cfg.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cfg.bind, cfg.port))?;
    let addr = listener
        .local_addr()
        .context("failed to resolve local listen address")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(cfg.clone(), events_tx.clone());
    let actor = tokio::spawn(bridge.run(events_rx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let acceptor = tokio::spawn(accept_loop(listener, cfg, events_tx.clone(), shutdown_rx));

    Ok(BridgeHandle {
        addr,
        events_tx,
        shutdown_tx,
        actor,
        acceptor,
    })
}

impl BridgeHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Graceful shutdown: stop accepting, close clients, kill helpers.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.events_tx.send(BridgeEvent::Shutdown);
        let _ = self.acceptor.await;
        let _ = self.actor.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    cfg: BridgeConfig,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let next_client_id = Arc::new(AtomicU64::new(1));
    let connection_slots = Arc::new(Semaphore::new(cfg.max_connections.max(1)));

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(error = %error, "failed to accept client connection");
                        continue;
                    }
                };
                let permit = match connection_slots.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!(
                            max_connections = cfg.max_connections,
                            "rejecting connection: limit reached"
                        );
                        continue;
                    }
                };

                let client = next_client_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(client, peer = %peer, "client connected");
                let connection_events = events_tx.clone();
                let socket_timeout = cfg.socket_timeout;
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, client, socket_timeout, connection_events).await;
                });
            }
        }
    }
}

/// One task per client socket: a writer draining the bridge's reply sink and
/// a framed read loop bounded by the inactivity timeout.
async fn handle_connection(
    stream: TcpStream,
    client: u64,
    socket_timeout: std::time::Duration,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();
    if events_tx
        .send(BridgeEvent::Connected {
            client,
            sink: sink_tx,
        })
        .is_err()
    {
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(mut line) = sink_rx.recv().await {
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(socket_timeout, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let _ = events_tx.send(BridgeEvent::Frame {
                    client,
                    line: std::mem::take(&mut line),
                });
            }
            Ok(Err(error)) => {
                tracing::debug!(client, error = %error, "client read failed");
                break;
            }
            Err(_) => {
                tracing::debug!(client, "closing idle client connection");
                break;
            }
        }
    }

    // Dropping the sink on the bridge side stops the writer; announce the
    // disconnect so pending state is cleaned up.
    let _ = events_tx.send(BridgeEvent::Disconnected { client });
    writer.abort();
    tracing::debug!(client, "client disconnected");
}
