//! JSON-lines TCP export of metrics snapshots and advisories.
//!
//! Each connected client receives one JSON object per line:
//!
//! ```text
//! {"type":"snapshot","events_per_sec":52011.4,...}
//! {"type":"advisory","kind":"QueueBacklog","category":"Visual",...}
//! ```
//!
//! Clients that fall behind the broadcast buffer skip ahead; a slow client never slows the
//! scheduler.

use crate::engine::Scheduler;
use crate::metrics::{Advisory, MetricsSnapshot};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BROADCAST_CAPACITY: usize = 256;

/// One exported line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportRecord<'a> {
    Snapshot(&'a MetricsSnapshot),
    Advisory(&'a Advisory),
}

impl ExportRecord<'_> {
    /// Serialize as a newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Handle on a running export server.
pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricsServer {
    /// Address the listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop publishing and close the listener. Connected clients see EOF.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Bind `bind_addr` and stream a snapshot every `interval`, plus every advisory, to all clients.
///
/// Must be called from within a tokio runtime.
pub async fn serve_metrics(
    scheduler: Arc<Scheduler>,
    bind_addr: &str,
    interval: Duration,
) -> std::io::Result<MetricsServer> {
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let (lines_tx, _) = broadcast::channel::<Arc<str>>(BROADCAST_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let publisher = tokio::spawn(publish_loop(
        scheduler,
        lines_tx.clone(),
        shutdown_rx.clone(),
        interval,
    ));
    let acceptor = tokio::spawn(accept_loop(listener, lines_tx, shutdown_rx));

    info!(%local_addr, "metrics export listening");
    Ok(MetricsServer {
        local_addr,
        shutdown: shutdown_tx,
        tasks: vec![publisher, acceptor],
    })
}

async fn publish_loop(
    scheduler: Arc<Scheduler>,
    lines: broadcast::Sender<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    let advisories = scheduler.subscribe_advisories();
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        for advisory in advisories.try_iter() {
            publish(&lines, &ExportRecord::Advisory(&advisory));
        }
        let snapshot = scheduler.snapshot();
        publish(&lines, &ExportRecord::Snapshot(&snapshot));
    }
}

fn publish(lines: &broadcast::Sender<Arc<str>>, record: &ExportRecord<'_>) {
    match record.to_line() {
        // No receivers is not an error: nobody is connected yet.
        Ok(line) => {
            let _ = lines.send(Arc::from(line));
        }
        Err(err) => warn!(error = %err, "failed to serialize export record"),
    }
}

async fn accept_loop(
    listener: TcpListener,
    lines: broadcast::Sender<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "metrics client connected");
                    tokio::spawn(serve_client(stream, lines.subscribe(), shutdown.clone()));
                }
                Err(err) => warn!(error = %err, "metrics accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_client(
    mut stream: tokio::net::TcpStream,
    mut lines: broadcast::Receiver<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let line = tokio::select! {
            received = lines.recv() => received,
            _ = shutdown.changed() => break,
        };
        match line {
            Ok(line) => {
                if stream.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "metrics client lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
