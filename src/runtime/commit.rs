use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::models::{CommitRequest, SyncResponse};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected commit ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl TransportError {
    /// A 4xx answer means the payload itself is refused; sending it again
    /// cannot succeed. Timeouts and rate limits are still worth retrying.
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Http(_) => false,
            TransportError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
        }
    }
}

/// Delivers one commit payload to the progress sync endpoint.
#[async_trait]
pub trait CommitTransport: Send + Sync {
    async fn send(&self, payload: &CommitRequest) -> Result<(), TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl CommitTransport for HttpTransport {
    async fn send(&self, payload: &CommitRequest) -> Result<(), TransportError> {
        let resp = self.client.post(&self.url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let ack: SyncResponse = resp.json().await?;
        tracing::debug!(
            session_id = %payload.session_id,
            sequence = payload.sequence_number,
            applied = ack.applied,
            completed = ack.progress.completed,
            "commit acknowledged"
        );
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Commit(CommitRequest),
    /// Issued by Terminate; the worker drains and exits.
    Final(CommitRequest),
    /// Page is going away: one best-effort send, no retries.
    Unload(CommitRequest),
}

pub(crate) struct Worker {
    pub tx: mpsc::UnboundedSender<WorkerMsg>,
    pub join: JoinHandle<()>,
}

/// Starts the delivery loop. `tick` runs on every auto-commit interval and is
/// expected to enqueue the periodic payload through the returned sender, so
/// sequence numbers reach the worker in the order they were assigned.
pub(crate) fn spawn_worker<F>(
    transport: Arc<dyn CommitTransport>,
    period: Duration,
    final_retries: u32,
    tick: F,
) -> Worker
where
    F: Fn() + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let join = tokio::spawn(run(rx, transport, period, final_retries, tick));
    Worker { tx, join }
}

async fn run<F>(
    mut rx: mpsc::UnboundedReceiver<WorkerMsg>,
    transport: Arc<dyn CommitTransport>,
    period: Duration,
    final_retries: u32,
    tick: F,
) where
    F: Fn() + Send + Sync + 'static,
{
    let mut pending: Option<CommitRequest> = None;
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let retries = loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(WorkerMsg::Commit(p)) => {
                    coalesce(&mut pending, p);
                    flush(transport.as_ref(), &mut pending).await;
                }
                Some(WorkerMsg::Final(p)) => {
                    coalesce(&mut pending, p);
                    flush(transport.as_ref(), &mut pending).await;
                    break final_retries;
                }
                Some(WorkerMsg::Unload(p)) => {
                    coalesce(&mut pending, p);
                    flush(transport.as_ref(), &mut pending).await;
                    break 0;
                }
                None => {
                    flush(transport.as_ref(), &mut pending).await;
                    break 0;
                }
            },
            _ = interval.tick() => {
                tick();
                flush(transport.as_ref(), &mut pending).await;
            }
        }
    };

    for _ in 0..retries {
        if pending.is_none() {
            break;
        }
        interval.tick().await;
        flush(transport.as_ref(), &mut pending).await;
    }

    if let Some(p) = pending {
        tracing::error!(
            session_id = %p.session_id,
            sequence = p.sequence_number,
            elements = p.raw.len(),
            "session ended with unsynced progress"
        );
    }
}

/// Folds a newer payload into the undelivered one: later values win per
/// element and the newest sequence number is kept.
fn coalesce(pending: &mut Option<CommitRequest>, next: CommitRequest) {
    match pending {
        Some(p) => {
            p.raw.extend(next.raw);
            p.sequence_number = p.sequence_number.max(next.sequence_number);
            p.terminated |= next.terminated;
        }
        None => *pending = Some(next),
    }
}

async fn flush(transport: &dyn CommitTransport, pending: &mut Option<CommitRequest>) {
    let Some(p) = pending.as_ref() else {
        return;
    };
    match transport.send(p).await {
        Ok(()) => *pending = None,
        Err(e) if e.is_permanent() => {
            tracing::error!(
                error = %e,
                session_id = %p.session_id,
                sequence = p.sequence_number,
                elements = p.raw.len(),
                "commit refused by server, dropping it"
            );
            *pending = None;
        }
        Err(e) => {
            tracing::debug!(
                error = %e,
                session_id = %p.session_id,
                sequence = p.sequence_number,
                "commit delivery failed, will retry"
            );
        }
    }
}
