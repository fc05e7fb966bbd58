//! Per-session audio fan-out and event multiplexing.
//!
//! One `FanoutSession` serves one client connection. Every inbound audio
//! frame is duplicated to every live upstream through that upstream's own
//! bounded queue; a slow or stuck upstream fills its queue and loses frames,
//! it never delays delivery to the others. Each upstream worker relays its
//! provider's events back onto the single client-bound channel in that
//! provider's emission order.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::upstream::{Upstream, UpstreamConnector};
use crate::error::SessionError;
use crate::protocol::{ProviderId, ServerEvent, SessionConfig, ERR_KEY_NOT_PROVIDED};

/// Frames a stuck upstream can queue before fan-out starts dropping for it
/// (~6.4s of audio at 100ms chunks).
const UPSTREAM_QUEUE_CAPACITY: usize = 64;

/// How long graceful shutdown waits for upstreams to flush final results.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

enum Command {
    Frame(Bytes),
    Finish,
}

struct Worker {
    provider: ProviderId,
    queue: mpsc::Sender<Command>,
    task: JoinHandle<()>,
    dropped_frames: u64,
}

/// Server-side fan-out for one client session.
pub struct FanoutSession {
    workers: Vec<Worker>,
}

impl FanoutSession {
    /// Connect one upstream per credentialed provider.
    ///
    /// A provider configured without a key gets a `"API key not provided"`
    /// event and no connection. A provider whose connection attempt fails
    /// gets a provider-scoped error event. Zero credentialed providers is a
    /// terminal configuration error: nothing is connected and the session
    /// must close before any frame is processed.
    pub async fn start(
        connector: &dyn UpstreamConnector,
        config: &SessionConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self, SessionError> {
        let credentialed = config.credentialed();
        if credentialed.is_empty() {
            return Err(SessionError::ConfigValidation(
                "no provider has an API key configured".into(),
            ));
        }

        // Configured-but-uncredentialed providers get their status event up
        // front; the client renders these as "not provided".
        for provider in ProviderId::ALL {
            let configured = match provider {
                ProviderId::Deepgram => config.providers.deepgram.is_some(),
                ProviderId::Speechmatics => config.providers.speechmatics.is_some(),
            };
            if configured && !credentialed.contains(&provider) {
                let _ = events
                    .send(ServerEvent::provider_error(provider, ERR_KEY_NOT_PROVIDED))
                    .await;
            }
        }

        let mut workers = Vec::new();
        for provider in credentialed {
            match connector.connect(provider, config, events.clone()).await {
                Ok(upstream) => {
                    info!("upstream connected: {}", provider);
                    workers.push(spawn_worker(provider, upstream, events.clone()));
                }
                Err(e) => {
                    warn!("upstream connection failed: {}: {}", provider, e);
                    let _ = events
                        .send(ServerEvent::provider_error(provider, e.to_string()))
                        .await;
                }
            }
        }

        Ok(Self { workers })
    }

    /// Duplicate one frame to every live upstream.
    ///
    /// Non-blocking per upstream: a full queue drops the frame for that
    /// upstream only, logged and counted. A closed queue means the worker
    /// died; it is pruned here, its error event was already relayed.
    pub fn forward_frame(&mut self, frame: Bytes) {
        self.workers.retain_mut(|worker| {
            match worker.queue.try_send(Command::Frame(frame.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    worker.dropped_frames += 1;
                    warn!(
                        "{} queue full, dropped frame ({} total)",
                        worker.provider, worker.dropped_frames
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("{} worker gone, pruning", worker.provider);
                    false
                }
            }
        });
    }

    /// Number of upstreams still accepting frames. The session ends when
    /// this reaches zero.
    pub fn live_count(&mut self) -> usize {
        self.workers.retain(|w| !w.queue.is_closed());
        self.workers.len()
    }

    /// Graceful end: enqueue the finish marker behind every already-queued
    /// frame, wait up to the shutdown timeout for workers to flush, then
    /// force-close whatever is left.
    pub async fn shutdown(self) {
        for worker in &self.workers {
            // Queued after all pending frames, so every accepted frame is
            // fully forwarded before the upstream sees end-of-stream. A full
            // queue means the worker is stuck; it skips the graceful finish
            // and runs into the timeout below.
            if worker.queue.try_send(Command::Finish).is_err() {
                debug!("{} queue full at shutdown, skipping finish", worker.provider);
            }
        }

        let tasks: Vec<_> = self.workers.into_iter().map(|w| (w.provider, w.task)).collect();
        let abort_handles: Vec<_> = tasks.iter().map(|(_, task)| task.abort_handle()).collect();
        let joined = futures::future::join_all(
            tasks
                .into_iter()
                .map(|(provider, task)| async move { (provider, task.await) }),
        );
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, joined).await {
            Ok(results) => {
                for (provider, result) in results {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            warn!("{} worker ended abnormally: {}", provider, e);
                        }
                    }
                }
                debug!("all upstreams shut down gracefully");
            }
            Err(_) => {
                warn!(
                    "upstream shutdown timed out after {:?}, forcing close",
                    SHUTDOWN_TIMEOUT
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }
}

fn spawn_worker(
    provider: ProviderId,
    mut upstream: Box<dyn Upstream>,
    events: mpsc::Sender<ServerEvent>,
) -> Worker {
    let (queue_tx, mut queue_rx) = mpsc::channel(UPSTREAM_QUEUE_CAPACITY);

    let task = tokio::spawn(async move {
        while let Some(command) = queue_rx.recv().await {
            match command {
                Command::Frame(frame) => {
                    if let Err(e) = upstream.send_audio(frame).await {
                        warn!("{} audio forward failed: {}", provider, e);
                        let _ = events
                            .send(ServerEvent::provider_error(provider, e.to_string()))
                            .await;
                        break;
                    }
                }
                Command::Finish => {
                    if let Err(e) = upstream.finish().await {
                        debug!("{} graceful finish failed: {}", provider, e);
                    }
                    break;
                }
            }
        }
        upstream.close().await;
        debug!("{} worker exited", provider);
    });

    Worker {
        provider,
        queue: queue_tx,
        task,
        dropped_frames: 0,
    }
}
