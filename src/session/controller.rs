//! Session lifecycle control.
//!
//! One controller owns one session: its capture backend, its transport
//! channel, and the tasks pumping data between them. The lifecycle is a
//! strict state machine; every way a session can end funnels through the
//! same idempotent teardown.
//!
//! ```text
//! Idle -> Starting -> Connecting -> Active -> Stopping -> Idle
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::aggregator::TranscriptAggregator;
use crate::audio::{encode_block, resample, CaptureBackend, CaptureBackendFactory, CaptureSource};
use crate::error::SessionError;
use crate::protocol::SessionConfig;
use crate::transport::{Transport, TransportEvent};

/// How long teardown waits for the inbound event loop to drain.
const EVENT_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Lifecycle states. `Stopping` always returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Connecting,
    Active,
    Stopping,
}

/// Opens the duplex transport channel. A seam so tests can run the
/// controller against an in-memory transport.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, SessionError>;
}

/// Connector for the production WebSocket transport.
pub struct WsConnector {
    pub url: String,
}

#[async_trait::async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SessionError> {
        let transport = crate::transport::WsTransport::connect(&self.url).await?;
        Ok(Box::new(transport))
    }
}

/// Resources held by a running session. Every handle is `take`n during
/// teardown so releasing twice, or from two triggers at once, is safe.
struct SessionShared {
    state: Mutex<SessionState>,
    stopping: AtomicBool,
    /// Sticky mark for a stop issued while `start` is still in flight. The
    /// in-flight start observes it after every suspension point and aborts
    /// into teardown instead of going Active.
    cancelled: AtomicBool,
    backend: Mutex<Option<Box<dyn CaptureBackend>>>,
    transport: Mutex<Option<Arc<Mutex<Box<dyn Transport>>>>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    aggregator: Mutex<TranscriptAggregator>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            stopping: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            backend: Mutex::new(None),
            transport: Mutex::new(None),
            pump_task: Mutex::new(None),
            event_task: Mutex::new(None),
            aggregator: Mutex::new(TranscriptAggregator::default()),
            started_at: Mutex::new(None),
        }
    }

    /// Release every held resource exactly once, in a fixed order:
    /// capture first (closes the block channel), then the frame pump drains
    /// the frames already queued, then the end sentinel goes out after them.
    async fn teardown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("teardown already in progress");
            return;
        }

        *self.state.lock().await = SessionState::Stopping;
        info!("session stopping");

        if let Some(mut backend) = self.backend.lock().await.take() {
            if let Err(e) = backend.stop().await {
                error!("failed to stop capture backend: {}", e);
            }
        }

        if let Some(task) = self.pump_task.lock().await.take() {
            if let Err(e) = task.await {
                error!("frame pump task panicked: {}", e);
            }
        }

        if let Some(transport) = self.transport.lock().await.take() {
            let mut transport = transport.lock().await;
            transport.send_end().await;
            transport.close().await;
        }

        if let Some(task) = self.event_task.lock().await.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(EVENT_DRAIN_TIMEOUT, task).await {
                Ok(Err(e)) => error!("event task panicked: {}", e),
                Err(_) => {
                    warn!("event loop did not finish in time, aborting");
                    abort.abort();
                }
                Ok(Ok(())) => {}
            }
        }

        *self.state.lock().await = SessionState::Idle;
        self.stopping.store(false, Ordering::SeqCst);
        info!("session stopped");
    }
}

/// Creates a fresh capture backend for each session start.
pub type CaptureFactory = Box<dyn Fn() -> Box<dyn CaptureBackend> + Send + Sync>;

/// Drives one comparison session end to end.
pub struct SessionController {
    mode: &'static str,
    config: SessionConfig,
    capture_factory: CaptureFactory,
    connector: Box<dyn TransportConnector>,
    target_rate: u32,
    shared: Arc<SessionShared>,
}

impl SessionController {
    pub fn new(
        source: CaptureSource,
        config: SessionConfig,
        connector: Box<dyn TransportConnector>,
    ) -> Self {
        let mode = source.mode();
        Self::with_capture_factory(
            mode,
            config,
            Box::new(move || CaptureBackendFactory::create(source.clone())),
            connector,
        )
    }

    /// Build with an explicit capture factory; the seam tests use to run the
    /// lifecycle without a real device.
    pub fn with_capture_factory(
        mode: &'static str,
        config: SessionConfig,
        capture_factory: CaptureFactory,
        connector: Box<dyn TransportConnector>,
    ) -> Self {
        let target_rate = config.audio.sample_rate;
        Self {
            mode,
            config,
            capture_factory,
            connector,
            target_rate,
            shared: Arc::new(SessionShared::new()),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.lock().await
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.started_at.lock().await
    }

    /// Run `f` against the live aggregator state.
    pub async fn with_outputs<R>(&self, f: impl FnOnce(&TranscriptAggregator) -> R) -> R {
        let aggregator = self.shared.aggregator.lock().await;
        f(&aggregator)
    }

    /// Start the session.
    ///
    /// A second start while the session is not idle is a warned no-op; there
    /// is never a second concurrent session on one controller. Device and
    /// credential failures abort before any network resource is created.
    pub async fn start(&self) -> Result<(), SessionError> {
        {
            let mut state = self.shared.state.lock().await;
            if *state != SessionState::Idle {
                warn!("start requested while session is {:?}, ignoring", *state);
                return Ok(());
            }

            let credentialed = self.config.credentialed();
            if credentialed.is_empty() {
                return Err(SessionError::ConfigValidation(
                    "no provider credentials configured".into(),
                ));
            }

            *state = SessionState::Starting;
            self.shared.cancelled.store(false, Ordering::SeqCst);
            *self.shared.aggregator.lock().await = TranscriptAggregator::new(&credentialed);
        }
        info!("starting {} session", self.mode);

        // Local audio first; a device failure must abort before any network
        // resource exists.
        let mut backend = (self.capture_factory)();
        let block_rx = match backend.start().await {
            Ok(rx) => rx,
            Err(e) => {
                *self.shared.state.lock().await = SessionState::Idle;
                return Err(e);
            }
        };
        *self.shared.backend.lock().await = Some(backend);
        if self.shared.cancelled.load(Ordering::SeqCst) {
            info!("stop requested during startup, aborting");
            self.shared.teardown().await;
            return Ok(());
        }
        *self.shared.state.lock().await = SessionState::Connecting;

        let mut transport = match self.connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                self.shared.teardown().await;
                return Err(e);
            }
        };
        if self.shared.cancelled.load(Ordering::SeqCst) {
            info!("stop requested during startup, aborting");
            transport.close().await;
            self.shared.teardown().await;
            return Ok(());
        }
        if let Err(e) = transport.send_config(&self.config).await {
            self.shared.teardown().await;
            return Err(e);
        }
        let event_rx = transport.take_events();

        let transport = Arc::new(Mutex::new(transport));
        *self.shared.transport.lock().await = Some(Arc::clone(&transport));
        *self.shared.started_at.lock().await = Some(Utc::now());

        // The state lock serializes this final check against `stop`: either
        // stop saw Starting/Connecting and the mark is visible here, or it
        // sees Active and runs the full teardown itself.
        {
            let mut state = self.shared.state.lock().await;
            if self.shared.cancelled.load(Ordering::SeqCst) {
                drop(state);
                info!("stop requested during startup, aborting");
                self.shared.teardown().await;
                return Ok(());
            }
            *state = SessionState::Active;
        }
        info!("session active");

        // Frame pump: capture blocks -> resample -> encode -> transport.
        // Ends when the capture channel closes; drains what is queued so no
        // produced frame is lost ahead of the end sentinel.
        let pump_transport = Arc::clone(&transport);
        let pump_shared = Arc::clone(&self.shared);
        let target_rate = self.target_rate;
        let pump = tokio::spawn(async move {
            let mut block_rx = block_rx;
            while let Some(block) = block_rx.recv().await {
                if block.samples.is_empty() {
                    continue;
                }
                let resampled = resample(&block.samples, block.sample_rate, target_rate);
                if resampled.is_empty() {
                    continue;
                }
                let frame = encode_block(&resampled);
                let mut transport = pump_transport.lock().await;
                if transport.send_frame(frame).await.is_err() {
                    break;
                }
            }
            // A capture stream that dies on its own (radio stream over,
            // decode failure) ends the session like an explicit stop would.
            if !pump_shared.stopping.load(Ordering::SeqCst) {
                warn!("capture stream ended, stopping session");
                tokio::spawn(async move { pump_shared.teardown().await });
            }
            debug!("frame pump finished");
        });
        *self.shared.pump_task.lock().await = Some(pump);

        // Event loop: inbound provider events into the aggregator. An
        // unexpected close forces the same teardown as an explicit stop.
        if let Some(mut event_rx) = event_rx {
            let shared = Arc::clone(&self.shared);
            let events = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        TransportEvent::Server(server_event) => {
                            shared.aggregator.lock().await.apply(&server_event);
                        }
                        TransportEvent::Closed { clean } => {
                            if !clean && !shared.stopping.load(Ordering::SeqCst) {
                                warn!("transport closed unexpectedly, stopping session");
                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move { shared.teardown().await });
                            }
                            break;
                        }
                    }
                }
                debug!("event loop finished");
            });
            *self.shared.event_task.lock().await = Some(events);
        }

        Ok(())
    }

    /// Stop the session. Safe to call at any time, more than once, or
    /// concurrently with a failure-triggered teardown.
    ///
    /// During Starting/Connecting the stop leaves a sticky cancel mark; the
    /// in-flight `start` observes it at its next suspension point, releases
    /// whatever it acquired, and returns to Idle without going Active.
    pub async fn stop(&self) {
        let state = self.shared.state.lock().await;
        match *state {
            SessionState::Idle => {
                warn!("stop requested but no session is active");
            }
            SessionState::Starting | SessionState::Connecting => {
                self.shared.cancelled.store(true, Ordering::SeqCst);
                info!("stop requested during startup, cancelling the pending start");
            }
            SessionState::Active | SessionState::Stopping => {
                drop(state);
                self.shared.teardown().await;
            }
        }
    }
}
