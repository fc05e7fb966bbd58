use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stt_compare::audio::{CaptureBackend, CaptureBlock};
use stt_compare::error::SessionError;
use stt_compare::protocol::{
    AudioFormat, DeepgramConfig, ProviderConfigs, ProviderId, ServerEvent, SessionConfig,
    Transcript,
};
use stt_compare::session::{SessionController, SessionState, TransportConnector};
use stt_compare::transport::{Transport, TransportEvent};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Config,
    Frame(Vec<u8>),
    End,
    Close,
}

struct MockCapture {
    blocks: Vec<CaptureBlock>,
    fail: bool,
    /// When false the block channel closes once the queued blocks are
    /// drained, like a radio stream that ends on its own.
    hold_open: bool,
    tx_slot: Arc<Mutex<Option<mpsc::Sender<CaptureBlock>>>>,
    capturing: Arc<AtomicBool>,
}

#[async_trait]
impl CaptureBackend for MockCapture {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, SessionError> {
        if self.fail {
            return Err(SessionError::Device("permission denied".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        for block in self.blocks.drain(..) {
            tx.try_send(block).unwrap();
        }
        if self.hold_open {
            // Keep the channel open until stop(), like a live device would.
            *self.tx_slot.lock().unwrap() = Some(tx);
        }
        self.capturing.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.tx_slot.lock().unwrap().take();
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock-capture"
    }
}

struct MockTransport {
    sent: Arc<Mutex<Vec<Sent>>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    event_tx_slot: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_config(&mut self, _config: &SessionConfig) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(Sent::Config);
        Ok(())
    }

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(Sent::Frame(frame));
        Ok(())
    }

    async fn send_end(&mut self) {
        self.sent.lock().unwrap().push(Sent::End);
    }

    async fn close(&mut self) {
        self.sent.lock().unwrap().push(Sent::Close);
        // The real transport aborts its reader on close, dropping the event
        // sender; the mock does the same so event loops see the end.
        self.event_tx_slot.lock().unwrap().take();
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

#[derive(Clone)]
struct MockConnector {
    sent: Arc<Mutex<Vec<Sent>>>,
    event_tx_slot: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    connect_count: Arc<AtomicUsize>,
    connect_delay: Duration,
}

impl MockConnector {
    fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(connect_delay: Duration) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            event_tx_slot: Arc::new(Mutex::new(None)),
            connect_count: Arc::new(AtomicUsize::new(0)),
            connect_delay,
        }
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, SessionError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let (event_tx, event_rx) = mpsc::channel(64);
        *self.event_tx_slot.lock().unwrap() = Some(event_tx);
        Ok(Box::new(MockTransport {
            sent: Arc::clone(&self.sent),
            events: Some(event_rx),
            event_tx_slot: Arc::clone(&self.event_tx_slot),
        }))
    }
}

fn one_key_config() -> SessionConfig {
    SessionConfig {
        providers: ProviderConfigs {
            deepgram: Some(DeepgramConfig {
                api_key: "key".into(),
                ..Default::default()
            }),
            speechmatics: None,
        },
        audio: AudioFormat::default(),
    }
}

fn controller_with(
    blocks: Vec<CaptureBlock>,
    fail_device: bool,
    config: SessionConfig,
) -> (SessionController, MockConnector) {
    build_controller(blocks, fail_device, true, config, MockConnector::new())
}

fn build_controller(
    blocks: Vec<CaptureBlock>,
    fail_device: bool,
    hold_open: bool,
    config: SessionConfig,
    connector: MockConnector,
) -> (SessionController, MockConnector) {
    let blocks = Arc::new(Mutex::new(Some(blocks)));

    let controller = SessionController::with_capture_factory(
        "mic",
        config,
        Box::new(move || {
            Box::new(MockCapture {
                blocks: blocks.lock().unwrap().take().unwrap_or_default(),
                fail: fail_device,
                hold_open,
                tx_slot: Arc::new(Mutex::new(None)),
                capturing: Arc::new(AtomicBool::new(false)),
            })
        }),
        Box::new(connector.clone()),
    );
    (controller, connector)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn wait_for_state(controller: &SessionController, state: SessionState) {
    for _ in 0..200 {
        if controller.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("controller never reached {:?}", state);
}

fn block(samples: Vec<f32>, rate: u32) -> CaptureBlock {
    CaptureBlock {
        samples,
        sample_rate: rate,
    }
}

#[tokio::test]
async fn full_lifecycle_sends_config_frames_then_end() {
    let (controller, connector) = controller_with(
        vec![block(vec![0.0, 1.0], 16_000), block(vec![-1.0], 16_000)],
        false,
        one_key_config(),
    );

    controller.start().await.unwrap();
    assert_eq!(controller.state().await, SessionState::Active);
    assert!(controller.started_at().await.is_some());

    let sent = Arc::clone(&connector.sent);
    wait_until(move || {
        sent.lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Sent::Frame(_)))
            .count()
            == 2
    })
    .await;

    controller.stop().await;
    assert_eq!(controller.state().await, SessionState::Idle);

    let sent = connector.sent.lock().unwrap();
    assert_eq!(sent[0], Sent::Config);
    // Blocks at the target rate pass through the encoder unchanged.
    assert_eq!(sent[1], Sent::Frame(vec![0x00, 0x00, 0xFF, 0x7F]));
    assert_eq!(sent[2], Sent::Frame(vec![0x00, 0x80]));
    let end_at = sent.iter().position(|s| *s == Sent::End).unwrap();
    assert!(sent.iter().take(end_at).all(|s| !matches!(s, Sent::Close)));
    assert!(sent.contains(&Sent::Close));
}

#[tokio::test]
async fn empty_blocks_are_never_sent() {
    let (controller, connector) = controller_with(
        vec![block(vec![], 16_000), block(vec![0.5], 16_000)],
        false,
        one_key_config(),
    );

    controller.start().await.unwrap();
    let sent = Arc::clone(&connector.sent);
    wait_until(move || {
        sent.lock()
            .unwrap()
            .iter()
            .any(|s| matches!(s, Sent::Frame(_)))
    })
    .await;
    controller.stop().await;

    let frames = connector
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|s| matches!(s, Sent::Frame(_)))
        .count();
    assert_eq!(frames, 1);
}

#[tokio::test]
async fn second_start_is_a_noop() {
    let (controller, connector) = controller_with(vec![], false, one_key_config());

    controller.start().await.unwrap();
    controller.start().await.unwrap();

    assert_eq!(controller.state().await, SessionState::Active);
    assert_eq!(connector.connect_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        connector
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == Sent::Config)
            .count(),
        1
    );

    controller.stop().await;
}

#[tokio::test]
async fn no_credentials_aborts_before_any_resource() {
    let config = SessionConfig {
        providers: ProviderConfigs::default(),
        audio: AudioFormat::default(),
    };
    let (controller, connector) = controller_with(vec![], false, config);

    let result = controller.start().await;
    assert!(matches!(result, Err(SessionError::ConfigValidation(_))));
    assert_eq!(controller.state().await, SessionState::Idle);
    assert_eq!(connector.connect_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn device_error_aborts_before_network() {
    let (controller, connector) = controller_with(vec![], true, one_key_config());

    let result = controller.start().await;
    assert!(matches!(result, Err(SessionError::Device(_))));
    assert_eq!(controller.state().await, SessionState::Idle);
    assert_eq!(connector.connect_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unexpected_transport_close_tears_the_session_down() {
    let (controller, connector) = controller_with(vec![], false, one_key_config());
    controller.start().await.unwrap();

    let event_tx = connector.event_tx_slot.lock().unwrap().take().unwrap();
    event_tx
        .send(TransportEvent::Closed { clean: false })
        .await
        .unwrap();
    drop(event_tx);

    wait_for_state(&controller, SessionState::Idle).await;

    // A stop after the forced teardown is a harmless no-op.
    controller.stop().await;
    assert_eq!(controller.state().await, SessionState::Idle);
}

#[tokio::test]
async fn stop_during_connect_cancels_the_start() {
    let (controller, connector) = build_controller(
        vec![],
        false,
        true,
        one_key_config(),
        MockConnector::with_delay(Duration::from_millis(300)),
    );
    let controller = Arc::new(controller);

    let starting = Arc::clone(&controller);
    let start_task = tokio::spawn(async move { starting.start().await });
    wait_for_state(controller.as_ref(), SessionState::Connecting).await;

    // The stop lands while the transport handshake is still in flight; the
    // pending start must observe it and never reach Active.
    controller.stop().await;
    start_task.await.unwrap().unwrap();

    assert_eq!(controller.state().await, SessionState::Idle);
    let sent = connector.sent.lock().unwrap();
    assert!(!sent.contains(&Sent::Config));
    assert!(sent.contains(&Sent::Close));
}

#[tokio::test]
async fn capture_stream_ending_tears_the_session_down() {
    let (controller, connector) = build_controller(
        vec![block(vec![0.5], 16_000)],
        false,
        false,
        one_key_config(),
        MockConnector::new(),
    );
    controller.start().await.unwrap();

    // The capture channel closes after its single block, like a radio
    // stream that ends; the session must not linger Active without audio.
    wait_for_state(&controller, SessionState::Idle).await;

    let sent = connector.sent.lock().unwrap();
    assert!(sent.iter().any(|s| matches!(s, Sent::Frame(_))));
    assert!(sent.contains(&Sent::End));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (controller, _connector) = controller_with(vec![], false, one_key_config());
    controller.start().await.unwrap();

    controller.stop().await;
    controller.stop().await;
    assert_eq!(controller.state().await, SessionState::Idle);
}

#[tokio::test]
async fn inbound_events_reach_the_aggregator() {
    let (controller, connector) = controller_with(vec![], false, one_key_config());
    controller.start().await.unwrap();

    let event_tx = connector.event_tx_slot.lock().unwrap().take().unwrap();
    event_tx
        .send(TransportEvent::Server(ServerEvent::transcript(
            ProviderId::Deepgram,
            Transcript {
                text: "first".into(),
                speaker: None,
                start_ms: None,
                end_ms: None,
                confidence: None,
                is_final: true,
            },
        )))
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..200 {
        seen = controller
            .with_outputs(|agg| {
                agg.output(ProviderId::Deepgram)
                    .map(|o| o.final_parts.len() == 1)
                    .unwrap_or(false)
            })
            .await;
        if seen {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "final transcript never reached the aggregator");

    drop(event_tx);
    controller.stop().await;
}
