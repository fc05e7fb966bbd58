use anyhow::Result;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// One block of captured audio at the producer's native rate.
///
/// Blocks are mono f32 in [-1, 1]; the frame pump resamples and encodes them
/// before they reach the transport.
#[derive(Debug, Clone)]
pub struct CaptureBlock {
    pub samples: Vec<f32>,
    /// Native sample rate of the producing device/stream in Hz.
    pub sample_rate: u32,
}

/// Where a session's audio comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSource {
    /// Default microphone, raw signal (no echo cancellation or gain control).
    Microphone,
    /// Internet radio stream at the given URL, decoded while playing.
    Radio(String),
}

impl CaptureSource {
    pub fn mode(&self) -> &'static str {
        match self {
            CaptureSource::Microphone => "mic",
            CaptureSource::Radio(_) => "radio",
        }
    }
}

/// Audio capture backend.
///
/// Implementations push blocks into a bounded channel. A full channel means
/// the consumer fell behind; backends drop the block and log it rather than
/// stall the producer.
#[async_trait::async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Start capturing. Returns the block channel.
    ///
    /// Fails with a device error before any network resource exists.
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, SessionError>;

    /// Stop capturing and release the device. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    fn is_capturing(&self) -> bool;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Capture backend factory.
pub struct CaptureBackendFactory;

impl CaptureBackendFactory {
    pub fn create(source: CaptureSource) -> Box<dyn CaptureBackend> {
        match source {
            CaptureSource::Microphone => Box::new(super::mic::MicBackend::new()),
            CaptureSource::Radio(url) => Box::new(super::radio::RadioBackend::new(url)),
        }
    }
}
