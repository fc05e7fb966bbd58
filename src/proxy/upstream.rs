//! Upstream connection seam.
//!
//! Each credentialed provider gets one `Upstream` per session. The trait
//! hides the provider protocol behind three operations; normalization to the
//! common event shape happens inside each implementation, which pushes
//! tagged `ServerEvent`s onto the shared client-bound channel.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::protocol::{ProviderId, ServerEvent, SessionConfig};

/// One live connection to a speech-to-text engine.
#[async_trait::async_trait]
pub trait Upstream: Send {
    /// Forward one audio frame, unmodified.
    async fn send_audio(&mut self, frame: Bytes) -> Result<(), ProviderError>;

    /// Signal end of audio and wait for the provider to flush its final
    /// results. The caller bounds this with a timeout.
    async fn finish(&mut self) -> Result<(), ProviderError>;

    /// Force-close and release the connection. Idempotent.
    async fn close(&mut self);
}

/// Opens upstream connections. A seam so fan-out tests can run against mock
/// upstreams instead of live provider endpoints.
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        provider: ProviderId,
        config: &SessionConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Box<dyn Upstream>, ProviderError>;
}

/// Production connector for the real provider endpoints.
pub struct ProviderConnector;

#[async_trait::async_trait]
impl UpstreamConnector for ProviderConnector {
    async fn connect(
        &self,
        provider: ProviderId,
        config: &SessionConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Box<dyn Upstream>, ProviderError> {
        match provider {
            ProviderId::Deepgram => {
                let dg = config
                    .providers
                    .deepgram
                    .as_ref()
                    .ok_or_else(|| ProviderError::Protocol("deepgram not configured".into()))?;
                let upstream =
                    super::deepgram::DeepgramUpstream::connect(dg, &config.audio, events).await?;
                Ok(Box::new(upstream))
            }
            ProviderId::Speechmatics => {
                let sm = config
                    .providers
                    .speechmatics
                    .as_ref()
                    .ok_or_else(|| ProviderError::Protocol("speechmatics not configured".into()))?;
                let upstream =
                    super::speechmatics::SpeechmaticsUpstream::connect(sm, &config.audio, events)
                        .await?;
                Ok(Box::new(upstream))
            }
        }
    }
}
