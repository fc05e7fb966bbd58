pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod transport;

pub use audio::{CaptureBackend, CaptureBackendFactory, CaptureBlock, CaptureSource};
pub use config::Config;
pub use error::{ProviderError, SessionError};
pub use http::{create_router, AppState};
pub use protocol::{
    AudioFormat, ClientMessage, ProviderConfigs, ProviderId, ServerEvent, SessionConfig,
    Transcript, END_SENTINEL,
};
pub use proxy::{FanoutSession, ProviderConnector, Upstream, UpstreamConnector};
pub use session::{SessionController, SessionState, TranscriptAggregator, WsConnector};
pub use transport::{Transport, TransportEvent, WsTransport};
