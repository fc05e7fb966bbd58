//! Server-side provider fan-out
//!
//! One `FanoutSession` per client connection: it duplicates the inbound
//! audio stream to one upstream worker per credentialed provider and
//! multiplexes their event streams back onto the client channel. A failing
//! provider is reported and dropped; the session survives as long as at
//! least one upstream lives.

mod deepgram;
mod fanout;
mod speechmatics;
mod upstream;

pub use deepgram::DeepgramUpstream;
pub use fanout::FanoutSession;
pub use speechmatics::SpeechmaticsUpstream;
pub use upstream::{ProviderConnector, Upstream, UpstreamConnector};
