//! Wire format shared by the client session and the fan-out proxy.
//!
//! One duplex channel per session. The client sends a single JSON config
//! message, then raw binary PCM frames, then the `END` sentinel. The server
//! answers with provider-tagged JSON events: transcripts or errors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Last outbound text message before a graceful close.
pub const END_SENTINEL: &str = "END";

/// Error text the proxy sends for a provider configured without an API key.
/// The client renders this as a "not provided" status, never as a failure.
pub const ERR_KEY_NOT_PROVIDED: &str = "API key not provided";

/// Identity of an upstream speech-to-text engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Deepgram,
    Speechmatics,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::Deepgram, ProviderId::Speechmatics];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Deepgram => "deepgram",
            ProviderId::Speechmatics => "speechmatics",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control messages sent from client to server as JSON text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// First message of every session. Immutable once sent.
    Config { config: SessionConfig },
    /// Explicit stop request; equivalent to the `END` sentinel.
    Stop,
}

/// Per-session configuration: provider credentials/options plus the audio
/// format every subsequent binary frame uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub providers: ProviderConfigs,
    pub audio: AudioFormat,
}

impl SessionConfig {
    /// Providers that carry a non-empty API key, in fixed order.
    pub fn credentialed(&self) -> Vec<ProviderId> {
        let mut out = Vec::new();
        if self
            .providers
            .deepgram
            .as_ref()
            .is_some_and(|c| !c.api_key.is_empty())
        {
            out.push(ProviderId::Deepgram);
        }
        if self
            .providers
            .speechmatics
            .as_ref()
            .is_some_and(|c| !c.api_key.is_empty())
        {
            out.push(ProviderId::Speechmatics);
        }
        out
    }
}

/// One optional slot per known provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfigs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deepgram: Option<DeepgramConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speechmatics: Option<SpeechmaticsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeepgramConfig {
    // The config crate lowercases keys from files and the environment.
    #[serde(default, alias = "apikey")]
    pub api_key: String,
    #[serde(default = "DeepgramConfig::default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub punctuate: bool,
    #[serde(default = "default_true")]
    pub interim_results: bool,
    #[serde(default = "default_true")]
    pub smart_format: bool,
    #[serde(default = "default_true")]
    pub vad_events: bool,
    #[serde(default)]
    pub filler_words: bool,
    #[serde(default = "default_true")]
    pub numerals: bool,
    #[serde(default)]
    pub diarize: bool,
    #[serde(default = "DeepgramConfig::default_endpointing")]
    pub endpointing: u32,
}

impl DeepgramConfig {
    fn default_model() -> String {
        "nova-2".to_string()
    }

    fn default_endpointing() -> u32 {
        300
    }
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: Self::default_model(),
            language: default_language(),
            punctuate: true,
            interim_results: true,
            smart_format: true,
            vad_events: true,
            filler_words: false,
            numerals: true,
            diarize: false,
            endpointing: Self::default_endpointing(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechmaticsConfig {
    #[serde(default, alias = "apikey")]
    pub api_key: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "SpeechmaticsConfig::default_operating_point")]
    pub operating_point: String,
    #[serde(default = "SpeechmaticsConfig::default_max_delay")]
    pub max_delay: f64,
    #[serde(default)]
    pub enable_diarization: bool,
    /// Realtime endpoint override; the EU endpoint is the default.
    #[serde(default = "SpeechmaticsConfig::default_endpoint")]
    pub endpoint: String,
}

impl SpeechmaticsConfig {
    fn default_operating_point() -> String {
        "enhanced".to_string()
    }

    fn default_max_delay() -> f64 {
        1.2
    }

    fn default_endpoint() -> String {
        "wss://eu2.rt.speechmatics.com/v2".to_string()
    }
}

impl Default for SpeechmaticsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            language: default_language(),
            operating_point: Self::default_operating_point(),
            max_delay: Self::default_max_delay(),
            enable_diarization: false,
            endpoint: Self::default_endpoint(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

/// Format of the binary audio frames for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Always `pcm_s16le` in this system.
    pub encoding: String,
    pub chunk_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            encoding: "pcm_s16le".to_string(),
            chunk_duration_ms: 100,
        }
    }
}

/// A normalized transcript segment from one provider.
///
/// Field names are fixed by the wire format (snake_case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub is_final: bool,
}

/// Event message sent from server to client as a JSON text frame.
///
/// Carries either a transcript or an error. A missing provider tag marks a
/// session-scoped error (e.g. no credentialed provider at all).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
}

impl ServerEvent {
    pub fn transcript(provider: ProviderId, transcript: Transcript) -> Self {
        Self {
            provider: Some(provider),
            error: None,
            transcript: Some(transcript),
        }
    }

    pub fn provider_error(provider: ProviderId, message: impl Into<String>) -> Self {
        Self {
            provider: Some(provider),
            error: Some(message.into()),
            transcript: None,
        }
    }

    pub fn session_error(message: impl Into<String>) -> Self {
        Self {
            provider: None,
            error: Some(message.into()),
            transcript: None,
        }
    }
}
