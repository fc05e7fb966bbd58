//! Deepgram realtime upstream.
//!
//! Streams linear16 audio to `wss://api.deepgram.com/v1/listen` and
//! normalizes its result messages into the common transcript shape. Speaker
//! labels arrive at word level in live streaming; the utterance speaker is
//! the most frequent word speaker.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::protocol::{
    AudioFormat, DeepgramConfig, ProviderId, ServerEvent, Transcript,
};

use super::upstream::Upstream;

const LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

pub struct DeepgramUpstream {
    write: WsSink,
    reader_task: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
}

impl DeepgramUpstream {
    pub async fn connect(
        config: &DeepgramConfig,
        audio: &AudioFormat,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self, ProviderError> {
        let url = listen_url(config, audio);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", config.api_key))
                .map_err(|e| ProviderError::Auth(e.to_string()))?,
        );

        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| ProviderError::Disconnected("connection timeout".into()))?
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(response)
                    if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
                {
                    ProviderError::Auth(format!("handshake rejected: {}", response.status()))
                }
                other => ProviderError::Disconnected(other.to_string()),
            })?;

        info!("connected to deepgram");

        let (write, mut read) = stream.split();
        let finished = Arc::new(AtomicBool::new(false));
        let reader_finished = Arc::clone(&finished);

        let reader_task = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = normalize_response(&text) {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        if !reader_finished.load(Ordering::SeqCst) {
                            let _ = events
                                .send(ServerEvent::provider_error(
                                    ProviderId::Deepgram,
                                    "connection closed unexpectedly",
                                ))
                                .await;
                        }
                        break;
                    }
                    Ok(_) => {} // ping/pong/binary ignored
                    Err(e) => {
                        if !reader_finished.load(Ordering::SeqCst) {
                            warn!("deepgram read error: {}", e);
                            let _ = events
                                .send(ServerEvent::provider_error(
                                    ProviderId::Deepgram,
                                    format!("connection lost: {e}"),
                                ))
                                .await;
                        }
                        break;
                    }
                }
            }
            debug!("deepgram reader finished");
        });

        Ok(Self {
            write,
            reader_task: Some(reader_task),
            finished,
        })
    }
}

#[async_trait::async_trait]
impl Upstream for DeepgramUpstream {
    async fn send_audio(&mut self, frame: Bytes) -> Result<(), ProviderError> {
        self.write
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| ProviderError::Disconnected(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), ProviderError> {
        self.finished.store(true, Ordering::SeqCst);
        self.write
            .send(Message::Text(r#"{"type":"CloseStream"}"#.to_string()))
            .await
            .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
        // Let the reader drain the final results until the server closes.
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.finished.store(true, Ordering::SeqCst);
        let _ = self.write.close().await;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

fn listen_url(config: &DeepgramConfig, audio: &AudioFormat) -> String {
    let mut params = vec![
        ("encoding", "linear16".to_string()),
        ("sample_rate", audio.sample_rate.to_string()),
        ("channels", audio.channels.to_string()),
        ("model", config.model.clone()),
        ("language", config.language.clone()),
        ("punctuate", config.punctuate.to_string()),
        ("interim_results", config.interim_results.to_string()),
        ("endpointing", config.endpointing.to_string()),
        ("vad_events", config.vad_events.to_string()),
        ("smart_format", config.smart_format.to_string()),
        ("filler_words", config.filler_words.to_string()),
        ("numerals", config.numerals.to_string()),
        ("diarize", config.diarize.to_string()),
    ];
    if config.diarize {
        // Word-level timestamps carry the speaker labels.
        params.push(("utterances", "true".to_string()));
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{LISTEN_URL}?{query}")
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    channel: Option<Channel>,
    #[serde(default)]
    is_final: bool,
    start: Option<f64>,
    duration: Option<f64>,
    #[serde(rename = "type")]
    message_type: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    confidence: Option<f32>,
    speaker: Option<u32>,
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
struct Word {
    speaker: Option<u32>,
}

/// Turn one Deepgram message into a tagged client event. Empty transcripts
/// and informational messages (SpeechStarted, UtteranceEnd) yield nothing.
fn normalize_response(text: &str) -> Option<ServerEvent> {
    let response: ListenResponse = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!("unparseable deepgram message: {}", e);
            return None;
        }
    };

    if let Some(channel) = response.channel {
        let alternative = channel.alternatives.into_iter().next()?;
        if alternative.transcript.is_empty() {
            return None;
        }

        let start_ms = response.start.map(|s| s * 1000.0);
        let end_ms = match (response.start, response.duration) {
            (Some(start), Some(duration)) => Some((start + duration) * 1000.0),
            _ => None,
        };
        let speaker = alternative
            .speaker
            .or_else(|| majority_speaker(&alternative.words));

        return Some(ServerEvent::transcript(
            ProviderId::Deepgram,
            Transcript {
                text: alternative.transcript,
                speaker,
                start_ms,
                end_ms,
                confidence: alternative.confidence,
                is_final: response.is_final,
            },
        ));
    }

    match response.message_type.as_deref() {
        Some("Error") => Some(ServerEvent::provider_error(
            ProviderId::Deepgram,
            response
                .description
                .unwrap_or_else(|| "unknown error".to_string()),
        )),
        _ => None,
    }
}

/// Most frequent word-level speaker, live streaming's stand-in for an
/// utterance-level label.
fn majority_speaker(words: &[Word]) -> Option<u32> {
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for word in words {
        if let Some(speaker) = word.speaker {
            *counts.entry(speaker).or_default() += 1;
        }
    }
    counts.into_iter().max_by_key(|(_, n)| *n).map(|(s, _)| s)
}
