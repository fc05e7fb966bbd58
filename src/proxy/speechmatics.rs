//! Speechmatics realtime upstream.
//!
//! Speaks the realtime v2 protocol: `StartRecognition` with the session's
//! audio format, binary `AddAudio` frames, `EndOfStream` with the frame
//! count, then `EndOfTranscript` back. Partial and final transcripts are
//! normalized into the common shape; `S1`-style speaker labels map to
//! zero-based numbers.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
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
use crate::protocol::{AudioFormat, ProviderId, ServerEvent, SpeechmaticsConfig, Transcript};

use super::upstream::Upstream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECOGNITION_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

pub struct SpeechmaticsUpstream {
    write: WsSink,
    reader_task: Option<JoinHandle<()>>,
    finished: Arc<AtomicBool>,
    /// Count of AddAudio frames sent; EndOfStream must carry it.
    frames_sent: u64,
}

impl SpeechmaticsUpstream {
    pub async fn connect(
        config: &SpeechmaticsConfig,
        audio: &AudioFormat,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<Self, ProviderError> {
        let mut request = config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
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

        let (mut write, mut read) = stream.split();

        let start = start_recognition_message(config, audio);
        write
            .send(Message::Text(start.to_string()))
            .await
            .map_err(|e| ProviderError::Disconnected(e.to_string()))?;

        // The service must acknowledge before any audio flows.
        tokio::time::timeout(RECOGNITION_TIMEOUT, async {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let parsed: RealtimeMessage = serde_json::from_str(&text)
                            .map_err(|e| ProviderError::Protocol(e.to_string()))?;
                        match parsed.message.as_str() {
                            "RecognitionStarted" => return Ok(()),
                            "Error" => {
                                let reason = parsed
                                    .reason
                                    .unwrap_or_else(|| "recognition rejected".to_string());
                                return Err(if parsed.error_type.as_deref()
                                    == Some("not_authorised")
                                {
                                    ProviderError::Auth(reason)
                                } else {
                                    ProviderError::Protocol(reason)
                                });
                            }
                            other => debug!("ignoring {} before RecognitionStarted", other),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        return Err(ProviderError::Disconnected(
                            "closed before RecognitionStarted".into(),
                        ))
                    }
                    Ok(_) => {}
                    Err(e) => return Err(ProviderError::Disconnected(e.to_string())),
                }
            }
            Err(ProviderError::Disconnected("stream ended".into()))
        })
        .await
        .map_err(|_| ProviderError::Disconnected("RecognitionStarted timeout".into()))??;

        info!("connected to speechmatics");

        let finished = Arc::new(AtomicBool::new(false));
        let reader_finished = Arc::clone(&finished);

        let reader_task = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => match normalize_message(&text) {
                        Normalized::Event(event) => {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Normalized::EndOfTranscript => break,
                        Normalized::Ignored => {}
                    },
                    Ok(Message::Close(_)) => {
                        if !reader_finished.load(Ordering::SeqCst) {
                            let _ = events
                                .send(ServerEvent::provider_error(
                                    ProviderId::Speechmatics,
                                    "connection closed unexpectedly",
                                ))
                                .await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !reader_finished.load(Ordering::SeqCst) {
                            warn!("speechmatics read error: {}", e);
                            let _ = events
                                .send(ServerEvent::provider_error(
                                    ProviderId::Speechmatics,
                                    format!("connection lost: {e}"),
                                ))
                                .await;
                        }
                        break;
                    }
                }
            }
            debug!("speechmatics reader finished");
        });

        Ok(Self {
            write,
            reader_task: Some(reader_task),
            finished,
            frames_sent: 0,
        })
    }
}

#[async_trait::async_trait]
impl Upstream for SpeechmaticsUpstream {
    async fn send_audio(&mut self, frame: Bytes) -> Result<(), ProviderError> {
        self.write
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
        self.frames_sent += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ProviderError> {
        self.finished.store(true, Ordering::SeqCst);
        let end = json!({ "message": "EndOfStream", "last_seq_no": self.frames_sent });
        self.write
            .send(Message::Text(end.to_string()))
            .await
            .map_err(|e| ProviderError::Disconnected(e.to_string()))?;
        // Reader exits on EndOfTranscript once the finals are flushed.
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

fn start_recognition_message(config: &SpeechmaticsConfig, audio: &AudioFormat) -> serde_json::Value {
    let mut transcription = json!({
        "language": config.language,
        "operating_point": config.operating_point,
        "max_delay": config.max_delay,
        "enable_partials": true,
    });
    if config.enable_diarization {
        transcription["diarization"] = json!("speaker");
    }
    json!({
        "message": "StartRecognition",
        "audio_format": {
            "type": "raw",
            "encoding": audio.encoding,
            "sample_rate": audio.sample_rate,
        },
        "transcription_config": transcription,
    })
}

#[derive(Debug, Deserialize)]
struct RealtimeMessage {
    message: String,
    reason: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    metadata: Option<Metadata>,
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    transcript: String,
    start_time: Option<f64>,
    end_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<ResultAlternative>,
}

#[derive(Debug, Deserialize)]
struct ResultAlternative {
    confidence: Option<f32>,
    speaker: Option<String>,
}

enum Normalized {
    Event(ServerEvent),
    EndOfTranscript,
    Ignored,
}

fn normalize_message(text: &str) -> Normalized {
    let parsed: RealtimeMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("unparseable speechmatics message: {}", e);
            return Normalized::Ignored;
        }
    };

    match parsed.message.as_str() {
        "AddTranscript" | "AddPartialTranscript" => {
            let is_final = parsed.message == "AddTranscript";
            let Some(metadata) = parsed.metadata else {
                return Normalized::Ignored;
            };
            if metadata.transcript.is_empty() {
                return Normalized::Ignored;
            }

            let alternative = parsed
                .results
                .first()
                .and_then(|r| r.alternatives.first());
            let confidence = if is_final {
                alternative.and_then(|a| a.confidence)
            } else {
                None
            };
            let speaker = alternative
                .and_then(|a| a.speaker.as_deref())
                .and_then(parse_speaker_label);

            Normalized::Event(ServerEvent::transcript(
                ProviderId::Speechmatics,
                Transcript {
                    text: metadata.transcript,
                    speaker,
                    start_ms: metadata.start_time.map(|s| s * 1000.0),
                    end_ms: metadata.end_time.map(|s| s * 1000.0),
                    confidence,
                    is_final,
                },
            ))
        }
        "Error" => Normalized::Event(ServerEvent::provider_error(
            ProviderId::Speechmatics,
            parsed.reason.unwrap_or_else(|| "unknown error".to_string()),
        )),
        "EndOfTranscript" => Normalized::EndOfTranscript,
        _ => Normalized::Ignored, // AudioAdded, Info, Warning
    }
}

/// `S1`, `S2`, ... map to 0, 1, ...; anything else is unlabeled.
fn parse_speaker_label(label: &str) -> Option<u32> {
    label
        .strip_prefix('S')
        .and_then(|n| n.parse::<u32>().ok())
        .map(|n| n.saturating_sub(1))
}
