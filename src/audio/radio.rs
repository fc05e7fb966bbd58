//! Internet-radio capture.
//!
//! Fetches a stream URL with reqwest and decodes it with symphonia as it
//! arrives. Decoded mono blocks feed the same bounded channel the microphone
//! backend uses, so the rest of the pipeline does not care about the mode.
//!
//! Playback is a side tap: a second channel of gain-scaled samples meant for
//! a speaker sink. Volume applies to the tap only — the capture path feeding
//! the encoder always carries the unscaled signal, so transcription quality
//! is independent of playback volume.

use anyhow::Result;
use bytes::Bytes;
use futures::StreamExt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, CaptureBlock};
use crate::error::SessionError;

const BLOCK_CHANNEL_CAPACITY: usize = 32;
const BYTE_CHANNEL_CAPACITY: usize = 64;
const PLAYBACK_CHANNEL_CAPACITY: usize = 32;

pub struct RadioBackend {
    url: String,
    running: Arc<AtomicBool>,
    /// Playback gain as f32 bits; tap-only, never applied to capture blocks.
    volume_bits: Arc<AtomicU32>,
    playback_tx: Option<mpsc::Sender<Vec<f32>>>,
    playback_rx: Option<mpsc::Receiver<Vec<f32>>>,
    fetch_task: Option<tokio::task::JoinHandle<()>>,
    decode_task: Option<tokio::task::JoinHandle<()>>,
}

impl RadioBackend {
    pub fn new(url: String) -> Self {
        let (playback_tx, playback_rx) = mpsc::channel(PLAYBACK_CHANNEL_CAPACITY);
        Self {
            url,
            running: Arc::new(AtomicBool::new(false)),
            volume_bits: Arc::new(AtomicU32::new(1.0_f32.to_bits())),
            playback_tx: Some(playback_tx),
            playback_rx: Some(playback_rx),
            fetch_task: None,
            decode_task: None,
        }
    }

    /// Set playback volume in [0, 1]. Affects only the playback tap.
    pub fn set_volume(&self, volume: f32) {
        self.volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Take the playback tap: gain-scaled samples for a speaker sink.
    pub fn playback_tap(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.playback_rx.take()
    }
}

#[async_trait::async_trait]
impl CaptureBackend for RadioBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, SessionError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SessionError::Device("radio stream already playing".into()));
        }

        info!("opening radio stream: {}", self.url);
        let response = reqwest::get(&self.url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SessionError::Device(format!("failed to open radio stream: {e}")))?;

        self.running.store(true, Ordering::SeqCst);

        let (byte_tx, byte_rx) = mpsc::channel::<Bytes>(BYTE_CHANNEL_CAPACITY);
        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);

        // Fetch task: HTTP byte stream into the decode channel.
        let running = Arc::clone(&self.running);
        self.fetch_task = Some(tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while running.load(Ordering::SeqCst) {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if byte_tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("radio stream read error: {}", e);
                        break;
                    }
                    None => {
                        debug!("radio stream ended");
                        break;
                    }
                }
            }
        }));

        // Decode task: symphonia over the byte channel, blocks out.
        let running = Arc::clone(&self.running);
        let volume_bits = Arc::clone(&self.volume_bits);
        let playback_tx = self.playback_tx.clone();
        self.decode_task = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = decode_stream(byte_rx, block_tx, playback_tx, volume_bits, running) {
                warn!("radio decode ended: {:#}", e);
            }
        }));

        Ok(block_rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        if let Some(task) = self.decode_task.take() {
            // Unblocked by the fetch task closing the byte channel.
            let _ = task.await;
        }
        info!("radio capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "radio-stream"
    }
}

/// Blocking `Read` over the byte channel, for symphonia's probe/decode loop.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending = self.pending.slice(n..);
        Ok(n)
    }
}

/// Gain-scaled copy of one block for the playback tap. The capture samples
/// are never scaled; only this copy is.
fn tap_samples(samples: &[f32], volume: f32) -> Vec<f32> {
    samples.iter().map(|s| s * volume).collect()
}

/// A decoded packet needs a fresh sample buffer when its signal spec or
/// frame capacity differs from what the buffer was allocated for.
fn needs_new_buffer(current: Option<(SignalSpec, u64)>, spec: SignalSpec, duration: u64) -> bool {
    current != Some((spec, duration))
}

fn decode_stream(
    byte_rx: mpsc::Receiver<Bytes>,
    block_tx: mpsc::Sender<CaptureBlock>,
    playback_tx: Option<mpsc::Sender<Vec<f32>>>,
    volume_bits: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let reader = ChannelReader {
        rx: byte_rx,
        pending: Bytes::new(),
    };
    let source = ReadOnlySource::new(reader);
    let stream = MediaSourceStream::new(Box::new(source), Default::default());

    let probed = symphonia::default::get_probe().format(
        &Hint::new(),
        stream,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("radio stream has no audio track"))?;
    let track_id = track.id;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    info!("radio stream decoding started");

    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut buf_params: Option<(SignalSpec, u64)> = None;

    while running.load(Ordering::SeqCst) {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(_)) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                // Adaptive streams can carry damaged packets; skip them.
                debug!("skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        let duration = decoded.capacity() as u64;
        // Adaptive streams can change frame size or signal spec mid-stream;
        // a stale buffer would panic in copy_interleaved_ref.
        if needs_new_buffer(buf_params, spec, duration) {
            sample_buf = Some(SampleBuffer::<f32>::new(duration, spec));
            buf_params = Some((spec, duration));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        let channels = spec.channels.count().max(1);
        let samples: Vec<f32> = if channels == 1 {
            buf.samples().to_vec()
        } else {
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };
        if samples.is_empty() {
            continue;
        }

        // Playback tap gets the gain-scaled copy; a slow sink drops, never
        // stalls the capture path.
        if let Some(tx) = &playback_tx {
            let volume = f32::from_bits(volume_bits.load(Ordering::Relaxed));
            let _ = tx.try_send(tap_samples(&samples, volume));
        }

        let block = CaptureBlock {
            samples,
            sample_rate: spec.rate,
        };
        // Bounded channel paces decode to the consumer.
        if block_tx.blocking_send(block).is_err() {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::audio::Channels;

    #[test]
    fn volume_scales_the_tap_copy_never_the_capture_block() {
        let capture = vec![0.5, -0.25, 1.0];

        let tap = tap_samples(&capture, 0.5);
        assert_eq!(tap, vec![0.25, -0.125, 0.5]);
        // The capture block is untouched by any tap volume.
        assert_eq!(capture, vec![0.5, -0.25, 1.0]);

        let muted = tap_samples(&capture, 0.0);
        assert!(muted.iter().all(|s| *s == 0.0));
        assert_eq!(capture, vec![0.5, -0.25, 1.0]);
    }

    #[test]
    fn set_volume_clamps_to_unit_range() {
        let backend = RadioBackend::new("http://radio.example/stream".into());

        backend.set_volume(2.0);
        assert_eq!(f32::from_bits(backend.volume_bits.load(Ordering::Relaxed)), 1.0);

        backend.set_volume(-0.5);
        assert_eq!(f32::from_bits(backend.volume_bits.load(Ordering::Relaxed)), 0.0);
    }

    #[test]
    fn buffer_reallocates_on_spec_or_capacity_change() {
        let mono_44k = SignalSpec::new(44_100, Channels::FRONT_LEFT);
        let stereo_48k = SignalSpec::new(48_000, Channels::FRONT_LEFT | Channels::FRONT_RIGHT);

        assert!(needs_new_buffer(None, mono_44k, 1152));
        assert!(!needs_new_buffer(Some((mono_44k, 1152)), mono_44k, 1152));
        // An adaptive stream switching rendition changes spec or frame size.
        assert!(needs_new_buffer(Some((mono_44k, 1152)), stereo_48k, 1152));
        assert!(needs_new_buffer(Some((mono_44k, 1152)), mono_44k, 2048));
    }
}
