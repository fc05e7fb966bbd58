//! Microphone capture via cpal.
//!
//! The cpal stream lives on a dedicated thread because streams are not
//! `Send` on every platform. The audio callback forwards blocks into a
//! bounded channel with `try_send`; it must never block, so a full channel
//! drops the block with a warning.
//!
//! The input stream is opened raw: no echo cancellation, auto gain or noise
//! suppression is requested, keeping the signal the engines hear unprocessed.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, CaptureBlock};
use crate::error::SessionError;

/// Capacity of the block channel (~3s of 100ms blocks).
const BLOCK_CHANNEL_CAPACITY: usize = 32;

pub struct MicBackend {
    running: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl MicBackend {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Default for MicBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CaptureBackend for MicBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<CaptureBlock>, SessionError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SessionError::Device("microphone already capturing".into()));
        }

        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, String>>();

        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let thread_running = Arc::clone(&self.running);
        let worker = std::thread::spawn(move || {
            let setup = (|| -> Result<(cpal::Stream, u32), String> {
                let host = cpal::default_host();
                let device = host
                    .default_input_device()
                    .ok_or_else(|| "no input device available".to_string())?;

                let config = device
                    .default_input_config()
                    .map_err(|e| format!("unsupported input configuration: {e}"))?;

                let sample_rate = config.sample_rate().0;
                let channels = config.channels() as usize;

                let stream = device
                    .build_input_stream(
                        &config.into(),
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            if data.is_empty() {
                                return;
                            }
                            // Fold interleaved channels down to mono.
                            let samples: Vec<f32> = if channels == 1 {
                                data.to_vec()
                            } else {
                                data.chunks(channels)
                                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                                    .collect()
                            };
                            let block = CaptureBlock {
                                samples,
                                sample_rate,
                            };
                            if block_tx.try_send(block).is_err() {
                                warn!("capture channel full, dropping microphone block");
                            }
                        },
                        |err| warn!("microphone stream error: {}", err),
                        None,
                    )
                    .map_err(|e| format!("failed to open input stream: {e}"))?;

                stream
                    .play()
                    .map_err(|e| format!("failed to start input stream: {e}"))?;

                Ok((stream, sample_rate))
            })();

            match setup {
                Ok((stream, sample_rate)) => {
                    let _ = ready_tx.send(Ok(sample_rate));
                    // Keep the stream alive until stop() clears the flag.
                    while thread_running.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    drop(stream);
                    debug!("microphone stream released");
                }
                Err(e) => {
                    thread_running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        match ready_rx.await {
            Ok(Ok(sample_rate)) => {
                info!("microphone capture started at {} Hz", sample_rate);
                self.worker = Some(worker);
                Ok(block_rx)
            }
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(SessionError::Device(message))
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(SessionError::Device("capture thread exited early".into()))
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            // Detach-free shutdown: the thread exits within one poll interval.
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
            info!("microphone capture stopped");
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "cpal-microphone"
    }
}
