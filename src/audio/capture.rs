//! Microphone capture and per-frame energy metering.
//!
//! cpal delivers interleaved frames on its own callback thread; frames are
//! downmixed to mono and handed to a meter thread over a bounded channel.
//! The meter reduces each frame to a single RMS reading for the activity
//! monitor. Missing device or denied permission is fatal to the voice
//! feature and is not retried.

use crate::{CompaniaError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

/// One energy reading, stamped where it was measured.
#[derive(Debug, Clone, Copy)]
pub struct LevelSample {
    pub rms: f32,
    pub at: Instant,
}

/// Root-mean-square amplitude of a frame of samples.
pub fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    is_capturing: Arc<Mutex<bool>>,
}

impl AudioCapture {
    /// Open the default input device. Requested once at startup; failure
    /// here disables voice input for the rest of the run.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| CompaniaError::AudioDeviceError("no default input device".into()))?;

        let name = device.name().unwrap_or_else(|_| "unknown".into());
        let config: StreamConfig = device
            .default_input_config()
            .map_err(|e| {
                CompaniaError::AudioDeviceError(format!("input config unavailable: {}", e))
            })?
            .into();
        info!(
            device = %name,
            rate = config.sample_rate.0,
            channels = config.channels,
            "input device opened"
        );

        Ok(Self {
            device,
            config,
            stream: None,
            is_capturing: Arc::new(Mutex::new(false)),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start streaming mono frames to `frame_tx`.
    pub fn start(&mut self, frame_tx: Sender<Vec<f32>>) -> Result<()> {
        if *self.is_capturing.lock() {
            return Ok(());
        }

        let channels = self.config.channels as usize;
        let is_capturing = Arc::clone(&self.is_capturing);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !*is_capturing.lock() {
                        return;
                    }

                    // The monitor only needs energy, so stereo collapses to
                    // a channel average.
                    let frame: Vec<f32> = if channels == 1 {
                        data.to_vec()
                    } else {
                        data.chunks(channels)
                            .map(|f| f.iter().copied().sum::<f32>() / channels as f32)
                            .collect()
                    };

                    if let Err(e) = frame_tx.try_send(frame) {
                        debug!("frame dropped, meter is behind: {}", e);
                    }
                },
                |err| error!("input stream error: {}", err),
                None,
            )
            .map_err(|e| {
                CompaniaError::AudioDeviceError(format!("input stream setup failed: {}", e))
            })?;

        stream
            .play()
            .map_err(|e| CompaniaError::AudioDeviceError(format!("input stream stalled: {}", e)))?;

        *self.is_capturing.lock() = true;
        self.stream = Some(stream);

        info!("microphone capture started");
        Ok(())
    }

    pub fn stop(&mut self) {
        *self.is_capturing.lock() = false;
        if self.stream.take().is_some() {
            info!("microphone capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        *self.is_capturing.lock()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Channel pair between the capture callback and the meter thread.
pub fn frame_channel(buffer: usize) -> (Sender<Vec<f32>>, Receiver<Vec<f32>>) {
    bounded(buffer)
}

/// Reduce captured frames to stamped RMS readings on a dedicated thread.
///
/// `emit` runs on the meter thread; it typically forwards into the
/// coordinator's event channel. The thread exits when the capture side of
/// the frame channel disconnects.
pub fn spawn_meter<F>(frame_rx: Receiver<Vec<f32>>, mut emit: F) -> JoinHandle<()>
where
    F: FnMut(LevelSample) + Send + 'static,
{
    thread::spawn(move || {
        debug!("level meter running");
        while let Ok(frame) = frame_rx.recv() {
            emit(LevelSample {
                rms: frame_rms(&frame),
                at: Instant::now(),
            });
        }
        debug!("level meter stopped, capture side disconnected");
    })
}
