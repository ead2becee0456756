//! Audio Capture and Playback
//!
//! `AudioCapture` and `AudioPlayback` are the device seams of a session. The
//! session only ever sees raw PCM16 little-endian mono bytes.
//!
//! `CpalBackend` implements them on top of cpal. Device callbacks and the
//! session loops meet in ring buffers; sample format, channel count and
//! sample rate are converted inside the callbacks.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::{Condvar, Mutex};
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default sample rate of the PCM stream on the wire
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Channels on the wire (mono for voice)
pub const CHANNELS: u16 = 1;

/// PCM16
pub const BYTES_PER_SAMPLE: usize = 2;

/// Longest a capture read waits before returning what it has
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Frames of headroom in the device ring buffers
const RING_FRAMES: usize = 8;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    /// A single read failed, the device is still usable
    #[error("Audio read failed: {0}")]
    ReadFailed(String),

    #[error("Audio device lost: {0}")]
    DeviceLost(String),

    #[error("Audio device already closed")]
    Closed,
}

impl AudioError {
    /// Whether the capture loop has to give up
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AudioError::ReadFailed(_))
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// Platform effects that may be requested on a capture handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureEffects {
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub gain_control: bool,
}

impl CaptureEffects {
    pub fn any(&self) -> bool {
        self.noise_suppression || self.echo_cancellation || self.gain_control
    }
}

/// What a device is opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame size in bytes
    pub buffer_size: usize,
    /// Device name, `None` for the host default
    pub device: Option<String>,
}

impl AudioParams {
    pub fn frame_samples(&self) -> usize {
        self.buffer_size / BYTES_PER_SAMPLE
    }
}

// ============================================================================
// DEVICE SEAMS
// ============================================================================

/// Microphone side of a session
pub trait AudioCapture: Send {
    /// Fills `buf` with PCM16 bytes, blocking for a bounded time.
    ///
    /// Returns the number of bytes written; `0` means nothing was captured yet.
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Requests platform effects, returns those actually enabled.
    /// Unavailable effects are not an error.
    fn request_effects(&mut self, _effects: CaptureEffects) -> CaptureEffects {
        CaptureEffects::default()
    }

    /// Releases the device. Idempotent.
    fn close(&mut self);
}

/// Speaker side of a session
pub trait AudioPlayback: Send {
    fn write_frame(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Releases the device. Idempotent.
    fn close(&mut self);
}

/// Opens capture and playback devices
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, params: &AudioParams) -> Result<Box<dyn AudioCapture>, AudioError>;

    fn open_playback(&self, params: &AudioParams) -> Result<Box<dyn AudioPlayback>, AudioError>;
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Devices of the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, params: &AudioParams) -> Result<Box<dyn AudioCapture>, AudioError> {
        Ok(Box::new(CpalCapture::open(params)?))
    }

    fn open_playback(&self, params: &AudioParams) -> Result<Box<dyn AudioPlayback>, AudioError> {
        Ok(Box::new(CpalPlayback::open(params)?))
    }
}

fn input_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        None => host.default_input_device().ok_or(AudioError::NoInputDevice),
    }
}

fn output_device(name: Option<&str>) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        None => host.default_output_device().ok_or(AudioError::NoOutputDevice),
    }
}

/// Picks a stream configuration close to `target_rate`
///
/// Priority: target rate over any other, then F32 over I16 over U16.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target = cpal::SampleRate(target_rate);
    let formats = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

    for format in formats {
        for config in &configs {
            if config.sample_format() == format
                && config.min_sample_rate() <= target
                && config.max_sample_rate() >= target
            {
                return Ok((config.clone().with_sample_rate(target).into(), format));
            }
        }
    }

    // Device can't run at the target rate; resample in the callback.
    for format in formats {
        if let Some(config) = configs.iter().find(|c| c.sample_format() == format) {
            let rate = if config.max_sample_rate() < target {
                config.max_sample_rate()
            } else {
                config.min_sample_rate()
            };
            return Ok((config.clone().with_sample_rate(rate).into(), format));
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

/// Linear resampling, good enough for voice
fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    (0..new_len)
        .map(|i| {
            let src = i as f64 / ratio;
            let idx = src as usize;
            let frac = src - idx as f64;
            let s1 = input.get(idx).copied().unwrap_or(0) as f64;
            let s2 = input.get(idx + 1).copied().map(f64::from).unwrap_or(s1);
            (s1 + (s2 - s1) * frac).round() as i16
        })
        .collect()
}

/// PCM16 little-endian bytes to samples; a trailing odd byte is dropped
pub fn pcm16_from_bytes(bytes: &[u8]) -> impl Iterator<Item = i16> + '_ {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

// ----------------------------------------------------------------------------
// Capture
// ----------------------------------------------------------------------------

struct CaptureShared {
    buffer: Mutex<HeapRb<i16>>,
    ready: Condvar,
    lost: Mutex<Option<String>>,
}

/// Microphone capture through cpal
pub struct CpalCapture {
    stream: Option<Stream>,
    shared: Arc<CaptureShared>,
    device_name: String,
}

// cpal::Stream is not Send on every platform. The stream is created by the
// controller and afterwards only touched (dropped) by the send loop that owns
// this handle, never concurrently.
unsafe impl Send for CpalCapture {}

impl CpalCapture {
    pub fn open(params: &AudioParams) -> Result<Self, AudioError> {
        let device = input_device(params.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let (config, format) = select_best_config(configs.collect(), params.sample_rate)?;

        tracing::info!(
            "Opening capture '{}': {} Hz, {} channel(s), {:?} (wire {} Hz)",
            device_name,
            config.sample_rate.0,
            config.channels,
            format,
            params.sample_rate
        );

        let capacity = (params.frame_samples() * RING_FRAMES).max(params.sample_rate as usize / 2);
        let shared = Arc::new(CaptureShared {
            buffer: Mutex::new(HeapRb::new(capacity)),
            ready: Condvar::new(),
            lost: Mutex::new(None),
        });

        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, params.sample_rate, &shared),
            SampleFormat::I16 => build_input::<i16>(&device, &config, params.sample_rate, &shared),
            SampleFormat::U16 => build_input::<u16>(&device, &config, params.sample_rate, &shared),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {other:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            shared,
            device_name,
        })
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    wire_rate: u32,
    shared: &Arc<CaptureShared>,
) -> Result<Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let device_rate = config.sample_rate.0;
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Downmix to mono by averaging all channels
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: i32 = frame.iter().map(|&s| s.to_sample::<i16>() as i32).sum();
                        (sum / frame.len() as i32) as i16
                    })
                    .collect();

                let samples = resample_linear(&mono, device_rate, wire_rate);

                let mut buffer = data_shared.buffer.lock();
                let pushed = buffer.push_slice(&samples);
                if pushed < samples.len() {
                    tracing::trace!("Capture ring full, dropped {} samples", samples.len() - pushed);
                }
                drop(buffer);
                data_shared.ready.notify_one();
            },
            move |err| match err {
                cpal::StreamError::DeviceNotAvailable => {
                    tracing::warn!("Capture device no longer available");
                    *error_shared.lost.lock() = Some(err.to_string());
                    error_shared.ready.notify_all();
                }
                other => tracing::warn!("Audio capture error: {}", other),
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

impl AudioCapture for CpalCapture {
    fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.stream.is_none() {
            return Err(AudioError::Closed);
        }
        if let Some(reason) = self.shared.lost.lock().clone() {
            return Err(AudioError::DeviceLost(reason));
        }

        let wanted = buf.len() / BYTES_PER_SAMPLE;
        let deadline = Instant::now() + CAPTURE_POLL_INTERVAL;

        let mut buffer = self.shared.buffer.lock();
        while buffer.occupied_len() < wanted {
            if self.shared.ready.wait_until(&mut buffer, deadline).timed_out() {
                break;
            }
            if self.shared.lost.lock().is_some() {
                break;
            }
        }

        let mut samples = vec![0i16; buffer.occupied_len().min(wanted)];
        let popped = buffer.pop_slice(&mut samples);
        drop(buffer);

        for (i, sample) in samples[..popped].iter().enumerate() {
            buf[i * BYTES_PER_SAMPLE..(i + 1) * BYTES_PER_SAMPLE]
                .copy_from_slice(&sample.to_le_bytes());
        }

        Ok(popped * BYTES_PER_SAMPLE)
    }

    fn request_effects(&mut self, effects: CaptureEffects) -> CaptureEffects {
        if effects.any() {
            tracing::debug!(
                "Capture effects {:?} not available on '{}', continuing without",
                effects,
                self.device_name
            );
        }
        CaptureEffects::default()
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            self.shared.ready.notify_all();
            tracing::info!("Capture device '{}' released", self.device_name);
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Playback
// ----------------------------------------------------------------------------

/// Speaker playback through cpal
pub struct CpalPlayback {
    stream: Option<Stream>,
    buffer: Arc<Mutex<HeapRb<i16>>>,
    device_name: String,
}

// See CpalCapture; the receive loop is the only owner after construction.
unsafe impl Send for CpalPlayback {}

impl CpalPlayback {
    pub fn open(params: &AudioParams) -> Result<Self, AudioError> {
        let device = output_device(params.device.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let (config, format) = select_best_config(configs.collect(), params.sample_rate)?;

        tracing::info!(
            "Opening playback '{}': {} Hz, {} channel(s), {:?} (wire {} Hz)",
            device_name,
            config.sample_rate.0,
            config.channels,
            format,
            params.sample_rate
        );

        let capacity = (params.frame_samples() * RING_FRAMES).max(params.sample_rate as usize / 2);
        let buffer = Arc::new(Mutex::new(HeapRb::new(capacity)));

        let stream = match format {
            SampleFormat::F32 => build_output::<f32>(&device, &config, params.sample_rate, &buffer),
            SampleFormat::I16 => build_output::<i16>(&device, &config, params.sample_rate, &buffer),
            SampleFormat::U16 => build_output::<u16>(&device, &config, params.sample_rate, &buffer),
            other => Err(AudioError::UnsupportedConfig(format!(
                "sample format {other:?}"
            ))),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            buffer,
            device_name,
        })
    }
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    wire_rate: u32,
    buffer: &Arc<Mutex<HeapRb<i16>>>,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels.max(1) as usize;
    let ratio = wire_rate as f64 / config.sample_rate.0 as f64;
    let buffer = Arc::clone(buffer);
    let mut position = 0.0f64;
    let mut current: i16 = 0;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buffer = buffer.lock();

                // Nearest-sample resampling from the wire rate, mono to all channels
                for frame in data.chunks_mut(channels) {
                    position += ratio;
                    while position >= 1.0 {
                        current = buffer.try_pop().unwrap_or(0);
                        position -= 1.0;
                    }
                    let sample = T::from_sample(current);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }

                if buffer.is_empty() {
                    current = 0;
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

impl AudioPlayback for CpalPlayback {
    fn write_frame(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        if self.stream.is_none() {
            return Err(AudioError::Closed);
        }

        let samples: Vec<i16> = pcm16_from_bytes(pcm).collect();
        let pushed = self.buffer.lock().push_slice(&samples);
        if pushed < samples.len() {
            tracing::trace!("Playback ring full, dropped {} samples", samples.len() - pushed);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            self.buffer.lock().clear();
            tracing::info!("Playback device '{}' released", self.device_name);
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the available input and output devices
pub fn list_devices() -> Result<(Vec<String>, Vec<String>), AudioError> {
    let host = cpal::default_host();

    let inputs = host
        .input_devices()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
        .filter_map(|d| d.name().ok())
        .collect();

    let outputs = host
        .output_devices()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok((inputs, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let input = vec![1, 2, 3, 4];
        assert_eq!(resample_linear(&input, 48_000, 48_000), input);
    }

    #[test]
    fn test_resample_changes_length() {
        let input = vec![0i16; 480];
        assert_eq!(resample_linear(&input, 48_000, 44_100).len(), 441);
        assert_eq!(resample_linear(&input, 24_000, 48_000).len(), 960);
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample_linear(&[0, 100], 1, 2);
        assert_eq!(out, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_pcm16_from_bytes() {
        let bytes = [0x01, 0x00, 0xFF, 0xFF, 0x7F];
        let samples: Vec<i16> = pcm16_from_bytes(&bytes).collect();
        assert_eq!(samples, vec![1, -1]);
    }

    #[test]
    fn test_error_fatality() {
        assert!(!AudioError::ReadFailed("overrun".into()).is_fatal());
        assert!(AudioError::DeviceLost("unplugged".into()).is_fatal());
        assert!(AudioError::Closed.is_fatal());
    }

    #[test]
    fn test_frame_samples() {
        let params = AudioParams {
            sample_rate: 44_100,
            channels: CHANNELS,
            buffer_size: 4096,
            device: None,
        };
        assert_eq!(params.frame_samples(), 2048);
    }
}
