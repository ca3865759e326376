//! Audio devices for the native client.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its
//! own thread and is kept alive by a guard that the session owns. Dropping the
//! guard wakes the thread, which then drops the stream and releases the device.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parley_core::{AudioFrame, LocalAudio, MediaDevices, MediaError, PlaybackHandle, RemoteAudio};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Two seconds of 48 kHz audio.
const PLAYBACK_BUFFER_SAMPLES: usize = 96_000;
const CAPTURE_QUEUE_FRAMES: usize = 64;
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Converts a mono stream of arbitrary-sized frames to a fixed output rate.
///
/// Input that does not fill a resampler chunk is held until the next call.
/// The resampler is rebuilt if the input rate changes mid-stream.
pub struct RateConverter {
    from: u32,
    to: u32,
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl RateConverter {
    pub fn new(to: u32) -> Self {
        Self {
            from: to,
            to,
            resampler: None,
            pending: Vec::new(),
        }
    }

    pub fn convert(&mut self, samples: &[f32], from: u32) -> anyhow::Result<Vec<f32>> {
        if from != self.from {
            self.resampler = if from == self.to {
                None
            } else {
                // 20 ms chunks
                let chunk = (from / 50).max(1) as usize;
                Some(create_resampler(from as f64, self.to as f64, chunk)?)
            };
            self.from = from;
            self.pending.clear();
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = resampler.process(&[chunk], None)?;
            if let Some(channel) = resampled.into_iter().next() {
                output.extend(channel);
            }
        }
        Ok(output)
    }
}

/// Averages interleaved channels down to mono.
pub fn to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn stream_error(e: cpal::StreamError) {
    warn!(error = %e, "Audio stream error");
}

fn build_error(e: cpal::BuildStreamError, missing: MediaError) -> MediaError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => missing,
        other => {
            let message = other.to_string();
            let lowered = message.to_lowercase();
            if lowered.contains("permission") || lowered.contains("denied") {
                MediaError::PermissionDenied
            } else {
                MediaError::Device(message)
            }
        }
    }
}

/// Waits for a device thread to report its sample rate without blocking the runtime.
///
/// Giving up drops the receiver; the caller then drops its stop sender, which
/// makes the thread release the device as soon as it finishes opening it.
async fn wait_for_device(
    ready: oneshot::Receiver<Result<u32, MediaError>>,
    limit: Duration,
) -> Result<u32, MediaError> {
    match tokio::time::timeout(limit, ready).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(MediaError::Device("audio thread exited".to_string())),
        Err(_) => Err(MediaError::Device("audio device did not start in time".to_string())),
    }
}

/// Keeps a device thread alive; dropping it disconnects the stop channel.
struct DeviceGuard {
    _stop: std_mpsc::Sender<()>,
}

struct PlaybackGuard {
    _device: DeviceGuard,
    feeder: JoinHandle<()>,
}

impl Drop for PlaybackGuard {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

/// The default input and output devices of the cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire_microphone(&self) -> Result<LocalAudio, MediaError> {
        let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_QUEUE_FRAMES);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || run_capture(frames_tx, ready_tx, stop_rx))
            .map_err(|e| MediaError::Device(e.to_string()))?;

        let sample_rate = wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await?;
        info!(sample_rate, "Microphone capture started");
        Ok(LocalAudio::new(frames_rx, DeviceGuard { _stop: stop_tx }))
    }

    async fn start_playback(
        &self,
        mut remote: RemoteAudio,
    ) -> Result<PlaybackHandle, MediaError> {
        let (producer, consumer) = HeapRb::<f32>::new(PLAYBACK_BUFFER_SAMPLES).split();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-playback".into())
            .spawn(move || run_playback(consumer, ready_tx, stop_rx))
            .map_err(|e| MediaError::Device(e.to_string()))?;

        let device_rate = wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await?;
        info!(sample_rate = device_rate, "Audio playback started");

        let mut producer = producer;
        let feeder = tokio::spawn(async move {
            let mut converter = RateConverter::new(device_rate);
            while let Some(frame) = remote.next_frame().await {
                let samples = match converter.convert(&frame.samples, frame.sample_rate) {
                    Ok(samples) => samples,
                    Err(e) => {
                        error!(error = %e, "Failed to resample remote audio");
                        break;
                    }
                };
                let pushed = producer.push_slice(&samples);
                if pushed < samples.len() {
                    debug!(dropped = samples.len() - pushed, "Playback buffer full");
                }
            }
            debug!("Remote audio ended");
        });

        Ok(PlaybackHandle::new(PlaybackGuard {
            _device: DeviceGuard { _stop: stop_tx },
            feeder,
        }))
    }
}

fn run_capture(
    frames: mpsc::Sender<AudioFrame>,
    ready: oneshot::Sender<Result<u32, MediaError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let stream = match open_input(frames) {
        Ok((stream, sample_rate)) => {
            let _ = ready.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    // Returns once the guard is dropped.
    let _ = stop.recv();
    drop(stream);
    debug!("Microphone released");
}

fn open_input(frames: mpsc::Sender<AudioFrame>) -> Result<(Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;
    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => MediaError::NoInputDevice,
        other => MediaError::Device(other.to_string()),
    })?;

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config: StreamConfig = supported.config();
    let forward = move |samples: Vec<f32>| {
        let frame = AudioFrame {
            samples,
            sample_rate,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = frames.try_send(frame) {
            debug!("Capture queue full; dropping frame");
        }
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| forward(to_mono(data, channels)),
            stream_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                forward(to_mono(&samples, channels))
            },
            stream_error,
            None,
        ),
        other => {
            return Err(MediaError::Device(format!(
                "unsupported input sample format {other:?}"
            )));
        }
    }
    .map_err(|e| build_error(e, MediaError::NoInputDevice))?;

    stream
        .play()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn run_playback(
    consumer: HeapCons<f32>,
    ready: oneshot::Sender<Result<u32, MediaError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let stream = match open_output(consumer) {
        Ok((stream, sample_rate)) => {
            let _ = ready.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = stop.recv();
    drop(stream);
    debug!("Speaker released");
}

fn open_output(mut consumer: HeapCons<f32>) -> Result<(Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(MediaError::NoOutputDevice)?;
    let supported = device.default_output_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => MediaError::NoOutputDevice,
        other => MediaError::Device(other.to_string()),
    })?;

    let sample_rate = supported.sample_rate().0;
    let channels = (supported.channels() as usize).max(1);
    let config: StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    frame.fill(consumer.try_pop().unwrap_or(0.0));
                }
            },
            stream_error,
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = consumer.try_pop().unwrap_or(0.0) * i16::MAX as f32;
                    frame.fill(sample.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
                }
            },
            stream_error,
            None,
        ),
        other => {
            return Err(MediaError::Device(format!(
                "unsupported output sample format {other:?}"
            )));
        }
    }
    .map_err(|e| build_error(e, MediaError::NoOutputDevice))?;

    stream
        .play()
        .map_err(|e| MediaError::Device(e.to_string()))?;
    Ok((stream, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 8000.0, 960).is_ok());
        assert!(create_resampler(8000.0, 44100.0, 160).is_ok());
    }

    #[test]
    fn test_rate_converter_passthrough_at_target_rate() {
        let mut converter = RateConverter::new(8000);
        let samples = vec![0.25f32; 37];
        assert_eq!(converter.convert(&samples, 8000).unwrap(), samples);
    }

    #[test]
    fn test_rate_converter_downsamples_whole_chunks() {
        let mut converter = RateConverter::new(8000);

        // Less than one 20 ms chunk at 48 kHz is held back.
        assert!(converter.convert(&vec![0.0; 500], 48000).unwrap().is_empty());

        let output = converter.convert(&vec![0.0; 4300], 48000).unwrap();
        // 4800 input samples make five chunks of 160 output samples.
        assert!((790..=810).contains(&output.len()), "got {}", output.len());
    }

    #[test]
    fn test_rate_converter_follows_rate_change() {
        let mut converter = RateConverter::new(8000);
        converter.convert(&vec![0.0; 960], 48000).unwrap();
        let samples = vec![0.5f32; 160];
        assert_eq!(converter.convert(&samples, 8000).unwrap(), samples);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let stereo = [1.0f32, 0.0, 0.5, 0.5, -1.0, 1.0];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert_abs_diff_eq!(mono[0], 0.5);
        assert_abs_diff_eq!(mono[1], 0.5);
        assert_abs_diff_eq!(mono[2], 0.0);

        assert_eq!(to_mono(&stereo, 1), stereo.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_wait_times_out_without_blocking_runtime() {
        let (_ready_tx, ready_rx) = oneshot::channel();
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let started = tokio::time::Instant::now();
        let err = wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, MediaError::Device(ref m) if m.contains("did not start")));
        assert!(started.elapsed() >= DEVICE_OPEN_TIMEOUT);
        // Other tasks kept running while the device was opening.
        assert!(ticker.is_finished());
    }

    #[tokio::test]
    async fn test_device_wait_reports_rate_or_failure() {
        let (ready_tx, ready_rx) = oneshot::channel();
        thread::spawn(move || {
            let _ = ready_tx.send(Ok(48_000));
        });
        assert_eq!(wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await.unwrap(), 48_000);

        let (ready_tx, ready_rx) = oneshot::channel();
        ready_tx.send(Err(MediaError::NoOutputDevice)).unwrap();
        assert!(matches!(
            wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await,
            Err(MediaError::NoOutputDevice)
        ));

        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, MediaError>>();
        drop(ready_tx);
        assert!(matches!(
            wait_for_device(ready_rx, DEVICE_OPEN_TIMEOUT).await,
            Err(MediaError::Device(_))
        ));
    }

    #[test]
    fn test_build_error_classification() {
        assert!(matches!(
            build_error(cpal::BuildStreamError::DeviceNotAvailable, MediaError::NoInputDevice),
            MediaError::NoInputDevice
        ));
        assert!(matches!(
            build_error(
                cpal::BuildStreamError::StreamConfigNotSupported,
                MediaError::NoInputDevice
            ),
            MediaError::Device(_)
        ));
    }
}
