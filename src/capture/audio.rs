//! Microphone sources
//!
//! [`ToneMicrophoneSource`] produces a sine tone paced in real time. With the
//! `microphone` feature, [`CpalMicrophoneSource`] records from the default
//! input device.

use super::traits::{AudioDeviceInfo, Microphone, MicrophoneSource};
use crate::utils::error::{CaptureError, CaptureResult};
use std::time::{Duration, Instant};

/// Synthetic microphone
#[derive(Debug, Clone)]
pub struct ToneMicrophoneSource {
    frequency_hz: f64,
    amplitude: i16,
    available: bool,
}

impl ToneMicrophoneSource {
    /// 440 Hz at about a quarter of full scale
    pub fn new() -> Self {
        Self {
            frequency_hz: 440.0,
            amplitude: 8_000,
            available: true,
        }
    }

    pub fn with_frequency(mut self, frequency_hz: f64) -> Self {
        self.frequency_hz = frequency_hz;
        self
    }

    /// A source whose `open` always fails
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }
}

impl Default for ToneMicrophoneSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrophoneSource for ToneMicrophoneSource {
    fn devices(&self) -> Vec<AudioDeviceInfo> {
        if !self.available {
            return Vec::new();
        }
        vec![AudioDeviceInfo {
            id: "tone".to_string(),
            name: format!("Tone generator ({} Hz)", self.frequency_hz),
            is_default: true,
        }]
    }

    fn open(&self, sample_rate: u32, channels: u16) -> CaptureResult<Box<dyn Microphone>> {
        if !self.available {
            return Err(CaptureError::DeviceUnavailable("no microphone".to_string()));
        }
        if sample_rate == 0 || channels == 0 {
            return Err(CaptureError::DeviceUnavailable(format!(
                "unsupported format {} Hz x {}",
                sample_rate, channels
            )));
        }
        Ok(Box::new(ToneMicrophone {
            sample_rate,
            channels: channels as usize,
            step: std::f64::consts::TAU * self.frequency_hz / sample_rate as f64,
            amplitude: self.amplitude as f64,
            phase: 0.0,
            started: None,
            frames_read: 0,
            closed: false,
        }))
    }
}

struct ToneMicrophone {
    sample_rate: u32,
    channels: usize,
    step: f64,
    amplitude: f64,
    phase: f64,
    started: Option<Instant>,
    frames_read: u64,
    closed: bool,
}

impl Microphone for ToneMicrophone {
    fn read(&mut self, buf: &mut [i16]) -> CaptureResult<usize> {
        if self.closed {
            return Err(CaptureError::DeviceUnavailable("microphone closed".to_string()));
        }
        let started = *self.started.get_or_insert_with(Instant::now);

        for frame in buf.chunks_mut(self.channels) {
            let value = (self.phase.sin() * self.amplitude) as i16;
            frame.iter_mut().for_each(|s| *s = value);
            self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        }
        self.frames_read += (buf.len() / self.channels) as u64;

        // Hand the buffer back when a real device would have filled it
        let due = started
            + Duration::from_micros(self.frames_read * 1_000_000 / self.sample_rate as u64);
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(feature = "microphone")]
pub use self::device::CpalMicrophoneSource;

#[cfg(feature = "microphone")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    /// A read that sees no samples for this long treats the device as gone
    const READ_TIMEOUT: Duration = Duration::from_secs(1);

    /// About two seconds of mono 48 kHz
    const MAX_BUFFERED: usize = 96_000;

    /// Default input device through cpal
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalMicrophoneSource;

    impl MicrophoneSource for CpalMicrophoneSource {
        fn devices(&self) -> Vec<AudioDeviceInfo> {
            let host = cpal::default_host();
            let default_name = host.default_input_device().and_then(|d| d.name().ok());
            match host.input_devices() {
                Ok(devices) => devices
                    .filter_map(|d| d.name().ok())
                    .map(|name| AudioDeviceInfo {
                        id: name.clone(),
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        name,
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!("Failed to enumerate input devices: {}", e);
                    Vec::new()
                }
            }
        }

        fn open(&self, sample_rate: u32, channels: u16) -> CaptureResult<Box<dyn Microphone>> {
            let shared = Arc::new(Shared {
                samples: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                failed: AtomicBool::new(false),
            });
            let running = Arc::new(AtomicBool::new(true));
            let (started_tx, started_rx) = std::sync::mpsc::channel();

            // cpal streams are not Send; the stream lives on its own thread
            let thread = {
                let shared = shared.clone();
                let running = running.clone();
                std::thread::Builder::new()
                    .name("cpal-microphone".to_string())
                    .spawn(move || {
                        let stream = match build_stream(sample_rate, channels, shared) {
                            Ok(stream) => stream,
                            Err(e) => {
                                let _ = started_tx.send(Err(e));
                                return;
                            }
                        };
                        let _ = started_tx.send(Ok(()));
                        while running.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                    })?
            };

            match started_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let _ = thread.join();
                    return Err(e);
                }
                Err(_) => {
                    return Err(CaptureError::DeviceUnavailable(
                        "microphone thread exited".to_string(),
                    ))
                }
            }

            tracing::info!("Microphone stream started: {} Hz x {}", sample_rate, channels);
            Ok(Box::new(CpalMicrophone {
                shared,
                running,
                thread: Some(thread),
            }))
        }
    }

    struct Shared {
        samples: Mutex<VecDeque<i16>>,
        ready: Condvar,
        failed: AtomicBool,
    }

    fn build_stream(
        sample_rate: u32,
        channels: u16,
        shared: Arc<Shared>,
    ) -> CaptureResult<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".to_string()))?;

        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let on_error = {
            let shared = shared.clone();
            move |err: cpal::StreamError| {
                tracing::error!("Microphone stream error: {}", err);
                shared.failed.store(true, Ordering::Release);
                shared.ready.notify_all();
            }
        };

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut samples = shared.samples.lock();
                    samples.extend(
                        data.iter()
                            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    );
                    let excess = samples.len().saturating_sub(MAX_BUFFERED);
                    samples.drain(..excess);
                    shared.ready.notify_all();
                },
                on_error,
                None,
            )
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        stream
            .play()
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        Ok(stream)
    }

    struct CpalMicrophone {
        shared: Arc<Shared>,
        running: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Microphone for CpalMicrophone {
        fn read(&mut self, buf: &mut [i16]) -> CaptureResult<usize> {
            let deadline = Instant::now() + READ_TIMEOUT;
            let mut samples = self.shared.samples.lock();
            while samples.len() < buf.len() {
                if self.shared.failed.load(Ordering::Acquire) {
                    return Err(CaptureError::DeviceUnavailable("microphone stream failed".to_string()));
                }
                if self.shared.ready.wait_until(&mut samples, deadline).timed_out()
                    && samples.len() < buf.len()
                {
                    return Err(CaptureError::DeviceUnavailable(
                        "microphone stopped delivering samples".to_string(),
                    ));
                }
            }
            for (dst, src) in buf.iter_mut().zip(samples.drain(..buf.len())) {
                *dst = src;
            }
            Ok(buf.len())
        }

        fn close(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_is_paced_in_real_time() {
        let source = ToneMicrophoneSource::new();
        let mut mic = source.open(44_100, 1).unwrap();
        let mut buf = vec![0i16; 1024];

        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(mic.read(&mut buf).unwrap(), 1024);
        }
        // 3072 frames at 44.1 kHz is about 70 ms
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert!(buf.iter().any(|s| *s != 0));

        mic.close();
        assert!(mic.read(&mut buf).is_err());
    }

    #[test]
    fn test_stereo_channels_carry_same_sample() {
        let mut mic = ToneMicrophoneSource::new().open(48_000, 2).unwrap();
        let mut buf = vec![0i16; 64];
        mic.read(&mut buf).unwrap();
        assert!(buf.chunks(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn test_unavailable_source() {
        let source = ToneMicrophoneSource::unavailable();
        assert!(source.devices().is_empty());
        let err = source.open(44_100, 1).err().unwrap();
        assert_eq!(err.code(), "DEVICE_UNAVAILABLE");
    }
}
