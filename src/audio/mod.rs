use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub mod capture;
pub mod memory;
pub mod playback;
pub mod pump;

pub use capture::CpalCapture;
pub use memory::{DeviceLog, MemoryDevices, MemorySource, RecordingSink};
pub use playback::CpalPlayback;
pub use pump::{AudioPump, AudioUplink, PumpStats, DEFAULT_QUEUE_DEPTH};

/// Realtime audio is PCM16 little-endian mono at 24 kHz in both directions
pub const SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Bytes in one frame of `frame_ms` milliseconds
pub fn frame_bytes(frame_ms: u32) -> usize {
    (SAMPLE_RATE as usize * frame_ms as usize / 1000) * 2
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Audio device unavailable: {0}")]
    Unavailable(String),
    #[error("Audio configuration error: {0}")]
    Config(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Failed to write audio data: {0}")]
    Write(String),
    #[error("Audio device already released")]
    Released,
}

/// Fixed-size chunk of PCM16 LE mono samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Microphone side
#[async_trait]
pub trait AudioSource: Send {
    /// Next captured frame, `None` at end of stream
    async fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError>;

    /// Release the device
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Speaker side. The data is expected to be 16-bit PCM at 24kHz mono.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn write(&self, audio_data: &[u8]) -> Result<(), DeviceError>;

    /// Stop playback and clear any buffered data
    async fn stop(&self) -> Result<(), DeviceError>;
}

/// Opens the capture/playback pair for one session
#[async_trait]
pub trait AudioDevices: Send + Sync {
    async fn open(&self) -> Result<(Box<dyn AudioSource>, Arc<dyn AudioSink>), DeviceError>;
}

/// Default input and output devices through cpal
pub struct CpalDevices {
    frame_ms: u32,
}

impl CpalDevices {
    pub fn new(frame_ms: u32) -> Self {
        Self { frame_ms }
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_MS)
    }
}

#[async_trait]
impl AudioDevices for CpalDevices {
    async fn open(&self) -> Result<(Box<dyn AudioSource>, Arc<dyn AudioSink>), DeviceError> {
        let frame_len = frame_bytes(self.frame_ms);
        // Device setup blocks on the audio threads reporting back
        let (capture, playback) = tokio::task::spawn_blocking(move || {
            let capture = CpalCapture::open(frame_len)?;
            let playback = CpalPlayback::open()?;
            Ok::<_, DeviceError>((capture, playback))
        })
        .await
        .map_err(|e| DeviceError::Unavailable(format!("device setup panicked: {}", e)))??;

        log::info!("🎤 Audio devices opened ({} byte frames)", frame_len);
        Ok((Box::new(capture), Arc::new(playback)))
    }
}

/// Linear interpolation between sample rates
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = from_rate as f32 / to_rate as f32;
    let output_len = (input.len() as f32 / ratio) as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src = i as f32 * ratio;
        let floor = src.floor() as usize;
        let ceil = (floor + 1).min(input.len() - 1);
        let frac = src - floor as f32;

        let sample = if floor >= input.len() {
            0.0
        } else {
            input[floor] * (1.0 - frac) + input[ceil] * frac
        };
        output.push(sample);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        assert_eq!(frame_bytes(20), 960);
        assert_eq!(frame_bytes(40), 1920);
    }

    #[test]
    fn test_frame_from_samples() {
        let frame = AudioFrame::from_samples(&[1, -1]);
        assert_eq!(frame.as_bytes(), &[1, 0, 0xff, 0xff]);
        assert_eq!(frame.len(), 4);
    }

    #[test]
    fn test_resample_linear() {
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();

        let down = resample_linear(&input, 48_000, 24_000);
        assert_eq!(down.len(), 240);
        assert!((down[10] - input[20]).abs() < 1e-6);

        let up = resample_linear(&input, 24_000, 48_000);
        assert_eq!(up.len(), 960);
        assert!((up[1] - (input[0] + input[1]) / 2.0).abs() < 1e-6);

        assert_eq!(resample_linear(&input, 24_000, 24_000), input);
    }
}
