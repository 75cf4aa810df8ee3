use super::{resample_linear, AudioFrame, AudioSource, DeviceError, SAMPLE_RATE};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, SupportedStreamConfig};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;

/// Microphone capture through cpal. The stream lives on its own thread so
/// the handle can move between tasks; frames arrive over a channel.
pub struct CpalCapture {
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    /// Open the default input device, delivering frames of `frame_len` bytes
    pub fn open(frame_len: usize) -> Result<Self, DeviceError> {
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();

        let thread = thread::spawn(move || {
            let stream = match build_stream(frame_tx, frame_len) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Park until asked to stop or the handle is dropped
            let _ = stop_rx.recv();
            log::debug!("Capture: audio thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                frames,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Unavailable(
                "capture thread exited during setup".to_string(),
            )),
        }
    }

    fn release(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture: failed to join audio thread");
            }
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl AudioSource for CpalCapture {
    async fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        if self.stop_tx.is_none() {
            return Err(DeviceError::Released);
        }
        Ok(self.frames.recv().await)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.stop_tx.is_none() {
            return Ok(());
        }
        log::debug!("Capture: releasing input device");
        self.release();
        Ok(())
    }
}

fn build_stream(
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    frame_len: usize,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| DeviceError::Unavailable("No default input device found".into()))?;
    log::debug!("Capture: using input device {:?}", device.name());

    let supported = select_config(&device)?;
    let channels = supported.channels() as usize;
    let device_rate = supported.sample_rate().0;
    let stream_config = supported.config();

    log::info!(
        "Audio capture configured: {} channels @ {}Hz (format: {:?})",
        channels,
        device_rate,
        supported.sample_format()
    );

    let framer = Framer {
        tx: frame_tx,
        frame_len,
        channels,
        device_rate,
        pending: Vec::with_capacity(frame_len * 2),
    };

    match supported.sample_format() {
        SampleFormat::I16 => build_typed::<i16>(&device, &stream_config, framer),
        SampleFormat::U16 => build_typed::<u16>(&device, &stream_config, framer),
        SampleFormat::F32 => build_typed::<f32>(&device, &stream_config, framer),
        format => Err(DeviceError::Config(format!(
            "Unsupported sample format: {:?}",
            format
        ))),
    }
}

/// Prefer a config that runs natively at 24 kHz, otherwise the device default
fn select_config(device: &Device) -> Result<SupportedStreamConfig, DeviceError> {
    let native = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Config(e.to_string()))?
        .filter(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
        .max_by_key(|c| match c.sample_format() {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 1,
            _ => 0,
        });

    match native {
        Some(config) => Ok(config.with_sample_rate(cpal::SampleRate(SAMPLE_RATE))),
        None => device
            .default_input_config()
            .map_err(|e| DeviceError::Config(e.to_string())),
    }
}

/// Turns device callbacks into fixed-size 24 kHz mono frames
struct Framer {
    tx: mpsc::UnboundedSender<AudioFrame>,
    frame_len: usize,
    channels: usize,
    device_rate: u32,
    pending: Vec<u8>,
}

impl Framer {
    fn push<T>(&mut self, data: &[T])
    where
        T: Sample,
        f32: FromSample<T>,
    {
        // First channel only
        let mono: Vec<f32> = data
            .chunks(self.channels.max(1))
            .filter_map(|frame| frame.first().map(|s| f32::from_sample(*s)))
            .collect();

        for sample in resample_linear(&mono, self.device_rate, SAMPLE_RATE) {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            self.pending.extend_from_slice(&value.to_le_bytes());
        }

        while self.pending.len() >= self.frame_len {
            let rest = self.pending.split_off(self.frame_len);
            let frame = std::mem::replace(&mut self.pending, rest);
            if self.tx.send(AudioFrame::new(frame)).is_err() {
                self.pending.clear();
                return;
            }
        }
    }
}

fn build_typed<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    mut framer: Framer,
) -> Result<cpal::Stream, DeviceError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| framer.push(data),
            |err| log::error!("Audio capture stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::Stream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer(channels: usize, device_rate: u32) -> (Framer, mpsc::UnboundedReceiver<AudioFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Framer {
                tx,
                frame_len: 960,
                channels,
                device_rate,
                pending: Vec::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_framer_emits_fixed_frames() {
        let (mut framer, mut rx) = framer(1, SAMPLE_RATE);
        framer.push(&vec![0.25f32; 700]);
        framer.push(&vec![0.25f32; 300]);

        // 1000 samples = 2000 bytes = two full frames plus change
        assert_eq!(rx.try_recv().unwrap().len(), 960);
        assert_eq!(rx.try_recv().unwrap().len(), 960);
        assert!(rx.try_recv().is_err());
        assert_eq!(framer.pending.len(), 80);
    }

    #[test]
    fn test_framer_takes_first_channel_and_resamples() {
        let (mut framer, mut rx) = framer(2, 48_000);
        // Stereo 48 kHz: left at full scale, right silent
        let mut data = Vec::new();
        for _ in 0..960 {
            data.push(i16::MAX);
            data.push(0i16);
        }
        framer.push(&data);

        let frame = rx.try_recv().unwrap();
        let first = i16::from_le_bytes([frame.as_bytes()[0], frame.as_bytes()[1]]);
        assert!(first > 30_000);
    }

    #[test]
    #[cfg_attr(not(feature = "test-audio"), ignore)]
    fn test_open_default_input() {
        match CpalCapture::open(960) {
            Ok(_capture) => {}
            Err(e) => log::warn!(
                "Audio device not available in test environment - this is expected: {}",
                e
            ),
        }
    }
}
