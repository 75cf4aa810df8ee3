use super::{AudioSink, DeviceError, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

enum AudioCommand {
    PlayAudio(Vec<u8>),
    Stop,
}

/// Speaker output through cpal. Incoming 24 kHz mono PCM16 is queued as f32
/// and interpolated to the device rate inside the output callback.
pub struct CpalPlayback {
    audio_sender: Sender<AudioCommand>,
    is_stopped: Arc<AtomicBool>,
    audio_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalPlayback {
    pub fn open() -> Result<Self, DeviceError> {
        log::debug!("Playback: opening default output device");
        let (audio_sender, audio_receiver) = channel();
        let (ready_tx, ready_rx) = channel::<Result<(), DeviceError>>();
        let is_stopped = Arc::new(AtomicBool::new(false));

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| DeviceError::Unavailable("No output device found".to_string()))?;
        log::debug!("Playback: using output device {:?}", device.name());

        let supported_config = device
            .default_output_config()
            .map_err(|e| DeviceError::Config(e.to_string()))?;
        log::debug!("Playback: using output config {:?}", supported_config);

        let output_sample_rate = supported_config.sample_rate().0;
        let output_channels = supported_config.channels() as usize;

        let samples_queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let samples_queue_clone = Arc::clone(&samples_queue);

        let audio_thread = thread::spawn(move || {
            let stream = match device.build_output_stream(
                &supported_config.config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut queue) = samples_queue_clone.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    fill_output(&mut queue, data, output_channels, output_sample_rate);
                },
                |err| log::error!("Playback: stream error: {}", err),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while let Ok(command) = audio_receiver.recv() {
                match command {
                    AudioCommand::PlayAudio(audio_data) => {
                        let Ok(mut queue) = samples_queue.lock() else {
                            break;
                        };
                        for chunk in audio_data.chunks_exact(2) {
                            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                            queue.push_back(sample as f32 / i16::MAX as f32);
                        }
                        log::trace!("Playback: {} samples queued", queue.len());
                    }
                    AudioCommand::Stop => {
                        log::debug!("Playback: received stop command");
                        break;
                    }
                }
            }

            log::debug!("Playback: audio thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                audio_sender,
                is_stopped,
                audio_thread: Mutex::new(Some(audio_thread)),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Unavailable(
                "playback thread exited during setup".to_string(),
            )),
        }
    }
}

/// Fill one output buffer from the queue, interpolating from 24 kHz to the
/// device rate and writing the same sample to every channel. Silence when
/// the queue runs dry.
fn fill_output(queue: &mut VecDeque<f32>, data: &mut [f32], channels: usize, output_rate: u32) {
    let step = SAMPLE_RATE as f32 / output_rate as f32;
    let mut position: f32 = 0.0;

    for frame in data.chunks_mut(channels.max(1)) {
        let floor = position.floor() as usize;
        let fract = position.fract();
        let sample = match (queue.get(floor), queue.get(floor + 1)) {
            (Some(a), Some(b)) => a * (1.0 - fract) + b * fract,
            (Some(a), None) => *a,
            _ => 0.0,
        };
        for channel in frame.iter_mut() {
            *channel = sample;
        }
        position += step;
    }

    let consumed = (position.floor() as usize).min(queue.len());
    queue.drain(..consumed);
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        if !self.is_stopped.swap(true, Ordering::AcqRel) {
            let _ = self.audio_sender.send(AudioCommand::Stop);
        }
        let thread = self.audio_thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            if thread.join().is_err() {
                log::error!("Playback: failed to join audio thread");
            }
        }
    }
}

#[async_trait::async_trait]
impl AudioSink for CpalPlayback {
    async fn write(&self, audio_data: &[u8]) -> Result<(), DeviceError> {
        if self.is_stopped.load(Ordering::Acquire) {
            return Err(DeviceError::Released);
        }
        self.audio_sender
            .send(AudioCommand::PlayAudio(audio_data.to_vec()))
            .map_err(|e| DeviceError::Write(e.to_string()))
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::debug!("Playback: stopping sink");
        self.audio_sender
            .send(AudioCommand::Stop)
            .map_err(|e| DeviceError::Write(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_output_upsamples_to_device_rate() {
        let mut queue: VecDeque<f32> = (0..10).map(|i| i as f32).collect();
        let mut data = vec![0.0f32; 8];

        // 48 kHz stereo: four frames consume two input samples
        fill_output(&mut queue, &mut data, 2, 48_000);
        assert_eq!(data, vec![0.0, 0.0, 0.5, 0.5, 1.0, 1.0, 1.5, 1.5]);
        assert_eq!(queue.front(), Some(&2.0));
    }

    #[test]
    fn test_fill_output_silence_when_empty() {
        let mut queue = VecDeque::new();
        let mut data = vec![1.0f32; 4];
        fill_output(&mut queue, &mut data, 1, 24_000);
        assert_eq!(data, vec![0.0; 4]);
    }

    #[tokio::test]
    #[cfg_attr(not(feature = "test-audio"), ignore)]
    async fn test_playback_write_and_stop() -> Result<(), DeviceError> {
        match CpalPlayback::open() {
            Ok(sink) => {
                let tone: Vec<u8> = (0..2400)
                    .flat_map(|i| {
                        let t = i as f32 / SAMPLE_RATE as f32;
                        let value = (2.0 * std::f32::consts::PI * 440.0 * t).sin();
                        ((value * i16::MAX as f32) as i16).to_le_bytes()
                    })
                    .collect();
                sink.write(&tone).await?;
                sink.stop().await?;
                assert!(sink.write(&tone).await.is_err());
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Audio device not available in test environment - this is expected: {}",
                    e
                );
                Ok(())
            }
        }
    }
}
