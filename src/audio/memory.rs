//! In-memory audio devices for loopback runs and tests

use super::{AudioDevices, AudioFrame, AudioSink, AudioSource, DeviceError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Counters shared by all handles opened from one [`MemoryDevices`]
#[derive(Debug, Default)]
pub struct DeviceLog {
    opened: AtomicUsize,
    source_closed: AtomicUsize,
    sink_stopped: AtomicUsize,
    played: Mutex<Vec<Vec<u8>>>,
}

impl DeviceLog {
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn source_close_count(&self) -> usize {
        self.source_closed.load(Ordering::SeqCst)
    }

    pub fn sink_stop_count(&self) -> usize {
        self.sink_stopped.load(Ordering::SeqCst)
    }

    /// Chunks written to the sink, in write order
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

/// Source that yields a fixed list of frames, optionally paced, then either
/// ends or stays silent until closed
pub struct MemorySource {
    frames: VecDeque<AudioFrame>,
    pacing: Option<Duration>,
    hold_open: bool,
    closed: bool,
    log: Arc<DeviceLog>,
}

#[async_trait]
impl AudioSource for MemorySource {
    async fn read_frame(&mut self) -> Result<Option<AudioFrame>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Released);
        }
        if let Some(pacing) = self.pacing {
            tokio::time::sleep(pacing).await;
        }
        match self.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            self.log.source_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Sink that records everything written to it
pub struct RecordingSink {
    stopped: AtomicBool,
    log: Arc<DeviceLog>,
}

impl RecordingSink {
    fn with_log(log: Arc<DeviceLog>) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            log,
        }
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&self, audio_data: &[u8]) -> Result<(), DeviceError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DeviceError::Released);
        }
        self.log
            .played
            .lock()
            .map_err(|e| DeviceError::Write(e.to_string()))?
            .push(audio_data.to_vec());
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.log.sink_stopped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Device pair backed by memory. Each `open` hands out a fresh source with
/// the configured frames.
pub struct MemoryDevices {
    frames: Vec<AudioFrame>,
    pacing: Option<Duration>,
    hold_open: bool,
    failure: Option<String>,
    log: Arc<DeviceLog>,
}

impl MemoryDevices {
    pub fn new(frames: Vec<AudioFrame>) -> Self {
        Self {
            frames,
            pacing: None,
            hold_open: false,
            failure: None,
            log: Arc::new(DeviceLog::default()),
        }
    }

    /// Microphone that never produces anything but stays open
    pub fn silent() -> Self {
        Self::new(Vec::new()).held_open()
    }

    /// Devices whose `open` always fails
    pub fn failing(reason: &str) -> Self {
        let mut devices = Self::new(Vec::new());
        devices.failure = Some(reason.to_string());
        devices
    }

    pub fn paced(mut self, interval: Duration) -> Self {
        self.pacing = Some(interval);
        self
    }

    /// Keep the source open after the last frame instead of ending it
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl AudioDevices for MemoryDevices {
    async fn open(&self) -> Result<(Box<dyn AudioSource>, Arc<dyn AudioSink>), DeviceError> {
        if let Some(reason) = &self.failure {
            return Err(DeviceError::Unavailable(reason.clone()));
        }
        self.log.opened.fetch_add(1, Ordering::SeqCst);

        let source = MemorySource {
            frames: self.frames.clone().into(),
            pacing: self.pacing,
            hold_open: self.hold_open,
            closed: false,
            log: Arc::clone(&self.log),
        };
        let sink = RecordingSink::with_log(Arc::clone(&self.log));
        Ok((Box::new(source), Arc::new(sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_devices_roundtrip() {
        let devices = MemoryDevices::new(vec![AudioFrame::new(vec![1, 2]), AudioFrame::new(vec![3, 4])]);
        let (mut source, sink) = devices.open().await.unwrap();

        assert_eq!(source.read_frame().await.unwrap(), Some(AudioFrame::new(vec![1, 2])));
        assert_eq!(source.read_frame().await.unwrap(), Some(AudioFrame::new(vec![3, 4])));
        assert_eq!(source.read_frame().await.unwrap(), None);

        sink.write(&[5, 6]).await.unwrap();
        sink.stop().await.unwrap();
        sink.stop().await.unwrap();
        assert!(sink.write(&[7]).await.is_err());

        source.close().await.unwrap();
        source.close().await.unwrap();

        let log = devices.log();
        assert_eq!(log.open_count(), 1);
        assert_eq!(log.played(), vec![vec![5, 6]]);
        assert_eq!(log.sink_stop_count(), 1);
        assert_eq!(log.source_close_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_devices() {
        let devices = MemoryDevices::failing("no microphone");
        assert!(matches!(
            devices.open().await,
            Err(DeviceError::Unavailable(_))
        ));
        assert_eq!(devices.log().open_count(), 0);
    }
}
