//! Moves audio between the devices and the session for as long as it is
//! active: microphone frames up as append intents, agent audio down to the
//! speaker.

use super::{AudioFrame, AudioSink, AudioSource};
use crate::realtime::{Intent, IntentSender, SessionError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_DEPTH: usize = 8;
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Where captured frames go
#[async_trait]
pub trait AudioUplink: Send + Sync {
    async fn append(&self, frame: AudioFrame) -> Result<(), SessionError>;
}

#[async_trait]
impl AudioUplink for IntentSender {
    async fn append(&self, frame: AudioFrame) -> Result<(), SessionError> {
        self.send(&Intent::AppendAudio(frame)).await
    }
}

#[derive(Debug, Default)]
pub struct PumpStats {
    frames_captured: AtomicUsize,
    frames_sent: AtomicUsize,
    frames_played: AtomicUsize,
}

impl PumpStats {
    pub fn frames_captured(&self) -> usize {
        self.frames_captured.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }

    pub fn frames_played(&self) -> usize {
        self.frames_played.load(Ordering::SeqCst)
    }
}

pub struct AudioPump {
    stop: CancellationToken,
    uplink_failed: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    playback_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    sink: Arc<dyn AudioSink>,
    stats: Arc<PumpStats>,
    stopped: bool,
}

impl AudioPump {
    /// Spawn the capture, uplink and playback tasks
    pub fn start(
        source: Box<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
        uplink: Arc<dyn AudioUplink>,
        queue_depth: usize,
    ) -> Self {
        let stop = CancellationToken::new();
        let uplink_failed = CancellationToken::new();
        let stats = Arc::new(PumpStats::default());
        let source = Arc::new(Mutex::new(source));

        let (frame_tx, frame_rx) = mpsc::channel(queue_depth.max(2));
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            (
                "capture",
                tokio::spawn(capture_loop(
                    Arc::clone(&source),
                    frame_tx,
                    stop.clone(),
                    Arc::clone(&stats),
                )),
            ),
            (
                "uplink",
                tokio::spawn(uplink_loop(
                    frame_rx,
                    uplink,
                    stop.clone(),
                    uplink_failed.clone(),
                    Arc::clone(&stats),
                )),
            ),
            (
                "playback",
                tokio::spawn(playback_loop(
                    playback_rx,
                    Arc::clone(&sink),
                    stop.clone(),
                    Arc::clone(&stats),
                )),
            ),
        ];

        log::info!("🎙️ Audio pump started (queue depth {})", queue_depth.max(2));
        Self {
            stop,
            uplink_failed,
            tasks,
            playback_tx: Some(playback_tx),
            source,
            sink,
            stats,
            stopped: false,
        }
    }

    /// Queue agent audio for playback. False once the pump is stopping.
    pub fn play(&self, audio: Vec<u8>) -> bool {
        self.playback_tx
            .as_ref()
            .map(|tx| tx.send(audio).is_ok())
            .unwrap_or(false)
    }

    /// Cancelled when a captured frame could not be written to the session
    pub fn uplink_failed(&self) -> CancellationToken {
        self.uplink_failed.clone()
    }

    pub fn stats(&self) -> Arc<PumpStats> {
        Arc::clone(&self.stats)
    }

    /// Signal the loops, wait for them with a bound, abort stragglers and
    /// release both devices. A second call does nothing.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop.cancel();
        self.playback_tx = None;

        for (name, handle) in self.tasks.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => log::error!("Audio {} task failed: {}", name, e),
                Err(_) => {
                    log::warn!("Audio {} task did not stop within {:?}, aborting", name, STOP_TIMEOUT);
                    abort.abort();
                }
            }
        }

        if let Err(e) = self.source.lock().await.close().await {
            log::warn!("Failed to release capture device: {}", e);
        }
        if let Err(e) = self.sink.stop().await {
            log::warn!("Failed to release playback device: {}", e);
        }

        log::info!(
            "🔇 Audio pump stopped ({} frames captured, {} sent, {} chunks played)",
            self.stats.frames_captured(),
            self.stats.frames_sent(),
            self.stats.frames_played()
        );
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        if !self.stopped {
            self.stop.cancel();
            for (_, handle) in &self.tasks {
                handle.abort();
            }
        }
    }
}

async fn capture_loop(
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    frames: mpsc::Sender<AudioFrame>,
    stop: CancellationToken,
    stats: Arc<PumpStats>,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = async { source.lock().await.read_frame().await } => read,
        };

        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("🎤 Capture source ended");
                break;
            }
            Err(e) => {
                log::error!("🎤 Capture failed: {}", e);
                break;
            }
        };
        stats.frames_captured.fetch_add(1, Ordering::SeqCst);

        // Blocks while the queue is full
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = frames.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    log::debug!("Capture loop finished");
}

async fn uplink_loop(
    mut frames: mpsc::Receiver<AudioFrame>,
    uplink: Arc<dyn AudioUplink>,
    stop: CancellationToken,
    failed: CancellationToken,
    stats: Arc<PumpStats>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = uplink.append(frame).await {
            log::error!("📤 Failed to send audio frame: {}", e);
            failed.cancel();
            break;
        }
        stats.frames_sent.fetch_add(1, Ordering::SeqCst);
    }
    log::debug!("Uplink loop finished");
}

async fn playback_loop(
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    sink: Arc<dyn AudioSink>,
    stop: CancellationToken,
    stats: Arc<PumpStats>,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        // Not raced against the stop signal so an in-flight write completes
        match sink.write(&chunk).await {
            Ok(()) => {
                stats.frames_played.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => log::warn!("🔊 Playback write failed: {}", e),
        }
    }
    log::debug!("Playback loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioDevices, MemoryDevices};
    use std::sync::Mutex as StdMutex;

    /// Records appended frames; optionally fails from the nth frame on
    #[derive(Default)]
    struct RecordingUplink {
        frames: StdMutex<Vec<AudioFrame>>,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl AudioUplink for RecordingUplink {
        async fn append(&self, frame: AudioFrame) -> Result<(), SessionError> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_from.is_some_and(|n| frames.len() >= n) {
                return Err(SessionError::Transport("socket gone".to_string()));
            }
            frames.push(frame);
            Ok(())
        }
    }

    fn numbered_frames(count: u8) -> Vec<AudioFrame> {
        (0..count).map(|i| AudioFrame::new(vec![i; 960])).collect()
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let devices = MemoryDevices::new(numbered_frames(10));
        let (source, sink) = devices.open().await.unwrap();
        let uplink = Arc::new(RecordingUplink::default());

        let mut pump = AudioPump::start(source, sink, uplink.clone(), 2);
        // Source ends after ten frames; give the uplink time to drain
        for _ in 0..100 {
            if pump.stats().frames_sent() == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pump.stop().await;

        let sent = uplink.frames.lock().unwrap();
        assert_eq!(sent.len(), 10);
        for (i, frame) in sent.iter().enumerate() {
            assert_eq!(frame.as_bytes()[0], i as u8);
        }
    }

    #[tokio::test]
    async fn test_playback_keeps_arrival_order() {
        let devices = MemoryDevices::silent();
        let (source, sink) = devices.open().await.unwrap();
        let mut pump = AudioPump::start(source, sink, Arc::new(RecordingUplink::default()), 8);

        for i in 0..5u8 {
            assert!(pump.play(vec![i, i]));
        }
        for _ in 0..100 {
            if pump.stats().frames_played() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pump.stop().await;

        let played = devices.log().played();
        assert_eq!(played, (0..5u8).map(|i| vec![i, i]).collect::<Vec<_>>());
        assert!(!pump.play(vec![9]));
    }

    #[tokio::test]
    async fn test_stop_releases_devices_once() {
        let devices = MemoryDevices::silent();
        let (source, sink) = devices.open().await.unwrap();
        let mut pump = AudioPump::start(source, sink, Arc::new(RecordingUplink::default()), 8);

        pump.stop().await;
        pump.stop().await;

        let log = devices.log();
        assert_eq!(log.source_close_count(), 1);
        assert_eq!(log.sink_stop_count(), 1);
    }

    #[tokio::test]
    async fn test_uplink_failure_is_signalled() {
        let devices = MemoryDevices::new(numbered_frames(5));
        let (source, sink) = devices.open().await.unwrap();
        let uplink = Arc::new(RecordingUplink {
            frames: StdMutex::new(Vec::new()),
            fail_from: Some(2),
        });

        let mut pump = AudioPump::start(source, sink, uplink, 8);
        tokio::time::timeout(Duration::from_secs(1), pump.uplink_failed().cancelled())
            .await
            .expect("uplink failure should be signalled");
        assert_eq!(pump.stats().frames_sent(), 2);
        pump.stop().await;
    }
}
