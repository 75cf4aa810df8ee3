//! Client for the edge wakeword service.
//!
//! Frames are `[message_type: u8][payload_size: u32 LE][json payload]`. The
//! client subscribes once and then reads `WakewordEvent` frames.

use super::{WakeDetector, WakeError, WakeEvent};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

const SUBSCRIBE_WAKEWORD: u8 = 0x01;
const WAKEWORD_EVENT: u8 = 0x10;
const SUBSCRIBE_RESPONSE: u8 = 0x11;
const ERROR_RESPONSE: u8 = 0x13;

const HEADER_LEN: usize = 5;
const MAX_PAYLOAD: usize = 1024 * 1024;
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Frame {
    Wakeword(WakeEvent),
    SubscribeResponse { success: bool, message: String },
    Error(String),
    Other(u8),
}

fn encode_frame(message_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(message_type);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Connect to the first address that answers within `timeout`
fn open_stream(address: &str, timeout: Duration) -> Result<TcpStream, WakeError> {
    let timeout = timeout.max(Duration::from_millis(1));
    let mut last_error = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::debug!("Could not reach {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) => e.into(),
        None => WakeError::Protocol(format!("no address found for {}", address)),
    })
}

/// Take one complete frame off the front of `buffer`, if there is one
fn take_frame(buffer: &mut Vec<u8>) -> Result<Option<Frame>, WakeError> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }
    let message_type = buffer[0];
    let payload_size = u32::from_le_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
    if payload_size > MAX_PAYLOAD {
        return Err(WakeError::Protocol(format!(
            "invalid payload size: {}",
            payload_size
        )));
    }
    if buffer.len() < HEADER_LEN + payload_size {
        return Ok(None);
    }

    let frame: Vec<u8> = buffer.drain(..HEADER_LEN + payload_size).collect();
    let payload = &frame[HEADER_LEN..];

    let parsed = match message_type {
        WAKEWORD_EVENT => Frame::Wakeword(serde_json::from_slice(payload)?),
        SUBSCRIBE_RESPONSE => {
            let data: Value = serde_json::from_slice(payload)?;
            Frame::SubscribeResponse {
                success: data["success"].as_bool().unwrap_or(false),
                message: data["message"].as_str().unwrap_or("").to_string(),
            }
        }
        ERROR_RESPONSE => {
            let data: Value = serde_json::from_slice(payload)?;
            Frame::Error(data["error"].as_str().unwrap_or("Unknown error").to_string())
        }
        other => Frame::Other(other),
    };
    Ok(Some(parsed))
}

pub struct TcpWakeDetector {
    address: String,
    wake_word: String,
    stream: Option<TcpStream>,
    buffer: Vec<u8>,
}

impl TcpWakeDetector {
    /// Connect and subscribe. Only events whose model name contains
    /// `wake_word` count as detections; an empty `wake_word` accepts all.
    pub fn connect(address: &str, wake_word: &str) -> Result<Self, WakeError> {
        let mut detector = Self {
            address: address.to_string(),
            wake_word: wake_word.to_lowercase(),
            stream: None,
            buffer: Vec::new(),
        };
        detector.reconnect(CONNECT_TIMEOUT)?;
        Ok(detector)
    }

    fn reconnect(&mut self, timeout: Duration) -> Result<(), WakeError> {
        log::info!("📡 Connecting to wakeword server at {}", self.address);
        let stream = open_stream(&self.address, timeout)?;
        stream.set_write_timeout(Some(Duration::from_secs(10)))?;
        self.stream = Some(stream);
        self.buffer.clear();

        if let Err(e) = self.subscribe() {
            self.stream = None;
            return Err(e);
        }
        Ok(())
    }

    fn subscribe(&mut self) -> Result<(), WakeError> {
        let stream = self.stream.as_mut().ok_or(WakeError::Disconnected)?;
        stream.write_all(&encode_frame(SUBSCRIBE_WAKEWORD, &[]))?;
        stream.flush()?;
        log::debug!("📤 Sent SubscribeWakeword");

        let deadline = Instant::now() + SUBSCRIBE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WakeError::Subscribe("no response from server".to_string()));
            }
            match self.read_frame(remaining)? {
                Some(Frame::SubscribeResponse { success: true, .. }) => {
                    log::info!("🔔 Subscribed to wakeword events");
                    return Ok(());
                }
                Some(Frame::SubscribeResponse { message, .. }) => {
                    return Err(WakeError::Subscribe(message))
                }
                Some(Frame::Error(error)) => return Err(WakeError::Subscribe(error)),
                Some(other) => log::debug!("Ignoring {:?} while subscribing", other),
                None => {}
            }
        }
    }

    /// Read until one whole frame is buffered or `timeout` passes
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, WakeError> {
        if let Some(frame) = take_frame(&mut self.buffer)? {
            return Ok(Some(frame));
        }

        let stream = self.stream.as_mut().ok_or(WakeError::Disconnected)?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => {
                log::info!("🔌 Connection closed by wakeword server");
                self.stream = None;
                Err(WakeError::Disconnected)
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                take_frame(&mut self.buffer)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    /// Pull whatever is already on the socket into the buffer without waiting
    fn read_available(&mut self) -> Result<(), WakeError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.set_nonblocking(true)?;
        let mut chunk = [0u8; 4096];
        let read = loop {
            match stream.read(&mut chunk) {
                Ok(0) => break Err(WakeError::Disconnected),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => break Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        if read.is_err() {
            self.stream = None;
        }
        read
    }

    fn accepts(&self, event: &WakeEvent) -> bool {
        self.wake_word.is_empty() || event.model_name.to_lowercase().contains(&self.wake_word)
    }
}

impl WakeDetector for TcpWakeDetector {
    fn poll(&mut self, timeout: Duration) -> Result<Option<WakeEvent>, WakeError> {
        if self.stream.is_none() {
            self.reconnect(timeout)?;
        }

        match self.read_frame(timeout)? {
            Some(Frame::Wakeword(event)) if self.accepts(&event) => Ok(Some(event)),
            Some(Frame::Wakeword(event)) => {
                log::debug!("Ignoring wake word '{}'", event.model_name);
                Ok(None)
            }
            Some(Frame::Error(error)) => Err(WakeError::Protocol(error)),
            Some(other) => {
                log::warn!("⚠️ Unexpected message while reading events: {:?}", other);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Drop every complete frame that queued up while nobody was listening.
    /// A trailing partial frame stays buffered so framing is kept.
    fn reset(&mut self) -> Result<(), WakeError> {
        match self.read_available() {
            Ok(()) => {}
            Err(WakeError::Disconnected) => {
                log::info!("🔌 Wakeword server went away, reconnecting on next poll");
            }
            Err(e) => return Err(e),
        }

        let mut discarded = 0;
        while let Some(frame) = take_frame(&mut self.buffer)? {
            if let Frame::Wakeword(event) = frame {
                log::debug!("Discarding stale wake word '{}'", event.model_name);
                discarded += 1;
            }
        }
        if discarded > 0 {
            log::info!("🧹 Discarded {} stale wake word event(s)", discarded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use std::thread;

    fn wakeword_frame(model: &str) -> Vec<u8> {
        let payload = json!({
            "model_name": model,
            "confidence": 0.91,
            "timestamp": 1_700_000_000_000u64,
            "client_id": "edge-1"
        });
        encode_frame(WAKEWORD_EVENT, payload.to_string().as_bytes())
    }

    fn serve(events: Vec<Vec<u8>>) -> (String, thread::JoinHandle<()>) {
        serve_timed(events.into_iter().map(|e| (Duration::ZERO, e)).collect())
    }

    /// Accepts one client, answers the subscription and sends each frame
    /// after its pause
    fn serve_timed(events: Vec<(Duration, Vec<u8>)>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut header = [0u8; HEADER_LEN];
            socket.read_exact(&mut header).unwrap();
            assert_eq!(header, [SUBSCRIBE_WAKEWORD, 0, 0, 0, 0]);

            let response = json!({"success": true, "message": "subscribed"}).to_string();
            socket
                .write_all(&encode_frame(SUBSCRIBE_RESPONSE, response.as_bytes()))
                .unwrap();
            for (pause, event) in events {
                thread::sleep(pause);
                socket.write_all(&event).unwrap();
            }
            // Hold the connection until the client goes away
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest);
        });
        (address, handle)
    }

    #[test]
    fn test_take_frame_waits_for_whole_frame() {
        let frame = wakeword_frame("hey_jarvis");
        let mut buffer = frame[..7].to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(&frame[7..]);
        match take_frame(&mut buffer).unwrap() {
            Some(Frame::Wakeword(event)) => assert_eq!(event.model_name, "hey_jarvis"),
            other => panic!("Expected wakeword frame, got {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_frame_rejects_oversized_payload() {
        let mut buffer = vec![WAKEWORD_EVENT];
        buffer.extend_from_slice(&(2 * MAX_PAYLOAD as u32).to_le_bytes());
        assert!(matches!(
            take_frame(&mut buffer),
            Err(WakeError::Protocol(_))
        ));
    }

    #[test]
    fn test_detects_matching_wake_word() {
        let (address, server) = serve(vec![wakeword_frame("alexa"), wakeword_frame("hey_jarvis")]);
        let mut detector = TcpWakeDetector::connect(&address, "Jarvis").unwrap();

        let mut detected = None;
        for _ in 0..20 {
            if let Some(event) = detector.poll(Duration::from_millis(100)).unwrap() {
                detected = Some(event);
                break;
            }
        }
        assert_eq!(detected.unwrap().model_name, "hey_jarvis");

        drop(detector);
        server.join().unwrap();
    }

    #[test]
    fn test_poll_times_out_quietly() {
        let (address, server) = serve(Vec::new());
        let mut detector = TcpWakeDetector::connect(&address, "").unwrap();
        assert_eq!(detector.poll(Duration::from_millis(20)).unwrap(), None);

        drop(detector);
        server.join().unwrap();
    }

    #[test]
    fn test_reset_discards_events_heard_during_session() {
        let (address, server) = serve_timed(vec![
            (Duration::ZERO, wakeword_frame("hey_jarvis")),
            (Duration::ZERO, wakeword_frame("hey_jarvis")),
            (Duration::from_millis(300), wakeword_frame("hey_jarvis_v2")),
        ]);
        let mut detector = TcpWakeDetector::connect(&address, "jarvis").unwrap();

        // Both early events land while a session would be running
        thread::sleep(Duration::from_millis(100));
        detector.reset().unwrap();

        let mut detected = None;
        for _ in 0..20 {
            if let Some(event) = detector.poll(Duration::from_millis(100)).unwrap() {
                detected = Some(event);
                break;
            }
        }
        assert_eq!(detected.unwrap().model_name, "hey_jarvis_v2");

        drop(detector);
        server.join().unwrap();
    }

    #[test]
    fn test_reset_keeps_partial_frame() {
        let (address, server) = serve(Vec::new());
        let mut detector = TcpWakeDetector::connect(&address, "").unwrap();

        let frame = wakeword_frame("hey_jarvis");
        detector.buffer.extend_from_slice(&wakeword_frame("alexa"));
        detector.buffer.extend_from_slice(&frame[..6]);
        detector.reset().unwrap();
        assert_eq!(detector.buffer, frame[..6].to_vec());

        drop(detector);
        server.join().unwrap();
    }

    #[test]
    fn test_unreachable_host_gives_up_within_timeout() {
        let started = Instant::now();
        // Non-routable: either times out or fails at once without a network
        assert!(open_stream("10.255.255.1:9", Duration::from_millis(200)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(TcpWakeDetector::connect(&address, "jarvis").is_err());
    }
}
