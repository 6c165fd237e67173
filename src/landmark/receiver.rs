use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::LandmarkConfig;

use super::LandmarkFrame;

const MAX_DATAGRAM: usize = 64 * 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

type Latest = Arc<Mutex<Option<(LandmarkFrame, Instant)>>>;

/// バックグラウンドスレッドでデータグラムを受けて最新フレームを保持する
pub struct LandmarkReceiver {
    latest: Latest,
    frame_count: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    handle: Option<thread::JoinHandle<()>>,
}

impl LandmarkReceiver {
    pub fn start(config: &LandmarkConfig) -> Result<Self> {
        let socket = UdpSocket::bind(&config.listen_addr)
            .with_context(|| format!("failed to bind landmark socket {}", config.listen_addr))?;
        socket.set_read_timeout(Some(POLL_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let latest: Latest = Arc::new(Mutex::new(None));
        let frame_count = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let latest_ref = Arc::clone(&latest);
        let count_ref = Arc::clone(&frame_count);
        let running_ref = Arc::clone(&running);
        let scale = config.scale;
        let flip_y = config.flip_y;

        let handle = thread::Builder::new()
            .name("landmarks".into())
            .spawn(move || {
                let mut buf = vec![0u8; MAX_DATAGRAM];
                while running_ref.load(Ordering::Relaxed) {
                    let (n, _peer) = match socket.recv_from(&mut buf) {
                        Ok(r) => r,
                        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("landmarks: receive error: {e}");
                            thread::sleep(Duration::from_millis(100));
                            continue;
                        }
                    };

                    let text = String::from_utf8_lossy(&buf[..n]);
                    if text.trim() == "PING" {
                        continue;
                    }
                    match LandmarkFrame::parse(&text, scale, flip_y) {
                        Ok(frame) => {
                            *latest_ref.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some((frame, Instant::now()));
                            count_ref.fetch_add(1, Ordering::Release);
                        }
                        Err(e) => tracing::debug!("landmarks: dropped datagram: {e}"),
                    }
                }
            })?;

        tracing::info!("landmarks: listening on {local_addr}");

        Ok(Self {
            latest,
            frame_count,
            running,
            local_addr,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// これまでに受信したフレーム数
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    /// `max_age` 以内に届いた最新フレーム。古ければ None
    pub fn latest_fresh(&self, max_age: Duration) -> Option<LandmarkFrame> {
        let guard = self.latest.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((frame, at)) if at.elapsed() <= max_age => Some(frame.clone()),
            _ => None,
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LandmarkReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::{reference_pose, Landmark};

    fn local_config() -> LandmarkConfig {
        LandmarkConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..LandmarkConfig::default()
        }
    }

    fn wait_for_frames(receiver: &LandmarkReceiver, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while receiver.frame_count() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_receives_frame() {
        let mut receiver = LandmarkReceiver::start(&local_config()).unwrap();
        assert!(receiver.latest_fresh(Duration::from_secs(1)).is_none());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"PING", receiver.local_addr()).unwrap();
        let wire = reference_pose().to_wire(true);
        sender.send_to(wire.as_bytes(), receiver.local_addr()).unwrap();

        wait_for_frames(&receiver, 1);
        assert_eq!(receiver.frame_count(), 1);
        let frame = receiver.latest_fresh(Duration::from_secs(1)).unwrap();
        let nose = frame.get(Landmark::Nose).unwrap();
        assert!((nose.y - 1.62).abs() < 1e-4);
        receiver.stop();
    }

    #[test]
    fn test_stale_frame_is_hidden() {
        let receiver = LandmarkReceiver::start(&local_config()).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"0|0|0|0<EOM>", receiver.local_addr()).unwrap();
        wait_for_frames(&receiver, 1);

        thread::sleep(Duration::from_millis(30));
        assert!(receiver.latest_fresh(Duration::from_millis(1)).is_none());
        assert!(receiver.latest_fresh(Duration::from_secs(5)).is_some());
    }
}
