use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::config::StreamConfig;

/// これより古いフレームは返さない（秒）
pub const FRESHNESS_WINDOW: f64 = 5.0;

pub const MIN_QUALITY: i32 = 10;
pub const MAX_QUALITY: i32 = 100;

pub fn clamp_quality(quality: i32) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY) as u8
}

/// 公開済みのエンコード済みフレーム。キャプチャごとに丸ごと置き換える
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub encoded: Bytes,
    /// StreamState 作成からの秒数
    pub timestamp: f64,
    pub frame_number: u64,
}

impl FrameBuffer {
    pub fn age(&self, now: f64) -> f64 {
        now - self.timestamp
    }

    pub fn is_fresh(&self, now: f64) -> bool {
        self.age(now) < FRESHNESS_WINDOW
    }
}

/// 1秒以上の窓で測るレート
#[derive(Debug, Default, Clone)]
pub struct RateMeter {
    count: u32,
    elapsed: f32,
    rate: f32,
}

impl RateMeter {
    pub fn record(&mut self, dt: f32) {
        self.count += 1;
        self.elapsed += dt;
        if self.elapsed >= 1.0 {
            self.rate = self.count as f32 / self.elapsed;
            self.count = 0;
            self.elapsed = 0.0;
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

/// `GET /status` の本文
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub status: &'static str,
    pub unity_connected: bool,
    pub streaming: bool,
    pub last_frame: f64,
    pub frame_age: f64,
    pub frame_number: u64,
    pub fps: f32,
    pub http_requests: u64,
    pub resolution: String,
    pub quality: u8,
}

/// キャプチャ、push チャネル、pull サーバで共有する状態
pub struct StreamState {
    started: Instant,
    latest: Mutex<Option<FrameBuffer>>,
    frame_number: AtomicU64,
    connected: AtomicBool,
    registered: AtomicBool,
    streaming: AtomicBool,
    http_requests: AtomicU64,
    quality: AtomicU8,
    resolution: Mutex<(u32, u32)>,
    gzip: bool,
    target_fps: u32,
    rate: Mutex<RateMeter>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // 中身は常に丸ごと置き換えるので poison されても整合している
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl StreamState {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            started: Instant::now(),
            latest: Mutex::new(None),
            frame_number: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            http_requests: AtomicU64::new(0),
            quality: AtomicU8::new(clamp_quality(config.jpeg_quality)),
            resolution: Mutex::new((config.width, config.height)),
            gzip: config.gzip,
            target_fps: config.target_fps,
            rate: Mutex::new(RateMeter::default()),
        }
    }

    /// ストリーム時刻（秒）
    pub fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// 共有フレームを置き換える。番号は1から
    pub fn publish(&self, encoded: Bytes, timestamp: f64) -> FrameBuffer {
        let mut latest = lock(&self.latest);
        let frame_number = self.frame_number.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = FrameBuffer {
            encoded,
            timestamp,
            frame_number,
        };
        *latest = Some(frame.clone());
        frame
    }

    /// 最新フレームのコピー。ロックは返す前に解放
    pub fn latest_frame(&self) -> Option<FrameBuffer> {
        lock(&self.latest).clone()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    /// 適用した（クランプ後の）値を返す
    pub fn set_quality(&self, quality: i32) -> u8 {
        let q = clamp_quality(quality);
        self.quality.store(q, Ordering::Relaxed);
        q
    }

    pub fn resolution(&self) -> (u32, u32) {
        *lock(&self.resolution)
    }

    pub fn set_resolution(&self, width: u32, height: u32) {
        *lock(&self.resolution) = (width, height);
    }

    pub fn resolution_label(&self) -> String {
        let (w, h) = self.resolution();
        format!("{w}x{h}")
    }

    pub fn gzip(&self) -> bool {
        self.gzip
    }

    pub fn compression_label(&self) -> &'static str {
        if self.gzip {
            "gzip"
        } else {
            "none"
        }
    }

    pub fn target_fps(&self) -> u32 {
        self.target_fps
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn set_session_flags(&self, connected: bool, registered: bool, streaming: bool) {
        self.connected.store(connected, Ordering::Release);
        self.registered.store(registered, Ordering::Release);
        self.streaming.store(streaming, Ordering::Release);
    }

    /// リクエストを1件数えて合計を返す
    pub fn record_request(&self) -> u64 {
        self.http_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn http_requests(&self) -> u64 {
        self.http_requests.load(Ordering::Relaxed)
    }

    pub fn record_tick(&self, dt: f32) {
        lock(&self.rate).record(dt);
    }

    pub fn fps(&self) -> f32 {
        lock(&self.rate).rate()
    }

    pub fn status(&self, now: f64) -> StatusDocument {
        let latest = self.latest_frame();
        let online = latest.as_ref().is_some_and(|f| f.is_fresh(now));
        let last_frame = latest.as_ref().map_or(0.0, |f| f.timestamp);
        let frame_number = latest.as_ref().map_or(0, |f| f.frame_number);

        StatusDocument {
            status: if online { "online" } else { "offline" },
            unity_connected: self.is_connected(),
            streaming: self.is_streaming(),
            last_frame,
            frame_age: now - last_frame,
            frame_number,
            fps: self.fps(),
            http_requests: self.http_requests(),
            resolution: self.resolution_label(),
            quality: self.quality(),
        }
    }
}
