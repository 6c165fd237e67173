use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::frame::StreamState;
use super::push::{FrameHeader, FrameSender};

/// パイプラインが読むオフスクリーン描画
pub trait FrameSource: Send {
    /// 指定サイズでオフスクリーンバッファに描画する
    fn render(&mut self, width: u32, height: u32) -> Result<()>;
    /// 最後に描画したバッファを読み戻す
    fn read_pixels(&mut self) -> Result<RgbImage>;
}

/// 動くカラーバー。ホストの描画の代わり
#[derive(Debug, Default)]
pub struct TestPattern {
    width: u32,
    height: u32,
    tick: u32,
}

impl FrameSource for TestPattern {
    fn render(&mut self, width: u32, height: u32) -> Result<()> {
        anyhow::ensure!(width > 0 && height > 0, "invalid render size {width}x{height}");
        self.width = width;
        self.height = height;
        self.tick = self.tick.wrapping_add(1);
        Ok(())
    }

    fn read_pixels(&mut self) -> Result<RgbImage> {
        anyhow::ensure!(self.width > 0, "read_pixels before render");
        let shift = self.tick.wrapping_mul(4);
        let (w, h) = (self.width, self.height);
        Ok(RgbImage::from_fn(w, h, |x, y| {
            let band = (x.wrapping_add(shift) % w) * 8 / w;
            let v = (255 * y / h) as u8;
            Rgb([
                if band & 1 != 0 { 255 } else { v },
                if band & 2 != 0 { 255 } else { v / 2 },
                if band & 4 != 0 { 255 } else { 0 },
            ])
        }))
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode_image(image).context("JPEG encode failed")?;
    }
    Ok(out)
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish().context("gzip failed")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Published {
        frame_number: u64,
        size: usize,
        pushed: bool,
    },
    /// 別のキャプチャが実行中だった
    Skipped,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 描画 → 読み戻し → エンコード → (gzip) → 公開。同時に1つまで
pub struct CapturePipeline {
    source: Mutex<Box<dyn FrameSource>>,
    state: Arc<StreamState>,
    busy: AtomicBool,
    debug_overlay: bool,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn FrameSource>, state: Arc<StreamState>, debug_overlay: bool) -> Self {
        Self {
            source: Mutex::new(source),
            state,
            busy: AtomicBool::new(false),
            debug_overlay,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn source(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 1回分のキャプチャ。実行中に呼ばれたら待たずに捨てる
    pub async fn capture(&self, push: Option<&FrameSender>) -> Result<CaptureOutcome> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(CaptureOutcome::Skipped);
        }
        let _busy = BusyGuard(&self.busy);

        let (width, height) = self.state.resolution();
        self.source().render(width, height)?;
        // レンダリング完了を待ってから読み戻す
        tokio::task::yield_now().await;
        let pixels = self.source().read_pixels()?;

        let mut encoded = encode_jpeg(&pixels, self.state.quality())?;
        if self.state.gzip() {
            encoded = gzip(&encoded)?;
        }

        let frame = self.state.publish(Bytes::from(encoded), self.state.now());
        let size = frame.encoded.len();

        let mut pushed = false;
        if let Some(sender) = push.filter(|s| s.is_ready()) {
            let header = FrameHeader::new(
                &frame,
                self.state.resolution_label(),
                self.state.compression_label(),
            );
            pushed = sender.send_frame(serde_json::to_string(&header)?, frame.encoded.clone());
        }

        if self.debug_overlay && frame.frame_number % 30 == 0 {
            tracing::info!(
                "capture: frame {} ({} bytes, pushed={}) | HTTP requests: {}",
                frame.frame_number,
                size,
                pushed,
                self.state.http_requests()
            );
        }

        Ok(CaptureOutcome::Published {
            frame_number: frame.frame_number,
            size,
            pushed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn small_state(gzip: bool) -> Arc<StreamState> {
        Arc::new(StreamState::new(&StreamConfig {
            width: 64,
            height: 36,
            gzip,
            ..StreamConfig::default()
        }))
    }

    /// render の呼び出し回数を数える
    struct Counting(Arc<std::sync::atomic::AtomicUsize>, TestPattern);

    impl FrameSource for Counting {
        fn render(&mut self, width: u32, height: u32) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1.render(width, height)
        }
        fn read_pixels(&mut self) -> Result<RgbImage> {
            self.1.read_pixels()
        }
    }

    #[test]
    fn test_encode_jpeg_magic() {
        let mut p = TestPattern::default();
        p.render(32, 16).unwrap();
        let jpeg = encode_jpeg(&p.read_pixels().unwrap(), 70).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"frame bytes frame bytes frame bytes".to_vec();
        let packed = gzip(&data).unwrap();
        let mut out = Vec::new();
        GzDecoder::new(&packed[..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_read_before_render_fails() {
        assert!(TestPattern::default().read_pixels().is_err());
    }

    #[tokio::test]
    async fn test_capture_publishes() {
        let state = small_state(false);
        let pipeline = CapturePipeline::new(Box::new(TestPattern::default()), state.clone(), false);
        let outcome = pipeline.capture(None).await.unwrap();
        assert!(matches!(
            outcome,
            CaptureOutcome::Published { frame_number: 1, pushed: false, .. }
        ));
        let frame = state.latest_frame().unwrap();
        assert_eq!(&frame.encoded[..2], &[0xFF, 0xD8]);
        assert!(!pipeline.is_busy());
    }

    #[tokio::test]
    async fn test_capture_gzip() {
        let state = small_state(true);
        let pipeline = CapturePipeline::new(Box::new(TestPattern::default()), state.clone(), false);
        pipeline.capture(None).await.unwrap();
        let frame = state.latest_frame().unwrap();
        assert_eq!(&frame.encoded[..2], &[0x1F, 0x8B]);
    }

    #[tokio::test]
    async fn test_overlapping_captures_run_once() {
        let renders = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let state = small_state(false);
        let pipeline = CapturePipeline::new(
            Box::new(Counting(renders.clone(), TestPattern::default())),
            state.clone(),
            false,
        );

        let (a, b) = tokio::join!(pipeline.capture(None), pipeline.capture(None));
        let outcomes = [a.unwrap(), b.unwrap()];
        let published = outcomes
            .iter()
            .filter(|o| matches!(o, CaptureOutcome::Published { .. }))
            .count();
        assert_eq!(published, 1);
        assert!(outcomes.contains(&CaptureOutcome::Skipped));
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert_eq!(state.frame_number(), 1);

        // 後で busy フラグは解放される
        pipeline.capture(None).await.unwrap();
        assert_eq!(state.frame_number(), 2);
    }

    #[tokio::test]
    async fn test_failed_render_releases_busy() {
        struct Broken;
        impl FrameSource for Broken {
            fn render(&mut self, _: u32, _: u32) -> Result<()> {
                anyhow::bail!("no camera")
            }
            fn read_pixels(&mut self) -> Result<RgbImage> {
                anyhow::bail!("no camera")
            }
        }
        let state = small_state(false);
        let pipeline = CapturePipeline::new(Box::new(Broken), state.clone(), false);
        assert!(pipeline.capture(None).await.is_err());
        assert!(!pipeline.is_busy());
        assert!(state.latest_frame().is_none());
    }
}
