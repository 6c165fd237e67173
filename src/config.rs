use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub avatar: AvatarConfig,
    #[serde(default)]
    pub landmarks: LandmarkConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// オフスクリーン描画の幅 (px)
    #[serde(default = "default_width")]
    pub width: u32,
    /// オフスクリーン描画の高さ (px)
    #[serde(default = "default_height")]
    pub height: u32,
    /// 配信中の1秒あたりキャプチャ数
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// ビューワ hub の WebSocket URL
    #[serde(default = "default_push_url")]
    pub push_url: String,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_true")]
    pub enable_pull_server: bool,
    #[serde(default = "default_pull_port")]
    pub pull_port: u16,
    /// JPEG品質。推奨 40-90、使用時に 10-100 にクランプ
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
    /// エンコード済み JPEG をさらに gzip する
    #[serde(default)]
    pub gzip: bool,
    /// 30フレームごとに進捗ログ
    #[serde(default = "default_true")]
    pub debug_overlay: bool,
    /// hub 未登録でもキャプチャする（pull サーバのみに供給）
    #[serde(default)]
    pub capture_without_push: bool,
}

fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_target_fps() -> u32 { 45 }
fn default_push_url() -> String { "ws://localhost:52780".to_string() }
fn default_pull_port() -> u16 { 52781 }
fn default_jpeg_quality() -> i32 { 70 }
fn default_true() -> bool { true }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            target_fps: default_target_fps(),
            push_url: default_push_url(),
            auto_connect: true,
            enable_pull_server: true,
            pull_port: default_pull_port(),
            jpeg_quality: default_jpeg_quality(),
            gzip: false,
            debug_overlay: true,
            capture_without_push: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AvatarConfig {
    /// 四肢に加えて足先 (ankle -> foot index) も動かす
    #[serde(default = "default_true")]
    pub foot_tracking: bool,
    /// 接地オフセットに足す高さ（メートル）
    #[serde(default = "default_foot_ground_offset")]
    pub foot_ground_offset: f32,
    /// 足から下向きに調べる最大距離（メートル）
    #[serde(default = "default_probe_distance")]
    pub probe_distance: f32,
    /// 平らな地面の高さ（メートル）
    #[serde(default)]
    pub ground_height: f32,
    /// キャリブレーション保存ファイル。未設定なら保存できない
    #[serde(default)]
    pub calibration_path: Option<String>,
    /// 起動時に `calibration_path` から復元する
    #[serde(default)]
    pub use_stored_calibration: bool,
}

fn default_foot_ground_offset() -> f32 { 0.1 }
fn default_probe_distance() -> f32 { 100.0 }

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            foot_tracking: true,
            foot_ground_offset: default_foot_ground_offset(),
            probe_distance: default_probe_distance(),
            ground_height: 0.0,
            calibration_path: None,
            use_stored_calibration: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LandmarkConfig {
    /// 姿勢推定側が送ってくる UDP アドレス
    #[serde(default = "default_landmark_addr")]
    pub listen_addr: String,
    /// これより古いフレームではリグを止める
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// 受信座標に掛ける倍率
    #[serde(default = "default_landmark_scale")]
    pub scale: f32,
    /// 推定側は y 下向きなので反転する
    #[serde(default = "default_true")]
    pub flip_y: bool,
}

fn default_landmark_addr() -> String { "0.0.0.0:52733".to_string() }
fn default_stale_after_ms() -> u64 { 500 }
fn default_landmark_scale() -> f32 { 1.0 }

impl Default for LandmarkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_landmark_addr(),
            stale_after_ms: default_stale_after_ms(),
            scale: default_landmark_scale(),
            flip_y: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// リグとキャプチャを回す1秒あたりの tick 数
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
}

fn default_tick_hz() -> u32 { 60 }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { tick_hz: default_tick_hz() }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// 設定ファイルがない・壊れている場合はデフォルト
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("config: {e:#}, using defaults");
                Self::default()
            }
        }
    }
}
