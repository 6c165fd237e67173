//! 表示tickごとに回す単一の協調スケジューラ
//!
//! 毎tick push チャネルのイベントを処理し、最新のランドマークでリグを動かし、
//! 間隔が経過していて実行中のキャプチャがなければ1回キャプチャを始める。

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::landmark::LandmarkReceiver;
use crate::retarget::{
    CalibrationStore, FlatGround, JsonCalibrationStore, RetargetEngine, TickOutcome,
};
use crate::skeleton::{Skeleton, Transform};
use crate::stream::{CapturePipeline, FrameSource, PullServer, PushChannel, StreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Calibrate,
    StoreCalibration,
    Reconnect,
    Quit,
}

impl Command {
    /// コンソール入力: c / s / r / q
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "c" => Some(Self::Calibrate),
            "s" => Some(Self::StoreCalibration),
            "r" => Some(Self::Reconnect),
            "q" => Some(Self::Quit),
            _ => None,
        }
    }
}

pub struct Runtime {
    config: Config,
    engine: RetargetEngine,
    ground: FlatGround,
    landmarks: Option<LandmarkReceiver>,
    store: Option<Box<dyn CalibrationStore>>,
    state: Arc<StreamState>,
    pipeline: Arc<CapturePipeline>,
    push: PushChannel,
    pull: Option<PullServer>,
    calibrate_flag: Arc<AtomicBool>,
    capture_interval: Duration,
    last_capture: Option<Instant>,
    last_outcome: Option<TickOutcome>,
}

impl Runtime {
    /// 全コンポーネントを作る。起動に失敗したものはログを出して無効のまま続行
    pub fn new(config: Config, source: Box<dyn FrameSource>) -> Self {
        let state = Arc::new(StreamState::new(&config.stream));
        let pipeline = Arc::new(CapturePipeline::new(
            source,
            Arc::clone(&state),
            config.stream.debug_overlay,
        ));
        let push = PushChannel::new(config.stream.push_url.clone(), Arc::clone(&state));

        let pull = if config.stream.enable_pull_server {
            match PullServer::start(config.stream.pull_port, Arc::clone(&state)) {
                Ok(server) => Some(server),
                Err(e) => {
                    tracing::error!("pull: {e:#}, pull server disabled");
                    None
                }
            }
        } else {
            None
        };

        let landmarks = match LandmarkReceiver::start(&config.landmarks) {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                tracing::error!("landmarks: {e:#}, tracking disabled");
                None
            }
        };

        let store: Option<Box<dyn CalibrationStore>> = config
            .avatar
            .calibration_path
            .as_ref()
            .map(|path| Box::new(JsonCalibrationStore::new(path)) as Box<dyn CalibrationStore>);

        let mut engine = RetargetEngine::new(
            Skeleton::humanoid(Transform::identity()),
            &config.avatar,
        );
        if config.avatar.use_stored_calibration {
            match store.as_deref() {
                Some(store) => {
                    if let Err(e) = engine.calibrate_from_stored(store) {
                        tracing::error!("retarget: stored calibration unusable: {e:#}");
                    }
                }
                None => tracing::error!("retarget: use_stored_calibration set without calibration_path"),
            }
        }

        let fps = config.stream.target_fps.max(1);
        Self {
            ground: FlatGround::new(config.avatar.ground_height),
            capture_interval: Duration::from_secs_f64(1.0 / fps as f64),
            config,
            engine,
            landmarks,
            store,
            state,
            pipeline,
            push,
            pull,
            calibrate_flag: Arc::new(AtomicBool::new(false)),
            last_capture: None,
            last_outcome: None,
        }
    }

    pub fn engine(&self) -> &RetargetEngine {
        &self.engine
    }

    pub fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    pub fn push(&mut self) -> &mut PushChannel {
        &mut self.push
    }

    pub fn landmark_addr(&self) -> Option<SocketAddr> {
        self.landmarks.as_ref().map(|l| l.local_addr())
    }

    pub fn pull_addr(&self) -> Option<SocketAddr> {
        self.pull.as_ref().map(|p| p.local_addr())
    }

    /// 毎tick確認するフラグ。立てるとライブキャリブレーション (SIGUSR1)
    pub fn calibrate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.calibrate_flag)
    }

    pub fn tick(&mut self, dt: f32) {
        self.push.dispatch();
        self.state.record_tick(dt);

        if self.calibrate_flag.swap(false, Ordering::AcqRel) {
            self.calibrate();
        }

        let max_age = Duration::from_millis(self.config.landmarks.stale_after_ms);
        let frame = self.landmarks.as_ref().and_then(|l| l.latest_fresh(max_age));
        let outcome = self.engine.tick(frame.as_ref(), dt, &self.ground);
        if self.last_outcome != Some(outcome) {
            tracing::debug!("retarget: {outcome:?}");
            self.last_outcome = Some(outcome);
        }

        if self.should_capture() {
            self.last_capture = Some(Instant::now());
            let pipeline = Arc::clone(&self.pipeline);
            let sender = self.push.sender();
            tokio::spawn(async move {
                if let Err(e) = pipeline.capture(sender.as_ref()).await {
                    tracing::error!("capture: {e:#}");
                }
            });
        }
    }

    fn should_capture(&self) -> bool {
        if self.pipeline.is_busy() {
            return false;
        }
        if self
            .last_capture
            .is_some_and(|t| t.elapsed() < self.capture_interval)
        {
            return false;
        }
        self.config.stream.capture_without_push
            || (self.state.is_connected() && self.state.is_registered() && self.state.is_streaming())
    }

    fn calibrate(&mut self) -> bool {
        let max_age = Duration::from_millis(self.config.landmarks.stale_after_ms);
        let Some(frame) = self.landmarks.as_ref().and_then(|l| l.latest_fresh(max_age)) else {
            tracing::warn!("retarget: no fresh landmarks, calibration skipped");
            return false;
        };
        match self.engine.calibrate(&frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("retarget: calibration failed: {e}");
                false
            }
        }
    }

    /// コマンドを1つ適用。ループを止めるべきなら false
    pub fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Calibrate => {
                self.calibrate();
            }
            Command::StoreCalibration => {
                let target: Option<&mut dyn CalibrationStore> = match self.store.as_mut() {
                    Some(store) => Some(&mut **store),
                    None => None,
                };
                self.engine.store_calibration(target);
            }
            Command::Reconnect => {
                self.push.disconnect();
                self.push.connect();
            }
            Command::Quit => return false,
        }
        true
    }

    /// `Quit` かコマンドチャネルが閉じるまで `runtime.tick_hz` で回す
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        if self.config.stream.auto_connect {
            self.push.connect();
        }

        let hz = self.config.runtime.tick_hz.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / hz as f64));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last).as_secs_f32();
                    last = now;
                    self.tick(dt);
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.push.disconnect();
        if let Some(mut pull) = self.pull.take() {
            pull.stop().await;
        }
        if let Some(mut landmarks) = self.landmarks.take() {
            landmarks.stop();
        }
        tracing::info!("runtime: stopped");
    }
}
