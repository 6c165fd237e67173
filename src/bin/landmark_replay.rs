//! relay のランドマークポートに合成ポーズを送る
//! 基準 T ポーズの右前腕を振って送り続ける
//!
//! usage: landmark_replay [addr] [fps]

use anyhow::{Context, Result};
use nalgebra::{Point3, Rotation3, Vector3};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use avatar_relay::config::Config;
use avatar_relay::landmark::{reference_pose, Landmark, LandmarkFrame};

const CONFIG_PATH: &str = "config.toml";
const WAVE_HZ: f32 = 0.5;
const WAVE_AMPLITUDE: f32 = std::f32::consts::FRAC_PI_3;

fn waving(base: &LandmarkFrame, t: f32) -> LandmarkFrame {
    let mut frame = base.clone();
    let (Some(elbow), Some(wrist), Some(index)) = (
        base.get(Landmark::RightElbow),
        base.get(Landmark::RightWrist),
        base.get(Landmark::RightIndex),
    ) else {
        return frame;
    };
    let angle = WAVE_AMPLITUDE * (0.5 - 0.5 * (std::f32::consts::TAU * WAVE_HZ * t).cos());
    let rot = Rotation3::from_axis_angle(&Vector3::z_axis(), angle);
    let swing = |p: Point3<f32>| elbow + rot * (p - elbow);
    frame.set(Landmark::RightWrist, swing(wrist));
    frame.set(Landmark::RightIndex, swing(index));
    frame
}

fn main() -> Result<()> {
    let config = Config::load_or_default(CONFIG_PATH);
    let mut args = std::env::args().skip(1);
    let addr = args
        .next()
        .unwrap_or_else(|| config.landmarks.listen_addr.replace("0.0.0.0", "127.0.0.1"));
    let fps: f64 = match args.next() {
        Some(s) => s.parse().with_context(|| format!("invalid fps {s:?}"))?,
        None => 30.0,
    };
    anyhow::ensure!(fps > 0.0, "fps must be positive");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    println!("Landmark Replay");
    println!("target: {}  rate: {}fps  flip_y: {}", addr, fps, config.landmarks.flip_y);
    println!("Ctrl+C で終了");

    let base = reference_pose();
    let frame_duration = Duration::from_secs_f64(1.0 / fps);
    let start = Instant::now();
    let mut sent = 0u64;

    loop {
        let loop_start = Instant::now();
        let frame = waving(&base, start.elapsed().as_secs_f32());
        socket
            .send_to(frame.to_wire(config.landmarks.flip_y).as_bytes(), &addr)
            .with_context(|| format!("send to {addr} failed"))?;
        sent += 1;
        if sent % (fps.ceil() as u64 * 5).max(1) == 0 {
            println!("sent {} frames", sent);
        }

        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }
}
