use anyhow::{bail, Result};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// 姿勢推定側がデータグラム末尾に付ける終端
pub const END_OF_MESSAGE: &str = "<EOM>";

/// 姿勢推定の33点ランドマーク
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum Landmark {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl Landmark {
    pub const COUNT: usize = 33;

    pub const ALL: [Landmark; Self::COUNT] = [
        Self::Nose,
        Self::LeftEyeInner,
        Self::LeftEye,
        Self::LeftEyeOuter,
        Self::RightEyeInner,
        Self::RightEye,
        Self::RightEyeOuter,
        Self::LeftEar,
        Self::RightEar,
        Self::MouthLeft,
        Self::MouthRight,
        Self::LeftShoulder,
        Self::RightShoulder,
        Self::LeftElbow,
        Self::RightElbow,
        Self::LeftWrist,
        Self::RightWrist,
        Self::LeftPinky,
        Self::RightPinky,
        Self::LeftIndex,
        Self::RightIndex,
        Self::LeftThumb,
        Self::RightThumb,
        Self::LeftHip,
        Self::RightHip,
        Self::LeftKnee,
        Self::RightKnee,
        Self::LeftAnkle,
        Self::RightAnkle,
        Self::LeftHeel,
        Self::RightHeel,
        Self::LeftFootIndex,
        Self::RightFootIndex,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// リグが追う点: ランドマークそのもの、または2点から作る仮想点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedPoint {
    Landmark(Landmark),
    /// 左右の腰の中点
    VirtualHip,
    /// 左右の肩の中点
    VirtualNeck,
}

impl From<Landmark> for TrackedPoint {
    fn from(landmark: Landmark) -> Self {
        Self::Landmark(landmark)
    }
}

/// リグ座標系 (y 上) でのランドマーク位置の1スナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkFrame {
    points: [Option<Point3<f32>>; Landmark::COUNT],
}

impl Default for LandmarkFrame {
    fn default() -> Self {
        Self { points: [None; Landmark::COUNT] }
    }
}

impl LandmarkFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, landmark: Landmark) -> Option<Point3<f32>> {
        self.points[landmark as usize]
    }

    pub fn set(&mut self, landmark: Landmark, position: Point3<f32>) {
        self.points[landmark as usize] = Some(position);
    }

    pub fn with(mut self, landmark: Landmark, position: Point3<f32>) -> Self {
        self.set(landmark, position);
        self
    }

    pub fn len(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追跡点の位置。必要なランドマークが欠けていれば None
    pub fn resolve(&self, point: TrackedPoint) -> Option<Point3<f32>> {
        match point {
            TrackedPoint::Landmark(l) => self.get(l),
            TrackedPoint::VirtualHip => self.midpoint(Landmark::LeftHip, Landmark::RightHip),
            TrackedPoint::VirtualNeck => {
                self.midpoint(Landmark::LeftShoulder, Landmark::RightShoulder)
            }
        }
    }

    fn midpoint(&self, a: Landmark, b: Landmark) -> Option<Point3<f32>> {
        let a = self.get(a)?;
        let b = self.get(b)?;
        Some(nalgebra::center(&a, &b))
    }

    /// データグラム1つを読む: `index|x|y|z` の行、末尾に `<EOM>` があってもよい
    ///
    /// 不明なインデックスや数値にならない行は飛ばす
    pub fn parse(text: &str, scale: f32, flip_y: bool) -> Result<Self> {
        let body = text.trim_end().trim_end_matches(END_OF_MESSAGE);
        let mut frame = Self::new();

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((landmark, x, y, z)) = parse_line(line) {
                let y = if flip_y { -y } else { y };
                frame.set(landmark, Point3::new(x * scale, y * scale, z * scale));
            }
        }

        if frame.is_empty() {
            bail!("no landmarks in message ({} bytes)", text.len());
        }
        Ok(frame)
    }

    /// 推定側の送信形式に書き出す（scale 1 の [`LandmarkFrame::parse`] の逆）
    pub fn to_wire(&self, flip_y: bool) -> String {
        let mut out = String::new();
        for landmark in Landmark::ALL {
            if let Some(p) = self.get(landmark) {
                let y = if flip_y { -p.y } else { p.y };
                out.push_str(&format!(
                    "{}|{:.6}|{:.6}|{:.6}\n",
                    landmark as usize, p.x, y, p.z
                ));
            }
        }
        out.push_str(END_OF_MESSAGE);
        out
    }
}

fn parse_line(line: &str) -> Option<(Landmark, f32, f32, f32)> {
    let mut fields = line.split('|').map(str::trim);
    let index: usize = fields.next()?.parse().ok()?;
    let x: f32 = fields.next()?.parse().ok()?;
    let y: f32 = fields.next()?.parse().ok()?;
    let z: f32 = fields.next()?.parse().ok()?;
    Some((Landmark::from_index(index)?, x, y, z))
}

/// `Skeleton::humanoid` と同じ体格のリグ座標系 T ポーズ
///
/// +z 向き、右手側が +x、足は y = 0
pub fn reference_pose() -> LandmarkFrame {
    use Landmark::*;
    let p = Point3::new;
    LandmarkFrame::new()
        .with(Nose, p(0.0, 1.62, 0.08))
        .with(LeftEye, p(-0.03, 1.66, 0.07))
        .with(RightEye, p(0.03, 1.66, 0.07))
        .with(LeftEar, p(-0.07, 1.63, 0.0))
        .with(RightEar, p(0.07, 1.63, 0.0))
        .with(LeftShoulder, p(-0.18, 1.40, 0.0))
        .with(RightShoulder, p(0.18, 1.40, 0.0))
        .with(LeftElbow, p(-0.46, 1.40, 0.0))
        .with(RightElbow, p(0.46, 1.40, 0.0))
        .with(LeftWrist, p(-0.71, 1.40, 0.0))
        .with(RightWrist, p(0.71, 1.40, 0.0))
        .with(LeftIndex, p(-0.80, 1.40, 0.0))
        .with(RightIndex, p(0.80, 1.40, 0.0))
        .with(LeftHip, p(-0.10, 0.95, 0.0))
        .with(RightHip, p(0.10, 0.95, 0.0))
        .with(LeftKnee, p(-0.10, 0.53, 0.0))
        .with(RightKnee, p(0.10, 0.53, 0.0))
        .with(LeftAnkle, p(-0.10, 0.11, 0.0))
        .with(RightAnkle, p(0.10, 0.11, 0.0))
        .with(LeftHeel, p(-0.10, 0.05, -0.04))
        .with(RightHeel, p(0.10, 0.05, -0.04))
        .with(LeftFootIndex, p(-0.10, 0.03, 0.12))
        .with(RightFootIndex, p(0.10, 0.03, 0.12))
}
