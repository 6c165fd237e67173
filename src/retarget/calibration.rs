use nalgebra::{Unit, UnitQuaternion, Vector3};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::landmark::{Landmark, LandmarkFrame, TrackedPoint};
use crate::skeleton::{Bone, Skeleton};

use super::math::{direction, from_to_rotation};

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("skeleton has no {0:?} bone")]
    MissingBone(Bone),
    #[error("landmark frame has no {0:?}")]
    MissingLandmark(TrackedPoint),
    #[error("{0:?} -> {1:?} has zero length")]
    DegenerateDirection(TrackedPoint, TrackedPoint),
    #[error("stored calibration has no bone records")]
    EmptyCollection,
    #[error("stored record for {0:?} is unusable (zero rotation or direction, or another owner)")]
    InvalidRecord(Bone),
    #[error("stored calibration lists {0:?} more than once")]
    DuplicateBone(Bone),
}

/// 1本の骨のキャリブレーション時の基準
///
/// `initial_rotation` は owner のワールド回転、`initial_direction` は
/// トラッキング origin→target の方向。どちらもキャリブレーション時の値
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub owner: Bone,
    pub child: Bone,
    pub initial_rotation: UnitQuaternion<f32>,
    pub initial_direction: Unit<Vector3<f32>>,
    pub tracked_origin: TrackedPoint,
    pub tracked_target: TrackedPoint,
}

impl CalibrationRecord {
    pub fn capture(
        skeleton: &Skeleton,
        owner: Bone,
        child: Bone,
        tracked_origin: impl Into<TrackedPoint>,
        tracked_target: impl Into<TrackedPoint>,
        frame: &LandmarkFrame,
    ) -> Result<Self, CalibrationError> {
        let tracked_origin = tracked_origin.into();
        let tracked_target = tracked_target.into();

        let initial_rotation = skeleton
            .world_rotation(owner)
            .ok_or(CalibrationError::MissingBone(owner))?;
        if !skeleton.contains(child) {
            return Err(CalibrationError::MissingBone(child));
        }

        let origin = frame
            .resolve(tracked_origin)
            .ok_or(CalibrationError::MissingLandmark(tracked_origin))?;
        let target = frame
            .resolve(tracked_target)
            .ok_or(CalibrationError::MissingLandmark(tracked_target))?;
        let initial_direction = direction(&origin, &target)
            .ok_or(CalibrationError::DegenerateDirection(tracked_origin, tracked_target))?;

        Ok(Self {
            owner,
            child,
            initial_rotation,
            initial_direction,
            tracked_origin,
            tracked_target,
        })
    }

    /// このフレームでの origin→target 方向。毎回計算し直す
    pub fn current_direction(&self, frame: &LandmarkFrame) -> Option<Unit<Vector3<f32>>> {
        let origin = frame.resolve(self.tracked_origin)?;
        let target = frame.resolve(self.tracked_target)?;
        direction(&origin, &target)
    }

    /// キャリブレーション時の方向を現在の方向へ回す回転
    pub fn delta_rotation(&self, frame: &LandmarkFrame) -> Option<UnitQuaternion<f32>> {
        let current = self.current_direction(frame)?;
        Some(from_to_rotation(&self.initial_direction, &current))
    }

    /// このフレームで owner が取るべきワールド回転
    pub fn target_rotation(&self, frame: &LandmarkFrame) -> Option<UnitQuaternion<f32>> {
        self.delta_rotation(frame).map(|delta| delta * self.initial_rotation)
    }
}

/// 直接ではなく重み付き合成で動かす胴体の4レコード
#[derive(Debug, Clone, PartialEq)]
pub struct SpineChain {
    pub spine_up_down: CalibrationRecord,
    pub hips_twist: CalibrationRecord,
    pub chest: CalibrationRecord,
    pub head: CalibrationRecord,
}

impl SpineChain {
    pub fn capture(skeleton: &Skeleton, frame: &LandmarkFrame) -> Result<Self, CalibrationError> {
        use Landmark::*;
        Ok(Self {
            spine_up_down: CalibrationRecord::capture(
                skeleton,
                Bone::Spine,
                Bone::Neck,
                TrackedPoint::VirtualHip,
                TrackedPoint::VirtualNeck,
                frame,
            )?,
            hips_twist: CalibrationRecord::capture(
                skeleton, Bone::Hips, Bone::Hips, RightHip, LeftHip, frame,
            )?,
            chest: CalibrationRecord::capture(
                skeleton, Bone::Chest, Bone::Chest, RightHip, LeftHip, frame,
            )?,
            head: CalibrationRecord::capture(
                skeleton,
                Bone::Neck,
                Bone::Head,
                TrackedPoint::VirtualNeck,
                Nose,
                frame,
            )?,
        })
    }
}

/// 直接動かす四肢のペア: (owner, child, origin, target)
const LIMB_PAIRS: [(Bone, Bone, Landmark, Landmark); 8] = [
    (Bone::RightUpperArm, Bone::RightLowerArm, Landmark::RightShoulder, Landmark::RightElbow),
    (Bone::RightLowerArm, Bone::RightHand, Landmark::RightElbow, Landmark::RightWrist),
    (Bone::RightUpperLeg, Bone::RightLowerLeg, Landmark::RightHip, Landmark::RightKnee),
    (Bone::RightLowerLeg, Bone::RightFoot, Landmark::RightKnee, Landmark::RightAnkle),
    (Bone::LeftUpperArm, Bone::LeftLowerArm, Landmark::LeftShoulder, Landmark::LeftElbow),
    (Bone::LeftLowerArm, Bone::LeftHand, Landmark::LeftElbow, Landmark::LeftWrist),
    (Bone::LeftUpperLeg, Bone::LeftLowerLeg, Landmark::LeftHip, Landmark::LeftKnee),
    (Bone::LeftLowerLeg, Bone::LeftFoot, Landmark::LeftKnee, Landmark::LeftAnkle),
];

const FOOT_PAIRS: [(Bone, Bone, Landmark, Landmark); 2] = [
    (Bone::LeftFoot, Bone::LeftToes, Landmark::LeftAnkle, Landmark::LeftFootIndex),
    (Bone::RightFoot, Bone::RightToes, Landmark::RightAnkle, Landmark::RightFootIndex),
];

/// キャリブレーション一式: 四肢の骨ごとに1レコード + 背骨チェーン
///
/// キャリブレーションのたびに丸ごと置き換える
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub bones: BTreeMap<Bone, CalibrationRecord>,
    pub spine: SpineChain,
}

impl Calibration {
    /// 現在のスケルトンのポーズとランドマークを基準として記録する
    pub fn capture_live(
        skeleton: &Skeleton,
        frame: &LandmarkFrame,
        foot_tracking: bool,
    ) -> Result<Self, CalibrationError> {
        let spine = SpineChain::capture(skeleton, frame)?;

        let pairs = LIMB_PAIRS
            .iter()
            .chain(FOOT_PAIRS.iter().filter(|_| foot_tracking));

        let mut bones = BTreeMap::new();
        for &(owner, child, origin, target) in pairs {
            let record = CalibrationRecord::capture(skeleton, owner, child, origin, target, frame)?;
            bones.insert(owner, record);
        }

        Ok(Self { bones, spine })
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }
}
