use anyhow::Result;
use nalgebra::{UnitQuaternion, Vector3};

use crate::config::AvatarConfig;
use crate::landmark::LandmarkFrame;
use crate::skeleton::{Bone, Skeleton, Transform};

use super::calibration::{Calibration, CalibrationError};
use super::ground::{ground_offset, probe_offset, GroundProbe};
use super::math::{from_to_rotation, lerp_point, nlerp, slerp_direction};
use super::store::{CalibrationStore, StoredCalibration};

/// 背骨チェーンと体の傾きの追従速度 (1/s)
const SPINE_DAMPING: f32 = 10.0;
/// root 高さの追従速度 (1/s)
const GROUND_DAMPING: f32 = 5.0;
/// 腰・背骨の動きのうちチェーンに入れる割合
const SPINE_BLEND: f32 = 0.25;
/// 傾き方向の縦成分の割合
const LEAN_VERTICAL: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 未キャリブレーション。リグは元のポーズのまま
    Uncalibrated,
    /// 新しいランドマークなし。直前のポーズを保持
    Stale,
    Applied,
}

/// トラッキングした方向を毎tickスケルトンに反映する
pub struct RetargetEngine {
    skeleton: Skeleton,
    calibration: Option<Calibration>,
    initial_root: Transform,
    foot_tracking: bool,
    foot_ground_offset: f32,
    probe_distance: f32,
}

impl RetargetEngine {
    pub fn new(skeleton: Skeleton, config: &AvatarConfig) -> Self {
        let initial_root = *skeleton.root();
        Self {
            skeleton,
            calibration: None,
            initial_root,
            foot_tracking: config.foot_tracking,
            foot_ground_offset: config.foot_ground_offset,
            probe_distance: config.probe_distance,
        }
    }

    pub fn skeleton(&self) -> &Skeleton {
        &self.skeleton
    }

    pub fn calibration(&self) -> Option<&Calibration> {
        self.calibration.as_ref()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// 現在のスケルトンのポーズでライブキャリブレーション
    /// 失敗したら前のキャリブレーションを残す
    pub fn calibrate(&mut self, frame: &LandmarkFrame) -> Result<(), CalibrationError> {
        let calibration = Calibration::capture_live(&self.skeleton, frame, self.foot_tracking)?;
        self.install(calibration);
        tracing::info!("retarget: calibrated {} bones from live pose", self.bone_count());
        Ok(())
    }

    /// 保存済みキャリブレーションから復元
    pub fn calibrate_from_stored(&mut self, store: &dyn CalibrationStore) -> Result<()> {
        let stored = store.load()?;
        let calibration = stored.reconstruct(&self.skeleton)?;
        self.install(calibration);
        tracing::info!(
            "retarget: restored {} bones from {}",
            self.bone_count(),
            store.describe()
        );
        Ok(())
    }

    /// 現在のキャリブレーションを保存。保存先なし・書き込み失敗はログのみ
    pub fn store_calibration(&self, store: Option<&mut dyn CalibrationStore>) -> bool {
        let Some(store) = store else {
            tracing::error!("retarget: no calibration store configured, nothing saved");
            return false;
        };
        let Some(calibration) = self.calibration.as_ref() else {
            tracing::warn!("retarget: not calibrated, nothing to store");
            return false;
        };
        match store.save(&StoredCalibration::from(calibration)) {
            Ok(()) => {
                tracing::info!("retarget: calibration saved to {}", store.describe());
                true
            }
            Err(e) => {
                tracing::error!("retarget: failed to save calibration: {e:#}");
                false
            }
        }
    }

    fn install(&mut self, calibration: Calibration) {
        // ホスト側アニメーションと同じ Transform を奪い合わないよう停止
        self.skeleton.disable_animation();
        self.calibration = Some(calibration);
    }

    fn bone_count(&self) -> usize {
        self.calibration.as_ref().map_or(0, |c| c.bones.len())
    }

    pub fn tick(
        &mut self,
        frame: Option<&LandmarkFrame>,
        dt: f32,
        ground: &dyn GroundProbe,
    ) -> TickOutcome {
        if !self.is_calibrated() {
            return TickOutcome::Uncalibrated;
        }
        let Some(frame) = frame else {
            return TickOutcome::Stale;
        };

        self.clamp_to_ground(dt, ground);
        self.apply_bones(frame);
        self.apply_spine_and_lean(frame, dt);
        TickOutcome::Applied
    }

    fn clamp_to_ground(&mut self, dt: f32, ground: &dyn GroundProbe) {
        let left = probe_offset(
            ground,
            self.skeleton.world_position(Bone::LeftFoot),
            self.probe_distance,
        );
        let right = probe_offset(
            ground,
            self.skeleton.world_position(Bone::RightFoot),
            self.probe_distance,
        );
        let offset = ground_offset(left, right);

        let target = self.initial_root.position
            + Vector3::y() * (offset + self.foot_ground_offset);
        let position = lerp_point(&self.skeleton.root().position, &target, dt * GROUND_DAMPING);
        self.skeleton.set_root_position(position);
    }

    fn apply_bones(&mut self, frame: &LandmarkFrame) {
        let Some(calibration) = self.calibration.as_ref() else {
            return;
        };
        // BTreeMap の順序 = 親が先
        for (&bone, record) in &calibration.bones {
            if let Some(target) = record.target_rotation(frame) {
                self.skeleton.set_world_rotation(bone, target);
            }
        }
    }

    fn apply_spine_and_lean(&mut self, frame: &LandmarkFrame, dt: f32) {
        let Some(spine) = self.calibration.as_ref().map(|c| c.spine.clone()) else {
            return;
        };
        let (Some(twist_dir), Some(updown_dir), Some(head_dir)) = (
            spine.hips_twist.current_direction(frame),
            spine.spine_up_down.current_direction(frame),
            spine.head.current_direction(frame),
        ) else {
            return;
        };

        let twist_init = spine.hips_twist.initial_direction;
        let updown_init = spine.spine_up_down.initial_direction;

        let twist_blend = slerp_direction(&twist_init, &twist_dir, SPINE_BLEND);
        let twist = from_to_rotation(&twist_init, &twist_blend);
        let updown = from_to_rotation(
            &updown_init,
            &slerp_direction(&updown_init, &updown_dir, SPINE_BLEND),
        );
        let head = from_to_rotation(&spine.head.initial_direction, &head_dir);

        let hips = updown * updown * updown * twist * twist;
        let chain = hips * twist * updown;
        let chest = chain * twist * twist;

        let rate = dt * SPINE_DAMPING;
        self.smooth_toward(spine.hips_twist.owner, hips * spine.hips_twist.initial_rotation, rate);
        self.smooth_toward(
            spine.spine_up_down.owner,
            chain * spine.spine_up_down.initial_rotation,
            rate,
        );
        self.smooth_toward(spine.chest.owner, chest * spine.chest.initial_rotation, rate);
        self.smooth_toward(
            spine.head.owner,
            updown * twist * head * spine.head.initial_rotation,
            rate,
        );

        // 腰の向きで全体を少し回す
        let mut lean = twist_blend.into_inner();
        lean.y *= LEAN_VERTICAL;
        let target = from_to_rotation(&twist_init, &lean) * self.initial_root.rotation;
        let rotation = nlerp(&self.skeleton.root().rotation, &target, rate);
        self.skeleton.set_root_rotation(rotation);
    }

    fn smooth_toward(&mut self, bone: Bone, target: UnitQuaternion<f32>, rate: f32) {
        if let Some(current) = self.skeleton.world_rotation(bone) {
            self.skeleton
                .set_world_rotation(bone, nlerp(&current, &target, rate));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::{reference_pose, Landmark};
    use crate::retarget::ground::FlatGround;
    use crate::retarget::store::JsonCalibrationStore;
    use nalgebra::Point3;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_8};

    fn engine() -> RetargetEngine {
        RetargetEngine::new(
            Skeleton::humanoid(Transform::identity()),
            &AvatarConfig::default(),
        )
    }

    fn calibrated() -> RetargetEngine {
        let mut e = engine();
        e.calibrate(&reference_pose()).unwrap();
        e
    }

    /// 足から `left`/`right` だけ上下した位置を返すプローブ
    struct FixedOffsets {
        left: f32,
        right: f32,
    }

    impl GroundProbe for FixedOffsets {
        fn cast_down(&self, origin: &Point3<f32>, _max: f32) -> Option<Point3<f32>> {
            let off = if origin.x < 0.0 { self.left } else { self.right };
            Some(Point3::new(origin.x, origin.y + off, origin.z))
        }
    }

    #[test]
    fn test_uncalibrated_skips() {
        let mut e = engine();
        let before = *e.skeleton().root();
        let outcome = e.tick(Some(&reference_pose()), 0.1, &FlatGround::new(0.0));
        assert_eq!(outcome, TickOutcome::Uncalibrated);
        assert_eq!(*e.skeleton().root(), before);
        assert!(e.skeleton().animation_enabled());
    }

    #[test]
    fn test_calibration_disables_animation() {
        let e = calibrated();
        assert!(e.is_calibrated());
        assert!(!e.skeleton().animation_enabled());
    }

    #[test]
    fn test_unchanged_direction_keeps_initial_rotation() {
        let mut e = calibrated();
        let frame = reference_pose();
        assert_eq!(e.tick(Some(&frame), 1.0 / 60.0, &FlatGround::new(0.0)), TickOutcome::Applied);

        let calibration = e.calibration().unwrap().clone();
        for (bone, record) in &calibration.bones {
            let rot = e.skeleton().world_rotation(*bone).unwrap();
            assert!(rot.angle_to(&record.initial_rotation) < 1e-4, "{bone:?}");
        }
        assert!(e.skeleton().root().rotation.angle() < 1e-5);
    }

    #[test]
    fn test_right_elbow_quarter_turn() {
        let mut e = calibrated();
        let initial = e.skeleton().world_rotation(Bone::RightLowerArm).unwrap();

        // 手首を肘まわりに90度 (+x → +z)
        let moved = reference_pose().with(Landmark::RightWrist, Point3::new(0.46, 1.40, 0.25));
        e.tick(Some(&moved), 1.0 / 60.0, &FlatGround::new(0.0));

        let rot = e.skeleton().world_rotation(Bone::RightLowerArm).unwrap();
        let delta = rot * initial.inverse();
        assert!((delta.angle() - FRAC_PI_2).abs() < 1e-4);
        assert!((delta * Vector3::x() - Vector3::z()).norm() < 1e-4);

        let hand = e.skeleton().world_position(Bone::RightHand).unwrap();
        let elbow = e.skeleton().world_position(Bone::RightLowerArm).unwrap();
        let dir = (hand - elbow).normalize();
        assert!((dir - Vector3::z()).norm() < 1e-4);
    }

    #[test]
    fn test_stale_frame_freezes_pose() {
        let mut e = calibrated();
        let moved = reference_pose().with(Landmark::RightWrist, Point3::new(0.46, 1.40, 0.25));
        e.tick(Some(&moved), 1.0 / 60.0, &FlatGround::new(0.0));
        let before = e.skeleton().clone();

        assert_eq!(e.tick(None, 1.0 / 60.0, &FlatGround::new(0.0)), TickOutcome::Stale);
        let after = e.skeleton();
        assert_eq!(after.root(), before.root());
        for bone in Bone::ALL {
            assert_eq!(after.world_rotation(bone), before.world_rotation(bone));
        }
    }

    #[test]
    fn test_ground_clamp() {
        let mut e = calibrated();
        // 足は y = 0.11、地面 0.0 → offset -0.11、foot_ground_offset 0.1
        e.tick(Some(&reference_pose()), 1.0, &FlatGround::new(0.0));
        assert!((e.skeleton().root().position.y - (-0.01)).abs() < 1e-5);
    }

    #[test]
    fn test_ground_clamp_is_damped() {
        let mut e = calibrated();
        e.tick(Some(&reference_pose()), 0.1, &FlatGround::new(0.0));
        // 5/s * 0.1s = -0.01 までの半分
        assert!((e.skeleton().root().position.y - (-0.005)).abs() < 1e-5);
    }

    #[test]
    fn test_ground_tie_keeps_left_foot() {
        let mut e = calibrated();
        let probe = FixedOffsets { left: 0.2, right: -0.2 };
        e.tick(Some(&reference_pose()), 1.0, &probe);
        assert!((e.skeleton().root().position.y - 0.3).abs() < 1e-5);

        let mut e = calibrated();
        let probe = FixedOffsets { left: 0.2, right: -0.15 };
        e.tick(Some(&reference_pose()), 1.0, &probe);
        assert!((e.skeleton().root().position.y - (-0.05)).abs() < 1e-5);
    }

    #[test]
    fn test_hip_twist_turns_chain_and_root() {
        let mut e = calibrated();
        // 腰の向きを y 軸まわりに90度
        let frame = reference_pose()
            .with(Landmark::RightHip, Point3::new(0.0, 0.95, 0.10))
            .with(Landmark::LeftHip, Point3::new(0.0, 0.95, -0.10));
        e.tick(Some(&frame), 1.0, &FlatGround::new(0.0));

        let root = e.skeleton().root().rotation;
        assert!((root.angle() - FRAC_PI_8).abs() < 1e-4);
        let axis = root.axis().unwrap();
        assert!(axis.y.abs() > 0.999);

        // hips: twist² (45°) をワールドで設定し、root の傾きで運ばれる
        let hips = e.skeleton().world_rotation(Bone::Hips).unwrap();
        assert!((hips.angle() - 3.0 * FRAC_PI_8).abs() < 1e-3);
    }

    #[test]
    fn test_spine_and_lean_are_damped() {
        let mut e = calibrated();
        let frame = reference_pose()
            .with(Landmark::RightHip, Point3::new(0.0, 0.95, 0.10))
            .with(Landmark::LeftHip, Point3::new(0.0, 0.95, -0.10));

        // rate 10/s * 0.05s = 目標角の半分
        e.tick(Some(&frame), 0.05, &FlatGround::new(0.0));
        let root = e.skeleton().root().rotation;
        assert!((root.angle() - FRAC_PI_8 / 2.0).abs() < 1e-4);
        // hips: twist² の半分 (π/8) に root の π/16 が乗る
        let hips = e.skeleton().world_rotation(Bone::Hips).unwrap();
        assert!((hips.angle() - 3.0 * FRAC_PI_8 / 2.0).abs() < 1e-3);

        // 次の tick で残りの半分
        e.tick(Some(&frame), 0.05, &FlatGround::new(0.0));
        let root = e.skeleton().root().rotation;
        assert!((root.angle() - 3.0 * FRAC_PI_8 / 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_store_without_target() {
        let e = calibrated();
        assert!(!e.store_calibration(None));
        assert!(!engine().store_calibration(None));
    }

    #[test]
    fn test_store_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCalibrationStore::new(dir.path().join("cal.json"));

        let e = calibrated();
        assert!(!engine().store_calibration(Some(&mut store)));
        assert!(e.store_calibration(Some(&mut store)));

        let mut restored = engine();
        restored.calibrate_from_stored(&store).unwrap();
        assert!(restored.is_calibrated());
        assert!(!restored.skeleton().animation_enabled());
        assert_eq!(
            restored.calibration().unwrap().bones.len(),
            e.calibration().unwrap().bones.len()
        );
    }

    #[test]
    fn test_failed_calibration_keeps_previous() {
        let mut e = calibrated();
        let before = e.calibration().unwrap().clone();
        assert!(e.calibrate(&LandmarkFrame::new()).is_err());
        assert_eq!(e.calibration().unwrap(), &before);
    }
}
