use anyhow::{Context, Result};
use nalgebra::{Quaternion, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::landmark::TrackedPoint;
use crate::skeleton::{Bone, Skeleton};

use super::calibration::{Calibration, CalibrationError, CalibrationRecord, SpineChain};

const NORM_EPS: f32 = 1e-6;

// --- 保存形式 ---

/// [`CalibrationRecord`] の保存形式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub owner: Bone,
    pub child: Bone,
    /// [x, y, z, w]
    pub initial_rotation: [f32; 4],
    pub initial_direction: [f32; 3],
    pub tracked_origin: TrackedPoint,
    pub tracked_target: TrackedPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub bone: Bone,
    pub record: StoredRecord,
}

/// 保存されるキャリブレーション一式: 骨ごとの四肢レコード + 背骨チェーン
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCalibration {
    pub bones: Vec<StoredEntry>,
    pub spine_up_down: StoredRecord,
    pub hips_twist: StoredRecord,
    pub chest: StoredRecord,
    pub head: StoredRecord,
}

impl From<&CalibrationRecord> for StoredRecord {
    fn from(r: &CalibrationRecord) -> Self {
        let q = r.initial_rotation.quaternion();
        let d = r.initial_direction.into_inner();
        Self {
            owner: r.owner,
            child: r.child,
            initial_rotation: [q.i, q.j, q.k, q.w],
            initial_direction: [d.x, d.y, d.z],
            tracked_origin: r.tracked_origin,
            tracked_target: r.tracked_target,
        }
    }
}

impl From<&Calibration> for StoredCalibration {
    fn from(cal: &Calibration) -> Self {
        Self {
            bones: cal
                .bones
                .iter()
                .map(|(&bone, record)| StoredEntry {
                    bone,
                    record: record.into(),
                })
                .collect(),
            spine_up_down: (&cal.spine.spine_up_down).into(),
            hips_twist: (&cal.spine.hips_twist).into(),
            chest: (&cal.spine.chest).into(),
            head: (&cal.spine.head).into(),
        }
    }
}

impl StoredRecord {
    /// 骨の参照を現在のスケルトンに解決する
    pub fn reconstruct(&self, skeleton: &Skeleton) -> Result<CalibrationRecord, CalibrationError> {
        for bone in [self.owner, self.child] {
            if !skeleton.contains(bone) {
                return Err(CalibrationError::MissingBone(bone));
            }
        }

        let [x, y, z, w] = self.initial_rotation;
        let initial_rotation = UnitQuaternion::try_new(Quaternion::new(w, x, y, z), NORM_EPS)
            .ok_or(CalibrationError::InvalidRecord(self.owner))?;
        let [dx, dy, dz] = self.initial_direction;
        let initial_direction = Unit::try_new(Vector3::new(dx, dy, dz), NORM_EPS)
            .ok_or(CalibrationError::InvalidRecord(self.owner))?;

        Ok(CalibrationRecord {
            owner: self.owner,
            child: self.child,
            initial_rotation,
            initial_direction,
            tracked_origin: self.tracked_origin,
            tracked_target: self.tracked_target,
        })
    }
}

impl StoredCalibration {
    /// キャリブレーション全体を再構築。不正なレコードが1つでもあれば全体を拒否
    pub fn reconstruct(&self, skeleton: &Skeleton) -> Result<Calibration, CalibrationError> {
        if self.bones.is_empty() {
            return Err(CalibrationError::EmptyCollection);
        }

        let mut bones = BTreeMap::new();
        for entry in &self.bones {
            // キーと owner が違うレコードは別の骨を動かしてしまう
            if entry.record.owner != entry.bone {
                return Err(CalibrationError::InvalidRecord(entry.bone));
            }
            let record = entry.record.reconstruct(skeleton)?;
            if bones.insert(entry.bone, record).is_some() {
                return Err(CalibrationError::DuplicateBone(entry.bone));
            }
        }

        let spine = SpineChain {
            spine_up_down: self.spine_up_down.reconstruct(skeleton)?,
            hips_twist: self.hips_twist.reconstruct(skeleton)?,
            chest: self.chest.reconstruct(skeleton)?,
            head: self.head.reconstruct(skeleton)?,
        };

        Ok(Calibration { bones, spine })
    }
}

// --- Store ---

/// キャリブレーションの保存先
pub trait CalibrationStore: Send {
    fn load(&self) -> Result<StoredCalibration>;
    fn save(&mut self, calibration: &StoredCalibration) -> Result<()>;
    /// ログ用の保存先表示
    fn describe(&self) -> String;
}

/// 1ファイルに整形済み JSON で保存する
pub struct JsonCalibrationStore {
    path: PathBuf,
}

impl JsonCalibrationStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for JsonCalibrationStore {
    fn load(&self) -> Result<StoredCalibration> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read calibration file {}", self.path.display()))?;
        let stored: StoredCalibration = serde_json::from_str(&content)
            .with_context(|| format!("Invalid calibration file {}", self.path.display()))?;
        Ok(stored)
    }

    fn save(&mut self, calibration: &StoredCalibration) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create calibration directory")?;
        }
        let json = serde_json::to_string_pretty(calibration)?;
        fs::write(&self.path, json).context("Failed to write calibration file")?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmark::reference_pose;
    use crate::skeleton::Transform;

    fn live_calibration() -> (Skeleton, Calibration) {
        let skeleton = Skeleton::humanoid(Transform::identity());
        let cal = Calibration::capture_live(&skeleton, &reference_pose(), true).unwrap();
        (skeleton, cal)
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCalibrationStore::new(dir.path().join("presets/avatar.json"));
        let (skeleton, cal) = live_calibration();

        store.save(&StoredCalibration::from(&cal)).unwrap();
        let restored = store.load().unwrap().reconstruct(&skeleton).unwrap();

        assert_eq!(restored.bones.len(), cal.bones.len());
        let a = &restored.bones[&Bone::RightLowerArm];
        let b = &cal.bones[&Bone::RightLowerArm];
        assert!(a.initial_rotation.angle_to(&b.initial_rotation) < 1e-5);
        assert!((a.initial_direction.into_inner() - b.initial_direction.into_inner()).norm() < 1e-5);
        assert_eq!(restored.spine.head.tracked_origin, TrackedPoint::VirtualNeck);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCalibrationStore::new(dir.path().join("nope.json"));
        assert!(store.load().is_err());
    }

    #[test]
    fn test_reconstruct_rejects_absent_bone() {
        let (_, cal) = live_calibration();
        let stored = StoredCalibration::from(&cal);

        let mut partial = Skeleton::new(Transform::identity());
        for bone in Bone::ALL.into_iter().filter(|b| *b != Bone::LeftToes) {
            partial.insert(bone, Vector3::new(0.0, 0.1, 0.0), UnitQuaternion::identity());
        }
        let err = stored.reconstruct(&partial).unwrap_err();
        assert!(matches!(err, CalibrationError::MissingBone(Bone::LeftToes)));
    }

    #[test]
    fn test_reconstruct_rejects_duplicates_and_empty() {
        let (skeleton, cal) = live_calibration();
        let mut stored = StoredCalibration::from(&cal);
        let first = stored.bones[0].clone();
        stored.bones.push(first.clone());
        assert!(matches!(
            stored.reconstruct(&skeleton),
            Err(CalibrationError::DuplicateBone(b)) if b == first.bone
        ));

        stored.bones.clear();
        assert!(matches!(
            stored.reconstruct(&skeleton),
            Err(CalibrationError::EmptyCollection)
        ));
    }

    #[test]
    fn test_reconstruct_rejects_zero_direction() {
        let (skeleton, cal) = live_calibration();
        let mut stored = StoredCalibration::from(&cal);
        stored.head.initial_direction = [0.0; 3];
        assert!(matches!(
            stored.reconstruct(&skeleton),
            Err(CalibrationError::InvalidRecord(Bone::Neck))
        ));
    }

    #[test]
    fn test_reconstruct_rejects_owner_mismatch() {
        let (skeleton, cal) = live_calibration();
        let mut stored = StoredCalibration::from(&cal);
        let key = stored.bones[0].bone;
        stored.bones[0].record.owner = stored.bones[1].bone;
        assert!(matches!(
            stored.reconstruct(&skeleton),
            Err(CalibrationError::InvalidRecord(bone)) if bone == key
        ));
    }
}
