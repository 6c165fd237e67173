//! インデックスベースのヒューマノイドスケルトン
//!
//! 骨は [`Bone`] で引く固定配列に入り、各ノードは親からの相対 Transform を持つ。
//! 骨を回すと子も一緒に回る。
//! アバター全体の root が `Hips` の親。

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// リグが動かすヒューマノイドの骨
///
/// 宣言順は親→子。`Ord` 順に回せば必ず親が先
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum Bone {
    Hips = 0,
    Spine = 1,
    Chest = 2,
    Neck = 3,
    Head = 4,
    LeftUpperArm = 5,
    LeftLowerArm = 6,
    LeftHand = 7,
    RightUpperArm = 8,
    RightLowerArm = 9,
    RightHand = 10,
    LeftUpperLeg = 11,
    LeftLowerLeg = 12,
    LeftFoot = 13,
    LeftToes = 14,
    RightUpperLeg = 15,
    RightLowerLeg = 16,
    RightFoot = 17,
    RightToes = 18,
}

impl Bone {
    pub const COUNT: usize = 19;

    pub const ALL: [Bone; Self::COUNT] = [
        Self::Hips,
        Self::Spine,
        Self::Chest,
        Self::Neck,
        Self::Head,
        Self::LeftUpperArm,
        Self::LeftLowerArm,
        Self::LeftHand,
        Self::RightUpperArm,
        Self::RightLowerArm,
        Self::RightHand,
        Self::LeftUpperLeg,
        Self::LeftLowerLeg,
        Self::LeftFoot,
        Self::LeftToes,
        Self::RightUpperLeg,
        Self::RightLowerLeg,
        Self::RightFoot,
        Self::RightToes,
    ];

    /// 標準ヒューマノイド階層での親 (`None` は root 直下)
    pub fn parent(self) -> Option<Bone> {
        use Bone::*;
        match self {
            Hips => None,
            Spine | LeftUpperLeg | RightUpperLeg => Some(Hips),
            Chest => Some(Spine),
            Neck | LeftUpperArm | RightUpperArm => Some(Chest),
            Head => Some(Neck),
            LeftLowerArm => Some(LeftUpperArm),
            LeftHand => Some(LeftLowerArm),
            RightLowerArm => Some(RightUpperArm),
            RightHand => Some(RightLowerArm),
            LeftLowerLeg => Some(LeftUpperLeg),
            LeftFoot => Some(LeftLowerLeg),
            LeftToes => Some(LeftFoot),
            RightLowerLeg => Some(RightUpperLeg),
            RightFoot => Some(RightLowerLeg),
            RightToes => Some(RightFoot),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Point3<f32>,
    pub rotation: UnitQuaternion<f32>,
}

impl Transform {
    pub fn new(position: Point3<f32>, rotation: UnitQuaternion<f32>) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self::new(Point3::origin(), UnitQuaternion::identity())
    }
}

#[derive(Debug, Clone)]
struct BoneNode {
    /// 存在する最も近い祖先
    parent: Option<Bone>,
    local_position: Vector3<f32>,
    local_rotation: UnitQuaternion<f32>,
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    root: Transform,
    bones: [Option<BoneNode>; Bone::COUNT],
    animation_enabled: bool,
}

impl Skeleton {
    pub fn new(root: Transform) -> Self {
        Self {
            root,
            bones: std::array::from_fn(|_| None),
            animation_enabled: true,
        }
    }

    /// y = 0 に立つ T ポーズ。+z 向き、右手側が +x
    pub fn humanoid(root: Transform) -> Self {
        use Bone::*;
        let v = Vector3::new;
        let mut s = Self::new(root);
        for (bone, offset) in [
            (Hips, v(0.0, 1.0, 0.0)),
            (Spine, v(0.0, 0.1, 0.0)),
            (Chest, v(0.0, 0.15, 0.0)),
            (Neck, v(0.0, 0.2, 0.0)),
            (Head, v(0.0, 0.12, 0.0)),
            (LeftUpperArm, v(-0.18, 0.15, 0.0)),
            (LeftLowerArm, v(-0.28, 0.0, 0.0)),
            (LeftHand, v(-0.25, 0.0, 0.0)),
            (RightUpperArm, v(0.18, 0.15, 0.0)),
            (RightLowerArm, v(0.28, 0.0, 0.0)),
            (RightHand, v(0.25, 0.0, 0.0)),
            (LeftUpperLeg, v(-0.1, -0.05, 0.0)),
            (LeftLowerLeg, v(0.0, -0.42, 0.0)),
            (LeftFoot, v(0.0, -0.42, 0.0)),
            (LeftToes, v(0.0, -0.08, 0.12)),
            (RightUpperLeg, v(0.1, -0.05, 0.0)),
            (RightLowerLeg, v(0.0, -0.42, 0.0)),
            (RightFoot, v(0.0, -0.42, 0.0)),
            (RightToes, v(0.0, -0.08, 0.12)),
        ] {
            s.insert(bone, offset, UnitQuaternion::identity());
        }
        s
    }

    /// 骨を追加（既存なら置換）。親を先に入れること。
    /// 既にある最も近い祖先、なければ root にぶら下がる
    pub fn insert(
        &mut self,
        bone: Bone,
        local_position: Vector3<f32>,
        local_rotation: UnitQuaternion<f32>,
    ) {
        let mut parent = bone.parent();
        while let Some(p) = parent {
            if self.contains(p) {
                break;
            }
            parent = p.parent();
        }
        self.bones[bone as usize] = Some(BoneNode {
            parent,
            local_position,
            local_rotation,
        });
    }

    pub fn contains(&self, bone: Bone) -> bool {
        self.bones[bone as usize].is_some()
    }

    pub fn root(&self) -> &Transform {
        &self.root
    }

    pub fn set_root_position(&mut self, position: Point3<f32>) {
        self.root.position = position;
    }

    pub fn set_root_rotation(&mut self, rotation: UnitQuaternion<f32>) {
        self.root.rotation = rotation;
    }

    /// ホスト側のアニメーション再生がまだ Transform を書き換えてよいか
    pub fn animation_enabled(&self) -> bool {
        self.animation_enabled
    }

    pub fn disable_animation(&mut self) {
        self.animation_enabled = false;
    }

    pub fn world_transform(&self, bone: Bone) -> Option<Transform> {
        let node = self.bones[bone as usize].as_ref()?;
        let parent = match node.parent {
            Some(p) => self.world_transform(p)?,
            None => self.root,
        };
        Some(Transform {
            position: parent.position + parent.rotation * node.local_position,
            rotation: parent.rotation * node.local_rotation,
        })
    }

    pub fn world_position(&self, bone: Bone) -> Option<Point3<f32>> {
        self.world_transform(bone).map(|t| t.position)
    }

    pub fn world_rotation(&self, bone: Bone) -> Option<UnitQuaternion<f32>> {
        self.world_transform(bone).map(|t| t.rotation)
    }

    /// ワールド回転を設定（子孫も追従）。骨がなければ false
    pub fn set_world_rotation(&mut self, bone: Bone, rotation: UnitQuaternion<f32>) -> bool {
        let Some(parent) = self.bones[bone as usize].as_ref().map(|n| n.parent) else {
            return false;
        };
        let parent_rotation = match parent {
            Some(p) => match self.world_rotation(p) {
                Some(r) => r,
                None => return false,
            },
            None => self.root.rotation,
        };
        if let Some(node) = self.bones[bone as usize].as_mut() {
            node.local_rotation = parent_rotation.inverse() * rotation;
        }
        true
    }
}
