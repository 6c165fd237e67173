use nalgebra::Point3;

/// 地面レイヤーへの下向きレイキャスト
pub trait GroundProbe {
    /// `origin` から真下に `max_distance` まで飛ばしたレイの当たり位置
    fn cast_down(&self, origin: &Point3<f32>, max_distance: f32) -> Option<Point3<f32>>;
}

/// 高さ `height` の無限水平面
#[derive(Debug, Clone, Copy)]
pub struct FlatGround {
    pub height: f32,
}

impl FlatGround {
    pub fn new(height: f32) -> Self {
        Self { height }
    }
}

impl GroundProbe for FlatGround {
    fn cast_down(&self, origin: &Point3<f32>, max_distance: f32) -> Option<Point3<f32>> {
        let drop = origin.y - self.height;
        // 地面より下から撃ったレイは当たらない
        if drop < 0.0 || drop > max_distance {
            return None;
        }
        Some(Point3::new(origin.x, self.height, origin.z))
    }
}

/// 足から真下の地面までの縦オフセット（足が上にあれば負）
pub fn probe_offset(
    probe: &dyn GroundProbe,
    foot: Option<Point3<f32>>,
    max_distance: f32,
) -> Option<f32> {
    let foot = foot?;
    probe.cast_down(&foot, max_distance).map(|hit| hit.y - foot.y)
}

/// root の位置合わせに使うオフセットを選ぶ
///
/// 左を先に評価し、外れたら 0。右は絶対値が厳密に小さいときだけ置き換える。
/// 同じ大きさなら左のまま。
/// この順序に意味はないが固定しておく
pub fn ground_offset(left: Option<f32>, right: Option<f32>) -> f32 {
    let mut offset = left.unwrap_or(0.0);
    if let Some(r) = right {
        if r.abs() < offset.abs() {
            offset = r;
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_ground_hit() {
        let g = FlatGround::new(0.0);
        let hit = g.cast_down(&Point3::new(0.3, 0.2, -1.0), 100.0).unwrap();
        assert_eq!(hit, Point3::new(0.3, 0.0, -1.0));
    }

    #[test]
    fn test_flat_ground_misses() {
        let g = FlatGround::new(1.0);
        assert!(g.cast_down(&Point3::new(0.0, 0.5, 0.0), 100.0).is_none());
        assert!(g.cast_down(&Point3::new(0.0, 200.0, 0.0), 100.0).is_none());
    }

    #[test]
    fn test_probe_offset() {
        let g = FlatGround::new(0.0);
        let off = probe_offset(&g, Some(Point3::new(0.0, 0.25, 0.0)), 100.0).unwrap();
        assert!((off + 0.25).abs() < 1e-6);
        assert!(probe_offset(&g, None, 100.0).is_none());
    }

    #[test]
    fn test_smaller_magnitude_wins() {
        assert_eq!(ground_offset(Some(-0.3), Some(-0.1)), -0.1);
        assert_eq!(ground_offset(Some(-0.1), Some(-0.3)), -0.1);
    }

    #[test]
    fn test_tie_keeps_left() {
        assert_eq!(ground_offset(Some(0.2), Some(-0.2)), 0.2);
        assert_eq!(ground_offset(Some(-0.2), Some(0.2)), -0.2);
    }

    #[test]
    fn test_misses() {
        assert_eq!(ground_offset(None, None), 0.0);
        assert_eq!(ground_offset(Some(-0.4), None), -0.4);
        // 左が外れると 0 扱いなので右は勝てない
        assert_eq!(ground_offset(None, Some(-0.4)), 0.0);
    }
}
