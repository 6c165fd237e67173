use nalgebra::{Point3, Unit, UnitQuaternion, Vector3};
use std::f32::consts::PI;

const DEGENERATE_EPS: f32 = 1e-8;

/// `origin` から `target` への単位方向。同一点なら None
pub fn direction(origin: &Point3<f32>, target: &Point3<f32>) -> Option<Unit<Vector3<f32>>> {
    Unit::try_new(*target - *origin, DEGENERATE_EPS)
}

/// `from` を `to` に重ねる最短回転
///
/// 逆向きなら直交する任意の軸で180度、
/// 長さ0の入力は単位回転
pub fn from_to_rotation(from: &Vector3<f32>, to: &Vector3<f32>) -> UnitQuaternion<f32> {
    if let Some(q) = UnitQuaternion::rotation_between(from, to) {
        return q;
    }
    if from.norm_squared() < DEGENERATE_EPS || to.norm_squared() < DEGENERATE_EPS {
        return UnitQuaternion::identity();
    }
    // 逆向き: from に直交する任意の軸で180度
    let axis = Unit::try_new(from.cross(&Vector3::x()), DEGENERATE_EPS)
        .or_else(|| Unit::try_new(from.cross(&Vector3::y()), DEGENERATE_EPS))
        .unwrap_or_else(Vector3::z_axis);
    UnitQuaternion::from_axis_angle(&axis, PI)
}

/// 単位方向どうしの球面補間
pub fn slerp_direction(
    from: &Unit<Vector3<f32>>,
    to: &Unit<Vector3<f32>>,
    t: f32,
) -> Unit<Vector3<f32>> {
    let arc = from_to_rotation(from, to);
    // powf(t) は回転角を t 倍する
    Unit::new_unchecked(arc.powf(t) * from.into_inner())
}

/// 短い弧側での NLERP。t は 0..=1 にクランプ
pub fn nlerp(a: &UnitQuaternion<f32>, b: &UnitQuaternion<f32>, t: f32) -> UnitQuaternion<f32> {
    let t = t.clamp(0.0, 1.0);
    let qa = a.quaternion();
    let mut qb = *b.quaternion();

    // shortest path: dot < 0 なら b を反転
    if qa.dot(&qb) < 0.0 {
        qb = -qb;
    }

    UnitQuaternion::new_normalize(qa.lerp(&qb, t))
}

/// 位置の線形補間。t は 0..=1 にクランプ
pub fn lerp_point(a: &Point3<f32>, b: &Point3<f32>, t: f32) -> Point3<f32> {
    let t = t.clamp(0.0, 1.0);
    *a + (*b - *a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

    fn approx_eq_vec(a: &Vector3<f32>, b: &Vector3<f32>, eps: f32) -> bool {
        (*a - *b).norm() < eps
    }

    #[test]
    fn test_direction() {
        let d = direction(&Point3::new(1.0, 1.0, 0.0), &Point3::new(1.0, 3.0, 0.0)).unwrap();
        assert!(approx_eq_vec(&d, &Vector3::y(), 1e-6));
        assert!(direction(&Point3::origin(), &Point3::origin()).is_none());
    }

    #[test]
    fn test_from_to_identity_for_same_direction() {
        let q = from_to_rotation(&Vector3::new(0.3, 0.4, 0.5), &Vector3::new(0.6, 0.8, 1.0));
        assert!(q.angle() < 1e-5);
    }

    #[test]
    fn test_from_to_quarter_turn() {
        let q = from_to_rotation(&Vector3::x(), &Vector3::z());
        assert!((q.angle() - FRAC_PI_2).abs() < 1e-5);
        assert!(approx_eq_vec(&(q * Vector3::x()), &Vector3::z(), 1e-5));
    }

    #[test]
    fn test_from_to_opposite() {
        let q = from_to_rotation(&Vector3::x(), &-Vector3::x());
        assert!(approx_eq_vec(&(q * Vector3::x()), &-Vector3::x(), 1e-5));
        let q = from_to_rotation(&Vector3::y(), &-Vector3::y());
        assert!(approx_eq_vec(&(q * Vector3::y()), &-Vector3::y(), 1e-5));
    }

    #[test]
    fn test_from_to_zero_vector() {
        let q = from_to_rotation(&Vector3::zeros(), &Vector3::x());
        assert!(q.angle() < 1e-6);
    }

    #[test]
    fn test_slerp_direction_quarter() {
        let from = Vector3::x_axis();
        let to = Vector3::z_axis();
        let mid = slerp_direction(&from, &to, 0.5);
        let expected = Vector3::new(FRAC_PI_4.cos(), 0.0, FRAC_PI_4.sin());
        assert!(approx_eq_vec(&mid, &expected, 1e-5));
        assert!((mid.norm() - 1.0).abs() < 1e-5);

        let quarter = slerp_direction(&from, &to, 0.25);
        let angle = quarter.into_inner().angle(&from.into_inner());
        assert!((angle - FRAC_PI_2 * 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_slerp_direction_endpoints() {
        let from = Vector3::y_axis();
        let to = Unit::new_normalize(Vector3::new(1.0, 1.0, 0.0));
        assert!(approx_eq_vec(&slerp_direction(&from, &to, 0.0), &from, 1e-6));
        assert!(approx_eq_vec(&slerp_direction(&from, &to, 1.0), &to, 1e-5));
    }

    #[test]
    fn test_nlerp_endpoints_and_clamp() {
        let a = UnitQuaternion::identity();
        let b = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        assert!(nlerp(&a, &b, 0.0).angle_to(&a) < 1e-6);
        assert!(nlerp(&a, &b, 1.0).angle_to(&b) < 1e-5);
        assert!(nlerp(&a, &b, 3.0).angle_to(&b) < 1e-5);
        assert!(nlerp(&a, &b, -1.0).angle_to(&a) < 1e-6);
    }

    #[test]
    fn test_nlerp_takes_shorter_arc() {
        let a = UnitQuaternion::identity();
        let b = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.2);
        // 同じ回転の符号反転表現
        let b_neg = UnitQuaternion::new_unchecked(-*b.quaternion());
        let r = nlerp(&a, &b_neg, 0.5);
        assert!((r.angle() - 0.1).abs() < 1e-3);
    }

    #[test]
    fn test_lerp_point() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(2.0, 4.0, 6.0);
        let mid = lerp_point(&a, &b, 0.5);
        assert!((mid - Point3::new(1.0, 2.0, 3.0)).norm() < 1e-6);
        assert!((lerp_point(&a, &b, 5.0) - b).norm() < 1e-6);
    }
}
