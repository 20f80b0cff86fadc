//! Parametric surface capability and the tensor-product NURBS used for fitted regions.
//!
//! The rest of the engine only relies on [`Surface`] (point, partials, normal), so a
//! different kernel's surface type can be dropped in behind the trait.

use serde::{Deserialize, Serialize};

use super::core::{Point3, Tolerance, Vec3};

/// Maximum Gauss-Newton iterations in [`closest_point`].
const CLOSEST_POINT_ITERATIONS: usize = 32;

pub trait Surface {
    fn point_at(&self, u: f64, v: f64) -> Point3;

    /// First partial derivatives `(∂S/∂u, ∂S/∂v)`.
    fn partial_derivatives_at(&self, u: f64, v: f64) -> (Vec3, Vec3);

    #[must_use]
    fn domain_u(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    #[must_use]
    fn domain_v(&self) -> (f64, f64) {
        (0.0, 1.0)
    }

    #[must_use]
    fn normal_at(&self, u: f64, v: f64) -> Option<Vec3> {
        let (du, dv) = self.partial_derivatives_at(u, v);
        du.cross(dv).normalized()
    }
}

fn is_non_decreasing(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] <= w[1])
}

/// Knot span index containing `t` for `count` control points of degree `p`.
fn find_span(count: usize, p: usize, t: f64, knots: &[f64]) -> usize {
    let n = count - 1;
    if t >= knots[n + 1] {
        return n;
    }
    if t <= knots[p] {
        return p;
    }
    let mut low = p;
    let mut high = n + 1;
    let mut mid = (low + high) / 2;
    while t < knots[mid] || t >= knots[mid + 1] {
        if t < knots[mid] {
            high = mid;
        } else {
            low = mid;
        }
        mid = (low + high) / 2;
    }
    mid
}

/// Non-zero basis values `N_{span-p..=span, p}(t)`.
fn basis_values(span: usize, t: f64, p: usize, knots: &[f64]) -> Vec<f64> {
    let mut n = vec![0.0; p + 1];
    let mut left = vec![0.0; p + 1];
    let mut right = vec![0.0; p + 1];
    n[0] = 1.0;
    for j in 1..=p {
        left[j] = t - knots[span + 1 - j];
        right[j] = knots[span + j] - t;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let temp = if denom == 0.0 { 0.0 } else { n[r] / denom };
            n[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        n[j] = saved;
    }
    n
}

/// Derivatives of the non-zero basis functions, from the degree `p − 1` values.
fn basis_derivatives(span: usize, t: f64, p: usize, knots: &[f64]) -> Vec<f64> {
    if p == 0 {
        return vec![0.0];
    }
    let lower = basis_values(span, t, p - 1, knots);
    let degree = p as f64;
    (0..=p)
        .map(|k| {
            let i = span - p + k;
            let rising = if k >= 1 {
                let denom = knots[i + p] - knots[i];
                if denom == 0.0 { 0.0 } else { degree * lower[k - 1] / denom }
            } else {
                0.0
            };
            let falling = if k < p {
                let denom = knots[i + p + 1] - knots[i + 1];
                if denom == 0.0 { 0.0 } else { degree * lower[k] / denom }
            } else {
                0.0
            };
            rising - falling
        })
        .collect()
}

/// Basis row for one parameter: the first control index and the `p + 1` weights.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisRow {
    pub first: usize,
    pub values: Vec<f64>,
}

/// Evaluates the non-zero B-spline basis functions of a knot vector at `t`.
#[must_use]
pub fn basis_row(knots: &[f64], degree: usize, count: usize, t: f64) -> BasisRow {
    let t = t.clamp(knots[degree], knots[count]);
    let span = find_span(count, degree, t, knots);
    BasisRow {
        first: span - degree,
        values: basis_values(span, t, degree, knots),
    }
}

/// Clamped uniform knot vector on `[0, 1]` for `count` control points.
#[must_use]
pub fn clamped_uniform_knots(count: usize, degree: usize) -> Vec<f64> {
    let interior = count.saturating_sub(degree + 1);
    let mut knots = vec![0.0; degree + 1];
    for k in 1..=interior {
        knots.push(k as f64 / (interior + 1) as f64);
    }
    knots.extend(std::iter::repeat_n(1.0, degree + 1));
    knots
}

/// Rational tensor-product B-spline surface. Control point `(i, j)` is stored at
/// `j * u_count + i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NurbsSurface {
    pub degree_u: usize,
    pub degree_v: usize,
    pub u_count: usize,
    pub v_count: usize,
    pub control_points: Vec<Point3>,
    pub knots_u: Vec<f64>,
    pub knots_v: Vec<f64>,
    pub weights: Option<Vec<f64>>,
}

impl NurbsSurface {
    /// # Errors
    /// Returns a description of the first inconsistency: net smaller than 2×2, degree
    /// out of range, wrong control/knot/weight counts, decreasing knots, or non-positive
    /// weights.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        degree_u: usize,
        degree_v: usize,
        u_count: usize,
        v_count: usize,
        control_points: Vec<Point3>,
        knots_u: Vec<f64>,
        knots_v: Vec<f64>,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, String> {
        if u_count < 2 || v_count < 2 {
            return Err("nurbs surface requires at least a 2x2 control net".to_string());
        }
        if degree_u == 0 || degree_v == 0 {
            return Err("nurbs surface degrees must be >= 1".to_string());
        }
        if degree_u >= u_count || degree_v >= v_count {
            return Err("nurbs surface degrees must be < control point counts".to_string());
        }
        if control_points.len() != u_count * v_count {
            return Err(format!(
                "nurbs surface expects {} control points, got {}",
                u_count * v_count,
                control_points.len()
            ));
        }
        if control_points.iter().any(|p| !p.is_finite()) {
            return Err("nurbs surface control points must be finite".to_string());
        }
        for (name, knots, count, degree) in [
            ("u", &knots_u, u_count, degree_u),
            ("v", &knots_v, v_count, degree_v),
        ] {
            if knots.len() != count + degree + 1 {
                return Err(format!(
                    "nurbs surface {name} knot length must be {}, got {}",
                    count + degree + 1,
                    knots.len()
                ));
            }
            if !is_non_decreasing(knots) || knots.iter().any(|k| !k.is_finite()) {
                return Err(format!("nurbs surface {name} knots must be finite and non-decreasing"));
            }
            if knots[count] <= knots[degree] {
                return Err(format!("nurbs surface {name} domain is empty"));
            }
        }
        if let Some(weights) = &weights {
            if weights.len() != control_points.len() {
                return Err("nurbs surface weights length must match control point count".to_string());
            }
            if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                return Err("nurbs surface weights must be finite and > 0".to_string());
            }
        }

        Ok(Self {
            degree_u,
            degree_v,
            u_count,
            v_count,
            control_points,
            knots_u,
            knots_v,
            weights,
        })
    }

    /// Non-rational clamped uniform surface over `[0, 1]²`.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn clamped_uniform(
        degree_u: usize,
        degree_v: usize,
        u_count: usize,
        v_count: usize,
        control_points: Vec<Point3>,
    ) -> Result<Self, String> {
        Self::new(
            degree_u,
            degree_v,
            u_count,
            v_count,
            control_points,
            clamped_uniform_knots(u_count, degree_u),
            clamped_uniform_knots(v_count, degree_v),
            None,
        )
    }

    /// Same knots and weights with a replacement control net.
    ///
    /// # Errors
    /// Fails if the net size differs or contains non-finite points.
    pub fn with_control_points(&self, control_points: Vec<Point3>) -> Result<Self, String> {
        Self::new(
            self.degree_u,
            self.degree_v,
            self.u_count,
            self.v_count,
            control_points,
            self.knots_u.clone(),
            self.knots_v.clone(),
            self.weights.clone(),
        )
    }

    #[must_use]
    pub fn control_point(&self, u_index: usize, v_index: usize) -> Point3 {
        self.control_points[v_index * self.u_count + u_index]
    }

    fn weight(&self, idx: usize) -> f64 {
        self.weights
            .as_ref()
            .and_then(|weights| weights.get(idx).copied())
            .unwrap_or(1.0)
    }

    /// Greville abscissa of control column `u_index`.
    #[must_use]
    pub fn greville_u(&self, u_index: usize) -> f64 {
        greville(&self.knots_u, self.degree_u, u_index)
    }

    /// Greville abscissa of control row `v_index`.
    #[must_use]
    pub fn greville_v(&self, v_index: usize) -> f64 {
        greville(&self.knots_v, self.degree_v, v_index)
    }

    /// Position and first partials in one pass.
    fn evaluate(&self, u: f64, v: f64) -> (Point3, Vec3, Vec3) {
        let (u0, u1) = self.domain_u();
        let (v0, v1) = self.domain_v();
        let u = u.clamp(u0, u1);
        let v = v.clamp(v0, v1);

        let p = self.degree_u;
        let q = self.degree_v;
        let span_u = find_span(self.u_count, p, u, &self.knots_u);
        let span_v = find_span(self.v_count, q, v, &self.knots_v);
        let nu = basis_values(span_u, u, p, &self.knots_u);
        let nv = basis_values(span_v, v, q, &self.knots_v);
        let dnu = basis_derivatives(span_u, u, p, &self.knots_u);
        let dnv = basis_derivatives(span_v, v, q, &self.knots_v);

        let mut a = Vec3::ZERO;
        let mut a_u = Vec3::ZERO;
        let mut a_v = Vec3::ZERO;
        let mut w = 0.0;
        let mut w_u = 0.0;
        let mut w_v = 0.0;
        for l in 0..=q {
            let j = span_v - q + l;
            for k in 0..=p {
                let i = span_u - p + k;
                let idx = j * self.u_count + i;
                let weight = self.weight(idx);
                let pw = self.control_points[idx].to_vec3() * weight;
                a += pw * (nu[k] * nv[l]);
                a_u += pw * (dnu[k] * nv[l]);
                a_v += pw * (nu[k] * dnv[l]);
                w += weight * nu[k] * nv[l];
                w_u += weight * dnu[k] * nv[l];
                w_v += weight * nu[k] * dnv[l];
            }
        }

        if !w.is_finite() || w == 0.0 {
            return (self.control_points[0], Vec3::ZERO, Vec3::ZERO);
        }
        let s = a / w;
        let du = (a_u - s * w_u) / w;
        let dv = (a_v - s * w_v) / w;
        (Point3::from(s), du, dv)
    }
}

fn greville(knots: &[f64], degree: usize, index: usize) -> f64 {
    knots[index + 1..=index + degree].iter().sum::<f64>() / degree as f64
}

impl Surface for NurbsSurface {
    fn point_at(&self, u: f64, v: f64) -> Point3 {
        self.evaluate(u, v).0
    }

    fn partial_derivatives_at(&self, u: f64, v: f64) -> (Vec3, Vec3) {
        let (_, du, dv) = self.evaluate(u, v);
        (du, dv)
    }

    fn domain_u(&self) -> (f64, f64) {
        (self.knots_u[self.degree_u], self.knots_u[self.u_count])
    }

    fn domain_v(&self) -> (f64, f64) {
        (self.knots_v[self.degree_v], self.knots_v[self.v_count])
    }
}

/// Foot point of a projection onto a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosestPoint {
    pub u: f64,
    pub v: f64,
    pub point: Point3,
    /// Distance along the surface normal, positive on the normal side.
    pub signed_distance: f64,
}

/// Projects `target` onto `surface`: best sample of a `seed_grid²` grid refined by
/// Gauss-Newton iterations clamped to the domain.
#[must_use]
pub fn closest_point(surface: &impl Surface, target: Point3, seed_grid: usize) -> ClosestPoint {
    let (u0, u1) = surface.domain_u();
    let (v0, v1) = surface.domain_v();
    let n = seed_grid.max(2);

    let mut u = u0;
    let mut v = v0;
    let mut best = f64::INFINITY;
    for j in 0..n {
        let sv = v0 + (v1 - v0) * j as f64 / (n - 1) as f64;
        for i in 0..n {
            let su = u0 + (u1 - u0) * i as f64 / (n - 1) as f64;
            let d = surface.point_at(su, sv).sub_point(target).length_squared();
            if d < best {
                best = d;
                u = su;
                v = sv;
            }
        }
    }

    for _ in 0..CLOSEST_POINT_ITERATIONS {
        let residual = surface.point_at(u, v).sub_point(target);
        let (su, sv) = surface.partial_derivatives_at(u, v);
        let a = su.dot(su);
        let b = su.dot(sv);
        let c = sv.dot(sv);
        let gu = residual.dot(su);
        let gv = residual.dot(sv);
        let det = a * c - b * b;
        if det.abs() <= Tolerance::ZERO_LENGTH.eps {
            break;
        }
        let step_u = (c * gu - b * gv) / det;
        let step_v = (a * gv - b * gu) / det;
        let next_u = (u - step_u).clamp(u0, u1);
        let next_v = (v - step_v).clamp(v0, v1);
        let moved = (next_u - u).abs() + (next_v - v).abs();
        u = next_u;
        v = next_v;
        if moved <= Tolerance::DEFAULT.eps {
            break;
        }
    }

    let point = surface.point_at(u, v);
    let offset = target.sub_point(point);
    let distance = offset.length();
    let signed_distance = match surface.normal_at(u, v) {
        Some(normal) if offset.dot(normal) < 0.0 => -distance,
        _ => distance,
    };
    ClosestPoint {
        u,
        v,
        point,
        signed_distance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_uniform_knots_shape() {
        let knots = clamped_uniform_knots(5, 3);
        assert_eq!(knots, vec![0.0, 0.0, 0.0, 0.0, 0.5, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(clamped_uniform_knots(2, 1), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_basis_row_partition_of_unity() {
        let knots = clamped_uniform_knots(6, 3);
        for t in [0.0, 0.2, 0.5, 0.77, 1.0] {
            let row = basis_row(&knots, 3, 6, t);
            let sum: f64 = row.values.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12, "sum at {t} = {sum}");
            assert!(row.first + 3 < 6);
        }
    }

    #[test]
    fn test_basis_derivatives_sum_to_zero() {
        let knots = clamped_uniform_knots(6, 3);
        let span = find_span(6, 3, 0.4, &knots);
        let sum: f64 = basis_derivatives(span, 0.4, 3, &knots).iter().sum();
        assert!(sum.abs() < 1e-12);
    }
}
