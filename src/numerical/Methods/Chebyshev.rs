//! Chebyshev polynomial helpers, the nonlinear power iteration for the dominant Jacobian
//! eigenvalue and stage-count bookkeeping shared by the stabilized explicit methods.
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::stepper_error::Result;
use log::debug;
use nalgebra::DVector;
use std::collections::BTreeMap;

/// stability boundary factor: a stage-m method is stable for dt * rho <= 0.65 (m^2 - 1)
pub const STABILITY_FACTOR: f64 = 0.65;
const POWER_ITERATIONS: usize = 50;
/// the power iteration underestimates, so the last estimate is inflated
const SAFETY_RADIUS: f64 = 1.2;

fn parity(n: i64) -> f64 {
    if n & 1 == 1 { -1.0 } else { 1.0 }
}

/// Chebyshev polynomial of the first kind T_n(x)
pub fn cheb1(n: i64, x: f64) -> f64 {
    let nf = n as f64;
    if x >= 1.0 {
        (nf * x.acosh()).cosh()
    } else if x <= -1.0 {
        parity(n) * (nf * (-x).acosh()).cosh()
    } else {
        (nf * x.acos()).cos()
    }
}

/// Chebyshev polynomial of the second kind U_n(x)
pub fn cheb2(n: i64, x: f64) -> f64 {
    let nf = n as f64;
    if x == 0.0 {
        return cheb1(n, x);
    }
    if x == 1.0 {
        return nf + 1.0;
    }
    if x == -1.0 {
        return parity(n) * (nf + 1.0);
    }
    if x > 1.0 {
        return ((nf + 1.0) * x.acosh()).sinh() / x.acosh().sinh();
    }
    if x < -1.0 {
        return parity(n) * ((nf + 1.0) * (-x).acosh()).sinh() / (-x).acosh().sinh();
    }
    ((nf + 1.0) * x.acos()).sin() / x.acos().sin()
}

/// T_n'(x)
pub fn cheb1p(n: i64, x: f64) -> f64 {
    n as f64 * cheb2(n - 1, x)
}

/// T_n''(x)
pub fn cheb1pp(n: i64, x: f64) -> f64 {
    let nf = n as f64;
    if x == 1.0 {
        return nf * nf * (nf * nf - 1.0) / 3.0;
    }
    if x == -1.0 {
        return parity(n) * cheb1pp(n, 1.0);
    }
    (nf * cheb1(n, x) - x * cheb2(n - 1, x)) * nf / (x * x - 1.0)
}

/// T_n' from U_{n-1}
pub fn cheb1p_recursive(n: i64, u_prev: f64) -> f64 {
    n as f64 * u_prev
}

/// T_n'' from T_n and U_{n-1}
pub fn cheb1pp_recursive(n: i64, t_n: f64, u_prev: f64, x: f64) -> f64 {
    let nf = n as f64;
    if x == 1.0 {
        return nf * nf * (nf * nf - 1.0) / 3.0;
    }
    (nf * t_n - x * u_prev) * nf / (x * x - 1.0)
}

/// Estimates the spectral radius of the Jacobian of split `split` at (t, y).
///
/// `yp` must be the value of that split at (t, y). `guess` carries the last dominant
/// direction between calls and is seeded with `yp` on the first call.
pub fn estimate_spectral_radius(
    ivp: &mut IVPContext<'_>,
    t: f64,
    y: &DVector<f64>,
    guess: &mut Option<DVector<f64>>,
    yp: &DVector<f64>,
    split: usize,
) -> Result<f64> {
    let eps = f64::EPSILON;
    let sqrt_eps = eps.sqrt();
    let y_norm = y.norm();
    let mut v = guess.take().unwrap_or_else(|| yp.clone());
    let v_norm = v.norm();
    // perturbation of size dy_norm along the current direction
    let dy_norm;
    if y_norm != 0.0 && v_norm != 0.0 {
        dy_norm = y_norm * sqrt_eps;
        v = y + v * (dy_norm / v_norm);
    } else if y_norm != 0.0 {
        dy_norm = y_norm * sqrt_eps;
        v = y + y * sqrt_eps;
    } else if v_norm != 0.0 {
        dy_norm = eps;
        v *= dy_norm / v_norm;
    } else {
        dy_norm = eps;
        v = DVector::from_element(y.len(), dy_norm);
    }

    let mut sigma = 0.0;
    let mut sp_rad = 0.0;
    for i in 0..POWER_ITERATIONS {
        let fv = ivp.evaluate(t, &v, split)?;
        let diff = fv - yp;
        let diff_norm = diff.norm();
        let sigma_old = sigma;
        sigma = diff_norm / dy_norm;
        sp_rad = SAFETY_RADIUS * sigma;
        if i > 1 && (sigma - sigma_old).abs() < sigma * 0.01 {
            break;
        }
        if diff_norm != 0.0 {
            v = y + diff * (dy_norm / diff_norm);
        } else {
            let index = i % y.len();
            v[index] = y[index] - (v[index] - y[index]);
        }
    }
    *guess = Some(v - y);
    Ok(sp_rad)
}

/// `1 + ceil(sqrt(dt rho / 0.65 + 1))` capped at `max_stages`; when capped the
/// timestep satisfying the stability bound is returned as well
pub fn stage_count(dt: f64, sp_rad: f64, max_stages: usize) -> (usize, Option<f64>) {
    let m = 1 + (dt * sp_rad / STABILITY_FACTOR + 1.0).sqrt().ceil() as usize;
    if m > max_stages {
        let mf = max_stages as f64;
        (max_stages, Some(STABILITY_FACTOR * (mf * mf - 1.0) / sp_rad))
    } else {
        (m, None)
    }
}

#[derive(Debug, Clone)]
pub struct StageStats {
    max: usize,
    min: usize,
    total: usize,
    steps: usize,
}

impl StageStats {
    pub fn new(max_stages: usize) -> Self {
        StageStats {
            max: 2,
            min: max_stages,
            total: 0,
            steps: 0,
        }
    }

    pub fn record(&mut self, m: usize) {
        self.min = self.min.min(m);
        self.max = self.max.max(m);
        self.total += m;
        self.steps += 1;
        debug!("Chebyshev step with {} stages", m);
    }

    pub fn write(&self, out: &mut BTreeMap<String, String>) {
        out.insert("max stages".to_string(), self.max.to_string());
        out.insert("min stages".to_string(), self.min.to_string());
        let avg = if self.steps > 0 {
            self.total as f64 / self.steps as f64
        } else {
            0.0
        };
        out.insert("avg stages".to_string(), format!("{}", avg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::IVP::IVP_context::DerivativeSettings;
    use crate::numerical::IVP::test_problems::StiffDiagonal;
    use approx::assert_relative_eq;

    #[test]
    fn polynomials_agree_with_recurrence() {
        let x = 1.03;
        let (mut t_prev, mut t) = (1.0, x);
        let (mut u_prev, mut u) = (1.0, 2.0 * x);
        for n in 2..12 {
            let t_next = 2.0 * x * t - t_prev;
            let u_next = 2.0 * x * u - u_prev;
            t_prev = t;
            t = t_next;
            u_prev = u;
            u = u_next;
            assert_relative_eq!(cheb1(n, x), t, max_relative = 1e-10);
            assert_relative_eq!(cheb2(n, x), u, max_relative = 1e-10);
            assert_relative_eq!(cheb1p(n, x), cheb1p_recursive(n, u_prev), max_relative = 1e-10);
            assert_relative_eq!(cheb1pp(n, x), cheb1pp_recursive(n, t, u_prev, x), max_relative = 1e-9);
        }
        // inside [-1, 1]
        assert_relative_eq!(cheb1(3, 0.5), 4.0 * 0.125 - 1.5, epsilon = 1e-14);
        assert_relative_eq!(cheb1pp(4, 1.0), 80.0);
        assert_relative_eq!(cheb1pp(4, 1.0 + 1e-6), 80.0, max_relative = 1e-3);
    }

    #[test]
    fn power_iteration_finds_dominant_rate() {
        let problem = StiffDiagonal::new(vec![1.0, 10.0, 1000.0]);
        let mut ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
        let y = DVector::from_element(3, 1.0);
        let yp = ivp.rhs(0.0, &y);
        let mut guess = None;
        let rho = estimate_spectral_radius(&mut ivp, 0.0, &y, &mut guess, &yp, 0).unwrap();
        assert_relative_eq!(rho, 1.2 * 1000.0, max_relative = 0.02);
        assert!(guess.is_some());
        // the stored direction speeds up the next estimate
        let rho2 = estimate_spectral_radius(&mut ivp, 0.0, &y, &mut guess, &yp, 0).unwrap();
        assert_relative_eq!(rho2, 1.2 * 1000.0, max_relative = 0.02);
    }

    #[test]
    fn stage_count_follows_stability_bound() {
        let (m, shrunk) = stage_count(0.01, 1000.0, 100);
        assert_eq!(m, 1 + (0.01f64 * 1000.0 / 0.65 + 1.0).sqrt().ceil() as usize);
        assert!(shrunk.is_none());
        let (m, shrunk) = stage_count(10.0, 1e6, 50);
        assert_eq!(m, 50);
        let dt = shrunk.unwrap();
        assert_relative_eq!(dt, 0.65 * (2500.0 - 1.0) / 1e6);
        // a non-stiff problem still gets two stages
        assert_eq!(stage_count(0.1, 0.0, 100).0, 2);
    }
}
