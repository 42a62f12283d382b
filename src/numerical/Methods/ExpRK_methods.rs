//! Additive commutator-free exponential methods.
//!
//! The linear ("exponential") split is propagated by a truncated exponential series, the
//! other ("classical") split is treated explicitly (ERKCF2, DIRKCF1) or by Newton
//! iteration (DIRKCF2, DIRKCF3).
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::Methods::method_api::{Method, MethodCore, StepContext};
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::{Factorization, SystemMatrix};
use log::trace;
use nalgebra::DVector;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIter, EnumString};

/// Newton in the exponential methods gives up after this many corrections
const CF_NEWTON_ITERATIONS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum ExpRKKind {
    DIRKCF1,
    DIRKCF2,
    DIRKCF3,
    ERKCF2,
}

/// exp(t M) v by the series v + sum_{i=1..3} (t / i) M (previous term),
/// with M the linear combination `sum c_k M_k`
pub fn exp_mtv(terms: &[(f64, &SystemMatrix)], t: f64, v: &DVector<f64>) -> DVector<f64> {
    let mut term = v.clone();
    let mut out = v.clone();
    for i in 1..=3 {
        let mut mv = DVector::zeros(v.len());
        for (c, m) in terms {
            mv.axpy(*c, &m.mul_vec(&term), 1.0);
        }
        term = mv * (t / i as f64);
        out += &term;
    }
    out
}

pub struct AdditiveExpRK {
    core: MethodCore,
    kind: ExpRKKind,
    classical: usize,
    exponential: usize,
}

impl AdditiveExpRK {
    pub fn new(settings: &MethodSettings, kind: ExpRKKind) -> Result<Self> {
        if kind == ExpRKKind::DIRKCF3 && !settings.sparse {
            return Err(StepperError::Unsupported(
                "DIRKCF3 does not support dense matrices, set method.sparse".to_string(),
            ));
        }
        let (classical, exponential) = if settings.flipexp { (2, 1) } else { (1, 2) };
        Ok(AdditiveExpRK {
            core: MethodCore::new(settings),
            kind,
            classical,
            exponential,
        })
    }

    /// operator of the exponential split at a stage point; recomputed unless the
    /// Jacobian is frozen for Jacobian splitting
    fn stage_operator(&self, ivp: &mut IVPContext<'_>, t: f64, y: &DVector<f64>) -> Result<SystemMatrix> {
        if ivp.is_jacobian_splitting() {
            return Ok(ivp.split_mat(t, y, self.exponential)?.clone());
        }
        let frozen = ivp.cache().is_frozen();
        ivp.freeze_jacobian(false);
        let mat = ivp.split_mat(t, y, self.exponential).map(|m| m.clone());
        ivp.freeze_jacobian(frozen);
        mat
    }

    /// solves `y = constant + h g(t, y)` with the factorization of `h J_g - I`
    fn newton(
        &mut self,
        ivp: &mut IVPContext<'_>,
        lu: &Factorization,
        y: &mut DVector<f64>,
        t: f64,
        h: f64,
        constant: &DVector<f64>,
    ) -> Result<bool> {
        for _ in 0..=CF_NEWTON_ITERATIONS {
            self.core.newton_iterations += 1;
            let g = ivp.evaluate(t, y, self.classical)?;
            let residual = constant + g * h - &*y;
            *y -= lu.solve(&residual)?;
            let norm = residual.amax();
            if norm < self.core.newton_tol {
                return Ok(true);
            }
            if !norm.is_finite() || norm > self.core.newton_fail {
                break;
            }
        }
        trace!("{} Newton iteration failed at t = {}", self.kind, t);
        Ok(false)
    }

    fn dirkcf1(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let split_mat = self.stage_operator(ivp, tn, yn)?;
        let g = ivp.evaluate(tn, yn, self.classical)?;
        Ok(exp_mtv(&[(1.0, &split_mat)], dt, yn) + g * dt)
    }

    fn dirkcf2(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let half = dt / 2.0;
        let lu = ivp.jac(tn, yn, self.classical)?.shifted(-1.0, half).factor()?;
        let expmat = self.stage_operator(ivp, tn, yn)?;
        let k_exp = exp_mtv(&[(1.0, &expmat)], half, yn);

        let mut k_imp = yn.clone();
        if !self.newton(ivp, &lu, &mut k_imp, tn + half, half, &k_exp)? {
            self.core.accept = false;
            return Ok(DVector::zeros(yn.len()));
        }

        let g = ivp.evaluate(tn + half, &k_imp, self.classical)?;
        let k_exp = exp_mtv(&[(1.0, &expmat)], -half, &g);
        let expmat = self.stage_operator(ivp, tn + dt, &k_imp)?;
        Ok(exp_mtv(&[(1.0, &expmat)], dt, &(yn + k_exp * dt)))
    }

    fn dirkcf3(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let gamma = (3.0 + 3f64.sqrt()) / 6.0;
        let phi = 1.0 / (6.0 * (2.0 * gamma - 1.0));
        let t2 = tn + gamma * dt;
        let t3 = tn + (1.0 - gamma) * dt;
        let lu = ivp.jac(tn, yn, self.classical)?.shifted(-1.0, dt * gamma).factor()?;

        // stage 2
        let y1m = self.stage_operator(ivp, tn, yn)?;
        let p2 = [(dt * gamma, &y1m)];
        let constant2 = exp_mtv(&p2, 1.0, yn);
        let mut y2 = yn.clone();
        if !self.newton(ivp, &lu, &mut y2, t2, gamma * dt, &constant2)? {
            self.core.accept = false;
            return Ok(DVector::zeros(yn.len()));
        }

        // stage 3
        let y2m = self.stage_operator(ivp, t2, &y2)?;
        let p3 = [(dt * (gamma - 1.0), &y1m), (dt * 2.0 * (1.0 - gamma), &y2m)];
        let y2g = ivp.evaluate(t2, &y2, self.classical)?;
        let p2ig2 = exp_mtv(&p2, -1.0, &y2g);
        let constant3 = exp_mtv(&p3, 1.0, &(yn + &p2ig2 * (dt * (1.0 - 2.0 * gamma))));
        let mut y3 = y2.clone();
        if !self.newton(ivp, &lu, &mut y3, t3, gamma * dt, &constant3)? {
            self.core.accept = false;
            return Ok(DVector::zeros(yn.len()));
        }

        // final composition
        let y3m = self.stage_operator(ivp, t3, &y3)?;
        let p4_1 = [(dt * phi, &y2m), (-dt * phi, &y3m)];
        let p4_2 = [(dt * (0.5 - phi), &y2m), (dt * (0.5 - phi), &y3m)];
        let y3g = ivp.evaluate(t3, &y3, self.classical)?;
        let p3ig3 = exp_mtv(&p3, -1.0, &y3g);
        let inner = exp_mtv(&p4_1, 1.0, &(yn + (p2ig2 + p3ig3) * (dt / 2.0)));
        Ok(exp_mtv(&p4_2, 1.0, &inner))
    }

    fn erkcf2(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let half = dt / 2.0;
        let expmat = self.stage_operator(ivp, tn, yn)?;
        let mut k_exp = exp_mtv(&[(1.0, &expmat)], half, yn);
        let g = ivp.evaluate(tn + half, &k_exp, self.classical)?;
        k_exp += g * half;

        let g = ivp.evaluate(tn + half, &k_exp, self.classical)?;
        let correction = exp_mtv(&[(1.0, &expmat)], -half, &g);
        let expmat = self.stage_operator(ivp, tn + dt, &k_exp)?;
        Ok(exp_mtv(&[(1.0, &expmat)], dt, &(yn + correction * dt)))
    }
}

impl Method for AdditiveExpRK {
    fn name(&self) -> &'static str {
        match self.kind {
            ExpRKKind::DIRKCF1 => "DIRK-CF(1)",
            ExpRKKind::DIRKCF2 => "DIRK-CF(2)",
            ExpRKKind::DIRKCF3 => "DIRK-CF(3)",
            ExpRKKind::ERKCF2 => "ERK-CF(2)",
        }
    }
    fn order(&self) -> usize {
        match self.kind {
            ExpRKKind::DIRKCF1 => 1,
            ExpRKKind::DIRKCF2 | ExpRKKind::ERKCF2 => 2,
            ExpRKKind::DIRKCF3 => 3,
        }
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let ivp = &mut ctx.ivp;
        let explicit = matches!(self.kind, ExpRKKind::DIRKCF1 | ExpRKKind::ERKCF2);
        if explicit && ivp.is_jacobian_splitting() {
            ivp.jac(tn, yn, 0)?;
        }
        // the implicit variants compute their Jacobian before freezing
        if explicit {
            ivp.freeze_jacobian(true);
        }
        let ynew = match self.kind {
            ExpRKKind::DIRKCF1 => self.dirkcf1(ivp, tn, dt, yn),
            ExpRKKind::ERKCF2 => self.erkcf2(ivp, tn, dt, yn),
            ExpRKKind::DIRKCF2 | ExpRKKind::DIRKCF3 => {
                let jac_ready = ivp.jac(tn, yn, self.classical).map(|_| ());
                ivp.freeze_jacobian(true);
                match jac_ready {
                    Ok(()) if self.kind == ExpRKKind::DIRKCF2 => self.dirkcf2(ivp, tn, dt, yn),
                    Ok(()) => self.dirkcf3(ivp, tn, dt, yn),
                    Err(e) => Err(e),
                }
            }
        };
        ivp.freeze_jacobian(false);
        ynew
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        if matches!(self.kind, ExpRKKind::DIRKCF2 | ExpRKKind::DIRKCF3) {
            out.insert("newton iterations".to_string(), self.core.newton_iterations.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::IVP::IVP_context::DerivativeSettings;
    use crate::numerical::IVP::IVP_traits::{Differentiable, Evaluable, Splittable};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use strum::IntoEnumIterator;

    /// y' = -t y, entirely in the exponential split; y(t) = exp(-t^2 / 2)
    struct RampedDecay;

    impl Evaluable for RampedDecay {
        fn name(&self) -> &str {
            "RampedDecay"
        }
        fn size(&self) -> usize {
            1
        }
        fn initial_condition(&self) -> DVector<f64> {
            DVector::from_element(1, 1.0)
        }
        fn rhs(&self, t: f64, y: &DVector<f64>) -> DVector<f64> {
            y * -t
        }
    }

    impl Differentiable for RampedDecay {}

    impl Splittable for RampedDecay {
        fn has_physical_split(&self) -> bool {
            true
        }
        fn physical_split(&self, split: usize, t: f64, y: &DVector<f64>) -> Option<DVector<f64>> {
            match split {
                1 => Some(DVector::zeros(1)),
                2 => Some(y * -t),
                _ => None,
            }
        }
        fn split_mat(&self, split: usize, t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
            (split == 2).then(|| SystemMatrix::from_dense(DMatrix::from_element(1, 1, -t), false))
        }
    }

    fn context(problem: &RampedDecay) -> StepContext<'_> {
        let settings = DerivativeSettings {
            sparse: true,
            ..DerivativeSettings::default()
        };
        StepContext::new(IVPContext::new(problem, settings).unwrap(), 0.01)
    }

    fn method(kind: ExpRKKind) -> AdditiveExpRK {
        let mut settings = MethodSettings::new(&kind.to_string());
        settings.sparse = true;
        AdditiveExpRK::new(&settings, kind).unwrap()
    }

    #[test]
    fn series_matches_exponential_for_small_argument() {
        let m = SystemMatrix::from_dense(DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, -2.0]), false);
        let v = DVector::from_vec(vec![1.0, 1.0]);
        let out = exp_mtv(&[(1.0, &m)], 0.01, &v);
        // truncation error is O(t^4)
        assert_relative_eq!(out[0], (-0.01f64).exp(), epsilon = 1e-9);
        assert_relative_eq!(out[1], (-0.02f64).exp(), epsilon = 1e-8);
        let combined = exp_mtv(&[(0.5, &m), (0.5, &m)], 0.01, &v);
        assert_relative_eq!(combined, out, epsilon = 1e-15);
    }

    #[test]
    fn time_dependent_operator_follows_the_step() {
        let problem = RampedDecay;
        let exact = (-2.0f64).exp();
        for kind in ExpRKKind::iter() {
            let mut m = method(kind);
            let mut ctx = context(&problem);
            let dt = 0.01;
            let mut y = problem.initial_condition();
            for i in 0..200 {
                y = m.step(&mut ctx, i as f64 * dt, dt, &y).unwrap();
                assert!(m.accept(), "{}", kind);
            }
            let tol = if kind == ExpRKKind::DIRKCF1 { 5e-3 } else { 2e-3 };
            assert_relative_eq!(y[0], exact, epsilon = tol);
        }
    }

    #[test]
    fn step_does_not_depend_on_earlier_attempts() {
        let problem = RampedDecay;
        let y0 = problem.initial_condition();
        for kind in ExpRKKind::iter() {
            let mut fresh = method(kind);
            let mut fresh_ctx = context(&problem);
            let expected = fresh.step(&mut fresh_ctx, 1.0, 0.1, &y0).unwrap();

            // an attempt at another point (a rejected one, say) must not leak its operator
            let mut m = method(kind);
            let mut ctx = context(&problem);
            m.step(&mut ctx, 0.0, 0.5, &y0).unwrap();
            let ynew = m.step(&mut ctx, 1.0, 0.1, &y0).unwrap();
            assert_relative_eq!(ynew[0], expected[0], epsilon = 1e-14);
        }
    }
}
