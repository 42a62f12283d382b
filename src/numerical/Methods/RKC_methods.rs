//! Runge-Kutta-Chebyshev family: RKC1, RKC2, the partitioned PRKC and the IMEX variant IRKC.
//!
//! All four share the spectral radius estimate and the stage-count rule of
//! [`Chebyshev`](crate::numerical::Methods::Chebyshev); they differ in the recursion used by `step`
//! and in the error estimate.
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::Methods::Chebyshev::{
    StageStats, cheb1, cheb1p, cheb1p_recursive, cheb1pp, cheb1pp_recursive, estimate_spectral_radius,
    stage_count,
};
use crate::numerical::Methods::method_api::{Method, MethodCore, NEWTON_ITERATIONS, StepContext, scaled_error};
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::{Factorization, SystemMatrix};
use log::{debug, trace};
use nalgebra::DVector;
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIter, EnumString};

/// the non-stiff part of PRKC must satisfy dt * rho_G <= this bound
const PRKC_EXPLICIT_BOUND: f64 = 1.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum RKCKind {
    RKC1,
    RKC2,
    PRKC,
    IRKC,
}

/// stages and evaluations PRKC keeps for its error estimate
#[derive(Debug, Clone, Default)]
struct PartitionedStages {
    k0: DVector<f64>,
    kf: DVector<f64>,
    g_m1: DVector<f64>,
    g0: DVector<f64>,
    g_mm1: DVector<f64>,
    c_mm1: f64,
}

pub struct RKC {
    core: MethodCore,
    kind: RKCKind,
    eta: f64,
    max_stages: usize,
    m: usize,
    /// f (split 1 for the partitioned variants) at the point of the last pre-step
    f0: DVector<f64>,
    f0_point: Option<(f64, DVector<f64>)>,
    sp_rad_guess: Option<DVector<f64>>,
    sp_rad_guess_g: Option<DVector<f64>>,
    last_spectral_radius: f64,
    stage_stats: StageStats,
    partitioned: PartitionedStages,
    /// IRKC implicit coefficient and the split-2 Jacobian of the last step
    k1: f64,
    jac: Option<SystemMatrix>,
}

impl RKC {
    pub fn new(settings: &MethodSettings, kind: RKCKind) -> Self {
        RKC {
            core: MethodCore::new(settings),
            kind,
            eta: settings.eta,
            max_stages: settings.max_stages,
            m: 2,
            f0: DVector::zeros(0),
            f0_point: None,
            sp_rad_guess: None,
            sp_rad_guess_g: None,
            last_spectral_radius: 0.0,
            stage_stats: StageStats::new(settings.max_stages),
            partitioned: PartitionedStages::default(),
            k1: 0.0,
            jac: None,
        }
    }

    pub fn stages(&self) -> usize {
        self.m
    }

    pub fn last_spectral_radius(&self) -> f64 {
        self.last_spectral_radius
    }

    /// split whose stiffness the Chebyshev recursion absorbs
    fn stiff_split(&self) -> usize {
        match self.kind {
            RKCKind::RKC1 | RKCKind::RKC2 => 0,
            RKCKind::PRKC | RKCKind::IRKC => 1,
        }
    }

    /// f0 is reused from the pre-step unless the step starts elsewhere (step doubling)
    fn refresh_f0(&mut self, ivp: &mut IVPContext<'_>, t: f64, y: &DVector<f64>) -> Result<()> {
        let current = self
            .f0_point
            .as_ref()
            .is_some_and(|(tp, yp)| *tp == t && yp == y);
        if !current {
            self.f0 = ivp.evaluate(t, y, self.stiff_split())?;
            self.f0_point = Some((t, y.clone()));
        }
        Ok(())
    }

    fn set_stages(&mut self, dt: &mut f64, sp_rad: f64) {
        let (m, shrunk) = stage_count(*dt, sp_rad, self.max_stages);
        if let Some(new_dt) = shrunk {
            debug!("{}: stage cap {} reached, dt reduced to {}", self.kind, m, new_dt);
            *dt = new_dt;
        }
        self.m = m;
        self.last_spectral_radius = sp_rad;
        self.stage_stats.record(m);
    }

    fn pre_step_inner(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: &mut f64, yn: &DVector<f64>) -> Result<()> {
        let split = self.stiff_split();
        self.f0 = ivp.evaluate(tn, yn, split)?;
        self.f0_point = Some((tn, yn.clone()));
        let sp_rad = estimate_spectral_radius(ivp, tn, yn, &mut self.sp_rad_guess, &self.f0, split)?;
        if self.kind == RKCKind::PRKC {
            self.partitioned.g_m1 = ivp.evaluate(tn, yn, 2)?;
            let sp_rad_g = if ivp.is_jacobian_splitting() {
                0.0
            } else {
                estimate_spectral_radius(ivp, tn, yn, &mut self.sp_rad_guess_g, &self.partitioned.g_m1, 2)?
            };
            if sp_rad_g * *dt > PRKC_EXPLICIT_BOUND {
                *dt = PRKC_EXPLICIT_BOUND / sp_rad_g;
            }
        }
        self.set_stages(dt, sp_rad);
        Ok(())
    }

    //___________________________RKC1_____________________________
    fn step_rkc1(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let m = self.m as i64;
        let w0 = 1.0 + self.eta / (m * m) as f64;
        let w1 = cheb1(m, w0) / cheb1p(m, w0);

        let (mut t_jm1, mut t_j) = (1.0, w0);
        let (mut u_jm1, mut u_j) = (1.0, 2.0 * w0);
        let mut k_jm1 = yn.clone();
        let mut k_m = yn + &self.f0 * (w1 / w0 * dt);
        for j in 2..=m {
            let t_jm2 = t_jm1;
            t_jm1 = t_j;
            t_j = 2.0 * w0 * t_jm1 - t_jm2;
            let u_jm2 = u_jm1;
            u_jm1 = u_j;
            u_j = 2.0 * w0 * u_jm1 - u_jm2;

            let k_jm2 = k_jm1;
            k_jm1 = k_m;

            let (b_jm2, b_jm1, b_j) = (1.0 / t_jm2, 1.0 / t_jm1, 1.0 / t_j);
            let mu = 2.0 * b_j * w0 / b_jm1;
            let nu = -b_j / b_jm2;
            let kappa = 2.0 * b_j * w1 / b_jm1;
            let c_jm1 = w1 * cheb1p_recursive(j - 1, u_jm2) / t_jm1;
            let f_jm1 = ivp.rhs(tn + c_jm1 * dt, &k_jm1);

            k_m = &k_jm1 * mu + &k_jm2 * nu + f_jm1 * (kappa * dt);
        }
        Ok(k_m)
    }

    //___________________________RKC2_____________________________
    /// damped second-order recursion started from `k0` with `f0 = f(split)(k0)`;
    /// returns the final stage, the one before it and the last node c_{m-1}
    fn rkc2_recursion(
        &self,
        ivp: &mut IVPContext<'_>,
        tn: f64,
        dt: f64,
        k0: &DVector<f64>,
        f0: &DVector<f64>,
        split: usize,
    ) -> Result<(DVector<f64>, DVector<f64>, f64)> {
        let m = self.m as i64;
        let w0 = 1.0 + self.eta / (m * m) as f64;
        let w1 = cheb1p(m, w0) / cheb1pp(m, w0);

        let mut b_j = cheb1pp_recursive(2, 2.0 * w0 * w0 - 1.0, 2.0 * w0, w0) / cheb1p_recursive(2, 2.0 * w0).powi(2);
        let mut b_jm1 = b_j;
        let mut b_jm2;

        let mut k_jm1 = k0.clone();
        let mut k_m = k0 + f0 * (b_jm1 * w1 * dt);
        let mut c_jm1 = 0.0;

        let (mut t_jm1, mut t_j) = (1.0, w0);
        let (mut u_jm1, mut u_j) = (1.0, 2.0 * w0);
        for j in 2..=m {
            let t_jm2 = t_jm1;
            t_jm1 = t_j;
            t_j = 2.0 * w0 * t_jm1 - t_jm2;
            let u_jm2 = u_jm1;
            u_jm1 = u_j;
            u_j = 2.0 * w0 * u_jm1 - u_jm2;

            let k_jm2 = k_jm1;
            k_jm1 = k_m;

            b_jm2 = b_jm1;
            b_jm1 = b_j;
            b_j = cheb1pp_recursive(j, t_j, u_jm1, w0) / cheb1p_recursive(j, u_jm1).powi(2);
            let a_jm1 = 1.0 - b_jm1 * t_jm1;
            let mu = 2.0 * b_j * w0 / b_jm1;
            let nu = -b_j / b_jm2;
            let kappa = 2.0 * b_j * w1 / b_jm1;

            c_jm1 = if j == 2 {
                w1 * b_jm1
            } else {
                w1 * cheb1pp_recursive(j - 1, t_jm1, u_jm2, w0) / cheb1p_recursive(j - 1, u_jm2)
            };
            let f_jm1 = ivp.evaluate(tn + c_jm1 * dt, &k_jm1, split)?;

            k_m = k0 * (1.0 - mu - nu) + &k_jm1 * mu + &k_jm2 * nu + f_jm1 * (kappa * dt)
                - f0 * (a_jm1 * kappa * dt);
        }
        Ok((k_m, k_jm1, c_jm1))
    }

    //___________________________PRKC_____________________________
    fn step_prkc(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let alpha0 = 0.5;
        let g_m1 = if self.f0_point.as_ref().is_some_and(|(tp, yp)| *tp == tn && yp == yn) {
            self.partitioned.g_m1.clone()
        } else {
            ivp.evaluate(tn, yn, 2)?
        };
        let k0 = yn + &g_m1 * (alpha0 * dt);
        let f0 = ivp.evaluate(tn, &k0, 1)?;
        let (kf, k_mm1, c_mm1) = self.rkc2_recursion(ivp, tn, dt, &k0, &f0, 1)?;

        // stage m
        let (alpha1, alpha2, alpha3) = (-1.5, 2.0, 0.0);
        let g0 = ivp.evaluate(tn + alpha0 * dt, &k0, 2)?;
        let g_mm1 = ivp.evaluate(tn + alpha0 * dt, &k_mm1, 2)?;
        let km = &kf + (&g_m1 * alpha1 + &g0 * alpha2 + &g_mm1 * alpha3) * dt;

        // stage m + 1
        let alpha4 = -1.0 / 3.0;
        let alpha5 = (2.0 * c_mm1 - 1.0) / (3.0 * c_mm1);
        let alpha6 = 1.0 / (3.0 * c_mm1);
        let alpha7 = 1.0 / 6.0;
        let gm = ivp.evaluate(tn + dt, &km, 2)?;
        let ynew = &kf + (&g_m1 * alpha4 + &g0 * alpha5 + &g_mm1 * alpha6 + gm * alpha7) * dt;

        self.partitioned = PartitionedStages {
            k0,
            kf,
            g_m1,
            g0,
            g_mm1,
            c_mm1,
        };
        Ok(ynew)
    }

    //___________________________IRKC_____________________________
    /// solves `k - k1 dt G(k) = constant` with the factorization of `I - k1 dt J_G`
    fn irkc_newton(
        core: &mut MethodCore,
        ivp: &mut IVPContext<'_>,
        lu: &Factorization,
        constant: &DVector<f64>,
        t: f64,
        h: f64,
        k: &mut DVector<f64>,
    ) -> Result<DVector<f64>> {
        let mut g = ivp.evaluate(t, k, 2)?;
        for i in 0..NEWTON_ITERATIONS {
            if i > 0 {
                g = ivp.evaluate(t, k, 2)?;
            }
            core.newton_iterations += 1;
            let residual = &*k - &g * h - constant;
            *k -= lu.solve(&residual)?;
            let norm = residual.amax();
            if !norm.is_finite() || norm > core.newton_fail {
                break;
            }
            if norm < core.newton_tol {
                return Ok(g);
            }
        }
        trace!("IRKC Newton iteration failed at t = {}", t);
        core.accept = false;
        Ok(g)
    }

    fn step_irkc(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let m = self.m as i64;
        let w0 = 1.0 + self.eta / (m * m) as f64;
        let temp1 = w0 * w0 - 1.0;
        let temp2 = temp1.sqrt();
        let arg = m as f64 * (w0 + temp2).ln();
        let w1 = arg.sinh() * temp1 / (arg.cosh() * m as f64 * temp2 - w0 * arg.sinh());

        let mut b_j = 1.0 / w0;
        let mut b_jm1 = 1.0 / (2.0 * w0).powi(2);
        let mut b_jm2;
        let mut c_j = w1 / w0;
        let mut c_jm1 = 0.0;
        let mut c_jm2;
        let mut a_j = 0.0;
        let mut a_jm1;
        let k1 = b_j * w1;
        self.k1 = k1;

        let jac = ivp.jac(tn, yn, 2)?.clone();
        let lu = jac.shifted(1.0, -k1 * dt).factor()?;
        self.jac = Some(jac);

        let g0 = ivp.evaluate(tn, yn, 2)?;
        let mut g_jm1 = g0.clone();
        let mut k_jm1 = yn.clone();
        let mut k_m = yn.clone();
        let constant = yn + &self.f0 * (k1 * dt);
        let mut g_j = Self::irkc_newton(&mut self.core, ivp, &lu, &constant, tn + c_j * dt, k1 * dt, &mut k_m)?;

        let (mut t_jm1, mut t_j) = (1.0, w0);
        let (mut u_jm1, mut u_j) = (1.0, 2.0 * w0);
        for j in 2..=m {
            let t_jm2 = t_jm1;
            t_jm1 = t_j;
            t_j = 2.0 * w0 * t_jm1 - t_jm2;
            let u_jm2 = u_jm1;
            u_jm1 = u_j;
            u_j = 2.0 * w0 * u_jm1 - u_jm2;

            let k_jm2 = k_jm1;
            k_jm1 = k_m.clone();
            let g_jm2 = g_jm1;
            g_jm1 = g_j;

            b_jm2 = b_jm1;
            b_jm1 = b_j;
            b_j = cheb1pp_recursive(j, t_j, u_jm1, w0) / cheb1p_recursive(j, u_jm1).powi(2);
            let mu = 2.0 * b_j * w0 / b_jm1;
            let nu = -b_j / b_jm2;
            let kappa = 2.0 * b_j * w1 / b_jm1;
            a_jm1 = a_j;
            a_j = 1.0 - b_j * t_j;
            c_jm2 = c_jm1;
            c_jm1 = c_j;
            c_j = mu * c_jm1 + nu * c_jm2 + a_j * (1.0 + kappa);

            let f_jm1 = ivp.evaluate(tn + c_jm1 * dt, &k_jm1, 1)?;
            let stage = yn * (1.0 - mu - nu) + &k_jm1 * mu + &k_jm2 * nu + f_jm1 * (kappa * dt)
                - &self.f0 * (a_jm1 * kappa * dt)
                - &g0 * ((a_jm1 * kappa + (1.0 - mu - nu) * k1) * dt)
                - &g_jm2 * (nu * k1 * dt);
            g_j = Self::irkc_newton(&mut self.core, ivp, &lu, &stage, tn + c_j * dt, k1 * dt, &mut k_m)?;
        }
        Ok(k_m)
    }

    fn step_inner(&mut self, ivp: &mut IVPContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        match self.kind {
            RKCKind::RKC1 => {
                self.refresh_f0(ivp, tn, yn)?;
                self.step_rkc1(ivp, tn, dt, yn)
            }
            RKCKind::RKC2 => {
                self.refresh_f0(ivp, tn, yn)?;
                let f0 = self.f0.clone();
                Ok(self.rkc2_recursion(ivp, tn, dt, yn, &f0, 0)?.0)
            }
            RKCKind::PRKC => self.step_prkc(ivp, tn, dt, yn),
            RKCKind::IRKC => {
                self.refresh_f0(ivp, tn, yn)?;
                self.step_irkc(ivp, tn, dt, yn)
            }
        }
    }

    /// 0.8 (y0 - y1) + 0.4 dt (f(y0) + f(y1)), the classical RKC local error estimate
    fn chebyshev_error(y0: &DVector<f64>, y1: &DVector<f64>, f_0: DVector<f64>, f_1: DVector<f64>, dt: f64) -> DVector<f64> {
        (y0 - y1) * 0.8 + (f_0 + f_1) * (0.4 * dt)
    }
}

impl Method for RKC {
    fn name(&self) -> &'static str {
        match self.kind {
            RKCKind::RKC1 => "Runge-Kutta-Chebyshev (1)",
            RKCKind::RKC2 => "Runge-Kutta-Chebyshev (2)",
            RKCKind::PRKC => "Partitioned Runge-Kutta-Chebyshev",
            RKCKind::IRKC => "IMEX Runge-Kutta-Chebyshev",
        }
    }
    fn order(&self) -> usize {
        match self.kind {
            RKCKind::RKC1 => 1,
            _ => 2,
        }
    }
    fn aux_order(&self) -> usize {
        2
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn pre_step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: &mut f64, yn: &DVector<f64>) -> Result<()> {
        let splitting = self.kind == RKCKind::PRKC && ctx.ivp.is_jacobian_splitting();
        if splitting {
            ctx.ivp.jac(tn, yn, 1)?;
            ctx.ivp.freeze_jacobian(true);
        }
        let result = self.pre_step_inner(&mut ctx.ivp, tn, dt, yn);
        if splitting {
            ctx.ivp.freeze_jacobian(false);
        }
        result
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let splitting = self.kind == RKCKind::PRKC && ctx.ivp.is_jacobian_splitting();
        if splitting {
            ctx.ivp.freeze_jacobian(true);
        }
        let result = self.step_inner(&mut ctx.ivp, tn, dt, yn);
        if splitting {
            ctx.ivp.freeze_jacobian(false);
        }
        result
    }

    fn calc_epsilon(
        &mut self,
        ctx: &mut StepContext<'_>,
        tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let ivp = &mut ctx.ivp;
        match self.kind {
            RKCKind::RKC1 | RKCKind::RKC2 => {
                let f1 = ivp.rhs(tn, yn);
                let f2 = ivp.rhs(tn + dt, ynew);
                let err = Self::chebyshev_error(yn, ynew, f1, f2, dt);
                Ok(scaled_error(&err, yn, ynew, atol, rtol))
            }
            RKCKind::PRKC => {
                let p = &self.partitioned;
                let splitting = ivp.is_jacobian_splitting();
                if splitting {
                    ivp.freeze_jacobian(true);
                }
                let f1 = ivp.evaluate(tn, &p.k0, 1);
                let f2 = ivp.evaluate(tn + dt, &p.kf, 1);
                if splitting {
                    ivp.freeze_jacobian(false);
                }
                let err_f = Self::chebyshev_error(&p.k0, &p.kf, f1?, f2?, dt);
                let beta1 = -0.5;
                let beta3 = 1.0 / (2.0 * p.c_mm1);
                let beta2 = 1.0 - beta3;
                let err_g = ynew - (&p.kf + (&p.g_m1 * beta1 + &p.g0 * beta2 + &p.g_mm1 * beta3) * dt);
                Ok(scaled_error(&err_f, &p.k0, &p.kf, atol, rtol).max(scaled_error(&err_g, yn, ynew, atol, rtol)))
            }
            RKCKind::IRKC => {
                let jac = self
                    .jac
                    .as_ref()
                    .ok_or_else(|| StepperError::NotDefined("IRKC Jacobian before the first step".to_string()))?;
                let lu = jac.shifted(1.0, -dt).factor()?;
                let mut rhs = (ivp.rhs(tn + dt, ynew) - ivp.rhs(tn, yn)) * (dt / 2.0);
                rhs += (ivp.evaluate(tn + dt, ynew, 2)? - ivp.evaluate(tn, yn, 2)?) * (dt * self.k1);
                let err = lu.solve(&rhs)?;
                Ok(scaled_error(&err, yn, ynew, atol, rtol))
            }
        }
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        self.stage_stats.write(out);
        if self.kind == RKCKind::IRKC {
            out.insert("newton iterations".to_string(), self.core.newton_iterations.to_string());
        }
    }
}
