//! Three-stage Radau IIA collocation method of order 5.
//!
//! The 3n stage system is decoupled by the eigenbasis of the collocation matrix into one
//! real system `(gamma/dt) I - J` and one complex system `((alpha + i beta)/dt) I - J`.
use crate::numerical::Methods::method_api::{get_tolerances, Method, MethodCore, SolverCounters, StepContext, NEWTON_ITERATIONS};
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::{rms, ComplexFactorization, Factorization};
use log::{debug, trace};
use nalgebra::{DVector, Matrix3};
use std::collections::BTreeMap;

/// quadratic interpolant through the last accepted stage values
#[derive(Debug, Clone)]
struct ContinuousExtension {
    cont1: DVector<f64>,
    cont2: DVector<f64>,
    cont3: DVector<f64>,
}

pub struct Radau5 {
    core: MethodCore,
    c: [f64; 2],
    d: [f64; 3],
    gamma: f64,
    alpha: f64,
    beta: f64,
    tr: Matrix3<f64>,
    ti: Matrix3<f64>,
    z: [DVector<f64>; 3],
    extension: Option<ContinuousExtension>,
    e1: Option<Factorization>,
    e2: Option<ComplexFactorization>,
}

/// rows of `m` applied to the stacked vectors `v`
fn transform(m: &Matrix3<f64>, v: &[DVector<f64>; 3]) -> [DVector<f64>; 3] {
    let row = |i: usize| &v[0] * m[(i, 0)] + &v[1] * m[(i, 1)] + &v[2] * m[(i, 2)];
    [row(0), row(1), row(2)]
}

impl Radau5 {
    pub fn new(settings: &MethodSettings) -> Self {
        let sq6 = 6f64.sqrt();
        let cbrt81 = 81f64.powf(1.0 / 3.0);
        let cbrt9 = 9f64.powf(1.0 / 3.0);
        let gamma = 30.0 / (6.0 + cbrt81 - cbrt9);
        let alpha = (12.0 - cbrt81 + cbrt9) / 60.0;
        let beta = (cbrt81 + cbrt9) * 3f64.sqrt() / 60.0;
        let mag = alpha * alpha + beta * beta;
        #[rustfmt::skip]
        let tr = Matrix3::new(
            9.1232394870892942792e-2, -0.14125529502095420843, -3.0029194105147424492e-2,
            0.24171793270710701896, 0.20412935229379993199, 0.38294211275726193779,
            0.96604818261509293619, 1.0, 0.0,
        );
        #[rustfmt::skip]
        let ti = Matrix3::new(
            4.3255798900631553510, 0.33919925181580986954, 0.54177053993587487119,
            -4.1787185915519047273, -0.32768282076106238708, 0.47662355450055045196,
            -0.50287263494578687595, 2.5719269498556054292, -0.59603920482822492497,
        );
        Radau5 {
            core: MethodCore::new(settings),
            c: [(4.0 - sq6) / 10.0, (4.0 + sq6) / 10.0],
            d: [(-13.0 - 7.0 * sq6) / 3.0, (-13.0 + 7.0 * sq6) / 3.0, -1.0 / 3.0],
            gamma,
            alpha: alpha / mag,
            beta: beta / mag,
            tr,
            ti,
            z: [DVector::zeros(0), DVector::zeros(0), DVector::zeros(0)],
            extension: None,
            e1: None,
            e2: None,
        }
    }

    /// stage guess from the interpolant of the previous step, scaled to the new dt
    fn initial_guess(&self, n: usize, dt: f64, counters: &SolverCounters) -> [DVector<f64>; 3] {
        match (&self.extension, counters.accepted_steps) {
            (Some(ext), accepted) if accepted > 0 => {
                let c3q = dt / counters.dt_old;
                let c1m1 = self.c[0] - 1.0;
                let c2m1 = self.c[1] - 1.0;
                let guess = |q: f64| (&ext.cont1 + (&ext.cont2 + &ext.cont3 * (q - c1m1)) * (q - c2m1)) * q;
                [guess(self.c[0] * c3q), guess(self.c[1] * c3q), guess(c3q)]
            }
            _ => [DVector::zeros(n), DVector::zeros(n), DVector::zeros(n)],
        }
    }

    fn e1(&self) -> Result<&Factorization> {
        self.e1
            .as_ref()
            .ok_or_else(|| StepperError::NotDefined("Radau5 iteration matrix before the first step".to_string()))
    }
}

impl Method for Radau5 {
    fn name(&self) -> &'static str {
        "Radau IIA 5"
    }
    fn order(&self) -> usize {
        5
    }
    fn aux_order(&self) -> usize {
        3
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let n = yn.len();
        let g = self.gamma / dt;
        let a = self.alpha / dt;
        let b = self.beta / dt;
        let ivp = &mut ctx.ivp;
        let jac = ivp.jac(tn, yn, 0)?;
        let e1 = jac.shifted(g, -1.0).factor()?;
        let e2 = jac.factor_complex_shift(a, b)?;

        self.z = self.initial_guess(n, dt, &ctx.counters);
        let mut f = transform(&self.ti, &self.z);

        for _ in 0..NEWTON_ITERATIONS {
            self.core.newton_iterations += 1;
            let stages = [
                ivp.rhs(tn + self.c[0] * dt, &(yn + &self.z[0])),
                ivp.rhs(tn + self.c[1] * dt, &(yn + &self.z[1])),
                ivp.rhs(tn + dt, &(yn + &self.z[2])),
            ];
            let mut w = transform(&self.ti, &stages);
            w[0] -= &f[0] * g;
            w[1] += &f[2] * b - &f[1] * a;
            w[2] -= &f[2] * a + &f[1] * b;

            let dz1 = e1.solve(&w[0])?;
            let (dz2, dz3) = e2.solve(&w[1], &w[2])?;
            let norm = ((dz1.norm_squared() + dz2.norm_squared() + dz3.norm_squared()) / (3 * n) as f64).sqrt();

            f[0] += dz1;
            f[1] += dz2;
            f[2] += dz3;
            self.z = transform(&self.tr, &f);

            if !norm.is_finite() || norm > self.core.newton_fail {
                break;
            }
            if norm < self.core.newton_tol {
                self.e1 = Some(e1);
                self.e2 = Some(e2);
                return Ok(yn + &self.z[2]);
            }
        }
        debug!("Radau5 Newton iteration failed at t = {}, dt = {}", tn, dt);
        self.e1 = Some(e1);
        self.e2 = Some(e2);
        self.core.accept = false;
        Ok(DVector::zeros(n))
    }

    fn update_timestep(&mut self, _counters: &SolverCounters) {
        let [z1, z2, z3] = &self.z;
        let (c0, c1) = (self.c[0], self.c[1]);
        let ak = (z1 - z2) / (c0 - c1);
        let cont1 = (z2 - z3) / (c1 - 1.0);
        let cont2 = (&ak - &cont1) / (c0 - 1.0);
        let cont3 = &cont2 - (ak - z1 / c0) / c1;
        self.extension = Some(ContinuousExtension { cont1, cont2, cont3 });
    }

    fn calc_epsilon(
        &mut self,
        ctx: &mut StepContext<'_>,
        tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        _ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let tol = get_tolerances(yn, yn, atol, rtol);
        let diff = (&self.z[0] * self.d[0] + &self.z[1] * self.d[1] + &self.z[2] * self.d[2]) / dt;
        let fn0 = ctx.ivp.rhs(tn, yn);
        let err = self.e1()?.solve(&(fn0 + &diff))?;
        let eps = rms(&err.component_div(&tol));
        if eps < 1.0 {
            return Ok(eps);
        }
        // second pass filters the stiff components of the first estimate
        trace!("Radau5 first error estimate {} refined", eps);
        let fn1 = ctx.ivp.rhs(tn, &(yn + err));
        let err = self.e1()?.solve(&(fn1 + diff))?;
        Ok(rms(&err.component_div(&tol)))
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        out.insert("newton iterations".to_string(), self.core.newton_iterations.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::IVP::IVP_context::{DerivativeSettings, IVPContext};
    use crate::numerical::IVP::test_problems::{LinearScalar, VanDerPol};
    use approx::assert_relative_eq;

    #[test]
    fn transforms_are_inverse() {
        let radau = Radau5::new(&MethodSettings::new("Radau5"));
        let product = radau.tr * radau.ti;
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn linear_decay_is_accurate() {
        let mut method = Radau5::new(&MethodSettings::new("Radau5"));
        let problem = LinearScalar::new(-2.0, 1.0);
        let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
        let mut y = ivp.initial_condition();
        let dt = 0.1;
        let mut ctx = StepContext::new(ivp, dt);
        for i in 0..10 {
            y = method.step(&mut ctx, i as f64 * dt, dt, &y).unwrap();
            assert!(method.accept());
            ctx.counters.accepted_steps += 1;
            method.update_timestep(&ctx.counters);
        }
        assert_relative_eq!(y[0], (-2.0f64).exp(), max_relative = 1e-7);
    }

    #[test]
    fn continuous_extension_reduces_newton_iterations() {
        let problem = VanDerPol::new(0.1);
        let dt = 0.01;
        let run = |seed: bool| {
            let mut method = Radau5::new(&MethodSettings::new("Radau5"));
            let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
            let mut y = ivp.initial_condition();
            let mut ctx = StepContext::new(ivp, dt);
            for i in 0..20 {
                y = method.step(&mut ctx, i as f64 * dt, dt, &y).unwrap();
                if seed {
                    ctx.counters.accepted_steps += 1;
                    method.update_timestep(&ctx.counters);
                }
            }
            method.core().newton_iterations
        };
        assert!(run(true) < run(false));
    }

    #[test]
    fn error_estimate_is_small_for_accurate_step() {
        let mut method = Radau5::new(&MethodSettings::new("Radau5"));
        let problem = LinearScalar::new(-1.0, 1.0);
        let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
        let y0 = ivp.initial_condition();
        let mut ctx = StepContext::new(ivp, 0.01);
        let y1 = method.step(&mut ctx, 0.0, 0.01, &y0).unwrap();
        let eps = method.calc_epsilon(&mut ctx, 0.0, 0.01, &y0, &y1, 1e-6, 1e-6).unwrap();
        assert!(eps < 1.0);
    }
}
