//! Explicit, diagonally implicit and implicit-explicit Runge-Kutta steppers.
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::Methods::RK_tableaus::{ButcherTableau, DIRKKind, ERKKind, IMEXKind, IMEXTableau};
use crate::numerical::Methods::method_api::{
    Method, MethodCore, NEWTON_ITERATIONS, StepContext, scaled_error, size_stage_buffer,
};
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::{Factorization, SystemMatrix};
use log::trace;
use nalgebra::DVector;
use std::collections::BTreeMap;

/// yn + dt * sum_j w_j k_j
fn weighted_sum(yn: &DVector<f64>, dt: f64, weights: &DVector<f64>, k: &[DVector<f64>]) -> DVector<f64> {
    let mut acc = DVector::zeros(yn.len());
    for (w, kj) in weights.iter().zip(k) {
        if *w != 0.0 {
            acc.axpy(*w, kj, 1.0);
        }
    }
    yn + acc * dt
}

fn embedded_weights<'t>(tableau: &'t ButcherTableau) -> Result<&'t DVector<f64>> {
    tableau.b_aux.as_ref().ok_or_else(|| {
        StepperError::Configuration(format!("{} does not provide an error estimate", tableau.name))
    })
}

/// Simplified Newton iteration for one implicit stage
///
/// solves `k = f(t, base + h k)` with the factorization of `I - h J`; the step is
/// flagged as not accepted when the residual diverges or the budget runs out
pub(crate) fn newton_stage(
    core: &mut MethodCore,
    ivp: &mut IVPContext<'_>,
    lu: &Factorization,
    t: f64,
    h: f64,
    base: &DVector<f64>,
    k: &mut DVector<f64>,
    split: usize,
) -> Result<()> {
    for _ in 0..NEWTON_ITERATIONS {
        core.newton_iterations += 1;
        let arg = base + &*k * h;
        let residual = ivp.evaluate(t, &arg, split)? - &*k;
        let correction = lu.solve(&residual)?;
        *k += correction;
        let norm = residual.amax();
        if !norm.is_finite() || norm > core.newton_fail {
            break;
        }
        // with Jacobian splitting the stage equation is linear
        if norm < core.newton_tol || ivp.is_jacobian_splitting() {
            return Ok(());
        }
    }
    trace!("stage Newton iteration failed at t = {}", t);
    core.accept = false;
    Ok(())
}

/// factorization of `I - dt a_ii J`, reused while the diagonal coefficient repeats
struct StageMatrix {
    diagonal: f64,
    lu: Factorization,
}

impl StageMatrix {
    fn get<'m>(
        slot: &'m mut Option<StageMatrix>,
        jac: &SystemMatrix,
        dt: f64,
        diagonal: f64,
        previous_diagonal: Option<f64>,
        factorizations: &mut usize,
    ) -> Result<&'m Factorization> {
        let reuse = previous_diagonal == Some(diagonal) && slot.as_ref().is_some_and(|s| s.diagonal == diagonal);
        if !reuse {
            *factorizations += 1;
            *slot = Some(StageMatrix {
                diagonal,
                lu: jac.shifted(1.0, -dt * diagonal).factor()?,
            });
        }
        slot.as_ref()
            .map(|s| &s.lu)
            .ok_or_else(|| StepperError::NotDefined("stage matrix".to_string()))
    }
}

////////////////////////////////////////////////////////////////
//                      ERK
////////////////////////////////////////////////////////////////
pub struct ERK {
    core: MethodCore,
    tableau: ButcherTableau,
    k: Vec<DVector<f64>>,
}

impl ERK {
    pub fn new(settings: &MethodSettings, kind: ERKKind) -> Self {
        ERK {
            core: MethodCore::new(settings),
            tableau: kind.tableau(),
            k: Vec::new(),
        }
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }
}

impl Method for ERK {
    fn name(&self) -> &'static str {
        self.tableau.name
    }
    fn order(&self) -> usize {
        self.tableau.order
    }
    fn aux_order(&self) -> usize {
        self.tableau.aux_order
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let t = &self.tableau;
        size_stage_buffer(&mut self.k, t.stages(), yn.len());
        for i in 0..t.stages() {
            let mut arg = yn.clone();
            for j in 0..i {
                let aij = t.a[(i, j)];
                if aij != 0.0 {
                    arg.axpy(dt * aij, &self.k[j], 1.0);
                }
            }
            self.k[i] = ctx.ivp.rhs(tn + dt * t.c[i], &arg);
        }
        Ok(weighted_sum(yn, dt, &t.b, &self.k))
    }

    fn calc_epsilon(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let aux = weighted_sum(yn, dt, embedded_weights(&self.tableau)?, &self.k);
        Ok(scaled_error(&(ynew - aux), yn, ynew, atol, rtol))
    }
}

////////////////////////////////////////////////////////////////
//                      DIRK
////////////////////////////////////////////////////////////////
pub struct DIRK {
    core: MethodCore,
    tableau: ButcherTableau,
    k: Vec<DVector<f64>>,
    factorizations: usize,
}

impl DIRK {
    pub fn new(settings: &MethodSettings, kind: DIRKKind) -> Self {
        DIRK {
            core: MethodCore::new(settings),
            tableau: kind.tableau(),
            k: Vec::new(),
            factorizations: 0,
        }
    }

    fn stages(
        &mut self,
        ivp: &mut IVPContext<'_>,
        tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        jac: &SystemMatrix,
        guess: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let t = &self.tableau;
        let mut matrix: Option<StageMatrix> = None;
        size_stage_buffer(&mut self.k, t.stages(), yn.len());
        for i in 0..t.stages() {
            let base = weighted_sum(yn, dt, &t.a.row(i).transpose(), &self.k[..i]);
            let aii = t.a[(i, i)];
            let ti = tn + dt * t.c[i];
            let mut ki = guess.clone();
            if aii == 0.0 {
                ki = ivp.rhs(ti, &base);
            } else {
                let previous = if i > 0 { Some(t.a[(i - 1, i - 1)]) } else { None };
                let lu = StageMatrix::get(&mut matrix, jac, dt, aii, previous, &mut self.factorizations)?;
                newton_stage(&mut self.core, ivp, lu, ti, dt * aii, &base, &mut ki, 0)?;
            }
            self.k[i] = ki;
        }
        Ok(weighted_sum(yn, dt, &t.b, &self.k))
    }
}

impl Method for DIRK {
    fn name(&self) -> &'static str {
        self.tableau.name
    }
    fn order(&self) -> usize {
        self.tableau.order
    }
    fn aux_order(&self) -> usize {
        self.tableau.aux_order
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let guess = ctx.ivp.rhs(tn, yn);
        let jac = ctx.ivp.jac(tn, yn, 0)?.clone();
        ctx.ivp.freeze_jacobian(true);
        let ynew = self.stages(&mut ctx.ivp, tn, dt, yn, &jac, &guess);
        ctx.ivp.freeze_jacobian(false);
        ynew
    }

    fn calc_epsilon(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let aux = weighted_sum(yn, dt, embedded_weights(&self.tableau)?, &self.k);
        Ok(scaled_error(&(ynew - aux), yn, ynew, atol, rtol))
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        out.insert("newton iterations".to_string(), self.core.newton_iterations.to_string());
        out.insert("factorizations".to_string(), self.factorizations.to_string());
    }
}

////////////////////////////////////////////////////////////////
//                      IMEX
////////////////////////////////////////////////////////////////
pub struct IMEX {
    core: MethodCore,
    tableau: IMEXTableau,
    /// implicit (split 1) stage derivatives
    k: Vec<DVector<f64>>,
    /// explicit (split 2) stage derivatives
    k2: Vec<DVector<f64>>,
    factorizations: usize,
}

impl IMEX {
    pub fn new(settings: &MethodSettings, kind: IMEXKind) -> Self {
        IMEX {
            core: MethodCore::new(settings),
            tableau: kind.tableau(),
            k: Vec::new(),
            k2: Vec::new(),
            factorizations: 0,
        }
    }

    fn stages(
        &mut self,
        ivp: &mut IVPContext<'_>,
        tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        jac: &SystemMatrix,
        guess: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let imp = &self.tableau.implicit;
        let exp = &self.tableau.explicit;
        let mut matrix: Option<StageMatrix> = None;
        let mut ynew = DVector::zeros(yn.len());
        size_stage_buffer(&mut self.k, imp.stages(), yn.len());
        size_stage_buffer(&mut self.k2, imp.stages(), yn.len());
        for i in 0..imp.stages() {
            let mut accum = DVector::zeros(yn.len());
            for j in 0..i {
                accum.axpy(imp.a[(i, j)], &self.k[j], 1.0);
                accum.axpy(exp.a[(i, j)], &self.k2[j], 1.0);
            }
            let mut accum = yn + accum * dt;

            let aii = imp.a[(i, i)];
            let ti = tn + dt * imp.c[i];
            let mut ki = guess.clone();
            if aii == 0.0 {
                ki = ivp.evaluate(ti, &accum, 1)?;
            } else {
                let previous = if i > 0 { Some(imp.a[(i - 1, i - 1)]) } else { None };
                let lu = StageMatrix::get(&mut matrix, jac, dt, aii, previous, &mut self.factorizations)?;
                newton_stage(&mut self.core, ivp, lu, ti, dt * aii, &accum, &mut ki, 1)?;
            }
            accum.axpy(dt * aii, &ki, 1.0);
            let k2i = ivp.evaluate(tn + dt * exp.c[i], &accum, 2)?;

            ynew.axpy(imp.b[i], &ki, 1.0);
            ynew.axpy(exp.b[i], &k2i, 1.0);
            self.k[i] = ki;
            self.k2[i] = k2i;
        }
        Ok(yn + ynew * dt)
    }
}

impl Method for IMEX {
    fn name(&self) -> &'static str {
        self.tableau.implicit.name
    }
    fn order(&self) -> usize {
        self.tableau.implicit.order
    }
    fn aux_order(&self) -> usize {
        self.tableau.implicit.aux_order
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        // Jacobian first: under Jacobian splitting split 1 is evaluated through it
        let jac = ctx.ivp.jac(tn, yn, 1)?.clone();
        ctx.ivp.freeze_jacobian(true);
        let ynew = match ctx.ivp.evaluate(tn, yn, 1) {
            Ok(guess) => self.stages(&mut ctx.ivp, tn, dt, yn, &jac, &guess),
            Err(e) => Err(e),
        };
        ctx.ivp.freeze_jacobian(false);
        ynew
    }

    fn calc_epsilon(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _tn: f64,
        dt: f64,
        yn: &DVector<f64>,
        ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let aux_f = weighted_sum(yn, dt, embedded_weights(&self.tableau.implicit)?, &self.k);
        let aux_g = weighted_sum(&DVector::zeros(yn.len()), dt, embedded_weights(&self.tableau.explicit)?, &self.k2);
        Ok(scaled_error(&(ynew - aux_f - aux_g), yn, ynew, atol, rtol))
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        out.insert("newton iterations".to_string(), self.core.newton_iterations.to_string());
        out.insert("factorizations".to_string(), self.factorizations.to_string());
    }
}
