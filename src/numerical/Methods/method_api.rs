//! Common contract of all time-stepping methods and the factory that builds them by name.
//!
//! A method never stores references into the solver. Everything the solver owns and a
//! method may read (accepted step count, previous step size) is handed over in
//! [`StepContext`] together with the per-integration [`IVPContext`].
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::Methods::ExpRK_methods::{AdditiveExpRK, ExpRKKind};
use crate::numerical::Methods::RK_methods::{DIRK, ERK, IMEX};
use crate::numerical::Methods::RK_tableaus::{DIRKKind, ERKKind, IMEXKind};
use crate::numerical::Methods::RKC_methods::{RKC, RKCKind};
use crate::numerical::Methods::RODAS::RODAS;
use crate::numerical::Methods::Radau5::Radau5;
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use enum_dispatch::enum_dispatch;
use log::info;
use nalgebra::DVector;
use std::collections::BTreeMap;

/// Newton iteration budget shared by the implicit methods
pub const NEWTON_ITERATIONS: usize = 20;

/// solver-owned counters visible to methods
#[derive(Debug, Clone, Default)]
pub struct SolverCounters {
    pub accepted_steps: usize,
    pub dt_old: f64,
}

pub struct StepContext<'a> {
    pub ivp: IVPContext<'a>,
    pub counters: SolverCounters,
}

impl<'a> StepContext<'a> {
    pub fn new(ivp: IVPContext<'a>, dt: f64) -> StepContext<'a> {
        StepContext {
            ivp,
            counters: SolverCounters {
                accepted_steps: 0,
                dt_old: dt,
            },
        }
    }
}

/// settings and flags every method carries
#[derive(Debug, Clone)]
pub struct MethodCore {
    /// cleared by a method when its own iteration failed during the last step
    pub accept: bool,
    pub sparse: bool,
    pub newton_tol: f64,
    pub newton_fail: f64,
    pub newton_iterations: usize,
}

impl MethodCore {
    pub fn new(settings: &MethodSettings) -> Self {
        MethodCore {
            accept: true,
            sparse: settings.sparse,
            newton_tol: settings.newton_tol,
            newton_fail: settings.newton_fail,
            newton_iterations: 0,
        }
    }
}

#[enum_dispatch]
pub trait Method {
    fn name(&self) -> &'static str;
    fn order(&self) -> usize;
    fn aux_order(&self) -> usize {
        self.order()
    }
    fn core(&self) -> &MethodCore;
    fn core_mut(&mut self) -> &mut MethodCore;

    fn accept(&self) -> bool {
        self.core().accept
    }
    fn set_accept(&mut self, accept: bool) {
        self.core_mut().accept = accept;
    }

    /// may shrink `dt` (stability bounds of stabilized methods)
    fn pre_step(&mut self, _ctx: &mut StepContext<'_>, _tn: f64, _dt: &mut f64, _yn: &DVector<f64>) -> Result<()> {
        Ok(())
    }

    /// candidate solution at `tn + dt`
    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>>;

    fn post_step(&mut self, _ctx: &mut StepContext<'_>, _tn: f64, _dt: f64, _yn: &DVector<f64>) -> Result<()> {
        Ok(())
    }

    /// called once the solver has committed an accepted step
    fn update_timestep(&mut self, _counters: &SolverCounters) {}

    /// scaled RMS error estimate of the last step
    fn calc_epsilon(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _tn: f64,
        _dt: f64,
        _yn: &DVector<f64>,
        _ynew: &DVector<f64>,
        _atol: f64,
        _rtol: f64,
    ) -> Result<f64> {
        Err(StepperError::Configuration(format!(
            "{} does not provide an error estimate",
            self.name()
        )))
    }

    fn stats(&self, _out: &mut BTreeMap<String, String>) {}
}

#[enum_dispatch(Method)]
pub enum Methods {
    ERK(ERK),
    DIRK(DIRK),
    IMEX(IMEX),
    RKC(RKC),
    AdditiveExpRK(AdditiveExpRK),
    RODAS(RODAS),
    Radau5(Radau5),
}

impl Methods {
    pub fn new(settings: &MethodSettings) -> Result<Methods> {
        let name = settings.name.as_str();
        let method: Methods = if let Ok(kind) = name.parse::<ERKKind>() {
            ERK::new(settings, kind).into()
        } else if let Ok(kind) = name.parse::<DIRKKind>() {
            DIRK::new(settings, kind).into()
        } else if let Ok(kind) = name.parse::<IMEXKind>() {
            IMEX::new(settings, kind).into()
        } else if let Ok(kind) = name.parse::<RKCKind>() {
            RKC::new(settings, kind).into()
        } else if let Ok(kind) = name.parse::<ExpRKKind>() {
            AdditiveExpRK::new(settings, kind)?.into()
        } else if name == "RODAS" {
            RODAS::new(settings)?.into()
        } else if name == "Radau5" {
            Radau5::new(settings).into()
        } else {
            return Err(StepperError::Configuration(format!("unknown method '{}'", name)));
        };
        info!("method {} (order {}) created", method.name(), method.order());
        Ok(method)
    }
}

/// componentwise `max(|a_i|, |b_i|) * rtol + atol`
pub fn get_tolerances(a: &DVector<f64>, b: &DVector<f64>, atol: f64, rtol: f64) -> DVector<f64> {
    a.zip_map(b, |ai, bi| ai.abs().max(bi.abs()) * rtol + atol)
}

/// RMS of `err` divided componentwise by the tolerance vector of `a` and `b`
pub fn scaled_error(err: &DVector<f64>, a: &DVector<f64>, b: &DVector<f64>, atol: f64, rtol: f64) -> f64 {
    let tol = get_tolerances(a, b, atol, rtol);
    crate::somelinalg::stepper_matrix::rms(&err.component_div(&tol))
}

/// sizes a stage buffer on the first step; later steps overwrite the slots in place
pub(crate) fn size_stage_buffer(k: &mut Vec<DVector<f64>>, stages: usize, n: usize) {
    if k.len() != stages || k.first().is_some_and(|v| v.len() != n) {
        *k = vec![DVector::zeros(n); stages];
    }
}
