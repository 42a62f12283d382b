//! The integration loop: constant steps, embedded error control or step doubling.
//!
//! The solver owns the per-integration [`IVPContext`] (through [`StepContext`]), the
//! method and the step controller. Soft failures of a method (Newton divergence, NaN
//! candidate, singular iteration matrix) reject the attempt and shrink `dt` by minchange;
//! every other error aborts the run.
use crate::Utils::logger::{write_runinfo, write_snapshot};
use crate::numerical::IVP::IVP_context::IVPContext;
use crate::numerical::Methods::method_api::{Method, Methods, StepContext, get_tolerances};
use crate::numerical::Solvers::step_control::{ControlInput, StepController};
use crate::numerical::stepper_config::SolverSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::rms;
use chrono::Local;
use log::{debug, info, warn};
use nalgebra::DVector;
use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;
use strum_macros::{Display, EnumIter, EnumString};

/// smallest timestep before the run is abandoned
pub const MIN_TIMESTEP: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum SolverKind {
    ConstantSolver,
    EmbeddedSolver,
    StepDoublingSolver,
}

impl SolverKind {
    pub fn label(&self) -> &'static str {
        match self {
            SolverKind::ConstantSolver => "Constant Solver",
            SolverKind::EmbeddedSolver => "Embedded Solver",
            SolverKind::StepDoublingSolver => "Step Doubling Solver",
        }
    }
}

/// outcome of a finished integration
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tn: f64,
    pub yn: DVector<f64>,
    pub steps: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// largest error estimate among accepted steps (0 for the constant solver)
    pub max_accepted_eps: f64,
    pub elapsed_ms: u128,
    /// method and problem statistics
    pub stats: BTreeMap<String, String>,
}

fn has_nan(y: &DVector<f64>) -> bool {
    y.iter().any(|v| v.is_nan())
}

pub struct Solver<'a> {
    settings: SolverSettings,
    method: Methods,
    ctx: StepContext<'a>,
    control: StepController,
    tn: f64,
    dt: f64,
    yn: DVector<f64>,
    ynew: DVector<f64>,
    complete: bool,
    reject_step: bool,
    steps: usize,
    rejected_steps: usize,
    last_write_time: f64,
    max_accepted_eps: f64,
}

impl<'a> Solver<'a> {
    pub fn new(settings: SolverSettings, method: Methods, ivp: IVPContext<'a>) -> Result<Solver<'a>> {
        settings.validate()?;
        if settings.write_output {
            fs::create_dir_all(&settings.path)?;
        }
        let yn = ivp.initial_condition();
        info!(
            "{} with {} on {} (n = {}), t in [{}, {}]",
            settings.kind.label(),
            method.name(),
            ivp.name(),
            yn.len(),
            settings.tn,
            settings.tf
        );
        Ok(Solver {
            control: StepController::new(&settings),
            ctx: StepContext::new(ivp, settings.dt),
            tn: settings.tn,
            dt: settings.dt,
            ynew: yn.clone(),
            yn,
            method,
            complete: false,
            reject_step: false,
            steps: 0,
            rejected_steps: 0,
            last_write_time: settings.tn,
            max_accepted_eps: 0.0,
            settings,
        })
    }

    pub fn name(&self) -> &'static str {
        self.settings.kind.label()
    }

    pub fn method(&self) -> &Methods {
        &self.method
    }

    pub fn ivp(&self) -> &IVPContext<'a> {
        &self.ctx.ivp
    }

    pub fn run(&mut self) -> Result<RunReport> {
        let start = Instant::now();
        match self.settings.kind {
            SolverKind::ConstantSolver => self.run_constant()?,
            SolverKind::EmbeddedSolver => self.run_adaptive(false)?,
            SolverKind::StepDoublingSolver => self.run_adaptive(true)?,
        }
        let elapsed_ms = start.elapsed().as_millis();
        let mut stats = BTreeMap::new();
        self.method.stats(&mut stats);
        self.ctx.ivp.stats(&mut stats);
        info!(
            "{} finished at t = {} after {} steps ({} accepted, {} rejected) in {} ms",
            self.name(),
            self.tn,
            self.steps,
            self.ctx.counters.accepted_steps,
            self.rejected_steps,
            elapsed_ms
        );
        Ok(RunReport {
            tn: self.tn,
            yn: self.yn.clone(),
            steps: self.steps,
            accepted_steps: self.ctx.counters.accepted_steps,
            rejected_steps: self.rejected_steps,
            max_accepted_eps: self.max_accepted_eps,
            elapsed_ms,
            stats,
        })
    }

    /// Run summary: configuration entries, names, counters and statistics.
    pub fn run_info(&self, report: &RunReport, entries: &[(String, String)]) -> BTreeMap<String, String> {
        let mut info: BTreeMap<String, String> = entries.iter().cloned().collect();
        info.insert("ivp name".to_string(), self.ctx.ivp.name().to_string());
        info.insert("method name".to_string(), self.method.name().to_string());
        info.insert("solver name".to_string(), self.name().to_string());
        info.insert("date".to_string(), Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
        info.insert("time".to_string(), report.elapsed_ms.to_string());
        info.insert("steps".to_string(), report.steps.to_string());
        info.insert("accepted steps".to_string(), report.accepted_steps.to_string());
        info.insert("rejected steps".to_string(), report.rejected_steps.to_string());
        info.extend(report.stats.iter().map(|(k, v)| (k.clone(), v.clone())));
        info
    }

    /// writes `path/.runinfo`
    pub fn dump_run_info(&self, report: &RunReport, entries: &[(String, String)]) -> Result<BTreeMap<String, String>> {
        let info = self.run_info(report, entries);
        fs::create_dir_all(&self.settings.path)?;
        write_runinfo(&self.settings.path, &info)?;
        Ok(info)
    }

    ////////////////////////////////////////////////////////////////
    //                 SHARED STEP MACHINERY
    ////////////////////////////////////////////////////////////////
    fn check_max_steps(&self) -> Result<()> {
        if self.steps >= self.settings.max_steps {
            return Err(StepperError::ResourceExhausted(format!(
                "Maximum number of steps reached ({})",
                self.settings.max_steps
            )));
        }
        if self.dt < MIN_TIMESTEP {
            return Err(StepperError::ResourceExhausted("Minimum timestep reached".to_string()));
        }
        Ok(())
    }

    /// record 0 is the initial state; later records are skipped while min_write_time
    /// has not elapsed, except for the final one
    fn write_file(&mut self, index: usize) -> Result<()> {
        if !self.settings.write_output {
            return Ok(());
        }
        if self.last_write_time + self.settings.min_write_time > self.tn && !self.complete && index != 0 {
            return Ok(());
        }
        self.last_write_time = self.tn;
        write_snapshot(&self.settings.path, index, self.tn, &self.yn)
    }

    /// turns a soft failure into a method rejection
    fn soften<T>(&mut self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_soft() => {
                debug!("{} at t = {} with dt = {}, rejecting", e, self.tn, self.dt);
                self.method.set_accept(false);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn pre_step(&mut self) -> Result<()> {
        let mut dt = self.dt;
        let result = self.method.pre_step(&mut self.ctx, self.tn, &mut dt, &self.yn);
        self.dt = dt;
        self.soften(result).map(|_| ())
    }

    fn attempt(&mut self, tn: f64, dt: f64, y: &DVector<f64>) -> Result<DVector<f64>> {
        let result = self.method.step(&mut self.ctx, tn, dt, y);
        Ok(self
            .soften(result)?
            .unwrap_or_else(|| DVector::from_element(y.len(), f64::NAN)))
    }

    fn post_step(&mut self, dt: f64) -> Result<()> {
        let result = self.method.post_step(&mut self.ctx, self.tn, dt, &self.yn);
        self.soften(result).map(|_| ())
    }

    /// commits ynew; `span` is the number of dt the attempt covered
    fn update_timestep(&mut self, span: f64) {
        std::mem::swap(&mut self.yn, &mut self.ynew);
        self.tn += span * self.dt;
        self.method.update_timestep(&self.ctx.counters);
    }

    fn control_input(&self, eps: f64) -> ControlInput {
        ControlInput {
            eps,
            q: self.method.order().min(self.method.aux_order()),
            accepted_steps: self.ctx.counters.accepted_steps,
            reject_step: self.reject_step,
            dt: self.dt,
            dt_old: self.ctx.counters.dt_old,
        }
    }

    fn check_method_reject(&mut self) -> bool {
        if has_nan(&self.ynew) || !self.method.accept() {
            self.reject_step = true;
            self.complete = false;
            self.rejected_steps += 1;
            self.dt *= self.control.min_change();
            debug!("method rejected the step at t = {}, retrying with dt = {}", self.tn, self.dt);
            return true;
        }
        false
    }

    fn accept_step(&mut self, eps: f64, span: f64) {
        if self.check_method_reject() {
            return;
        }
        self.reject_step = false;
        self.update_timestep(span);
        let factor = self.control.factor(&self.control_input(eps));
        self.control.record_accepted(eps);
        self.max_accepted_eps = self.max_accepted_eps.max(eps);
        self.ctx.counters.dt_old = self.dt;
        self.dt /= factor;
        self.ctx.counters.accepted_steps += 1;
    }

    fn reject_with_error(&mut self, eps: f64) {
        if self.check_method_reject() {
            return;
        }
        self.reject_step = true;
        self.complete = false;
        self.dt /= self.control.reject_factor(&self.control_input(eps));
        self.rejected_steps += 1;
        debug!("error estimate {} rejected the step at t = {}, dt now {}", eps, self.tn, self.dt);
    }

    ////////////////////////////////////////////////////////////////
    //                 CONSTANT STEPS
    ////////////////////////////////////////////////////////////////
    fn run_constant(&mut self) -> Result<()> {
        self.write_file(0)?;
        while !self.complete {
            self.check_max_steps()?;
            let mut dt = self.dt;
            self.method.pre_step(&mut self.ctx, self.tn, &mut dt, &self.yn)?;
            self.dt = dt;
            if self.tn + self.dt * self.settings.last_step_stretch >= self.settings.tf {
                self.complete = true;
                self.dt = self.settings.tf - self.tn;
            }
            self.ynew = self.method.step(&mut self.ctx, self.tn, self.dt, &self.yn)?;
            if !self.method.accept() {
                warn!("{} did not converge at t = {}, the constant solver keeps the step", self.method.name(), self.tn);
                self.method.set_accept(true);
            }
            self.method.post_step(&mut self.ctx, self.tn, self.dt, &self.yn)?;
            self.update_timestep(1.0);
            self.ctx.counters.dt_old = self.dt;
            self.ctx.counters.accepted_steps += 1;
            self.steps += 1;
            self.write_file(self.steps)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////
    //                 EMBEDDED / STEP DOUBLING
    ////////////////////////////////////////////////////////////////
    fn run_adaptive(&mut self, doubling: bool) -> Result<()> {
        self.write_file(0)?;
        let (atol, rtol) = (self.settings.atol, self.settings.rtol);
        let stretch = self.settings.last_step_stretch;
        let tf = self.settings.tf;
        while !self.complete {
            loop {
                self.check_max_steps()?;
                self.method.set_accept(true);
                self.pre_step()?;
                let (eps, span) = if doubling {
                    if self.tn + self.dt * (1.0 + stretch) >= tf {
                        self.complete = true;
                        self.dt = (tf - self.tn) / 2.0;
                    }
                    (self.doubled_attempt(atol, rtol)?, 2.0)
                } else {
                    if self.tn + self.dt * stretch >= tf {
                        self.complete = true;
                        self.dt = tf - self.tn;
                    }
                    (self.embedded_attempt(atol, rtol)?, 1.0)
                };
                if eps <= 1.0 {
                    self.accept_step(eps, span);
                } else {
                    self.reject_with_error(eps);
                }
                self.steps += 1;
                if !self.reject_step {
                    break;
                }
            }
            self.write_file(self.ctx.counters.accepted_steps)?;
        }
        Ok(())
    }

    fn embedded_attempt(&mut self, atol: f64, rtol: f64) -> Result<f64> {
        let (tn, dt) = (self.tn, self.dt);
        let yn = self.yn.clone();
        self.ynew = self.attempt(tn, dt, &yn)?;
        self.post_step(dt)?;
        if !self.method.accept() || has_nan(&self.ynew) {
            return Ok(f64::INFINITY);
        }
        let result = self.method.calc_epsilon(&mut self.ctx, tn, dt, &yn, &self.ynew, atol, rtol);
        Ok(self.soften(result)?.unwrap_or(f64::INFINITY))
    }

    /// two steps of dt against one of 2 dt
    fn doubled_attempt(&mut self, atol: f64, rtol: f64) -> Result<f64> {
        let (tn, dt) = (self.tn, self.dt);
        let yn = self.yn.clone();
        let half = self.attempt(tn, dt, &yn)?;
        self.ynew = self.attempt(tn + dt, dt, &half)?;
        let double = self.attempt(tn, 2.0 * dt, &yn)?;
        self.post_step(dt)?;
        if !self.method.accept() || has_nan(&self.ynew) {
            return Ok(f64::INFINITY);
        }
        let err = (&self.ynew - double) / (2f64.powi(self.method.order() as i32) - 1.0);
        Ok(rms(&err.component_div(&get_tolerances(&yn, &self.ynew, atol, rtol))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Utils::logger::{list_snapshots, read_runinfo, read_snapshot};
    use crate::numerical::IVP::IVP_context::DerivativeSettings;
    use crate::numerical::IVP::IVP_traits::IVP;
    use crate::numerical::IVP::test_problems::{ExponentialDecay, VanDerPol};
    use crate::numerical::Solvers::step_control::StepControlType;
    use crate::numerical::stepper_config::MethodSettings;
    use approx::assert_relative_eq;
    use std::path::Path;
    use tempfile::tempdir;

    fn solve(problem: &dyn IVP, method: MethodSettings, settings: SolverSettings) -> Result<RunReport> {
        let ivp = IVPContext::new(problem, DerivativeSettings::default())?;
        let method = Methods::new(&method)?;
        Solver::new(settings, method, ivp)?.run()
    }

    fn settings(kind: SolverKind, path: &Path, tf: f64) -> SolverSettings {
        SolverSettings::new(kind, path, tf)
    }

    #[test]
    fn forward_euler_constant_steps() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::ConstantSolver, dir.path(), 1.0);
        s.dt = 0.01;
        let report = solve(&ExponentialDecay, MethodSettings::new("ForwardEuler"), s).unwrap();
        assert_eq!(report.steps, 100);
        assert_relative_eq!(report.tn, 1.0, epsilon = 1e-12);
        assert_relative_eq!(report.yn[0], 0.99f64.powi(100), epsilon = 1e-9);
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 101);
    }

    #[test]
    fn dopri_reaches_exact_solution_with_few_steps() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::EmbeddedSolver, dir.path(), 1.0);
        s.rtol = 1e-6;
        s.atol = 1e-6;
        s.dt = 0.01;
        let report = solve(&ExponentialDecay, MethodSettings::new("DOPR54"), s).unwrap();
        assert_relative_eq!(report.tn, 1.0, epsilon = 1e-12);
        assert_relative_eq!(report.yn[0], (-1.0f64).exp(), epsilon = 1e-5);
        assert!(report.accepted_steps < 50, "{} steps", report.accepted_steps);
        assert!(report.max_accepted_eps <= 1.0);
    }

    #[test]
    fn rejected_attempts_do_not_advance_time() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::EmbeddedSolver, dir.path(), 1.0);
        s.dt = 0.5;
        s.rtol = 1e-6;
        s.atol = 1e-6;
        let report = solve(&VanDerPol::new(0.1), MethodSettings::new("BS23"), s).unwrap();
        assert!(report.rejected_steps > 0);
        assert_eq!(report.steps, report.accepted_steps + report.rejected_steps);
        assert!(report.max_accepted_eps <= 1.0);
        let files = list_snapshots(dir.path()).unwrap();
        assert_eq!(files.len(), report.accepted_steps + 1);
        let mut last = f64::NEG_INFINITY;
        for file in &files {
            let (t, _) = read_snapshot(file).unwrap();
            assert!(t > last);
            last = t;
        }
        assert_relative_eq!(last, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn step_doubling_controls_rk4() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::StepDoublingSolver, dir.path(), 1.0);
        s.rtol = 1e-7;
        s.atol = 1e-7;
        let report = solve(&ExponentialDecay, MethodSettings::new("RK4"), s).unwrap();
        assert_relative_eq!(report.tn, 1.0, epsilon = 1e-12);
        assert_relative_eq!(report.yn[0], (-1.0f64).exp(), epsilon = 1e-6);
    }

    #[test]
    fn predictive_and_mixed_controllers_reach_tolerance() {
        for control in [StepControlType::Predictive, StepControlType::Mixed] {
            let dir = tempdir().unwrap();
            let mut s = settings(SolverKind::EmbeddedSolver, dir.path(), 1.0);
            s.step_control = control;
            s.rtol = 1e-6;
            s.atol = 1e-6;
            let report = solve(&VanDerPol::new(0.1), MethodSettings::new("RKF45"), s).unwrap();
            assert_relative_eq!(report.tn, 1.0, epsilon = 1e-12);
            assert!(report.max_accepted_eps <= 1.0, "{}", control);
        }
    }

    #[test]
    fn step_limit_is_fatal() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::ConstantSolver, dir.path(), 1.0);
        s.dt = 0.01;
        s.max_steps = 5;
        let err = solve(&ExponentialDecay, MethodSettings::new("RK4"), s).err().unwrap();
        assert!(matches!(err, StepperError::ResourceExhausted(_)));
        assert!(err.to_string().contains("Maximum number of steps reached (5)"));
    }

    #[test]
    fn persistent_newton_failure_exhausts_the_timestep() {
        let dir = tempdir().unwrap();
        let mut method = MethodSettings::new("Radau5");
        method.newton_fail = 0.0;
        let s = settings(SolverKind::EmbeddedSolver, dir.path(), 1.0);
        let err = solve(&VanDerPol::new(0.1), method, s).err().unwrap();
        assert!(err.to_string().contains("Minimum timestep reached"));
    }

    #[test]
    fn embedded_solver_needs_an_error_estimate() {
        let dir = tempdir().unwrap();
        let s = settings(SolverKind::EmbeddedSolver, dir.path(), 1.0);
        let err = solve(&ExponentialDecay, MethodSettings::new("RK4"), s).err().unwrap();
        assert!(matches!(err, StepperError::Configuration(_)));
    }

    #[test]
    fn run_info_is_written() {
        let dir = tempdir().unwrap();
        let mut s = settings(SolverKind::EmbeddedSolver, dir.path(), 0.5);
        s.min_write_time = 0.1;
        let problem = VanDerPol::new(0.1);
        let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
        let method = Methods::new(&MethodSettings::new("Radau5")).unwrap();
        let mut solver = Solver::new(s, method, ivp).unwrap();
        let report = solver.run().unwrap();
        let entries = vec![("method name".to_string(), "overridden".to_string())];
        solver.dump_run_info(&report, &entries).unwrap();
        let info = read_runinfo(dir.path()).unwrap();
        assert_eq!(info["solver name"], "Embedded Solver");
        assert_eq!(info["method name"], "Radau IIA 5");
        assert_eq!(info["ivp name"], "VanDerPol");
        assert_eq!(info["accepted steps"], report.accepted_steps.to_string());
        assert!(info.contains_key("newton iterations"));
        assert!(info.contains_key("f evaluations"));
        // min_write_time thins the records but keeps the first and the last
        let files = list_snapshots(dir.path()).unwrap();
        assert!(files.len() <= report.accepted_steps + 1);
        let (t_last, _) = read_snapshot(files.last().unwrap()).unwrap();
        assert_relative_eq!(t_last, 0.5, epsilon = 1e-12);
    }
}
