//! Step-size controllers of the adaptive solvers.
//!
//! A controller turns the scaled error `eps` of the last attempt into a divisor for the
//! step size: `dt_new = dt / factor`.
use crate::numerical::stepper_config::SolverSettings;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum StepControlType {
    /// elementary controller `eps^(1/(q+1))`
    Standard,
    /// Gustafsson predictive controller using the previous accepted step
    Predictive,
    /// the more cautious of the two
    Mixed,
}

/// what the controller needs to know about the attempt being judged
#[derive(Debug, Clone, Copy)]
pub struct ControlInput {
    pub eps: f64,
    /// min(order, aux_order) of the method
    pub q: usize,
    pub accepted_steps: usize,
    /// the attempt (or the previous one, while retrying) was rejected
    pub reject_step: bool,
    pub dt: f64,
    pub dt_old: f64,
}

#[derive(Debug, Clone)]
pub struct StepController {
    kind: StepControlType,
    safety: f64,
    min_change: f64,
    max_change: f64,
    max_rej_change: f64,
    restrict_reject: bool,
    eps_last: f64,
}

impl StepController {
    pub fn new(settings: &SolverSettings) -> Self {
        StepController {
            kind: settings.step_control,
            safety: settings.safety,
            min_change: settings.min_change,
            max_change: settings.max_change,
            max_rej_change: settings.max_rej_change,
            restrict_reject: settings.restrict_reject,
            eps_last: 0.0,
        }
    }

    pub fn kind(&self) -> StepControlType {
        self.kind
    }

    pub fn min_change(&self) -> f64 {
        self.min_change
    }

    fn standard(&self, input: &ControlInput) -> f64 {
        input.eps.powf(1.0 / (input.q as f64 + 1.0))
    }

    fn predictive(&self, input: &ControlInput) -> f64 {
        if input.accepted_steps == 0 || input.reject_step {
            return input.eps.sqrt();
        }
        if self.eps_last == 0.0 {
            return 1.0 / self.max_change;
        }
        (input.dt_old / input.dt) * (input.eps * input.eps / self.eps_last).powf(1.0 / (input.q as f64 + 1.0))
    }

    /// the step-size growth is bounded by maxchange and minchange, except for a
    /// rejected step when restrict_reject is off
    fn safety(&self, v: f64, reject_step: bool) -> f64 {
        if !self.restrict_reject && reject_step {
            return v / self.safety;
        }
        (v / self.safety).min(1.0 / self.min_change).max(1.0 / self.max_change)
    }

    pub fn factor(&self, input: &ControlInput) -> f64 {
        let factor = match self.kind {
            StepControlType::Standard => self.standard(input),
            StepControlType::Predictive => self.predictive(input),
            StepControlType::Mixed => self.standard(input).max(self.predictive(input)),
        };
        self.safety(factor, input.reject_step)
    }

    /// divisor applied to dt after an error-estimate rejection
    pub fn reject_factor(&self, input: &ControlInput) -> f64 {
        self.factor(input).max(1.0 / self.max_rej_change)
    }

    /// remembers the error of an accepted step for the predictive controller
    pub fn record_accepted(&mut self, eps: f64) {
        self.eps_last = eps;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::Solvers::solver_api::SolverKind;
    use approx::assert_relative_eq;
    use std::path::Path;

    fn controller(kind: StepControlType) -> StepController {
        let mut settings = SolverSettings::new(SolverKind::EmbeddedSolver, Path::new("out"), 1.0);
        settings.step_control = kind;
        StepController::new(&settings)
    }

    fn input(eps: f64) -> ControlInput {
        ControlInput {
            eps,
            q: 4,
            accepted_steps: 3,
            reject_step: false,
            dt: 0.1,
            dt_old: 0.1,
        }
    }

    #[test]
    fn standard_factor_is_safety_scaled_root() {
        let c = controller(StepControlType::Standard);
        assert_relative_eq!(c.factor(&input(0.5)), 0.5f64.powf(0.2) / 0.9);
    }

    #[test]
    fn growth_and_shrink_are_bounded() {
        let c = controller(StepControlType::Standard);
        // tiny error: dt may grow by at most maxchange
        assert_relative_eq!(c.factor(&input(1e-30)), 1.0 / 5.0);
        // huge error: dt may shrink by at most minchange
        assert_relative_eq!(c.factor(&input(1e30)), 1.0 / 0.2);
        assert_relative_eq!(c.reject_factor(&input(0.5)), 1.0);
    }

    #[test]
    fn predictive_uses_previous_error() {
        let mut c = controller(StepControlType::Predictive);
        // no history yet
        assert_relative_eq!(c.factor(&input(0.5)), 1.0 / 5.0);
        c.record_accepted(0.25);
        let expected = (0.5f64 * 0.5 / 0.25).powf(0.2) / 0.9;
        assert_relative_eq!(c.factor(&input(0.5)), expected);
        let first = ControlInput {
            accepted_steps: 0,
            ..input(0.5)
        };
        assert_relative_eq!(c.factor(&first), 0.5f64.sqrt() / 0.9);
    }

    #[test]
    fn mixed_takes_the_larger_divisor() {
        let mut c = controller(StepControlType::Mixed);
        c.record_accepted(0.9);
        let i = input(0.3);
        let standard = 0.3f64.powf(0.2);
        let predictive = (0.09f64 / 0.9).powf(0.2);
        assert_relative_eq!(c.factor(&i), standard.max(predictive) / 0.9);
    }
}
