//! Per-integration view of a problem: derivative strategies, the Jacobian cache with
//! its freeze protocol, operator splitting and evaluation statistics.
//!
//! The problem itself is borrowed immutably; everything mutable (cached matrices, the
//! `frozen` flag, counters) lives here and is owned by the solver running the integration.
use crate::numerical::IVP::IVP_traits::{IVP, autodiff_capability, Capability};
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::SystemMatrix;
use log::debug;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIter, EnumString};

const EPS: f64 = f64::EPSILON;

/// how Jacobians and time derivatives are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum DerivativeStrategy {
    Analytic,
    Autodiff,
    Forward,
    Centred,
}

#[derive(Debug, Clone)]
pub struct DerivativeSettings {
    pub jacobian: DerivativeStrategy,
    pub dfdt: DerivativeStrategy,
    /// floor of the Jacobian perturbation
    pub jac_delta: f64,
    /// floor of the time perturbation
    pub dt_delta: f64,
    pub jacobian_splitting: bool,
    /// applied to the cached Jacobian under Jacobian splitting only
    pub jacobian_scaling: f64,
    pub sparse: bool,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        DerivativeSettings {
            jacobian: DerivativeStrategy::Forward,
            dfdt: DerivativeStrategy::Forward,
            jac_delta: 1e-5,
            dt_delta: 1e-5,
            jacobian_splitting: false,
            jacobian_scaling: 1.0,
            sparse: false,
        }
    }
}

/// one slot per split index (0, 1, 2) for Jacobians and split matrices
#[derive(Debug, Default)]
pub struct JacobianCache {
    jacs: [Option<SystemMatrix>; 3],
    split_mats: [Option<SystemMatrix>; 3],
    frozen: bool,
}

impl JacobianCache {
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn jacobian(&self, split: usize) -> Option<&SystemMatrix> {
        self.jacs.get(split).and_then(|j| j.as_ref())
    }

    pub fn split_matrix(&self, split: usize) -> Option<&SystemMatrix> {
        self.split_mats.get(split).and_then(|j| j.as_ref())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IVPStats {
    pub rhs_evaluations: usize,
    pub split_evaluations: [usize; 2],
    pub jacobian_evaluations: usize,
    pub dfdt_evaluations: usize,
}

pub struct IVPContext<'a> {
    problem: &'a dyn IVP,
    settings: DerivativeSettings,
    cache: JacobianCache,
    stats: IVPStats,
}

impl<'a> IVPContext<'a> {
    pub fn new(problem: &'a dyn IVP, settings: DerivativeSettings) -> Result<IVPContext<'a>> {
        for strategy in [settings.jacobian, settings.dfdt] {
            if strategy == DerivativeStrategy::Autodiff {
                if let Capability::Unsupported(reason) = autodiff_capability() {
                    return Err(StepperError::Unsupported(reason.to_string()));
                }
            }
        }
        if settings.jacobian_splitting && problem.has_physical_split() {
            return Err(StepperError::Configuration(format!(
                "problem {} defines a physical splitting, Jacobian splitting cannot be enabled",
                problem.name()
            )));
        }
        Ok(IVPContext {
            problem,
            settings,
            cache: JacobianCache::default(),
            stats: IVPStats::default(),
        })
    }

    pub fn problem(&self) -> &'a dyn IVP {
        self.problem
    }

    pub fn name(&self) -> &str {
        self.problem.name()
    }

    pub fn size(&self) -> usize {
        self.problem.size()
    }

    pub fn initial_condition(&self) -> DVector<f64> {
        self.problem.initial_condition()
    }

    pub fn settings(&self) -> &DerivativeSettings {
        &self.settings
    }

    pub fn cache(&self) -> &JacobianCache {
        &self.cache
    }

    pub fn is_sparse(&self) -> bool {
        self.settings.sparse
    }

    pub fn is_jacobian_splitting(&self) -> bool {
        self.settings.jacobian_splitting
    }

    /// callers bracket a full step with freeze(true) / freeze(false)
    pub fn freeze_jacobian(&mut self, frozen: bool) {
        self.cache.frozen = frozen;
    }

    /// full right-hand side
    pub fn rhs(&mut self, t: f64, y: &DVector<f64>) -> DVector<f64> {
        self.stats.rhs_evaluations += 1;
        self.problem.rhs(t, y)
    }

    /// split = 0 is the full rhs, 1 and 2 are the physical or Jacobian-derived components
    pub fn evaluate(&mut self, t: f64, y: &DVector<f64>, split: usize) -> Result<DVector<f64>> {
        if split == 0 {
            return Ok(self.rhs(t, y));
        }
        if split > 2 {
            return Err(StepperError::Configuration(format!("split index {} out of range", split)));
        }
        self.stats.split_evaluations[split - 1] += 1;
        if self.settings.jacobian_splitting {
            let jy = self
                .cache
                .jacobian(0)
                .ok_or_else(|| {
                    StepperError::NotDefined("Jacobian for Jacobian splitting (compute it before splitting)".to_string())
                })?
                .mul_vec(y);
            if split == 1 {
                return Ok(jy);
            }
            self.stats.rhs_evaluations += 1;
            return Ok(self.problem.rhs(t, y) - jy);
        }
        self.problem
            .physical_split(split, t, y)
            .ok_or_else(|| StepperError::NotDefined(format!("physical splitting of {}", self.problem.name())))
    }

    /// component used for differentiation: physical split or full rhs, never the Jacobian splitting
    fn raw_component(&self, t: f64, y: &DVector<f64>, split: usize) -> Result<DVector<f64>> {
        if split == 0 {
            Ok(self.problem.rhs(t, y))
        } else {
            self.problem
                .physical_split(split, t, y)
                .ok_or_else(|| StepperError::NotDefined(format!("physical splitting of {}", self.problem.name())))
        }
    }

    /// Jacobian of split `split`; while frozen the cached matrix is returned as is
    pub fn jac(&mut self, t: f64, y: &DVector<f64>, split: usize) -> Result<&SystemMatrix> {
        let mut split = split;
        if self.settings.jacobian_splitting {
            if split > 1 {
                return Err(StepperError::Configuration(
                    "Jacobian splitting defines only the Jacobian of split 1".to_string(),
                ));
            }
            split = 0;
        }
        if split > 2 {
            return Err(StepperError::Configuration(format!("split index {} out of range", split)));
        }
        if !(self.cache.frozen && self.cache.jacs[split].is_some()) {
            let mut jac = self.compute_jacobian(t, y, split)?;
            if self.settings.jacobian_splitting && self.settings.jacobian_scaling != 1.0 {
                jac = jac.scaled(self.settings.jacobian_scaling);
            }
            self.cache.jacs[split] = Some(jac);
        }
        self.cache.jacs[split]
            .as_ref()
            .ok_or_else(|| StepperError::NotDefined("Jacobian".to_string()))
    }

    /// linear operator of a split; under Jacobian splitting split 1 is the Jacobian
    pub fn split_mat(&mut self, t: f64, y: &DVector<f64>, split: usize) -> Result<&SystemMatrix> {
        if self.settings.jacobian_splitting {
            if split != 1 {
                return Err(StepperError::Configuration(
                    "Jacobian splitting only defines the matrix of split 1".to_string(),
                ));
            }
            return self.jac(t, y, 1);
        }
        if split == 0 || split > 2 {
            return Err(StepperError::Configuration(format!("split index {} has no matrix", split)));
        }
        if !(self.cache.frozen && self.cache.split_mats[split].is_some()) {
            let sparse = self.settings.sparse;
            let mat = self
                .problem
                .split_mat(split, t, y)
                .ok_or_else(|| StepperError::NotDefined(format!("split matrix {} of {}", split, self.problem.name())))?;
            self.cache.split_mats[split] = Some(into_storage(mat, sparse));
        }
        self.cache.split_mats[split]
            .as_ref()
            .ok_or_else(|| StepperError::NotDefined("split matrix".to_string()))
    }

    fn compute_jacobian(&mut self, t: f64, y: &DVector<f64>, split: usize) -> Result<SystemMatrix> {
        self.stats.jacobian_evaluations += 1;
        let sparse = self.settings.sparse;
        match self.settings.jacobian {
            DerivativeStrategy::Analytic => {
                let jac = self.problem.jac_analytic(split, t, y).ok_or_else(|| {
                    StepperError::NotDefined(format!("analytic Jacobian of {}", self.problem.name()))
                })?;
                Ok(into_storage(jac, sparse))
            }
            DerivativeStrategy::Autodiff => Err(StepperError::Unsupported(
                "automatic differentiation is not available in this build".to_string(),
            )),
            DerivativeStrategy::Forward => self.jac_finite_difference(t, y, split, false),
            DerivativeStrategy::Centred => self.jac_finite_difference(t, y, split, true),
        }
    }

    /// column j from perturbation delta_j = sqrt(eps * max(floor, |y_j|))
    fn jac_finite_difference(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        split: usize,
        centred: bool,
    ) -> Result<SystemMatrix> {
        let n = y.len();
        let f0 = if centred {
            None
        } else {
            Some(self.raw_component(t, y, split)?)
        };
        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        let mut dense = if self.settings.sparse {
            None
        } else {
            Some(DMatrix::zeros(n, n))
        };
        let mut yp = y.clone();
        for j in 0..n {
            let delta = (EPS * self.settings.jac_delta.max(y[j].abs())).sqrt();
            let column = match &f0 {
                Some(f0) => {
                    yp[j] = y[j] + delta;
                    let f1 = self.raw_component(t, &yp, split)?;
                    (f1 - f0) / delta
                }
                None => {
                    yp[j] = y[j] + delta;
                    let fplus = self.raw_component(t, &yp, split)?;
                    yp[j] = y[j] - delta;
                    let fminus = self.raw_component(t, &yp, split)?;
                    (fplus - fminus) / (2.0 * delta)
                }
            };
            yp[j] = y[j];
            match dense.as_mut() {
                Some(m) => m.set_column(j, &column),
                None => {
                    for (i, v) in column.iter().enumerate() {
                        if *v != 0.0 {
                            triplets.push((i, j, *v));
                        }
                    }
                }
            }
        }
        let evaluations = if centred { 2 * n } else { n + 1 };
        self.count_raw(split, evaluations);
        Ok(match dense {
            Some(m) => SystemMatrix::Dense(m),
            None => SystemMatrix::from_triplets(n, &triplets, true),
        })
    }

    fn count_raw(&mut self, split: usize, evaluations: usize) {
        if split == 0 {
            self.stats.rhs_evaluations += evaluations;
        } else {
            self.stats.split_evaluations[split - 1] += evaluations;
        }
    }

    /// partial derivative of split `split` with respect to t
    pub fn rhs_time_dt(&mut self, t: f64, y: &DVector<f64>, split: usize) -> Result<DVector<f64>> {
        self.stats.dfdt_evaluations += 1;
        let delta = (EPS * self.settings.dt_delta.max(t.abs())).sqrt();
        match self.settings.dfdt {
            DerivativeStrategy::Analytic => self.problem.dfdt_analytic(split, t, y).ok_or_else(|| {
                StepperError::NotDefined(format!("analytic time derivative of {}", self.problem.name()))
            }),
            DerivativeStrategy::Autodiff => Err(StepperError::Unsupported(
                "automatic differentiation is not available in this build".to_string(),
            )),
            DerivativeStrategy::Forward => {
                let f0 = self.raw_component(t, y, split)?;
                let f1 = self.raw_component(t + delta, y, split)?;
                self.count_raw(split, 2);
                Ok((f1 - f0) / delta)
            }
            DerivativeStrategy::Centred => {
                let fplus = self.raw_component(t + delta, y, split)?;
                let fminus = self.raw_component(t - delta, y, split)?;
                self.count_raw(split, 2);
                Ok((fplus - fminus) / (2.0 * delta))
            }
        }
    }

    pub fn stats(&self, out: &mut BTreeMap<String, String>) {
        out.insert("f evaluations".to_string(), self.stats.rhs_evaluations.to_string());
        if self.problem.has_physical_split() || self.settings.jacobian_splitting {
            out.insert("f1 evaluations".to_string(), self.stats.split_evaluations[0].to_string());
            out.insert("f2 evaluations".to_string(), self.stats.split_evaluations[1].to_string());
        }
        out.insert("jacobian evaluations".to_string(), self.stats.jacobian_evaluations.to_string());
        out.insert("dfdt evaluations".to_string(), self.stats.dfdt_evaluations.to_string());
        debug!("{} statistics collected", self.problem.name());
    }

    pub fn raw_stats(&self) -> &IVPStats {
        &self.stats
    }
}

fn into_storage(mat: SystemMatrix, sparse: bool) -> SystemMatrix {
    match (mat, sparse) {
        (SystemMatrix::Dense(m), true) => SystemMatrix::from_dense(m, true),
        (SystemMatrix::Sparse(m), false) => SystemMatrix::Dense(SystemMatrix::Sparse(m).to_dense()),
        (m, _) => m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::IVP::test_problems::{ProtheroRobinson, VanDerPol};
    use approx::assert_relative_eq;
    use strum::IntoEnumIterator;

    fn settings(jacobian: DerivativeStrategy) -> DerivativeSettings {
        DerivativeSettings {
            jacobian,
            ..DerivativeSettings::default()
        }
    }

    #[test]
    fn finite_difference_strategies_match_analytic() {
        let vdp = VanDerPol::new(0.1);
        let y = DVector::from_vec(vec![1.3, -0.4]);
        let mut analytic = IVPContext::new(&vdp, settings(DerivativeStrategy::Analytic)).unwrap();
        let exact = analytic.jac(0.0, &y, 0).unwrap().to_dense();
        for strategy in [DerivativeStrategy::Forward, DerivativeStrategy::Centred] {
            let mut ctx = IVPContext::new(&vdp, settings(strategy)).unwrap();
            let approx = ctx.jac(0.0, &y, 0).unwrap().to_dense();
            assert_relative_eq!(approx, exact, epsilon = 1e-4);
        }
        let mut ctx = IVPContext::new(&vdp, settings(DerivativeStrategy::Forward)).unwrap();
        let split2 = ctx.jac(0.0, &y, 2).unwrap().to_dense();
        assert_relative_eq!(split2[(0, 1)], 1.0, epsilon = 1e-6);
        assert_relative_eq!(split2[(1, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn autodiff_is_unsupported() {
        let vdp = VanDerPol::new(0.1);
        let res = IVPContext::new(&vdp, settings(DerivativeStrategy::Autodiff));
        assert!(matches!(res, Err(StepperError::Unsupported(_))));
    }

    #[test]
    fn every_strategy_name_round_trips() {
        for s in DerivativeStrategy::iter() {
            let parsed: DerivativeStrategy = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("Backward".parse::<DerivativeStrategy>().is_err());
    }

    #[test]
    fn frozen_jacobian_is_not_recomputed() {
        let vdp = VanDerPol::new(0.1);
        let mut ctx = IVPContext::new(&vdp, settings(DerivativeStrategy::Analytic)).unwrap();
        let y0 = DVector::from_vec(vec![2.0, 0.0]);
        let j0 = ctx.jac(0.0, &y0, 0).unwrap().to_dense();
        ctx.freeze_jacobian(true);
        let y1 = DVector::from_vec(vec![0.5, 1.0]);
        let j1 = ctx.jac(0.0, &y1, 0).unwrap().to_dense();
        assert_eq!(j0, j1);
        assert_eq!(ctx.raw_stats().jacobian_evaluations, 1);
        ctx.freeze_jacobian(false);
        let j2 = ctx.jac(0.0, &y1, 0).unwrap().to_dense();
        assert!(j2 != j0);
        assert_eq!(ctx.raw_stats().jacobian_evaluations, 2);
    }

    #[test]
    fn physical_split_components_sum_to_rhs() {
        let vdp = VanDerPol::new(0.05);
        let mut ctx = IVPContext::new(&vdp, DerivativeSettings::default()).unwrap();
        let y = DVector::from_vec(vec![1.1, 0.3]);
        let f = ctx.evaluate(0.0, &y, 0).unwrap();
        let f1 = ctx.evaluate(0.0, &y, 1).unwrap();
        let f2 = ctx.evaluate(0.0, &y, 2).unwrap();
        assert_relative_eq!(f, f1 + f2, epsilon = 1e-12);
    }

    #[test]
    fn jacobian_splitting_requires_cached_jacobian_and_sums_to_rhs() {
        let pr = ProtheroRobinson::new(-50.0);
        let s = DerivativeSettings {
            jacobian: DerivativeStrategy::Analytic,
            jacobian_splitting: true,
            jacobian_scaling: 0.5,
            ..DerivativeSettings::default()
        };
        let mut ctx = IVPContext::new(&pr, s).unwrap();
        let y = DVector::from_vec(vec![0.2]);
        assert!(matches!(ctx.evaluate(0.1, &y, 1), Err(StepperError::NotDefined(_))));
        let j = ctx.jac(0.1, &y, 1).unwrap().to_dense();
        // scaling applied once
        assert_relative_eq!(j[(0, 0)], -25.0, epsilon = 1e-12);
        ctx.freeze_jacobian(true);
        let j_again = ctx.jac(0.1, &y, 1).unwrap().to_dense();
        assert_relative_eq!(j_again[(0, 0)], -25.0, epsilon = 1e-12);
        let f = ctx.evaluate(0.1, &y, 0).unwrap();
        let f1 = ctx.evaluate(0.1, &y, 1).unwrap();
        let f2 = ctx.evaluate(0.1, &y, 2).unwrap();
        assert_relative_eq!(f1[0], -25.0 * 0.2, epsilon = 1e-12);
        assert_relative_eq!(f[0], f1[0] + f2[0], epsilon = 1e-12);
        assert!(matches!(ctx.jac(0.1, &y, 2), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn jacobian_splitting_rejected_for_physically_split_problem() {
        let vdp = VanDerPol::new(0.1);
        let s = DerivativeSettings {
            jacobian_splitting: true,
            ..DerivativeSettings::default()
        };
        assert!(matches!(IVPContext::new(&vdp, s), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn time_derivative_strategies_agree() {
        let pr = ProtheroRobinson::new(-10.0);
        let y = DVector::from_vec(vec![0.3]);
        let t = 0.7;
        let mut results = Vec::new();
        for dfdt in [DerivativeStrategy::Analytic, DerivativeStrategy::Forward, DerivativeStrategy::Centred] {
            let s = DerivativeSettings {
                dfdt,
                ..DerivativeSettings::default()
            };
            let mut ctx = IVPContext::new(&pr, s).unwrap();
            results.push(ctx.rhs_time_dt(t, &y, 0).unwrap()[0]);
        }
        assert_relative_eq!(results[0], results[1], epsilon = 1e-5);
        assert_relative_eq!(results[0], results[2], epsilon = 1e-6);
    }

    #[test]
    fn sparse_forward_difference_keeps_pattern() {
        let vdp = VanDerPol::new(0.1);
        let s = DerivativeSettings {
            sparse: true,
            ..DerivativeSettings::default()
        };
        let mut ctx = IVPContext::new(&vdp, s).unwrap();
        let y = DVector::from_vec(vec![2.0, 0.0]);
        let jac = ctx.jac(0.0, &y, 2).unwrap();
        assert!(jac.is_sparse());
        assert_eq!(jac.triplets().len(), 1);
    }
}
