//! Built-in problems: textbook ODEs with known behaviour, used by the runner and the tests.
use crate::numerical::IVP::IVP_traits::{Differentiable, Evaluable, IVP, Splittable};
use crate::numerical::stepper_config::IVPSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::SystemMatrix;
use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum ProblemKind {
    ExponentialDecay,
    LinearScalar,
    VanDerPol,
    StiffDiagonal,
    Heat1D,
    ProtheroRobinson,
}

/// problem named in the configuration, with its parameters read from the problem section
pub fn create_problem(settings: &IVPSettings) -> Result<Box<dyn IVP>> {
    let kind: ProblemKind = settings.name.parse().map_err(|_| {
        StepperError::Configuration(format!("IVP class {} is not defined", settings.name))
    })?;
    let problem: Box<dyn IVP> = match kind {
        ProblemKind::ExponentialDecay => Box::new(ExponentialDecay),
        ProblemKind::LinearScalar => Box::new(LinearScalar::new(
            settings.parameter("lambda", -1.0),
            settings.parameter("y0", 1.0),
        )),
        ProblemKind::VanDerPol => Box::new(VanDerPol::new(settings.parameter("epsilon", 0.01))),
        ProblemKind::StiffDiagonal => {
            let size = settings.parameter("size", 10.0) as usize;
            let stiffness = settings.parameter("stiffness", 1000.0);
            Box::new(StiffDiagonal::geometric(size, stiffness)?)
        }
        ProblemKind::Heat1D => Box::new(Heat1D::new(
            settings.parameter("size", 50.0) as usize,
            settings.parameter("diffusion", 1.0),
            settings.parameter("reaction", 0.0),
        )?),
        ProblemKind::ProtheroRobinson => {
            Box::new(ProtheroRobinson::new(settings.parameter("lambda", -100.0)))
        }
    };
    Ok(problem)
}

/// y' = -y, y(0) = 1
#[derive(Debug, Clone)]
pub struct ExponentialDecay;

impl Evaluable for ExponentialDecay {
    fn name(&self) -> &str {
        "ExponentialDecay"
    }
    fn size(&self) -> usize {
        1
    }
    fn initial_condition(&self) -> DVector<f64> {
        DVector::from_element(1, 1.0)
    }
    fn rhs(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        -y
    }
}

impl Differentiable for ExponentialDecay {
    fn jac_analytic(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        (split == 0).then(|| SystemMatrix::Dense(DMatrix::from_element(1, 1, -1.0)))
    }
    fn dfdt_analytic(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        Some(DVector::zeros(1))
    }
}

impl Splittable for ExponentialDecay {}

/// y' = lambda*y
#[derive(Debug, Clone)]
pub struct LinearScalar {
    pub lambda: f64,
    pub y0: f64,
}

impl LinearScalar {
    pub fn new(lambda: f64, y0: f64) -> Self {
        LinearScalar { lambda, y0 }
    }
}

impl Evaluable for LinearScalar {
    fn name(&self) -> &str {
        "LinearScalar"
    }
    fn size(&self) -> usize {
        1
    }
    fn initial_condition(&self) -> DVector<f64> {
        DVector::from_element(1, self.y0)
    }
    fn rhs(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        y * self.lambda
    }
}

impl Differentiable for LinearScalar {
    fn jac_analytic(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        (split == 0).then(|| SystemMatrix::Dense(DMatrix::from_element(1, 1, self.lambda)))
    }
    fn dfdt_analytic(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        Some(DVector::zeros(1))
    }
}

impl Splittable for LinearScalar {}

/// Van der Pol oscillator in relaxation form
/// Y' = Z, Z' = ((1 - Y^2) Z - Y) / epsilon
/// split 1 is the stiff relaxation part, split 2 the linear transport part
#[derive(Debug, Clone)]
pub struct VanDerPol {
    pub epsilon: f64,
}

impl VanDerPol {
    pub fn new(epsilon: f64) -> Self {
        VanDerPol { epsilon }
    }
    fn relaxation(&self, y: &DVector<f64>) -> f64 {
        ((1.0 - y[0] * y[0]) * y[1] - y[0]) / self.epsilon
    }
}

impl Evaluable for VanDerPol {
    fn name(&self) -> &str {
        "VanDerPol"
    }
    fn size(&self) -> usize {
        2
    }
    fn initial_condition(&self) -> DVector<f64> {
        DVector::from_vec(vec![2.0, -0.6654321])
    }
    fn rhs(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![y[1], self.relaxation(y)])
    }
}

impl Differentiable for VanDerPol {
    fn jac_analytic(&self, split: usize, _t: f64, y: &DVector<f64>) -> Option<SystemMatrix> {
        let (Y, Z) = (y[0], y[1]);
        let j10 = (-2.0 * Y * Z - 1.0) / self.epsilon;
        let j11 = (1.0 - Y * Y) / self.epsilon;
        let jac = match split {
            0 => DMatrix::from_row_slice(2, 2, &[0.0, 1.0, j10, j11]),
            1 => DMatrix::from_row_slice(2, 2, &[0.0, 0.0, j10, j11]),
            2 => DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]),
            _ => return None,
        };
        Some(SystemMatrix::Dense(jac))
    }
    fn dfdt_analytic(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        Some(DVector::zeros(2))
    }
}

impl Splittable for VanDerPol {
    fn has_physical_split(&self) -> bool {
        true
    }
    fn physical_split(&self, split: usize, _t: f64, y: &DVector<f64>) -> Option<DVector<f64>> {
        match split {
            1 => Some(DVector::from_vec(vec![0.0, self.relaxation(y)])),
            2 => Some(DVector::from_vec(vec![y[1], 0.0])),
            _ => None,
        }
    }
    fn split_mat(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        (split == 2).then(|| SystemMatrix::Dense(DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0])))
    }
}

/// y' = -diag(d) y with known spectral radius max(d)
#[derive(Debug, Clone)]
pub struct StiffDiagonal {
    pub decay: Vec<f64>,
}

impl StiffDiagonal {
    pub fn new(decay: Vec<f64>) -> Self {
        StiffDiagonal { decay }
    }
    /// rates spread geometrically from 1 to `stiffness`
    pub fn geometric(size: usize, stiffness: f64) -> Result<Self> {
        if size == 0 || stiffness <= 0.0 {
            return Err(StepperError::Configuration(
                "StiffDiagonal needs size > 0 and stiffness > 0".to_string(),
            ));
        }
        let decay = (0..size)
            .map(|i| {
                if size == 1 {
                    stiffness
                } else {
                    stiffness.powf(i as f64 / (size - 1) as f64)
                }
            })
            .collect();
        Ok(StiffDiagonal { decay })
    }
    pub fn spectral_radius(&self) -> f64 {
        self.decay.iter().cloned().fold(0.0, f64::max)
    }
}

impl Evaluable for StiffDiagonal {
    fn name(&self) -> &str {
        "StiffDiagonal"
    }
    fn size(&self) -> usize {
        self.decay.len()
    }
    fn initial_condition(&self) -> DVector<f64> {
        DVector::from_element(self.decay.len(), 1.0)
    }
    fn rhs(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(y.len(), |i, _| -self.decay[i] * y[i])
    }
}

impl Differentiable for StiffDiagonal {
    fn jac_analytic(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        if split != 0 {
            return None;
        }
        let n = self.decay.len();
        let triplets: Vec<(usize, usize, f64)> = (0..n).map(|i| (i, i, -self.decay[i])).collect();
        Some(SystemMatrix::from_triplets(n, &triplets, true))
    }
    fn dfdt_analytic(&self, _split: usize, _t: f64, y: &DVector<f64>) -> Option<DVector<f64>> {
        Some(DVector::zeros(y.len()))
    }
}

impl Splittable for StiffDiagonal {}

/// u_t = D u_xx + k u (1 - u) on (0, 1), u = 0 at both ends, u(x, 0) = sin(pi x)
/// second-order differences on `size` interior points
/// split 1 is the diffusion operator, split 2 the logistic reaction
#[derive(Debug, Clone)]
pub struct Heat1D {
    pub size: usize,
    pub diffusion: f64,
    pub reaction: f64,
}

impl Heat1D {
    pub fn new(size: usize, diffusion: f64, reaction: f64) -> Result<Self> {
        if size < 2 {
            return Err(StepperError::Configuration("Heat1D needs at least 2 points".to_string()));
        }
        Ok(Heat1D {
            size,
            diffusion,
            reaction,
        })
    }

    fn dx(&self) -> f64 {
        1.0 / (self.size + 1) as f64
    }

    fn laplacian(&self, y: &DVector<f64>) -> DVector<f64> {
        let n = self.size;
        let c = self.diffusion / (self.dx() * self.dx());
        DVector::from_fn(n, |i, _| {
            let left = if i > 0 { y[i - 1] } else { 0.0 };
            let right = if i + 1 < n { y[i + 1] } else { 0.0 };
            c * (left - 2.0 * y[i] + right)
        })
    }

    fn laplacian_triplets(&self) -> Vec<(usize, usize, f64)> {
        let n = self.size;
        let c = self.diffusion / (self.dx() * self.dx());
        let mut triplets = Vec::with_capacity(3 * n);
        for i in 0..n {
            if i > 0 {
                triplets.push((i, i - 1, c));
            }
            triplets.push((i, i, -2.0 * c));
            if i + 1 < n {
                triplets.push((i, i + 1, c));
            }
        }
        triplets
    }

    fn reaction_term(&self, y: &DVector<f64>) -> DVector<f64> {
        y.map(|u| self.reaction * u * (1.0 - u))
    }

    /// largest eigenvalue magnitude of the diffusion operator
    pub fn diffusion_spectral_radius(&self) -> f64 {
        let h = self.dx();
        4.0 * self.diffusion / (h * h) * (PI * self.size as f64 * h / 2.0).sin().powi(2)
    }
}

impl Evaluable for Heat1D {
    fn name(&self) -> &str {
        "Heat1D"
    }
    fn size(&self) -> usize {
        self.size
    }
    fn initial_condition(&self) -> DVector<f64> {
        let h = self.dx();
        DVector::from_fn(self.size, |i, _| (PI * (i + 1) as f64 * h).sin())
    }
    fn rhs(&self, _t: f64, y: &DVector<f64>) -> DVector<f64> {
        self.laplacian(y) + self.reaction_term(y)
    }
}

impl Differentiable for Heat1D {
    fn jac_analytic(&self, split: usize, _t: f64, y: &DVector<f64>) -> Option<SystemMatrix> {
        let n = self.size;
        let mut triplets = match split {
            0 | 1 => self.laplacian_triplets(),
            2 => Vec::new(),
            _ => return None,
        };
        if split != 1 {
            for i in 0..n {
                triplets.push((i, i, self.reaction * (1.0 - 2.0 * y[i])));
            }
        }
        Some(SystemMatrix::from_triplets(n, &triplets, true))
    }
    fn dfdt_analytic(&self, _split: usize, _t: f64, y: &DVector<f64>) -> Option<DVector<f64>> {
        Some(DVector::zeros(y.len()))
    }
}

impl Splittable for Heat1D {
    fn has_physical_split(&self) -> bool {
        true
    }
    fn physical_split(&self, split: usize, _t: f64, y: &DVector<f64>) -> Option<DVector<f64>> {
        match split {
            1 => Some(self.laplacian(y)),
            2 => Some(self.reaction_term(y)),
            _ => None,
        }
    }
    fn split_mat(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        (split == 1).then(|| SystemMatrix::from_triplets(self.size, &self.laplacian_triplets(), true))
    }
}

/// non-autonomous y' = lambda (y - sin t) + cos t, y(0) = 0, exact solution sin t
#[derive(Debug, Clone)]
pub struct ProtheroRobinson {
    pub lambda: f64,
}

impl ProtheroRobinson {
    pub fn new(lambda: f64) -> Self {
        ProtheroRobinson { lambda }
    }
}

impl Evaluable for ProtheroRobinson {
    fn name(&self) -> &str {
        "ProtheroRobinson"
    }
    fn size(&self) -> usize {
        1
    }
    fn initial_condition(&self) -> DVector<f64> {
        DVector::zeros(1)
    }
    fn rhs(&self, t: f64, y: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, self.lambda * (y[0] - t.sin()) + t.cos())
    }
}

impl Differentiable for ProtheroRobinson {
    fn jac_analytic(&self, split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        (split == 0).then(|| SystemMatrix::Dense(DMatrix::from_element(1, 1, self.lambda)))
    }
    fn dfdt_analytic(&self, split: usize, t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        (split == 0).then(|| DVector::from_element(1, -self.lambda * t.cos() - t.sin()))
    }
}

impl Splittable for ProtheroRobinson {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use strum::IntoEnumIterator;

    #[test]
    fn every_problem_is_constructible_by_name() {
        for kind in ProblemKind::iter() {
            let settings = IVPSettings::new(&kind.to_string());
            let problem = create_problem(&settings).unwrap();
            assert_eq!(problem.name(), kind.to_string());
            let y0 = problem.initial_condition();
            assert_eq!(y0.len(), problem.size());
            assert_eq!(problem.rhs(0.0, &y0).len(), problem.size());
        }
        assert!(create_problem(&IVPSettings::new("Lorenz")).is_err());
    }

    #[test]
    fn heat_splits_sum_and_jacobian_matches_rhs() {
        let heat = Heat1D::new(8, 0.5, 2.0).unwrap();
        let y = heat.initial_condition();
        let f = heat.rhs(0.0, &y);
        let f1 = heat.physical_split(1, 0.0, &y).unwrap();
        let f2 = heat.physical_split(2, 0.0, &y).unwrap();
        assert_relative_eq!(f, &f1 + &f2, epsilon = 1e-12);
        // diffusion is linear: split matrix times y reproduces split 1
        let lap = heat.split_mat(1, 0.0, &y).unwrap();
        assert_relative_eq!(lap.mul_vec(&y), f1, epsilon = 1e-10);
        // reaction is logistic: r u (1 - u)
        for (g, u) in f2.iter().zip(y.iter()) {
            assert_relative_eq!(*g, 2.0 * u * (1.0 - u), epsilon = 1e-14);
        }
        assert!(heat.diffusion_spectral_radius() > 0.0);
    }

    #[test]
    fn stiff_diagonal_rates() {
        let p = StiffDiagonal::geometric(5, 1e4).unwrap();
        assert_relative_eq!(p.decay[0], 1.0);
        assert_relative_eq!(p.spectral_radius(), 1e4, epsilon = 1e-8);
        assert!(StiffDiagonal::geometric(0, 1.0).is_err());
    }
}
