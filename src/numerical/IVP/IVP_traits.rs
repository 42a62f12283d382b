//! Narrow capability interfaces of an initial value problem.
//!
//! A problem always implements [`Evaluable`]. Analytic derivatives come through
//! [`Differentiable`], additive splitting through [`Splittable`]; both traits have
//! default methods returning `None`, which means "not provided by this problem".
use crate::somelinalg::stepper_matrix::SystemMatrix;
use nalgebra::DVector;

pub trait Evaluable {
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn initial_condition(&self) -> DVector<f64>;
    /// full right-hand side f(t, y)
    fn rhs(&self, t: f64, y: &DVector<f64>) -> DVector<f64>;
}

pub trait Differentiable: Evaluable {
    /// closed-form Jacobian of split component `split` (0 is the full rhs)
    fn jac_analytic(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        None
    }
    /// closed-form partial derivative of split component `split` with respect to t
    fn dfdt_analytic(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        None
    }
}

pub trait Splittable: Evaluable {
    fn has_physical_split(&self) -> bool {
        false
    }
    /// additive component 1 or 2, the two components sum to the full rhs
    fn physical_split(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<DVector<f64>> {
        None
    }
    /// linear operator of a split component, used by exponential propagators
    fn split_mat(&self, _split: usize, _t: f64, _y: &DVector<f64>) -> Option<SystemMatrix> {
        None
    }
}

pub trait IVP: Differentiable + Splittable {}

impl<T: Differentiable + Splittable> IVP for T {}

/// result of asking whether an optional capability can be used in this build
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    Available,
    Unsupported(&'static str),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }
}

pub fn autodiff_capability() -> Capability {
    Capability::Unsupported("automatic differentiation is not available in this build")
}

pub fn sparse_capability() -> Capability {
    Capability::Available
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_reported() {
        assert!(!autodiff_capability().is_available());
        assert!(sparse_capability().is_available());
    }
}
