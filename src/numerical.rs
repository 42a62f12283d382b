//! time integration of initial value problems
/// crate error type and the soft/hard failure split
pub mod stepper_error;
/// typed run configuration built from a task document
pub mod stepper_config;
/// problem contract, per-integration context (Jacobians, splitting, freeze cache) and built-in problems
pub mod IVP;
/// Runge-Kutta, Chebyshev, exponential, Rosenbrock and collocation methods
pub mod Methods;
/// constant, embedded and step doubling solvers with their step-size controllers
pub mod Solvers;
