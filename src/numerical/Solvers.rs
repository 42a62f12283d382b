/// standard, predictive and mixed step-size controllers
pub mod step_control;
/// integration loop, snapshots and run summary
pub mod solver_api;
