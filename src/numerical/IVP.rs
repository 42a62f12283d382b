/// capability traits every problem implements
pub mod IVP_traits;
/// derivative strategies, Jacobian and split-matrix cache, evaluation counters
pub mod IVP_context;
/// small built-in problems usable from task files and tests
pub mod test_problems;
