//! linear algebra used by the steppers
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
/// dense or sparse system matrix with LU factorizations (real and complex shifted)
pub mod stepper_matrix;
