/// Method trait, the Methods enum and the name factory
pub mod method_api;
/// Butcher tableaus of the explicit, diagonally implicit and IMEX schemes
pub mod RK_tableaus;
/// ERK, DIRK and IMEX steppers
pub mod RK_methods;
/// Chebyshev polynomials, spectral radius estimate, stage counting
pub mod Chebyshev;
/// RKC1, RKC2, PRKC and IRKC
pub mod RKC_methods;
/// commutator-free exponential methods DIRKCF1-3 and ERKCF2
pub mod ExpRK_methods;
/// linearly implicit Rosenbrock method RODAS 4(3)
pub mod RODAS;
/// Radau IIA order 5
pub mod Radau5;
