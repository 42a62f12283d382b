//! RODAS 4(3): six-stage linearly implicit Rosenbrock method.
//!
//! Each step factors `I / (dt gamma) - J` once and performs one linear solve per stage.
use crate::numerical::Methods::method_api::{Method, MethodCore, StepContext, get_tolerances, size_stage_buffer};
use crate::numerical::stepper_config::MethodSettings;
use crate::numerical::stepper_error::{Result, StepperError};
use crate::somelinalg::stepper_matrix::rms;
use log::debug;
use nalgebra::DVector;
use std::collections::BTreeMap;

const GAMMA: f64 = 0.25;

/// one of the three published coefficient sets
#[derive(Debug, Clone)]
struct RosenbrockCoefficients {
    c: [f64; 5],
    d: [f64; 5],
    /// stage weights, row i uses the first i entries
    a: [[f64; 4]; 5],
    /// stage couplings divided by dt, row i uses the first i entries
    cc: [[f64; 5]; 6],
}

impl RosenbrockCoefficients {
    fn elliptic(mode: i64) -> Result<Self> {
        let coefficients = match mode {
            0 => RosenbrockCoefficients {
                c: [0.0, 0.386, 0.21, 0.63, 1.0],
                d: [0.25, -0.1043, 0.1035, -0.3620000000000023e-1, 0.0],
                a: [
                    [0.0; 4],
                    [1.544, 0.0, 0.0, 0.0],
                    [0.9466785280815826, 0.2557011698983284, 0.0, 0.0],
                    [3.314825187068521, 2.896124015972201, 0.9986419139977817, 0.0],
                    [1.221224509226641, 6.019134481288629, 12.53708332932087, -0.6878860361058950],
                ],
                cc: [
                    [0.0; 5],
                    [-5.6688, 0.0, 0.0, 0.0, 0.0],
                    [-2.430093356833875, -0.2063599157091915, 0.0, 0.0, 0.0],
                    [-0.1073529058151375, -9.594562251023355, -20.47028614809616, 0.0, 0.0],
                    [7.496443313967647, -10.24680431464352, -33.99990352819905, 11.70890893206160, 0.0],
                    [
                        8.083246795921522,
                        -7.981132988064893,
                        -31.52159432874371,
                        16.31930543123136,
                        -6.058818238834054,
                    ],
                ],
            },
            1 => RosenbrockCoefficients {
                c: [0.0, 0.3507221, 0.2557041, 0.6817790, 1.0],
                d: [0.25, -0.6902209999999998e-1, -0.9671999999999459e-3, -0.8797900000000025e-1, 0.0],
                a: [
                    [0.0; 4],
                    [1.4028884, 0.0, 0.0, 0.0],
                    [0.6581212688557198, -1.320936088384301, 0.0, 0.0],
                    [7.131197445744498, 16.02964143958207, -5.561572550509766, 0.0],
                    [22.73885722420363, 67.38147284535289, -31.21877493038560, 0.7285641833203814],
                ],
                cc: [
                    [0.0; 5],
                    [-5.1043536, 0.0, 0.0, 0.0, 0.0],
                    [-2.899967805418783, 4.040399359702244, 0.0, 0.0, 0.0],
                    [-32.64449927841361, -99.35311008728094, 49.99119122405989, 0.0, 0.0],
                    [-76.46023087151691, -278.5942120829058, 153.9294840910643, 10.97101866258358, 0.0],
                    [
                        -76.29701586804983,
                        -294.2795630511232,
                        162.0029695867566,
                        23.65166903095270,
                        -7.652977706771382,
                    ],
                ],
            },
            2 => RosenbrockCoefficients {
                c: [0.0, 0.75, 0.21, 0.63, 1.0],
                d: [0.25, -0.5, -0.23504e-1, -0.362e-1, 0.0],
                a: [
                    [0.0; 4],
                    [3.0, 0.0, 0.0, 0.0],
                    [1.831036793486759, 0.4955183967433795, 0.0, 0.0],
                    [2.304376582692669, -0.05249275245743001, -1.176798761832782, 0.0],
                    [-7.170454962423024, -4.741636671481785, -16.31002631330971, -1.062004044111401],
                ],
                cc: [
                    [0.0; 5],
                    [-12.0, 0.0, 0.0, 0.0, 0.0],
                    [-8.791795173947035, -2.207865586973518, 0.0, 0.0, 0.0],
                    [10.81793056857153, 6.780270611428266, 19.53485944642410, 0.0, 0.0],
                    [34.19095006749676, 15.49671153725963, 54.74760875964130, 14.16005392148534, 0.0],
                    [
                        34.62605830930532,
                        15.30084976114473,
                        56.99955578662667,
                        18.40807009793095,
                        -5.714285714285717,
                    ],
                ],
            },
            other => {
                return Err(StepperError::Configuration(format!(
                    "RODAS coefficients must be 0, 1, or 2 (got elliptic = {})",
                    other
                )));
            }
        };
        Ok(coefficients)
    }
}

pub struct RODAS {
    core: MethodCore,
    elliptic: i64,
    coefficients: RosenbrockCoefficients,
    k: Vec<DVector<f64>>,
    factorizations: usize,
}

impl RODAS {
    pub fn new(settings: &MethodSettings) -> Result<Self> {
        let coefficients = RosenbrockCoefficients::elliptic(settings.elliptic)?;
        debug!("RODAS with coefficient set {}", settings.elliptic);
        Ok(RODAS {
            core: MethodCore::new(settings),
            elliptic: settings.elliptic,
            coefficients,
            k: Vec::new(),
            factorizations: 0,
        })
    }
}

impl Method for RODAS {
    fn name(&self) -> &'static str {
        "RODAS 4(3)"
    }
    fn order(&self) -> usize {
        4
    }
    fn aux_order(&self) -> usize {
        3
    }
    fn core(&self) -> &MethodCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut MethodCore {
        &mut self.core
    }

    fn step(&mut self, ctx: &mut StepContext<'_>, tn: f64, dt: f64, yn: &DVector<f64>) -> Result<DVector<f64>> {
        let ivp = &mut ctx.ivp;
        let n = yn.len();
        let lu = ivp.jac(tn, yn, 0)?.shifted(1.0 / (dt * GAMMA), -1.0).factor()?;
        self.factorizations += 1;
        let dfdt = ivp.rhs_time_dt(tn, yn, 0)?;
        let coef = &self.coefficients;
        size_stage_buffer(&mut self.k, 6, n);

        let mut ynew = yn.clone();
        for i in 0..5 {
            ynew = yn.clone();
            for j in 0..i {
                ynew.axpy(coef.a[i][j], &self.k[j], 1.0);
            }
            let mut fnew = ivp.rhs(tn + dt * coef.c[i], &ynew) + &dfdt * (dt * coef.d[i]);
            for j in 0..i {
                fnew.axpy(coef.cc[i][j] / dt, &self.k[j], 1.0);
            }
            self.k[i] = lu.solve(&fnew)?;
        }
        // last two stages reuse the previous stage weights with coefficient one
        ynew += &self.k[4];
        let mut fnew = ivp.rhs(tn + dt, &ynew);
        for j in 0..5 {
            fnew.axpy(coef.cc[5][j] / dt, &self.k[j], 1.0);
        }
        self.k[5] = lu.solve(&fnew)?;
        ynew += &self.k[5];
        Ok(ynew)
    }

    fn calc_epsilon(
        &mut self,
        _ctx: &mut StepContext<'_>,
        _tn: f64,
        _dt: f64,
        yn: &DVector<f64>,
        ynew: &DVector<f64>,
        atol: f64,
        rtol: f64,
    ) -> Result<f64> {
        let k6 = self
            .k
            .get(5)
            .ok_or_else(|| StepperError::NotDefined("RODAS error estimate before the first step".to_string()))?;
        Ok(rms(&k6.component_div(&get_tolerances(yn, ynew, atol, rtol))))
    }

    fn stats(&self, out: &mut BTreeMap<String, String>) {
        out.insert("elliptic".to_string(), self.elliptic.to_string());
        out.insert("factorizations".to_string(), self.factorizations.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerical::IVP::IVP_context::{DerivativeSettings, IVPContext};
    use crate::numerical::IVP::test_problems::{LinearScalar, ProtheroRobinson};
    use approx::assert_relative_eq;

    fn integrate(ivp: IVPContext<'_>, method: &mut RODAS, dt: f64, steps: usize) -> DVector<f64> {
        let mut y = ivp.initial_condition();
        let mut ctx = StepContext::new(ivp, dt);
        for i in 0..steps {
            y = method.step(&mut ctx, i as f64 * dt, dt, &y).unwrap();
        }
        y
    }

    #[test]
    fn all_coefficient_sets_integrate_decay() {
        for mode in 0..3 {
            let mut settings = MethodSettings::new("RODAS");
            settings.elliptic = mode;
            let mut method = RODAS::new(&settings).unwrap();
            let problem = LinearScalar::new(-1.0, 1.0);
            let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
            let y = integrate(ivp, &mut method, 0.1, 10);
            assert_relative_eq!(y[0], (-1.0f64).exp(), max_relative = 1e-5);
        }
    }

    #[test]
    fn rejects_unknown_coefficient_set() {
        let mut settings = MethodSettings::new("RODAS");
        settings.elliptic = 3;
        assert!(matches!(RODAS::new(&settings), Err(StepperError::Configuration(_))));
    }

    #[test]
    fn stiff_non_autonomous_problem_stays_on_the_slow_manifold() {
        let mut method = RODAS::new(&MethodSettings::new("RODAS")).unwrap();
        let problem = ProtheroRobinson::new(-1e4);
        let ivp = IVPContext::new(&problem, DerivativeSettings::default()).unwrap();
        let dt = 0.05;
        let y = integrate(ivp, &mut method, dt, 20);
        assert_relative_eq!(y[0], 1.0f64.sin(), epsilon = 1e-4);
        let mut out = BTreeMap::new();
        method.stats(&mut out);
        assert_eq!(out["factorizations"], "20");
    }
}
