//! Butcher tableaus of the built-in Runge-Kutta methods.
//!
//! `c` is never written by hand: it is filled from the row sums of `a`.
use nalgebra::{DMatrix, DVector};
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Debug, Clone)]
pub struct ButcherTableau {
    pub name: &'static str,
    pub order: usize,
    pub aux_order: usize,
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    /// weights of the embedded solution, when the method has one
    pub b_aux: Option<DVector<f64>>,
    pub c: DVector<f64>,
}

impl ButcherTableau {
    /// `rows[i]` holds `a[i][0..rows[i].len()]`, the rest of the row is zero
    pub fn new(
        name: &'static str,
        order: usize,
        aux_order: usize,
        rows: &[&[f64]],
        b: &[f64],
        b_aux: Option<&[f64]>,
    ) -> Self {
        let m = b.len();
        let mut a = DMatrix::zeros(m, m);
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                a[(i, j)] = *value;
            }
        }
        let c = DVector::from_fn(m, |i, _| a.row(i).sum());
        ButcherTableau {
            name,
            order,
            aux_order,
            a,
            b: DVector::from_row_slice(b),
            b_aux: b_aux.map(DVector::from_row_slice),
            c,
        }
    }

    pub fn stages(&self) -> usize {
        self.b.len()
    }
}

////////////////////////////////////////////////////////////////
//                      EXPLICIT
////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum ERKKind {
    ForwardEuler,
    Runge2,
    Runge3,
    Kutta3,
    Heun2,
    Heun3,
    RK4,
    RK38,
    BS23,
    BS54,
    DOPR54,
    RKF45,
    Merson43,
    Zonneveld43,
    Verner65,
    FEHL78,
}

impl ERKKind {
    pub fn tableau(&self) -> ButcherTableau {
        match self {
            ERKKind::ForwardEuler => ButcherTableau::new("Forward Euler", 1, 1, &[], &[1.0], None),
            ERKKind::Runge2 => ButcherTableau::new("Runge 2", 2, 2, &[&[], &[0.5]], &[0.0, 1.0], None),
            ERKKind::Runge3 => ButcherTableau::new(
                "Runge 3",
                3,
                3,
                &[&[], &[0.5], &[0.0, 1.0], &[0.0, 0.0, 1.0]],
                &[1. / 6., 2. / 3., 0.0, 1. / 6.],
                None,
            ),
            ERKKind::Kutta3 => ButcherTableau::new(
                "Kutta 3",
                3,
                3,
                &[&[], &[0.5], &[-1.0, 2.0]],
                &[1. / 6., 2. / 3., 1. / 6.],
                None,
            ),
            ERKKind::Heun2 => ButcherTableau::new(
                "Heun 2",
                2,
                2,
                &[&[], &[1.0]],
                &[0.5, 0.5],
                Some(&[0.65, 0.35]),
            ),
            ERKKind::Heun3 => ButcherTableau::new(
                "Heun 3",
                3,
                3,
                &[&[], &[1. / 3.], &[0.0, 2. / 3.]],
                &[0.25, 0.0, 0.75],
                None,
            ),
            ERKKind::RK4 => ButcherTableau::new(
                "Runge-Kutta 4",
                4,
                4,
                &[&[], &[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]],
                &[1. / 6., 1. / 3., 1. / 3., 1. / 6.],
                None,
            ),
            ERKKind::RK38 => ButcherTableau::new(
                "Three-Eighths Rule 4",
                4,
                4,
                &[&[], &[1. / 3.], &[-1. / 3., 1.0], &[1.0, -1.0, 1.0]],
                &[1. / 8., 3. / 8., 3. / 8., 1. / 8.],
                None,
            ),
            ERKKind::BS23 => ButcherTableau::new(
                "Bogacki-Shampine 3(2)",
                3,
                2,
                &[&[], &[0.5], &[0.0, 0.75], &[2. / 9., 1. / 3., 4. / 9.]],
                &[2. / 9., 1. / 3., 4. / 9., 0.0],
                Some(&[7. / 24., 1. / 4., 1. / 3., 1. / 8.]),
            ),
            ERKKind::BS54 => ButcherTableau::new(
                "Bogacki-Shampine 5(4)",
                5,
                4,
                &[
                    &[],
                    &[1. / 6.],
                    &[2. / 27., 4. / 27.],
                    &[183. / 1372., -162. / 343., 1053. / 1372.],
                    &[68. / 297., -4. / 11., 42. / 143., 1960. / 3861.],
                    &[597. / 22528., 81. / 352., 63099. / 585728., 58653. / 366080., 4617. / 20480.],
                    &[
                        174197. / 959244.,
                        -30942. / 79937.,
                        8152137. / 19744439.,
                        666106. / 1039181.,
                        -29421. / 29068.,
                        482048. / 414219.,
                    ],
                    &[
                        587. / 8064.,
                        0.0,
                        4440339. / 15491840.,
                        24353. / 124800.,
                        387. / 44800.,
                        2152. / 5985.,
                        7267. / 94080.,
                    ],
                ],
                &[
                    587. / 8064.,
                    0.0,
                    4440339. / 15491840.,
                    24353. / 124800.,
                    387. / 44800.,
                    2152. / 5985.,
                    7267. / 94080.,
                    0.0,
                ],
                Some(&[
                    2479. / 34992.,
                    0.0,
                    123. / 416.,
                    612941. / 3411720.,
                    43. / 1440.,
                    2272. / 6561.,
                    79937. / 1113912.,
                    3293. / 556956.,
                ]),
            ),
            ERKKind::DOPR54 => ButcherTableau::new(
                "Dormand-Prince 5(4)",
                5,
                4,
                &[
                    &[],
                    &[1. / 5.],
                    &[3. / 40., 9. / 40.],
                    &[44. / 45., -56. / 15., 32. / 9.],
                    &[19372. / 6561., -25360. / 2187., 64448. / 6561., -212. / 729.],
                    &[9017. / 3168., -355. / 33., 46732. / 5247., 49. / 176., -5103. / 18656.],
                    &[35. / 384., 0.0, 500. / 1113., 125. / 192., -2187. / 6784., 11. / 84.],
                ],
                &[35. / 384., 0.0, 500. / 1113., 125. / 192., -2187. / 6784., 11. / 84., 0.0],
                Some(&[
                    5179. / 57600.,
                    0.0,
                    7571. / 16695.,
                    393. / 640.,
                    -92097. / 339200.,
                    187. / 2100.,
                    1. / 40.,
                ]),
            ),
            ERKKind::RKF45 => ButcherTableau::new(
                "Runge-Kutta-Fehlberg 4(5)",
                4,
                5,
                &[
                    &[],
                    &[1. / 4.],
                    &[3. / 32., 9. / 32.],
                    &[1932. / 2197., -7200. / 2197., 7296. / 2197.],
                    &[439. / 216., -8.0, 3680. / 513., -845. / 4104.],
                    &[-8. / 27., 2.0, -3544. / 2565., 1859. / 4104., -11. / 40.],
                ],
                &[25. / 216., 0.0, 1408. / 2565., 2197. / 4104., -1. / 5., 0.0],
                Some(&[16. / 135., 0.0, 6656. / 12825., 28561. / 56430., -9. / 50., 2. / 55.]),
            ),
            ERKKind::Merson43 => ButcherTableau::new(
                "Merson 4(3)",
                4,
                3,
                &[
                    &[],
                    &[1. / 3.],
                    &[1. / 6., 1. / 6.],
                    &[1. / 8., 0.0, 3. / 8.],
                    &[1. / 2., 0.0, -3. / 2., 2.0],
                ],
                &[1. / 6., 0.0, 0.0, 2. / 3., 1. / 6.],
                Some(&[1. / 10., 0.0, 3. / 10., 2. / 5., 1. / 5.]),
            ),
            ERKKind::Zonneveld43 => ButcherTableau::new(
                "Zonneveld 4(3)",
                4,
                3,
                &[
                    &[],
                    &[0.5],
                    &[0.0, 0.5],
                    &[0.0, 0.0, 1.0],
                    &[5. / 32., 7. / 32., 13. / 32., -1. / 32.],
                ],
                &[1. / 6., 1. / 3., 1. / 3., 1. / 6., 0.0],
                Some(&[-1. / 2., 7. / 3., 7. / 3., 13. / 6., -16. / 3.]),
            ),
            ERKKind::Verner65 => ButcherTableau::new(
                "Verner 6(5)",
                6,
                5,
                &[
                    &[],
                    &[1. / 6.],
                    &[4. / 75., 16. / 75.],
                    &[5. / 6., -8. / 3., 5. / 2.],
                    &[-165. / 64., 55. / 6., -425. / 64., 85. / 96.],
                    &[12. / 5., -8.0, 4015. / 612., -11. / 36., 88. / 255.],
                    &[-8263. / 15000., 124. / 75., -643. / 680., -81. / 250., 2484. / 10625., 0.0],
                    &[
                        3501. / 1720.,
                        -300. / 43.,
                        297275. / 52632.,
                        -319. / 2322.,
                        24068. / 84065.,
                        0.0,
                        3850. / 26703.,
                    ],
                ],
                &[3. / 40., 0.0, 875. / 2244., 23. / 72., 264. / 1955., 0.0, 125. / 11592., 43. / 616.],
                Some(&[13. / 160., 0.0, 2375. / 5984., 5. / 16., 12. / 85., 3. / 44., 0.0, 0.0]),
            ),
            ERKKind::FEHL78 => ButcherTableau::new(
                "Runge-Kutta-Fehlberg 7(8)",
                7,
                8,
                &[
                    &[],
                    &[2. / 27.],
                    &[1. / 36., 1. / 12.],
                    &[1. / 24., 0.0, 1. / 8.],
                    &[5. / 12., 0.0, -25. / 16., 25. / 16.],
                    &[1. / 20., 0.0, 0.0, 1. / 4., 1. / 5.],
                    &[-25. / 108., 0.0, 0.0, 125. / 108., -65. / 27., 125. / 54.],
                    &[31. / 300., 0.0, 0.0, 0.0, 61. / 225., -2. / 9., 13. / 900.],
                    &[2.0, 0.0, 0.0, -53. / 6., 704. / 45., -107. / 9., 67. / 90., 3.0],
                    &[-91. / 108., 0.0, 0.0, 23. / 108., -976. / 135., 311. / 54., -19. / 60., 17. / 6., -1. / 12.],
                    &[
                        2383. / 4100.,
                        0.0,
                        0.0,
                        -341. / 164.,
                        4496. / 1025.,
                        -301. / 82.,
                        2133. / 4100.,
                        45. / 82.,
                        45. / 164.,
                        18. / 41.,
                    ],
                    &[3. / 205., 0.0, 0.0, 0.0, 0.0, -6. / 41., -3. / 205., -3. / 41., 3. / 41., 6. / 41., 0.0],
                    &[
                        -1777. / 4100.,
                        0.0,
                        0.0,
                        -341. / 164.,
                        4496. / 1025.,
                        -289. / 82.,
                        2193. / 4100.,
                        51. / 82.,
                        33. / 164.,
                        12. / 41.,
                        0.0,
                        1.0,
                    ],
                ],
                &[
                    41. / 840.,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    34. / 105.,
                    9. / 35.,
                    9. / 35.,
                    9. / 280.,
                    9. / 280.,
                    41. / 840.,
                    0.0,
                    0.0,
                ],
                Some(&[
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    34. / 105.,
                    9. / 35.,
                    9. / 35.,
                    9. / 280.,
                    9. / 280.,
                    0.0,
                    41. / 840.,
                    41. / 840.,
                ]),
            ),
        }
    }
}

////////////////////////////////////////////////////////////////
//               DIAGONALLY IMPLICIT
////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum DIRKKind {
    BackwardEuler,
}

impl DIRKKind {
    pub fn tableau(&self) -> ButcherTableau {
        match self {
            DIRKKind::BackwardEuler => ButcherTableau::new("Backward Euler", 1, 1, &[&[1.0]], &[1.0], None),
        }
    }
}

////////////////////////////////////////////////////////////////
//               IMPLICIT-EXPLICIT PAIRS
////////////////////////////////////////////////////////////////
/// implicit tableau applied to split 1, explicit tableau applied to split 2
#[derive(Debug, Clone)]
pub struct IMEXTableau {
    pub implicit: ButcherTableau,
    pub explicit: ButcherTableau,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
pub enum IMEXKind {
    ARK1,
    ARS222,
}

impl IMEXKind {
    pub fn tableau(&self) -> IMEXTableau {
        match self {
            IMEXKind::ARK1 => IMEXTableau {
                implicit: ButcherTableau::new("ARK 1", 1, 1, &[&[1.0]], &[1.0], None),
                explicit: ButcherTableau::new("ARK 1", 1, 1, &[], &[1.0], None),
            },
            IMEXKind::ARS222 => {
                let gamma = 1.0 - 1.0 / 2f64.sqrt();
                let delta = 1.0 - 1.0 / (2.0 * gamma);
                IMEXTableau {
                    implicit: ButcherTableau::new(
                        "ARS(2,2,2)",
                        2,
                        2,
                        &[&[0.0], &[0.0, gamma], &[0.0, 1.0 - gamma, gamma]],
                        &[0.0, 1.0 - gamma, gamma],
                        None,
                    ),
                    explicit: ButcherTableau::new(
                        "ARS(2,2,2)",
                        2,
                        2,
                        &[&[], &[gamma], &[delta, 1.0 - delta]],
                        &[delta, 1.0 - delta, 0.0],
                        None,
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use strum::IntoEnumIterator;

    fn check_consistency(t: &ButcherTableau) {
        assert_eq!(t.a.nrows(), t.stages());
        assert_relative_eq!(t.b.sum(), 1.0, epsilon = 1e-12);
        if let Some(b_aux) = &t.b_aux {
            assert_eq!(b_aux.len(), t.stages());
            assert_relative_eq!(b_aux.sum(), 1.0, epsilon = 1e-12);
        }
        for i in 0..t.stages() {
            assert_relative_eq!(t.a.row(i).sum(), t.c[i], epsilon = 1e-14);
        }
    }

    #[test]
    fn every_tableau_is_consistent() {
        for kind in ERKKind::iter() {
            let t = kind.tableau();
            check_consistency(&t);
            // explicit means strictly lower triangular
            for i in 0..t.stages() {
                for j in i..t.stages() {
                    assert_eq!(t.a[(i, j)], 0.0, "{} a[{}][{}]", kind, i, j);
                }
            }
        }
        for kind in DIRKKind::iter() {
            check_consistency(&kind.tableau());
        }
        for kind in IMEXKind::iter() {
            let t = kind.tableau();
            check_consistency(&t.implicit);
            check_consistency(&t.explicit);
            assert_eq!(t.implicit.stages(), t.explicit.stages());
        }
    }

    #[test]
    fn nodes_match_literature() {
        let cases: Vec<(ERKKind, Vec<f64>)> = vec![
            (ERKKind::RK4, vec![0.0, 0.5, 0.5, 1.0]),
            (ERKKind::BS23, vec![0.0, 0.5, 0.75, 1.0]),
            (ERKKind::DOPR54, vec![0.0, 0.2, 0.3, 0.8, 8. / 9., 1.0, 1.0]),
            (ERKKind::RKF45, vec![0.0, 0.25, 0.375, 12. / 13., 1.0, 0.5]),
            (ERKKind::Merson43, vec![0.0, 1. / 3., 1. / 3., 0.5, 1.0]),
            (
                ERKKind::FEHL78,
                vec![0.0, 2. / 27., 1. / 9., 1. / 6., 5. / 12., 0.5, 5. / 6., 1. / 6., 2. / 3., 1. / 3., 1.0, 0.0, 1.0],
            ),
        ];
        for (kind, c) in cases {
            let t = kind.tableau();
            for (i, ci) in c.iter().enumerate() {
                assert_relative_eq!(t.c[i], *ci, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn ars222_has_repeated_diagonal() {
        let t = IMEXKind::ARS222.tableau().implicit;
        assert_eq!(t.a[(1, 1)], t.a[(2, 2)]);
        assert_relative_eq!(t.c[2], 1.0, epsilon = 1e-15);
        assert_relative_eq!(IMEXKind::ARS222.tableau().explicit.c[2], 1.0, epsilon = 1e-15);
    }

    #[test]
    fn names_parse() {
        assert_eq!("DOPR54".parse::<ERKKind>().unwrap(), ERKKind::DOPR54);
        assert!("BackwardEuler".parse::<ERKKind>().is_err());
        assert_eq!("BackwardEuler".parse::<DIRKKind>().unwrap(), DIRKKind::BackwardEuler);
    }
}
