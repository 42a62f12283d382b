//! Dense/sparse matrix wrapper used by the time steppers together with scope-bound
//! LU factorization handles. Dense storage is nalgebra `DMatrix`, sparse storage is
//! nalgebra-sparse `CscMatrix`; sparse systems are factored with faer's sparse LU.
use crate::numerical::stepper_error::{Result, StepperError};
use faer::col::{Col, ColRef};
use faer::linalg::solvers::Solve;
use faer::mat::{Mat, MatRef};
use faer::sparse::linalg::solvers::Lu as SparseLu;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::linalg::LU;
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex;

type faer_mat = SparseColMat<usize, f64>;

#[derive(Debug, Clone)]
pub enum SystemMatrix {
    Dense(DMatrix<f64>),
    Sparse(CscMatrix<f64>),
}

impl SystemMatrix {
    pub fn identity(n: usize, sparse: bool) -> SystemMatrix {
        if sparse {
            SystemMatrix::Sparse(CscMatrix::identity(n))
        } else {
            SystemMatrix::Dense(DMatrix::identity(n, n))
        }
    }
    /// build from (row, col, value) triplets; duplicate entries are summed
    pub fn from_triplets(n: usize, triplets: &[(usize, usize, f64)], sparse: bool) -> SystemMatrix {
        if sparse {
            let mut coo = CooMatrix::new(n, n);
            for &(i, j, v) in triplets {
                coo.push(i, j, v);
            }
            SystemMatrix::Sparse(CscMatrix::from(&coo))
        } else {
            let mut dense = DMatrix::zeros(n, n);
            for &(i, j, v) in triplets {
                dense[(i, j)] += v;
            }
            SystemMatrix::Dense(dense)
        }
    }
    /// dense matrix into the requested storage, zero entries are dropped for sparse storage
    pub fn from_dense(dense: DMatrix<f64>, sparse: bool) -> SystemMatrix {
        if !sparse {
            return SystemMatrix::Dense(dense);
        }
        let mut coo = CooMatrix::new(dense.nrows(), dense.ncols());
        for j in 0..dense.ncols() {
            for i in 0..dense.nrows() {
                let v = dense[(i, j)];
                if v != 0.0 {
                    coo.push(i, j, v);
                }
            }
        }
        SystemMatrix::Sparse(CscMatrix::from(&coo))
    }

    pub fn nrows(&self) -> usize {
        match self {
            SystemMatrix::Dense(m) => m.nrows(),
            SystemMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, SystemMatrix::Sparse(_))
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            SystemMatrix::Dense(m) => m.clone(),
            SystemMatrix::Sparse(m) => {
                let mut dense = DMatrix::zeros(m.nrows(), m.ncols());
                for (i, j, v) in m.triplet_iter() {
                    dense[(i, j)] += *v;
                }
                dense
            }
        }
    }

    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        match self {
            SystemMatrix::Dense(m) => {
                let mut out = Vec::new();
                for j in 0..m.ncols() {
                    for i in 0..m.nrows() {
                        if m[(i, j)] != 0.0 {
                            out.push((i, j, m[(i, j)]));
                        }
                    }
                }
                out
            }
            SystemMatrix::Sparse(m) => m.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect(),
        }
    }

    pub fn mul_vec(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            SystemMatrix::Dense(m) => m * v,
            SystemMatrix::Sparse(m) => m * v,
        }
    }

    pub fn scaled(&self, s: f64) -> SystemMatrix {
        match self {
            SystemMatrix::Dense(m) => SystemMatrix::Dense(m * s),
            SystemMatrix::Sparse(m) => {
                let mut coo = CooMatrix::new(m.nrows(), m.ncols());
                for (i, j, v) in m.triplet_iter() {
                    coo.push(i, j, s * v);
                }
                SystemMatrix::Sparse(CscMatrix::from(&coo))
            }
        }
    }

    /// alpha*I + beta*A
    pub fn shifted(&self, alpha: f64, beta: f64) -> SystemMatrix {
        let n = self.nrows();
        match self {
            SystemMatrix::Dense(m) => {
                let mut out = m * beta;
                for i in 0..n {
                    out[(i, i)] += alpha;
                }
                SystemMatrix::Dense(out)
            }
            SystemMatrix::Sparse(m) => {
                let mut coo = CooMatrix::new(n, n);
                for (i, j, v) in m.triplet_iter() {
                    coo.push(i, j, beta * v);
                }
                for i in 0..n {
                    coo.push(i, i, alpha);
                }
                SystemMatrix::Sparse(CscMatrix::from(&coo))
            }
        }
    }

    pub fn factor(&self) -> Result<Factorization> {
        match self {
            SystemMatrix::Dense(m) => {
                let lu = m.clone().lu();
                if !lu.is_invertible() {
                    return Err(StepperError::SingularMatrix);
                }
                Ok(Factorization::Dense(lu))
            }
            SystemMatrix::Sparse(m) => {
                let triplets: Vec<(usize, usize, f64)> =
                    m.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
                Ok(Factorization::Sparse(sparse_lu(m.nrows(), &triplets)?))
            }
        }
    }

    /// factorization of (alpha + i*beta)*I - A
    pub fn factor_complex_shift(&self, alpha: f64, beta: f64) -> Result<ComplexFactorization> {
        let n = self.nrows();
        match self {
            SystemMatrix::Dense(m) => {
                let mut cm: DMatrix<Complex<f64>> = m.map(|v| Complex::new(-v, 0.0));
                for i in 0..n {
                    cm[(i, i)] += Complex::new(alpha, beta);
                }
                let lu = cm.lu();
                if !lu.is_invertible() {
                    return Err(StepperError::SingularMatrix);
                }
                Ok(ComplexFactorization::Dense(lu))
            }
            SystemMatrix::Sparse(m) => {
                // real block form [[aI - A, -bI], [bI, aI - A]]
                let mut triplets = Vec::with_capacity(2 * m.nnz() + 4 * n);
                for (i, j, v) in m.triplet_iter() {
                    triplets.push((i, j, -*v));
                    triplets.push((i + n, j + n, -*v));
                }
                for i in 0..n {
                    triplets.push((i, i, alpha));
                    triplets.push((i + n, i + n, alpha));
                    triplets.push((i, i + n, -beta));
                    triplets.push((i + n, i, beta));
                }
                let merged = SystemMatrix::from_triplets(2 * n, &triplets, true).triplets();
                Ok(ComplexFactorization::SparseBlock {
                    n,
                    lu: sparse_lu(2 * n, &merged)?,
                })
            }
        }
    }
}

fn sparse_lu(n: usize, triplets: &[(usize, usize, f64)]) -> Result<SparseLu<usize, f64>> {
    let triplet: Vec<Triplet<usize, usize, f64>> = triplets
        .iter()
        .map(|t| Triplet::new(t.0, t.1, t.2))
        .collect::<Vec<_>>();
    let mat: faer_mat = SparseColMat::try_new_from_triplets(n, n, triplet.as_slice())
        .map_err(|e| StepperError::Unsupported(format!("sparse matrix assembly failed: {:?}", e)))?;
    mat.sp_lu().map_err(|_| StepperError::SingularMatrix)
}

fn sparse_solve(lu: &SparseLu<usize, f64>, b: &[f64]) -> Result<Vec<f64>> {
    let rhs: Col<f64> = ColRef::from_slice(b).to_owned();
    let lhs: MatRef<f64> = rhs.as_mat();
    let res: Mat<f64> = lu.solve(lhs);
    let res_vec: Vec<f64> = res.row_iter().map(|x| x[0]).collect();
    if res_vec.iter().any(|x| !x.is_finite()) {
        return Err(StepperError::SingularMatrix);
    }
    Ok(res_vec)
}

/// LU factorization handle, lives for a stage or a step and is released when dropped
pub enum Factorization {
    Dense(LU<f64, Dyn, Dyn>),
    Sparse(SparseLu<usize, f64>),
}

impl Factorization {
    pub fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>> {
        match self {
            Factorization::Dense(lu) => lu.solve(b).ok_or(StepperError::SingularMatrix),
            Factorization::Sparse(lu) => Ok(DVector::from_vec(sparse_solve(lu, b.as_slice())?)),
        }
    }
}

pub enum ComplexFactorization {
    Dense(LU<Complex<f64>, Dyn, Dyn>),
    SparseBlock { n: usize, lu: SparseLu<usize, f64> },
}

impl ComplexFactorization {
    /// solves for x + i*y given the right-hand side re + i*im
    pub fn solve(&self, re: &DVector<f64>, im: &DVector<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
        match self {
            ComplexFactorization::Dense(lu) => {
                let rhs = DVector::from_fn(re.len(), |i, _| Complex::new(re[i], im[i]));
                let x = lu.solve(&rhs).ok_or(StepperError::SingularMatrix)?;
                Ok((x.map(|c| c.re), x.map(|c| c.im)))
            }
            ComplexFactorization::SparseBlock { n, lu } => {
                let mut rhs = Vec::with_capacity(2 * n);
                rhs.extend(re.iter());
                rhs.extend(im.iter());
                let x = sparse_solve(lu, &rhs)?;
                Ok((
                    DVector::from_column_slice(&x[..*n]),
                    DVector::from_column_slice(&x[*n..]),
                ))
            }
        }
    }
}

pub fn rms(v: &DVector<f64>) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.norm() / (v.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[4.0, -1.0, 0.0, -1.0, 4.0, -1.0, 0.0, -1.0, 4.0])
    }

    #[test]
    fn dense_and_sparse_solve_agree() {
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let dense = SystemMatrix::from_dense(sample(), false);
        let sparse = SystemMatrix::from_dense(sample(), true);
        let xd = dense.factor().unwrap().solve(&b).unwrap();
        let xs = sparse.factor().unwrap().solve(&b).unwrap();
        for i in 0..3 {
            assert_relative_eq!(xd[i], xs[i], epsilon = 1e-12);
        }
        let back = dense.mul_vec(&xd);
        for i in 0..3 {
            assert_relative_eq!(back[i], b[i], epsilon = 1e-12);
        }
        assert_relative_eq!(sparse.mul_vec(&b), dense.mul_vec(&b), epsilon = 1e-14);
    }

    #[test]
    fn shifted_matches_dense_formula() {
        let a = SystemMatrix::from_dense(sample(), true);
        let s = a.shifted(2.0, -0.5).to_dense();
        let expected = DMatrix::identity(3, 3) * 2.0 - sample() * 0.5;
        assert_relative_eq!(s, expected, epsilon = 1e-14);
        assert_eq!(a.triplets().len(), 7);
    }

    #[test]
    fn singular_dense_matrix_is_reported() {
        let m = SystemMatrix::Dense(DMatrix::zeros(2, 2));
        assert!(matches!(m.factor(), Err(StepperError::SingularMatrix)));
    }

    #[test]
    fn complex_shift_dense_and_sparse_agree() {
        let re = DVector::from_vec(vec![1.0, 0.0, -1.0]);
        let im = DVector::from_vec(vec![0.5, 2.0, 0.0]);
        let dense = SystemMatrix::from_dense(sample(), false);
        let sparse = SystemMatrix::from_dense(sample(), true);
        let (xd, yd) = dense.factor_complex_shift(1.5, 0.7).unwrap().solve(&re, &im).unwrap();
        let (xs, ys) = sparse.factor_complex_shift(1.5, 0.7).unwrap().solve(&re, &im).unwrap();
        for i in 0..3 {
            assert_relative_eq!(xd[i], xs[i], epsilon = 1e-12);
            assert_relative_eq!(yd[i], ys[i], epsilon = 1e-12);
        }
        // ((a + ib) I - A)(x + iy) = re + i im
        let ax = dense.mul_vec(&xd);
        let ay = dense.mul_vec(&yd);
        for i in 0..3 {
            assert_relative_eq!(1.5 * xd[i] - 0.7 * yd[i] - ax[i], re[i], epsilon = 1e-12);
            assert_relative_eq!(0.7 * xd[i] + 1.5 * yd[i] - ay[i], im[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn rms_of_vector() {
        let v = DVector::from_vec(vec![3.0, 4.0]);
        assert_relative_eq!(rms(&v), (12.5f64).sqrt(), epsilon = 1e-14);
    }
}
