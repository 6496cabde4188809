//! Eigenvalue computation as an injected capability.
//!
//! Detection only needs the leading spectrum, so the contract is: given a
//! Jacobian operator and a requested count `nev`, return eigenvalues sorted by
//! descending real part. The dense backend assembles and uses nalgebra; a
//! large-scale user can inject an iterative backend behind the same trait.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use crate::linalg::LinOp;

#[derive(Debug, Clone)]
pub struct EigenOutput {
    /// Eigenvalues sorted by descending real part, truncated to `nev`.
    pub values: Vec<Complex<f64>>,
    /// Optional eigenvector block (column i pairs with values[i]).
    pub vectors: Option<DMatrix<f64>>,
    pub converged: bool,
    pub iterations: usize,
}

pub trait EigenSolver {
    fn eigs(&self, op: &dyn LinOp, nev: usize) -> Result<EigenOutput>;
}

/// Dense eigensolver over an assembled Jacobian.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEigen;

impl EigenSolver for DenseEigen {
    fn eigs(&self, op: &dyn LinOp, nev: usize) -> Result<EigenOutput> {
        let Some(mat) = op.assemble() else {
            bail!("dense eigensolver requires an assemblable operator");
        };
        let mut values: Vec<Complex<f64>> = mat.complex_eigenvalues().iter().cloned().collect();
        values.sort_by(|a, b| b.re.partial_cmp(&a.re).unwrap_or(std::cmp::Ordering::Equal));
        if nev > 0 {
            values.truncate(nev);
        }
        Ok(EigenOutput {
            values,
            vectors: None,
            converged: true,
            iterations: 1,
        })
    }
}

/// Right and left near-null vectors of a matrix via SVD, unit norm.
///
/// Used to seed the minimally augmented border vectors from a singular (or
/// nearly singular) Jacobian.
pub fn near_null_vectors(mat: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = mat.nrows();
    if n == 0 {
        bail!("cannot compute null vectors of an empty matrix");
    }
    let svd = mat.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        bail!("SVD failed to produce singular vector bases");
    };
    let right: DVector<f64> = v_t.row(n - 1).transpose().into_owned();
    let left: DVector<f64> = u.column(n - 1).into_owned();
    let rn = right.norm();
    let ln = left.norm();
    if rn == 0.0 || ln == 0.0 {
        bail!("degenerate singular vectors");
    }
    Ok((right / rn, left / ln))
}

/// Orthonormal kernel and cokernel bases for singular values below `tol`.
///
/// Returns `(phi, psi)`: columns of `phi` span the (approximate) kernel,
/// columns of `psi` the cokernel.
pub fn kernel_bases(mat: &DMatrix<f64>, tol: f64) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>)> {
    let n = mat.nrows();
    if n == 0 {
        bail!("cannot compute kernel of an empty matrix");
    }
    let svd = mat.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        bail!("SVD failed to produce singular vector bases");
    };
    let mut phi = Vec::new();
    let mut psi = Vec::new();
    for (i, &s) in svd.singular_values.iter().enumerate() {
        if s < tol {
            phi.push(v_t.row(i).transpose().into_owned());
            psi.push(u.column(i).into_owned());
        }
    }
    Ok((phi, psi))
}

/// Counts eigenvalues with positive real part, and the subset of those with
/// imaginary part above `eps_imag`.
pub fn unstable_counts(values: &[Complex<f64>], tol_real: f64, eps_imag: f64) -> (usize, usize) {
    let unstable = values.iter().filter(|ev| ev.re > tol_real).count();
    let unstable_imag = values
        .iter()
        .filter(|ev| ev.re > tol_real && ev.im > eps_imag)
        .count();
    (unstable, unstable_imag)
}
