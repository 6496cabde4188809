//! Linear algebra primitives for the continuation engine.
//!
//! The continuation core never assumes an assembled Jacobian: everything is
//! expressed through the [`LinOp`] capability (apply, optionally transpose
//! apply, optionally assemble) so dense, sparse-backed, and matrix-free
//! operators all work. Solvers implement [`LinearSolver`], including the
//! two-right-hand-side overload that shares a single factorization.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy for the linear solver layer.
#[derive(Debug, Error)]
pub enum LinearSolverError {
    #[error("linear operator is singular to working precision")]
    Singular,
    #[error("operator does not support explicit assembly")]
    NoAssembly,
    #[error("iterative solver did not converge after {iterations} iterations")]
    DidNotConverge { iterations: usize },
    #[error("operator does not support transpose application")]
    TransposeUnsupported,
}

/// An opaque "apply the Jacobian" capability.
pub trait LinOp {
    fn dim(&self) -> usize;

    /// Computes `A * v`.
    fn apply(&self, v: &DVector<f64>) -> DVector<f64>;

    /// Computes `A' * v` when the operator supports it.
    fn apply_transpose(&self, v: &DVector<f64>) -> Option<DVector<f64>> {
        self.assemble().map(|m| m.transpose() * v)
    }

    /// Explicit dense assembly, when available.
    fn assemble(&self) -> Option<DMatrix<f64>> {
        None
    }

    /// Whether `apply_transpose` is expected to succeed.
    fn supports_transpose(&self) -> bool {
        self.assemble().is_some()
    }
}

impl LinOp for DMatrix<f64> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        self * v
    }

    fn apply_transpose(&self, v: &DVector<f64>) -> Option<DVector<f64>> {
        Some(self.transpose() * v)
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        Some(self.clone())
    }

    fn supports_transpose(&self) -> bool {
        true
    }
}

/// `shift * I + A` without forming the sum.
pub struct ShiftedOp<'a> {
    pub op: &'a dyn LinOp,
    pub shift: f64,
}

impl LinOp for ShiftedOp<'_> {
    fn dim(&self) -> usize {
        self.op.dim()
    }

    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = self.op.apply(v);
        if self.shift != 0.0 {
            out.axpy(self.shift, v, 1.0);
        }
        out
    }

    fn apply_transpose(&self, v: &DVector<f64>) -> Option<DVector<f64>> {
        let mut out = self.op.apply_transpose(v)?;
        if self.shift != 0.0 {
            out.axpy(self.shift, v, 1.0);
        }
        Some(out)
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        let mut m = self.op.assemble()?;
        if self.shift != 0.0 {
            for i in 0..m.nrows() {
                m[(i, i)] += self.shift;
            }
        }
        Some(m)
    }

    fn supports_transpose(&self) -> bool {
        self.op.supports_transpose()
    }
}

/// Transpose view of an operator. Construction fails for operators without
/// transpose support, so `apply` never has to.
pub struct TransposeOp<'a> {
    op: &'a dyn LinOp,
}

impl<'a> TransposeOp<'a> {
    pub fn new(op: &'a dyn LinOp) -> Result<Self, LinearSolverError> {
        if !op.supports_transpose() {
            return Err(LinearSolverError::TransposeUnsupported);
        }
        Ok(Self { op })
    }
}

impl LinOp for TransposeOp<'_> {
    fn dim(&self) -> usize {
        self.op.dim()
    }

    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        match self.op.apply_transpose(v) {
            Some(out) => out,
            None => unreachable!("transpose support checked in TransposeOp::new"),
        }
    }

    fn apply_transpose(&self, v: &DVector<f64>) -> Option<DVector<f64>> {
        Some(self.op.apply(v))
    }

    fn assemble(&self) -> Option<DMatrix<f64>> {
        self.op.assemble().map(|m| m.transpose())
    }

    fn supports_transpose(&self) -> bool {
        true
    }
}

/// Outcome of a linear solve: the solution plus aggregated iteration work.
#[derive(Debug, Clone)]
pub struct SolveOutput {
    pub x: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Generic linear solver capability.
pub trait LinearSolver {
    fn solve(&self, op: &dyn LinOp, rhs: &DVector<f64>) -> Result<SolveOutput, LinearSolverError>;

    /// Solves against two right-hand sides with a single factorization where
    /// the backend permits it.
    fn solve2(
        &self,
        op: &dyn LinOp,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(SolveOutput, SolveOutput), LinearSolverError> {
        Ok((self.solve(op, rhs1)?, self.solve(op, rhs2)?))
    }
}

/// Direct solver backed by nalgebra's LU decomposition. Requires assembly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn solve(&self, op: &dyn LinOp, rhs: &DVector<f64>) -> Result<SolveOutput, LinearSolverError> {
        let mat = op.assemble().ok_or(LinearSolverError::NoAssembly)?;
        let lu = mat.lu();
        let x = lu.solve(rhs).ok_or(LinearSolverError::Singular)?;
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinearSolverError::Singular);
        }
        Ok(SolveOutput {
            x,
            converged: true,
            iterations: 1,
        })
    }

    fn solve2(
        &self,
        op: &dyn LinOp,
        rhs1: &DVector<f64>,
        rhs2: &DVector<f64>,
    ) -> Result<(SolveOutput, SolveOutput), LinearSolverError> {
        let mat = op.assemble().ok_or(LinearSolverError::NoAssembly)?;
        let lu = mat.lu();
        let x1 = lu.solve(rhs1).ok_or(LinearSolverError::Singular)?;
        let x2 = lu.solve(rhs2).ok_or(LinearSolverError::Singular)?;
        if x1.iter().chain(x2.iter()).any(|v| !v.is_finite()) {
            return Err(LinearSolverError::Singular);
        }
        let out = |x| SolveOutput {
            x,
            converged: true,
            iterations: 1,
        };
        Ok((out(x1), out(x2)))
    }
}

/// Vector operations required by the Krylov solver. Implemented for flat
/// `DVector` storage and for the structured bordered pair.
pub trait KrylovVec: Clone {
    fn dot(&self, other: &Self) -> f64;

    fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// `self *= a`
    fn scale_mut(&mut self, a: f64);

    /// `self += a * x`
    fn axpy_vec(&mut self, a: f64, x: &Self);
}

impl KrylovVec for DVector<f64> {
    fn dot(&self, other: &Self) -> f64 {
        DVector::dot(self, other)
    }

    fn scale_mut(&mut self, a: f64) {
        *self *= a;
    }

    fn axpy_vec(&mut self, a: f64, x: &Self) {
        self.axpy(a, x, 1.0);
    }
}

/// Structured (state, scalar) pair used by the bordered matrix-free path.
#[derive(Debug, Clone)]
pub struct PairVec {
    pub u: DVector<f64>,
    pub s: f64,
}

impl KrylovVec for PairVec {
    fn dot(&self, other: &Self) -> f64 {
        self.u.dot(&other.u) + self.s * other.s
    }

    fn scale_mut(&mut self, a: f64) {
        self.u *= a;
        self.s *= a;
    }

    fn axpy_vec(&mut self, a: f64, x: &Self) {
        self.u.axpy(a, &x.u, 1.0);
        self.s += a * x.s;
    }
}

/// Abstract operator over any Krylov vector type.
pub trait KrylovOp<V: KrylovVec> {
    fn apply(&self, v: &V) -> V;
}

/// Configuration for the restarted GMRES solver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GmresConfig {
    pub restart: usize,
    pub max_iters: usize,
    pub tol: f64,
}

impl Default for GmresConfig {
    fn default() -> Self {
        Self {
            restart: 30,
            max_iters: 300,
            tol: 1e-10,
        }
    }
}

/// Restarted GMRES with Givens rotations, generic over the vector storage.
///
/// Returns the final iterate together with a convergence flag and the total
/// number of inner iterations performed.
pub fn gmres<V, Op>(op: &Op, b: &V, x0: &V, cfg: &GmresConfig) -> (V, bool, usize)
where
    V: KrylovVec,
    Op: KrylovOp<V>,
{
    let mut x = x0.clone();
    let b_norm = b.norm();
    if b_norm == 0.0 {
        let mut zero = b.clone();
        zero.scale_mut(0.0);
        return (zero, true, 0);
    }
    let threshold = cfg.tol * b_norm;
    let m = cfg.restart.max(1);
    let mut total_iters = 0usize;

    while total_iters < cfg.max_iters {
        // r = b - A x
        let mut r = b.clone();
        let ax = op.apply(&x);
        r.axpy_vec(-1.0, &ax);
        let beta = r.norm();
        if beta <= threshold {
            return (x, true, total_iters);
        }

        let mut basis: Vec<V> = Vec::with_capacity(m + 1);
        let mut v0 = r.clone();
        v0.scale_mut(1.0 / beta);
        basis.push(v0);

        let mut h = vec![vec![0.0f64; m]; m + 1];
        let mut cs = vec![0.0f64; m];
        let mut sn = vec![0.0f64; m];
        let mut g = vec![0.0f64; m + 1];
        g[0] = beta;

        let mut k_used = 0usize;
        let mut breakdown = false;

        for j in 0..m {
            if total_iters >= cfg.max_iters {
                break;
            }
            let mut w = op.apply(&basis[j]);
            for (i, vi) in basis.iter().enumerate().take(j + 1) {
                h[i][j] = w.dot(vi);
                w.axpy_vec(-h[i][j], vi);
            }
            let h_next = w.norm();
            h[j + 1][j] = h_next;

            // Apply accumulated rotations to the new column.
            for i in 0..j {
                let temp = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
                h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
                h[i][j] = temp;
            }
            let denom = (h[j][j] * h[j][j] + h[j + 1][j] * h[j + 1][j]).sqrt();
            if denom == 0.0 {
                breakdown = true;
                k_used = j;
                break;
            }
            cs[j] = h[j][j] / denom;
            sn[j] = h[j + 1][j] / denom;
            h[j][j] = denom;
            h[j + 1][j] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];

            total_iters += 1;
            k_used = j + 1;

            if g[j + 1].abs() <= threshold || h_next < f64::EPSILON * b_norm {
                breakdown = h_next < f64::EPSILON * b_norm;
                break;
            }
            let mut v_next = w;
            v_next.scale_mut(1.0 / h_next);
            basis.push(v_next);
        }

        if k_used > 0 {
            // Back substitution for the least-squares coefficients.
            let mut y = vec![0.0f64; k_used];
            for i in (0..k_used).rev() {
                let mut s = g[i];
                for (l, yl) in y.iter().enumerate().take(k_used).skip(i + 1) {
                    s -= h[i][l] * yl;
                }
                y[i] = s / h[i][i];
            }
            for (i, yi) in y.iter().enumerate() {
                x.axpy_vec(*yi, &basis[i]);
            }
        }

        let res_estimate = g[k_used].abs();
        if res_estimate <= threshold || breakdown {
            return (x, true, total_iters);
        }
    }

    (x, false, total_iters)
}

impl<Op: LinOp + ?Sized> KrylovOp<DVector<f64>> for &Op {
    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        LinOp::apply(*self, v)
    }
}

/// Iterative solver satisfying [`LinearSolver`] for matrix-free operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmresSolver {
    pub config: GmresConfig,
}

impl LinearSolver for GmresSolver {
    fn solve(&self, op: &dyn LinOp, rhs: &DVector<f64>) -> Result<SolveOutput, LinearSolverError> {
        let x0 = DVector::zeros(rhs.len());
        let (x, converged, iterations) = gmres(&op, rhs, &x0, &self.config);
        if !converged {
            return Err(LinearSolverError::DidNotConverge { iterations });
        }
        Ok(SolveOutput {
            x,
            converged,
            iterations,
        })
    }
}
