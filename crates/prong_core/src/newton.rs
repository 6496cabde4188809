//! Newton iteration primitive.
//!
//! The continuation engine treats Newton as a contract: iterate, report a
//! `converged` flag and the residual history, never turn non-convergence into
//! an error. Deflation (see [`crate::deflation`]) plugs in as an optional
//! penalty that repels the iteration from already-found roots.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::deflation::DeflationOperator;
use crate::linalg::{DenseLu, LinearSolver};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonOptions {
    pub max_iters: usize,
    /// Residual norm tolerance.
    pub tol: f64,
    /// Update norm below which the iteration is considered stalled-converged.
    pub step_tol: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iters: 25,
            tol: 1e-10,
            step_tol: 1e-12,
        }
    }
}

/// Outcome of a Newton run. Non-convergence is a flag, not an error.
#[derive(Debug, Clone)]
pub struct NewtonReport {
    pub converged: bool,
    pub iterations: usize,
    /// Residual norm per iteration, starting with the initial residual.
    pub residuals: Vec<f64>,
}

/// Per-iteration observer: `(iteration, current iterate, residual norm)`.
pub type NewtonCallback<'a> = &'a mut dyn FnMut(usize, &DVector<f64>, f64);

/// Newton iteration on `F(x) = 0` with an optional deflation operator.
///
/// With deflation active the iteration targets `M(x) * F(x) = 0`; the rank-one
/// structure of the deflated Jacobian reduces to a scalar rescaling of the
/// undeflated Newton step, so only one linear solve per iteration is needed.
/// Convergence is judged on the deflated residual `M(x) ||F(x)||`, which is
/// unbounded at a stored root, so the iteration cannot terminate there.
pub fn newton<Ff, Jf>(
    mut residual: Ff,
    mut jacobian: Jf,
    x0: &DVector<f64>,
    opts: &NewtonOptions,
    deflation: Option<&DeflationOperator>,
    mut callback: Option<NewtonCallback<'_>>,
) -> Result<(DVector<f64>, NewtonReport)>
where
    Ff: FnMut(&DVector<f64>) -> Result<DVector<f64>>,
    Jf: FnMut(&DVector<f64>) -> Result<DMatrix<f64>>,
{
    let mut x = x0.clone();
    let mut residuals = Vec::with_capacity(opts.max_iters + 1);

    for iter in 0..opts.max_iters {
        let f = residual(&x)?;
        let scale = deflation.map_or(1.0, |d| d.factor(&x));
        let res_norm = f.norm() * scale;
        residuals.push(res_norm);
        if let Some(cb) = callback.as_mut() {
            cb(iter, &x, res_norm);
        }
        if res_norm.is_finite() && res_norm <= opts.tol {
            return Ok((
                x,
                NewtonReport {
                    converged: true,
                    iterations: iter,
                    residuals,
                },
            ));
        }

        let jac = jacobian(&x)?;
        let step = match DenseLu.solve(&jac, &f) {
            Ok(out) => out.x,
            Err(_) => {
                return Ok((
                    x,
                    NewtonReport {
                        converged: false,
                        iterations: iter,
                        residuals,
                    },
                ));
            }
        };
        // Undeflated step is delta = -J^{-1} F; `step` holds J^{-1} F.
        let mut delta = -step;

        if let Some(defl) = deflation {
            if !defl.is_empty() {
                // For G = M F, the Newton step is the undeflated step scaled
                // by 1 / (1 - <grad M, delta> / M).
                let m = defl.factor(&x);
                let grad = defl.gradient(&x);
                let denom = 1.0 - grad.dot(&delta) / m;
                if denom.abs() < 1e-14 {
                    return Ok((
                        x,
                        NewtonReport {
                            converged: false,
                            iterations: iter,
                            residuals,
                        },
                    ));
                }
                delta /= denom;
            }
        }

        let step_norm = delta.norm();
        x += &delta;
        if !x.iter().all(|v| v.is_finite()) {
            return Ok((
                x,
                NewtonReport {
                    converged: false,
                    iterations: iter + 1,
                    residuals,
                },
            ));
        }
        if step_norm < opts.step_tol {
            let f = residual(&x)?;
            let res = f.norm() * deflation.map_or(1.0, |d| d.factor(&x));
            residuals.push(res);
            let converged = res.is_finite() && res <= opts.tol;
            return Ok((
                x,
                NewtonReport {
                    converged,
                    iterations: iter + 1,
                    residuals,
                },
            ));
        }
    }

    let f = residual(&x)?;
    let res = f.norm() * deflation.map_or(1.0, |d| d.factor(&x));
    residuals.push(res);
    let converged = res.is_finite() && res <= opts.tol;
    Ok((
        x,
        NewtonReport {
            converged,
            iterations: opts.max_iters,
            residuals,
        },
    ))
}
