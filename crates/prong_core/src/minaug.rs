//! Minimally augmented fold system.
//!
//! Instead of appending a full null-vector equation to `F`, the fold is
//! characterized by one scalar `sigma` obtained from the bordered solve
//!
//! ```text
//! [ J          w_border ] [ v     ]   [ 0 ]
//! [ v_border'  0        ] [ sigma ] = [ 1 ]
//! ```
//!
//! `sigma` vanishes exactly where `J` is singular, so the fold system is
//! `[F; sigma] = 0` in `(x, p)` at dimension N+1, not 2N+1. The borders
//! approximate the right (`v_border`) and left (`w_border`) null vectors and
//! are refreshed from the computed `v`, `w`; each is normalized on its own.
//! Normalizing through `<w, v>` would blow up where the two vectors become
//! orthogonal, which is precisely the Bogdanov-Takens condition the
//! codim-2 tracker must still observe.

use std::marker::PhantomData;

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::bordered::{BorderedSolution, BorderedSolver, BorderedSystem};
use crate::eigen::near_null_vectors;
use crate::linalg::TransposeOp;
use crate::newton::{NewtonOptions, NewtonReport};
use crate::problem::{FiniteDiff, Lens, VectorField};

/// Fold test value with the vectors that produced it.
#[derive(Debug, Clone)]
pub struct SigmaDerivatives {
    pub sigma: f64,
    /// Right solve vector (approximate right null vector near the fold).
    pub v: DVector<f64>,
    /// Left solve vector (approximate left null vector near the fold).
    pub w: DVector<f64>,
    /// Gradient of `sigma` with respect to the state.
    pub d_state: DVector<f64>,
    /// Derivative of `sigma` with respect to the lensed parameter.
    pub d_param: f64,
}

/// Minimally augmented fold problem for a system continued in one parameter.
pub struct FoldMinAug<S, P, L> {
    pub system: S,
    pub lens: L,
    v_border: DVector<f64>,
    w_border: DVector<f64>,
    pub solver: BorderedSolver,
    pub fd: FiniteDiff,
    /// Symmetric Jacobian: the adjoint solve reuses the direct solve.
    pub issymmetric: bool,
    _params: PhantomData<fn() -> P>,
}

impl<S, P, L> FoldMinAug<S, P, L>
where
    S: VectorField<P>,
    L: Lens<P>,
{
    pub fn new(system: S, lens: L, v_border: DVector<f64>, w_border: DVector<f64>) -> Result<Self> {
        let vn = v_border.norm();
        let wn = w_border.norm();
        if vn == 0.0 || wn == 0.0 {
            bail!("fold border vectors must be nonzero");
        }
        Ok(Self {
            system,
            lens,
            v_border: v_border / vn,
            w_border: w_border / wn,
            solver: BorderedSolver::default(),
            fd: FiniteDiff::default(),
            issymmetric: false,
            _params: PhantomData,
        })
    }

    /// Seeds the borders from the singular vectors of `J(x, params)`.
    pub fn from_state(system: S, lens: L, x: &DVector<f64>, params: &P) -> Result<Self> {
        let jac = system.jacobian(x, params)?;
        let (right, left) = near_null_vectors(&jac)?;
        Self::new(system, lens, right, left)
    }

    pub fn borders(&self) -> (&DVector<f64>, &DVector<f64>) {
        (&self.v_border, &self.w_border)
    }

    /// `sigma` and the right vector `v` at `(x, params)`.
    pub fn eval(&self, x: &DVector<f64>, params: &P) -> Result<(f64, DVector<f64>)> {
        let jac = self.system.jacobian(x, params)?;
        self.eval_with(&jac)
    }

    fn eval_with(&self, jac: &DMatrix<f64>) -> Result<(f64, DVector<f64>)> {
        let zero = DVector::zeros(jac.nrows());
        let sys = BorderedSystem {
            jac,
            shift: 0.0,
            border_col: &self.w_border,
            border_row: &self.v_border,
            corner: 0.0,
            rhs: &zero,
            rhs_scalar: 1.0,
            xi_u: 1.0,
            xi_p: 1.0,
        };
        let sol = self.solver.solve(&sys)?;
        if !sol.converged {
            bail!("fold border system singular; border vectors need refreshing");
        }
        Ok((sol.dl, sol.dx))
    }

    /// `sigma` and the left vector `w` via the adjoint bordered system.
    pub fn eval_left(&self, x: &DVector<f64>, params: &P) -> Result<(f64, DVector<f64>)> {
        let jac = self.system.jacobian(x, params)?;
        self.eval_left_with(&jac)
    }

    fn eval_left_with(&self, jac: &DMatrix<f64>) -> Result<(f64, DVector<f64>)> {
        if self.issymmetric {
            return self.eval_with(jac);
        }
        let jac_t = TransposeOp::new(jac)?;
        let zero = DVector::zeros(jac.nrows());
        let sys = BorderedSystem {
            jac: &jac_t,
            shift: 0.0,
            border_col: &self.v_border,
            border_row: &self.w_border,
            corner: 0.0,
            rhs: &zero,
            rhs_scalar: 1.0,
            xi_u: 1.0,
            xi_p: 1.0,
        };
        let sol = self.solver.solve(&sys)?;
        if !sol.converged {
            bail!("adjoint fold border system singular; border vectors need refreshing");
        }
        Ok((sol.dl, sol.dx))
    }

    /// Fold system residual `[F; sigma]` of length N+1.
    pub fn residual(&self, x: &DVector<f64>, params: &P) -> Result<DVector<f64>> {
        let f = self.system.residual(x, params)?;
        let (sigma, _) = self.eval(x, params)?;
        let n = f.len();
        let mut out = DVector::zeros(n + 1);
        out.rows_mut(0, n).copy_from(&f);
        out[n] = sigma;
        Ok(out)
    }

    /// `sigma` with its gradient: `d sigma = -w' (dJ) v` applied to state
    /// directions and to the lensed parameter.
    pub fn sigma_derivatives(&self, x: &DVector<f64>, params: &P) -> Result<SigmaDerivatives> {
        let jac = self.system.jacobian(x, params)?;
        let (sigma, v) = self.eval_with(&jac)?;
        let (_, w) = self.eval_left_with(&jac)?;

        let d_state = self.sigma_dx(x, params, &v, &w)?;
        let d_param = self.sigma_dp(x, params, &self.lens, &v, &w)?;

        Ok(SigmaDerivatives {
            sigma,
            v,
            w,
            d_state,
            d_param,
        })
    }

    /// State gradient of `sigma`. Uses the analytic Hessian when the system
    /// provides one; otherwise two adjoint Jacobian applies along `v` give
    /// the whole gradient at once.
    fn sigma_dx(
        &self,
        x: &DVector<f64>,
        params: &P,
        v: &DVector<f64>,
        w: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let n = x.len();
        let probe = {
            let e0 = DVector::zeros(n);
            self.system.hessian_bilinear(x, params, v, &e0)
        };
        if probe.is_some() {
            let mut grad = DVector::zeros(n);
            for i in 0..n {
                let mut e = DVector::zeros(n);
                e[i] = 1.0;
                let h = self
                    .system
                    .hessian_bilinear(x, params, v, &e)
                    .unwrap_or_else(|| DVector::zeros(n));
                grad[i] = -w.dot(&h);
            }
            return Ok(grad);
        }

        let h = self.fd.delta;
        let xp = x + v * h;
        let xm = x - v * h;
        let gp = self.system.jacobian_transpose_apply(&xp, params, w)?;
        let gm = self.system.jacobian_transpose_apply(&xm, params, w)?;
        Ok(-(gp - gm) / (2.0 * h))
    }

    /// Derivative of `sigma` with respect to the parameter behind `lens2`.
    pub fn sigma_dp<L2: Lens<P>>(
        &self,
        x: &DVector<f64>,
        params: &P,
        lens2: &L2,
        v: &DVector<f64>,
        w: &DVector<f64>,
    ) -> Result<f64> {
        let dj_v = self.fd.dp_jacobian_apply(&self.system, lens2, x, params, v)?;
        Ok(-w.dot(&dj_v))
    }

    /// Solves the extended fold Jacobian
    /// `[J dF/dp; d_sigma/dx' d_sigma/dp] [dx; dp] = [rhs; rhs_s]`
    /// by bordering: the inner block is `J` itself, never assembled at N+1.
    pub fn solve_jacobian(
        &self,
        x: &DVector<f64>,
        params: &P,
        rhs: &DVector<f64>,
        rhs_s: f64,
    ) -> Result<BorderedSolution> {
        let der = self.sigma_derivatives(x, params)?;
        self.solve_jacobian_with(x, params, &der, rhs, rhs_s)
    }

    /// Same as [`solve_jacobian`](Self::solve_jacobian) with the derivatives
    /// already in hand, so one evaluation serves several right-hand sides.
    pub fn solve_jacobian_with(
        &self,
        x: &DVector<f64>,
        params: &P,
        der: &SigmaDerivatives,
        rhs: &DVector<f64>,
        rhs_s: f64,
    ) -> Result<BorderedSolution> {
        let jac = self.system.jacobian(x, params)?;
        let dp_f = self.fd.dp_residual(&self.system, &self.lens, x, params)?;
        let sys = BorderedSystem {
            jac: &jac,
            shift: 0.0,
            border_col: &dp_f,
            border_row: &der.d_state,
            corner: der.d_param,
            rhs,
            rhs_scalar: rhs_s,
            xi_u: 1.0,
            xi_p: 1.0,
        };
        self.solver.solve(&sys)
    }

    /// Refreshes the borders from the current `v` and `w`, each normalized
    /// independently. Degenerate vectors leave the borders untouched.
    pub fn update_null_vectors(&mut self, x: &DVector<f64>, params: &P) -> Result<()> {
        let jac = self.system.jacobian(x, params)?;
        let (_, v) = self.eval_with(&jac)?;
        let (_, w) = self.eval_left_with(&jac)?;
        let vn = v.norm();
        let wn = w.norm();
        if vn > 0.0 && v.iter().all(|c| c.is_finite()) {
            self.v_border = v / vn;
        } else {
            log::warn!("degenerate right vector; keeping previous border");
        }
        if wn > 0.0 && w.iter().all(|c| c.is_finite()) {
            self.w_border = w / wn;
        } else {
            log::warn!("degenerate left vector; keeping previous border");
        }
        Ok(())
    }

    /// Newton iteration on the fold system `[F; sigma] = 0` over `(x, p)`.
    /// The borders are refreshed every iteration. Returns the fold point and
    /// the report; non-convergence is a flag.
    pub fn solve_fold(
        &mut self,
        x0: &DVector<f64>,
        params0: &P,
        opts: &NewtonOptions,
    ) -> Result<(DVector<f64>, P, NewtonReport)>
    where
        P: Clone,
    {
        let mut x = x0.clone();
        let mut params = params0.clone();
        let mut residuals = Vec::with_capacity(opts.max_iters + 1);

        for iter in 0..opts.max_iters {
            let f = self.system.residual(&x, &params)?;
            let der = self.sigma_derivatives(&x, &params)?;
            let res_norm = (f.norm_squared() + der.sigma * der.sigma).sqrt();
            residuals.push(res_norm);
            if res_norm <= opts.tol {
                return Ok((
                    x,
                    params,
                    NewtonReport {
                        converged: true,
                        iterations: iter,
                        residuals,
                    },
                ));
            }

            let sol = self.solve_jacobian_with(&x, &params, &der, &(-&f), -der.sigma)?;
            if !sol.converged {
                return Ok((
                    x,
                    params,
                    NewtonReport {
                        converged: false,
                        iterations: iter,
                        residuals,
                    },
                ));
            }
            let step_norm = (sol.dx.norm_squared() + sol.dl * sol.dl).sqrt();
            x += &sol.dx;
            let p = self.lens.get(&params) + sol.dl;
            params = self.lens.set(&params, p);
            self.update_null_vectors(&x, &params)?;
            if step_norm < opts.step_tol {
                break;
            }
        }

        let f = self.system.residual(&x, &params)?;
        let (sigma, _) = self.eval(&x, &params)?;
        let res_norm = (f.norm_squared() + sigma * sigma).sqrt();
        residuals.push(res_norm);
        let converged = res_norm <= opts.tol;
        let iterations = residuals.len() - 1;
        Ok((
            x,
            params,
            NewtonReport {
                converged,
                iterations,
                residuals,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::IndexLens;
    use nalgebra::DMatrix;

    /// F(x, p) = x^2 - p: fold at (0, 0).
    struct Quadratic;

    impl VectorField<Vec<f64>> for Quadratic {
        fn dim(&self) -> usize {
            1
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![x[0] * x[0] - params[0]]))
        }

        fn jacobian(&self, x: &DVector<f64>, _params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 1, &[2.0 * x[0]]))
        }
    }

    #[test]
    fn sigma_vanishes_at_the_fold_and_tracks_the_jacobian() {
        let minaug = FoldMinAug::new(
            Quadratic,
            IndexLens(0),
            DVector::from_vec(vec![1.0]),
            DVector::from_vec(vec![1.0]),
        )
        .expect("minaug");
        let params = vec![0.04];
        let (sigma_away, _) = minaug
            .eval(&DVector::from_vec(vec![0.2]), &params)
            .expect("eval");
        assert!(sigma_away.abs() > 1e-3);
        let (sigma_at, _) = minaug
            .eval(&DVector::from_vec(vec![0.0]), &params)
            .expect("eval");
        assert!(sigma_at.abs() < 1e-12);
    }

    #[test]
    fn newton_converges_onto_the_fold_point() {
        let mut minaug = FoldMinAug::from_state(
            Quadratic,
            IndexLens(0),
            &DVector::from_vec(vec![0.1]),
            &vec![-0.01],
        )
        .expect("minaug");
        let (x, params, report) = minaug
            .solve_fold(
                &DVector::from_vec(vec![0.1]),
                &vec![-0.01],
                &NewtonOptions::default(),
            )
            .expect("solve fold");
        assert!(report.converged, "residuals: {:?}", report.residuals);
        assert!(x[0].abs() < 1e-8, "x = {}", x[0]);
        assert!(params[0].abs() < 1e-8, "p = {}", params[0]);
    }

    #[test]
    fn sigma_gradient_matches_finite_difference() {
        let minaug = FoldMinAug::new(
            Quadratic,
            IndexLens(0),
            DVector::from_vec(vec![1.0]),
            DVector::from_vec(vec![1.0]),
        )
        .expect("minaug");
        let x = DVector::from_vec(vec![0.3]);
        let params = vec![0.05];
        let der = minaug.sigma_derivatives(&x, &params).expect("derivatives");
        let h = 1e-6;
        let (sp, _) = minaug
            .eval(&DVector::from_vec(vec![0.3 + h]), &params)
            .expect("eval");
        let (sm, _) = minaug
            .eval(&DVector::from_vec(vec![0.3 - h]), &params)
            .expect("eval");
        let fd = (sp - sm) / (2.0 * h);
        assert!(
            (der.d_state[0] - fd).abs() < 1e-4,
            "analytic {} vs fd {fd}",
            der.d_state[0]
        );
        // sigma does not depend on p for this system.
        assert!(der.d_param.abs() < 1e-6);
    }

    /// Nearly nilpotent Jacobian: right and left null directions orthogonal.
    struct NearNilpotent;

    impl VectorField<Vec<f64>> for NearNilpotent {
        fn dim(&self) -> usize {
            2
        }

        fn residual(&self, x: &DVector<f64>, _params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![x[1], 1e-6 * x[0]]))
        }

        fn jacobian(&self, _x: &DVector<f64>, _params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1e-6, 0.0]))
        }
    }

    #[test]
    fn border_update_survives_orthogonal_null_vectors() {
        // <v, w> ~ 0 here; a coupled normalization would divide by it.
        let x = DVector::from_vec(vec![0.0, 0.0]);
        let params = vec![0.0];
        let mut minaug =
            FoldMinAug::from_state(NearNilpotent, IndexLens(0), &x, &params).expect("minaug");
        minaug.update_null_vectors(&x, &params).expect("update");
        let (v_border, w_border) = minaug.borders();
        assert!((v_border.norm() - 1.0).abs() < 1e-12);
        assert!((w_border.norm() - 1.0).abs() < 1e-12);
        assert!(v_border.iter().all(|c| c.is_finite()));
        assert!(w_border.iter().all(|c| c.is_finite()));
        assert!(
            v_border.dot(w_border).abs() < 1e-3,
            "orthogonality must be preserved, got {}",
            v_border.dot(w_border)
        );
    }
}
