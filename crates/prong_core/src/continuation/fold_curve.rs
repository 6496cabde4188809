//! Codim-2 fold curve continuation.
//!
//! Tracks the fold system `[F(x, p1, p2); sigma(x, p1, p2)] = 0` in a second
//! parameter `p2`. The engine state is `y = [x; p1]`; the extended bordered
//! solves are done by nested bordering: two inner fold-Jacobian solves (each
//! itself a bordered solve over `J`) plus one outer Schur scalar, so nothing
//! is ever assembled at dimension N+2.
//!
//! Codim-2 test functions along the curve: Bogdanov-Takens is the inner
//! product of the unit right and left null vectors, cusp is the quadratic
//! coefficient `<w, d2F[v, v]>` of the fold normal form, zero-Hopf is the
//! change in the count of unstable complex eigenvalues.

use anyhow::Result;
use nalgebra::DVector;

use super::{
    continue_branch, Branch, ContinuationProblem, ContinuationSettings, StepDiagnostics,
    TestValues,
};
use crate::bordered::BorderedSolution;
use crate::eigen::{unstable_counts, DenseEigen, EigenSolver};
use crate::minaug::FoldMinAug;
use crate::problem::{Lens, VectorField};

pub struct FoldCurveProblem<S, P, L1, L2, E = DenseEigen> {
    pub minaug: FoldMinAug<S, P, L1>,
    /// Lens of the curve parameter `p2`; must select a different entry of the
    /// parameter record than the fold parameter behind `minaug.lens`.
    pub lens2: L2,
    /// Base parameter record; both lensed entries are overwritten per step.
    pub params: P,
    pub eigen: E,
}

impl<S, P, L1, L2, E> FoldCurveProblem<S, P, L1, L2, E>
where
    S: VectorField<P>,
    L1: Lens<P>,
    L2: Lens<P>,
    E: EigenSolver,
{
    /// Splits the augmented vector `[p2, x..., p1]` into its pieces.
    fn unpack(&self, aug: &DVector<f64>) -> (DVector<f64>, P) {
        let n = self.minaug.system.dim();
        let x = aug.rows(1, n).into_owned();
        let p1 = aug[n + 1];
        let p2 = aug[0];
        let params = self.lens2.set(&self.minaug.lens.set(&self.params, p1), p2);
        (x, params)
    }
}

impl<S, P, L1, L2, E> ContinuationProblem for FoldCurveProblem<S, P, L1, L2, E>
where
    S: VectorField<P>,
    L1: Lens<P>,
    L2: Lens<P>,
    E: EigenSolver,
{
    fn dim(&self) -> usize {
        self.minaug.system.dim() + 1
    }

    fn residual(&mut self, aug: &DVector<f64>) -> Result<DVector<f64>> {
        let (x, params) = self.unpack(aug);
        self.minaug.residual(&x, &params)
    }

    fn solve_bordered(
        &mut self,
        aug: &DVector<f64>,
        border_x: &DVector<f64>,
        border_p: f64,
        rhs: &DVector<f64>,
        rhs_s: f64,
    ) -> Result<BorderedSolution> {
        let n = self.minaug.system.dim();
        let (x, params) = self.unpack(aug);
        let der = self.minaug.sigma_derivatives(&x, &params)?;

        // Column of the second parameter: [dF/dp2; d sigma/dp2].
        let f_p2 = self
            .minaug
            .fd
            .dp_residual(&self.minaug.system, &self.lens2, &x, &params)?;
        let sigma_p2 = self
            .minaug
            .sigma_dp(&x, &params, &self.lens2, &der.v, &der.w)?;

        let rhs_top = rhs.rows(0, n).into_owned();
        let z1 = self
            .minaug
            .solve_jacobian_with(&x, &params, &der, &rhs_top, rhs[n])?;
        let z2 = self
            .minaug
            .solve_jacobian_with(&x, &params, &der, &f_p2, sigma_p2)?;
        if !z1.converged || !z2.converged {
            return Ok(BorderedSolution {
                dx: DVector::zeros(n + 1),
                dl: 0.0,
                converged: false,
                iterations: z1.iterations + z2.iterations,
            });
        }

        // Outer Schur scalar over the border row [border_x' border_p].
        let dot = |sol: &BorderedSolution| -> f64 {
            let mut acc = sol.dl * border_x[n];
            for i in 0..n {
                acc += border_x[i] * sol.dx[i];
            }
            acc
        };
        let denom = border_p - dot(&z2);
        if denom.abs() < 1e-14 {
            log::warn!("fold curve outer pivot near zero ({denom:.3e})");
            return Ok(BorderedSolution {
                dx: DVector::zeros(n + 1),
                dl: 0.0,
                converged: false,
                iterations: z1.iterations + z2.iterations,
            });
        }
        let dp2 = (rhs_s - dot(&z1)) / denom;

        let mut dy = DVector::zeros(n + 1);
        for i in 0..n {
            dy[i] = z1.dx[i] - dp2 * z2.dx[i];
        }
        dy[n] = z1.dl - dp2 * z2.dl;

        Ok(BorderedSolution {
            dx: dy,
            dl: dp2,
            converged: true,
            iterations: z1.iterations + z2.iterations,
        })
    }

    fn diagnostics(
        &mut self,
        aug: &DVector<f64>,
        _tangent: &DVector<f64>,
        settings: &ContinuationSettings,
    ) -> Result<StepDiagnostics> {
        let (x, params) = self.unpack(aug);
        let der = self.minaug.sigma_derivatives(&x, &params)?;

        let vn = der.v.norm();
        let wn = der.w.norm();
        let (bogdanov_takens, cusp) = if vn > 0.0 && wn > 0.0 {
            let v_hat = &der.v / vn;
            let w_hat = &der.w / wn;
            // Quadratic fold coefficient; vanishes where the fold degenerates
            // into a cusp.
            let d2 = self
                .minaug
                .fd
                .d2f(&self.minaug.system, &x, &params, &v_hat, &v_hat)?;
            (v_hat.dot(&w_hat), w_hat.dot(&d2))
        } else {
            (1.0, 1.0)
        };

        let jac = self.minaug.system.jacobian(&x, &params)?;
        let eigen = self.eigen.eigs(&jac, settings.nev)?;
        let (n_unstable, n_unstable_imag) =
            unstable_counts(&eigen.values, 0.0, settings.tol_bisection_eigenvalue);

        let test_values = TestValues {
            bogdanov_takens,
            cusp,
            ..Default::default()
        };

        Ok(StepDiagnostics {
            test_values,
            eigenvalues: eigen.values,
            n_unstable,
            n_unstable_imag,
        })
    }

    fn finalize_step(
        &mut self,
        aug: &DVector<f64>,
        step: usize,
        settings: &ContinuationSettings,
    ) -> Result<()> {
        let cadence = settings.update_minaug_every_step.max(1);
        if step % cadence == 0 {
            let (x, params) = self.unpack(aug);
            self.minaug.update_null_vectors(&x, &params)?;
        }
        Ok(())
    }
}

/// Continues the fold curve of `system` through `(x0, params)` in the plane
/// of the two lensed parameters. The borders are seeded from the singular
/// vectors of `J(x0)`; `(x0, params)` should already be close to a fold.
///
/// Panics when both lenses address the same parameter entry; that is a
/// programming error, not a runtime condition.
pub fn continue_fold_curve<S, P, L1, L2>(
    system: S,
    params: P,
    lens1: L1,
    lens2: L2,
    x0: &DVector<f64>,
    settings: &ContinuationSettings,
) -> Result<Branch>
where
    S: VectorField<P>,
    P: Clone,
    L1: Lens<P>,
    L2: Lens<P>,
{
    // The two lenses must address distinct parameters, otherwise the curve
    // system is rank deficient by construction.
    let probed = lens1.set(&params, lens1.get(&params) + 1.0);
    assert!(
        (lens2.get(&probed) - lens2.get(&params)).abs() == 0.0,
        "fold curve continuation requires two distinct parameters"
    );

    let n = system.dim();
    let p1 = lens1.get(&params);
    let p2 = lens2.get(&params);
    let mut minaug = FoldMinAug::from_state(system, lens1, x0, &params)?;
    minaug.issymmetric = settings.issymmetric;
    let mut problem = FoldCurveProblem {
        minaug,
        lens2,
        params,
        eigen: DenseEigen,
    };
    let mut y0 = DVector::zeros(n + 1);
    y0.rows_mut(0, n).copy_from(x0);
    y0[n] = p1;
    continue_branch(&mut problem, &y0, p2, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::SpecialPointKind;
    use crate::problem::IndexLens;
    use anyhow::Result;
    use nalgebra::DMatrix;

    /// F(x; a, b) = a + b x - x^3. Fold curve: b = 3x^2, a = -2x^3, with a
    /// cusp at the origin of the (a, b) plane.
    struct CuspNormalForm;

    impl VectorField<Vec<f64>> for CuspNormalForm {
        fn dim(&self) -> usize {
            1
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![
                params[0] + params[1] * x[0] - x[0] * x[0] * x[0],
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(
                1,
                1,
                &[params[1] - 3.0 * x[0] * x[0]],
            ))
        }
    }

    #[test]
    fn fold_curve_satisfies_the_cusp_normal_form_relations() {
        let settings = ContinuationSettings {
            p_min: -1.0,
            p_max: 6.0,
            max_steps: 200,
            bothside: true,
            ..Default::default()
        };
        let branch = continue_fold_curve(
            CuspNormalForm,
            vec![-2.0, 3.0],
            IndexLens(0),
            IndexLens(1),
            &DVector::from_vec(vec![1.0]),
            &settings,
        )
        .expect("fold curve");
        branch.validate().expect("branch invariants");
        assert!(branch.points.len() > 20);
        for pt in &branch.points {
            let x = pt.state[0];
            let a = pt.state[1];
            let b = pt.param;
            assert!((b - 3.0 * x * x).abs() < 1e-6, "b = {b}, x = {x}");
            assert!((a + 2.0 * x * x * x).abs() < 1e-6, "a = {a}, x = {x}");
        }
    }

    #[test]
    fn cusp_is_detected_where_the_curve_folds_in_the_second_parameter() {
        let settings = ContinuationSettings {
            p_min: -1.0,
            p_max: 6.0,
            max_steps: 300,
            bothside: true,
            detect_codim2_bifurcation: true,
            ..Default::default()
        };
        let branch = continue_fold_curve(
            CuspNormalForm,
            vec![-2.0, 3.0],
            IndexLens(0),
            IndexLens(1),
            &DVector::from_vec(vec![1.0]),
            &settings,
        )
        .expect("fold curve");
        let cusps = branch.special_of(SpecialPointKind::Cusp);
        assert_eq!(cusps.len(), 1, "specials: {:?}", branch.special_points);
        assert!(cusps[0].param.abs() < 1e-2, "cusp at b = {}", cusps[0].param);
        assert!(cusps[0].state[0].abs() < 1e-2);
    }

    #[test]
    #[should_panic(expected = "distinct parameters")]
    fn same_lens_twice_panics() {
        let settings = ContinuationSettings::default();
        let _ = continue_fold_curve(
            CuspNormalForm,
            vec![-2.0, 3.0],
            IndexLens(0),
            IndexLens(0),
            &DVector::from_vec(vec![1.0]),
            &settings,
        );
    }

    /// Bogdanov-Takens normal form: xdot = y, ydot = b1 + b2 x + x^2 + x y.
    /// The fold curve is b2 = -2x, b1 = x^2 with a BT point at the origin.
    struct BtNormalForm;

    impl VectorField<Vec<f64>> for BtNormalForm {
        fn dim(&self) -> usize {
            2
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![
                x[1],
                params[0] + params[1] * x[0] + x[0] * x[0] + x[0] * x[1],
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(
                2,
                2,
                &[0.0, 1.0, params[1] + 2.0 * x[0] + x[1], x[0]],
            ))
        }
    }

    #[test]
    fn bogdanov_takens_point_is_detected_on_the_fold_curve() {
        let settings = ContinuationSettings {
            p_min: -3.0,
            p_max: 3.0,
            max_steps: 300,
            bothside: true,
            detect_codim2_bifurcation: true,
            ..Default::default()
        };
        let branch = continue_fold_curve(
            BtNormalForm,
            vec![0.25, -1.0],
            IndexLens(0),
            IndexLens(1),
            &DVector::from_vec(vec![0.5, 0.0]),
            &settings,
        )
        .expect("fold curve");
        let bts = branch.special_of(SpecialPointKind::BogdanovTakens);
        assert_eq!(bts.len(), 1, "specials: {:?}", branch.special_points);
        assert!(bts[0].param.abs() < 1e-2, "bt at b2 = {}", bts[0].param);
    }
}
