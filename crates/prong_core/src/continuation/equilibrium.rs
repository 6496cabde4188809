//! Equilibrium curve continuation.
//!
//! Wraps a [`VectorField`] plus a parameter lens as a [`ContinuationProblem`]
//! and wires up the codim-1 test functions: fold (determinant of the state
//! Jacobian), branch point (determinant of the tangent-bordered extended
//! Jacobian), Hopf and neutral saddle (eigenvalue pair products).

use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use super::util::{hopf_test_function, neutral_saddle_test_function, signed_determinant};
use super::{
    continue_branch, split_aug, Branch, ContinuationProblem, ContinuationSettings,
    StepDiagnostics, TestValues,
};
use crate::bordered::{BorderedSolution, BorderedSolver, BorderedSystem};
use crate::eigen::{kernel_bases, unstable_counts, DenseEigen, EigenSolver};
use crate::problem::{FiniteDiff, Lens, VectorField};

pub struct EquilibriumProblem<S, P, L, E = DenseEigen> {
    pub system: S,
    /// Base parameter record; the continued entry is overwritten per step.
    pub params: P,
    pub lens: L,
    pub solver: BorderedSolver,
    pub fd: FiniteDiff,
    pub eigen: E,
}

impl<S, P, L> EquilibriumProblem<S, P, L, DenseEigen>
where
    S: VectorField<P>,
    L: Lens<P>,
{
    pub fn new(system: S, params: P, lens: L) -> Self {
        Self {
            system,
            params,
            lens,
            solver: BorderedSolver::default(),
            fd: FiniteDiff::default(),
            eigen: DenseEigen,
        }
    }
}

impl<S, P, L, E> EquilibriumProblem<S, P, L, E>
where
    S: VectorField<P>,
    L: Lens<P>,
    E: EigenSolver,
{
    fn params_at(&self, p: f64) -> P {
        self.lens.set(&self.params, p)
    }
}

impl<S, P, L, E> ContinuationProblem for EquilibriumProblem<S, P, L, E>
where
    S: VectorField<P>,
    L: Lens<P>,
    E: EigenSolver,
{
    fn dim(&self) -> usize {
        self.system.dim()
    }

    fn residual(&mut self, aug: &DVector<f64>) -> Result<DVector<f64>> {
        let (p, x) = split_aug(aug);
        self.system.residual(&x, &self.params_at(p))
    }

    fn solve_bordered(
        &mut self,
        aug: &DVector<f64>,
        border_x: &DVector<f64>,
        border_p: f64,
        rhs: &DVector<f64>,
        rhs_s: f64,
    ) -> Result<BorderedSolution> {
        let (p, x) = split_aug(aug);
        let params = self.params_at(p);
        let jac = self.system.jacobian(&x, &params)?;
        let dp_f = self.fd.dp_residual(&self.system, &self.lens, &x, &params)?;
        let sys = BorderedSystem {
            jac: &jac,
            shift: 0.0,
            border_col: &dp_f,
            border_row: border_x,
            corner: border_p,
            rhs,
            rhs_scalar: rhs_s,
            xi_u: 1.0,
            xi_p: 1.0,
        };
        self.solver.solve(&sys)
    }

    fn diagnostics(
        &mut self,
        aug: &DVector<f64>,
        tangent: &DVector<f64>,
        settings: &ContinuationSettings,
    ) -> Result<StepDiagnostics> {
        let (p, x) = split_aug(aug);
        let params = self.params_at(p);
        let n = self.system.dim();
        let jac = self.system.jacobian(&x, &params)?;

        let eigen = self.eigen.eigs(&jac, settings.nev)?;
        let (n_unstable, n_unstable_imag) =
            unstable_counts(&eigen.values, 0.0, settings.tol_bisection_eigenvalue);

        // Branch point: the tangent-bordered extended Jacobian [J dF/dp; t']
        // loses rank where a second branch crosses, but stays regular at a
        // plain fold.
        let dp_f = self.fd.dp_residual(&self.system, &self.lens, &x, &params)?;
        let mut bordered = DMatrix::zeros(n + 1, n + 1);
        bordered.view_mut((0, 0), (n, n)).copy_from(&jac);
        for i in 0..n {
            bordered[(i, n)] = dp_f[i];
            bordered[(n, i)] = tangent[i + 1];
        }
        bordered[(n, n)] = tangent[0];

        let test_values = TestValues {
            fold: signed_determinant(&jac),
            branch_point: signed_determinant(&bordered),
            hopf: hopf_test_function(&eigen.values),
            neutral_saddle: neutral_saddle_test_function(&eigen.values),
            ..Default::default()
        };

        Ok(StepDiagnostics {
            test_values,
            eigenvalues: eigen.values,
            n_unstable,
            n_unstable_imag,
        })
    }

    fn kernel_dimension(&mut self, aug: &DVector<f64>, tol: f64) -> Result<usize> {
        let (p, x) = split_aug(aug);
        let jac = self.system.jacobian(&x, &self.params_at(p))?;
        let (phi, _) = kernel_bases(&jac, tol)?;
        Ok(phi.len().max(1))
    }
}

/// Continues the equilibrium branch of `system` through `(x0, p0)` in the
/// lensed parameter, with default solver, eigensolver, and step settings
/// taken from `settings`.
pub fn continue_equilibrium<S, P, L>(
    system: S,
    params: P,
    lens: L,
    x0: &DVector<f64>,
    settings: &ContinuationSettings,
) -> Result<Branch>
where
    S: VectorField<P>,
    L: Lens<P>,
{
    let p0 = lens.get(&params);
    let mut problem = EquilibriumProblem::new(system, params, lens);
    continue_branch(&mut problem, x0, p0, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::SpecialPointKind;
    use crate::problem::IndexLens;

    /// F(x, p) = x^3 - 3x - p: folds at (1, -2) and (-1, 2).
    struct Cubic;

    impl VectorField<Vec<f64>> for Cubic {
        fn dim(&self) -> usize {
            1
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![
                x[0] * x[0] * x[0] - 3.0 * x[0] - params[0],
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, _params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(1, 1, &[3.0 * x[0] * x[0] - 3.0]))
        }
    }

    #[test]
    fn cubic_branch_reports_both_folds_in_step_order() {
        let settings = ContinuationSettings {
            p_min: -6.0,
            p_max: 6.0,
            max_steps: 600,
            bothside: true,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            Cubic,
            vec![2.0],
            IndexLens(0),
            &DVector::from_vec(vec![2.0]),
            &settings,
        )
        .expect("continuation");
        branch.validate().expect("branch invariants");
        assert!(!branch.is_empty());

        let folds = branch.special_of(SpecialPointKind::Fold);
        assert_eq!(folds.len(), 2, "specials: {:?}", branch.special_points);
        let mut params: Vec<f64> = folds.iter().map(|sp| sp.param).collect();
        params.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((params[0] + 2.0).abs() < 1e-2, "fold at {}", params[0]);
        assert!((params[1] - 2.0).abs() < 1e-2, "fold at {}", params[1]);
        for sp in &folds {
            assert!(sp.interval.0 <= sp.param && sp.param <= sp.interval.1);
        }
    }

    #[test]
    fn parameter_is_monotone_until_the_fold_where_dp_flips() {
        // Start on the middle segment of the cubic and run one direction: the
        // parameter must grow strictly until the fold at (x, p) = (-1, 2),
        // where the tangent parameter component changes sign, and shrink
        // strictly afterwards.
        let settings = ContinuationSettings {
            p_min: -6.0,
            p_max: 6.0,
            max_steps: 400,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            Cubic,
            vec![0.0],
            IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &settings,
        )
        .expect("continuation");
        let folds = branch.special_of(SpecialPointKind::Fold);
        assert_eq!(folds.len(), 1, "specials: {:?}", branch.special_points);
        assert!((folds[0].param - 2.0).abs() < 1e-2);

        let mut flips = Vec::new();
        for (i, w) in branch.points.windows(2).enumerate() {
            let before = w[0].tangent.dp > 0.0;
            let after = w[1].tangent.dp > 0.0;
            if before != after {
                flips.push(i + 1);
            } else {
                let dp = w[1].param - w[0].param;
                assert!(
                    if before { dp > 0.0 } else { dp < 0.0 },
                    "param not monotone between points {i} and {}: dp = {dp}",
                    i + 1
                );
            }
        }
        assert_eq!(flips.len(), 1, "dp sign flips at {flips:?}");
        assert!(
            (flips[0] as i64 - folds[0].step as i64).abs() <= 1,
            "dp flipped at point {} but the fold was registered at step {}",
            flips[0],
            folds[0].step
        );
    }

    /// Planar normal form with a Hopf point at p = 0; origin is an
    /// equilibrium for every p with eigenvalues p +- i.
    struct StuartLandau;

    impl VectorField<Vec<f64>> for StuartLandau {
        fn dim(&self) -> usize {
            2
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            let p = params[0];
            let r2 = x[0] * x[0] + x[1] * x[1];
            Ok(DVector::from_vec(vec![
                p * x[0] - x[1] - x[0] * r2,
                x[0] + p * x[1] - x[1] * r2,
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DMatrix<f64>> {
            let p = params[0];
            let (a, b) = (x[0], x[1]);
            let r2 = a * a + b * b;
            Ok(DMatrix::from_row_slice(
                2,
                2,
                &[
                    p - r2 - 2.0 * a * a,
                    -1.0 - 2.0 * a * b,
                    1.0 - 2.0 * a * b,
                    p - r2 - 2.0 * b * b,
                ],
            ))
        }
    }

    #[test]
    fn hopf_point_is_detected_on_the_trivial_branch() {
        let settings = ContinuationSettings {
            p_min: -0.6,
            p_max: 0.6,
            max_steps: 200,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            StuartLandau,
            vec![-0.5],
            IndexLens(0),
            &DVector::from_vec(vec![0.0, 0.0]),
            &settings,
        )
        .expect("continuation");
        let hopfs = branch.special_of(SpecialPointKind::Hopf);
        assert_eq!(hopfs.len(), 1, "specials: {:?}", branch.special_points);
        assert!(hopfs[0].param.abs() < 1e-2, "hopf at {}", hopfs[0].param);
        assert!(branch
            .special_of(SpecialPointKind::NeutralSaddle)
            .is_empty());
        // Stability flips across the Hopf point.
        let first = branch.points.first().unwrap();
        let last = branch.points.last().unwrap();
        assert_eq!(first.n_unstable, 0);
        assert_eq!(last.n_unstable, 2);
    }

    /// F(x, p) = p x - x^3: pitchfork at the origin, a branch point rather
    /// than a fold.
    struct Pitchfork;

    impl VectorField<Vec<f64>> for Pitchfork {
        fn dim(&self) -> usize {
            1
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            Ok(DVector::from_vec(vec![
                params[0] * x[0] - x[0] * x[0] * x[0],
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DMatrix<f64>> {
            Ok(DMatrix::from_row_slice(
                1,
                1,
                &[params[0] - 3.0 * x[0] * x[0]],
            ))
        }
    }

    #[test]
    fn pitchfork_is_classified_as_branch_point_not_fold() {
        let settings = ContinuationSettings {
            p_min: -0.6,
            p_max: 0.6,
            max_steps: 200,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            Pitchfork,
            vec![-0.5],
            IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &settings,
        )
        .expect("continuation");
        let bps = branch.special_of(SpecialPointKind::BranchPoint);
        assert_eq!(bps.len(), 1, "specials: {:?}", branch.special_points);
        assert!(bps[0].param.abs() < 1e-2);
        assert!(branch.special_of(SpecialPointKind::Fold).is_empty());
    }

    #[test]
    fn detection_can_be_switched_off() {
        let settings = ContinuationSettings {
            p_min: -6.0,
            p_max: 6.0,
            max_steps: 600,
            bothside: true,
            detect_bifurcation: false,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            Cubic,
            vec![2.0],
            IndexLens(0),
            &DVector::from_vec(vec![2.0]),
            &settings,
        )
        .expect("continuation");
        assert!(branch.special_points.is_empty());
        assert!(!branch.is_empty());
    }

    #[test]
    fn eigenvalues_are_recorded_when_requested() {
        let settings = ContinuationSettings {
            p_min: -0.6,
            p_max: 0.6,
            max_steps: 50,
            save_eigenvalues: true,
            ..Default::default()
        };
        let branch = continue_equilibrium(
            StuartLandau,
            vec![-0.5],
            IndexLens(0),
            &DVector::from_vec(vec![0.0, 0.0]),
            &settings,
        )
        .expect("continuation");
        let eigen = branch.eigen_data.as_ref().expect("eigen data");
        assert_eq!(eigen.len(), branch.points.len());
        assert!(eigen.iter().all(|evs| evs.len() == 2));
    }
}
