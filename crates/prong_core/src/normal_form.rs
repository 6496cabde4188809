//! Normal form coefficients and branch switching at branch points.
//!
//! At a simple branch point the Lyapunov-Schmidt reduction of `F(x, p) = 0`
//! onto the kernel direction `phi` (with left kernel `psi`) reads
//!
//! ```text
//! g(xi, lambda) ~ a*lambda + b1*lambda*xi + (b2/2)*xi^2 + (b3/6)*xi^3
//! ```
//!
//! and the coefficients decide between a transcritical and a pitchfork
//! crossing, giving a predictor for the bifurcating branch. At a non-simple
//! point (kernel dimension m > 1) the reduced system is solved by deflated
//! Newton from a deterministic family of initial guesses, and every reduced
//! root is corrected in the full system before it is accepted.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::continuation::{continue_equilibrium, Branch, ContinuationSettings};
use crate::deflation::DeflationOperator;
use crate::eigen::kernel_bases;
use crate::newton::{newton, NewtonOptions};
use crate::problem::{FiniteDiff, Lens, VectorField};

/// Kernel tolerance used when extracting `phi`/`psi` bases.
const KERNEL_TOL: f64 = 1e-6;
/// Consecutive reduced-Newton failures after which a side gives up.
const MAX_CONSECUTIVE_FAILURES: usize = 10;
/// Total number of deterministic guesses tried per side.
const MAX_GUESSES: usize = 64;

/// Cubic normal form coefficients at a simple branch point.
#[derive(Debug, Clone)]
pub struct NormalForm1 {
    /// `<psi, dF/dp>`; vanishes at a genuine branch point.
    pub a: f64,
    /// `<psi, d/dp (J phi)>`.
    pub b1: f64,
    /// `<psi, d2F[phi, phi]>`.
    pub b2: f64,
    /// `<psi, d3F[phi, phi, phi]>`.
    pub b3: f64,
    pub phi: DVector<f64>,
    pub psi: DVector<f64>,
}

impl NormalForm1 {
    /// True when the quadratic coefficient is negligible against the cubic,
    /// i.e. the crossing is a pitchfork rather than transcritical.
    pub fn is_pitchfork(&self) -> bool {
        self.b2.abs() < 1e-6 * self.b3.abs().max(1.0)
    }

    /// Kernel amplitudes predicting the bifurcating branch at parameter
    /// offset `lambda`. Empty when the normal form has no real branch on
    /// that side.
    pub fn predictors(&self, lambda: f64) -> Vec<f64> {
        if self.is_pitchfork() {
            if self.b3 == 0.0 {
                return Vec::new();
            }
            let xi2 = -6.0 * self.b1 * lambda / self.b3;
            if xi2 <= 0.0 {
                return Vec::new();
            }
            let xi = xi2.sqrt();
            vec![xi, -xi]
        } else {
            vec![-2.0 * self.b1 * lambda / self.b2]
        }
    }
}

/// Computes the cubic normal form at `(x, params)`, which should be a branch
/// point located to corrector accuracy.
pub fn normal_form_coefficients<S, P, L>(
    system: &S,
    lens: &L,
    x: &DVector<f64>,
    params: &P,
    fd: &FiniteDiff,
) -> Result<NormalForm1>
where
    S: VectorField<P>,
    L: Lens<P>,
{
    let jac = system.jacobian(x, params)?;
    let (phis, psis) = kernel_bases(&jac, KERNEL_TOL)?;
    let (Some(phi), Some(psi)) = (phis.first(), psis.first()) else {
        bail!("no kernel direction at the given point; not a singular point");
    };

    let dp_f = fd.dp_residual(system, lens, x, params)?;
    let dp_j_phi = fd.dp_jacobian_apply(system, lens, x, params, phi)?;
    let d2 = fd.d2f(system, x, params, phi, phi)?;
    let d3 = fd.d3f(system, x, params, phi)?;

    Ok(NormalForm1 {
        a: psi.dot(&dp_f),
        b1: psi.dot(&dp_j_phi),
        b2: psi.dot(&d2),
        b3: psi.dot(&d3),
        phi: phi.clone(),
        psi: psi.clone(),
    })
}

/// A corrected point on a bifurcating branch.
#[derive(Debug, Clone)]
pub struct SwitchedPoint {
    pub state: DVector<f64>,
    pub param: f64,
}

/// Predicts and corrects the bifurcating branch at a simple branch point.
///
/// The primary-branch solution at `p + lambda` is found first and deflated,
/// so the corrector cannot fall back onto the branch it started from.
pub fn branch_switch<S, P, L>(
    system: &S,
    lens: &L,
    x_bp: &DVector<f64>,
    params_bp: &P,
    lambda: f64,
    opts: &NewtonOptions,
) -> Result<Vec<SwitchedPoint>>
where
    S: VectorField<P>,
    L: Lens<P>,
{
    let fd = FiniteDiff::default();
    let nf = normal_form_coefficients(system, lens, x_bp, params_bp, &fd)?;
    let p_new = lens.get(params_bp) + lambda;
    let params_new = lens.set(params_bp, p_new);

    let mut deflation = DeflationOperator::default();
    let (primary, primary_report) = newton(
        |x| system.residual(x, &params_new),
        |x| system.jacobian(x, &params_new),
        x_bp,
        opts,
        None,
        None,
    )?;
    if primary_report.converged {
        deflation.push(primary);
    }

    let mut out = Vec::new();
    for xi in nf.predictors(lambda) {
        let guess = x_bp + &nf.phi * xi;
        let (x, report) = newton(
            |x| system.residual(x, &params_new),
            |x| system.jacobian(x, &params_new),
            &guess,
            opts,
            Some(&deflation),
            None,
        )?;
        if !report.converged || deflation.contains(&x, opts.tol.sqrt()) {
            continue;
        }
        deflation.push(x.clone());
        out.push(SwitchedPoint { state: x, param: p_new });
    }
    Ok(out)
}

/// Outcome of a multi-branch search at a non-simple singular point.
#[derive(Debug, Clone, Default)]
pub struct MultiBranchResult {
    /// One continued branch per accepted root, in discovery order.
    pub branches: Vec<Branch>,
    /// Full-system states that survived the deflated correction.
    pub accepted: Vec<DVector<f64>>,
    /// Candidate states rejected during the correction.
    pub rejected: Vec<DVector<f64>>,
}

/// Deterministic spread of directions in the kernel coordinates. Knuth
/// multiplicative hashing keeps the sequence reproducible across runs.
fn guess_direction(m: usize, k: usize) -> DVector<f64> {
    let mut v = DVector::zeros(m);
    for i in 0..m {
        let h = (k + 1)
            .wrapping_mul(i + 2)
            .wrapping_mul(2654435761usize)
            % 2048;
        v[i] = h as f64 / 1024.0 - 1.0;
    }
    let norm = v.norm();
    if norm == 0.0 {
        v[k % m] = 1.0;
        return v;
    }
    v / norm
}

/// Branch switching at a non-simple singular point (kernel dimension > 1).
///
/// Solves the reduced system `g_i(xi) = <psi_i, F(x0 + Phi xi, p0 + lambda)>`
/// by deflated Newton from a deterministic family of initial guesses. Each
/// reduced root is corrected in the full system at fixed parameter by deflated
/// Newton with its own operator, seeded with the singular state, under a
/// tenfold iteration budget; every accepted root is then continued as its own
/// branch. One search per side of the singular point; a run of consecutive
/// reduced failures ends the side early.
pub fn multi_branch_switch<S, P, L>(
    system: &S,
    lens: &L,
    x_bp: &DVector<f64>,
    params_bp: &P,
    lambda: f64,
    settings: &ContinuationSettings,
) -> Result<MultiBranchResult>
where
    S: VectorField<P>,
    P: Clone,
    L: Lens<P> + Clone,
{
    let opts = &settings.newton;
    let jac = system.jacobian(x_bp, params_bp)?;
    let (phis, psis) = kernel_bases(&jac, KERNEL_TOL)?;
    let m = phis.len();
    if m < 2 {
        bail!("multi-branch switching needs a kernel of dimension at least 2, got {m}");
    }

    let p_new = lens.get(params_bp) + lambda;
    let params_new = lens.set(params_bp, p_new);
    let radius = lambda.abs().sqrt().max(1e-3);

    let full_state = |xi: &DVector<f64>| -> DVector<f64> {
        let mut x = x_bp.clone();
        for (j, phi) in phis.iter().enumerate() {
            x.axpy(xi[j], phi, 1.0);
        }
        x
    };
    let reduced_residual = |xi: &DVector<f64>| -> Result<DVector<f64>> {
        let f = system.residual(&full_state(xi), &params_new)?;
        Ok(DVector::from_fn(m, |i, _| psis[i].dot(&f)))
    };
    let fd_step = 1e-6;
    let reduced_jacobian = |xi: &DVector<f64>| -> Result<DMatrix<f64>> {
        let mut jac_r = DMatrix::zeros(m, m);
        for j in 0..m {
            let mut xp = xi.clone();
            xp[j] += fd_step;
            let mut xm = xi.clone();
            xm[j] -= fd_step;
            let col = (reduced_residual(&xp)? - reduced_residual(&xm)?) / (2.0 * fd_step);
            jac_r.set_column(j, &col);
        }
        Ok(jac_r)
    };

    // Fresh deflation for this side, seeded with the known trivial root.
    let mut deflation = DeflationOperator::default();
    deflation.push(DVector::zeros(m));

    // Independent operator for the full-system corrections, seeded with the
    // singular state so the corrector cannot collapse back onto it.
    let mut full_deflation = DeflationOperator::default();
    full_deflation.push(x_bp.clone());

    let full_opts = NewtonOptions {
        max_iters: opts.max_iters * 10,
        ..*opts
    };
    let mut result = MultiBranchResult::default();
    let mut consecutive_failures = 0usize;

    for k in 0..MAX_GUESSES {
        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            break;
        }
        let xi0 = guess_direction(m, k) * radius;
        let (xi, report) = newton(
            &reduced_residual,
            &reduced_jacobian,
            &xi0,
            opts,
            Some(&deflation),
            None,
        )?;
        if !report.converged || deflation.contains(&xi, opts.tol.sqrt()) {
            consecutive_failures += 1;
            continue;
        }
        consecutive_failures = 0;
        deflation.push(xi.clone());

        // Full-system correction at fixed parameter.
        let (x, full_report) = newton(
            |x| system.residual(x, &params_new),
            |x| system.jacobian(x, &params_new),
            &full_state(&xi),
            &full_opts,
            Some(&full_deflation),
            None,
        )?;
        if full_report.converged && !full_deflation.contains(&x, opts.tol.sqrt()) {
            full_deflation.push(x.clone());
            result.accepted.push(x.clone());
            result.branches.push(continue_equilibrium(
                system,
                params_new.clone(),
                lens.clone(),
                &x,
                settings,
            )?);
        } else {
            result.rejected.push(x);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::IndexLens;

    /// F(x, p) = p x - x^3: pitchfork at the origin with secondary branch
    /// x^2 = p.
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
    fn pitchfork_coefficients_match_the_normal_form() {
        let nf = normal_form_coefficients(
            &Pitchfork,
            &IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &vec![0.0],
            &FiniteDiff::default(),
        )
        .expect("coefficients");
        assert!(nf.a.abs() < 1e-6);
        assert!((nf.b1.abs() - 1.0).abs() < 1e-4, "b1 = {}", nf.b1);
        assert!(nf.b2.abs() < 1e-3, "b2 = {}", nf.b2);
        assert!((nf.b3.abs() - 6.0).abs() < 1e-2, "b3 = {}", nf.b3);
        assert!(nf.is_pitchfork());
    }

    #[test]
    fn branch_switch_lands_on_the_secondary_branch() {
        let lambda = 0.1;
        let points = branch_switch(
            &Pitchfork,
            &IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &vec![0.0],
            lambda,
            &NewtonOptions::default(),
        )
        .expect("branch switch");
        assert_eq!(points.len(), 2, "points: {points:?}");
        for pt in &points {
            assert!((pt.param - lambda).abs() < 1e-12);
            assert!(
                (pt.state[0] * pt.state[0] - lambda).abs() < 1e-8,
                "x = {}",
                pt.state[0]
            );
        }
        // The two predictors land on opposite sides.
        assert!(points[0].state[0] * points[1].state[0] < 0.0);
    }

    #[test]
    fn branch_switch_finds_nothing_on_the_subcritical_side() {
        let points = branch_switch(
            &Pitchfork,
            &IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &vec![0.0],
            -0.1,
            &NewtonOptions::default(),
        )
        .expect("branch switch");
        assert!(points.is_empty(), "points: {points:?}");
    }

    /// Two decoupled pitchforks: kernel dimension 2 at the origin.
    struct DoublePitchfork;

    impl VectorField<Vec<f64>> for DoublePitchfork {
        fn dim(&self) -> usize {
            2
        }

        fn residual(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DVector<f64>> {
            let p = params[0];
            Ok(DVector::from_vec(vec![
                p * x[0] - x[0] * x[0] * x[0],
                p * x[1] - x[1] * x[1] * x[1],
            ]))
        }

        fn jacobian(&self, x: &DVector<f64>, params: &Vec<f64>) -> Result<DMatrix<f64>> {
            let p = params[0];
            Ok(DMatrix::from_row_slice(
                2,
                2,
                &[p - 3.0 * x[0] * x[0], 0.0, 0.0, p - 3.0 * x[1] * x[1]],
            ))
        }
    }

    #[test]
    fn multi_branch_switch_continues_several_nontrivial_branches() {
        let lambda = 0.1;
        let settings = ContinuationSettings {
            p_min: 0.0,
            p_max: 0.5,
            max_steps: 30,
            ..Default::default()
        };
        let result = multi_branch_switch(
            &DoublePitchfork,
            &IndexLens(0),
            &DVector::from_vec(vec![0.0, 0.0]),
            &vec![0.0],
            lambda,
            &settings,
        )
        .expect("multi branch switch");
        assert!(
            result.branches.len() >= 2,
            "accepted {}, rejected {}",
            result.accepted.len(),
            result.rejected.len()
        );
        assert_eq!(result.accepted.len(), result.branches.len());
        let r = lambda.sqrt();
        for state in &result.accepted {
            // Every accepted state solves the full system away from the
            // trivial solution.
            let f = DoublePitchfork
                .residual(state, &vec![lambda])
                .expect("residual");
            assert!(f.norm() < 1e-8);
            assert!(state.norm() > 1e-3);
            for c in state.iter() {
                assert!(
                    c.abs() < 1e-6 || (c.abs() - r).abs() < 1e-6,
                    "component {c}"
                );
            }
        }
        // Each accepted root was continued as its own branch from p0 + lambda.
        for (state, branch) in result.accepted.iter().zip(&result.branches) {
            assert!(branch.points.len() > 1);
            let first = &branch.points[0];
            assert!((first.param - lambda).abs() < 1e-8);
            let start = DVector::from_vec(first.state.clone());
            assert!((&start - state).norm() < 1e-6);
        }
    }

    #[test]
    fn multi_branch_switch_rejects_simple_kernels() {
        let err = multi_branch_switch(
            &Pitchfork,
            &IndexLens(0),
            &DVector::from_vec(vec![0.0]),
            &vec![0.0],
            0.1,
            &ContinuationSettings::default(),
        )
        .expect_err("kernel too small");
        assert!(format!("{err}").contains("dimension at least 2"));
    }
}
