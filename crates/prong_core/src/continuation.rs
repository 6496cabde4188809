//! Pseudo-arclength continuation (PALC) engine.
//!
//! The stepper is a predictor-corrector state machine over an augmented state
//! `aug = [p, x...]`: predict along the tangent, correct with Newton against
//! the bordered system `[J dF/dp; t_x t_p]`, adapt the step size, evaluate the
//! per-step diagnostics, and localize test-function crossings by bisection.
//! Problems plug in through [`ContinuationProblem`]; the engine never
//! assembles an extended Jacobian itself.

pub mod equilibrium;
pub mod fold_curve;
pub mod util;

pub use equilibrium::{continue_equilibrium, EquilibriumProblem};
pub use fold_curve::{continue_fold_curve, FoldCurveProblem};

use anyhow::{bail, Result};
use nalgebra::DVector;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::bordered::BorderedSolution;
use crate::newton::NewtonOptions;

/// Recognized continuation options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationSettings {
    /// Initial arclength step.
    pub ds: f64,
    pub dsmin: f64,
    pub dsmax: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub max_steps: usize,
    pub newton: NewtonOptions,
    /// Toggle test-function based event detection.
    pub detect_bifurcation: bool,
    /// Bisection budget for eigenvalue-count (discrete) crossings.
    pub n_inversion: usize,
    /// Number of eigenvalues requested from the eigensolver (0 = all).
    pub nev: usize,
    /// Arclength bracket width below which bisection stops.
    pub dsmin_bisection: f64,
    pub max_bisection_steps: usize,
    /// Real-part tolerance when classifying eigenvalues as unstable.
    pub tol_bisection_eigenvalue: f64,
    /// Toggle codim-2 test functions (BT, cusp, ZH) on codim-1 curves.
    pub detect_codim2_bifurcation: bool,
    /// Cadence (in accepted steps) of minimally-augmented border updates.
    pub update_minaug_every_step: usize,
    /// The Jacobian is symmetric; adjoint solves reuse direct solves.
    pub issymmetric: bool,
    /// Continue in both directions from the starting point.
    pub bothside: bool,
    /// Record the spectrum at every accepted step in `Branch::eigen_data`.
    pub save_eigenvalues: bool,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            ds: 0.01,
            dsmin: 1e-6,
            dsmax: 0.1,
            p_min: f64::NEG_INFINITY,
            p_max: f64::INFINITY,
            max_steps: 200,
            newton: NewtonOptions::default(),
            detect_bifurcation: true,
            n_inversion: 8,
            nev: 0,
            dsmin_bisection: 1e-9,
            max_bisection_steps: 25,
            tol_bisection_eigenvalue: 1e-10,
            detect_codim2_bifurcation: false,
            update_minaug_every_step: 1,
            issymmetric: false,
            bothside: false,
            save_eigenvalues: false,
        }
    }
}

/// Explicit stepping direction. The sign convention is part of the API:
/// `Forward` steps along the initial tangent, which is oriented toward
/// increasing parameter whenever the tangent has a parameter component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepSign {
    Forward,
    Backward,
}

impl StepSign {
    pub fn factor(self) -> f64 {
        match self {
            StepSign::Forward => 1.0,
            StepSign::Backward => -1.0,
        }
    }
}

/// Branch tangent split into state and parameter components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tangent {
    pub dx: Vec<f64>,
    pub dp: f64,
}

/// One accepted point on the solution branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchPoint {
    pub state: Vec<f64>,
    pub param: f64,
    pub tangent: Tangent,
    /// Eigenvalues with real part above the classification tolerance.
    pub n_unstable: usize,
}

/// Classification of detected singular points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialPointKind {
    Fold,
    BranchPoint,
    Hopf,
    NeutralSaddle,
    /// Kernel dimension greater than one at the located point.
    NonSimple,
    BogdanovTakens,
    Cusp,
    ZeroHopf,
}

/// A localized singular point with its bisection bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialPoint {
    pub kind: SpecialPointKind,
    /// Index into `Branch::points` of the step at which detection fired.
    pub step: usize,
    /// Parameter bracket `[low, high]` from bisection; always non-degenerate.
    pub interval: (f64, f64),
    /// Interpolated parameter value of the singularity.
    pub param: f64,
    pub state: Vec<f64>,
    pub tangent: Tangent,
    pub eigenvalues: Vec<Complex<f64>>,
}

/// Continuation result: the branch plus detected special points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Branch {
    pub points: Vec<BranchPoint>,
    pub special_points: Vec<SpecialPoint>,
    /// Per-step spectra, present when `save_eigenvalues` was set.
    pub eigen_data: Option<Vec<Vec<Complex<f64>>>>,
}

impl Branch {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Checks the structural invariants: special points strictly ordered by
    /// step, each with a non-degenerate bracket.
    pub fn validate(&self) -> Result<()> {
        for pair in self.special_points.windows(2) {
            if pair[1].step <= pair[0].step {
                bail!(
                    "special points out of order: steps {} then {}",
                    pair[0].step,
                    pair[1].step
                );
            }
        }
        for sp in &self.special_points {
            if sp.interval.0 >= sp.interval.1 {
                bail!("degenerate special point interval {:?}", sp.interval);
            }
        }
        Ok(())
    }

    /// Special points of a given kind.
    pub fn special_of(&self, kind: SpecialPointKind) -> Vec<&SpecialPoint> {
        self.special_points
            .iter()
            .filter(|sp| sp.kind == kind)
            .collect()
    }
}

/// Continuous test-function values evaluated at every accepted step.
///
/// Inert entries default to 1.0 so they never produce a sign change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TestValues {
    pub fold: f64,
    pub branch_point: f64,
    pub hopf: f64,
    pub neutral_saddle: f64,
    pub bogdanov_takens: f64,
    pub cusp: f64,
}

impl Default for TestValues {
    fn default() -> Self {
        Self {
            fold: 1.0,
            branch_point: 1.0,
            hopf: 1.0,
            neutral_saddle: 1.0,
            bogdanov_takens: 1.0,
            cusp: 1.0,
        }
    }
}

impl TestValues {
    pub fn is_finite(&self) -> bool {
        self.fold.is_finite()
            && self.branch_point.is_finite()
            && self.hopf.is_finite()
            && self.neutral_saddle.is_finite()
            && self.bogdanov_takens.is_finite()
            && self.cusp.is_finite()
    }
}

/// Per-step diagnostics returned alongside each accepted point. Explicit
/// state: nothing here is captured in closures or module globals.
#[derive(Debug, Clone, Default)]
pub struct StepDiagnostics {
    pub test_values: TestValues,
    pub eigenvalues: Vec<Complex<f64>>,
    pub n_unstable: usize,
    /// Unstable eigenvalues with imaginary part above the tolerance; the
    /// discrete zero-Hopf counter.
    pub n_unstable_imag: usize,
}

/// Interface implemented by anything the engine can continue.
///
/// The augmented state convention is `aug = [p, x...]`: the continuation
/// parameter first, then the state. `solve_bordered` is the single linear
/// algebra seam: the engine phrases the corrector, the tangent system, and
/// bisection refinement as bordered solves and never sees a matrix.
pub trait ContinuationProblem {
    /// State dimension (excluding the continuation parameter).
    fn dim(&self) -> usize;

    /// Residual `F(aug)` of length `dim()`.
    fn residual(&mut self, aug: &DVector<f64>) -> Result<DVector<f64>>;

    /// Solves `[dF/dx dF/dp; border_x' border_p] * [dx; dp] = [rhs; rhs_s]`.
    fn solve_bordered(
        &mut self,
        aug: &DVector<f64>,
        border_x: &DVector<f64>,
        border_p: f64,
        rhs: &DVector<f64>,
        rhs_s: f64,
    ) -> Result<BorderedSolution>;

    /// Test functions and spectrum at `aug`, given the current tangent.
    fn diagnostics(
        &mut self,
        aug: &DVector<f64>,
        tangent: &DVector<f64>,
        settings: &ContinuationSettings,
    ) -> Result<StepDiagnostics>;

    /// Kernel dimension of the state Jacobian at `aug`, used to distinguish
    /// simple from non-simple singular points. Defaults to 1 when the
    /// problem cannot tell.
    fn kernel_dimension(&mut self, _aug: &DVector<f64>, _tol: f64) -> Result<usize> {
        Ok(1)
    }

    /// Explicit post-step update request, called once per accepted step.
    fn finalize_step(
        &mut self,
        _aug: &DVector<f64>,
        _step: usize,
        _settings: &ContinuationSettings,
    ) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn pack_aug(p: f64, x: &DVector<f64>) -> DVector<f64> {
    let mut aug = DVector::zeros(x.len() + 1);
    aug[0] = p;
    aug.rows_mut(1, x.len()).copy_from(x);
    aug
}

pub(crate) fn split_aug(aug: &DVector<f64>) -> (f64, DVector<f64>) {
    (aug[0], aug.rows(1, aug.len() - 1).into_owned())
}

fn tangent_struct(tangent: &DVector<f64>) -> Tangent {
    Tangent {
        dx: tangent.rows(1, tangent.len() - 1).iter().cloned().collect(),
        dp: tangent[0],
    }
}

/// Newton correction onto the branch with the pseudo-arclength constraint
/// `<tangent, aug - pred> = 0`. Returns the corrected point and the number of
/// Newton iterations, or `None` when the corrector fails.
fn palc_correct<P: ContinuationProblem>(
    problem: &mut P,
    pred: &DVector<f64>,
    tangent: &DVector<f64>,
    opts: &NewtonOptions,
) -> Result<Option<(DVector<f64>, usize)>> {
    let n = problem.dim();
    let mut aug = pred.clone();
    let border_x = tangent.rows(1, n).into_owned();
    let border_p = tangent[0];

    for iter in 0..opts.max_iters {
        let f = problem.residual(&aug)?;
        let constraint = tangent.dot(&(&aug - pred));
        if f.norm() <= opts.tol && constraint.abs() <= opts.tol {
            return Ok(Some((aug, iter)));
        }

        let sol = problem.solve_bordered(&aug, &border_x, border_p, &(-&f), -constraint)?;
        if !sol.converged {
            return Ok(None);
        }
        let step_norm = (sol.dx.norm_squared() + sol.dl * sol.dl).sqrt();
        aug[0] += sol.dl;
        for i in 0..n {
            aug[i + 1] += sol.dx[i];
        }
        if !aug.iter().all(|v| v.is_finite()) {
            return Ok(None);
        }
        if step_norm < opts.step_tol {
            let f = problem.residual(&aug)?;
            if f.norm() <= opts.tol {
                return Ok(Some((aug, iter + 1)));
            }
            return Ok(None);
        }
    }

    let f = problem.residual(&aug)?;
    let constraint = tangent.dot(&(&aug - pred));
    if f.norm() <= opts.tol && constraint.abs() <= opts.tol {
        return Ok(Some((aug, opts.max_iters)));
    }
    Ok(None)
}

/// Branch tangent at `aug`, using the previous tangent as the border. Falls
/// back to rotating unit borders when the bordered solve is singular, which
/// happens when starting exactly at a fold.
fn compute_tangent<P: ContinuationProblem>(
    problem: &mut P,
    aug: &DVector<f64>,
    prev_tangent: Option<&DVector<f64>>,
) -> Result<DVector<f64>> {
    let n = problem.dim();
    let zero = DVector::zeros(n);

    let mut candidates: Vec<(DVector<f64>, f64)> = Vec::new();
    if let Some(prev) = prev_tangent {
        candidates.push((prev.rows(1, n).into_owned(), prev[0]));
    }
    // Parameter border first (natural continuation), then unit state borders.
    candidates.push((zero.clone(), 1.0));
    for k in 0..n {
        let mut e = DVector::zeros(n);
        e[k] = 1.0;
        candidates.push((e, 0.0));
    }

    for (bx, bp) in candidates {
        let sol = problem.solve_bordered(aug, &bx, bp, &zero, 1.0)?;
        if !sol.converged {
            continue;
        }
        let mut t = DVector::zeros(n + 1);
        t[0] = sol.dl;
        t.rows_mut(1, n).copy_from(&sol.dx);
        let norm = t.norm();
        if norm > 0.0 && t.iter().all(|v| v.is_finite()) {
            t /= norm;
            if let Some(prev) = prev_tangent {
                if t.dot(prev) < 0.0 {
                    t = -t;
                }
            }
            return Ok(t);
        }
    }
    bail!("failed to compute branch tangent: all bordered solves singular")
}

/// Which scalar the bisection tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestSelector {
    Fold,
    BranchPoint,
    Hopf,
    NeutralSaddle,
    BogdanovTakens,
    Cusp,
    UnstableImagCount,
}

impl TestSelector {
    fn value(self, diag: &StepDiagnostics) -> f64 {
        match self {
            TestSelector::Fold => diag.test_values.fold,
            TestSelector::BranchPoint => diag.test_values.branch_point,
            TestSelector::Hopf => diag.test_values.hopf,
            TestSelector::NeutralSaddle => diag.test_values.neutral_saddle,
            TestSelector::BogdanovTakens => diag.test_values.bogdanov_takens,
            TestSelector::Cusp => diag.test_values.cusp,
            TestSelector::UnstableImagCount => diag.n_unstable_imag as f64,
        }
    }

    fn is_discrete(self) -> bool {
        matches!(self, TestSelector::UnstableImagCount)
    }

    fn crossed(self, lo: &StepDiagnostics, hi: &StepDiagnostics) -> bool {
        if self.is_discrete() {
            (self.value(lo) - self.value(hi)).abs() > 0.5
        } else {
            let a = self.value(lo);
            let b = self.value(hi);
            a.is_finite() && b.is_finite() && a * b < 0.0
        }
    }
}

struct Located {
    aug: DVector<f64>,
    diag: StepDiagnostics,
    interval: (f64, f64),
    param: f64,
}

/// Bisection localization of a crossing between two consecutive accepted
/// points. The bracket narrows along the secant; every midpoint is corrected
/// back onto the branch before its diagnostics are evaluated.
fn locate_crossing<P: ContinuationProblem>(
    problem: &mut P,
    settings: &ContinuationSettings,
    mut lo: (DVector<f64>, StepDiagnostics),
    mut hi: (DVector<f64>, StepDiagnostics),
    sel: TestSelector,
) -> Result<Located> {
    let budget = if sel.is_discrete() {
        settings.n_inversion.min(settings.max_bisection_steps)
    } else {
        settings.max_bisection_steps
    };

    for _ in 0..budget {
        let gap = (&hi.0 - &lo.0).norm();
        if gap < settings.dsmin_bisection {
            break;
        }
        let mut dir = &hi.0 - &lo.0;
        dir /= gap;
        let pred = (&lo.0 + &hi.0) * 0.5;
        let Some((mid_aug, _)) = palc_correct(problem, &pred, &dir, &settings.newton)? else {
            log::warn!("bisection corrector failed; keeping current bracket");
            break;
        };
        let mid_diag = problem.diagnostics(&mid_aug, &dir, settings)?;
        let mid = (mid_aug, mid_diag);
        if sel.crossed(&lo.1, &mid.1) {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    let (p_lo, p_hi) = (lo.0[0], hi.0[0]);
    let param = if sel.is_discrete() {
        0.5 * (p_lo + p_hi)
    } else {
        let (v_lo, v_hi) = (sel.value(&lo.1), sel.value(&hi.1));
        if (v_hi - v_lo).abs() > f64::EPSILON {
            p_lo - v_lo * (p_hi - p_lo) / (v_hi - v_lo)
        } else {
            0.5 * (p_lo + p_hi)
        }
    };
    let mut low = p_lo.min(p_hi);
    let mut high = p_lo.max(p_hi);
    if low >= high {
        // Symmetric folds can bracket the same parameter value from both
        // sides; widen to keep the interval usable.
        let eps = f64::EPSILON.max(f64::EPSILON * low.abs());
        low -= eps;
        high += eps;
    }
    Ok(Located {
        aug: hi.0,
        diag: hi.1,
        interval: (low, high),
        param,
    })
}

struct SideResult {
    points: Vec<BranchPoint>,
    specials: Vec<SpecialPoint>,
    eigen: Vec<Vec<Complex<f64>>>,
}

/// Steps one direction until the budget, the parameter bounds, or repeated
/// corrector failure ends the branch.
fn extend<P: ContinuationProblem>(
    problem: &mut P,
    start_aug: &DVector<f64>,
    start_tangent: &DVector<f64>,
    start_diag: &StepDiagnostics,
    sign: StepSign,
    settings: &ContinuationSettings,
) -> Result<SideResult> {
    let mut points = Vec::new();
    let mut specials = Vec::new();
    let mut eigen = Vec::new();

    let mut prev_aug = start_aug.clone();
    let mut prev_tangent = start_tangent * sign.factor();
    let mut prev_diag = start_diag.clone();
    let mut ds = settings.ds.clamp(settings.dsmin, settings.dsmax);

    let mut step = 0usize;
    while step < settings.max_steps {
        let pred = &prev_aug + &prev_tangent * ds;
        let corrected = palc_correct(problem, &pred, &prev_tangent, &settings.newton)?;

        let Some((aug, iters)) = corrected else {
            ds *= 0.5;
            if ds < settings.dsmin {
                break;
            }
            continue;
        };

        if aug[0] < settings.p_min || aug[0] > settings.p_max {
            break;
        }

        let tangent = match compute_tangent(problem, &aug, Some(&prev_tangent)) {
            Ok(t) => t,
            Err(_) => {
                ds *= 0.5;
                if ds < settings.dsmin {
                    break;
                }
                continue;
            }
        };
        let diag = problem.diagnostics(&aug, &tangent, settings)?;
        if !diag.test_values.is_finite() {
            ds *= 0.5;
            if ds < settings.dsmin {
                break;
            }
            continue;
        }

        step += 1;

        if settings.detect_bifurcation {
            if let Some(sp) = detect_special(
                problem,
                settings,
                (&prev_aug, &prev_diag),
                (&aug, &diag),
                step,
            )? {
                specials.push(sp);
            }
        }

        problem.finalize_step(&aug, step, settings)?;

        if settings.save_eigenvalues {
            eigen.push(diag.eigenvalues.clone());
        }
        points.push(BranchPoint {
            state: aug.rows(1, problem.dim()).iter().cloned().collect(),
            param: aug[0],
            tangent: tangent_struct(&tangent),
            n_unstable: diag.n_unstable,
        });

        prev_aug = aug;
        prev_tangent = tangent;
        prev_diag = diag;

        if iters <= 3 {
            ds = (ds * 1.2).min(settings.dsmax);
        } else if iters + 2 >= settings.newton.max_iters {
            ds = (ds * 0.5).max(settings.dsmin);
        }
    }

    Ok(SideResult {
        points,
        specials,
        eigen,
    })
}

/// Priority chain over the test functions; at most one special point is
/// registered per step.
fn detect_special<P: ContinuationProblem>(
    problem: &mut P,
    settings: &ContinuationSettings,
    prev: (&DVector<f64>, &StepDiagnostics),
    new: (&DVector<f64>, &StepDiagnostics),
    step: usize,
) -> Result<Option<SpecialPoint>> {
    let ordered = [
        (TestSelector::BranchPoint, SpecialPointKind::BranchPoint),
        (TestSelector::Fold, SpecialPointKind::Fold),
        (TestSelector::NeutralSaddle, SpecialPointKind::NeutralSaddle),
        (TestSelector::Hopf, SpecialPointKind::Hopf),
    ];
    let codim2 = [
        (
            TestSelector::BogdanovTakens,
            SpecialPointKind::BogdanovTakens,
        ),
        (TestSelector::Cusp, SpecialPointKind::Cusp),
        (TestSelector::UnstableImagCount, SpecialPointKind::ZeroHopf),
    ];

    let mut hit: Option<(TestSelector, SpecialPointKind)> = None;
    let neutral_crossed = TestSelector::NeutralSaddle.crossed(prev.1, new.1);
    for (sel, kind) in ordered {
        if !sel.crossed(prev.1, new.1) {
            continue;
        }
        // A neutral saddle also zeroes the Hopf test; report it once, as NS.
        if sel == TestSelector::Hopf && neutral_crossed {
            continue;
        }
        hit = Some((sel, kind));
        break;
    }
    if hit.is_none() && settings.detect_codim2_bifurcation {
        for (sel, kind) in codim2 {
            if sel.crossed(prev.1, new.1) {
                hit = Some((sel, kind));
                break;
            }
        }
    }

    let Some((sel, mut kind)) = hit else {
        return Ok(None);
    };

    let located = locate_crossing(
        problem,
        settings,
        (prev.0.clone(), prev.1.clone()),
        (new.0.clone(), new.1.clone()),
        sel,
    )?;

    if kind == SpecialPointKind::BranchPoint {
        let kdim =
            problem.kernel_dimension(&located.aug, settings.tol_bisection_eigenvalue.sqrt())?;
        if kdim > 1 {
            kind = SpecialPointKind::NonSimple;
        }
    }

    let tangent = compute_tangent(problem, &located.aug, None).unwrap_or_else(|_| {
        let mut t = DVector::zeros(located.aug.len());
        t[0] = 1.0;
        t
    });

    Ok(Some(SpecialPoint {
        kind,
        step,
        interval: located.interval,
        param: located.param,
        state: located
            .aug
            .rows(1, located.aug.len() - 1)
            .iter()
            .cloned()
            .collect(),
        tangent: tangent_struct(&tangent),
        eigenvalues: located.diag.eigenvalues,
    }))
}

/// Continues a branch of `F(aug) = 0` starting from `(x0, p0)`.
///
/// The initial guess is first corrected at fixed parameter; the branch then
/// extends forward (and backward when `bothside` is set) until a stopping
/// condition. An initial guess that cannot be corrected produces an explicit
/// empty branch, not an error.
pub fn continue_branch<P: ContinuationProblem>(
    problem: &mut P,
    x0: &DVector<f64>,
    p0: f64,
    settings: &ContinuationSettings,
) -> Result<Branch> {
    if x0.len() != problem.dim() {
        bail!(
            "initial state dimension mismatch: expected {}, got {}",
            problem.dim(),
            x0.len()
        );
    }

    // Correct onto the branch at fixed parameter: the border row [0...0, 1]
    // pins dp = 0.
    let aug_guess = pack_aug(p0, x0);
    let mut fixed_p_border = DVector::zeros(problem.dim() + 1);
    fixed_p_border[0] = 1.0;
    let corrected = palc_correct(problem, &aug_guess, &fixed_p_border, &settings.newton)?;
    let Some((aug0, _)) = corrected else {
        log::warn!("initial correction failed; returning empty branch");
        return Ok(Branch::default());
    };

    let tangent0 = compute_tangent(problem, &aug0, None)?;
    let tangent0 = if tangent0[0] < 0.0 { -tangent0 } else { tangent0 };
    let diag0 = problem.diagnostics(&aug0, &tangent0, settings)?;

    let back = if settings.bothside {
        extend(
            problem,
            &aug0,
            &tangent0,
            &diag0,
            StepSign::Backward,
            settings,
        )?
    } else {
        SideResult {
            points: Vec::new(),
            specials: Vec::new(),
            eigen: Vec::new(),
        }
    };
    let fwd = extend(
        problem,
        &aug0,
        &tangent0,
        &diag0,
        StepSign::Forward,
        settings,
    )?;

    let nb = back.points.len();
    let mut points = Vec::with_capacity(nb + 1 + fwd.points.len());
    points.extend(back.points.into_iter().rev());
    points.push(BranchPoint {
        state: aug0.rows(1, problem.dim()).iter().cloned().collect(),
        param: aug0[0],
        tangent: tangent_struct(&tangent0),
        n_unstable: diag0.n_unstable,
    });
    points.extend(fwd.points);

    let mut specials = Vec::new();
    for mut sp in back.specials.into_iter().rev() {
        // Backward step s lands at merged index nb - s.
        sp.step = nb - sp.step;
        specials.push(sp);
    }
    for mut sp in fwd.specials {
        sp.step += nb;
        specials.push(sp);
    }
    specials.sort_by_key(|sp| sp.step);

    let eigen_data = if settings.save_eigenvalues {
        let mut eigen = Vec::with_capacity(nb + 1 + fwd.eigen.len());
        eigen.extend(back.eigen.into_iter().rev());
        eigen.push(diag0.eigenvalues.clone());
        eigen.extend(fwd.eigen);
        Some(eigen)
    } else {
        None
    };

    let branch = Branch {
        points,
        special_points: specials,
        eigen_data,
    };
    branch.validate()?;
    Ok(branch)
}
