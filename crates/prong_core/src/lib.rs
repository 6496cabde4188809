/// The `prong_core` crate is a numerical continuation and bifurcation engine
/// for parameterized nonlinear systems `F(x, p) = 0`.
///
/// Key components:
/// - **Problem**: `VectorField` (residual/Jacobian contract) and `Lens`
///   (parameter addressing inside an opaque record).
/// - **Bordered**: interchangeable bordered linear solve strategies
///   (Schur bordering, full matrix, matrix-free GMRES).
/// - **Continuation**: the pseudo-arclength predictor-corrector engine with
///   test-function based detection of folds, branch points, Hopf points and
///   codim-2 events, plus equilibrium and fold-curve front ends.
/// - **MinAug**: minimally augmented fold systems at dimension N+1.
/// - **Normal form / deflation**: Lyapunov-Schmidt branch switching and
///   multi-root Newton searches.
pub mod bordered;
pub mod continuation;
pub mod deflation;
pub mod eigen;
pub mod linalg;
pub mod minaug;
pub mod newton;
pub mod normal_form;
pub mod problem;

pub use bordered::{BorderedSolution, BorderedSolver, BorderedSystem};
pub use continuation::{
    continue_branch, continue_equilibrium, continue_fold_curve, Branch, BranchPoint,
    ContinuationProblem, ContinuationSettings, SpecialPoint, SpecialPointKind, StepDiagnostics,
    StepSign,
};
pub use deflation::DeflationOperator;
pub use minaug::FoldMinAug;
pub use newton::{newton, NewtonOptions, NewtonReport};
pub use normal_form::{
    branch_switch, multi_branch_switch, MultiBranchResult, NormalForm1, SwitchedPoint,
};
pub use problem::{FiniteDiff, IndexLens, Lens, VectorField};
