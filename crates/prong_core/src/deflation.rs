//! Deflation operator for multi-root Newton searches.
//!
//! Holds the roots found so far and reweights the residual by
//! `M(x) = prod_r (1 / ||x - r||^power + shift)` so Newton is repelled from
//! known roots. The list only grows; it is owned by the routine driving one
//! multi-root search and discarded afterwards.

use nalgebra::DVector;

#[derive(Debug, Clone)]
pub struct DeflationOperator {
    roots: Vec<DVector<f64>>,
    pub power: f64,
    pub shift: f64,
    /// Optional cap on the number of stored roots; pushes beyond the cap are
    /// ignored. Default unbounded.
    pub capacity: Option<usize>,
}

impl Default for DeflationOperator {
    fn default() -> Self {
        Self::new(2.0, 1.0)
    }
}

impl DeflationOperator {
    pub fn new(power: f64, shift: f64) -> Self {
        assert!(power > 0.0, "deflation power must be positive");
        Self {
            roots: Vec::new(),
            power,
            shift,
            capacity: None,
        }
    }

    pub fn with_roots(power: f64, shift: f64, roots: Vec<DVector<f64>>) -> Self {
        let mut op = Self::new(power, shift);
        op.roots = roots;
        op
    }

    pub fn push(&mut self, root: DVector<f64>) {
        if let Some(cap) = self.capacity {
            if self.roots.len() >= cap {
                log::warn!("deflation operator at capacity {cap}; dropping new root");
                return;
            }
        }
        self.roots.push(root);
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> &[DVector<f64>] {
        &self.roots
    }

    /// True when `x` is within `tol` of a stored root.
    pub fn contains(&self, x: &DVector<f64>, tol: f64) -> bool {
        self.roots.iter().any(|r| (x - r).norm() < tol)
    }

    /// The scalar penalty `M(x)`.
    pub fn factor(&self, x: &DVector<f64>) -> f64 {
        self.roots
            .iter()
            .map(|r| {
                let d = (x - r).norm();
                if d == 0.0 {
                    f64::INFINITY
                } else {
                    d.powf(-self.power) + self.shift
                }
            })
            .product()
    }

    /// Gradient of `M` at `x`: `M * sum_r (grad m_r / m_r)`.
    pub fn gradient(&self, x: &DVector<f64>) -> DVector<f64> {
        let m = self.factor(x);
        let mut grad = DVector::zeros(x.len());
        for r in &self.roots {
            let diff = x - r;
            let d = diff.norm();
            if d == 0.0 {
                continue;
            }
            let m_r = d.powf(-self.power) + self.shift;
            // grad m_r = -power * ||x-r||^{-power-2} (x - r)
            let coeff = -self.power * d.powf(-self.power - 2.0) / m_r;
            grad.axpy(m * coeff, &diff, 1.0);
        }
        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newton::{newton, NewtonOptions};
    use nalgebra::DMatrix;

    #[test]
    fn factor_is_one_when_empty_and_grows_near_roots() {
        let mut op = DeflationOperator::default();
        let x = DVector::from_vec(vec![0.5]);
        assert_eq!(op.factor(&x), 1.0);
        op.push(DVector::from_vec(vec![0.4]));
        assert!(op.factor(&x) > 1.0);
        assert!(op.factor(&DVector::from_vec(vec![0.401])) > op.factor(&x));
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let op = DeflationOperator::with_roots(
            2.0,
            1.0,
            vec![
                DVector::from_vec(vec![1.0, 0.0]),
                DVector::from_vec(vec![-1.0, 0.5]),
            ],
        );
        let x = DVector::from_vec(vec![0.3, 0.2]);
        let grad = op.gradient(&x);
        let h = 1e-7;
        for i in 0..2 {
            let mut xp = x.clone();
            xp[i] += h;
            let mut xm = x.clone();
            xm[i] -= h;
            let fd = (op.factor(&xp) - op.factor(&xm)) / (2.0 * h);
            assert!(
                (grad[i] - fd).abs() < 1e-5 * fd.abs().max(1.0),
                "component {i}: analytic {} vs fd {fd}",
                grad[i]
            );
        }
    }

    #[test]
    fn capacity_cap_ignores_extra_roots() {
        let mut op = DeflationOperator::default();
        op.capacity = Some(1);
        op.push(DVector::from_vec(vec![0.0]));
        op.push(DVector::from_vec(vec![1.0]));
        assert_eq!(op.len(), 1);
    }

    #[test]
    fn deflated_newton_finds_the_other_root() {
        // x^2 - 2 has roots at +-sqrt(2); deflate the positive one and start
        // from the positive side: the iteration must land on the negative root.
        let root = 2.0f64.sqrt();
        let mut defl = DeflationOperator::default();
        defl.push(DVector::from_vec(vec![root]));
        let (x, report) = newton(
            |x| Ok(DVector::from_vec(vec![x[0] * x[0] - 2.0])),
            |x| Ok(DMatrix::from_row_slice(1, 1, &[2.0 * x[0]])),
            &DVector::from_vec(vec![2.0]),
            &NewtonOptions {
                max_iters: 100,
                ..Default::default()
            },
            Some(&defl),
            None,
        )
        .expect("newton");
        assert!(report.converged);
        assert!((x[0] + root).abs() < 1e-8, "converged to {}", x[0]);
    }

    #[test]
    fn newton_started_exactly_at_deflated_root_does_not_converge_to_it() {
        let root = DVector::from_vec(vec![2.0f64.sqrt()]);
        let mut defl = DeflationOperator::default();
        defl.push(root.clone());
        // Start exactly at the deflated root: M(x0) is unbounded there, so the
        // deflated residual can never pass the tolerance at this point.
        let (x, report) = newton(
            |x| Ok(DVector::from_vec(vec![x[0] * x[0] - 2.0])),
            |x| Ok(DMatrix::from_row_slice(1, 1, &[2.0 * x[0]])),
            &root,
            &NewtonOptions {
                max_iters: 200,
                ..Default::default()
            },
            Some(&defl),
            None,
        )
        .expect("newton");
        assert!(
            !report.converged || (x[0] - root[0]).abs() > 1e-3,
            "deflated newton terminated converged at the deflated root, x = {}",
            x[0]
        );
    }

    #[test]
    fn far_initialization_converges_normally_with_deflation_active() {
        let mut defl = DeflationOperator::default();
        defl.push(DVector::from_vec(vec![2.0f64.sqrt()]));
        let (x, report) = newton(
            |x| Ok(DVector::from_vec(vec![x[0] * x[0] - 2.0])),
            |x| Ok(DMatrix::from_row_slice(1, 1, &[2.0 * x[0]])),
            &DVector::from_vec(vec![-5.0]),
            &NewtonOptions {
                max_iters: 100,
                ..Default::default()
            },
            Some(&defl),
            None,
        )
        .expect("newton");
        assert!(report.converged);
        assert!((x[0] + 2.0f64.sqrt()).abs() < 1e-8);
    }
}
