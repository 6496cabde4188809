//! Shared helpers for the continuation test functions.

use nalgebra::DMatrix;
use num_complex::Complex;

const IMAG_EPS: f64 = 1e-8;

/// Hopf test function: product of sums over conjugate eigenpairs. A sign
/// change in the real part brackets a pair crossing the imaginary axis.
pub fn hopf_test_function(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = Complex::new(1.0, 0.0);
    let mut found_pair = false;

    for i in 0..eigenvalues.len() {
        let eig_i = eigenvalues[i];
        if eig_i.im.abs() < IMAG_EPS {
            continue;
        }
        for j in (i + 1)..eigenvalues.len() {
            let eig_j = eigenvalues[j];
            if eig_j.im.abs() < IMAG_EPS {
                continue;
            }
            if eig_i.im.signum() == eig_j.im.signum() {
                continue;
            }
            found_pair = true;
            product *= eig_i + eig_j;
        }
    }

    if found_pair {
        product.re
    } else {
        1.0
    }
}

/// Neutral saddle test function: product of pairwise sums of real
/// eigenvalues. Zero when two real eigenvalues are symmetric about zero,
/// which also zeroes the Hopf product without a genuine Hopf point.
pub fn neutral_saddle_test_function(eigenvalues: &[Complex<f64>]) -> f64 {
    let mut product = 1.0;
    let mut found_pair = false;

    for i in 0..eigenvalues.len() {
        if eigenvalues[i].im.abs() >= IMAG_EPS {
            continue;
        }
        for j in (i + 1)..eigenvalues.len() {
            if eigenvalues[j].im.abs() >= IMAG_EPS {
                continue;
            }
            found_pair = true;
            product *= eigenvalues[i].re + eigenvalues[j].re;
        }
    }

    if found_pair {
        product
    } else {
        1.0
    }
}

/// Signed determinant via LU; 0.0 for a numerically singular factorization.
pub fn signed_determinant(mat: &DMatrix<f64>) -> f64 {
    if mat.nrows() == 0 {
        return 1.0;
    }
    mat.clone().lu().determinant()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hopf_test_zero_when_pair_sits_on_axis() {
        let eigenvalues = vec![Complex::new(0.0, 1.0), Complex::new(0.0, -1.0)];
        assert!(hopf_test_function(&eigenvalues).abs() < 1e-12);
    }

    #[test]
    fn hopf_test_inert_for_real_spectrum() {
        let eigenvalues = vec![Complex::new(1.0, 0.0), Complex::new(-1.0, 0.0)];
        assert!((hopf_test_function(&eigenvalues) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn neutral_saddle_zero_for_symmetric_real_pair() {
        let eigenvalues = vec![Complex::new(1.0, 0.0), Complex::new(-1.0, 0.0)];
        assert!(neutral_saddle_test_function(&eigenvalues).abs() < 1e-12);
    }

    #[test]
    fn neutral_saddle_inert_for_complex_pair() {
        let eigenvalues = vec![Complex::new(0.0, 1.0), Complex::new(0.0, -1.0)];
        assert!((neutral_saddle_test_function(&eigenvalues) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn signed_determinant_tracks_sign() {
        let pos = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        let neg = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, -3.0]);
        assert!(signed_determinant(&pos) > 0.0);
        assert!(signed_determinant(&neg) < 0.0);
    }
}
