//! System contract consumed by the continuation engine.
//!
//! The user supplies a [`VectorField`]: the residual `F(x, params)` and a
//! Jacobian. Parameters live in an opaque record `P` accessed through a
//! [`Lens`], so "continue in parameter q" is expressed by handing the engine a
//! lens rather than by baking a parameter index into the system itself.

use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Accessor/mutator pair for one scalar parameter inside a parameter record.
///
/// `set` is non-mutating: it returns an updated copy of the record.
pub trait Lens<P> {
    fn get(&self, params: &P) -> f64;
    fn set(&self, params: &P, value: f64) -> P;
}

/// Lens selecting one entry of a `Vec<f64>` parameter record by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLens(pub usize);

impl Lens<Vec<f64>> for IndexLens {
    fn get(&self, params: &Vec<f64>) -> f64 {
        params[self.0]
    }

    fn set(&self, params: &Vec<f64>, value: f64) -> Vec<f64> {
        let mut out = params.clone();
        out[self.0] = value;
        out
    }
}

/// A parameterized nonlinear system `F(x, params) = 0`.
///
/// Only `residual` and `jacobian` are required. The transpose and Hessian
/// hooks have workable defaults: the transpose falls back to assembling and
/// transposing the Jacobian, and a missing Hessian makes callers fall back to
/// finite differences.
pub trait VectorField<P> {
    fn dim(&self) -> usize;

    fn residual(&self, x: &DVector<f64>, params: &P) -> Result<DVector<f64>>;

    fn jacobian(&self, x: &DVector<f64>, params: &P) -> Result<DMatrix<f64>>;

    /// `J(x)' * v`. Override when a cheaper transpose apply exists.
    fn jacobian_transpose_apply(
        &self,
        x: &DVector<f64>,
        params: &P,
        v: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        Ok(self.jacobian(x, params)?.transpose() * v)
    }

    /// Analytic bilinear Hessian action `d2F(x)[v1, v2]`, when available.
    fn hessian_bilinear(
        &self,
        _x: &DVector<f64>,
        _params: &P,
        _v1: &DVector<f64>,
        _v2: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        None
    }
}

impl<P, T: VectorField<P> + ?Sized> VectorField<P> for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn residual(&self, x: &DVector<f64>, params: &P) -> Result<DVector<f64>> {
        (**self).residual(x, params)
    }

    fn jacobian(&self, x: &DVector<f64>, params: &P) -> Result<DMatrix<f64>> {
        (**self).jacobian(x, params)
    }

    fn jacobian_transpose_apply(
        &self,
        x: &DVector<f64>,
        params: &P,
        v: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        (**self).jacobian_transpose_apply(x, params, v)
    }

    fn hessian_bilinear(
        &self,
        x: &DVector<f64>,
        params: &P,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Option<DVector<f64>> {
        (**self).hessian_bilinear(x, params, v1, v2)
    }
}

/// Finite-difference step configuration shared by the derivative helpers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FiniteDiff {
    /// Step for first-order central differences.
    pub delta: f64,
    /// Step for second/third directional differences.
    pub delta2: f64,
}

impl Default for FiniteDiff {
    fn default() -> Self {
        Self {
            delta: 1e-8,
            delta2: 1e-4,
        }
    }
}

impl FiniteDiff {
    /// Central difference of `F` with respect to the parameter behind `lens`.
    pub fn dp_residual<P, S, L>(
        &self,
        system: &S,
        lens: &L,
        x: &DVector<f64>,
        params: &P,
    ) -> Result<DVector<f64>>
    where
        S: VectorField<P>,
        L: Lens<P>,
    {
        let p = lens.get(params);
        let plus = system.residual(x, &lens.set(params, p + self.delta))?;
        let minus = system.residual(x, &lens.set(params, p - self.delta))?;
        Ok((plus - minus) / (2.0 * self.delta))
    }

    /// Central difference of `J(x) * v` with respect to the lensed parameter.
    pub fn dp_jacobian_apply<P, S, L>(
        &self,
        system: &S,
        lens: &L,
        x: &DVector<f64>,
        params: &P,
        v: &DVector<f64>,
    ) -> Result<DVector<f64>>
    where
        S: VectorField<P>,
        L: Lens<P>,
    {
        let p = lens.get(params);
        let plus = system.jacobian(x, &lens.set(params, p + self.delta))? * v;
        let minus = system.jacobian(x, &lens.set(params, p - self.delta))? * v;
        Ok((plus - minus) / (2.0 * self.delta))
    }

    /// Directional second derivative `d2F(x)[v1, v2]`, preferring the
    /// analytic Hessian when the system provides one.
    pub fn d2f<P, S>(
        &self,
        system: &S,
        x: &DVector<f64>,
        params: &P,
        v1: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> Result<DVector<f64>>
    where
        S: VectorField<P>,
    {
        if let Some(exact) = system.hessian_bilinear(x, params, v1, v2) {
            return Ok(exact);
        }
        // Central cross difference; second-order accurate, and exact for
        // residuals that are cubic in the state.
        let h = self.delta2;
        let fpp = system.residual(&(x + v1 * h + v2 * h), params)?;
        let fpm = system.residual(&(x + v1 * h - v2 * h), params)?;
        let fmp = system.residual(&(x - v1 * h + v2 * h), params)?;
        let fmm = system.residual(&(x - v1 * h - v2 * h), params)?;
        Ok((fpp - fpm - fmp + fmm) / (4.0 * h * h))
    }

    /// Directional third derivative `d3F(x)[v, v, v]` by central differences.
    pub fn d3f<P, S>(
        &self,
        system: &S,
        x: &DVector<f64>,
        params: &P,
        v: &DVector<f64>,
    ) -> Result<DVector<f64>>
    where
        S: VectorField<P>,
    {
        let h = self.delta2;
        let f2p = system.residual(&(x + v * (2.0 * h)), params)?;
        let f1p = system.residual(&(x + v * h), params)?;
        let f1m = system.residual(&(x - v * h), params)?;
        let f2m = system.residual(&(x - v * (2.0 * h)), params)?;
        Ok((f2p - f1p * 2.0 + f1m * 2.0 - f2m) / (2.0 * h * h * h))
    }
}
