//! Element-wise output equivalence
//!
//! Two outputs are equivalent when their shapes match exactly and every
//! element pair satisfies `|a - b| <= atol + rtol * |b|`, with `b` taken
//! from the remote output. One failing element fails the whole comparison.

use crate::errors::{ParityError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relative and absolute tolerance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub rtol: f32,
    pub atol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-3,
        }
    }
}

impl Tolerance {
    pub fn new(rtol: f32, atol: f32) -> Self {
        Self { rtol, atol }
    }
}

/// NaN is never close to anything; equal values (including equal infinities)
/// always are.
pub fn is_close(a: f32, b: f32, tol: Tolerance) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    if a == b {
        return true;
    }
    (a - b).abs() <= tol.atol + tol.rtol * b.abs()
}

/// Same length and every pair close
pub fn allclose(a: &[f32], b: &[f32], tol: Tolerance) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| is_close(x, y, tol))
}

/// First element pair outside tolerance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    /// Flat row-major index
    pub index: usize,
    /// Multi-dimensional position
    pub position: Vec<usize>,
    pub local: f32,
    pub remote: f32,
}

/// Outcome of comparing two outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceReport {
    pub shape: Vec<usize>,
    pub elements: usize,
    pub mismatched: usize,
    pub max_abs_diff: f32,
    pub max_rel_diff: f32,
    pub first_mismatch: Option<Mismatch>,
    pub tolerance: Tolerance,
}

impl EquivalenceReport {
    pub fn passed(&self) -> bool {
        self.mismatched == 0
    }

    /// `Divergence` carrying this report's summary when any element failed
    pub fn ensure_passed(&self) -> Result<()> {
        if self.passed() {
            Ok(())
        } else {
            Err(ParityError::Divergence(self.to_string()))
        }
    }
}

impl fmt::Display for EquivalenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} elements outside rtol={} atol={} (max abs diff {:.6e}, max rel diff {:.6e})",
            self.mismatched,
            self.elements,
            self.tolerance.rtol,
            self.tolerance.atol,
            self.max_abs_diff,
            self.max_rel_diff
        )?;
        if let Some(m) = &self.first_mismatch {
            write!(
                f,
                "; first at {:?}: local={} remote={}",
                m.position, m.local, m.remote
            )?;
        }
        Ok(())
    }
}

/// Compare `local` against `remote`
///
/// Shapes must match exactly; reshaping is never attempted.
pub fn compare(local: &Tensor, remote: &Tensor, tol: Tolerance) -> Result<EquivalenceReport> {
    if local.shape != remote.shape {
        return Err(ParityError::Shape(format!(
            "Local output shape {:?} differs from remote output shape {:?}",
            local.shape, remote.shape
        )));
    }

    let mut report = EquivalenceReport {
        shape: local.shape.clone(),
        elements: local.len(),
        mismatched: 0,
        max_abs_diff: 0.0,
        max_rel_diff: 0.0,
        first_mismatch: None,
        tolerance: tol,
    };

    for (index, (&a, &b)) in local.data.iter().zip(&remote.data).enumerate() {
        // Only finite differences feed the maxima; JSON has no infinity
        let abs = (a - b).abs();
        if a != b && abs.is_finite() {
            report.max_abs_diff = report.max_abs_diff.max(abs);
            if b != 0.0 {
                report.max_rel_diff = report.max_rel_diff.max(abs / b.abs());
            }
        }

        if !is_close(a, b, tol) {
            report.mismatched += 1;
            if report.first_mismatch.is_none() {
                report.first_mismatch = Some(Mismatch {
                    index,
                    position: unravel(index, &local.shape),
                    local: a,
                    remote: b,
                });
            }
        }
    }

    Ok(report)
}

fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut position = vec![0; shape.len()];
    for (axis, &dim) in shape.iter().enumerate().rev() {
        if dim > 0 {
            position[axis] = index % dim;
            index /= dim;
        }
    }
    position
}
