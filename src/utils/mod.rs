use std::fmt;
use std::iter::Sum;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::RealField;
use num_traits::{Float, FromPrimitive, NumAssign, ToPrimitive};

/// Scalar type the pipeline operates on.
///
/// Bundles the bounds required by the sparse kernels (`nalgebra-sparse`),
/// the dense kernels (`ndarray`) and the numeric helpers into one trait so
/// signatures stay readable. Implemented for `f32` and `f64`.
pub trait RaspFloat:
    Float
    + NumAssign
    + FromPrimitive
    + ToPrimitive
    + RealField
    + ndarray::ScalarOperand
    + Sum
    + Send
    + Sync
    + Copy
    + fmt::Display
    + fmt::Debug
    + 'static
{
}

impl RaspFloat for f32 {}
impl RaspFloat for f64 {}

/// Cooperative cancellation flag shared between a caller and a running
/// projection. Cloning hands out another handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Linearly interpolated quantile of a sample, `q` in `[0, 1]`.
///
/// Matches the "linear" convention: position `q * (n - 1)` with
/// interpolation between the two bracketing order statistics. Returns `None`
/// on an empty sample.
pub fn quantile<T: RaspFloat>(values: &[T], q: f64) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<T> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = T::from_f64(pos - lo as f64)?;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_quantile_interpolation() {
        let values = vec![1.0f64, 2.0, 3.0, 4.0];
        assert_relative_eq!(quantile(&values, 0.0).unwrap(), 1.0);
        assert_relative_eq!(quantile(&values, 1.0).unwrap(), 4.0);
        assert_relative_eq!(quantile(&values, 0.5).unwrap(), 2.5);
        assert!(quantile::<f64>(&[], 0.5).is_none());
    }
}
