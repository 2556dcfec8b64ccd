//! Trailing simple moving average.
//!
//! The N-point average at the last element covers the last N closes, the last
//! element included. With fewer than N values the result is undefined.

/// Mean of the last `window` values, or `None` if there are fewer than
/// `window` values or any of them is not finite.
pub fn trailing_mean(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    if tail.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(tail.iter().sum::<f64>() / window as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-10;

    #[test]
    fn mean_of_last_window() {
        let v = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        assert!((trailing_mean(&v, 5).unwrap() - 13.0).abs() < EPS);
        assert!((trailing_mean(&v, 1).unwrap() - 15.0).abs() < EPS);
    }

    #[test]
    fn too_few_points_is_undefined_not_zero() {
        assert_eq!(trailing_mean(&[1.0, 2.0], 3), None);
        assert_eq!(trailing_mean(&[], 1), None);
    }

    #[test]
    fn exactly_window_points_is_defined() {
        assert!((trailing_mean(&[2.0, 4.0, 6.0], 3).unwrap() - 4.0).abs() < EPS);
    }

    #[test]
    fn nan_in_window_is_undefined() {
        assert_eq!(trailing_mean(&[1.0, f64::NAN, 3.0], 2), None);
        assert!(trailing_mean(&[f64::NAN, 2.0, 3.0], 2).is_some());
    }
}
