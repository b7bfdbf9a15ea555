//! statistics
//!
//! ## `Statistics` trait
//!
//! * To make generic code over slices of counts and floats there is the `Statistics` trait
//!     * `sum`: compensated sum
//!     * `mean`, `var`: moments, `var` takes the delta degrees of freedom
//!     * `expm1_mean`: mean on the linear scale of log1p-transformed values

use num_traits::cast::ToPrimitive;

/// Statistics Trait
///
/// It contains `sum`, `mean`, `var`, `expm1_mean`
pub trait Statistics {
    /// Compensated (Neumaier) sum
    fn sum(&self) -> f64;
    /// mean stats, 0 for an empty sample
    fn mean(&self) -> f64;
    /// variance with `ddof` delta degrees of freedom, 0 when there are not enough values
    fn var(&self, ddof: f64) -> f64;
    /// mean of `exp(x) - 1`
    fn expm1_mean(&self) -> f64;
}

#[inline]
fn as_f64<T: ToPrimitive>(x: &T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

impl<T: ToPrimitive + Copy> Statistics for [T] {
    fn sum(&self) -> f64 {
        neumaier_sum(self.iter().map(as_f64))
    }

    fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.sum() / self.len() as f64
    }

    fn var(&self, ddof: f64) -> f64 {
        let n = self.len() as f64;
        if n <= ddof {
            return 0.0;
        }
        let mean = self.mean();
        let ss = neumaier_sum(self.iter().map(|v| {
            let d = as_f64(v) - mean;
            d * d
        }));
        ss / (n - ddof)
    }

    fn expm1_mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        neumaier_sum(self.iter().map(|v| as_f64(v).exp_m1())) / self.len() as f64
    }
}

/// Sum with a running compensation term, so that summing many small values onto a
/// large one does not lose them.
pub fn neumaier_sum(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut sum = 0.0f64;
    let mut c = 0.0f64;
    for x in values {
        let t = sum + x;
        if sum.abs() >= x.abs() {
            c += (sum - t) + x;
        } else {
            c += (x - t) + sum;
        }
        sum = t;
    }
    sum + c
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_stats() {
        let v = vec![1, 2, 4, 3, 5, 6];
        assert_approx_eq!(v.mean(), 3.5, 1e-11);
        assert_approx_eq!(v.var(0.0), 2.9166666666666665, 1e-11);
        assert_approx_eq!(v.var(1.0), 3.5, 1e-11);

        let mut v = vec![1.0f64];
        v.append(&mut vec![1e-12f64; 1e6 as usize]);
        assert_approx_eq!(v.mean(), 9.999_999_999_999_974e-7, 1e-13);
        assert_approx_eq!(v.var(0.0), 9.999_980_000_010_034e-7, 1e-13);
    }

    #[test]
    fn test_degenerate() {
        let empty: Vec<f64> = vec![];
        assert_eq!(empty.mean(), 0.0);
        assert_eq!(empty.var(1.0), 0.0);
        assert_eq!([2.0f64].var(1.0), 0.0);
        assert_approx_eq!([0.0f64, 2.0f64.ln()].expm1_mean(), 0.5, 1e-12);
    }
}
