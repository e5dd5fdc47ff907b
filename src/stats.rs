use serde::{Deserialize, Serialize};

/// Streaming mean and variance (Welford).
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn mean(&self) -> f64 {
        if self.n_vals == 0 { f64::NAN } else { self.mean }
    }

    pub fn report(&self) -> AccumulatorReport {
        AccumulatorReport {
            mean: self.mean(),
            std_dev: if self.n_vals > 1 {
                (self.diff_2_sum / (self.n_vals as f64 - 1.0)).sqrt()
            } else {
                f64::NAN
            },
        }
    }
}

/// Element-wise [`Accumulator`] over equal-length vectors.
#[derive(Debug, Clone, Default)]
pub struct VecAccumulator {
    acc_vec: Vec<Accumulator>,
}

impl VecAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one vector; the first call fixes the length.
    pub fn add(&mut self, vals: &[f64]) {
        if self.acc_vec.is_empty() {
            self.acc_vec.resize_with(vals.len(), Accumulator::new);
        }
        for (acc, &val) in self.acc_vec.iter_mut().zip(vals) {
            acc.add(val);
        }
    }

    pub fn means(&self) -> Vec<f64> {
        self.acc_vec.iter().map(Accumulator::mean).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_and_std_dev() {
        let mut acc = Accumulator::new();
        for val in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add(val);
        }
        let report = acc.report();
        assert!((report.mean - 5.0).abs() < 1e-12);
        assert!((report.std_dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_and_single_values() {
        let mut acc = Accumulator::new();
        assert!(acc.mean().is_nan());
        acc.add(3.0);
        assert_eq!(acc.mean(), 3.0);
        assert!(acc.report().std_dev.is_nan());
    }

    #[test]
    fn element_wise_means() {
        let mut acc = VecAccumulator::new();
        acc.add(&[1.0, 10.0]);
        acc.add(&[3.0, 20.0]);
        assert_eq!(acc.means(), vec![2.0, 15.0]);
    }
}
