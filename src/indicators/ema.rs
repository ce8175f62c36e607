// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
//   k     = 2 / (period + 1)
//   EMA_t = x_t * k + EMA_{t-1} * (1 - k)
//
// Seeded with the simple average of the first `period` values; nothing is
// emitted before that.
// =============================================================================

/// Incremental EMA over a stream of values.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    k: f64,
    seed_sum: f64,
    seen: usize,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            k: 2.0 / (period + 1) as f64,
            seed_sum: 0.0,
            seen: 0,
            value: None,
        }
    }

    /// Feed one value. Returns the EMA once seeded. Non-finite inputs are
    /// skipped.
    pub fn update(&mut self, x: f64) -> Option<f64> {
        if !x.is_finite() {
            return self.value;
        }
        self.value = match self.value {
            Some(prev) => Some(x * self.k + prev * (1.0 - self.k)),
            None => {
                self.seed_sum += x;
                self.seen += 1;
                (self.seen == self.period).then(|| self.seed_sum / self.period as f64)
            }
        };
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// EMA values from the seed onwards: `values.len() - period + 1` entries when
/// every input is finite, empty when there are fewer than `period` values.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return Vec::new();
    }
    let mut ema = Ema::new(period);
    values.iter().filter_map(|&x| ema.update(x).filter(|_| x.is_finite())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_before_the_seed() {
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(2.0), None);
        assert_eq!(ema.update(4.0), None);
        assert_eq!(ema.update(6.0), Some(4.0));
        assert_eq!(ema.value(), Some(4.0));
    }

    #[test]
    fn series_matches_hand_computation() {
        // Period 5 over 1..=10: seed 3.0, k = 1/3.
        let values: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let series = ema_series(&values, 5);
        assert_eq!(series.len(), 6);

        let k = 1.0 / 3.0;
        let mut expected = 3.0;
        assert!((series[0] - expected).abs() < 1e-12);
        for (i, &x) in values[5..].iter().enumerate() {
            expected = x * k + expected * (1.0 - k);
            assert!((series[i + 1] - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn short_or_zero_period_input_is_empty() {
        assert!(ema_series(&[1.0, 2.0], 5).is_empty());
        assert!(ema_series(&[1.0, 2.0], 0).is_empty());
        assert!(ema_series(&[], 3).is_empty());
    }

    #[test]
    fn non_finite_values_are_skipped() {
        let series = ema_series(&[1.0, f64::NAN, 2.0, 3.0, f64::INFINITY], 3);
        assert_eq!(series, vec![2.0]);
    }
}
