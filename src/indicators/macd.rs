// =============================================================================
// MACD (12, 26, 9)
// =============================================================================
//
// MACD line  = EMA-12 - EMA-26 over the full close series, aligned on their
//              common tail (EMA-26 is the shorter series).
// Signal     = EMA-9 of the MACD line.
// Histogram  = MACD - signal.
//
// The MACD line needs 26 closes. The signal needs 9 MACD values, i.e. 34
// closes; below that only the line is reported.
// =============================================================================

use serde::Serialize;

use super::ema::ema_series;

pub const FAST: usize = 12;
pub const SLOW: usize = 26;
pub const SIGNAL: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Macd {
    pub macd: f64,
    pub signal: Option<f64>,
    pub histogram: Option<f64>,
}

/// Full MACD line, oldest first.
pub fn macd_line(closes: &[f64]) -> Vec<f64> {
    let fast = ema_series(closes, FAST);
    let slow = ema_series(closes, SLOW);
    let overlap = fast.len().min(slow.len());
    if overlap == 0 {
        return Vec::new();
    }
    fast[fast.len() - overlap..]
        .iter()
        .zip(&slow[slow.len() - overlap..])
        .map(|(f, s)| f - s)
        .collect()
}

/// Latest MACD triple, or `None` with fewer than 26 closes.
pub fn calculate_macd(closes: &[f64]) -> Option<Macd> {
    if closes.len() < SLOW {
        return None;
    }
    let line = macd_line(closes);
    let macd = *line.last()?;
    let signal = ema_series(&line, SIGNAL).last().copied();
    Some(Macd {
        macd,
        signal,
        histogram: signal.map(|s| macd - s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_twenty_six_closes() {
        let closes: Vec<f64> = (1..=25).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes).is_none());
    }

    #[test]
    fn line_without_signal_below_thirty_four() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let m = calculate_macd(&closes).unwrap();
        assert_eq!(macd_line(&closes).len(), 5);
        assert!(m.macd > 0.0);
        assert!(m.signal.is_none());
        assert!(m.histogram.is_none());
    }

    #[test]
    fn flat_series_is_zero() {
        let m = calculate_macd(&[100.0; 60]).unwrap();
        assert!(m.macd.abs() < 1e-10);
        assert!(m.signal.unwrap().abs() < 1e-10);
        assert!(m.histogram.unwrap().abs() < 1e-10);
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0).collect();
        let m = calculate_macd(&closes).unwrap();
        let line = macd_line(&closes);
        let signal = *ema_series(&line, SIGNAL).last().unwrap();
        assert!((m.macd - line[line.len() - 1]).abs() < 1e-12);
        assert!((m.signal.unwrap() - signal).abs() < 1e-12);
        assert!((m.histogram.unwrap() - (m.macd - signal)).abs() < 1e-12);
    }

    #[test]
    fn rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes).unwrap().macd > 0.0);
    }
}
