// =============================================================================
// Relative Strength Index (RSI-14)
// =============================================================================
//
// Step 1 — Take the most recent 15 closes and their 14 deltas.
// Step 2 — avg_gain / avg_loss = mean of the up moves / down moves over those
//          14 deltas (down moves as positive magnitudes).
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// With no down moves at all the RSI is 100, including a perfectly flat window.
// =============================================================================

pub const RSI_PERIOD: usize = 14;

/// RSI over the last `period + 1` closes.
///
/// # Edge cases
/// - `period == 0` => `None`
/// - `closes.len() < period + 1` => `None`
/// - Average loss of zero => `Some(100.0)`
/// - Non-finite inputs => `None`
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let window = &closes[closes.len() - (period + 1)..];
    let (sum_gain, sum_loss) = window.windows(2).map(|w| w[1] - w[0]).fold(
        (0.0_f64, 0.0_f64),
        |(g, l), d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        },
    );

    let period_f = period as f64;
    rsi_from_averages(sum_gain / period_f, sum_loss / period_f)
}

/// The screener's RSI-14.
pub fn rsi_14(closes: &[f64]) -> Option<f64> {
    calculate_rsi(closes, RSI_PERIOD)
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if rsi.is_finite() && avg_gain.is_finite() {
        Some(rsi)
    } else {
        None
    }
}
