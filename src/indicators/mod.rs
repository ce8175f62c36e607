// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the screener
// reports. Every public function returns `Option<T>` (or an empty series) so
// callers are forced to handle insufficient data.

pub mod ema;
pub mod macd;
pub mod rsi;

pub use macd::{calculate_macd, Macd};
pub use rsi::rsi_14;
