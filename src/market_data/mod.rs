pub mod aggregator;
pub mod hub;
pub mod symbols;
pub mod tick;

pub use aggregator::{Candle, CandleKey, TickAggregator};
pub use hub::{HubMessage, HubSettings, LiveQuote, QuoteHub, SubscriberFilter, Subscription};
pub use symbols::SymbolTable;
