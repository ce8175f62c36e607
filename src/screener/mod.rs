pub mod cache;
pub mod engine;
pub mod schedule;

use serde::{Deserialize, Serialize};

pub use cache::{ScreenerCache, ScreenerPage, ScreenerQuery, ScreenerRow, ScreenerStore};
pub use engine::{RunSummary, ScreenerEngine};

/// One instrument in the screener universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedInstrument {
    pub symbol: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_exchange() -> String {
    "NSE".to_string()
}

impl TrackedInstrument {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.symbol)
    }
}

/// Universe used when the config file does not list one.
pub fn default_universe() -> Vec<TrackedInstrument> {
    [
        ("RELIANCE", "Reliance Industries"),
        ("TCS", "Tata Consultancy Services"),
        ("HDFCBANK", "HDFC Bank"),
        ("INFY", "Infosys"),
        ("ICICIBANK", "ICICI Bank"),
        ("HINDUNILVR", "Hindustan Unilever"),
        ("ITC", "ITC"),
        ("SBIN", "State Bank of India"),
        ("BHARTIARTL", "Bharti Airtel"),
        ("KOTAKBANK", "Kotak Mahindra Bank"),
        ("LT", "Larsen & Toubro"),
        ("AXISBANK", "Axis Bank"),
    ]
    .iter()
    .map(|(symbol, name)| TrackedInstrument {
        symbol: symbol.to_string(),
        exchange: default_exchange(),
        name: Some(name.to_string()),
    })
    .collect()
}
