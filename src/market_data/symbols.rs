// =============================================================================
// Symbol table — client symbols ↔ broker (exchange, code) identifiers
// =============================================================================
//
// The broker addresses instruments by its own short codes (SENSEX is BSESEN,
// BANKNIFTY is CNXBAN) and names them inconsistently in the tick feed. The
// table holds the known instruments plus manual code overrides, and routes a
// tick back to a client symbol by trying the resolver strategies in order.
//
// Built-in instruments are permanent. Anything else is registered by a live
// stream subscription and reference-counted; the last release removes it.
// =============================================================================

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::tick::Tick;
use crate::types::UpstreamId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instrument {
    pub symbol: String,
    pub display_name: String,
    pub exchange: String,
    pub code: String,
}

/// Ways a tick can be matched to a registered instrument, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveStrategy {
    ExactName,
    NormalizedName,
    CodeMatch,
}

impl ResolveStrategy {
    pub const ORDER: [ResolveStrategy; 3] = [
        ResolveStrategy::ExactName,
        ResolveStrategy::NormalizedName,
        ResolveStrategy::CodeMatch,
    ];

    fn matches(self, tick: &Tick, inst: &Instrument) -> bool {
        match self {
            ResolveStrategy::ExactName => tick.name.as_deref().is_some_and(|name| {
                let name = name.trim();
                name.eq_ignore_ascii_case(&inst.display_name) || name.eq_ignore_ascii_case(&inst.symbol)
            }),
            ResolveStrategy::NormalizedName => tick.name.as_deref().is_some_and(|name| {
                let name = normalize_name(name);
                !name.is_empty()
                    && (name == normalize_name(&inst.display_name) || name == normalize_name(&inst.symbol))
            }),
            ResolveStrategy::CodeMatch => {
                let exchange_ok = tick.exchange.as_deref().map_or(true, |ex| {
                    ex.to_ascii_uppercase().starts_with(&inst.exchange.to_ascii_uppercase())
                });
                exchange_ok
                    && [tick.code.as_deref(), tick.name.as_deref()]
                        .into_iter()
                        .flatten()
                        .map(bare_code)
                        .any(|code| code.eq_ignore_ascii_case(&inst.code))
            }
        }
    }
}

/// Upper-case, drop listing suffixes (`LTD`, `LIMITED`, `-EQ`, `.NS`, `.BO`)
/// and strip everything that is not alphanumeric.
pub fn normalize_name(raw: &str) -> String {
    let mut s = raw.trim().to_ascii_uppercase();
    loop {
        let before = s.len();
        for suffix in [".NS", ".BO", "-EQ", " EQ", " LIMITED", " LTD.", " LTD"] {
            if let Some(stripped) = s.strip_suffix(suffix) {
                s = stripped.trim_end().to_string();
            }
        }
        if s.len() == before {
            break;
        }
    }
    s.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// `NSE:RELIANCE` / `4.1!NIFTY` → the part after the last separator.
fn bare_code(raw: &str) -> &str {
    raw.rsplit([':', '!']).next().unwrap_or(raw).trim()
}

pub struct SymbolTable {
    instruments: RwLock<Vec<Instrument>>,
    overrides: HashMap<String, String>,
    /// Holders per registered (non built-in) symbol.
    holders: Mutex<HashMap<String, usize>>,
}

impl SymbolTable {
    pub fn new(instruments: Vec<Instrument>, overrides: HashMap<String, String>) -> Self {
        Self {
            instruments: RwLock::new(instruments),
            overrides,
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// The tracked indices and the broker's codes for them.
    pub fn with_indices() -> Self {
        let indices = [
            ("NIFTY", "NIFTY 50", "NSE", "NIFTY"),
            ("BANKNIFTY", "NIFTY BANK", "NSE", "CNXBAN"),
            ("SENSEX", "S&P BSE SENSEX", "BSE", "BSESEN"),
            ("FINNIFTY", "NIFTY FINANCIAL SERVICES", "NSE", "NIFFIN"),
        ];
        let instruments = indices
            .iter()
            .map(|(symbol, display, exchange, code)| Instrument {
                symbol: symbol.to_string(),
                display_name: display.to_string(),
                exchange: exchange.to_string(),
                code: code.to_string(),
            })
            .collect();
        let overrides = indices
            .iter()
            .map(|(symbol, _, _, code)| (symbol.to_string(), code.to_string()))
            .collect();
        Self::new(instruments, overrides)
    }

    pub fn instrument(&self, symbol: &str) -> Option<Instrument> {
        let symbol = symbol.trim();
        self.instruments
            .read()
            .iter()
            .find(|i| i.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.instruments.read().clone()
    }

    pub fn display_name(&self, symbol: &str) -> String {
        self.instrument(symbol)
            .map(|i| i.display_name)
            .unwrap_or_else(|| symbol.to_string())
    }

    /// Broker identifier for a client symbol. Registered instruments resolve
    /// directly; anything else needs an exchange hint and goes through the
    /// override table. Lookup only: nothing is added to the table.
    pub fn resolve(&self, symbol: &str, exchange_hint: Option<&str>) -> Option<UpstreamId> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return None;
        }
        if let Some(inst) = self.instrument(&symbol) {
            return Some(UpstreamId {
                exchange: inst.exchange,
                code: inst.code,
            });
        }

        let exchange = exchange_hint
            .map(|e| e.trim().to_ascii_uppercase())
            .filter(|e| !e.is_empty())?;
        let code = self
            .overrides
            .get(&symbol)
            .cloned()
            .unwrap_or_else(|| symbol.clone());
        Some(UpstreamId { exchange, code })
    }

    /// Resolve `symbol` and take a hold on it so its ticks can be routed
    /// back. Every successful call must be paired with
    /// [`unregister`](Self::unregister).
    pub fn register(&self, symbol: &str, exchange_hint: Option<&str>) -> Option<UpstreamId> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let id = self.resolve(&symbol, exchange_hint)?;

        let mut holders = self.holders.lock();
        if let Some(count) = holders.get_mut(&symbol) {
            *count += 1;
            return Some(id);
        }
        if self.instrument(&symbol).is_some() {
            // Built-in; nothing to count.
            return Some(id);
        }
        holders.insert(symbol.clone(), 1);
        self.instruments.write().push(Instrument {
            symbol: symbol.clone(),
            display_name: symbol,
            exchange: id.exchange.clone(),
            code: id.code.clone(),
        });
        Some(id)
    }

    /// Drop one hold on `symbol`. Returns the identifier when this was the
    /// last hold and the instrument left the table.
    pub fn unregister(&self, symbol: &str) -> Option<UpstreamId> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let mut holders = self.holders.lock();
        let count = holders.get_mut(&symbol)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        holders.remove(&symbol);

        let mut instruments = self.instruments.write();
        let pos = instruments.iter().position(|i| i.symbol == symbol)?;
        let inst = instruments.remove(pos);
        Some(UpstreamId {
            exchange: inst.exchange,
            code: inst.code,
        })
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    /// Candidate identifiers for historical lookups, most likely first: the
    /// override code on the given exchange, the raw symbol, then the other
    /// cash exchange.
    pub fn candidates(&self, symbol: &str, exchange: &str) -> Vec<UpstreamId> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let exchange = exchange.trim().to_ascii_uppercase();
        let alternate = match exchange.as_str() {
            "NSE" => Some("BSE"),
            "BSE" => Some("NSE"),
            _ => None,
        };

        let mut out: Vec<UpstreamId> = Vec::new();
        let mut push = |exchange: &str, code: &str| {
            let id = UpstreamId {
                exchange: exchange.to_string(),
                code: code.to_string(),
            };
            if !out.contains(&id) {
                out.push(id);
            }
        };
        if let Some(code) = self.overrides.get(&symbol) {
            push(&exchange, code);
        }
        push(&exchange, &symbol);
        if let Some(alt) = alternate {
            push(alt, &symbol);
        }
        out
    }

    /// Route a tick to a registered symbol. The first strategy to match wins.
    pub fn match_tick(&self, tick: &Tick) -> Option<(String, ResolveStrategy)> {
        let instruments = self.instruments.read();
        ResolveStrategy::ORDER.iter().find_map(|strategy| {
            instruments
                .iter()
                .find(|inst| strategy.matches(tick, inst))
                .map(|inst| (inst.symbol.clone(), *strategy))
        })
    }
}
