// =============================================================================
// Screener cache — immutable row sets swapped whole
// =============================================================================
//
// A run builds a complete `ScreenerCache` off to the side and `ScreenerStore`
// replaces the `Arc` in one write. Readers clone the `Arc` and iterate their
// own copy, so nothing ever sees half of one run and half of another.
// =============================================================================

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SparkPoint {
    pub time: String,
    pub close: f64,
}

/// One instrument's end-of-day snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenerRow {
    pub symbol: String,
    pub company_name: String,
    pub exchange_code: String,
    pub stock_code: String,
    pub trade_date: NaiveDate,
    pub close_price: f64,
    pub prev_close_price: Option<f64>,
    pub change_abs: Option<f64>,
    pub change_pct: Option<f64>,
    pub volume: Option<f64>,
    pub week_avg_volume: Option<f64>,
    pub week_volume_diff_pct: Option<f64>,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub sparkline: Vec<SparkPoint>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScreenerCache {
    pub snapshot_date: Option<NaiveDate>,
    pub built_at: Option<DateTime<Utc>>,
    pub rows: Vec<ScreenerRow>,
    pub failures: usize,
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    ChangePct,
    Price,
    Volume,
    Rsi14,
    VolumeDiffPct,
    Symbol,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

fn default_limit() -> usize {
    100
}

/// Flat query parameters for `/screener`. `exchange_codes` is comma separated.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenerQuery {
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_volume: Option<f64>,
    #[serde(default)]
    pub min_change_pct: Option<f64>,
    #[serde(default)]
    pub max_change_pct: Option<f64>,
    #[serde(default)]
    pub exchange_codes: Option<String>,
    #[serde(default)]
    pub sort: SortField,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for ScreenerQuery {
    fn default() -> Self {
        Self {
            min_price: None,
            max_price: None,
            min_volume: None,
            min_change_pct: None,
            max_change_pct: None,
            exchange_codes: None,
            sort: SortField::default(),
            order: SortOrder::default(),
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl ScreenerQuery {
    pub fn validate(&self) -> HubResult<()> {
        if !(1..=1000).contains(&self.limit) {
            return Err(HubError::InvalidRequest(format!(
                "limit must be between 1 and 1000, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    fn exchanges(&self) -> Vec<String> {
        self.exchange_codes
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn accepts(&self, row: &ScreenerRow, exchanges: &[String]) -> bool {
        let above = |v: Option<f64>, min: Option<f64>| min.map_or(true, |m| v.is_some_and(|v| v >= m));
        let below = |v: Option<f64>, max: Option<f64>| max.map_or(true, |m| v.is_some_and(|v| v <= m));

        above(Some(row.close_price), self.min_price)
            && below(Some(row.close_price), self.max_price)
            && above(row.volume, self.min_volume)
            && above(row.change_pct, self.min_change_pct)
            && below(row.change_pct, self.max_change_pct)
            && (exchanges.is_empty() || exchanges.contains(&row.exchange_code))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreenerPage {
    pub total: usize,
    pub items: Vec<ScreenerRow>,
    pub limit: usize,
    pub offset: usize,
}

fn sort_value(row: &ScreenerRow, field: SortField) -> Option<f64> {
    match field {
        SortField::ChangePct => row.change_pct,
        SortField::Price => Some(row.close_price),
        SortField::Volume => row.volume,
        SortField::Rsi14 => row.rsi_14,
        SortField::VolumeDiffPct => row.week_volume_diff_pct,
        SortField::Symbol => None,
    }
}

impl ScreenerCache {
    /// Filter, sort and paginate. Rows missing the sort value go last in
    /// either direction.
    pub fn query(&self, q: &ScreenerQuery) -> ScreenerPage {
        let exchanges = q.exchanges();
        let mut rows: Vec<&ScreenerRow> = self.rows.iter().filter(|r| q.accepts(r, &exchanges)).collect();

        rows.sort_by(|a, b| {
            if q.sort == SortField::Symbol {
                let ord = a.symbol.cmp(&b.symbol);
                return if q.order == SortOrder::Desc { ord.reverse() } else { ord };
            }
            match (sort_value(a, q.sort), sort_value(b, q.sort)) {
                (Some(x), Some(y)) => {
                    let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
                    if q.order == SortOrder::Desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });

        let total = rows.len();
        let items = rows.into_iter().skip(q.offset).take(q.limit).cloned().collect();
        ScreenerPage {
            total,
            items,
            limit: q.limit,
            offset: q.offset,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScreenerStore {
    current: RwLock<Arc<ScreenerCache>>,
}

impl ScreenerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache as of this call; later swaps do not affect it.
    pub fn load(&self) -> Arc<ScreenerCache> {
        self.current.read().clone()
    }

    /// Replace the cache. Returns the one it displaced.
    pub fn swap(&self, next: Arc<ScreenerCache>) -> Arc<ScreenerCache> {
        std::mem::replace(&mut *self.current.write(), next)
    }
}
