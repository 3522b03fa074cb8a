#![allow(dead_code)]

use std::path::Path;
use tickstore::adapters::memory_mapped_store::MemoryMappedDocumentStore;
use tickstore::domain::aggregator::{equity_for_symbol, stocks_root};
use tickstore::domain::config::StoreConfig;
use tickstore::domain::document::Document;
pub use tickstore::domain::sample::AggregateSample;

/// 2020-01-02T05:00:00Z
pub const T0: i64 = 1_577_941_200_000;
pub const DAY_MS: i64 = 86_400_000;

pub const SCENARIO_A: &str =
    r#"{"c":75.09,"h":75.15,"l":73.80,"n":1,"o":74.06,"t":1577941200000,"v":135647456,"vw":74.61}"#;

pub fn sample(t: i64, close: f64) -> AggregateSample {
    AggregateSample {
        close,
        high: close + 1.0,
        low: close - 1.0,
        trade_count: 2,
        open: close,
        timestamp_millis: t,
        volume: 500,
        volume_weighted_price: close,
    }
}

pub fn open_store(dir: &Path) -> MemoryMappedDocumentStore {
    MemoryMappedDocumentStore::open(StoreConfig::new(dir)).unwrap()
}

/// A store with a registered equity for `symbol`.
pub fn store_with_equity(dir: &Path, symbol: &str) -> (MemoryMappedDocumentStore, Document) {
    let store = open_store(dir);
    let mut stocks = stocks_root(&store).unwrap();
    let equity = equity_for_symbol(&store, &mut stocks, symbol).unwrap();
    (store, equity)
}

pub fn store_ini(store_dir: &Path) -> String {
    format!("[store]\npath = {}\nflush_retries = 0\n", store_dir.display())
}
