//! Typed projections over document fields.
//!
//! A view wraps anything that exposes [`Fields`]: an owned document, a
//! borrowed one, or an embedded field map. It holds no state of its own, so
//! several view types can project the same document.
//!
//! The market hierarchy is `Stocks -> Equity -> Metric -> Year -> Day`.
//! Stocks, Equity, Metric and Year are stored documents linked by id. Days are
//! embedded in their Year and only become durable when the Year is put.

use crate::domain::document::{DocumentId, Fields, Number, Row, Value};
use crate::domain::sample::columns;

/// A typed projection over a field holder `F`.
pub trait DocumentView<F: AsRef<Fields>>: Sized {
    /// Kind tag for documents instantiated through this view.
    fn kind() -> &'static str;

    /// Default fields for a fresh instance.
    fn populate(_fields: &mut Fields) {}

    fn project(inner: F) -> Self;

    fn inner(&self) -> &F;

    fn into_inner(self) -> F;
}

macro_rules! document_view {
    ($(#[$meta:meta])* $name:ident, $kind:literal, |$fields:ident| $populate:block) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name<F> {
            inner: F,
        }

        impl<F: AsRef<Fields>> DocumentView<F> for $name<F> {
            fn kind() -> &'static str {
                $kind
            }

            fn populate($fields: &mut Fields) $populate

            fn project(inner: F) -> Self {
                $name { inner }
            }

            fn inner(&self) -> &F {
                &self.inner
            }

            fn into_inner(self) -> F {
                self.inner
            }
        }

        impl<F: AsRef<Fields>> $name<F> {
            pub fn of(inner: F) -> Self {
                $name { inner }
            }

            fn fields(&self) -> &Fields {
                self.inner.as_ref()
            }
        }

        impl<F: AsRef<Fields> + AsMut<Fields>> $name<F> {
            pub fn inner_mut(&mut self) -> &mut F {
                &mut self.inner
            }

            fn fields_mut(&mut self) -> &mut Fields {
                self.inner.as_mut()
            }
        }
    };
}

pub const TICKERS: &str = "tickers";
pub const TECHNICALS: &str = "technicals";
pub const YEARS: &str = "years";
pub const DAYS: &str = "days";
pub const VALUES: &str = "values";

/// Name of the OHLC metric maintained by the aggregator.
pub const OHLC: &str = "ohlc";

fn ref_in(fields: &Fields, map: &str, key: &str) -> Option<DocumentId> {
    fields
        .get(map)
        .and_then(Value::as_embedded)
        .and_then(|m| m.get(key))
        .and_then(Value::as_ref_id)
        .cloned()
}

fn keys_in(fields: &Fields, map: &str) -> Vec<String> {
    fields
        .get(map)
        .and_then(Value::as_embedded)
        .map(|m| m.keys().map(str::to_string).collect())
        .unwrap_or_default()
}

fn text(fields: &Fields, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_string)
}

document_view!(
    /// Root index of all equities by ticker symbol.
    Stocks, "stocks", |fields| {
        fields.embedded_mut(TICKERS);
    }
);

impl<F: AsRef<Fields>> Stocks<F> {
    pub fn equity_id(&self, symbol: &str) -> Option<DocumentId> {
        ref_in(self.fields(), TICKERS, symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        keys_in(self.fields(), TICKERS)
    }
}

impl<F: AsRef<Fields> + AsMut<Fields>> Stocks<F> {
    pub fn set_equity(&mut self, symbol: &str, id: DocumentId) {
        self.fields_mut()
            .embedded_mut(TICKERS)
            .insert(symbol, Value::Ref(id));
    }
}

document_view!(
    /// One tradable instrument.
    Equity, "equity", |fields| {
        fields.embedded_mut(TECHNICALS);
    }
);

impl<F: AsRef<Fields>> Equity<F> {
    pub fn symbol(&self) -> Option<String> {
        text(self.fields(), "symbol")
    }

    pub fn name(&self) -> Option<String> {
        text(self.fields(), "name")
    }

    pub fn security_type(&self) -> Option<String> {
        text(self.fields(), "type")
    }

    pub fn exchange(&self) -> Option<String> {
        text(self.fields(), "exchange")
    }

    pub fn locale(&self) -> Option<String> {
        text(self.fields(), "locale")
    }

    pub fn active(&self) -> Option<bool> {
        self.fields().get("active").and_then(Value::as_bool)
    }

    pub fn metric_id(&self, name: &str) -> Option<DocumentId> {
        ref_in(self.fields(), TECHNICALS, name)
    }

    pub fn metric_names(&self) -> Vec<String> {
        keys_in(self.fields(), TECHNICALS)
    }
}

impl<F: AsRef<Fields> + AsMut<Fields>> Equity<F> {
    pub fn set_symbol(&mut self, value: &str) -> &mut Self {
        self.fields_mut().insert("symbol", Value::Text(value.into()));
        self
    }

    pub fn set_name(&mut self, value: &str) -> &mut Self {
        self.fields_mut().insert("name", Value::Text(value.into()));
        self
    }

    pub fn set_security_type(&mut self, value: &str) -> &mut Self {
        self.fields_mut().insert("type", Value::Text(value.into()));
        self
    }

    pub fn set_exchange(&mut self, value: &str) -> &mut Self {
        self.fields_mut().insert("exchange", Value::Text(value.into()));
        self
    }

    pub fn set_locale(&mut self, value: &str) -> &mut Self {
        self.fields_mut().insert("locale", Value::Text(value.into()));
        self
    }

    pub fn set_active(&mut self, value: bool) -> &mut Self {
        self.fields_mut().insert("active", Value::Bool(value));
        self
    }

    pub fn set_metric(&mut self, name: &str, id: DocumentId) {
        self.fields_mut()
            .embedded_mut(TECHNICALS)
            .insert(name, Value::Ref(id));
    }
}

document_view!(
    /// A named metric of an equity, split into years.
    Metric, "metric", |fields| {
        fields.embedded_mut(YEARS);
    }
);

impl<F: AsRef<Fields>> Metric<F> {
    pub fn year_id(&self, year_key: &str) -> Option<DocumentId> {
        ref_in(self.fields(), YEARS, year_key)
    }

    pub fn year_keys(&self) -> Vec<String> {
        keys_in(self.fields(), YEARS)
    }
}

impl<F: AsRef<Fields> + AsMut<Fields>> Metric<F> {
    pub fn set_year(&mut self, year_key: &str, id: DocumentId) {
        self.fields_mut()
            .embedded_mut(YEARS)
            .insert(year_key, Value::Ref(id));
    }
}

document_view!(
    /// One calendar year of a metric. Owns its days by value.
    Year, "year", |fields| {
        fields.embedded_mut(DAYS);
    }
);

impl<F: AsRef<Fields>> Year<F> {
    pub fn day(&self, day_key: &str) -> Option<Day<&Fields>> {
        self.fields()
            .get(DAYS)
            .and_then(Value::as_embedded)
            .and_then(|days| days.get(day_key))
            .and_then(Value::as_embedded)
            .map(Day::of)
    }

    pub fn day_keys(&self) -> Vec<String> {
        let mut keys = keys_in(self.fields(), DAYS);
        keys.sort_by_key(|k| k.parse::<u32>().unwrap_or(u32::MAX));
        keys
    }
}

impl<F: AsRef<Fields> + AsMut<Fields>> Year<F> {
    /// The day under `day_key`, creating it when absent. The flag is true
    /// when the day was created by this call.
    pub fn day_or_insert(&mut self, day_key: &str) -> (Day<&mut Fields>, bool) {
        let days = self.fields_mut().embedded_mut(DAYS);
        let created = !matches!(days.get(day_key), Some(Value::Embedded(_)));
        let day = days.embedded_mut(day_key);
        if created {
            Day::<&mut Fields>::populate(day);
        }
        (Day::of(day), created)
    }
}

document_view!(
    /// Intraday rows of one day, sorted by timestamp with no duplicates.
    Day, "day", |fields| {
        fields.rows_mut(VALUES);
    }
);

/// Outcome of [`Day::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted(usize),
    Replaced(usize),
}

fn row_timestamp(row: &[Number]) -> i64 {
    row.get(columns::TIMESTAMP)
        .map(Number::as_i64)
        .unwrap_or(i64::MIN)
}

impl<F: AsRef<Fields>> Day<F> {
    pub fn rows(&self) -> &[Row] {
        self.fields()
            .get(VALUES)
            .and_then(Value::as_rows)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// Binary search by timestamp: `Ok(index)` on an exact match, otherwise
    /// `Err(insertion_point)`.
    pub fn search(&self, timestamp_millis: i64) -> Result<usize, usize> {
        self.rows()
            .binary_search_by(|row| row_timestamp(row).cmp(&timestamp_millis))
    }

    pub fn find(&self, timestamp_millis: i64) -> Option<&Row> {
        self.search(timestamp_millis).ok().map(|i| &self.rows()[i])
    }

    /// Rows with `from <= timestamp < to`.
    pub fn range(&self, from: i64, to: i64) -> &[Row] {
        if from >= to {
            return &[];
        }
        let start = self.search(from).unwrap_or_else(|i| i);
        let end = self.search(to).unwrap_or_else(|i| i);
        &self.rows()[start..end]
    }
}

impl<F: AsRef<Fields> + AsMut<Fields>> Day<F> {
    /// Insert `row` at its sorted position, or replace the row that has the
    /// same timestamp.
    pub fn upsert(&mut self, row: Row) -> Upsert {
        let timestamp = row_timestamp(&row);
        let position = self.search(timestamp);
        let rows = self.fields_mut().rows_mut(VALUES);
        match position {
            Ok(i) => {
                rows[i] = row;
                Upsert::Replaced(i)
            }
            Err(i) => {
                rows.insert(i, row);
                Upsert::Inserted(i)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::document::{Document, StoreId};
    use crate::domain::sample::AggregateSample;

    fn sample(t: i64, close: f64) -> AggregateSample {
        AggregateSample {
            close,
            high: close,
            low: close,
            trade_count: 1,
            open: close,
            timestamp_millis: t,
            volume: 100,
            volume_weighted_price: close,
        }
    }

    fn timestamps<F: AsRef<Fields>>(day: &Day<F>) -> Vec<i64> {
        day.rows().iter().map(|r| r[columns::TIMESTAMP].as_i64()).collect()
    }

    #[test]
    fn upsert_keeps_rows_sorted() {
        let mut fields = Fields::new();
        let mut day = Day::of(&mut fields);
        assert_eq!(day.upsert(sample(300, 1.0).to_row()), Upsert::Inserted(0));
        assert_eq!(day.upsert(sample(100, 1.0).to_row()), Upsert::Inserted(0));
        assert_eq!(day.upsert(sample(200, 1.0).to_row()), Upsert::Inserted(1));
        assert_eq!(timestamps(&day), vec![100, 200, 300]);
    }

    #[test]
    fn upsert_replaces_on_equal_timestamp() {
        let mut fields = Fields::new();
        let mut day = Day::of(&mut fields);
        day.upsert(sample(100, 1.0).to_row());
        day.upsert(sample(200, 1.0).to_row());
        assert_eq!(day.upsert(sample(200, 9.5).to_row()), Upsert::Replaced(1));
        assert_eq!(day.len(), 2);
        let row = day.find(200).unwrap();
        assert_eq!(row[columns::CLOSE].as_f64(), 9.5);
    }

    #[test]
    fn range_is_half_open() {
        let mut fields = Fields::new();
        let mut day = Day::of(&mut fields);
        for t in [100, 200, 300, 400] {
            day.upsert(sample(t, 1.0).to_row());
        }
        let ts: Vec<i64> = day
            .range(200, 400)
            .iter()
            .map(|r| r[columns::TIMESTAMP].as_i64())
            .collect();
        assert_eq!(ts, vec![200, 300]);
        assert!(day.range(400, 200).is_empty());
        assert_eq!(day.range(0, 1_000).len(), 4);
    }

    #[test]
    fn empty_day_reads_as_empty() {
        let fields = Fields::new();
        let day = Day::of(&fields);
        assert!(day.is_empty());
        assert_eq!(day.search(5), Err(0));
        assert!(day.find(5).is_none());
    }

    #[test]
    fn year_day_or_insert_reports_creation() {
        let mut doc = Document::new(DocumentId::from("y"), StoreId::generate(), "year");
        let mut year = Year::of(&mut doc);
        {
            let (mut day, created) = year.day_or_insert("2");
            assert!(created);
            day.upsert(sample(1, 1.0).to_row());
        }
        let (day, created) = year.day_or_insert("2");
        assert!(!created);
        assert_eq!(day.len(), 1);
        assert_eq!(year.day_keys(), vec!["2".to_string()]);
    }

    #[test]
    fn day_keys_sort_numerically() {
        let mut fields = Fields::new();
        let mut year = Year::of(&mut fields);
        for key in ["10", "2", "366", "31"] {
            year.day_or_insert(key);
        }
        assert_eq!(year.day_keys(), vec!["2", "10", "31", "366"]);
    }

    #[test]
    fn views_share_one_document() {
        let mut doc = Document::new(DocumentId::from("e"), StoreId::generate(), "equity");
        Equity::of(&mut doc)
            .set_symbol("AAPL")
            .set_name("Apple Inc.")
            .set_active(true);
        Equity::of(&mut doc).set_metric(OHLC, DocumentId::from("m1"));

        let equity = Equity::of(&doc);
        assert_eq!(equity.symbol().as_deref(), Some("AAPL"));
        assert_eq!(equity.name().as_deref(), Some("Apple Inc."));
        assert_eq!(equity.active(), Some(true));
        assert_eq!(equity.metric_id(OHLC), Some(DocumentId::from("m1")));
        assert_eq!(equity.metric_names(), vec![OHLC.to_string()]);
        assert!(equity.metric_id("rsi").is_none());
    }

    #[test]
    fn populate_sets_defaults() {
        let mut fields = Fields::new();
        <Metric<Fields> as DocumentView<Fields>>::populate(&mut fields);
        assert!(fields.get(YEARS).and_then(Value::as_embedded).is_some());
        assert_eq!(<Metric<Fields> as DocumentView<Fields>>::kind(), "metric");
    }
}
