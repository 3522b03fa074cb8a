//! Folding aggregate samples into an equity's time-series hierarchy.
//!
//! `Equity -> Metric("ohlc") -> Year -> Day`. Metric and Year are separate
//! documents referenced by id, so creating one obliges a put of its parent.
//! Days live inside their Year; the Year put at the end of every merge is
//! what makes a day's rows durable.

use crate::domain::calendar::{Calendar, DayKey};
use crate::domain::document::{Document, DocumentId, Fields};
use crate::domain::error::StoreError;
use crate::domain::sample::AggregateSample;
use crate::domain::views::{Day, DocumentView, Equity, Metric, OHLC, Stocks, Upsert, Year};
use crate::ports::document_store::{ChangeKind, DocumentStore, DocumentStoreExt, Transaction};

/// Id of the root [`Stocks`] document.
pub const STOCKS_ROOT_ID: &str = "stocks";

/// Documents one merge has to persist, children before parents.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    staged: Vec<Document>,
    root_dirty: bool,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, document: Document) {
        self.staged.push(document);
    }

    /// Also put the root document the merge started from.
    pub fn stage_root(&mut self) {
        self.root_dirty = true;
    }

    pub fn len(&self) -> usize {
        self.staged.len() + usize::from(self.root_dirty)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put every staged document, then the root when it was staged.
    pub fn commit(
        self,
        store: &dyn DocumentStore,
        root: &mut Document,
    ) -> Result<Vec<(DocumentId, ChangeKind)>, StoreError> {
        let mut applied = Vec::with_capacity(self.len());
        for mut doc in self.staged {
            let kind = store.put(&mut doc)?;
            applied.push((doc.id().clone(), kind));
        }
        if self.root_dirty {
            let kind = store.put(root)?;
            applied.push((root.id().clone(), kind));
        }
        Ok(applied)
    }
}

/// Which levels of the hierarchy a merge created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Created {
    pub metric: bool,
    pub year: bool,
    pub day: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub key: DayKey,
    pub upsert: Upsert,
    pub created: Created,
    /// Writes issued, in order.
    pub writes: Vec<(DocumentId, ChangeKind)>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    calendar: Calendar,
}

impl Aggregator {
    pub fn new(calendar: Calendar) -> Self {
        Aggregator { calendar }
    }

    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    /// Merge one sample into `equity`'s OHLC series.
    ///
    /// Resolves or creates the metric, year and day for the sample's
    /// timestamp, then inserts the sample's row at its sorted position or
    /// replaces the row with the same timestamp. The year is always put;
    /// the metric and equity only when a child was created under them.
    /// `equity` has its version updated when it is put.
    pub fn merge_aggregate_data(
        &self,
        store: &dyn DocumentStore,
        equity: &mut Document,
        sample: &AggregateSample,
    ) -> Result<MergeOutcome, StoreError> {
        let key = self.calendar.day_key(sample.timestamp_millis)?;
        let year_key = key.year_key();
        let mut created = Created::default();
        let mut work = UnitOfWork::new();

        let mut metric = match Equity::of(&*equity).metric_id(OHLC) {
            Some(id) => store.get(&id)?,
            None => {
                let metric = store.new_view::<Metric<Document>>().into_inner();
                Equity::of(&mut *equity).set_metric(OHLC, metric.id().clone());
                created.metric = true;
                work.stage_root();
                metric
            }
        };

        let mut year = match Metric::of(&metric).year_id(&year_key) {
            Some(id) => store.get(&id)?,
            None => {
                let year = store.new_view::<Year<Document>>().into_inner();
                Metric::of(&mut metric).set_year(&year_key, year.id().clone());
                created.year = true;
                year
            }
        };

        let upsert = {
            let mut year_view = Year::of(&mut year);
            let (mut day, day_created) = year_view.day_or_insert(&key.day_key());
            created.day = day_created;
            day.upsert(sample.to_row())
        };

        work.stage(year);
        if created.year {
            work.stage(metric);
        }
        let writes = work.commit(store, equity)?;

        log::debug!(
            "merged t={} into {}/{} day {} ({:?})",
            sample.timestamp_millis,
            OHLC,
            year_key,
            key.day_of_year,
            upsert
        );
        Ok(MergeOutcome {
            key,
            upsert,
            created,
            writes,
        })
    }

    /// Merge a batch inside one [`Transaction`], so each touched document is
    /// put once. `equity` is refreshed from the store afterwards when it was
    /// written.
    pub fn merge_all(
        &self,
        store: &dyn DocumentStore,
        equity: &mut Document,
        samples: &[AggregateSample],
    ) -> Result<Vec<(DocumentId, ChangeKind)>, StoreError> {
        let tx = Transaction::new(store);
        for sample in samples {
            self.merge_aggregate_data(&tx, equity, sample)?;
        }
        let applied = tx.commit()?;
        if applied.iter().any(|(id, _)| id == equity.id()) {
            *equity = store.get(equity.id())?;
        }
        Ok(applied)
    }

    /// Samples stored for `equity` under `key`, in timestamp order.
    pub fn day_rows(
        &self,
        store: &dyn DocumentStore,
        equity: &Document,
        key: DayKey,
    ) -> Result<Vec<AggregateSample>, StoreError> {
        let Some(metric_id) = Equity::of(equity).metric_id(OHLC) else {
            return Ok(Vec::new());
        };
        let metric = store.get(&metric_id)?;
        let Some(year_id) = Metric::of(&metric).year_id(&key.year_key()) else {
            return Ok(Vec::new());
        };
        let year = store.get(&year_id)?;
        let year = Year::of(&year);
        Ok(year
            .day(&key.day_key())
            .map(|day| rows_of(&day))
            .unwrap_or_default())
    }
}

fn rows_of(day: &Day<&Fields>) -> Vec<AggregateSample> {
    day.rows()
        .iter()
        .filter_map(|row| AggregateSample::from_row(row))
        .collect()
}

/// The root [`Stocks`] document, created and stored on first use.
pub fn stocks_root(store: &dyn DocumentStore) -> Result<Document, StoreError> {
    let id = DocumentId::from(STOCKS_ROOT_ID);
    match store.get(&id) {
        Ok(doc) => Ok(doc),
        Err(StoreError::NotFound { .. }) => {
            let mut stocks = store.new_view_with_id::<Stocks<Document>>(id).into_inner();
            store.put(&mut stocks)?;
            Ok(stocks)
        }
        Err(e) => Err(e),
    }
}

/// The equity registered under `symbol`, creating it (and putting `stocks`)
/// when absent.
pub fn equity_for_symbol(
    store: &dyn DocumentStore,
    stocks: &mut Document,
    symbol: &str,
) -> Result<Document, StoreError> {
    if let Some(id) = Stocks::of(&*stocks).equity_id(symbol) {
        return store.get(&id);
    }
    let mut equity = store.new_view::<Equity<Document>>();
    equity.set_symbol(symbol).set_active(true);
    let mut equity = equity.into_inner();
    store.put(&mut equity)?;
    Stocks::of(&mut *stocks).set_equity(symbol, equity.id().clone());
    store.put(stocks)?;
    log::info!("created equity {} for {}", equity.id(), symbol);
    Ok(equity)
}
