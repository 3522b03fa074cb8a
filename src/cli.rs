//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_mapped_store::MemoryMappedDocumentStore;
use crate::domain::aggregator::{Aggregator, STOCKS_ROOT_ID, equity_for_symbol, stocks_root};
use crate::domain::calendar::DayKey;
use crate::domain::config::{StoreConfig, calendar_from_config};
use crate::domain::document::{Document, DocumentId};
use crate::domain::error::StoreError;
use crate::domain::sample::{AggregateSample, columns, parse_batch};
use crate::domain::views::{Equity, Metric, OHLC, Stocks, Year};
use crate::ports::document_store::DocumentStore;

#[derive(Parser, Debug)]
#[command(name = "tickstore", about = "Embedded store for market time-series")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Merge aggregate samples into a symbol's OHLC series
    Ingest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        symbol: String,
        /// JSON lines, JSON array or feed response; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Print one day of a symbol's OHLC rows as CSV
    Show {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        symbol: String,
        #[arg(long)]
        year: i32,
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=366))]
        day: u32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Summarize the store's contents
    Info {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn execute(command: Command) -> Result<(), StoreError> {
    match command {
        Command::Ingest {
            config,
            symbol,
            input,
        } => run_ingest(&config, &symbol, input.as_deref()),
        Command::Show {
            config,
            symbol,
            year,
            day,
            output,
        } => run_show(
            &config,
            &symbol,
            DayKey {
                year,
                day_of_year: day,
            },
            output.as_deref(),
        ),
        Command::Info { config } => run_info(&config),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, StoreError> {
    eprintln!("Loading config from {}", path.display());
    FileConfigAdapter::from_file(path)
}

fn open_store(config: &FileConfigAdapter) -> Result<MemoryMappedDocumentStore, StoreError> {
    let store_config = StoreConfig::from_config(config)?;
    MemoryMappedDocumentStore::open(store_config)
}

fn read_input(input: Option<&Path>) -> Result<String, StoreError> {
    match input {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn run_ingest(config_path: &Path, symbol: &str, input: Option<&Path>) -> Result<(), StoreError> {
    let config = load_config(config_path)?;
    let aggregator = Aggregator::new(calendar_from_config(&config)?);

    let samples = parse_batch(&read_input(input)?)?;
    if samples.is_empty() {
        eprintln!("No samples to ingest");
        return Ok(());
    }

    let store = open_store(&config)?;
    let mut stocks = stocks_root(&store)?;
    let mut equity = equity_for_symbol(&store, &mut stocks, symbol)?;
    let applied = aggregator.merge_all(&store, &mut equity, &samples)?;
    store.close()?;

    eprintln!(
        "Ingested {} samples for {} ({} documents written)",
        samples.len(),
        symbol,
        applied.len()
    );
    Ok(())
}

/// Stored root index, without creating it.
fn find_stocks(store: &dyn DocumentStore) -> Result<Option<Document>, StoreError> {
    match store.get(&DocumentId::from(STOCKS_ROOT_ID)) {
        Ok(doc) => Ok(Some(doc)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn find_equity(store: &dyn DocumentStore, symbol: &str) -> Result<Document, StoreError> {
    let equity_id = find_stocks(store)?
        .and_then(|stocks| Stocks::of(&stocks).equity_id(symbol))
        .ok_or_else(|| StoreError::NotFound {
            id: DocumentId::from(symbol),
        })?;
    store.get(&equity_id)
}

fn run_show(
    config_path: &Path,
    symbol: &str,
    key: DayKey,
    output: Option<&Path>,
) -> Result<(), StoreError> {
    let config = load_config(config_path)?;
    let aggregator = Aggregator::new(calendar_from_config(&config)?);
    let store = open_store(&config)?;
    let equity = find_equity(&store, symbol)?;
    let rows = aggregator.day_rows(&store, &equity, key)?;

    let sink: Box<dyn Write> = match output {
        Some(path) => Box::new(fs::File::create(path)?),
        None => Box::new(io::stdout().lock()),
    };
    write_csv(sink, &rows)?;
    eprintln!(
        "{} rows for {} on {}/{}",
        rows.len(),
        symbol,
        key.year_key(),
        key.day_key()
    );
    Ok(())
}

fn write_csv<W: Write>(sink: W, rows: &[AggregateSample]) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record(columns::NAMES).map_err(io::Error::from)?;
    for sample in rows {
        writer
            .write_record([
                sample.close.to_string(),
                sample.high.to_string(),
                sample.low.to_string(),
                sample.trade_count.to_string(),
                sample.open.to_string(),
                sample.timestamp_millis.to_string(),
                sample.volume.to_string(),
                sample.volume_weighted_price.to_string(),
            ])
            .map_err(io::Error::from)?;
    }
    writer.flush()?;
    Ok(())
}

fn run_info(config_path: &Path) -> Result<(), StoreError> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    println!("store: {}", store.path().display());
    println!("documents: {}", store.len());

    let Some(stocks) = find_stocks(&store)? else {
        println!("symbols: 0");
        return Ok(());
    };
    let stocks = Stocks::of(&stocks);
    let symbols = stocks.symbols();
    println!("symbols: {}", symbols.len());
    for symbol in &symbols {
        let Some(equity_id) = stocks.equity_id(symbol) else {
            continue;
        };
        let equity = store.get(&equity_id)?;
        let Some(metric_id) = Equity::of(&equity).metric_id(OHLC) else {
            println!("{symbol}: no data");
            continue;
        };
        let metric = store.get(&metric_id)?;
        let metric = Metric::of(&metric);
        for year_key in metric.year_keys() {
            let Some(year_id) = metric.year_id(&year_key) else {
                continue;
            };
            let year = Year::of(store.get(&year_id)?);
            let days = year.day_keys();
            let rows: usize = days
                .iter()
                .filter_map(|d| year.day(d))
                .map(|day| day.len())
                .sum();
            println!("{symbol} {year_key}: {} days, {rows} rows", days.len());
        }
    }
    Ok(())
}
