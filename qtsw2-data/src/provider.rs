use crate::{
    TimeWindow,
    bar::{Bar, BarSource},
    error::DataError,
};
use chrono::{DateTime, Utc};
use qtsw2_instrument::InstrumentName;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{future::Future, path::PathBuf};

/// Historical bar fetch boundary used for pre-slot window hydration.
///
/// Implementations: broker bulk request (external), [`CsvBarProvider`] (offline files).
pub trait BarProvider {
    fn fetch(
        &self,
        instrument: &InstrumentName,
        window: TimeWindow,
    ) -> impl Future<Output = Result<Vec<Bar>, DataError>> + Send;
}

/// A provider with no bars, for sessions hydrated purely from the live feed.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoBarProvider;

impl BarProvider for NoBarProvider {
    async fn fetch(
        &self,
        _: &InstrumentName,
        _: TimeWindow,
    ) -> Result<Vec<Bar>, DataError> {
        Ok(Vec::new())
    }
}

/// One row of an offline bar file.
#[derive(Debug, Deserialize)]
struct CsvBarRecord {
    open_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Option<Decimal>,
}

/// Offline bar source reading `{instrument}.csv` files from a directory.
///
/// Expected header: `open_time,open,high,low,close,volume` with RFC 3339 UTC stamps.
#[derive(Debug, Clone)]
pub struct CsvBarProvider {
    dir: PathBuf,
}

impl CsvBarProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read(&self, instrument: &InstrumentName, window: TimeWindow) -> Result<Vec<Bar>, DataError> {
        let path = self.dir.join(format!("{}.csv", instrument.as_str()));
        let csv_error = |detail: String| DataError::Csv {
            path: path.display().to_string(),
            detail,
        };

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|error| csv_error(error.to_string()))?;

        let mut bars = Vec::new();
        for record in reader.deserialize::<CsvBarRecord>() {
            let record = record.map_err(|error| csv_error(error.to_string()))?;
            if !window.contains(record.open_time) {
                continue;
            }
            bars.push(Bar::new(
                instrument.clone(),
                record.open_time,
                record.open,
                record.high,
                record.low,
                record.close,
                record.volume,
                BarSource::Csv,
            ));
        }

        Ok(bars)
    }
}

impl BarProvider for CsvBarProvider {
    async fn fetch(
        &self,
        instrument: &InstrumentName,
        window: TimeWindow,
    ) -> Result<Vec<Bar>, DataError> {
        self.read(instrument, window)
    }
}
