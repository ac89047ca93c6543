//! Reference-antenna gain table loader.
//!
//! The table is a CSV file with a `frequency_ghz,gain_db` header. Rows may
//! appear in any order; they are sorted by frequency on load.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::network::{Frequency, Network};

#[derive(Error, Debug)]
pub enum GainFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("gain file holds no rows")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct GainRow {
    frequency_ghz: f64,
    gain_db: f64,
}

/// Load a gain table as a single-port network of linear magnitudes.
pub fn load_gain(path: &Path) -> Result<Network, GainFileError> {
    let file = std::fs::File::open(path)?;
    let network = read_gain(file)?;
    debug!("Loaded {} gain points from {}", network.len(), path.display());
    Ok(network)
}

/// Parse a gain table from any reader.
pub fn read_gain<R: Read>(reader: R) -> Result<Network, GainFileError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = rdr
        .deserialize::<GainRow>()
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Err(GainFileError::Empty);
    }
    rows.sort_by(|a, b| a.frequency_ghz.total_cmp(&b.frequency_ghz));

    let hz: Vec<f64> = rows.iter().map(|r| r.frequency_ghz * 1e9).collect();
    let linear: Vec<f64> = rows.iter().map(|r| 10f64.powf(r.gain_db / 20.0)).collect();

    Network::from_real(Frequency::from_hz(hz), &linear)
        .map(|n| n.with_name("reference gain"))
        .map_err(|_| GainFileError::Empty)
}
