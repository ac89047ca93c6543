//! Vector network analyzer interface.
//!
//! The measurement engine only needs one S-parameter trace at a time over
//! the instrument's current sweep. Instrument setup (sweep range, IF
//! bandwidth, averaging) is left to the instrument's own front panel or
//! driver.

mod simulated;

pub use simulated::SimulatedAnalyzer;

use shared::network::Network;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// Instrument did not answer or returned unusable data
    #[error("analyzer communication error: {0}")]
    Communication(String),

    #[error("S{a}{b} is not available on a {nports}-port analyzer")]
    UnsupportedPortPair { a: usize, b: usize, nports: usize },
}

pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

/// Network analyzer that can read one S-parameter trace at a time.
pub trait Analyzer: Send {
    /// Read S<sub>ab</sub> over the current sweep. Blocks until the sweep
    /// completes.
    fn read_sparam(&mut self, a: usize, b: usize) -> AnalyzerResult<Network>;

    /// Port pairs this instrument can measure.
    fn available_params(&self) -> Vec<(usize, usize)>;

    fn nports(&self) -> usize;
}

impl<A: Analyzer + ?Sized> Analyzer for Box<A> {
    fn read_sparam(&mut self, a: usize, b: usize) -> AnalyzerResult<Network> {
        (**self).read_sparam(a, b)
    }

    fn available_params(&self) -> Vec<(usize, usize)> {
        (**self).available_params()
    }

    fn nports(&self) -> usize {
        (**self).nports()
    }
}

/// Every (a, b) pair for an `nports`-port instrument, ports numbered from 1.
pub fn all_port_pairs(nports: usize) -> Vec<(usize, usize)> {
    (1..=nports)
        .flat_map(|a| (1..=nports).map(move |b| (a, b)))
        .collect()
}
