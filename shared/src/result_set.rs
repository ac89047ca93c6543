//! Ordered, schema-checked collection of measured networks.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::mdif::{self, MdifError};
use crate::network::{Frequency, Network, ANGLE_TOLERANCE};

/// Error during result set construction, lookup or persistence
#[derive(Error, Debug)]
pub enum ResultSetError {
    /// Network parameter keys differ from the set's schema
    #[error("schema mismatch: expected keys {expected:?}, found {found:?}")]
    SchemaMismatch {
        expected: BTreeSet<String>,
        found: BTreeSet<String>,
    },

    /// Network frequency grid differs from the set's grid
    #[error("frequency grid mismatch: set has {expected} points, network has {found}")]
    FrequencyMismatch { expected: usize, found: usize },

    /// A query constraint matched nothing
    #[error("no network with {0}")]
    NotFound(String),

    /// Operation needs at least one network
    #[error("result set is empty")]
    Empty,

    /// IO error while saving or loading
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed result file
    #[error("format error: {0}")]
    Format(#[from] MdifError),
}

pub type ResultSetResult<T> = Result<T, ResultSetError>;

/// Optional constraints for [`ResultSet::get`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub phi: Option<f64>,
    pub theta: Option<f64>,
    pub polarization: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phi(mut self, phi: f64) -> Self {
        self.phi = Some(phi);
        self
    }

    pub fn theta(mut self, theta: f64) -> Self {
        self.theta = Some(theta);
        self
    }

    pub fn polarization(mut self, label: impl Into<String>) -> Self {
        self.polarization = Some(label.into());
        self
    }

    fn matches(&self, network: &Network) -> bool {
        angle_matches(self.phi, network.phi())
            && angle_matches(self.theta, network.theta())
            && self
                .polarization
                .as_deref()
                .map_or(true, |p| network.polarization() == Some(p))
    }
}

fn angle_matches(wanted: Option<f64>, actual: Option<f64>) -> bool {
    match (wanted, actual) {
        (None, _) => true,
        (Some(w), Some(a)) => (w - a).abs() <= ANGLE_TOLERANCE,
        (Some(_), None) => false,
    }
}

/// Outcome of [`ResultSet::get`]: a lone match or a sub-set.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    One(Network),
    Many(ResultSet),
}

impl Selection {
    /// Flatten into a result set regardless of match count.
    pub fn into_set(self) -> ResultSet {
        match self {
            Selection::One(network) => ResultSet {
                networks: vec![network],
            },
            Selection::Many(set) => set,
        }
    }

    /// The single network, if the selection has exactly one.
    pub fn single(self) -> Option<Network> {
        match self {
            Selection::One(network) => Some(network),
            Selection::Many(_) => None,
        }
    }
}

/// Networks sharing one parameter-key schema and one frequency grid, in
/// insertion order. Duplicate parameter tuples are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    networks: Vec<Network>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from networks, checking each against the first.
    pub fn from_networks(networks: impl IntoIterator<Item = Network>) -> ResultSetResult<Self> {
        let mut set = Self::new();
        for network in networks {
            set.append(network)?;
        }
        Ok(set)
    }

    /// Add a network. The set is left untouched on error.
    pub fn append(&mut self, network: Network) -> ResultSetResult<()> {
        if let Some(first) = self.networks.first() {
            let expected = first.param_keys();
            let found = network.param_keys();
            if expected != found {
                return Err(ResultSetError::SchemaMismatch { expected, found });
            }
            if !first.frequency().same_grid(network.frequency()) {
                return Err(ResultSetError::FrequencyMismatch {
                    expected: first.frequency().len(),
                    found: network.frequency().len(),
                });
            }
        }
        self.networks.push(network);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Network> {
        self.networks.iter()
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Parameter keys shared by every network (empty for an empty set).
    pub fn schema(&self) -> BTreeSet<String> {
        self.networks
            .first()
            .map(Network::param_keys)
            .unwrap_or_default()
    }

    /// Shared frequency grid, or `None` for an empty set.
    pub fn frequency(&self) -> Option<&Frequency> {
        self.networks.first().map(Network::frequency)
    }

    /// Select networks matching every supplied constraint.
    ///
    /// Each constraint must match at least one network on its own,
    /// otherwise the call fails with [`ResultSetError::NotFound`]. An empty
    /// query returns the whole set.
    pub fn get(&self, query: &Query) -> ResultSetResult<Selection> {
        if let Some(phi) = query.phi {
            if !self.iter().any(|n| angle_matches(Some(phi), n.phi())) {
                return Err(ResultSetError::NotFound(format!("phi = {phi}")));
            }
        }
        if let Some(theta) = query.theta {
            if !self.iter().any(|n| angle_matches(Some(theta), n.theta())) {
                return Err(ResultSetError::NotFound(format!("theta = {theta}")));
            }
        }
        if let Some(label) = query.polarization.as_deref() {
            if !self.iter().any(|n| n.polarization() == Some(label)) {
                return Err(ResultSetError::NotFound(format!("polarization = {label}")));
            }
        }

        let mut matched: Vec<Network> = self
            .iter()
            .filter(|n| query.matches(n))
            .cloned()
            .collect();

        if matched.len() == 1 {
            if let Some(network) = matched.pop() {
                return Ok(Selection::One(network));
            }
        }
        Ok(Selection::Many(ResultSet { networks: matched }))
    }

    /// All networks at one theta, always as a set.
    pub fn cut(&self, theta: f64) -> ResultSetResult<ResultSet> {
        Ok(self.get(&Query::new().theta(theta))?.into_set())
    }

    /// Sorted unique phi values.
    pub fn azimuths(&self) -> Vec<f64> {
        sorted_unique(self.iter().filter_map(Network::phi))
    }

    /// Sorted unique theta values.
    pub fn elevations(&self) -> Vec<f64> {
        sorted_unique(self.iter().filter_map(Network::theta))
    }

    /// Unique polarization labels in first-seen order.
    pub fn polarizations(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for label in self.iter().filter_map(Network::polarization) {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
        labels
    }

    /// Write every network to an MDIF file. Names are not stored.
    pub fn save(&self, path: &Path) -> ResultSetResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!("Saved {} networks to {}", self.len(), path.display());
        Ok(())
    }

    /// Write as MDIF to any writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> ResultSetResult<()> {
        mdif::write_networks(writer, &self.networks)?;
        Ok(())
    }

    /// Read a file written by [`ResultSet::save`].
    pub fn load(path: &Path) -> ResultSetResult<Self> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        let set = Self::parse(&text)?;
        debug!("Loaded {} networks from {}", set.len(), path.display());
        Ok(set)
    }

    /// Parse MDIF text into a validated set.
    pub fn parse(text: &str) -> ResultSetResult<Self> {
        Self::from_networks(mdif::parse_networks(text)?)
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Network;
    type IntoIter = std::slice::Iter<'a, Network>;

    fn into_iter(self) -> Self::IntoIter {
        self.networks.iter()
    }
}

fn sorted_unique(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup_by(|a, b| (*a - *b).abs() <= ANGLE_TOLERANCE);
    values
}
