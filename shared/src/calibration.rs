//! Per-polarization loss-offset calibration.
//!
//! A calibration holds one correction network per polarization label.
//! Applying it divides every measured network of that polarization by the
//! correction, producing a new result set with `calibrated = true`.
//!
//! On disk a calibration is a block of free-form note lines, a line holding
//! only `@`, and then the networks in MDIF form. A note line that would read
//! as the sentinel, or that starts with `\`, is written with a leading `\`
//! which is removed again on load.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mdif;
use crate::network::{param, Frequency, Network, NetworkError, ParamValue};
use crate::result_set::{Query, ResultSet, ResultSetError};

/// Line separating notes from network data in a calibration file.
pub const NOTES_SENTINEL: &str = "@";

/// Prefix marking an escaped note line.
const NOTE_ESCAPE: char = '\\';

/// Error while building, applying or loading a calibration
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Results contain a polarization the calibration does not cover
    #[error("no calibration for polarization '{0}'")]
    MissingCalibration(String),

    /// Calibration file could not be read or held no networks
    #[error("invalid calibration file: {0}")]
    InvalidCalibrationFile(String),

    /// Correction could not be mapped onto the results grid
    #[error("interpolation failed for '{label}': {source}")]
    Interpolation {
        label: String,
        #[source]
        source: NetworkError,
    },

    #[error(transparent)]
    ResultSet(#[from] ResultSetError),
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;

/// Correction networks keyed by polarization label, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calibration {
    networks: Vec<(String, Network)>,
    notes: String,
}

impl Calibration {
    /// Build from networks named by their polarization label.
    ///
    /// A network's name is used as its label, falling back to its
    /// `polarization` parameter. Later networks replace earlier ones with
    /// the same label.
    pub fn new(networks: impl IntoIterator<Item = Network>, notes: impl Into<String>) -> Self {
        let mut cal = Self {
            networks: Vec::new(),
            notes: notes.into(),
        };
        for network in networks {
            let label = network
                .name()
                .or_else(|| network.polarization())
                .unwrap_or_default()
                .to_string();
            cal.insert(label, network);
        }
        cal
    }

    /// Insert or replace the correction for `label`.
    pub fn insert(&mut self, label: impl Into<String>, network: Network) {
        let label = label.into();
        let network = network.with_name(label.clone());
        match self.networks.iter_mut().find(|(l, _)| *l == label) {
            Some(slot) => slot.1 = network,
            None => self.networks.push((label, network)),
        }
    }

    /// Derive a calibration from a reference-antenna scan.
    ///
    /// For each polarization the boresight network (phi = 0, theta = 0) is
    /// used, or the first network of that polarization if the scan has no
    /// boresight point. It is divided by the known reference gain
    /// (interpolated onto the scan grid) to give the loss offset.
    pub fn from_reference(
        measured: &ResultSet,
        gain: &Network,
        notes: impl Into<String>,
    ) -> CalibrationResult<Self> {
        let grid = measured
            .frequency()
            .ok_or(CalibrationError::ResultSet(ResultSetError::Empty))?;

        let mut cal = Self {
            networks: Vec::new(),
            notes: notes.into(),
        };
        for label in measured.polarizations() {
            let boresight = measured
                .get(&Query::new().phi(0.0).theta(0.0).polarization(label.clone()))
                .ok()
                .and_then(|sel| sel.into_set().iter().next().cloned());
            let reference = match boresight {
                Some(n) => n,
                None => {
                    warn!("No boresight sample for '{label}', using first sample");
                    measured
                        .get(&Query::new().polarization(label.clone()))?
                        .into_set()
                        .iter()
                        .next()
                        .cloned()
                        .ok_or(ResultSetError::Empty)?
                }
            };

            let gain_on_grid = gain
                .interpolate(grid)
                .map_err(|source| CalibrationError::Interpolation {
                    label: label.clone(),
                    source,
                })?;
            let mut offset = reference
                .divide(&gain_on_grid)
                .map_err(|source| CalibrationError::Interpolation {
                    label: label.clone(),
                    source,
                })?;
            offset.set_params(Default::default());
            offset.set_param(param::POLARIZATION, label.as_str());
            debug!("Derived calibration for '{label}'");
            cal.insert(label, offset);
        }
        Ok(cal)
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
    }

    /// Correction for one polarization.
    pub fn get(&self, label: &str) -> Option<&Network> {
        self.networks
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, n)| n)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.networks.iter().map(|(l, _)| l.as_str())
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Divide every network in `results` by its polarization's correction.
    ///
    /// Fails before producing anything if any polarization in `results` has
    /// no correction. Output networks keep the input order and parameters,
    /// with `calibrated` set to true.
    pub fn apply_to(&self, results: &ResultSet) -> CalibrationResult<ResultSet> {
        self.transform(results, true)
    }

    /// Undo [`Calibration::apply_to`] by multiplying by the correction.
    pub fn revert(&self, calibrated: &ResultSet) -> CalibrationResult<ResultSet> {
        self.transform(calibrated, false)
    }

    fn transform(&self, results: &ResultSet, apply: bool) -> CalibrationResult<ResultSet> {
        let Some(grid) = results.frequency() else {
            return Ok(ResultSet::new());
        };

        let labels = results.polarizations();
        if let Some(label) = labels.iter().find(|l| self.get(l).is_none()) {
            return Err(CalibrationError::MissingCalibration(label.clone()));
        }

        // Only corrections the results use are mapped onto their grid.
        let mut corrections: Vec<(&str, Network)> = Vec::with_capacity(labels.len());
        for (label, network) in self.networks.iter().filter(|(l, _)| labels.contains(l)) {
            let on_grid = self.on_grid(label, network, grid)?;
            corrections.push((label.as_str(), on_grid));
        }

        let mut out = ResultSet::new();
        for network in results {
            let label = network.polarization().unwrap_or_default();
            let correction = corrections
                .iter()
                .find(|(l, _)| *l == label)
                .map(|(_, n)| n)
                .ok_or_else(|| CalibrationError::MissingCalibration(label.to_string()))?;

            let result = if apply {
                network.divide(correction)
            } else {
                network.multiply(correction)
            };
            let mut corrected = result.map_err(|source| CalibrationError::Interpolation {
                label: label.to_string(),
                source,
            })?;
            corrected.set_param(param::CALIBRATED, ParamValue::Bool(apply));
            out.append(corrected)?;
        }

        info!(
            "{} calibration to {} networks",
            if apply { "Applied" } else { "Reverted" },
            out.len()
        );
        Ok(out)
    }

    fn on_grid(&self, label: &str, network: &Network, grid: &Frequency) -> CalibrationResult<Network> {
        if network.frequency().same_grid(grid) {
            return Ok(network.clone());
        }
        debug!("Interpolating calibration '{label}' onto results grid");
        network
            .interpolate(grid)
            .map_err(|source| CalibrationError::Interpolation {
                label: label.to_string(),
                source,
            })
    }

    /// Write notes, the sentinel line, then the networks as MDIF.
    pub fn save(&self, path: &Path) -> CalibrationResult<()> {
        let file = File::create(path).map_err(ResultSetError::from)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush().map_err(ResultSetError::from)?;
        info!("Saved calibration ({} polarizations) to {}", self.len(), path.display());
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> CalibrationResult<()> {
        let io = |e: std::io::Error| CalibrationError::ResultSet(ResultSetError::Io(e));
        for line in self.notes.lines() {
            if line.trim() == NOTES_SENTINEL || line.starts_with(NOTE_ESCAPE) {
                writeln!(writer, "{NOTE_ESCAPE}{line}").map_err(io)?;
            } else {
                writeln!(writer, "{line}").map_err(io)?;
            }
        }
        writeln!(writer, "{NOTES_SENTINEL}").map_err(io)?;

        // Names are dropped by the codec, so each label travels as the
        // polarization parameter.
        let networks: Vec<Network> = self
            .networks
            .iter()
            .map(|(label, n)| {
                n.clone()
                    .with_param(param::POLARIZATION, label.as_str())
            })
            .collect();
        mdif::write_networks(writer, &networks).map_err(ResultSetError::from)?;
        Ok(())
    }

    /// Read a file written by [`Calibration::save`].
    pub fn load(path: &Path) -> CalibrationResult<Self> {
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .map_err(|e| {
                CalibrationError::InvalidCalibrationFile(format!("{}: {e}", path.display()))
            })?;
        Self::parse(&text)
    }

    /// Split notes from data at the sentinel line and parse the networks.
    ///
    /// Without a sentinel the whole text is treated as network data.
    pub fn parse(text: &str) -> CalibrationResult<Self> {
        let mut notes: Vec<&str> = Vec::new();
        let mut data_start = None;
        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            offset += line.len();
            if line.trim() == NOTES_SENTINEL {
                data_start = Some(offset);
                break;
            }
            let line = line.trim_end_matches(['\r', '\n']);
            notes.push(line.strip_prefix(NOTE_ESCAPE).unwrap_or(line));
        }

        let (notes, data) = match data_start {
            Some(start) => (notes.join("\n"), &text[start..]),
            None => (String::new(), text),
        };

        let networks = mdif::parse_networks(data)
            .map_err(|e| CalibrationError::InvalidCalibrationFile(e.to_string()))?;
        if networks.is_empty() {
            return Err(CalibrationError::InvalidCalibrationFile(
                "file holds no networks".to_string(),
            ));
        }

        let mut cal = Self::new(Vec::new(), notes);
        for network in networks {
            let label = network.polarization().unwrap_or_default().to_string();
            cal.insert(label, network);
        }
        Ok(cal)
    }
}
