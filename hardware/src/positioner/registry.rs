//! Positioner models by manufacturer and model name.
//!
//! Each driver module exposes `initialize(&mut PositionerRegistry)`, which
//! registers a constructor for every model it supports.

use std::collections::BTreeMap;
use std::time::Duration;

use shared::settings::SettingsStore;
use thiserror::Error;
use tracing::{debug, info};

use super::{simulated, turntable, Positioner, PositionerError, PositionerResult, TurntableConfig};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown positioner model {manufacturer}/{model}")]
    UnknownModel { manufacturer: String, model: String },

    #[error(transparent)]
    Positioner(#[from] PositionerError),
}

/// Options passed through to positioner constructors.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Store used to persist the last known pose
    pub settings: SettingsStore,
    /// Overrides the stock turntable constants
    pub turntable_config: Option<TurntableConfig>,
    /// Duration of each simulated move
    pub simulated_move_duration: Duration,
}

impl ConnectOptions {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            turntable_config: None,
            simulated_move_duration: Duration::ZERO,
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new(SettingsStore::in_memory())
    }
}

/// Constructor taking a device address and options.
pub type PositionerCtor =
    Box<dyn Fn(&str, &ConnectOptions) -> PositionerResult<Box<dyn Positioner>> + Send + Sync>;

/// `manufacturer -> model -> constructor`
#[derive(Default)]
pub struct PositionerRegistry {
    models: BTreeMap<String, BTreeMap<String, PositionerCtor>>,
}

impl PositionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver in this crate registered.
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        turntable::initialize(&mut registry);
        simulated::initialize(&mut registry);
        registry
    }

    /// Add or replace a model constructor.
    pub fn register(&mut self, manufacturer: &str, model: &str, ctor: PositionerCtor) {
        debug!("Registering positioner {manufacturer}/{model}");
        self.models
            .entry(manufacturer.to_string())
            .or_default()
            .insert(model.to_string(), ctor);
    }

    /// Remove a model. Unknown names are ignored.
    pub fn unregister(&mut self, manufacturer: &str, model: &str) {
        if let Some(models) = self.models.get_mut(manufacturer) {
            models.remove(model);
            if models.is_empty() {
                self.models.remove(manufacturer);
            }
        }
    }

    /// Registered model names grouped by manufacturer.
    pub fn available_models(&self) -> BTreeMap<String, Vec<String>> {
        self.models
            .iter()
            .map(|(manufacturer, models)| (manufacturer.clone(), models.keys().cloned().collect()))
            .collect()
    }

    pub fn contains(&self, manufacturer: &str, model: &str) -> bool {
        self.models
            .get(manufacturer)
            .is_some_and(|models| models.contains_key(model))
    }

    /// Construct a positioner for `address`.
    pub fn connect(
        &self,
        manufacturer: &str,
        model: &str,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Positioner>, RegistryError> {
        let ctor = self
            .models
            .get(manufacturer)
            .and_then(|models| models.get(model))
            .ok_or_else(|| RegistryError::UnknownModel {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
            })?;
        info!("Connecting {manufacturer}/{model} at '{address}'");
        Ok(ctor(address, options)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioner::{SimulatedPositioner, TurntableConfig};

    fn sim_ctor(phi: f64) -> PositionerCtor {
        Box::new(move |_: &str, options: &ConnectOptions| -> PositionerResult<Box<dyn Positioner>> {
            let mut p = SimulatedPositioner::new(options.settings.clone());
            p.move_phi_absolute(phi)?;
            Ok(Box::new(p))
        })
    }

    #[test]
    fn test_builtins_registered() {
        let registry = PositionerRegistry::with_builtin_plugins();
        let stock = TurntableConfig::default();
        assert!(registry.contains(&stock.manufacturer, &stock.model));
        assert!(registry.contains(simulated::SIMULATED_MANUFACTURER, simulated::SIMULATED_MODEL));
    }

    #[test]
    fn test_register_overwrites() {
        let mut registry = PositionerRegistry::new();
        registry.register("Acme", "T1", sim_ctor(1.0));
        registry.register("Acme", "T1", sim_ctor(2.0));

        let p = registry
            .connect("Acme", "T1", "", &ConnectOptions::default())
            .unwrap();
        assert_eq!(p.phi(), 2.0);
        assert_eq!(registry.available_models()["Acme"], vec!["T1".to_string()]);
    }

    #[test]
    fn test_unregister_and_unknown() {
        let mut registry = PositionerRegistry::new();
        registry.register("Acme", "T1", sim_ctor(0.0));
        registry.unregister("Acme", "T1");
        registry.unregister("Acme", "missing");
        assert!(registry.available_models().is_empty());

        let err = registry
            .connect("Acme", "T1", "", &ConnectOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownModel { .. }));
    }

    #[test]
    fn test_connect_simulated() {
        let registry = PositionerRegistry::with_builtin_plugins();
        let mut p = registry
            .connect(
                simulated::SIMULATED_MANUFACTURER,
                simulated::SIMULATED_MODEL,
                "sim",
                &ConnectOptions::default(),
            )
            .unwrap();
        p.move_theta_absolute(15.0).unwrap();
        assert_eq!(p.theta(), 15.0);
    }

    #[test]
    fn test_turntable_on_missing_port_is_connection_error() {
        let registry = PositionerRegistry::with_builtin_plugins();
        let stock = TurntableConfig::default();
        let err = registry
            .connect(
                &stock.manufacturer,
                &stock.model,
                "/dev/does-not-exist-farfield",
                &ConnectOptions::default(),
            )
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RegistryError::Positioner(PositionerError::Connection(_))
        ));
    }
}
