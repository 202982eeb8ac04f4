//! Probe registry.
//!
//! The table is assembled once with a [`RegistryBuilder`] during startup and
//! is read-only afterwards; the orchestrator only ever borrows it.

use std::fmt;

use crate::config::ProbeConfig;
use crate::context::ScrapeContext;
use crate::error::{ProbeError, ProbeResult};
use crate::instance::Instance;
use crate::sink::Sink;

/// One unit of metric collection.
///
/// Implementations must route every database call through `ctx` so that
/// cancelling the scrape interrupts them.
pub trait Probe: Send + Sync {
    fn update(&self, ctx: &ScrapeContext, instance: &mut Instance, sink: &Sink) -> ProbeResult<()>;
}

/// Builds a probe from the shared configuration.
pub type ProbeConstructor = fn(&ProbeConfig) -> ProbeResult<Box<dyn Probe>>;

#[derive(Clone, Copy)]
pub struct ProbeDescriptor {
    /// Registry key and metric subsystem.
    pub name: &'static str,
    pub default_enabled: bool,
    pub constructor: ProbeConstructor,
}

impl fmt::Debug for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeDescriptor")
            .field("name", &self.name)
            .field("default_enabled", &self.default_enabled)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<ProbeDescriptor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a probe. Names must be unique.
    pub fn register(
        &mut self,
        name: &'static str,
        default_enabled: bool,
        constructor: ProbeConstructor,
    ) -> ProbeResult<&mut Self> {
        if self.descriptors.iter().any(|d| d.name == name) {
            return Err(ProbeError::Config(format!(
                "probe {:?} registered twice",
                name
            )));
        }
        self.descriptors.push(ProbeDescriptor {
            name,
            default_enabled,
            constructor,
        });
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            descriptors: self.descriptors,
        }
    }
}

/// Immutable table of registered probes, in registration order.
#[derive(Debug)]
pub struct Registry {
    descriptors: Vec<ProbeDescriptor>,
}

impl Registry {
    /// Registry holding every probe shipped with this crate.
    pub fn builtin() -> ProbeResult<Self> {
        let mut builder = RegistryBuilder::new();
        crate::probes::register_builtin(&mut builder)?;
        Ok(builder.build())
    }

    pub fn get(&self, name: &str) -> Option<&ProbeDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(|d| d.name).collect()
    }

    pub fn descriptors(&self) -> &[ProbeDescriptor] {
        &self.descriptors
    }

    /// Whether `name` runs under `config`, falling back to its default.
    pub fn is_enabled(&self, name: &str, config: &ProbeConfig) -> bool {
        match config.overrides.get(name) {
            Some(&enabled) => enabled,
            None => self.get(name).is_some_and(|d| d.default_enabled),
        }
    }

    /// Rejects overrides naming probes that were never registered.
    pub fn validate(&self, config: &ProbeConfig) -> ProbeResult<()> {
        for name in config.overrides.keys() {
            if self.get(name).is_none() {
                return Err(ProbeError::Config(format!(
                    "unknown collector {:?} (known: {})",
                    name,
                    self.names().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Constructs every enabled probe, in registration order.
    pub fn instantiate(
        &self,
        config: &ProbeConfig,
    ) -> ProbeResult<Vec<(&'static str, Box<dyn Probe>)>> {
        self.validate(config)?;
        let mut probes = Vec::new();
        for descriptor in &self.descriptors {
            if !self.is_enabled(descriptor.name, config) {
                continue;
            }
            let probe = (descriptor.constructor)(config).map_err(|e| {
                ProbeError::Config(format!("collector {}: {}", descriptor.name, e))
            })?;
            probes.push((descriptor.name, probe));
        }
        Ok(probes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Probe for Nop {
        fn update(&self, _: &ScrapeContext, _: &mut Instance, _: &Sink) -> ProbeResult<()> {
            Ok(())
        }
    }

    fn nop(_: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
        Ok(Box::new(Nop))
    }

    fn broken(_: &ProbeConfig) -> ProbeResult<Box<dyn Probe>> {
        Err(ProbeError::Config("bad value".to_string()))
    }

    fn registry() -> Registry {
        let mut builder = RegistryBuilder::new();
        builder
            .register("on", true, nop)
            .unwrap()
            .register("off", false, nop)
            .unwrap();
        builder.build()
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut builder = RegistryBuilder::new();
        builder.register("a", true, nop).unwrap();
        assert!(matches!(
            builder.register("a", false, nop),
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn defaults_and_overrides() {
        let registry = registry();
        let mut config = ProbeConfig::default();
        assert!(registry.is_enabled("on", &config));
        assert!(!registry.is_enabled("off", &config));

        config.set_enabled("on", false);
        config.set_enabled("off", true);
        let names: Vec<_> = registry
            .instantiate(&config)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["off"]);
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut config = ProbeConfig::default();
        config.set_enabled("nope", true);
        assert!(matches!(
            registry().instantiate(&config),
            Err(ProbeError::Config(_))
        ));
    }

    #[test]
    fn constructor_failure_names_probe() {
        let mut builder = RegistryBuilder::new();
        builder.register("broken", true, broken).unwrap();
        let err = match builder.build().instantiate(&ProbeConfig::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected constructor failure"),
        };
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn builtin_contains_all_probes() {
        let registry = Registry::builtin().unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "extension",
                "unexpected_superusers",
                "long_running_transactions",
                "synchronized_standby_slots",
                "postgres_binaries",
            ]
        );
        assert!(!registry.get("long_running_transactions").unwrap().default_enabled);
        assert!(!registry.get("postgres_binaries").unwrap().default_enabled);
        assert!(registry.get("extension").unwrap().default_enabled);
    }
}
