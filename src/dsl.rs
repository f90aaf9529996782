//! DSL module: builder API for application configurations.

use crate::config::{
    ApplicationConfig, DataSourceSignalConfig, ObjectConfig, SignalConfig, StateConfig, ThreadConfig,
};
use serde_json::Value;
use thiserror::Error;

/// Handle to a data source in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSourceHandle(pub usize);

/// Handle to a GAM in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GamHandle(pub usize);

/// Handle to a state in the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHandle(pub usize);

#[derive(Debug)]
struct GamEntry {
    config: ObjectConfig,
    inputs: Vec<SignalConfig>,
    outputs: Vec<SignalConfig>,
}

#[derive(Debug)]
struct DataSourceEntry {
    config: ObjectConfig,
    signals: Vec<DataSourceSignalConfig>,
}

/// The application builder.
#[derive(Debug)]
pub struct ApplicationBuilder {
    name: String,
    data_sources: Vec<DataSourceEntry>,
    gams: Vec<GamEntry>,
    states: Vec<StateConfig>,
    scheduler: Option<ObjectConfig>,
}

impl ApplicationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_sources: Vec::new(),
            gams: Vec::new(),
            states: Vec::new(),
            scheduler: None,
        }
    }

    /// Add a data source of `class`.
    pub fn data_source(&mut self, name: &str, class: &str) -> DataSourceHandle {
        self.data_sources.push(DataSourceEntry {
            config: ObjectConfig::new(name, class),
            signals: Vec::new(),
        });
        DataSourceHandle(self.data_sources.len() - 1)
    }

    /// Declare a data source signal explicitly (defaults, extra samples).
    pub fn data_source_signal(&mut self, ds: DataSourceHandle, signal: DataSourceSignalConfig) -> &mut Self {
        if let Some(entry) = self.data_sources.get_mut(ds.0) {
            entry.signals.push(signal);
        }
        self
    }

    pub fn data_source_param(&mut self, ds: DataSourceHandle, key: &str, value: Value) -> &mut Self {
        if let Some(entry) = self.data_sources.get_mut(ds.0) {
            entry.config.params.insert(key.to_string(), value);
        }
        self
    }

    /// Add a GAM of `class`.
    pub fn gam(&mut self, name: &str, class: &str) -> GamHandle {
        self.gams.push(GamEntry {
            config: ObjectConfig::new(name, class),
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        GamHandle(self.gams.len() - 1)
    }

    pub fn input(&mut self, gam: GamHandle, signal: SignalConfig) -> &mut Self {
        if let Some(entry) = self.gams.get_mut(gam.0) {
            entry.inputs.push(signal);
        }
        self
    }

    pub fn output(&mut self, gam: GamHandle, signal: SignalConfig) -> &mut Self {
        if let Some(entry) = self.gams.get_mut(gam.0) {
            entry.outputs.push(signal);
        }
        self
    }

    pub fn gam_param(&mut self, gam: GamHandle, key: &str, value: Value) -> &mut Self {
        if let Some(entry) = self.gams.get_mut(gam.0) {
            entry.config.params.insert(key.to_string(), value);
        }
        self
    }

    pub fn state(&mut self, name: &str) -> StateHandle {
        self.states.push(StateConfig {
            name: name.to_string(),
            threads: Vec::new(),
        });
        StateHandle(self.states.len() - 1)
    }

    /// Add a thread running `gams` in order.
    pub fn thread(&mut self, state: StateHandle, name: &str, gams: &[GamHandle]) -> Result<(), DslError> {
        let functions = gams
            .iter()
            .map(|g| {
                self.gams
                    .get(g.0)
                    .map(|e| e.config.name.clone())
                    .ok_or(DslError::UnknownHandle)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let state = self.states.get_mut(state.0).ok_or(DslError::UnknownHandle)?;
        state.threads.push(ThreadConfig {
            name: name.to_string(),
            functions,
            cpus: 0,
            stack_size: 256 * 1024,
        });
        Ok(())
    }

    /// Set CPU mask and stack size of the last thread added to `state`.
    pub fn thread_options(&mut self, state: StateHandle, cpus: u64, stack_size: usize) -> Result<(), DslError> {
        let thread = self
            .states
            .get_mut(state.0)
            .and_then(|s| s.threads.last_mut())
            .ok_or(DslError::UnknownHandle)?;
        thread.cpus = cpus;
        thread.stack_size = stack_size;
        Ok(())
    }

    pub fn scheduler(&mut self, name: &str, class: &str) -> &mut Self {
        self.scheduler = Some(ObjectConfig::new(name, class));
        self
    }

    /// Mirror execution times into `ds`.
    pub fn timing_data_source(&mut self, ds: DataSourceHandle) -> Result<&mut Self, DslError> {
        let name = self
            .data_sources
            .get(ds.0)
            .map(|e| e.config.name.clone())
            .ok_or(DslError::UnknownHandle)?;
        let scheduler = self.scheduler.as_mut().ok_or(DslError::MissingScheduler)?;
        scheduler
            .params
            .insert("timing_data_source".to_string(), Value::String(name));
        Ok(self)
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ApplicationConfig, DslError> {
        unique(self.data_sources.iter().map(|d| d.config.name.as_str()))?;
        unique(self.gams.iter().map(|g| g.config.name.as_str()))?;
        unique(self.states.iter().map(|s| s.name.as_str()))?;
        for state in &self.states {
            if state.threads.is_empty() {
                return Err(DslError::EmptyState(state.name.clone()));
            }
        }
        for gam in &self.gams {
            for signal in gam.inputs.iter().chain(&gam.outputs) {
                if !self.data_sources.iter().any(|d| d.config.name == signal.data_source) {
                    return Err(DslError::UnknownDataSource {
                        function: gam.config.name.clone(),
                        data_source: signal.data_source.clone(),
                    });
                }
            }
        }
        let scheduler = self.scheduler.ok_or(DslError::MissingScheduler)?;

        let data_sources = self
            .data_sources
            .into_iter()
            .map(|entry| {
                let mut config = entry.config;
                if !entry.signals.is_empty() {
                    config.params.insert("signals".to_string(), to_value(&entry.signals)?);
                }
                Ok(config)
            })
            .collect::<Result<Vec<_>, DslError>>()?;
        let functions = self
            .gams
            .into_iter()
            .map(|entry| {
                let mut config = entry.config;
                config.params.insert("input_signals".to_string(), to_value(&entry.inputs)?);
                config.params.insert("output_signals".to_string(), to_value(&entry.outputs)?);
                Ok(config)
            })
            .collect::<Result<Vec<_>, DslError>>()?;

        Ok(ApplicationConfig {
            name: self.name,
            data_sources,
            functions,
            states: self.states,
            scheduler,
        })
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, DslError> {
    serde_json::to_value(value).map_err(|e| DslError::Serialization(e.to_string()))
}

fn unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), DslError> {
    let mut seen = Vec::new();
    for name in names {
        if seen.contains(&name) {
            return Err(DslError::DuplicateName(name.to_string()));
        }
        seen.push(name);
    }
    Ok(())
}

/// DSL-specific errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DslError {
    #[error("duplicate name `{0}`")]
    DuplicateName(String),
    #[error("{function}: unknown data source `{data_source}`")]
    UnknownDataSource { function: String, data_source: String },
    #[error("state `{0}` has no threads")]
    EmptyState(String),
    #[error("no scheduler configured")]
    MissingScheduler,
    #[error("handle does not belong to this builder")]
    UnknownHandle,
    #[error("serialisation failed: {0}")]
    Serialization(String),
}
