//! The real-time application: object tree plus state machine.
//!
//! `configure` builds every object under a root container with the children
//! `Data`, `Functions`, `States` and `Scheduler`. Data source signals that
//! are not declared explicitly are inferred from the GAM signals that use
//! them, together with the states each signal is used in.

use crate::config::{ApplicationConfig, DataSourceSignalConfig, GamParams, ObjectConfig, SchedulerParams};
use crate::container::ReferenceContainer;
use crate::datasource::{DataSource, StateTransition};
use crate::error::{ApplicationError, ConfigurationError};
use crate::executable::{cycle_time_signal_name, timing_signal_name, Stage};
use crate::gam::Gam;
use crate::invariant_ppt::{
    assert_invariant, APPLICATION_CONFIGURED, SCHEDULER_CONFIGURED, STATE_PREPARED, TIMING_SINK_RESOLVED,
};
use crate::object::{Object, Reference, ReferenceT};
use crate::realtime::RealTimeState;
use crate::registry::{construct, flatten};
use crate::scheduler::GamScheduler;
use crate::signal::SignalDescriptor;
use crate::types::{BasicType, TypeDescriptor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct RealTimeApplication {
    name: String,
    root: ReferenceContainer,
    data_sources: Vec<Arc<dyn DataSource>>,
    gams: Vec<ReferenceT<Gam>>,
    states: Vec<ReferenceT<RealTimeState>>,
    scheduler: Arc<dyn GamScheduler>,
    index: usize,
    current: Option<String>,
    pending: Option<String>,
}

/// One data source signal implied by a GAM signal.
struct ImpliedSignal {
    data_source: String,
    name: String,
    type_name: &'static str,
    elements: u32,
    samples: u32,
}

fn implied_signals(descriptor: &SignalDescriptor) -> Result<Vec<ImpliedSignal>, ConfigurationError> {
    match &descriptor.type_descriptor {
        TypeDescriptor::Basic(basic) => {
            let declared = descriptor.number_of_elements as u32;
            let elements = descriptor
                .signal_blocks
                .iter()
                .map(|&[_, end]| end + 1)
                .fold(declared, u32::max);
            Ok(vec![ImpliedSignal {
                data_source: descriptor.data_source.clone(),
                name: descriptor.alias.clone(),
                type_name: basic.name(),
                elements,
                samples: descriptor.samples as u32,
            }])
        }
        structured => Ok(flatten(structured)?
            .into_iter()
            .map(|member| ImpliedSignal {
                data_source: descriptor.data_source.clone(),
                name: format!("{}.{}", descriptor.alias, member.path),
                type_name: member.basic.name(),
                elements: member.elements as u32,
                samples: 1,
            })
            .collect()),
    }
}

fn unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), ConfigurationError> {
    let mut seen: Vec<&str> = Vec::new();
    for name in names {
        if seen.contains(&name) {
            return Err(ConfigurationError::DuplicateName(name.to_string()));
        }
        seen.push(name);
    }
    Ok(())
}

fn states_running(config: &ApplicationConfig, function: &str) -> Vec<String> {
    config
        .states
        .iter()
        .filter(|s| s.threads.iter().any(|t| t.functions.iter().any(|f| f == function)))
        .map(|s| s.name.clone())
        .collect()
}

fn read_signals(ds: &ObjectConfig) -> Result<Vec<DataSourceSignalConfig>, ConfigurationError> {
    match ds.params.get("signals") {
        None => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| ConfigurationError::InvalidParameter {
            object: ds.name.clone(),
            reason: e.to_string(),
        }),
    }
}

fn write_signals(ds: &mut ObjectConfig, signals: &[DataSourceSignalConfig]) -> Result<(), ConfigurationError> {
    let value = serde_json::to_value(signals).map_err(|e| ConfigurationError::InvalidParameter {
        object: ds.name.clone(),
        reason: e.to_string(),
    })?;
    ds.params.insert("signals".to_string(), value);
    Ok(())
}

fn merge_signal(signals: &mut Vec<DataSourceSignalConfig>, implied: ImpliedSignal, states: &[String]) {
    let existing = match signals.iter_mut().find(|s| s.name == implied.name) {
        Some(s) => s,
        None => {
            let mut declared = DataSourceSignalConfig::new(&implied.name, implied.type_name);
            declared.number_of_elements = implied.elements;
            declared.samples = implied.samples;
            signals.push(declared);
            let last = signals.len() - 1;
            &mut signals[last]
        }
    };
    existing.number_of_elements = existing.number_of_elements.max(implied.elements);
    existing.samples = existing.samples.max(implied.samples);
    for state in states {
        if !existing.states.contains(state) {
            existing.states.push(state.clone());
        }
    }
}

/// Complete the data source signal lists from the GAM declarations and add
/// the timing signals to the timing data source.
fn complete_data_sources(
    config: &mut ApplicationConfig,
    timing: Option<&str>,
) -> Result<(), ConfigurationError> {
    let mut tables: BTreeMap<String, Vec<DataSourceSignalConfig>> = BTreeMap::new();
    for ds in &config.data_sources {
        tables.insert(ds.name.clone(), read_signals(ds)?);
    }

    for function in &config.functions {
        let params: GamParams = function.parse()?;
        let states = states_running(config, &function.name);
        for signal in params.input_signals.iter().chain(&params.output_signals) {
            let descriptor = SignalDescriptor::from_config(signal)?;
            for implied in implied_signals(&descriptor)? {
                let table = tables.get_mut(&implied.data_source).ok_or_else(|| {
                    log::error!(
                        "{}: signal `{}` names unknown data source `{}`",
                        function.name,
                        signal.name,
                        implied.data_source
                    );
                    ConfigurationError::NotFound(implied.data_source.clone())
                })?;
                merge_signal(table, implied, &states);
            }
        }
    }

    if let Some(timing) = timing {
        let table = tables
            .get_mut(timing)
            .ok_or_else(|| ConfigurationError::NotFound(timing.to_string()))?;
        let mut names = Vec::new();
        for state in &config.states {
            for thread in &state.threads {
                names.push(cycle_time_signal_name(&state.name, &thread.name));
                for function in &thread.functions {
                    for stage in [Stage::Read, Stage::Execute, Stage::Write] {
                        names.push(timing_signal_name(function, stage));
                    }
                }
            }
        }
        for name in names {
            let implied = ImpliedSignal {
                data_source: timing.to_string(),
                name,
                type_name: BasicType::UInt32.name(),
                elements: 1,
                samples: 1,
            };
            merge_signal(table, implied, &[]);
        }
    }

    for ds in &mut config.data_sources {
        if let Some(signals) = tables.get(&ds.name) {
            write_signals(ds, signals)?;
        }
    }
    Ok(())
}

fn child(root: &ReferenceContainer, name: &str) -> Result<ReferenceT<ReferenceContainer>, ConfigurationError> {
    let container = ReferenceT::new(ReferenceContainer::new(name));
    root.insert(container.to_reference())?;
    Ok(container)
}

impl RealTimeApplication {
    pub fn configure(config: &ApplicationConfig) -> Result<Self, ApplicationError> {
        unique_names(config.data_sources.iter().map(|d| d.name.as_str()))?;
        unique_names(config.functions.iter().map(|f| f.name.as_str()))?;
        unique_names(config.states.iter().map(|s| s.name.as_str()))?;

        let scheduler_params: SchedulerParams = config.scheduler.parse()?;
        let timing_name = scheduler_params.timing_data_source.clone();
        let mut config = config.clone();
        complete_data_sources(&mut config, timing_name.as_deref())?;

        let root = ReferenceContainer::new(&config.name);
        let data = child(&root, "Data")?;
        let functions = child(&root, "Functions")?;
        let states_node = child(&root, "States")?;
        let scheduler_node = child(&root, "Scheduler")?;

        let mut data_sources: Vec<Arc<dyn DataSource>> = Vec::with_capacity(config.data_sources.len());
        for ds_config in &config.data_sources {
            let reference = construct(ds_config)?;
            let ds = reference.data_source().ok_or_else(|| ConfigurationError::InvalidParameter {
                object: ds_config.name.clone(),
                reason: format!("class `{}` is not a data source", ds_config.class),
            })?;
            data.insert(reference).map_err(ConfigurationError::from)?;
            data_sources.push(ds);
        }

        let mut gams = Vec::with_capacity(config.functions.len());
        for function in &config.functions {
            let reference = construct(function)?;
            let gam = reference.downcast::<Gam>().ok_or_else(|| ConfigurationError::InvalidParameter {
                object: function.name.clone(),
                reason: format!("class `{}` is not a GAM", function.class),
            })?;
            gam.connect(|name| data_sources.iter().find(|d| d.name() == name).cloned())?;
            functions.insert(reference).map_err(ConfigurationError::from)?;
            gams.push(gam);
        }

        let mut states = Vec::with_capacity(config.states.len());
        for state_config in &config.states {
            let state = ReferenceT::new(RealTimeState::new(state_config, &functions)?);
            states_node
                .insert(state.to_reference())
                .map_err(ConfigurationError::from)?;
            states.push(state);
        }

        let reference = construct(&config.scheduler)?;
        let scheduler = reference.scheduler().ok_or_else(|| ConfigurationError::InvalidParameter {
            object: config.scheduler.name.clone(),
            reason: format!("class `{}` is not a scheduler", config.scheduler.class),
        })?;
        scheduler_node.insert(reference).map_err(ConfigurationError::from)?;

        let timing = match scheduler.timing_data_source() {
            Some(name) => Some(
                data_sources
                    .iter()
                    .find(|d| d.name() == name)
                    .cloned()
                    .ok_or_else(|| ConfigurationError::NotFound(name.to_string()))?,
            ),
            None => None,
        };
        if let Some(sink) = &timing {
            assert_invariant(
                TIMING_SINK_RESOLVED,
                sink.number_of_buffers() == 1,
                "timing data source is single-buffered",
                Some(sink.name()),
            );
        }
        scheduler.configure(&states, timing)?;
        assert_invariant(
            SCHEDULER_CONFIGURED,
            states.iter().all(|s| scheduler.is_configured_for(Object::name(&**s))),
            "scheduler holds an execution list for every state",
            Some(scheduler.name()),
        );
        assert_invariant(
            APPLICATION_CONFIGURED,
            root.size() == 4,
            "root holds Data, Functions, States and Scheduler",
            Some(&config.name),
        );
        log::info!(
            "application `{}`: {} data sources, {} GAMs, {} states",
            config.name,
            data_sources.len(),
            gams.len(),
            states.len()
        );

        Ok(Self {
            name: config.name.clone(),
            root,
            data_sources,
            gams,
            states,
            scheduler,
            index: 0,
            current: None,
            pending: None,
        })
    }

    /// Parse `value` and configure.
    pub fn from_value(value: Value) -> Result<Self, ApplicationError> {
        Self::configure(&ApplicationConfig::from_value(value)?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer index of the running state, or of the prepared one once
    /// `prepare_next_state` has succeeded.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn pending_state(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn root(&self) -> &ReferenceContainer {
        &self.root
    }

    /// Object at a dotted path below the root, e.g. `Data.DDB1`.
    pub fn find(&self, path: &str) -> Option<Reference> {
        match self.root.find_path(path) {
            Ok(found) => found,
            Err(e) => {
                log::error!("{}: lookup of `{}` failed: {}", self.name, path, e);
                None
            }
        }
    }

    pub fn data_source(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.data_sources.iter().find(|d| d.name() == name).cloned()
    }

    pub fn gam(&self, name: &str) -> Option<ReferenceT<Gam>> {
        self.gams.iter().find(|g| Object::name(&***g) == name).cloned()
    }

    pub fn state(&self, name: &str) -> Option<ReferenceT<RealTimeState>> {
        self.states.iter().find(|s| Object::name(&***s) == name).cloned()
    }

    pub fn scheduler(&self) -> &Arc<dyn GamScheduler> {
        &self.scheduler
    }

    /// Get the data sources and the scheduler ready for `name` on the other
    /// buffer index, then flip the application index.
    pub fn prepare_next_state(&mut self, name: &str) -> Result<(), ApplicationError> {
        if let Some(pending) = &self.pending {
            return Err(ApplicationError::InvalidTransition(format!(
                "`{}` is prepared but not started",
                pending
            )));
        }
        if self.state(name).is_none() {
            return Err(ApplicationError::UnknownState(name.to_string()));
        }
        let transition = StateTransition::new(self.index, self.current.as_deref(), name);
        for ds in &self.data_sources {
            ds.prepare_next_state(&transition)?;
        }
        self.scheduler.prepare_next_state(name, transition.next_buffer)?;
        assert_invariant(
            STATE_PREPARED,
            self.data_sources.iter().all(|ds| {
                (0..ds.signals().len()).all(|i| ds.signal_memory(i, transition.next_buffer).is_some())
            }),
            "every data source signal is routed on the next buffer",
            Some(name),
        );
        log::info!(
            "{}: `{}` prepared on buffer {} (from {:?})",
            self.name,
            name,
            transition.next_buffer,
            transition.current_state
        );
        self.index = transition.next_buffer;
        self.pending = Some(name.to_string());
        Ok(())
    }

    /// Publish the new buffer index and hand the scheduler over to the
    /// prepared state. Threads shared by both states keep running. If the
    /// scheduler refuses, every data source returns to its previous index
    /// and the prepared state stays pending.
    pub fn start_next_state_execution(&mut self) -> Result<(), ApplicationError> {
        let Some(next) = self.pending.clone() else {
            return Err(ApplicationError::InvalidTransition("no state prepared".to_string()));
        };
        let previous: Vec<usize> = self.data_sources.iter().map(|ds| ds.current_state_buffer()).collect();
        let switched = self
            .data_sources
            .iter()
            .try_for_each(|ds| ds.set_active_buffer(self.index))
            .map_err(ApplicationError::from)
            .and_then(|()| Ok(self.scheduler.start_execution(self.index)?));
        if let Err(e) = switched {
            log::error!("{}: `{}` failed to start: {}", self.name, next, e);
            for (ds, &buffer) in self.data_sources.iter().zip(&previous) {
                if let Err(restore) = ds.set_active_buffer(buffer) {
                    log::error!("{}: {} kept buffer {}: {}", self.name, ds.name(), self.index, restore);
                }
            }
            return Err(e);
        }
        self.pending = None;
        self.current = Some(next);
        Ok(())
    }

    pub fn stop_current_state_execution(&mut self) -> Result<(), ApplicationError> {
        self.scheduler.stop_execution()?;
        Ok(())
    }
}

impl Drop for RealTimeApplication {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            if let Err(e) = self.scheduler.stop_execution() {
                log::error!("{}: stop on drop failed: {}", self.name, e);
            }
        }
        self.root.purge();
    }
}

impl std::fmt::Debug for RealTimeApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealTimeApplication")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("current", &self.current)
            .field("pending", &self.pending)
            .finish()
    }
}
