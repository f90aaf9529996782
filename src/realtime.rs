//! Real-time states and the threads inside them.

use crate::config::{StateConfig, ThreadConfig};
use crate::container::ReferenceContainer;
use crate::error::ConfigurationError;
use crate::gam::Gam;
use crate::object::{Object, Reference, ReferenceT};

/// An ordered list of GAMs executed by one OS thread.
#[derive(Debug)]
pub struct RealTimeThread {
    name: String,
    functions: Vec<String>,
    cpus: u64,
    stack_size: usize,
    gams: Vec<ReferenceT<Gam>>,
}

impl RealTimeThread {
    /// Resolve the thread's function names in `functions`. A name that does
    /// not resolve to a GAM is logged and left out; the thread keeps the
    /// rest in declared order.
    pub fn new(config: &ThreadConfig, functions: &ReferenceContainer) -> Result<Self, ConfigurationError> {
        let mut gams = Vec::with_capacity(config.functions.len());
        for function in &config.functions {
            match functions.find_by_name(function)?.and_then(|r| r.downcast::<Gam>()) {
                Some(gam) => gams.push(gam),
                None => log::error!(
                    "thread `{}`: `{}` is not a configured GAM, skipped",
                    config.name,
                    function
                ),
            }
        }
        Ok(Self::from_gams(config, gams))
    }

    pub fn from_gams(config: &ThreadConfig, gams: Vec<ReferenceT<Gam>>) -> Self {
        Self {
            name: config.name.clone(),
            functions: config.functions.clone(),
            cpus: config.cpus,
            stack_size: config.stack_size,
            gams,
        }
    }

    /// Declared function names, resolved or not.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    pub fn gams(&self) -> &[ReferenceT<Gam>] {
        &self.gams
    }

    /// CPU affinity mask; 0 means no preference.
    pub fn cpus(&self) -> u64 {
        self.cpus
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Object for RealTimeThread {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "RealTimeThread"
    }
}

/// A named set of threads that run together.
#[derive(Debug)]
pub struct RealTimeState {
    threads: ReferenceContainer,
}

impl RealTimeState {
    pub fn new(config: &StateConfig, functions: &ReferenceContainer) -> Result<Self, ConfigurationError> {
        let state = Self {
            threads: ReferenceContainer::new(&config.name),
        };
        for thread in &config.threads {
            if state.thread(&thread.name).is_some() {
                return Err(ConfigurationError::DuplicateName(format!(
                    "{}.{}",
                    config.name, thread.name
                )));
            }
            state
                .threads
                .insert(Reference::new(RealTimeThread::new(thread, functions)?))?;
        }
        state.check_unique_gams()?;
        Ok(state)
    }

    /// A GAM may belong to only one thread of a state.
    fn check_unique_gams(&self) -> Result<(), ConfigurationError> {
        let threads = self.threads();
        let mut seen: Vec<&ReferenceT<Gam>> = Vec::new();
        for thread in &threads {
            for gam in thread.gams() {
                if seen.iter().any(|g| g.ptr_eq(gam)) {
                    return Err(ConfigurationError::DuplicateName(format!(
                        "{}.{}",
                        self.threads.name(),
                        Object::name(&**gam)
                    )));
                }
                seen.push(gam);
            }
        }
        Ok(())
    }

    pub fn threads(&self) -> Vec<ReferenceT<RealTimeThread>> {
        (0..self.threads.size())
            .filter_map(|i| self.threads.get(i))
            .filter_map(|r| r.downcast::<RealTimeThread>())
            .collect()
    }

    pub fn thread(&self, name: &str) -> Option<ReferenceT<RealTimeThread>> {
        self.threads().into_iter().find(|t| Object::name(&**t) == name)
    }

    /// Whether any thread of this state runs `gam`.
    pub fn runs(&self, gam: &str) -> bool {
        self.threads()
            .iter()
            .any(|t| t.gams().iter().any(|g| Object::name(&**g) == gam))
    }
}

impl Object for RealTimeState {
    fn name(&self) -> &str {
        self.threads.name()
    }

    fn class_name(&self) -> &'static str {
        "RealTimeState"
    }

    fn as_container(&self) -> Option<&ReferenceContainer> {
        Some(&self.threads)
    }
}
