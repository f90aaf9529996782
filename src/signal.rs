//! Resolved signal declarations.

use crate::config::{DataSourceSignalConfig, SignalConfig};
use crate::error::ConfigurationError;
use crate::registry::resolve_type;
use crate::types::TypeDescriptor;

/// GAM-side signal with its type resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDescriptor {
    pub name: String,
    /// Name inside the data source.
    pub alias: String,
    pub data_source: String,
    pub type_descriptor: TypeDescriptor,
    pub number_of_elements: usize,
    pub number_of_dimensions: u8,
    pub samples: usize,
    pub cycles: u32,
    pub samples_blocks: Vec<[u32; 3]>,
    pub signal_blocks: Vec<[u32; 2]>,
    pub default: Option<Vec<f64>>,
}

impl SignalDescriptor {
    pub fn from_config(config: &SignalConfig) -> Result<Self, ConfigurationError> {
        let type_descriptor = resolve_type(&config.type_name)?;
        if config.number_of_elements == 0 || config.samples == 0 {
            return Err(ConfigurationError::InvalidParameter {
                object: config.name.clone(),
                reason: "elements and samples must be at least 1".to_string(),
            });
        }
        let elements = config.number_of_elements as usize;
        let dimensions = config
            .number_of_dimensions
            .unwrap_or(if elements > 1 { 1 } else { 0 });
        if dimensions == 0 && elements > 1 {
            return Err(ConfigurationError::InvalidParameter {
                object: config.name.clone(),
                reason: "a scalar cannot have more than one element".to_string(),
            });
        }
        Ok(Self {
            name: config.name.clone(),
            alias: config.data_source_name().to_string(),
            data_source: config.data_source.clone(),
            type_descriptor,
            number_of_elements: elements,
            number_of_dimensions: dimensions,
            samples: config.samples as usize,
            cycles: config.cycles,
            samples_blocks: config.samples_blocks.clone(),
            signal_blocks: config.signal_blocks.clone(),
            default: config.default.as_ref().map(|d| d.values()),
        })
    }

    pub fn element_size(&self) -> usize {
        self.type_descriptor.size()
    }

    /// Repetitions per broker call; 0 cycles means 1.
    pub fn effective_cycles(&self) -> usize {
        self.cycles.max(1) as usize
    }

    pub fn is_synchronising(&self) -> bool {
        self.cycles > 0
    }

    /// Bytes this signal occupies in GAM memory:
    /// cycles × samples × elements × element size.
    pub fn footprint(&self) -> usize {
        self.effective_cycles() * self.samples * self.number_of_elements * self.element_size()
    }
}

/// Data-source-side signal. Always a basic type; structured GAM signals are
/// stored member by member.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceSignal {
    pub name: String,
    pub type_descriptor: TypeDescriptor,
    pub number_of_elements: usize,
    pub samples: usize,
    pub default: Option<Vec<f64>>,
    pub states: Vec<String>,
}

impl DataSourceSignal {
    pub fn from_config(owner: &str, config: &DataSourceSignalConfig) -> Result<Self, ConfigurationError> {
        let type_descriptor = resolve_type(&config.type_name)?;
        if type_descriptor.basic().is_none() {
            return Err(ConfigurationError::InvalidParameter {
                object: format!("{}.{}", owner, config.name),
                reason: "data source signals must have a basic type".to_string(),
            });
        }
        if config.number_of_elements == 0 || config.samples == 0 {
            return Err(ConfigurationError::InvalidParameter {
                object: format!("{}.{}", owner, config.name),
                reason: "elements and samples must be at least 1".to_string(),
            });
        }
        let default = config.default.as_ref().map(|d| d.values());
        if let Some(values) = &default {
            if values.len() != config.number_of_elements as usize {
                return Err(ConfigurationError::InvalidParameter {
                    object: format!("{}.{}", owner, config.name),
                    reason: format!(
                        "default has {} values for {} elements",
                        values.len(),
                        config.number_of_elements
                    ),
                });
            }
        }
        Ok(Self {
            name: config.name.clone(),
            type_descriptor,
            number_of_elements: config.number_of_elements as usize,
            samples: config.samples as usize,
            default,
            states: config.states.clone(),
        })
    }

    /// Bytes of one sample.
    pub fn sample_size(&self) -> usize {
        self.type_descriptor.size() * self.number_of_elements
    }

    pub fn byte_size(&self) -> usize {
        self.sample_size() * self.samples
    }

    pub fn is_used_in(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Default value encoded for every sample, or `None` without a default.
    pub fn encoded_default(&self) -> Option<Vec<u8>> {
        let values = self.default.as_ref()?;
        let basic = self.type_descriptor.basic()?;
        let mut bytes = vec![0u8; self.byte_size()];
        for sample in bytes.chunks_mut(self.sample_size()) {
            for (chunk, value) in sample.chunks_mut(basic.size()).zip(values) {
                basic.encode(*value, chunk);
            }
        }
        Some(bytes)
    }
}
