//! Configuration tree.
//!
//! The tree arrives already parsed (JSON values through `serde_json`); this
//! module only gives it typed shape and defaults.

use crate::error::ConfigurationError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn one() -> u32 {
    1
}

fn two() -> u32 {
    2
}

fn default_slots() -> u32 {
    8
}

fn default_stack_size() -> usize {
    256 * 1024
}

fn default_app_name() -> String {
    "Application".to_string()
}

/// A named object plus its class-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectConfig {
    pub name: String,
    pub class: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ObjectConfig {
    pub fn new(name: &str, class: &str) -> Self {
        Self {
            name: name.to_string(),
            class: class.to_string(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Deserialize the parameters into a class-specific shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ConfigurationError> {
        serde_json::from_value(Value::Object(self.params.clone())).map_err(|e| {
            ConfigurationError::InvalidParameter {
                object: self.name.clone(),
                reason: e.to_string(),
            }
        })
    }
}

/// Scalar or per-element default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl DefaultValue {
    pub fn values(&self) -> Vec<f64> {
        match self {
            DefaultValue::Scalar(v) => vec![*v],
            DefaultValue::Array(v) => v.clone(),
        }
    }
}

/// GAM-side signal declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    pub data_source: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Name of the signal inside the data source. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "one")]
    pub number_of_elements: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_dimensions: Option<u8>,
    #[serde(default = "one")]
    pub samples: u32,
    /// Non-zero marks the synchronising signal, repeated this many times.
    #[serde(default)]
    pub cycles: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples_blocks: Vec<[u32; 3]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signal_blocks: Vec<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
}

impl SignalConfig {
    pub fn new(name: &str, data_source: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            data_source: data_source.to_string(),
            type_name: type_name.to_string(),
            alias: None,
            number_of_elements: 1,
            number_of_dimensions: None,
            samples: 1,
            cycles: 0,
            samples_blocks: Vec::new(),
            signal_blocks: Vec::new(),
            default: None,
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn elements(mut self, n: u32) -> Self {
        self.number_of_elements = n;
        self
    }

    pub fn samples(mut self, n: u32) -> Self {
        self.samples = n;
        self
    }

    pub fn cycles(mut self, n: u32) -> Self {
        self.cycles = n;
        self
    }

    pub fn samples_block(mut self, row: [u32; 3]) -> Self {
        self.samples_blocks.push(row);
        self
    }

    pub fn signal_block(mut self, row: [u32; 2]) -> Self {
        self.signal_blocks.push(row);
        self
    }

    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn data_source_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Data-source-side signal declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceSignalConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "one")]
    pub number_of_elements: u32,
    #[serde(default = "one")]
    pub samples: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DefaultValue>,
    /// States whose threads touch this signal. Filled in by the application.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<String>,
}

impl DataSourceSignalConfig {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            number_of_elements: 1,
            samples: 1,
            default: None,
            states: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceParams {
    #[serde(default = "two")]
    pub number_of_buffers: u32,
    #[serde(default)]
    pub signals: Vec<DataSourceSignalConfig>,
    /// How GAM outputs reach this data source.
    #[serde(default)]
    pub output: OutputMode,
}

/// Output path selected per data source.
///
/// ```json
/// "output": {"mode": "triggered", "buffers": 8,
///            "pre_trigger_buffers": 2, "post_trigger_buffers": 3}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputMode {
    /// Copy straight into data source memory on the GAM's thread.
    #[default]
    Direct,
    /// Queue each cycle's output in one of `buffers` frames; a flush
    /// thread writes them to the data source.
    Asynchronous {
        buffers: u32,
        #[serde(default)]
        ignore_buffer_overrun: bool,
    },
    /// As `Asynchronous`, but only frames around a non-zero trigger
    /// (the first output signal, a `uint8`) are written.
    Triggered {
        buffers: u32,
        #[serde(default)]
        pre_trigger_buffers: u32,
        #[serde(default)]
        post_trigger_buffers: u32,
        #[serde(default)]
        ignore_buffer_overrun: bool,
    },
}

/// Parameters of a `CircularBufferDataSource`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircularBufferParams {
    /// Sample frames the producer may run ahead of the reader.
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// `uint64` signal stamped with µs since start when a frame is produced.
    #[serde(default)]
    pub time_stamp_signal: Option<String>,
    /// `uint32` signal flagging frames that follow dropped samples.
    #[serde(default)]
    pub error_check_signal: Option<String>,
    #[serde(default)]
    pub signals: Vec<DataSourceSignalConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamParams {
    #[serde(default)]
    pub input_signals: Vec<SignalConfig>,
    #[serde(default)]
    pub output_signals: Vec<SignalConfig>,
    /// Synchronising wait bound. Absent means wait forever.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub name: String,
    pub functions: Vec<String>,
    #[serde(default)]
    pub cpus: u64,
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    pub name: String,
    pub threads: Vec<ThreadConfig>,
}

/// Parameters every scheduler class understands.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerParams {
    #[serde(default)]
    pub timing_data_source: Option<String>,
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default)]
    pub data_sources: Vec<ObjectConfig>,
    #[serde(default)]
    pub functions: Vec<ObjectConfig>,
    pub states: Vec<StateConfig>,
    pub scheduler: ObjectConfig,
}

impl ApplicationConfig {
    pub fn from_value(value: Value) -> Result<Self, ConfigurationError> {
        serde_json::from_value(value).map_err(|e| ConfigurationError::InvalidParameter {
            object: "application".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(text).map_err(|e| ConfigurationError::InvalidParameter {
            object: "application".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
