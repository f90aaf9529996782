//! GAMs: computation blocks with declared input and output signals.
//!
//! A `Gam` owns two working memories laid out signal after signal in
//! declaration order. Brokers fill the input memory and drain the output
//! memory; the user-supplied `GamLogic` only ever sees those two memories
//! through `GamIo`.

use crate::broker::{Direction, MemoryMapBroker, OutputBroker};
use crate::config::{GamParams, ObjectConfig, SignalConfig};
use crate::datasource::DataSource;
use crate::error::{BrokerError, ConfigurationError};
use crate::invariant_ppt::{assert_invariant, BROKER_FINALISED, GAM_LAYOUT_CONSISTENT};
use crate::memory::SharedBuffer;
use crate::object::{Object, Reference};
use crate::signal::SignalDescriptor;
use crate::sync::Timeout;
use crate::types::{BasicType, Scalar};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A signal placed in GAM working memory.
#[derive(Debug, Clone, PartialEq)]
pub struct GamSignal {
    pub descriptor: SignalDescriptor,
    pub offset: usize,
}

impl GamSignal {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn footprint(&self) -> usize {
        self.descriptor.footprint()
    }

    /// Basic values held: cycles × samples × elements.
    pub fn count(&self) -> usize {
        self.footprint() / self.descriptor.element_size().max(1)
    }

    pub fn basic(&self) -> Option<BasicType> {
        self.descriptor.type_descriptor.basic()
    }
}

/// What a logic sees at setup.
#[derive(Debug, Clone, Copy)]
pub struct GamLayout<'a> {
    pub name: &'a str,
    pub inputs: &'a [GamSignal],
    pub outputs: &'a [GamSignal],
}

/// Typed view over one GAM's working memory during `execute`.
pub struct GamIo<'a> {
    inputs: &'a [GamSignal],
    outputs: &'a [GamSignal],
    input_memory: &'a SharedBuffer,
    output_memory: &'a SharedBuffer,
}

impl<'a> GamIo<'a> {
    pub fn number_of_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn number_of_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Element `element` of input `signal`, if the type matches.
    #[inline]
    pub fn read_input<T: Scalar>(&self, signal: usize, element: usize) -> Option<T> {
        let offset = scalar_offset::<T>(self.inputs.get(signal)?, element)?;
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::TYPE.size()];
        self.input_memory.read_into(offset, raw).ok()?;
        Some(T::from_bytes(raw))
    }

    #[inline]
    pub fn write_output<T: Scalar>(&self, signal: usize, element: usize, value: T) -> bool {
        let Some(offset) = self.outputs.get(signal).and_then(|s| scalar_offset::<T>(s, element)) else {
            return false;
        };
        let mut raw = [0u8; 8];
        let raw = &mut raw[..T::TYPE.size()];
        value.to_bytes(raw);
        self.output_memory.write_from(offset, raw).is_ok()
    }

    /// Element of an input of any basic type, widened to `f64`.
    pub fn input_value(&self, signal: usize, element: usize) -> Option<f64> {
        let s = self.inputs.get(signal)?;
        let basic = s.basic()?;
        let offset = value_offset(s, basic, element)?;
        let mut raw = [0u8; 8];
        let raw = &mut raw[..basic.size()];
        self.input_memory.read_into(offset, raw).ok()?;
        basic.decode(raw)
    }

    /// Store `value` into an output of any basic type, saturating.
    pub fn write_output_value(&self, signal: usize, element: usize, value: f64) -> bool {
        let Some(s) = self.outputs.get(signal) else {
            return false;
        };
        let Some(basic) = s.basic() else {
            return false;
        };
        let Some(offset) = value_offset(s, basic, element) else {
            return false;
        };
        let mut raw = [0u8; 8];
        let raw = &mut raw[..basic.size()];
        basic.encode(value, raw) && self.output_memory.write_from(offset, raw).is_ok()
    }

    /// Raw copy of an input's bytes into an output.
    pub fn copy_input_to_output(&self, input: usize, output: usize) -> bool {
        let (Some(i), Some(o)) = (self.inputs.get(input), self.outputs.get(output)) else {
            return false;
        };
        let len = i.footprint().min(o.footprint());
        self.input_memory
            .copy_to(i.offset, self.output_memory, o.offset, len)
            .is_ok()
    }
}

#[inline]
fn scalar_offset<T: Scalar>(signal: &GamSignal, element: usize) -> Option<usize> {
    if signal.basic() != Some(T::TYPE) {
        return None;
    }
    value_offset(signal, T::TYPE, element)
}

#[inline]
fn value_offset(signal: &GamSignal, basic: BasicType, element: usize) -> Option<usize> {
    (element < signal.count()).then(|| signal.offset + element * basic.size())
}

/// User code of a GAM.
pub trait GamLogic: Send {
    /// Validate the signal layout once, before any execution.
    fn setup(&mut self, _layout: &GamLayout<'_>) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// One computation step. Returns false on failure.
    fn execute(&mut self, io: &GamIo<'_>) -> bool;
}

struct Brokers {
    inputs: Vec<MemoryMapBroker>,
    outputs: Vec<OutputBroker>,
}

pub struct Gam {
    name: String,
    class_name: &'static str,
    inputs: Vec<GamSignal>,
    outputs: Vec<GamSignal>,
    input_memory: Arc<SharedBuffer>,
    output_memory: Arc<SharedBuffer>,
    brokers: OnceLock<Brokers>,
    logic: Mutex<Box<dyn GamLogic>>,
    timeout: Timeout,
}

fn layout(signals: &[SignalConfig]) -> Result<(Vec<GamSignal>, usize), ConfigurationError> {
    let mut offset = 0;
    let mut placed = Vec::with_capacity(signals.len());
    for config in signals {
        let descriptor = SignalDescriptor::from_config(config)?;
        let footprint = descriptor.footprint();
        placed.push(GamSignal { descriptor, offset });
        offset += footprint;
    }
    Ok((placed, offset))
}

impl Gam {
    pub fn new(
        name: &str,
        class_name: &'static str,
        params: &GamParams,
        mut logic: Box<dyn GamLogic>,
    ) -> Result<Self, ConfigurationError> {
        for (i, s) in params.input_signals.iter().enumerate() {
            if params.input_signals[..i].iter().any(|p| p.name == s.name) {
                return Err(ConfigurationError::DuplicateName(format!("{}.{}", name, s.name)));
            }
        }
        for (i, s) in params.output_signals.iter().enumerate() {
            if params.output_signals[..i].iter().any(|p| p.name == s.name) {
                return Err(ConfigurationError::DuplicateName(format!("{}.{}", name, s.name)));
            }
        }
        let (inputs, input_size) = layout(&params.input_signals)?;
        let (outputs, output_size) = layout(&params.output_signals)?;
        assert_invariant(
            GAM_LAYOUT_CONSISTENT,
            inputs.iter().map(GamSignal::footprint).sum::<usize>() == input_size
                && outputs.iter().map(GamSignal::footprint).sum::<usize>() == output_size,
            "working memory equals the sum of signal footprints",
            Some(name),
        );
        logic.setup(&GamLayout {
            name,
            inputs: &inputs,
            outputs: &outputs,
        })?;
        log::debug!(
            "{} `{}`: {} inputs ({} bytes), {} outputs ({} bytes)",
            class_name,
            name,
            inputs.len(),
            input_size,
            outputs.len(),
            output_size
        );
        Ok(Self {
            name: name.to_string(),
            class_name,
            inputs,
            outputs,
            input_memory: Arc::new(SharedBuffer::new(input_size)),
            output_memory: Arc::new(SharedBuffer::new(output_size)),
            brokers: OnceLock::new(),
            logic: Mutex::new(logic),
            timeout: Timeout::from(params.timeout_ms),
        })
    }

    pub fn inputs(&self) -> &[GamSignal] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[GamSignal] {
        &self.outputs
    }

    pub fn input_memory(&self) -> &SharedBuffer {
        &self.input_memory
    }

    pub fn output_memory(&self) -> &SharedBuffer {
        &self.output_memory
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.brokers.get().is_some()
    }

    pub fn input_brokers(&self) -> &[MemoryMapBroker] {
        self.brokers.get().map_or(&[], |b| &b.inputs)
    }

    pub fn output_brokers(&self) -> &[OutputBroker] {
        self.brokers.get().map_or(&[], |b| &b.outputs)
    }

    /// Build and finalise one broker per data source and direction.
    /// Outputs to an asynchronous data source get their own flush thread.
    pub fn connect<F>(&self, resolve: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<Arc<dyn DataSource>>,
    {
        if self.is_connected() {
            return Err(ConfigurationError::InvalidParameter {
                object: self.name.clone(),
                reason: "brokers already connected".to_string(),
            });
        }
        let inputs = self.build_brokers(Direction::Input, &self.inputs, &self.input_memory, &resolve)?;
        let outputs = self
            .build_brokers(Direction::Output, &self.outputs, &self.output_memory, &resolve)?
            .into_iter()
            .map(OutputBroker::for_data_source)
            .collect::<Result<Vec<_>, _>>()?;
        self.brokers
            .set(Brokers { inputs, outputs })
            .map_err(|_| ConfigurationError::InvalidParameter {
                object: self.name.clone(),
                reason: "brokers already connected".to_string(),
            })
    }

    fn build_brokers<F>(
        &self,
        direction: Direction,
        signals: &[GamSignal],
        memory: &Arc<SharedBuffer>,
        resolve: &F,
    ) -> Result<Vec<MemoryMapBroker>, ConfigurationError>
    where
        F: Fn(&str) -> Option<Arc<dyn DataSource>>,
    {
        let mut brokers: Vec<MemoryMapBroker> = Vec::new();
        for signal in signals {
            let ds_name = signal.descriptor.data_source.as_str();
            let position = brokers.iter().position(|b| b.data_source().name() == ds_name);
            let broker = match position {
                Some(i) => &mut brokers[i],
                None => {
                    let ds = resolve(ds_name).ok_or_else(|| {
                        log::error!("{}: data source `{}` not found", self.name, ds_name);
                        ConfigurationError::NotFound(ds_name.to_string())
                    })?;
                    brokers.push(MemoryMapBroker::new(direction, &self.name, ds, Arc::clone(memory)));
                    let last = brokers.len() - 1;
                    &mut brokers[last]
                }
            };
            broker.add_signal(&signal.descriptor, signal.offset)?;
        }
        for broker in &mut brokers {
            broker.finalise()?;
            assert_invariant(BROKER_FINALISED, broker.is_finalised(), "broker finalised", Some(&self.name));
        }
        Ok(brokers)
    }

    /// Run every input broker on `buffer`.
    #[inline]
    pub fn read_inputs(&self, buffer: usize) -> Result<(), BrokerError> {
        let brokers = self.brokers.get().ok_or(BrokerError::NotFinalised)?;
        for broker in &brokers.inputs {
            broker.read(buffer, self.timeout)?;
        }
        Ok(())
    }

    #[inline]
    pub fn execute_logic(&self) -> bool {
        // A GAM runs on one thread at a time; contention means misuse.
        let Some(mut logic) = self.logic.try_lock() else {
            return false;
        };
        let io = GamIo {
            inputs: &self.inputs,
            outputs: &self.outputs,
            input_memory: &self.input_memory,
            output_memory: &self.output_memory,
        };
        logic.execute(&io)
    }

    #[inline]
    pub fn write_outputs(&self, buffer: usize) -> Result<(), BrokerError> {
        let brokers = self.brokers.get().ok_or(BrokerError::NotFinalised)?;
        for broker in &brokers.outputs {
            broker.write(buffer, self.timeout)?;
        }
        Ok(())
    }
}

impl Object for Gam {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        self.class_name
    }
}

impl fmt::Debug for Gam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gam")
            .field("name", &self.name)
            .field("class", &self.class_name)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn pairwise_check(layout: &GamLayout<'_>, same_type: bool) -> Result<(), ConfigurationError> {
    if layout.inputs.len() != layout.outputs.len() {
        return Err(ConfigurationError::InvalidParameter {
            object: layout.name.to_string(),
            reason: format!(
                "{} inputs but {} outputs",
                layout.inputs.len(),
                layout.outputs.len()
            ),
        });
    }
    for (i, o) in layout.inputs.iter().zip(layout.outputs) {
        if same_type && (i.basic().is_none() || o.basic().is_none()) {
            return Err(ConfigurationError::TypeMismatch {
                signal: o.name().to_string(),
                gam_type: o.descriptor.type_descriptor.name().to_string(),
                data_source_type: i.descriptor.type_descriptor.name().to_string(),
            });
        }
        let (expected, actual) = if same_type {
            (i.count(), o.count())
        } else {
            (i.footprint(), o.footprint())
        };
        if expected != actual {
            return Err(ConfigurationError::SizeMismatch {
                signal: o.name().to_string(),
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Copies input `i` to output `i` byte for byte.
#[derive(Debug, Default)]
pub struct CopyGam;

impl GamLogic for CopyGam {
    fn setup(&mut self, layout: &GamLayout<'_>) -> Result<(), ConfigurationError> {
        pairwise_check(layout, false)
    }

    fn execute(&mut self, io: &GamIo<'_>) -> bool {
        (0..io.number_of_inputs()).all(|i| io.copy_input_to_output(i, i))
    }
}

/// Writes a running `uint32` count to every element of its first output.
#[derive(Debug)]
pub struct CounterGam {
    count: u32,
    step: u32,
}

impl CounterGam {
    pub fn new(step: u32) -> Self {
        Self { count: 0, step }
    }
}

impl GamLogic for CounterGam {
    fn setup(&mut self, layout: &GamLayout<'_>) -> Result<(), ConfigurationError> {
        match layout.outputs.first() {
            Some(o) if o.basic() == Some(BasicType::UInt32) => Ok(()),
            Some(o) => Err(ConfigurationError::TypeMismatch {
                signal: o.name().to_string(),
                gam_type: o.descriptor.type_descriptor.name().to_string(),
                data_source_type: "uint32".to_string(),
            }),
            None => Err(ConfigurationError::MissingParameter {
                object: layout.name.to_string(),
                parameter: "output_signals".to_string(),
            }),
        }
    }

    fn execute(&mut self, io: &GamIo<'_>) -> bool {
        self.count = self.count.wrapping_add(self.step);
        let mut element = 0;
        while io.write_output(0, element, self.count) {
            element += 1;
        }
        element > 0
    }
}

/// `output[i] = gain * input[i]` element-wise, any basic types.
#[derive(Debug)]
pub struct GainGam {
    gain: f64,
}

impl GainGam {
    pub fn new(gain: f64) -> Self {
        Self { gain }
    }
}

impl GamLogic for GainGam {
    fn setup(&mut self, layout: &GamLayout<'_>) -> Result<(), ConfigurationError> {
        pairwise_check(layout, true)
    }

    fn execute(&mut self, io: &GamIo<'_>) -> bool {
        for signal in 0..io.number_of_inputs() {
            let mut element = 0;
            while let Some(value) = io.input_value(signal, element) {
                if !io.write_output_value(signal, element, value * self.gain) {
                    return false;
                }
                element += 1;
            }
        }
        true
    }
}

fn number_param(config: &ObjectConfig, key: &str, default: f64) -> Result<f64, ConfigurationError> {
    match config.params.get(key) {
        None => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| ConfigurationError::InvalidParameter {
            object: config.name.clone(),
            reason: format!("`{}` must be a number", key),
        }),
    }
}

pub(crate) fn build_copy_gam(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: GamParams = config.parse()?;
    Ok(Reference::new(Gam::new(&config.name, "CopyGam", &params, Box::new(CopyGam))?))
}

pub(crate) fn build_counter_gam(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: GamParams = config.parse()?;
    let step = number_param(config, "step", 1.0)?;
    if step < 0.0 || step > u32::MAX as f64 || step.fract() != 0.0 {
        return Err(ConfigurationError::InvalidParameter {
            object: config.name.clone(),
            reason: format!("step {} is not a uint32", step),
        });
    }
    let logic = Box::new(CounterGam::new(step as u32));
    Ok(Reference::new(Gam::new(&config.name, "CounterGam", &params, logic)?))
}

pub(crate) fn build_gain_gam(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let params: GamParams = config.parse()?;
    let gain = number_param(config, "gain", 1.0)?;
    let logic = Box::new(GainGam::new(gain));
    Ok(Reference::new(Gam::new(&config.name, "GainGam", &params, logic)?))
}
