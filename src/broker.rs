//! Brokers move signal bytes between one GAM's working memory and one data
//! source, driven by a compiled copy table.
//!
//! `read`/`write` take the buffer index explicitly and never consult shared
//! "active" state, so a broker survives state switches unchanged. Neither
//! call allocates, locks or logs.
//!
//! GAM outputs go through an [`OutputBroker`]: the plain broker, or an
//! [`AsyncOutputBroker`] when the data source asks for asynchronous output.

use crate::async_broker::AsyncOutputBroker;
use crate::config::OutputMode;
use crate::copy_table::{CompiledSignal, CopyTable};
use crate::datasource::DataSource;
use crate::error::{BrokerError, ConfigurationError};
use crate::memory::SharedBuffer;
use crate::signal::SignalDescriptor;
use crate::sync::Timeout;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Data source to GAM.
    Input,
    /// GAM to data source.
    Output,
}

pub struct MemoryMapBroker {
    direction: Direction,
    owner: String,
    data_source: Arc<dyn DataSource>,
    gam_memory: Arc<SharedBuffer>,
    table: CopyTable,
    finalised: bool,
}

impl MemoryMapBroker {
    pub fn new(
        direction: Direction,
        owner: &str,
        data_source: Arc<dyn DataSource>,
        gam_memory: Arc<SharedBuffer>,
    ) -> Self {
        Self {
            direction,
            owner: owner.to_string(),
            table: CopyTable::new(owner),
            data_source,
            gam_memory,
            finalised: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.data_source
    }

    pub fn table(&self) -> &CopyTable {
        &self.table
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    pub fn gam_memory_len(&self) -> usize {
        self.gam_memory.len()
    }

    /// Point the broker at other GAM-side memory of the same length and
    /// return the previous one. `None` when the lengths differ.
    pub(crate) fn swap_gam_memory(&mut self, memory: Arc<SharedBuffer>) -> Option<Arc<SharedBuffer>> {
        if memory.len() != self.gam_memory.len() {
            return None;
        }
        Some(std::mem::replace(&mut self.gam_memory, memory))
    }

    pub fn is_synchronising(&self) -> bool {
        self.table.sync_index().is_some()
    }

    /// Compile `signal` located at `gam_offset` in GAM memory.
    pub fn add_signal(
        &mut self,
        signal: &SignalDescriptor,
        gam_offset: usize,
    ) -> Result<(), ConfigurationError> {
        if self.finalised {
            return Err(ConfigurationError::InvalidParameter {
                object: self.owner.clone(),
                reason: format!("cannot add `{}` to a finalised broker", signal.name),
            });
        }
        let end = gam_offset + signal.footprint();
        if end > self.gam_memory.len() {
            return Err(ConfigurationError::SizeMismatch {
                signal: signal.name.clone(),
                expected: end,
                actual: self.gam_memory.len(),
            });
        }
        self.table.add_signal(
            signal,
            gam_offset,
            self.data_source.name(),
            self.data_source.signals(),
        )
    }

    /// Freeze the copy table. Checks every descriptor against the memory it
    /// will touch, so runtime copies can only fail on a bad buffer index.
    pub fn finalise(&mut self) -> Result<(), ConfigurationError> {
        for signal in self.table.signals() {
            let ds_size = self
                .data_source
                .signals()
                .get(signal.ds_index)
                .map_or(0, |s| s.byte_size());
            for d in &signal.descriptors {
                if d.gam_offset + d.byte_count > self.gam_memory.len()
                    || d.ds_offset + d.byte_count > ds_size
                {
                    return Err(ConfigurationError::SizeMismatch {
                        signal: signal.name.clone(),
                        expected: d.ds_offset + d.byte_count,
                        actual: ds_size,
                    });
                }
            }
        }
        self.finalised = true;
        Ok(())
    }

    /// Run the broker in its own direction.
    #[inline]
    pub fn execute(&self, active_buffer: usize, timeout: Timeout) -> Result<(), BrokerError> {
        match self.direction {
            Direction::Input => self.read(active_buffer, timeout),
            Direction::Output => self.write(active_buffer, timeout),
        }
    }

    /// Data source to GAM memory.
    ///
    /// For the synchronising signal each cycle first waits on the data
    /// source. A timed-out wait skips the rest of the table and reports
    /// `SyncTimeout`; no stale data is copied for that cycle.
    pub fn read(&self, active_buffer: usize, timeout: Timeout) -> Result<(), BrokerError> {
        if !self.finalised {
            return Err(BrokerError::NotFinalised);
        }
        for signal in self.table.signals() {
            let ds_memory = self
                .data_source
                .signal_memory(signal.ds_index, active_buffer)
                .ok_or(BrokerError::BufferIndex(active_buffer))?;
            for cycle in 0..signal.cycles {
                self.wait_if_synchronising(signal, timeout)?;
                self.data_source.read_start();
                let copied = copy_cycle(signal, cycle, ds_memory, &self.gam_memory, Direction::Input);
                self.data_source.read_end();
                copied?;
            }
        }
        Ok(())
    }

    /// GAM memory to data source.
    pub fn write(&self, active_buffer: usize, timeout: Timeout) -> Result<(), BrokerError> {
        if !self.finalised {
            return Err(BrokerError::NotFinalised);
        }
        for signal in self.table.signals() {
            let ds_memory = self
                .data_source
                .signal_memory(signal.ds_index, active_buffer)
                .ok_or(BrokerError::BufferIndex(active_buffer))?;
            for cycle in 0..signal.cycles {
                self.wait_if_synchronising(signal, timeout)?;
                self.data_source.write_start();
                let copied = copy_cycle(signal, cycle, ds_memory, &self.gam_memory, Direction::Output);
                self.data_source.write_end();
                copied?;
            }
        }
        Ok(())
    }

    #[inline]
    fn wait_if_synchronising(&self, signal: &CompiledSignal, timeout: Timeout) -> Result<(), BrokerError> {
        if signal.synchronising && !self.data_source.synchronise(timeout) {
            return Err(BrokerError::SyncTimeout);
        }
        Ok(())
    }
}

#[inline]
fn copy_cycle(
    signal: &CompiledSignal,
    cycle: usize,
    ds_memory: &SharedBuffer,
    gam_memory: &SharedBuffer,
    direction: Direction,
) -> Result<(), BrokerError> {
    for d in signal.cycle(cycle) {
        match direction {
            Direction::Input => ds_memory.copy_to(d.ds_offset, gam_memory, d.gam_offset, d.byte_count)?,
            Direction::Output => gam_memory.copy_to(d.gam_offset, ds_memory, d.ds_offset, d.byte_count)?,
        }
    }
    Ok(())
}

/// Output side of a GAM towards one data source.
#[derive(Debug)]
pub enum OutputBroker {
    Direct(MemoryMapBroker),
    Asynchronous(AsyncOutputBroker),
}

impl OutputBroker {
    /// Wrap a finalised output broker as its data source's output mode asks.
    pub fn for_data_source(broker: MemoryMapBroker) -> Result<Self, ConfigurationError> {
        match broker.data_source().output_mode() {
            OutputMode::Direct => Ok(OutputBroker::Direct(broker)),
            mode => AsyncOutputBroker::start(broker, mode).map(OutputBroker::Asynchronous),
        }
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        match self {
            OutputBroker::Direct(b) => b.data_source(),
            OutputBroker::Asynchronous(b) => b.data_source(),
        }
    }

    pub fn table(&self) -> &CopyTable {
        match self {
            OutputBroker::Direct(b) => b.table(),
            OutputBroker::Asynchronous(b) => b.table(),
        }
    }

    pub fn as_async(&self) -> Option<&AsyncOutputBroker> {
        match self {
            OutputBroker::Direct(_) => None,
            OutputBroker::Asynchronous(b) => Some(b),
        }
    }

    #[inline]
    pub fn write(&self, active_buffer: usize, timeout: Timeout) -> Result<(), BrokerError> {
        match self {
            OutputBroker::Direct(b) => b.write(active_buffer, timeout),
            OutputBroker::Asynchronous(b) => b.write(active_buffer, timeout),
        }
    }
}

impl fmt::Debug for MemoryMapBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMapBroker")
            .field("direction", &self.direction)
            .field("owner", &self.owner)
            .field("data_source", &self.data_source.name())
            .field("signals", &self.table.signals().len())
            .field("finalised", &self.finalised)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSourceSignalConfig, SignalConfig};
    use crate::datasource::{EventDataSource, MemoryDataSource};
    use crate::signal::DataSourceSignal;

    fn ds_signals(names: &[&str]) -> Vec<DataSourceSignal> {
        names
            .iter()
            .map(|n| DataSourceSignal::from_config("DS", &DataSourceSignalConfig::new(n, "uint32")).unwrap())
            .collect()
    }

    fn descriptor(name: &str) -> SignalDescriptor {
        SignalDescriptor::from_config(&SignalConfig::new(name, "DS", "uint32")).unwrap()
    }

    #[test]
    fn read_before_finalise_fails_without_copying() {
        let ds: Arc<dyn DataSource> = Arc::new(MemoryDataSource::new("DS", ds_signals(&["a"]), 2).unwrap());
        ds.signal_memory(0, 0).unwrap().write_from(0, &[1, 2, 3, 4]).unwrap();
        let gam = Arc::new(SharedBuffer::new(4));
        let mut broker = MemoryMapBroker::new(Direction::Input, "G", ds, Arc::clone(&gam));
        broker.add_signal(&descriptor("a"), 0).unwrap();
        assert_eq!(broker.read(0, Timeout::ZERO), Err(BrokerError::NotFinalised));
        assert_eq!(gam.to_vec(), vec![0; 4]);
        broker.finalise().unwrap();
        broker.read(0, Timeout::ZERO).unwrap();
        assert_eq!(gam.to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_targets_the_given_buffer() {
        let ds: Arc<dyn DataSource> = Arc::new(MemoryDataSource::new("DS", ds_signals(&["a", "b"]), 2).unwrap());
        let gam = Arc::new(SharedBuffer::from_bytes(&[1, 0, 0, 0, 2, 0, 0, 0]));
        let mut broker = MemoryMapBroker::new(Direction::Output, "G", Arc::clone(&ds), gam);
        broker.add_signal(&descriptor("a"), 0).unwrap();
        broker.add_signal(&descriptor("b"), 4).unwrap();
        broker.finalise().unwrap();
        broker.execute(0, Timeout::ZERO).unwrap();
        assert_eq!(ds.signal_memory(1, 0).unwrap().to_vec(), vec![2, 0, 0, 0]);
    }

    #[test]
    fn signal_past_gam_memory_is_rejected() {
        let ds: Arc<dyn DataSource> = Arc::new(MemoryDataSource::new("DS", ds_signals(&["a"]), 2).unwrap());
        let mut broker = MemoryMapBroker::new(Direction::Input, "G", ds, Arc::new(SharedBuffer::new(2)));
        assert!(matches!(
            broker.add_signal(&descriptor("a"), 0),
            Err(ConfigurationError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn sync_timeout_skips_the_copy() {
        let ds: Arc<dyn DataSource> = Arc::new(EventDataSource::new("EV", ds_signals(&["t"]), 1).unwrap());
        ds.signal_memory(0, 0).unwrap().write_from(0, &[9, 9, 9, 9]).unwrap();
        let gam = Arc::new(SharedBuffer::new(4));
        let mut broker = MemoryMapBroker::new(Direction::Input, "G", ds, Arc::clone(&gam));
        let sync = SignalDescriptor::from_config(&SignalConfig::new("t", "EV", "uint32").cycles(1)).unwrap();
        broker.add_signal(&sync, 0).unwrap();
        broker.finalise().unwrap();
        assert!(broker.is_synchronising());
        assert_eq!(broker.read(0, Timeout::ZERO), Err(BrokerError::SyncTimeout));
        assert_eq!(gam.to_vec(), vec![0; 4]);
    }
}
