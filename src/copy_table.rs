//! Copy-table compiler.
//!
//! Resolves GAM-side signals against a data source's signal list into flat
//! `(gam_offset, ds_offset, byte_count)` descriptors. Descriptors are emitted
//! in cycle × sample-block × sample × byte-range order with a running GAM
//! offset; that order fixes the GAM memory layout.

use crate::error::ConfigurationError;
use crate::invariant_ppt::{assert_invariant, COPY_TABLE_COMPLETE, SIGNAL_RESOLVED, SINGLE_SYNC_SIGNAL};
use crate::registry::flatten;
use crate::signal::{DataSourceSignal, SignalDescriptor};
use crate::types::{BasicType, TypeDescriptor};

/// One resolved byte copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDescriptor {
    pub gam_offset: usize,
    /// Offset inside the data source signal's buffer.
    pub ds_offset: usize,
    pub byte_count: usize,
}

/// Consecutive samples read from a multi-sample data source signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleBlock {
    pub start: usize,
    pub samples: usize,
    pub bytes_per_sample: usize,
}

/// Byte range inside one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSignal {
    /// GAM-side name; structure members are dotted.
    pub name: String,
    pub ds_signal: String,
    pub ds_index: usize,
    pub cycles: usize,
    pub synchronising: bool,
    pub sample_blocks: Vec<SampleBlock>,
    pub ranges: Vec<ByteRange>,
    /// Descriptors for every cycle, cycle-major.
    pub descriptors: Vec<CopyDescriptor>,
    pub footprint: usize,
}

impl CompiledSignal {
    /// Descriptors copied in cycle `k`.
    #[inline]
    pub fn cycle(&self, k: usize) -> &[CopyDescriptor] {
        let per_cycle = self.descriptors.len() / self.cycles.max(1);
        let start = (k * per_cycle).min(self.descriptors.len());
        let end = (start + per_cycle).min(self.descriptors.len());
        &self.descriptors[start..end]
    }

    pub fn copied_bytes(&self) -> usize {
        self.descriptors.iter().map(|d| d.byte_count).sum()
    }
}

/// Compiled signals of one broker, frozen once the broker is finalised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyTable {
    owner: String,
    signals: Vec<CompiledSignal>,
    sync_index: Option<usize>,
}

impl CopyTable {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            signals: Vec::new(),
            sync_index: None,
        }
    }

    pub fn signals(&self) -> &[CompiledSignal] {
        &self.signals
    }

    /// Position of the synchronising signal, if any.
    pub fn sync_index(&self) -> Option<usize> {
        self.sync_index
    }

    pub fn total_bytes(&self) -> usize {
        self.signals.iter().map(|s| s.copied_bytes()).sum()
    }

    /// Compile `signal` located at `gam_offset` against the data source
    /// signals. A second synchronising signal is rejected.
    pub fn add_signal(
        &mut self,
        signal: &SignalDescriptor,
        gam_offset: usize,
        ds_name: &str,
        ds_signals: &[DataSourceSignal],
    ) -> Result<(), ConfigurationError> {
        let compiled = compile_signal(&self.owner, signal, gam_offset, ds_name, ds_signals)?;
        for c in compiled {
            if c.synchronising {
                if let Some(existing) = self.sync_index {
                    let err = ConfigurationError::DuplicateSynchronisingSignal {
                        owner: self.owner.clone(),
                        signal: c.name.clone(),
                        existing: self.signals[existing].name.clone(),
                    };
                    log::error!("{}", err);
                    return Err(err);
                }
                self.sync_index = Some(self.signals.len());
            }
            self.signals.push(c);
        }
        assert_invariant(
            SINGLE_SYNC_SIGNAL,
            self.signals.iter().filter(|s| s.synchronising).count() <= 1,
            "at most one synchronising signal per broker",
            Some(&self.owner),
        );
        Ok(())
    }
}

struct Leaf<'a> {
    gam_name: String,
    ds_name: String,
    basic: BasicType,
    elements: usize,
    samples: usize,
    cycles: usize,
    synchronising: bool,
    samples_blocks: &'a [[u32; 3]],
    signal_blocks: &'a [[u32; 2]],
    gam_offset: usize,
}

/// Compile one GAM signal. Structured signals produce one entry per basic
/// member, each bound to the data source signal `<alias>.<member>`.
pub fn compile_signal(
    owner: &str,
    signal: &SignalDescriptor,
    gam_offset: usize,
    ds_name: &str,
    ds_signals: &[DataSourceSignal],
) -> Result<Vec<CompiledSignal>, ConfigurationError> {
    match &signal.type_descriptor {
        TypeDescriptor::Basic(basic) => {
            let leaf = Leaf {
                gam_name: signal.name.clone(),
                ds_name: signal.alias.clone(),
                basic: *basic,
                elements: signal.number_of_elements,
                samples: signal.samples,
                cycles: signal.effective_cycles(),
                synchronising: signal.is_synchronising(),
                samples_blocks: &signal.samples_blocks,
                signal_blocks: &signal.signal_blocks,
                gam_offset,
            };
            Ok(vec![compile_leaf(owner, &leaf, ds_name, ds_signals)?])
        }
        structured @ TypeDescriptor::Structured(_) => {
            if signal.number_of_elements != 1
                || signal.samples != 1
                || signal.effective_cycles() != 1
                || !signal.samples_blocks.is_empty()
                || !signal.signal_blocks.is_empty()
            {
                return Err(ConfigurationError::InvalidParameter {
                    object: format!("{}.{}", owner, signal.name),
                    reason: "structured signals support a single element, sample and cycle"
                        .to_string(),
                });
            }
            let members = flatten(structured)?;
            let mut out = Vec::with_capacity(members.len());
            for (i, member) in members.iter().enumerate() {
                let leaf = Leaf {
                    gam_name: format!("{}.{}", signal.name, member.path),
                    ds_name: format!("{}.{}", signal.alias, member.path),
                    basic: member.basic,
                    elements: member.elements,
                    samples: 1,
                    cycles: 1,
                    synchronising: signal.is_synchronising() && i == 0,
                    samples_blocks: &[],
                    signal_blocks: &[],
                    gam_offset: gam_offset + member.offset,
                };
                out.push(compile_leaf(owner, &leaf, ds_name, ds_signals)?);
            }
            let copied: usize = out.iter().map(CompiledSignal::copied_bytes).sum();
            let footprint = signal.footprint();
            assert_invariant(
                COPY_TABLE_COMPLETE,
                copied == footprint,
                "structure members cover the signal footprint",
                Some(&signal.name),
            );
            if copied != footprint {
                let err = ConfigurationError::SizeMismatch {
                    signal: format!("{}.{}", owner, signal.name),
                    expected: footprint,
                    actual: copied,
                };
                log::error!("{}", err);
                return Err(err);
            }
            Ok(out)
        }
    }
}

fn compile_leaf(
    owner: &str,
    leaf: &Leaf<'_>,
    ds_name: &str,
    ds_signals: &[DataSourceSignal],
) -> Result<CompiledSignal, ConfigurationError> {
    let ds_index = ds_signals
        .iter()
        .position(|s| s.name == leaf.ds_name)
        .ok_or_else(|| {
            let err = ConfigurationError::UnresolvedSignal {
                owner: owner.to_string(),
                signal: leaf.ds_name.clone(),
                data_source: ds_name.to_string(),
            };
            log::error!("{}", err);
            err
        })?;
    let ds = &ds_signals[ds_index];
    if ds.type_descriptor.basic() != Some(leaf.basic) {
        return Err(ConfigurationError::TypeMismatch {
            signal: leaf.gam_name.clone(),
            gam_type: leaf.basic.name().to_string(),
            data_source_type: ds.type_descriptor.name().to_string(),
        });
    }

    let type_size = leaf.basic.size();
    let ranges = byte_ranges(leaf, ds.number_of_elements, type_size)?;
    let sample_blocks = sample_blocks(leaf, ds.samples, ds.sample_size())?;
    assert_invariant(
        SIGNAL_RESOLVED,
        ranges.iter().all(|r| r.start + r.len <= ds.sample_size())
            && sample_blocks
                .iter()
                .all(|b| b.start + b.samples * b.bytes_per_sample <= ds.byte_size()),
        "resolved ranges lie inside the data source signal",
        Some(&leaf.gam_name),
    );

    let per_cycle = sample_blocks.iter().map(|b| b.samples).sum::<usize>() * ranges.len();
    let mut descriptors = Vec::with_capacity(leaf.cycles * per_cycle);
    let mut gam_offset = leaf.gam_offset;
    for _ in 0..leaf.cycles {
        for block in &sample_blocks {
            for sample in 0..block.samples {
                let sample_start = block.start + sample * block.bytes_per_sample;
                for range in &ranges {
                    descriptors.push(CopyDescriptor {
                        gam_offset,
                        ds_offset: sample_start + range.start,
                        byte_count: range.len,
                    });
                    gam_offset += range.len;
                }
            }
        }
    }

    let footprint = leaf.cycles * leaf.samples * leaf.elements * type_size;
    let copied: usize = descriptors.iter().map(|d| d.byte_count).sum();
    assert_invariant(
        COPY_TABLE_COMPLETE,
        copied == footprint,
        "copy descriptors cover the declared footprint",
        Some(&leaf.gam_name),
    );
    log::debug!(
        "{}: {} -> {}.{} compiled into {} descriptors ({} bytes)",
        owner,
        leaf.gam_name,
        ds_name,
        leaf.ds_name,
        descriptors.len(),
        copied
    );

    Ok(CompiledSignal {
        name: leaf.gam_name.clone(),
        ds_signal: leaf.ds_name.clone(),
        ds_index,
        cycles: leaf.cycles,
        synchronising: leaf.synchronising,
        sample_blocks,
        ranges,
        descriptors,
        footprint,
    })
}

/// Element ranges inside one sample, as byte ranges.
fn byte_ranges(
    leaf: &Leaf<'_>,
    ds_elements: usize,
    type_size: usize,
) -> Result<Vec<ByteRange>, ConfigurationError> {
    if leaf.signal_blocks.is_empty() {
        if leaf.elements > ds_elements {
            return Err(ConfigurationError::SizeMismatch {
                signal: leaf.gam_name.clone(),
                expected: leaf.elements * type_size,
                actual: ds_elements * type_size,
            });
        }
        return Ok(vec![ByteRange {
            start: 0,
            len: leaf.elements * type_size,
        }]);
    }

    let mut ranges = Vec::with_capacity(leaf.signal_blocks.len());
    let mut total = 0usize;
    for &[begin, end] in leaf.signal_blocks {
        let (begin, end) = (begin as usize, end as usize);
        if begin > end || end >= ds_elements {
            return Err(ConfigurationError::InvalidBlockGeometry {
                signal: leaf.gam_name.clone(),
                reason: format!(
                    "block [{}, {}] outside the {} data source elements",
                    begin, end, ds_elements
                ),
            });
        }
        let count = end - begin + 1;
        ranges.push(ByteRange {
            start: begin * type_size,
            len: count * type_size,
        });
        total += count;
    }
    if total != leaf.elements {
        return Err(ConfigurationError::SizeMismatch {
            signal: leaf.gam_name.clone(),
            expected: leaf.elements * type_size,
            actual: total * type_size,
        });
    }
    Ok(ranges)
}

/// Sample windows. Each `[a, b, c]` row selects samples
/// `max - a*max/c ..= max - b*max/c` with `max = ds_samples - 1`.
fn sample_blocks(
    leaf: &Leaf<'_>,
    ds_samples: usize,
    bytes_per_sample: usize,
) -> Result<Vec<SampleBlock>, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidSampleGeometry {
        signal: leaf.gam_name.clone(),
        reason,
    };

    if leaf.samples_blocks.is_empty() {
        if leaf.samples > ds_samples {
            return Err(invalid(format!(
                "{} samples requested, data source holds {}",
                leaf.samples, ds_samples
            )));
        }
        return Ok(vec![SampleBlock {
            start: (ds_samples - leaf.samples) * bytes_per_sample,
            samples: leaf.samples,
            bytes_per_sample,
        }]);
    }

    let max = ds_samples - 1;
    let mut blocks = Vec::with_capacity(leaf.samples_blocks.len());
    let mut total = 0usize;
    for &[a, b, c] in leaf.samples_blocks {
        let (a, b, c) = (a as usize, b as usize, c as usize);
        if c == 0 || a > c || b > a {
            return Err(invalid(format!("row [{}, {}, {}] needs b <= a <= c and c > 0", a, b, c)));
        }
        let begin = max - (a * max) / c;
        let end = max - (b * max) / c;
        let count = end - begin + 1;
        blocks.push(SampleBlock {
            start: begin * bytes_per_sample,
            samples: count,
            bytes_per_sample,
        });
        total += count;
    }
    if total != leaf.samples {
        return Err(invalid(format!(
            "rows select {} samples, signal declares {}",
            total, leaf.samples
        )));
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSourceSignalConfig, SignalConfig};

    fn ds_signal(name: &str, ty: &str, elements: u32, samples: u32) -> DataSourceSignal {
        let mut cfg = DataSourceSignalConfig::new(name, ty);
        cfg.number_of_elements = elements;
        cfg.samples = samples;
        DataSourceSignal::from_config("DS", &cfg).unwrap()
    }

    fn gam_signal(cfg: SignalConfig) -> SignalDescriptor {
        SignalDescriptor::from_config(&cfg).unwrap()
    }

    #[test]
    fn scalar_defaults_to_last_sample() {
        let ds = [ds_signal("v", "uint32", 1, 4)];
        let sig = gam_signal(SignalConfig::new("v", "DS", "uint32"));
        let out = compile_signal("G", &sig, 16, "DS", &ds).unwrap();
        assert_eq!(
            out[0].descriptors,
            vec![CopyDescriptor {
                gam_offset: 16,
                ds_offset: 12,
                byte_count: 4
            }]
        );
    }

    #[test]
    fn signal_blocks_select_element_ranges() {
        let ds = [ds_signal("arr", "uint16", 6, 1)];
        let sig = gam_signal(
            SignalConfig::new("arr", "DS", "uint16")
                .elements(3)
                .signal_block([0, 0])
                .signal_block([4, 5]),
        );
        let out = compile_signal("G", &sig, 0, "DS", &ds).unwrap();
        let d = &out[0].descriptors;
        assert_eq!(d.len(), 2);
        assert_eq!((d[0].ds_offset, d[0].byte_count), (0, 2));
        assert_eq!((d[1].gam_offset, d[1].ds_offset, d[1].byte_count), (2, 8, 4));
    }

    #[test]
    fn block_total_must_match_elements() {
        let ds = [ds_signal("arr", "uint16", 6, 1)];
        let sig = gam_signal(SignalConfig::new("arr", "DS", "uint16").elements(3).signal_block([0, 0]));
        assert!(matches!(
            compile_signal("G", &sig, 0, "DS", &ds),
            Err(ConfigurationError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn cycles_repeat_the_same_source_bytes() {
        let ds = [ds_signal("t", "uint32", 1, 1)];
        let sig = gam_signal(SignalConfig::new("t", "DS", "uint32").cycles(3));
        let out = compile_signal("G", &sig, 0, "DS", &ds).unwrap();
        let c = &out[0];
        assert!(c.synchronising);
        assert_eq!(c.cycles, 3);
        assert_eq!(c.cycle(2), &[CopyDescriptor { gam_offset: 8, ds_offset: 0, byte_count: 4 }]);
        assert_eq!(c.copied_bytes(), c.footprint);
    }

    #[test]
    fn invalid_sample_rows_are_rejected() {
        let ds = [ds_signal("s", "uint8", 1, 4)];
        for row in [[1, 0, 0], [2, 0, 1], [0, 1, 1]] {
            let sig = gam_signal(SignalConfig::new("s", "DS", "uint8").samples_block(row));
            assert!(matches!(
                compile_signal("G", &sig, 0, "DS", &ds),
                Err(ConfigurationError::InvalidSampleGeometry { .. })
            ));
        }
    }

    #[test]
    fn type_mismatch_is_reported() {
        let ds = [ds_signal("v", "float32", 1, 1)];
        let sig = gam_signal(SignalConfig::new("v", "DS", "uint32"));
        assert!(matches!(
            compile_signal("G", &sig, 0, "DS", &ds),
            Err(ConfigurationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn second_synchronising_signal_is_rejected() {
        let ds = [ds_signal("a", "uint32", 1, 1), ds_signal("b", "uint32", 1, 1)];
        let mut table = CopyTable::new("G");
        table
            .add_signal(&gam_signal(SignalConfig::new("a", "DS", "uint32").cycles(1)), 0, "DS", &ds)
            .unwrap();
        let err = table
            .add_signal(&gam_signal(SignalConfig::new("b", "DS", "uint32").cycles(1)), 4, "DS", &ds)
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateSynchronisingSignal { .. }));
        assert_eq!(table.sync_index(), Some(0));
        assert_eq!(table.signals().len(), 1);
    }
}
