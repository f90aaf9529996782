//! Class and type registries.
//!
//! Classes map a name to a factory building a `Reference` from its
//! configuration. Types map a name to a `TypeDescriptor`; structured types
//! are registered with their member layout and are expanded member by
//! member when signals are compiled.

use crate::config::ObjectConfig;
use crate::error::ConfigurationError;
use crate::object::Reference;
use crate::types::{BasicType, Introspection, TypeDescriptor};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds one object of a class from its configuration.
pub type ClassFactory = fn(&ObjectConfig) -> Result<Reference, ConfigurationError>;

lazy_static! {
    static ref CLASSES: RwLock<HashMap<String, ClassFactory>> = RwLock::new(builtin_classes());
    static ref TYPES: RwLock<HashMap<String, Arc<Introspection>>> = RwLock::new(HashMap::new());
}

fn builtin_classes() -> HashMap<String, ClassFactory> {
    let entries: [(&str, ClassFactory); 7] = [
        ("MemoryDataSource", crate::datasource::build_memory_data_source),
        ("EventDataSource", crate::datasource::build_event_data_source),
        ("TimingDataSource", crate::datasource::build_timing_data_source),
        ("CopyGam", crate::gam::build_copy_gam),
        ("CounterGam", crate::gam::build_counter_gam),
        ("GainGam", crate::gam::build_gain_gam),
        ("MultiThreadScheduler", crate::scheduler::build_multi_thread_scheduler),
    ];
    entries
        .into_iter()
        .map(|(name, factory)| (name.to_string(), factory))
        .collect()
}

/// Register (or replace) a class factory.
pub fn register_class(name: &str, factory: ClassFactory) {
    if CLASSES.write().insert(name.to_string(), factory).is_some() {
        log::debug!("class `{}` re-registered", name);
    }
}

pub fn is_class_registered(name: &str) -> bool {
    CLASSES.read().contains_key(name)
}

/// Construct the object described by `config` through its class factory.
pub fn construct(config: &ObjectConfig) -> Result<Reference, ConfigurationError> {
    let factory = CLASSES
        .read()
        .get(&config.class)
        .copied()
        .ok_or_else(|| ConfigurationError::UnknownClass(config.class.clone()))?;
    let object = factory(config)?;
    log::debug!("constructed {} `{}`", config.class, config.name);
    Ok(object)
}

/// Register a structured type. Member types must already resolve, and the
/// members, taken in offset order, must tile `size` exactly: no padding and
/// no overlap, so a signal of this type copies every byte once.
pub fn register_type(introspection: Introspection) -> Result<(), ConfigurationError> {
    if BasicType::parse(&introspection.name).is_some() {
        return Err(ConfigurationError::DuplicateName(introspection.name));
    }
    let invalid = |reason: String| ConfigurationError::InvalidParameter {
        object: introspection.name.clone(),
        reason,
    };
    let mut spans = Vec::with_capacity(introspection.members.len());
    for member in &introspection.members {
        let member_type = resolve_type(&member.type_name)?;
        let end = member_type
            .size()
            .checked_mul(member.elements)
            .and_then(|len| len.checked_add(member.offset));
        match end {
            Some(end) if member.elements > 0 && end <= introspection.size => {
                spans.push((member.offset, end, member.name.as_str()));
            }
            _ => {
                return Err(invalid(format!(
                    "member `{}` does not fit in {} bytes",
                    member.name, introspection.size
                )))
            }
        }
    }
    spans.sort_by_key(|&(offset, _, _)| offset);
    let mut cursor = 0;
    for &(offset, end, name) in &spans {
        if offset < cursor {
            return Err(invalid(format!("member `{}` overlaps the previous member", name)));
        }
        if offset > cursor {
            return Err(invalid(format!("padding before member `{}` at byte {}", name, cursor)));
        }
        cursor = end;
    }
    if cursor != introspection.size {
        return Err(invalid(format!(
            "members cover {} of {} bytes",
            cursor, introspection.size
        )));
    }
    let mut types = TYPES.write();
    match types.get(&introspection.name) {
        Some(existing) if **existing == introspection => Ok(()),
        Some(_) => Err(ConfigurationError::DuplicateName(introspection.name)),
        None => {
            types.insert(introspection.name.clone(), Arc::new(introspection));
            Ok(())
        }
    }
}

/// Resolve a type name: basic types first, then registered structures.
pub fn resolve_type(name: &str) -> Result<TypeDescriptor, ConfigurationError> {
    if let Some(basic) = BasicType::parse(name) {
        return Ok(TypeDescriptor::Basic(basic));
    }
    TYPES
        .read()
        .get(name)
        .cloned()
        .map(TypeDescriptor::Structured)
        .ok_or_else(|| ConfigurationError::UnknownType(name.to_string()))
}

/// One basic-typed leaf of a (possibly nested) structured type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatMember {
    /// Dotted path below the root type, e.g. `position.x`.
    pub path: String,
    pub basic: BasicType,
    pub offset: usize,
    pub elements: usize,
}

/// Expand a type into its basic leaves, in declaration order.
pub fn flatten(descriptor: &TypeDescriptor) -> Result<Vec<FlatMember>, ConfigurationError> {
    let mut out = Vec::new();
    flatten_into(descriptor, "", 0, &mut out, 0)?;
    Ok(out)
}

const MAX_NESTING: usize = 16;

fn flatten_into(
    descriptor: &TypeDescriptor,
    prefix: &str,
    base: usize,
    out: &mut Vec<FlatMember>,
    depth: usize,
) -> Result<(), ConfigurationError> {
    match descriptor {
        TypeDescriptor::Basic(basic) => {
            out.push(FlatMember {
                path: prefix.to_string(),
                basic: *basic,
                offset: base,
                elements: 1,
            });
        }
        TypeDescriptor::Structured(s) => {
            if depth >= MAX_NESTING {
                return Err(ConfigurationError::InvalidParameter {
                    object: s.name.clone(),
                    reason: "structure nesting too deep".to_string(),
                });
            }
            for member in &s.members {
                let path = if prefix.is_empty() {
                    member.name.clone()
                } else {
                    format!("{}.{}", prefix, member.name)
                };
                match resolve_type(&member.type_name)? {
                    TypeDescriptor::Basic(basic) => out.push(FlatMember {
                        path,
                        basic,
                        offset: base + member.offset,
                        elements: member.elements,
                    }),
                    nested @ TypeDescriptor::Structured(_) => {
                        for i in 0..member.elements {
                            let element_path = if member.elements == 1 {
                                path.clone()
                            } else {
                                format!("{}[{}]", path, i)
                            };
                            let offset = base + member.offset + i * nested.size();
                            flatten_into(&nested, &element_path, offset, out, depth + 1)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
