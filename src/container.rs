//! Ordered, thread-safe collection of references with recursive search.
//!
//! Searches walk a snapshot of each level, so the internal lock is never
//! held while descending into children. Cycles are cut by tracking the
//! containers on the current path: a container can be reached again through
//! a different branch, but never while it is its own ancestor.

use crate::error::ContainerError;
use crate::object::{Object, Reference};
use crate::sync::Timeout;
use parking_lot::{Mutex, MutexGuard};
use std::ops::BitOr;

/// Bit flags selecting how `find` walks the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SearchMode(u32);

impl SearchMode {
    pub const SHALLOW: SearchMode = SearchMode(0);
    /// Descend into child containers.
    pub const RECURSIVE: SearchMode = SearchMode(1);
    /// Store the containers leading to a match ahead of it.
    pub const PATH: SearchMode = SearchMode(2);
    pub const REVERSE: SearchMode = SearchMode(4);
    /// Remove matches from the container they were found in.
    pub const REMOVE: SearchMode = SearchMode(8);

    pub const fn contains(self, other: SearchMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SearchMode {
    type Output = SearchMode;

    fn bitor(self, rhs: SearchMode) -> SearchMode {
        SearchMode(self.0 | rhs.0)
    }
}

/// Match predicate applied to every visited reference.
pub trait Filter {
    fn test(&self, candidate: &Reference) -> bool;
}

impl<F: Fn(&Reference) -> bool> Filter for F {
    fn test(&self, candidate: &Reference) -> bool {
        self(candidate)
    }
}

/// Matches one object by identity.
pub struct ByReference(pub Reference);

impl Filter for ByReference {
    fn test(&self, candidate: &Reference) -> bool {
        self.0.ptr_eq(candidate)
    }
}

/// Matches objects by name.
pub struct ByName(pub String);

impl ByName {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl Filter for ByName {
    fn test(&self, candidate: &Reference) -> bool {
        candidate.name() == Some(self.0.as_str())
    }
}

/// Matches objects by class name.
pub struct ByClass(pub &'static str);

impl Filter for ByClass {
    fn test(&self, candidate: &Reference) -> bool {
        candidate.class_name() == Some(self.0)
    }
}

/// One search: a filter, the wanted occurrence and the walk options.
///
/// `occurrence < 0` collects every match. `occurrence = n > 0` stops at the
/// n-th match and returns only that one.
pub struct Search<'f> {
    filter: &'f dyn Filter,
    occurrence: i32,
    mode: SearchMode,
    max_depth: usize,
    found: u32,
}

impl<'f> Search<'f> {
    pub fn new(filter: &'f dyn Filter, occurrence: i32, mode: SearchMode) -> Self {
        Self {
            filter,
            occurrence,
            mode,
            max_depth: usize::MAX,
            found: 0,
        }
    }

    /// Every match, anywhere below the root.
    pub fn all(filter: &'f dyn Filter) -> Self {
        Self::new(filter, -1, SearchMode::RECURSIVE)
    }

    /// Levels to search, counting the root level as 1.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn found(&self) -> u32 {
        self.found
    }

    fn search_all(&self) -> bool {
        self.occurrence < 0
    }

    fn is_finished(&self) -> bool {
        self.occurrence > 0 && self.found >= self.occurrence as u32
    }
}

pub struct ReferenceContainer {
    name: String,
    items: Mutex<Vec<Reference>>,
    timeout: Mutex<Timeout>,
}

impl ReferenceContainer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(Vec::new()),
            timeout: Mutex::new(Timeout::Infinite),
        }
    }

    /// Bound how long structural operations wait for the lock.
    pub fn set_timeout(&self, timeout: Timeout) {
        *self.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Timeout {
        *self.timeout.lock()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Reference>>, ContainerError> {
        match self.timeout() {
            Timeout::Infinite => Ok(self.items.lock()),
            Timeout::After(d) => self.items.try_lock_for(d).ok_or(ContainerError::LockTimeout),
        }
    }

    fn key(&self) -> usize {
        self as *const ReferenceContainer as usize
    }

    fn snapshot(&self) -> Result<Vec<Reference>, ContainerError> {
        Ok(self.lock()?.clone())
    }

    /// Append at the tail.
    pub fn insert(&self, reference: Reference) -> Result<(), ContainerError> {
        if !reference.is_valid() {
            return Err(ContainerError::InvalidReference);
        }
        self.lock()?.push(reference);
        Ok(())
    }

    /// Insert before `index`; `index == size()` appends.
    pub fn insert_at(&self, reference: Reference, index: usize) -> Result<(), ContainerError> {
        if !reference.is_valid() {
            return Err(ContainerError::InvalidReference);
        }
        let mut items = self.lock()?;
        if index > items.len() {
            return Err(ContainerError::IndexOutOfRange {
                index,
                size: items.len(),
            });
        }
        items.insert(index, reference);
        Ok(())
    }

    /// Insert into the container named by the dotted `path`, creating any
    /// missing intermediate containers. An empty path inserts here.
    pub fn insert_path(&self, path: &str, reference: Reference) -> Result<(), ContainerError> {
        if !reference.is_valid() {
            return Err(ContainerError::InvalidReference);
        }
        let mut current = Reference::default();
        for token in path.split('.').filter(|t| !t.is_empty()) {
            let parent = current.as_container().unwrap_or(self);
            let next = match parent.child(token)? {
                Some(child) if child.is_container() => child,
                Some(_) => return Err(ContainerError::NotAContainer(token.to_string())),
                None => {
                    let created = Reference::new(ReferenceContainer::new(token));
                    parent.insert(created.clone())?;
                    created
                }
            };
            current = next;
        }
        current.as_container().unwrap_or(self).insert(reference)
    }

    /// Remove every entry that is `reference`. Returns whether any was removed.
    pub fn delete(&self, reference: &Reference) -> Result<bool, ContainerError> {
        Ok(self.delete_where(|r| r.ptr_eq(reference))? > 0)
    }

    /// Remove the entries for which `predicate` holds, in order. The
    /// predicate runs under the lock and must not touch this container.
    pub fn delete_where<P: FnMut(&Reference) -> bool>(
        &self,
        mut predicate: P,
    ) -> Result<usize, ContainerError> {
        let mut items = self.lock()?;
        let before = items.len();
        items.retain(|r| !predicate(r));
        Ok(before - items.len())
    }

    /// Remove the node named by the dotted `path` from its parent.
    pub fn delete_path(&self, path: &str) -> Result<(), ContainerError> {
        let (parent_path, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, path),
        };
        let parent = match parent_path {
            Some(p) => self
                .find_path(p)?
                .ok_or_else(|| ContainerError::PathNotFound(path.to_string()))?,
            None => Reference::default(),
        };
        let container = match parent_path {
            Some(p) => parent
                .as_container()
                .ok_or_else(|| ContainerError::NotAContainer(p.to_string()))?,
            None => self,
        };
        let mut removed = false;
        let mut items = container.lock()?;
        if let Some(pos) = items.iter().position(|r| r.name() == Some(leaf)) {
            items.remove(pos);
            removed = true;
        }
        drop(items);
        if removed {
            Ok(())
        } else {
            Err(ContainerError::PathNotFound(path.to_string()))
        }
    }

    /// Snapshot of the entry at `index`.
    pub fn get(&self, index: usize) -> Option<Reference> {
        match self.lock() {
            Ok(items) => items.get(index).cloned(),
            Err(e) => {
                log::error!("{}: get({}) failed: {}", self.name, index, e);
                None
            }
        }
    }

    pub fn size(&self) -> usize {
        match self.lock() {
            Ok(items) => items.len(),
            Err(e) => {
                log::error!("{}: size() failed: {}", self.name, e);
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Direct child with the given name.
    fn child(&self, name: &str) -> Result<Option<Reference>, ContainerError> {
        Ok(self.lock()?.iter().find(|r| r.name() == Some(name)).cloned())
    }

    /// Resolve a dotted path level by level.
    pub fn find_path(&self, path: &str) -> Result<Option<Reference>, ContainerError> {
        let mut current: Option<Reference> = None;
        for token in path.split('.').filter(|t| !t.is_empty()) {
            let level = match &current {
                None => self,
                Some(r) => match r.as_container() {
                    Some(c) => c,
                    None => return Ok(None),
                },
            };
            match level.child(token)? {
                Some(child) => current = Some(child),
                None => return Ok(None),
            }
        }
        Ok(current)
    }

    /// First match by name anywhere below this container.
    pub fn find_by_name(&self, name: &str) -> Result<Option<Reference>, ContainerError> {
        let filter = ByName::new(name);
        let mut search = Search::new(&filter, 1, SearchMode::RECURSIVE);
        Ok(self.find(&mut search)?.pop())
    }

    /// Run `search` from this container.
    ///
    /// With `PATH` the result holds the containers leading to the requested
    /// match followed by the match itself. A flat list cannot tell several
    /// such paths apart, so `PATH` needs a positive occurrence; use
    /// [`find_paths`](Self::find_paths) to collect every match.
    pub fn find(&self, search: &mut Search<'_>) -> Result<Vec<Reference>, ContainerError> {
        if search.mode.contains(SearchMode::PATH) && search.search_all() {
            return Err(ContainerError::AmbiguousPath);
        }
        Ok(self.walk(search)?.into_iter().flatten().collect())
    }

    /// Run `search` and return one path per match: the containers leading
    /// to it followed by the match. Implies `PATH`.
    pub fn find_paths(&self, search: &mut Search<'_>) -> Result<Vec<Vec<Reference>>, ContainerError> {
        search.mode = search.mode | SearchMode::PATH;
        self.walk(search)
    }

    fn walk(&self, search: &mut Search<'_>) -> Result<Vec<Vec<Reference>>, ContainerError> {
        let mut hits = Vec::new();
        let mut path = Vec::new();
        let mut ancestors = vec![self.key()];
        self.find_level(search, &mut hits, &mut path, &mut ancestors, 1)?;
        Ok(hits)
    }

    fn find_level(
        &self,
        search: &mut Search<'_>,
        hits: &mut Vec<Vec<Reference>>,
        path: &mut Vec<Reference>,
        ancestors: &mut Vec<usize>,
        depth: usize,
    ) -> Result<(), ContainerError> {
        let mut items = self.snapshot()?;
        if search.mode.contains(SearchMode::REVERSE) {
            items.reverse();
        }
        let store_path = search.mode.contains(SearchMode::PATH);

        for candidate in items {
            if search.filter.test(&candidate) {
                search.found += 1;
                if search.search_all() || search.is_finished() {
                    if search.mode.contains(SearchMode::REMOVE) {
                        self.remove_exact(&candidate)?;
                    }
                    let mut hit = if store_path { path.clone() } else { Vec::with_capacity(1) };
                    hit.push(candidate.clone());
                    hits.push(hit);
                }
            }
            if search.is_finished() {
                break;
            }

            let descend = search.mode.contains(SearchMode::RECURSIVE) && depth < search.max_depth;
            if let (true, Some(child)) = (descend, candidate.as_container()) {
                let key = child.key();
                if ancestors.contains(&key) {
                    continue;
                }
                ancestors.push(key);
                path.push(candidate.clone());
                let outcome = child.find_level(search, hits, path, ancestors, depth + 1);
                path.pop();
                ancestors.pop();
                outcome?;
                if search.is_finished() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn remove_exact(&self, reference: &Reference) -> Result<(), ContainerError> {
        let mut items = self.lock()?;
        if let Some(pos) = items.iter().position(|r| r.ptr_eq(reference)) {
            items.remove(pos);
        }
        Ok(())
    }

    /// Empty this container and, recursively, every container below it.
    /// Ancestors are skipped, so reference cycles are released.
    pub fn purge(&self) {
        let mut ancestors = vec![self.key()];
        self.purge_level(&mut ancestors);
    }

    fn purge_level(&self, ancestors: &mut Vec<usize>) {
        let items = match self.lock() {
            Ok(mut items) => std::mem::take(&mut *items),
            Err(e) => {
                log::error!("{}: purge failed: {}", self.name, e);
                return;
            }
        };
        for item in &items {
            if let Some(child) = item.as_container() {
                let key = child.key();
                if !ancestors.contains(&key) {
                    ancestors.push(key);
                    child.purge_level(ancestors);
                    ancestors.pop();
                }
            }
        }
    }
}

impl Object for ReferenceContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        "ReferenceContainer"
    }

    fn as_container(&self) -> Option<&ReferenceContainer> {
        Some(self)
    }
}

impl std::fmt::Debug for ReferenceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceContainer")
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}
