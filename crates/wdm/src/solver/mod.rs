// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graph solvers: turn dirty property paths into packed DataElements.
//!
//! A solver tracks which property paths of which trait instances changed
//! since the subscriber last saw them, and on retrieval computes the
//! smallest TLV-encodable element covering them. Two variants share the
//! [`GraphSolver`] interface and are selected at engine construction:
//!
//! - [`BasicGraphSolver`](basic::BasicGraphSolver) tracks a single dirty
//!   bit per trait instance and always re-emits the whole instance.
//! - [`IntermediateGraphSolver`](intermediate::IntermediateGraphSolver)
//!   tracks individual paths in a bounded store and emits the lowest
//!   common ancestor of the dirty set with a merge set naming only the
//!   dirty children.
//!
//! Degradations never lose dirtiness: a full dirty store collapses the
//! trait to whole-instance dirty, a full merge set widens the element to
//! the whole LCA subtree, and an element that outgrows the message chunks
//! dictionary items across messages via an explicit [`DictionaryCursor`].

pub mod basic;
pub mod intermediate;

pub use basic::BasicGraphSolver;
pub use intermediate::IntermediateGraphSolver;

use crate::catalog::{TraitCatalog, TraitDataSource};
use crate::config::MAX_MERGE_HANDLES;
use crate::error::{Error, Result};
use crate::notify::NotifyRequestBuilder;
use crate::path::{TraitPath, TraitPathStore};
use crate::schema::{
    PropertyPathHandle, TraitDataHandle, TraitSchemaEngine, NULL_PROPERTY_PATH_HANDLE,
    ROOT_PROPERTY_PATH_HANDLE,
};
use crate::tlv::{Tag, TlvWriter};

/// Solver variant selector (engine construction time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Basic,
    Intermediate,
}

/// Build a solver of the requested kind.
pub fn new_solver(kind: SolverKind) -> Box<dyn GraphSolver> {
    match kind {
        SolverKind::Basic => Box::new(BasicGraphSolver::new()),
        SolverKind::Intermediate => Box::new(IntermediateGraphSolver::new()),
    }
}

/// What kind of element a chunk continuation re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Full-subtree element; the walk skips ahead to the dictionary and
    /// continues through the rest of the subtree afterwards.
    Walk,
    /// Dictionary written under its parent path (replace form).
    ReplaceDictionary,
    /// Dictionary written at its own path (item-wise merge form).
    MergeDictionary,
}

/// Resumption point for a dictionary that did not fit in one message.
///
/// Returned by a retrieval that wrote only a prefix of a dictionary's
/// items; the engine holds it and passes it back into the next retrieval
/// for the same trait. `last_key` is the last item key that made it into
/// the message (`None` when no item fit yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryCursor {
    pub kind: ChunkKind,
    /// Path of the element being chunked.
    pub element_path: PropertyPathHandle,
    /// The dictionary whose items are being resumed.
    pub dictionary: PropertyPathHandle,
    /// Last item key successfully written across all chunks so far.
    pub last_key: Option<u16>,
}

/// Outcome of one `retrieve_trait_instance_data` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retrieval {
    /// A DataElement was committed to the message.
    pub element_written: bool,
    /// The element was cut at a dictionary; pass this back in to resume.
    pub more: Option<DictionaryCursor>,
}

impl Retrieval {
    pub const fn done(element_written: bool) -> Self {
        Self {
            element_written,
            more: None,
        }
    }
}

/// Bounded set of children-of-LCA handles named in a merge element.
#[derive(Debug, Clone, Copy)]
pub struct MergeHandleSet {
    handles: [PropertyPathHandle; MAX_MERGE_HANDLES],
    len: usize,
}

impl MergeHandleSet {
    pub const fn new() -> Self {
        Self {
            handles: [NULL_PROPERTY_PATH_HANDLE; MAX_MERGE_HANDLES],
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[PropertyPathHandle] {
        &self.handles[..self.len]
    }

    /// Add a handle, ignoring duplicates; `MergeSetFull` when capacity is
    /// reached.
    pub fn push(&mut self, handle: PropertyPathHandle) -> Result<()> {
        if self.handles[..self.len].contains(&handle) {
            return Ok(());
        }
        if self.len == MAX_MERGE_HANDLES {
            return Err(Error::MergeSetFull);
        }
        self.handles[self.len] = handle;
        self.len += 1;
        Ok(())
    }
}

impl Default for MergeHandleSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Dirty-to-wire solver interface.
///
/// All operations are synchronous and bounded; the engine serializes
/// calls (single-threaded model).
pub trait GraphSolver {
    /// Start tracking a trait instance.
    fn add_trait(&mut self, handle: TraitDataHandle) -> Result<()>;

    /// Stop tracking a trait instance, dropping its dirty state.
    fn remove_trait(&mut self, handle: TraitDataHandle);

    /// Record that a property path changed. Never drops the mark: bounded
    /// storage degrades to whole-instance dirtiness instead.
    fn set_dirty(&mut self, path: TraitPath, schema: &dyn TraitSchemaEngine) -> Result<()>;

    /// Does the instance have pending dirty data?
    fn is_dirty(&self, handle: TraitDataHandle) -> bool;

    /// Drop all dirty state (next round starts clean).
    fn clear_dirty(&mut self);

    /// Drop one instance's dirty state.
    fn clear_trait_dirty(&mut self, handle: TraitDataHandle);

    /// Write at most one DataElement covering (part of) the instance's
    /// dirty data into `builder`.
    ///
    /// With `retrieve_all`, the whole instance is emitted regardless of
    /// dirty state. `resume` continues a chunked dictionary. Paths whose
    /// data was fully committed move from the dirty store into `sent`
    /// (the caller's in-flight list); a chunked element keeps its paths
    /// dirty until the final chunk.
    fn retrieve_trait_instance_data(
        &mut self,
        builder: &mut NotifyRequestBuilder<'_>,
        handle: TraitDataHandle,
        catalog: &dyn TraitCatalog,
        retrieve_all: bool,
        resume: Option<DictionaryCursor>,
        sent: &mut TraitPathStore,
    ) -> Result<Retrieval>;
}

/// Record a sent path in the caller's in-flight store, degrading to the
/// trait root when the store is full (consistent with every other
/// capacity fallback: coarser, never lost).
pub(crate) fn note_sent(
    sent: &mut TraitPathStore,
    path: TraitPath,
    schema: &dyn TraitSchemaEngine,
) {
    if sent.add_item_dedup(path, schema).is_err() {
        log::warn!(
            "[solver] in-flight store full, coarsening trait {} to root",
            path.trait_handle
        );
        sent.remove_trait(path.trait_handle);
        let root = TraitPath::new(path.trait_handle, ROOT_PROPERTY_PATH_HANDLE);
        // After removing the trait's records a slot may still be missing;
        // dropping other traits' records is never acceptable, so fall back
        // to a plain add and accept the duplicate-free invariant holding
        // only per trait.
        if sent.add_item_dedup(root, schema).is_err() {
            let _ = sent.add_item(root, crate::path::PathFlags::empty());
        }
    }
}

/// Nearest ancestor-or-self of `path` that is a dictionary.
pub(crate) fn dictionary_root(
    schema: &dyn TraitSchemaEngine,
    path: PropertyPathHandle,
) -> Option<PropertyPathHandle> {
    let mut cur = path;
    while !cur.is_null() {
        if schema.is_dictionary(cur) {
            return Some(cur);
        }
        cur = schema.parent(cur);
    }
    None
}

/// Walk state for chunk resumption: skip everything until the target
/// dictionary is reached, then write normally.
pub(crate) struct WalkResume {
    target: Option<(PropertyPathHandle, Option<u16>)>,
}

impl WalkResume {
    pub(crate) fn none() -> Self {
        Self { target: None }
    }

    pub(crate) fn at(dictionary: PropertyPathHandle, last_key: Option<u16>) -> Self {
        Self {
            target: Some((dictionary, last_key)),
        }
    }

    fn skipping(&self) -> bool {
        self.target.is_some()
    }

    fn on_path_to_target(&self, schema: &dyn TraitSchemaEngine, node: PropertyPathHandle) -> bool {
        match self.target {
            Some((dict, _)) => node == dict || schema.is_parent(node, dict),
            None => true,
        }
    }
}

/// Encode the value subtree at `path` under `tag`.
///
/// Returns `Some((dictionary, last_key))` when a dictionary below `path`
/// only partially fit: the containers written so far are closed and the
/// element stays well-formed. `Err(BufferTooSmall)` means nothing of the
/// current node could be committed; the caller rolls the element back.
pub(crate) fn encode_subtree(
    writer: &mut TlvWriter<'_>,
    schema: &dyn TraitSchemaEngine,
    source: &dyn TraitDataSource,
    path: PropertyPathHandle,
    tag: Tag,
    resume: &mut WalkResume,
) -> Result<Option<(PropertyPathHandle, Option<u16>)>> {
    if schema.is_dictionary(path) {
        let start_after = match resume.target {
            Some((dict, last_key)) if dict == path => {
                resume.target = None;
                last_key
            }
            Some(_) => return Ok(None), // not the dictionary being resumed
            None => None,
        };
        return encode_dictionary(writer, schema, source, path, tag, start_after, None);
    }

    if schema.is_leaf(path) {
        if resume.skipping() {
            return Ok(None); // already delivered in an earlier chunk
        }
        source.read_leaf(path, tag, writer)?;
        return Ok(None);
    }

    if resume.skipping() && !resume.on_path_to_target(schema, path) {
        return Ok(None);
    }

    writer.start_structure(tag)?;
    let mut child = schema.first_child(path);
    while !child.is_null() {
        let descend = if resume.skipping() {
            resume.on_path_to_target(schema, child)
        } else {
            source.exists(child)
        };
        if descend {
            if let Some(cursor) =
                encode_subtree(writer, schema, source, child, schema.tag(child), resume)?
            {
                writer.end_container()?;
                return Ok(Some(cursor));
            }
        }
        child = schema.next_child(child);
    }
    writer.end_container()?;
    Ok(None)
}

/// Encode dictionary items under `tag`, ascending by key, starting after
/// `start_after`. `filter` restricts emission to the listed keys (item-wise
/// merge); `None` emits every existing item.
///
/// On overflow the items written so far are kept, the container is closed,
/// and the resumption point is returned. Overflow before any item was
/// written in this call surfaces as the same resumption point the caller
/// passed in, letting it detect lack of progress.
pub(crate) fn encode_dictionary(
    writer: &mut TlvWriter<'_>,
    schema: &dyn TraitSchemaEngine,
    source: &dyn TraitDataSource,
    dictionary: PropertyPathHandle,
    tag: Tag,
    start_after: Option<u16>,
    filter: Option<&[u16]>,
) -> Result<Option<(PropertyPathHandle, Option<u16>)>> {
    let item_schema = schema.first_child(dictionary);
    writer.start_structure(tag)?;
    if item_schema.is_null() {
        writer.end_container()?;
        return Ok(None);
    }

    let mut last_written = start_after;
    let mut next = source.next_dictionary_key(dictionary, start_after);
    while let Some(key) = next {
        if filter.is_none_or(|keys| keys.contains(&key)) {
            let item = PropertyPathHandle::with_key(item_schema.schema_handle(), key);
            let cp = writer.checkpoint();
            let mut no_resume = WalkResume::none();
            match encode_subtree(
                writer,
                schema,
                source,
                item,
                Tag::for_dictionary_key(key),
                &mut no_resume,
            ) {
                Ok(None) => last_written = Some(key),
                // One dictionary key half per path: nested dictionaries
                // cannot occur in a valid schema.
                Ok(Some(_)) => return Err(Error::SchemaMismatch),
                Err(Error::BufferTooSmall) => {
                    writer.rollback(cp)?;
                    writer.end_container()?;
                    return Ok(Some((dictionary, last_written)));
                }
                Err(err) => return Err(err),
            }
        }
        next = source.next_dictionary_key(dictionary, Some(key));
    }
    writer.end_container()?;
    Ok(None)
}
