// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Intermediate graph solver: per-path dirty tracking with LCA diffing.
//!
//! Dirty paths live in a bounded per-trait store with ancestor-collapsing
//! dedup. Retrieval picks one coherent group of dirty paths and emits one
//! DataElement for it:
//!
//! - paths under a common dictionary become an item-wise merge (or a
//!   dictionary replace when the dictionary node itself is dirty);
//! - other paths collapse to their lowest common ancestor, with a merge
//!   set naming only the dirty children of the LCA.
//!
//! Every capacity limit degrades toward more data, never less: a full
//! dirty store marks the whole instance dirty, a full merge set widens to
//! the whole LCA subtree, and an oversized dictionary chunks across
//! messages via [`DictionaryCursor`].

use super::{
    dictionary_root, encode_dictionary, encode_subtree, note_sent, ChunkKind, DictionaryCursor,
    GraphSolver, MergeHandleSet, Retrieval, WalkResume,
};
use crate::catalog::{TraitCatalog, TraitDataSource, TraitLocator};
use crate::config::{MAX_DIRTY_PATHS, MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION};
use crate::error::{Error, Result};
use crate::notify::NotifyRequestBuilder;
use crate::path::{TraitPath, TraitPathStore};
use crate::schema::{
    PropertyPathHandle, TraitDataHandle, TraitSchemaEngine, NULL_PROPERTY_PATH_HANDLE,
    ROOT_PROPERTY_PATH_HANDLE,
};

struct TraitDirty {
    handle: TraitDataHandle,
    store: TraitPathStore,
}

/// One element's worth of work: what to emit and which dirty paths it
/// covers.
enum Plan {
    Subtree(PropertyPathHandle),
    Merge {
        lca: PropertyPathHandle,
        set: MergeHandleSet,
    },
    ReplaceDictionary(PropertyPathHandle),
    MergeDictionary {
        dictionary: PropertyPathHandle,
        keys: [u16; MAX_DIRTY_PATHS],
        num_keys: usize,
    },
}

/// LCA-diffing solver with bounded per-trait dirty stores.
pub struct IntermediateGraphSolver {
    traits: Vec<TraitDirty>,
}

impl IntermediateGraphSolver {
    pub fn new() -> Self {
        Self {
            traits: Vec::with_capacity(MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION),
        }
    }

    fn slot(&self, handle: TraitDataHandle) -> Option<&TraitDirty> {
        self.traits.iter().find(|s| s.handle == handle)
    }

    fn slot_mut(&mut self, handle: TraitDataHandle) -> Option<&mut TraitDirty> {
        self.traits.iter_mut().find(|s| s.handle == handle)
    }

    /// Dirty paths for one trait, front-compacted into a fixed array.
    fn dirty_paths(
        &self,
        handle: TraitDataHandle,
    ) -> ([PropertyPathHandle; MAX_DIRTY_PATHS], usize) {
        let mut paths = [NULL_PROPERTY_PATH_HANDLE; MAX_DIRTY_PATHS];
        let mut n = 0;
        if let Some(slot) = self.slot(handle) {
            let mut idx = slot.store.first_valid_item();
            while let Some(i) = idx {
                if let Some(tp) = slot.store.item(i) {
                    paths[n] = tp.path;
                    n += 1;
                }
                idx = slot.store.next_valid_item(i);
            }
        }
        (paths, n)
    }

    /// Pick the next element to emit for `handle`.
    ///
    /// The group containing the oldest dirty path goes first; remaining
    /// groups stay dirty for subsequent calls.
    fn plan(
        &self,
        handle: TraitDataHandle,
        schema: &dyn TraitSchemaEngine,
    ) -> Option<(Plan, [PropertyPathHandle; MAX_DIRTY_PATHS], usize)> {
        let (paths, n) = self.dirty_paths(handle);
        if n == 0 {
            return None;
        }

        let mut covered = [NULL_PROPERTY_PATH_HANDLE; MAX_DIRTY_PATHS];
        let mut num_covered = 0;

        if let Some(dict) = dictionary_root(schema, paths[0]) {
            // Dictionary group: everything at or under the same dictionary.
            let mut keys = [0u16; MAX_DIRTY_PATHS];
            let mut num_keys = 0;
            let mut whole_dictionary = false;
            for &p in &paths[..n] {
                if dictionary_root(schema, p) != Some(dict) {
                    continue;
                }
                covered[num_covered] = p;
                num_covered += 1;
                if p == dict {
                    whole_dictionary = true;
                } else if !keys[..num_keys].contains(&p.dictionary_key()) {
                    keys[num_keys] = p.dictionary_key();
                    num_keys += 1;
                }
            }
            let plan = if whole_dictionary {
                Plan::ReplaceDictionary(dict)
            } else {
                Plan::MergeDictionary {
                    dictionary: dict,
                    keys,
                    num_keys,
                }
            };
            return Some((plan, covered, num_covered));
        }

        // Tree group: every path outside any dictionary.
        let mut lca = NULL_PROPERTY_PATH_HANDLE;
        for &p in &paths[..n] {
            if dictionary_root(schema, p).is_some() {
                continue;
            }
            covered[num_covered] = p;
            num_covered += 1;
            lca = schema.lowest_common_ancestor(lca, p);
        }

        if num_covered == 1 || covered[..num_covered].contains(&lca) {
            // A single path, or one dirty path covering all others.
            return Some((Plan::Subtree(lca), covered, num_covered));
        }

        let mut set = MergeHandleSet::new();
        for &p in &covered[..num_covered] {
            let child = child_towards(schema, lca, p);
            if set.push(child).is_err() {
                // More discontiguous dirty children than the set can name:
                // widen to the whole LCA subtree.
                log::warn!(
                    "[solver] merge set full for trait {handle}, widening to whole subtree"
                );
                return Some((Plan::Subtree(lca), covered, num_covered));
            }
        }
        Some((Plan::Merge { lca, set }, covered, num_covered))
    }

    /// Remove `covered` paths from the dirty store and record them as sent.
    fn drain_covered(
        &mut self,
        handle: TraitDataHandle,
        covered: &[PropertyPathHandle],
        schema: &dyn TraitSchemaEngine,
        sent: &mut TraitPathStore,
    ) {
        if let Some(slot) = self.slot_mut(handle) {
            for &p in covered {
                slot.store.remove_item(TraitPath::new(handle, p));
            }
        }
        for &p in covered {
            note_sent(sent, TraitPath::new(handle, p), schema);
        }
    }

    /// Remove every dirty path at or under `ancestor` and record the
    /// ancestor itself as sent.
    fn drain_subtree(
        &mut self,
        handle: TraitDataHandle,
        ancestor: PropertyPathHandle,
        schema: &dyn TraitSchemaEngine,
        sent: &mut TraitPathStore,
    ) {
        if let Some(slot) = self.slot_mut(handle) {
            let mut idx = slot.store.first_valid_item();
            while let Some(i) = idx {
                let next = slot.store.next_valid_item(i);
                if let Some(tp) = slot.store.item(i) {
                    if tp.path == ancestor || schema.is_parent(ancestor, tp.path) {
                        slot.store.remove_item_at(i);
                    }
                }
                idx = next;
            }
        }
        note_sent(sent, TraitPath::new(handle, ancestor), schema);
    }

    fn whole_instance_dirty(&self, handle: TraitDataHandle) -> bool {
        self.slot(handle)
            .is_some_and(|s| s.store.is_present(TraitPath::new(handle, ROOT_PROPERTY_PATH_HANDLE)))
    }

    /// Emit the whole instance from the root (establishment, whole-dirty
    /// fallback, or a Walk-chunk continuation).
    #[allow(clippy::too_many_arguments)]
    fn emit_subtree(
        builder: &mut NotifyRequestBuilder<'_>,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        source: &dyn TraitDataSource,
        element_path: PropertyPathHandle,
        resume: Option<DictionaryCursor>,
    ) -> Result<Option<DictionaryCursor>> {
        let mut walk = match resume {
            Some(cursor) => WalkResume::at(cursor.dictionary, cursor.last_key),
            None => WalkResume::none(),
        };
        builder.write_data_element(
            locator,
            schema,
            element_path,
            source.version(),
            &[],
            |w, tag| {
                let cut = encode_subtree(w, schema, source, element_path, tag, &mut walk)?;
                Ok(cut.map(|(dictionary, last_key)| DictionaryCursor {
                    kind: ChunkKind::Walk,
                    element_path,
                    dictionary,
                    last_key,
                }))
            },
        )
    }

    fn emit_merge(
        builder: &mut NotifyRequestBuilder<'_>,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        source: &dyn TraitDataSource,
        lca: PropertyPathHandle,
        set: &MergeHandleSet,
    ) -> Result<Option<DictionaryCursor>> {
        builder.write_data_element(
            locator,
            schema,
            lca,
            source.version(),
            &[],
            |w, tag| {
                w.start_structure(tag)?;
                for &child in set.as_slice() {
                    if !source.exists(child) {
                        continue;
                    }
                    let mut walk = WalkResume::none();
                    if let Some((dictionary, last_key)) =
                        encode_subtree(w, schema, source, child, schema.tag(child), &mut walk)?
                    {
                        w.end_container()?;
                        return Ok(Some(DictionaryCursor {
                            kind: ChunkKind::Walk,
                            element_path: lca,
                            dictionary,
                            last_key,
                        }));
                    }
                }
                w.end_container()?;
                Ok(None)
            },
        )
    }

    fn emit_dictionary_replace(
        builder: &mut NotifyRequestBuilder<'_>,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        source: &dyn TraitDataSource,
        dictionary: PropertyPathHandle,
        start_after: Option<u16>,
    ) -> Result<Option<DictionaryCursor>> {
        // Replacing a dictionary drops the trailing tag from the path: the
        // element addresses the parent and nests the dictionary under its
        // own tag, so the parent-level merge assigns it wholesale.
        let element_path = schema.parent(dictionary);
        builder.write_data_element(
            locator,
            schema,
            element_path,
            source.version(),
            &[],
            |w, tag| {
                w.start_structure(tag)?;
                let cut = encode_dictionary(
                    w,
                    schema,
                    source,
                    dictionary,
                    schema.tag(dictionary),
                    start_after,
                    None,
                )?;
                w.end_container()?;
                Ok(cut.map(|(dict, last_key)| DictionaryCursor {
                    kind: ChunkKind::ReplaceDictionary,
                    element_path,
                    dictionary: dict,
                    last_key,
                }))
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_dictionary_merge(
        builder: &mut NotifyRequestBuilder<'_>,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        source: &dyn TraitDataSource,
        dictionary: PropertyPathHandle,
        keys: &[u16],
        start_after: Option<u16>,
    ) -> Result<Option<DictionaryCursor>> {
        // Items marked dirty but no longer present go out as deletions.
        let item_schema = schema.first_child(dictionary);
        let mut deleted = [0u16; MAX_DIRTY_PATHS];
        let mut live = [0u16; MAX_DIRTY_PATHS];
        let (mut num_deleted, mut num_live) = (0, 0);
        for &key in keys {
            let item = PropertyPathHandle::with_key(item_schema.schema_handle(), key);
            if source.exists(item) {
                live[num_live] = key;
                num_live += 1;
            } else {
                deleted[num_deleted] = key;
                num_deleted += 1;
            }
        }

        builder.write_data_element(
            locator,
            schema,
            dictionary,
            source.version(),
            &deleted[..num_deleted],
            |w, tag| {
                let cut = encode_dictionary(
                    w,
                    schema,
                    source,
                    dictionary,
                    tag,
                    start_after,
                    Some(&live[..num_live]),
                )?;
                Ok(cut.map(|(dict, last_key)| DictionaryCursor {
                    kind: ChunkKind::MergeDictionary,
                    element_path: dictionary,
                    dictionary: dict,
                    last_key,
                }))
            },
        )
    }

    /// Continue a chunked element where the previous message stopped.
    #[allow(clippy::too_many_arguments)]
    fn resume_chunk(
        &mut self,
        builder: &mut NotifyRequestBuilder<'_>,
        handle: TraitDataHandle,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        source: &dyn TraitDataSource,
        cursor: DictionaryCursor,
        sent: &mut TraitPathStore,
    ) -> Result<Retrieval> {
        let more = match cursor.kind {
            ChunkKind::Walk => Self::emit_subtree(
                builder,
                locator,
                schema,
                source,
                cursor.element_path,
                Some(cursor),
            )?,
            ChunkKind::ReplaceDictionary => Self::emit_dictionary_replace(
                builder,
                locator,
                schema,
                source,
                cursor.dictionary,
                cursor.last_key,
            )?,
            ChunkKind::MergeDictionary => {
                let (paths, n) = self.dirty_paths(handle);
                let mut keys = [0u16; MAX_DIRTY_PATHS];
                let mut num_keys = 0;
                for &p in &paths[..n] {
                    if dictionary_root(schema, p) == Some(cursor.dictionary)
                        && !keys[..num_keys].contains(&p.dictionary_key())
                    {
                        keys[num_keys] = p.dictionary_key();
                        num_keys += 1;
                    }
                }
                Self::emit_dictionary_merge(
                    builder,
                    locator,
                    schema,
                    source,
                    cursor.dictionary,
                    &keys[..num_keys],
                    cursor.last_key,
                )?
            }
        };

        if more.is_none() {
            match cursor.kind {
                ChunkKind::Walk => {
                    self.drain_subtree(handle, cursor.element_path, schema, sent);
                }
                ChunkKind::ReplaceDictionary | ChunkKind::MergeDictionary => {
                    self.drain_subtree(handle, cursor.dictionary, schema, sent);
                }
            }
        }
        Ok(Retrieval {
            element_written: true,
            more,
        })
    }
}

impl Default for IntermediateGraphSolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The child of `lca` on the path down to `descendant`.
fn child_towards(
    schema: &dyn TraitSchemaEngine,
    lca: PropertyPathHandle,
    descendant: PropertyPathHandle,
) -> PropertyPathHandle {
    let mut cur = descendant;
    loop {
        let parent = schema.parent(cur);
        if parent == lca || parent.is_null() {
            return cur;
        }
        cur = parent;
    }
}

impl GraphSolver for IntermediateGraphSolver {
    fn add_trait(&mut self, handle: TraitDataHandle) -> Result<()> {
        if self.traits.iter().any(|s| s.handle == handle) {
            return Err(Error::InvalidArgument);
        }
        if self.traits.len() == MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION {
            return Err(Error::PathStoreFull);
        }
        self.traits.push(TraitDirty {
            handle,
            store: TraitPathStore::with_capacity(MAX_DIRTY_PATHS),
        });
        Ok(())
    }

    fn remove_trait(&mut self, handle: TraitDataHandle) {
        self.traits.retain(|s| s.handle != handle);
    }

    fn set_dirty(&mut self, path: TraitPath, schema: &dyn TraitSchemaEngine) -> Result<()> {
        let handle = path.trait_handle;
        let slot = self.slot_mut(handle).ok_or(Error::UnknownTraitHandle)?;
        match slot.store.add_item_dedup(path, schema) {
            Ok(()) => Ok(()),
            Err(Error::PathStoreFull) => {
                // Bounded store: collapse to whole-instance dirtiness
                // rather than dropping the mark.
                log::warn!(
                    "[solver] dirty store full, marking trait {handle} whole-instance dirty"
                );
                slot.store
                    .add_item_dedup(TraitPath::new(handle, ROOT_PROPERTY_PATH_HANDLE), schema)
            }
            Err(err) => Err(err),
        }
    }

    fn is_dirty(&self, handle: TraitDataHandle) -> bool {
        self.slot(handle)
            .is_some_and(|s| s.store.first_valid_item_for(handle).is_some())
    }

    fn clear_dirty(&mut self) {
        for slot in &mut self.traits {
            slot.store.clear();
        }
    }

    fn clear_trait_dirty(&mut self, handle: TraitDataHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.store.clear();
        }
    }

    fn retrieve_trait_instance_data(
        &mut self,
        builder: &mut NotifyRequestBuilder<'_>,
        handle: TraitDataHandle,
        catalog: &dyn TraitCatalog,
        retrieve_all: bool,
        resume: Option<DictionaryCursor>,
        sent: &mut TraitPathStore,
    ) -> Result<Retrieval> {
        let schema = catalog.schema_or_err(handle)?;
        let source = catalog.source_or_err(handle)?;
        let locator = catalog.locator_or_err(handle)?;

        if let Some(cursor) = resume {
            return self.resume_chunk(builder, handle, &locator, schema, source, cursor, sent);
        }

        if retrieve_all || self.whole_instance_dirty(handle) {
            let more = Self::emit_subtree(
                builder,
                &locator,
                schema,
                source,
                ROOT_PROPERTY_PATH_HANDLE,
                None,
            )?;
            if more.is_none() {
                self.drain_subtree(handle, ROOT_PROPERTY_PATH_HANDLE, schema, sent);
            }
            return Ok(Retrieval {
                element_written: true,
                more,
            });
        }

        let Some((plan, covered, num_covered)) = self.plan(handle, schema) else {
            return Ok(Retrieval::done(false));
        };

        let more = match &plan {
            Plan::Subtree(path) => {
                Self::emit_subtree(builder, &locator, schema, source, *path, None)?
            }
            Plan::Merge { lca, set } => {
                Self::emit_merge(builder, &locator, schema, source, *lca, set)?
            }
            Plan::ReplaceDictionary(dict) => {
                Self::emit_dictionary_replace(builder, &locator, schema, source, *dict, None)?
            }
            Plan::MergeDictionary {
                dictionary,
                keys,
                num_keys,
            } => Self::emit_dictionary_merge(
                builder,
                &locator,
                schema,
                source,
                *dictionary,
                &keys[..*num_keys],
                None,
            )?,
        };

        if more.is_none() {
            match plan {
                Plan::Subtree(path) => self.drain_subtree(handle, path, schema, sent),
                _ => self.drain_covered(handle, &covered[..num_covered], schema, sent),
            }
        }
        Ok(Retrieval {
            element_written: true,
            more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::testutil::TestCatalog;
    use crate::config::{MAX_DIRTY_PATHS, MAX_MERGE_HANDLES};
    use crate::notify::{NotifyRequestBuilder, TAG_ELEMENT_DATA, TAG_ELEMENT_PATH};
    use crate::schema::testutil::*;
    use crate::tlv::{Tag, TlvElement, TlvReader};

    const T: TraitDataHandle = 1;

    fn dirty(solver: &mut IntermediateGraphSolver, path: PropertyPathHandle) {
        let schema = test_schema();
        solver
            .set_dirty(TraitPath::new(T, path), &schema)
            .expect("set_dirty");
    }

    /// Decode the first DataElement: (path tags, data child tags at the
    /// first nesting level inside Data).
    fn decode_first_element(buf: &[u8]) -> (Vec<Tag>, Vec<Tag>) {
        let mut r = TlvReader::new(buf);
        let mut path_tags = Vec::new();
        let mut data_tags = Vec::new();
        let mut in_path = false;
        let mut data_depth = None;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            match elem {
                TlvElement::PathStart if tag == Tag::Context(TAG_ELEMENT_PATH) => in_path = true,
                TlvElement::ContainerEnd if in_path => in_path = false,
                TlvElement::Null if in_path => path_tags.push(tag),
                // Data struct sits directly inside the DataElement:
                // outer(1) / DataList(2) / DataElement(3) / Data(4).
                TlvElement::StructureStart
                    if tag == Tag::Context(TAG_ELEMENT_DATA)
                        && r.depth() == 4
                        && data_depth.is_none() =>
                {
                    data_depth = Some(r.depth());
                }
                _ => {
                    if let Some(d) = data_depth {
                        match elem {
                            TlvElement::ContainerEnd if r.depth() < d => data_depth = None,
                            TlvElement::StructureStart if r.depth() == d + 1 => data_tags.push(tag),
                            _ if r.depth() == d && elem != TlvElement::ContainerEnd => {
                                data_tags.push(tag);
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        (path_tags, data_tags)
    }

    fn build_one_element(
        solver: &mut IntermediateGraphSolver,
        catalog: &TestCatalog,
        buf: &mut [u8],
        retrieve_all: bool,
        resume: Option<DictionaryCursor>,
    ) -> (Retrieval, usize, TraitPathStore) {
        let mut sent = TraitPathStore::with_capacity(MAX_DIRTY_PATHS * 2);
        let mut b = NotifyRequestBuilder::new(buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("list");
        let r = solver
            .retrieve_trait_instance_data(&mut b, T, catalog, retrieve_all, resume, &mut sent)
            .expect("retrieve");
        let len = b.end_notify_request().expect("finalize");
        (r, len, sent)
    }

    #[test]
    fn test_intermediate_lca_of_siblings_with_merge_set() {
        // Scenario: siblings a.b.c and a.b.d dirty -> one element at a.b
        // whose data carries exactly the two dirty children.
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, H_C);
        dirty(&mut solver, H_D);

        let mut buf = [0u8; 512];
        let (r, len, sent) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written);
        assert!(r.more.is_none());

        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        // Path: root -> a -> b
        assert_eq!(path_tags, vec![Tag::Context(1), Tag::Context(1)]);
        // Data: only c (tag 1) and d (tag 2), no other members of b.
        assert_eq!(data_tags, vec![Tag::Context(1), Tag::Context(2)]);

        assert!(!solver.is_dirty(T));
        assert!(sent.is_present(TraitPath::new(T, H_C)));
        assert!(sent.is_present(TraitPath::new(T, H_D)));
    }

    #[test]
    fn test_intermediate_covering_ancestor_emits_subtree() {
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, H_C);
        dirty(&mut solver, H_B); // collapses c away via dedup

        let mut buf = [0u8; 512];
        let (r, len, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());

        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        assert_eq!(path_tags, vec![Tag::Context(1), Tag::Context(1)]);
        // Full subtree of b: both children present.
        assert_eq!(data_tags, vec![Tag::Context(1), Tag::Context(2)]);
        assert!(!solver.is_dirty(T));
    }

    #[test]
    fn test_intermediate_dirty_store_overflow_degrades_to_root() {
        // Scenario: mark more distinct paths than the store holds; the
        // trait collapses to whole-instance dirty and retrieval emits the
        // root element, not an error.
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");

        // Pairwise non-overlapping, so dedup cannot free a slot.
        let distinct = [H_C, H_D, H_E, H_F, H_G, H_H, H_I, item_x(1), item_x(2)];
        assert!(distinct.len() > MAX_DIRTY_PATHS);
        for p in distinct {
            dirty(&mut solver, p);
        }
        assert!(solver.whole_instance_dirty(T));

        let mut buf = [0u8; 512];
        let (r, len, sent) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());

        let (path_tags, _) = decode_first_element(&buf[..len]);
        assert!(path_tags.is_empty()); // element addresses the root
        assert!(!solver.is_dirty(T));
        assert!(sent.is_present(TraitPath::new(T, ROOT_PROPERTY_PATH_HANDLE)));
    }

    #[test]
    fn test_intermediate_merge_set_dedups_lca_children() {
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");

        // c and e both route through child `a`; f is its own child.
        for p in [H_C, H_E, H_F] {
            dirty(&mut solver, p);
        }

        let mut buf = [0u8; 1024];
        let (r, len, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());
        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        assert!(path_tags.is_empty()); // LCA is the root
        assert_eq!(data_tags.len(), 2);
        assert!(data_tags.contains(&Tag::Context(1))); // a
        assert!(data_tags.contains(&Tag::Context(4))); // f
    }

    #[test]
    fn test_intermediate_merge_set_overflow_widens_to_subtree() {
        // More distinct dirty children of the LCA than the merge set can
        // name: the element widens to the whole LCA subtree.
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");

        // Children of root toward these: a, f, g, h, i = 5 > 4.
        let paths = [H_C, H_F, H_G, H_H, H_I];
        assert!(paths.len() > MAX_MERGE_HANDLES);
        for p in paths {
            dirty(&mut solver, p);
        }

        let mut buf = [0u8; 1024];
        let (r, len, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());
        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        assert!(path_tags.is_empty());
        // Whole root subtree: a, dict, f, g, h, i all present.
        assert_eq!(data_tags.len(), 6);
        assert!(!solver.is_dirty(T));
    }

    #[test]
    fn test_intermediate_dictionary_merge_items_only() {
        let mut catalog = TestCatalog::with_traits(&[T]);
        catalog.source_mut(T).dict_keys = vec![1, 2, 3];
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, item_x(1));
        dirty(&mut solver, item_y(3));

        let mut buf = [0u8; 512];
        let (r, len, sent) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());

        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        // Path addresses the dictionary itself (merge form).
        assert_eq!(path_tags, vec![Tag::Context(3)]);
        // Items 1 and 3 only; item 2 untouched.
        assert_eq!(data_tags, vec![Tag::Context(1), Tag::Context(3)]);
        assert!(!solver.is_dirty(T));
        assert!(sent.is_present(TraitPath::new(T, item(1))) || sent.is_present(TraitPath::new(T, item_x(1))));
    }

    #[test]
    fn test_intermediate_dictionary_replace_shortens_path() {
        let mut catalog = TestCatalog::with_traits(&[T]);
        catalog.source_mut(T).dict_keys = vec![4, 7];
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, H_DICT);

        let mut buf = [0u8; 512];
        let (r, len, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r.element_written && r.more.is_none());

        let (path_tags, data_tags) = decode_first_element(&buf[..len]);
        // Path stops at the dictionary's parent (the root here)...
        assert!(path_tags.is_empty());
        // ...and the data nests the dictionary under its own tag.
        assert_eq!(data_tags, vec![Tag::Context(3)]);
    }

    #[test]
    fn test_intermediate_deleted_dictionary_item_reported() {
        let mut catalog = TestCatalog::with_traits(&[T]);
        catalog.source_mut(T).dict_keys = vec![2]; // key 5 gone
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, item_x(2));
        dirty(&mut solver, item_x(5));

        let mut buf = [0u8; 512];
        let (_, len, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);

        let mut r = TlvReader::new(&buf[..len]);
        let mut deleted = Vec::new();
        let mut in_deleted = false;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            match elem {
                TlvElement::ArrayStart
                    if tag == Tag::Context(crate::notify::TAG_ELEMENT_DELETED_KEYS) =>
                {
                    in_deleted = true;
                }
                TlvElement::Unsigned(k) if in_deleted => deleted.push(k),
                TlvElement::ContainerEnd if in_deleted => in_deleted = false,
                _ => {}
            }
        }
        assert_eq!(deleted, vec![5]);
    }

    #[test]
    fn test_intermediate_dictionary_chunks_across_messages() {
        // A dictionary too large for one message resumes from the last
        // written key in the next one.
        let mut catalog = TestCatalog::with_traits(&[T]);
        catalog.source_mut(T).dict_keys = vec![1, 2, 3, 4, 5, 6];
        catalog.source_mut(T).leaf_pad = 40; // each item ~90 bytes
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, H_DICT);

        let mut buf = [0u8; 256];
        let (r1, len1, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r1.element_written);
        let cursor = r1.more.expect("chunked");
        assert_eq!(cursor.kind, ChunkKind::ReplaceDictionary);
        let first_last = cursor.last_key.expect("progress in first chunk");
        assert!(first_last >= 1 && first_last < 6);
        assert!(len1 > 0);
        // Dirty marks survive until the final chunk.
        assert!(solver.is_dirty(T));

        // Continue until the cursor drains.
        let mut cursor = Some(cursor);
        let mut rounds = 0;
        while let Some(c) = cursor {
            let mut buf2 = [0u8; 256];
            let (r, _, _) = build_one_element(&mut solver, &catalog, &mut buf2, false, Some(c));
            cursor = r.more;
            rounds += 1;
            assert!(rounds < 10, "chunking must make progress");
        }
        assert!(!solver.is_dirty(T));
    }

    #[test]
    fn test_intermediate_groups_emit_one_element_per_call() {
        // Dictionary dirt and tree dirt go out as separate elements.
        let mut catalog = TestCatalog::with_traits(&[T]);
        catalog.source_mut(T).dict_keys = vec![1];
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");
        dirty(&mut solver, H_C);
        dirty(&mut solver, item_x(1));

        let mut buf = [0u8; 512];
        let (r1, _, _) = build_one_element(&mut solver, &catalog, &mut buf, false, None);
        assert!(r1.element_written && r1.more.is_none());
        assert!(solver.is_dirty(T), "second group still pending");

        let mut buf2 = [0u8; 512];
        let (r2, _, _) = build_one_element(&mut solver, &catalog, &mut buf2, false, None);
        assert!(r2.element_written && r2.more.is_none());
        assert!(!solver.is_dirty(T));

        let mut buf3 = [0u8; 512];
        let (r3, _, _) = build_one_element(&mut solver, &catalog, &mut buf3, false, None);
        assert!(!r3.element_written);
    }

    #[test]
    fn test_intermediate_retrieve_all_emits_root_without_dirty() {
        let catalog = TestCatalog::with_traits(&[T]);
        let mut solver = IntermediateGraphSolver::new();
        solver.add_trait(T).expect("add");

        let mut buf = [0u8; 512];
        let (r, len, sent) = build_one_element(&mut solver, &catalog, &mut buf, true, None);
        assert!(r.element_written && r.more.is_none());
        let (path_tags, _) = decode_first_element(&buf[..len]);
        assert!(path_tags.is_empty());
        assert!(sent.is_present(TraitPath::new(T, ROOT_PROPERTY_PATH_HANDLE)));
    }
}
