// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Basic graph solver: whole-instance dirty granularity.
//!
//! The cheapest correct solver: one dirty bit per trait instance, and every
//! retrieval re-emits the instance from its root. Used where the RAM for
//! per-path tracking is not worth it, and as the shape every degradation
//! path of the intermediate solver collapses to.

use super::{
    encode_subtree, note_sent, ChunkKind, DictionaryCursor, GraphSolver, Retrieval, WalkResume,
};
use crate::catalog::TraitCatalog;
use crate::config::MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION;
use crate::error::{Error, Result};
use crate::notify::NotifyRequestBuilder;
use crate::path::{TraitPath, TraitPathStore};
use crate::schema::{TraitDataHandle, TraitSchemaEngine, ROOT_PROPERTY_PATH_HANDLE};

#[derive(Debug, Clone, Copy)]
struct Slot {
    handle: TraitDataHandle,
    dirty: bool,
}

/// Stateless-diff solver: marks and emits whole trait instances.
pub struct BasicGraphSolver {
    traits: Vec<Slot>,
}

impl BasicGraphSolver {
    pub fn new() -> Self {
        Self {
            traits: Vec::with_capacity(MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION),
        }
    }

    fn slot_mut(&mut self, handle: TraitDataHandle) -> Option<&mut Slot> {
        self.traits.iter_mut().find(|s| s.handle == handle)
    }
}

impl Default for BasicGraphSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphSolver for BasicGraphSolver {
    fn add_trait(&mut self, handle: TraitDataHandle) -> Result<()> {
        if self.traits.iter().any(|s| s.handle == handle) {
            return Err(Error::InvalidArgument);
        }
        if self.traits.len() == MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION {
            return Err(Error::PathStoreFull);
        }
        self.traits.push(Slot {
            handle,
            dirty: false,
        });
        Ok(())
    }

    fn remove_trait(&mut self, handle: TraitDataHandle) {
        self.traits.retain(|s| s.handle != handle);
    }

    fn set_dirty(&mut self, path: TraitPath, _schema: &dyn TraitSchemaEngine) -> Result<()> {
        // No finer granularity: any path marks the whole instance.
        let slot = self
            .slot_mut(path.trait_handle)
            .ok_or(Error::UnknownTraitHandle)?;
        slot.dirty = true;
        Ok(())
    }

    fn is_dirty(&self, handle: TraitDataHandle) -> bool {
        self.traits
            .iter()
            .any(|s| s.handle == handle && s.dirty)
    }

    fn clear_dirty(&mut self) {
        for slot in &mut self.traits {
            slot.dirty = false;
        }
    }

    fn clear_trait_dirty(&mut self, handle: TraitDataHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.dirty = false;
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
        let dirty = self.is_dirty(handle);
        if !(retrieve_all || dirty || resume.is_some()) {
            return Ok(Retrieval::done(false));
        }

        let schema = catalog.schema_or_err(handle)?;
        let source = catalog.source_or_err(handle)?;
        let locator = catalog.locator_or_err(handle)?;

        let mut walk = match resume {
            Some(cursor) => WalkResume::at(cursor.dictionary, cursor.last_key),
            None => WalkResume::none(),
        };

        let more = builder.write_data_element(
            &locator,
            schema,
            ROOT_PROPERTY_PATH_HANDLE,
            source.version(),
            &[],
            |w, tag| {
                let cut = encode_subtree(w, schema, source, ROOT_PROPERTY_PATH_HANDLE, tag, &mut walk)?;
                Ok(cut.map(|(dictionary, last_key)| DictionaryCursor {
                    kind: ChunkKind::Walk,
                    element_path: ROOT_PROPERTY_PATH_HANDLE,
                    dictionary,
                    last_key,
                }))
            },
        )?;

        if more.is_none() {
            if let Some(slot) = self.slot_mut(handle) {
                slot.dirty = false;
            }
            note_sent(sent, TraitPath::new(handle, ROOT_PROPERTY_PATH_HANDLE), schema);
        }

        Ok(Retrieval {
            element_written: true,
            more,
        })
    }
}
