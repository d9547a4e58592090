// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Update encoder: the device-to-service write path.
//!
//! Mirrors the notify side: an in-progress [`TraitPathStore`] lists the
//! paths the device wants to write, and the encoder packs them into
//! size-bounded UpdateRequest messages with the same DataElement layout,
//! the same dictionary-replace path shortening, and the same item-chunking
//! discipline. Every element carries the required (conditional) data
//! version.
//!
//! # Chunk resumption
//!
//! When a dictionary overflows the buffer, the items written so far stay
//! in the message and a continuation record is inserted into the path list
//! immediately after the current cursor: the dictionary handle with its
//! key half set to the last written key, flagged `FORCE_MERGE` plus the
//! encoder's key-cursor bit. The next `encode_request` call resumes from
//! exactly that key. Continuation records are `Private` while the attempt
//! is open: a failed attempt purges them and clears the encoded marks so
//! the whole update is retried from scratch.

use crate::catalog::{TraitCatalog, TraitDataSource, TraitLocator};
use crate::error::{Error, Result};
use crate::notify::{
    encode_element_path, TAG_ELEMENT_DATA, TAG_ELEMENT_PARTIAL_CHANGE, TAG_ELEMENT_VERSION,
    TAG_UPDATE_DATA_LIST, TAG_UPDATE_EXPIRY_TIME,
};
use crate::path::{PathFlags, TraitPath, TraitPathStore};
use crate::schema::{PropertyPathHandle, TraitSchemaEngine};
use crate::solver::{encode_dictionary, encode_subtree, WalkResume};
use crate::tlv::{Tag, TlvWriter};

/// Caller bit: record was packed into the current message.
const FLAG_ENCODED: PathFlags = PathFlags(0x08);
/// Caller bit: record's key half is a dictionary resume cursor.
const FLAG_KEY_CURSOR: PathFlags = PathFlags(0x10);

/// Outcome of one `encode_request` call.
#[derive(Debug, Clone, Copy)]
pub struct UpdateOutcome {
    /// Finalized message length.
    pub len: usize,
    /// DataElements packed into this message.
    pub elements_encoded: usize,
    /// Paths remain for a further message.
    pub more: bool,
}

/// Packs an in-progress update path list into UpdateRequest messages.
pub struct UpdateEncoder {
    expiry_time_ms: Option<i64>,
}

impl UpdateEncoder {
    pub fn new() -> Self {
        Self {
            expiry_time_ms: None,
        }
    }

    pub fn with_expiry(expiry_time_ms: i64) -> Self {
        Self {
            expiry_time_ms: Some(expiry_time_ms),
        }
    }

    /// Encode one UpdateRequest from the front of `store` into `buffer`.
    ///
    /// Fully packed records are removed from the store; a dictionary that
    /// did not finish leaves a continuation record behind. On a hard
    /// failure the store is restored to its pre-call content (encoded
    /// marks cleared, private continuations purged).
    pub fn encode_request(
        &self,
        store: &mut TraitPathStore,
        catalog: &dyn TraitCatalog,
        buffer: &mut [u8],
    ) -> Result<UpdateOutcome> {
        store.compact();
        match self.encode_session(store, catalog, buffer) {
            Ok(outcome) => {
                // Promote continuations and drop what this message carries.
                store.remove_items_with_flags(FLAG_ENCODED);
                for i in 0..store.capacity() {
                    if store.item(i).is_some() {
                        let _ = store.set_item_flag(i, PathFlags::PRIVATE, false);
                    }
                }
                store.compact();
                Ok(outcome)
            }
            Err(err) => {
                store.remove_items_with_flags(PathFlags::PRIVATE);
                for i in 0..store.capacity() {
                    if store.item(i).is_some() {
                        let _ = store.set_item_flag(i, FLAG_ENCODED, false);
                    }
                }
                store.compact();
                Err(err)
            }
        }
    }

    fn encode_session(
        &self,
        store: &mut TraitPathStore,
        catalog: &dyn TraitCatalog,
        buffer: &mut [u8],
    ) -> Result<UpdateOutcome> {
        let mut writer = TlvWriter::new(buffer);
        writer.start_structure(Tag::Anonymous)?;
        if let Some(expiry) = self.expiry_time_ms {
            writer.put_signed(Tag::Context(TAG_UPDATE_EXPIRY_TIME), expiry)?;
        }
        writer.start_array(Tag::Context(TAG_UPDATE_DATA_LIST))?;

        let mut elements = 0;
        let mut more = false;
        let mut idx = store.first_valid_item();
        while let Some(i) = idx {
            let Some(tp) = store.item(i) else { break };
            let flags = store.item_flags(i).unwrap_or_default();
            if flags.contains(FLAG_ENCODED) {
                idx = store.next_valid_item(i);
                continue;
            }

            let schema = catalog.schema_or_err(tp.trait_handle)?;
            let source = catalog.source_or_err(tp.trait_handle)?;
            let locator = catalog.locator_or_err(tp.trait_handle)?;

            let cp = writer.checkpoint();
            match encode_update_element(&mut writer, tp, flags, schema, source, &locator) {
                Ok(None) => {
                    store.set_item_flag(i, FLAG_ENCODED, true)?;
                    elements += 1;
                    idx = store.next_valid_item(i);
                }
                Ok(Some((dict, last_key))) => {
                    // Items up to `last_key` are in this message; the
                    // continuation resumes right here next call.
                    store.set_item_flag(i, FLAG_ENCODED, true)?;
                    elements += 1;
                    let cursor = TraitPath::new(
                        tp.trait_handle,
                        PropertyPathHandle::with_key(dict.schema_handle(), last_key),
                    );
                    store.insert_item_at(
                        i + 1,
                        cursor,
                        PathFlags::PRIVATE
                            .union(PathFlags::FORCE_MERGE)
                            .union(FLAG_KEY_CURSOR),
                    )?;
                    more = true;
                    break;
                }
                Err(Error::BufferTooSmall) => {
                    writer.rollback(cp)?;
                    if elements == 0 {
                        log::error!(
                            "[update] element for trait {} exceeds an empty update buffer",
                            tp.trait_handle
                        );
                        return Err(Error::BufferTooSmall);
                    }
                    more = true;
                    break;
                }
                Err(err) => {
                    writer.rollback(cp)?;
                    return Err(err);
                }
            }
        }

        writer.end_container()?; // DataList
        writer.end_container()?; // outer structure
        let len = writer.finalize()?;

        Ok(UpdateOutcome {
            len,
            elements_encoded: elements,
            more: more || store_has_unencoded(store),
        })
    }
}

impl Default for UpdateEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn store_has_unencoded(store: &TraitPathStore) -> bool {
    let mut idx = store.first_valid_item();
    while let Some(i) = idx {
        if let Some(flags) = store.item_flags(i) {
            if !flags.contains(FLAG_ENCODED) {
                return true;
            }
        }
        idx = store.next_valid_item(i);
    }
    false
}

/// Encode one update DataElement. Returns `Some((dictionary, last_key))`
/// when a dictionary element was cut and a continuation is needed.
fn encode_update_element(
    writer: &mut TlvWriter<'_>,
    tp: TraitPath,
    flags: PathFlags,
    schema: &dyn TraitSchemaEngine,
    source: &dyn TraitDataSource,
    locator: &TraitLocator,
) -> Result<Option<(PropertyPathHandle, u16)>> {
    if !schema.is_valid(tp.path) {
        return Err(Error::SchemaMismatch);
    }

    writer.start_structure(Tag::Anonymous)?;

    let (element_path, shape) = element_shape(schema, tp.path, flags);
    encode_element_path(writer, locator, schema, element_path)?;
    // Conditional update: the publisher applies the element only if its
    // data version still matches.
    writer.put_unsigned(Tag::Context(TAG_ELEMENT_VERSION), source.version())?;

    let cut = match shape {
        ElementShape::Subtree(path) => {
            let mut walk = WalkResume::none();
            let cut = encode_subtree(
                writer,
                schema,
                source,
                path,
                Tag::Context(TAG_ELEMENT_DATA),
                &mut walk,
            )?;
            if cut.is_some() {
                // Chunking is only supported for records that address a
                // dictionary directly; a nested one backs the element out.
                return Err(Error::BufferTooSmall);
            }
            None
        }
        ElementShape::ReplaceDictionary(dict) => {
            writer.start_structure(Tag::Context(TAG_ELEMENT_DATA))?;
            let cut = encode_dictionary(writer, schema, source, dict, schema.tag(dict), None, None)?;
            writer.end_container()?;
            cut
        }
        ElementShape::MergeDictionary { dict, start_after } => encode_dictionary(
            writer,
            schema,
            source,
            dict,
            Tag::Context(TAG_ELEMENT_DATA),
            start_after,
            None,
        )?,
    };

    let resume = match cut {
        Some((dict, Some(last_key))) => {
            writer.put_bool(Tag::Context(TAG_ELEMENT_PARTIAL_CHANGE), true)?;
            Some((dict, last_key))
        }
        // No item fit at all: this element makes no progress, back it out.
        Some((_, None)) => return Err(Error::BufferTooSmall),
        None => None,
    };

    writer.end_container()?;
    Ok(resume)
}

enum ElementShape {
    Subtree(PropertyPathHandle),
    ReplaceDictionary(PropertyPathHandle),
    MergeDictionary {
        dict: PropertyPathHandle,
        start_after: Option<u16>,
    },
}

/// Where the element's path points and how its data is laid out.
fn element_shape(
    schema: &dyn TraitSchemaEngine,
    path: PropertyPathHandle,
    flags: PathFlags,
) -> (PropertyPathHandle, ElementShape) {
    if schema.is_dictionary(path) {
        if flags.contains(FLAG_KEY_CURSOR) {
            // Continuation: key half of the handle is the last sent key.
            let dict = PropertyPathHandle::new(path.schema_handle());
            return (
                dict,
                ElementShape::MergeDictionary {
                    dict,
                    start_after: Some(path.dictionary_key()),
                },
            );
        }
        if flags.is_force_merge() {
            return (
                path,
                ElementShape::MergeDictionary {
                    dict: path,
                    start_after: None,
                },
            );
        }
        // Replace: drop the trailing tag, write the dictionary under its
        // parent (same shortening as the notify side).
        return (schema.parent(path), ElementShape::ReplaceDictionary(path));
    }
    (path, ElementShape::Subtree(path))
}
