// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trait schema model: path handles and the schema capability interface.
//!
//! A trait's property tree is compile-time data: a flat table of
//! [`PropertyInfo`] records, one per schema node, each naming its parent
//! and its wire tag. Handles into the tree are small integers so that the
//! dirty-tracking stores stay plain arrays of u32 pairs.
//!
//! # Path handles
//!
//! [`PropertyPathHandle`] packs two u16 halves:
//!
//! ```text
//! +----------------+----------------+
//! | dictionary key |  schema handle |   (key << 16) | schema
//! +----------------+----------------+
//! ```
//!
//! Schema handle 0 is the null sentinel, 1 the trait root. Nodes inside a
//! dictionary subtree carry the item key in the upper half; the key is
//! stripped when walking up past the dictionary element root, so the parent
//! of any item is the dictionary node itself.

use crate::config::MAX_PATH_DEPTH;
use crate::error::{Error, Result};
use crate::tlv::Tag;

/// Identifies one trait instance within a catalog.
pub type TraitDataHandle = u16;

/// Schema-half value of the null handle.
const NULL_SCHEMA_HANDLE: u16 = 0;
/// Schema-half value of the trait root.
const ROOT_SCHEMA_HANDLE: u16 = 1;

/// Location of one node in a trait instance's property tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PropertyPathHandle(u32);

/// Sentinel: no path.
pub const NULL_PROPERTY_PATH_HANDLE: PropertyPathHandle = PropertyPathHandle(0);
/// The whole trait instance.
pub const ROOT_PROPERTY_PATH_HANDLE: PropertyPathHandle =
    PropertyPathHandle(ROOT_SCHEMA_HANDLE as u32);

impl PropertyPathHandle {
    /// Handle for a schema node outside any dictionary item.
    pub const fn new(schema_handle: u16) -> Self {
        Self(schema_handle as u32)
    }

    /// Handle for a schema node within dictionary item `key`.
    pub const fn with_key(schema_handle: u16, key: u16) -> Self {
        Self(((key as u32) << 16) | schema_handle as u32)
    }

    pub const fn schema_handle(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub const fn dictionary_key(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn is_null(self) -> bool {
        self.schema_handle() == NULL_SCHEMA_HANDLE
    }

    pub const fn is_root(self) -> bool {
        self.schema_handle() == ROOT_SCHEMA_HANDLE && self.dictionary_key() == 0
    }
}

/// Per-node flags in a schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PropertyFlags(pub u8);

impl PropertyFlags {
    /// Node is a dictionary (unbounded keyed collection).
    pub const DICTIONARY: Self = Self(0x01);
    /// Node may be absent from instance data.
    pub const OPTIONAL: Self = Self(0x02);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

/// One schema-tree node.
///
/// Tables are ordered by schema handle: `properties[h - 1]` describes
/// handle `h`. The root occupies index 0 with `parent == 0`.
#[derive(Debug, Clone, Copy)]
pub struct PropertyInfo {
    /// Schema handle of the parent node (0 for the root).
    pub parent: u16,
    /// Context tag of this node within its parent. Unused for the root and
    /// for dictionary element roots (their tag is the item key).
    pub context_tag: u8,
    pub flags: PropertyFlags,
}

/// Schema capability consumed by the solvers and encoders.
///
/// Everything the publisher core needs to know about a trait's tree:
/// ancestry, dictionary-ness, wire tags, version range. Implemented by the
/// table-driven [`TraitSchema`]; kept as a trait so generated or
/// test-fixture schemas plug in at the same seam.
pub trait TraitSchemaEngine {
    /// Profile id carried in every encoded path for this trait.
    fn profile_id(&self) -> u32;

    /// (min, max) schema version the publisher can emit.
    fn version_range(&self) -> (u16, u16);

    /// Immediate parent, or the null handle for the root/null.
    fn parent(&self, handle: PropertyPathHandle) -> PropertyPathHandle;

    /// True if `ancestor` is a strict ancestor of `descendant`.
    fn is_parent(&self, ancestor: PropertyPathHandle, descendant: PropertyPathHandle) -> bool {
        if ancestor.is_null() || descendant.is_null() {
            return false;
        }
        let mut cur = self.parent(descendant);
        while !cur.is_null() {
            if cur == ancestor {
                return true;
            }
            cur = self.parent(cur);
        }
        false
    }

    /// True for dictionary nodes themselves.
    fn is_dictionary(&self, handle: PropertyPathHandle) -> bool;

    /// True if a strict ancestor of `handle` is a dictionary.
    fn is_in_dictionary(&self, handle: PropertyPathHandle) -> bool {
        let mut cur = self.parent(handle);
        while !cur.is_null() {
            if self.is_dictionary(cur) {
                return true;
            }
            cur = self.parent(cur);
        }
        false
    }

    /// True if `handle` has no schema children.
    fn is_leaf(&self, handle: PropertyPathHandle) -> bool;

    /// Wire tag of `handle` within its parent container.
    fn tag(&self, handle: PropertyPathHandle) -> Tag;

    /// Does `handle` name a valid node of this schema?
    fn is_valid(&self, handle: PropertyPathHandle) -> bool;

    /// First schema child of `handle`, carrying `handle`'s dictionary key.
    fn first_child(&self, handle: PropertyPathHandle) -> PropertyPathHandle;

    /// Next sibling after `prev` under the same parent.
    fn next_child(&self, prev: PropertyPathHandle) -> PropertyPathHandle;

    /// Tags from `from` (exclusive) down to `to` (inclusive), in root-first
    /// order. `from` must be `to` or an ancestor of it.
    fn relative_path_tags(
        &self,
        from: PropertyPathHandle,
        to: PropertyPathHandle,
        out: &mut [Tag; MAX_PATH_DEPTH],
    ) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        let mut rev = [Tag::Anonymous; MAX_PATH_DEPTH];
        let mut n = 0;
        let mut cur = to;
        while cur != from {
            if cur.is_null() {
                // `from` was not an ancestor of `to`.
                return Err(Error::SchemaMismatch);
            }
            if n >= MAX_PATH_DEPTH {
                return Err(Error::SchemaMismatch);
            }
            rev[n] = self.tag(cur);
            n += 1;
            cur = self.parent(cur);
        }
        for i in 0..n {
            out[i] = rev[n - 1 - i];
        }
        Ok(n)
    }

    /// Depth of `handle` below the root (root = 0).
    fn depth(&self, handle: PropertyPathHandle) -> usize {
        let mut d = 0;
        let mut cur = handle;
        while !cur.is_null() && !cur.is_root() {
            d += 1;
            cur = self.parent(cur);
        }
        d
    }

    /// Deepest node that is an ancestor of (or equal to) both handles.
    ///
    /// Defined purely by the parent relation; two items of the same
    /// dictionary meet at the dictionary node.
    fn lowest_common_ancestor(
        &self,
        a: PropertyPathHandle,
        b: PropertyPathHandle,
    ) -> PropertyPathHandle {
        if a.is_null() {
            return b;
        }
        if b.is_null() {
            return a;
        }
        let (mut a, mut b) = (a, b);
        let (mut da, mut db) = (self.depth(a), self.depth(b));
        while da > db {
            a = self.parent(a);
            da -= 1;
        }
        while db > da {
            b = self.parent(b);
            db -= 1;
        }
        while a != b {
            a = self.parent(a);
            b = self.parent(b);
        }
        a
    }
}

/// Table-driven schema over a static [`PropertyInfo`] slice.
#[derive(Debug, Clone, Copy)]
pub struct TraitSchema {
    profile_id: u32,
    min_version: u16,
    max_version: u16,
    properties: &'static [PropertyInfo],
}

impl TraitSchema {
    pub const fn new(
        profile_id: u32,
        min_version: u16,
        max_version: u16,
        properties: &'static [PropertyInfo],
    ) -> Self {
        Self {
            profile_id,
            min_version,
            max_version,
            properties,
        }
    }

    fn info(&self, schema_handle: u16) -> Option<&PropertyInfo> {
        if schema_handle == NULL_SCHEMA_HANDLE {
            return None;
        }
        self.properties.get(usize::from(schema_handle) - 1)
    }
}

impl TraitSchemaEngine for TraitSchema {
    fn profile_id(&self) -> u32 {
        self.profile_id
    }

    fn version_range(&self) -> (u16, u16) {
        (self.min_version, self.max_version)
    }

    fn parent(&self, handle: PropertyPathHandle) -> PropertyPathHandle {
        let Some(info) = self.info(handle.schema_handle()) else {
            return NULL_PROPERTY_PATH_HANDLE;
        };
        if info.parent == NULL_SCHEMA_HANDLE {
            return NULL_PROPERTY_PATH_HANDLE;
        }
        // Walking up out of a dictionary element strips the item key: the
        // parent of any item node is the dictionary itself.
        let parent_is_dictionary = self
            .info(info.parent)
            .is_some_and(|p| p.flags.contains(PropertyFlags::DICTIONARY));
        if parent_is_dictionary {
            PropertyPathHandle::new(info.parent)
        } else {
            PropertyPathHandle::with_key(info.parent, handle.dictionary_key())
        }
    }

    fn is_dictionary(&self, handle: PropertyPathHandle) -> bool {
        self.info(handle.schema_handle())
            .is_some_and(|i| i.flags.contains(PropertyFlags::DICTIONARY))
    }

    fn is_leaf(&self, handle: PropertyPathHandle) -> bool {
        let h = handle.schema_handle();
        self.info(h).is_some()
            && !self
                .properties
                .iter()
                .any(|p| p.parent == h)
    }

    fn tag(&self, handle: PropertyPathHandle) -> Tag {
        let Some(info) = self.info(handle.schema_handle()) else {
            return Tag::Anonymous;
        };
        // Dictionary element roots are tagged by their item key.
        let parent_is_dictionary = self
            .info(info.parent)
            .is_some_and(|p| p.flags.contains(PropertyFlags::DICTIONARY));
        if parent_is_dictionary {
            Tag::for_dictionary_key(handle.dictionary_key())
        } else {
            Tag::Context(info.context_tag)
        }
    }

    fn is_valid(&self, handle: PropertyPathHandle) -> bool {
        let Some(info) = self.info(handle.schema_handle()) else {
            return false;
        };
        // A dictionary key is only meaningful inside a dictionary subtree.
        if handle.dictionary_key() != 0 {
            let parent_is_dictionary = self
                .info(info.parent)
                .is_some_and(|p| p.flags.contains(PropertyFlags::DICTIONARY));
            return parent_is_dictionary || self.is_in_dictionary(handle);
        }
        true
    }

    fn first_child(&self, handle: PropertyPathHandle) -> PropertyPathHandle {
        let h = handle.schema_handle();
        for (idx, p) in self.properties.iter().enumerate() {
            if p.parent == h {
                let child = (idx + 1) as u16;
                return PropertyPathHandle::with_key(child, handle.dictionary_key());
            }
        }
        NULL_PROPERTY_PATH_HANDLE
    }

    fn next_child(&self, prev: PropertyPathHandle) -> PropertyPathHandle {
        let Some(info) = self.info(prev.schema_handle()) else {
            return NULL_PROPERTY_PATH_HANDLE;
        };
        let start = usize::from(prev.schema_handle());
        for (idx, p) in self.properties.iter().enumerate().skip(start) {
            if p.parent == info.parent {
                let sibling = (idx + 1) as u16;
                return PropertyPathHandle::with_key(sibling, prev.dictionary_key());
            }
        }
        NULL_PROPERTY_PATH_HANDLE
    }
}
