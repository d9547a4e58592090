// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trait catalog: resolves trait data handles to schema, data, and locator.
//!
//! The publisher core never owns application state. It reads property values
//! through the [`TraitDataSource`] capability and resolves handles through a
//! [`TraitCatalog`]. Both are narrow seams so generated bindings, device
//! shims, or test fixtures plug in without touching the engine.

use crate::error::{Error, Result};
use crate::schema::{PropertyPathHandle, TraitDataHandle, TraitSchemaEngine};
use crate::tlv::{Tag, TlvWriter};

/// Wire-addressing info for one published trait instance.
///
/// `resource_id == None` means "self" and is omitted from encoded paths, as
/// is a zero `instance_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraitLocator {
    pub resource_id: Option<u64>,
    pub instance_id: u64,
}

/// Read capability over one trait instance's current data.
///
/// `read_leaf` writes the value of a leaf property under the given tag;
/// the solvers drive all container structure themselves. Dictionary item
/// keys iterate in ascending order via `next_dictionary_key`, which is what
/// makes cross-message chunk resumption well-defined.
pub trait TraitDataSource {
    /// Current data version, carried in every DataElement.
    fn version(&self) -> u64;

    /// Does the instance currently hold data at `path`?
    ///
    /// Absent optional properties and deleted dictionary items return false.
    fn exists(&self, path: PropertyPathHandle) -> bool;

    /// Encode the leaf value at `path` under `tag`.
    fn read_leaf(&self, path: PropertyPathHandle, tag: Tag, writer: &mut TlvWriter)
        -> Result<()>;

    /// Smallest item key greater than `after` (`None` = from the start).
    fn next_dictionary_key(
        &self,
        dictionary: PropertyPathHandle,
        after: Option<u16>,
    ) -> Option<u16>;
}

/// Resolves trait data handles for the engine and encoders.
pub trait TraitCatalog {
    fn schema(&self, handle: TraitDataHandle) -> Option<&dyn TraitSchemaEngine>;
    fn source(&self, handle: TraitDataHandle) -> Option<&dyn TraitDataSource>;
    fn locator(&self, handle: TraitDataHandle) -> Option<TraitLocator>;

    fn schema_or_err(&self, handle: TraitDataHandle) -> Result<&dyn TraitSchemaEngine> {
        self.schema(handle).ok_or(Error::UnknownTraitHandle)
    }

    fn source_or_err(&self, handle: TraitDataHandle) -> Result<&dyn TraitDataSource> {
        self.source(handle).ok_or(Error::UnknownTraitHandle)
    }

    fn locator_or_err(&self, handle: TraitDataHandle) -> Result<TraitLocator> {
        self.locator(handle).ok_or(Error::UnknownTraitHandle)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Catalog/source fixtures over the shared test schema.

    use super::*;
    use crate::schema::testutil::{test_schema, H_DICT};
    use crate::schema::TraitSchema;
    use std::collections::BTreeMap;

    /// Deterministic data source: every leaf reads back as its own packed
    /// handle value, optionally padded to inflate element sizes for
    /// overflow tests.
    pub struct TestSource {
        pub version: u64,
        /// Item keys present in the dictionary (`H_DICT`), ascending.
        pub dict_keys: Vec<u16>,
        /// Paths reported as absent.
        pub missing: Vec<PropertyPathHandle>,
        /// Extra bytes written per leaf (0 = plain unsigned value).
        pub leaf_pad: usize,
    }

    impl TestSource {
        pub fn new() -> Self {
            Self {
                version: 1,
                dict_keys: Vec::new(),
                missing: Vec::new(),
                leaf_pad: 0,
            }
        }
    }

    impl TraitDataSource for TestSource {
        fn version(&self) -> u64 {
            self.version
        }

        fn exists(&self, path: PropertyPathHandle) -> bool {
            if self.missing.contains(&path) {
                return false;
            }
            // Dictionary items only exist for present keys.
            let schema = test_schema();
            if schema.is_in_dictionary(path) {
                return self.dict_keys.contains(&path.dictionary_key());
            }
            true
        }

        fn read_leaf(
            &self,
            path: PropertyPathHandle,
            tag: Tag,
            writer: &mut TlvWriter,
        ) -> Result<()> {
            if self.leaf_pad > 0 {
                let pad = vec![0xA5u8; self.leaf_pad];
                writer.put_bytes(tag, &pad)
            } else {
                writer.put_unsigned(tag, u64::from(path.schema_handle()) | (u64::from(path.dictionary_key()) << 16))
            }
        }

        fn next_dictionary_key(
            &self,
            dictionary: PropertyPathHandle,
            after: Option<u16>,
        ) -> Option<u16> {
            if dictionary != H_DICT {
                return None;
            }
            self.dict_keys
                .iter()
                .copied()
                .filter(|&k| after.is_none_or(|a| k > a))
                .min()
        }
    }

    /// Catalog giving every registered handle the shared test schema.
    pub struct TestCatalog {
        pub schema: TraitSchema,
        pub sources: BTreeMap<TraitDataHandle, TestSource>,
    }

    impl TestCatalog {
        pub fn new() -> Self {
            Self {
                schema: test_schema(),
                sources: BTreeMap::new(),
            }
        }

        pub fn with_traits(handles: &[TraitDataHandle]) -> Self {
            let mut cat = Self::new();
            for &h in handles {
                cat.sources.insert(h, TestSource::new());
            }
            cat
        }

        pub fn source_mut(&mut self, handle: TraitDataHandle) -> &mut TestSource {
            self.sources.get_mut(&handle).expect("registered trait")
        }
    }

    impl TraitCatalog for TestCatalog {
        fn schema(&self, handle: TraitDataHandle) -> Option<&dyn TraitSchemaEngine> {
            self.sources
                .contains_key(&handle)
                .then_some(&self.schema as &dyn TraitSchemaEngine)
        }

        fn source(&self, handle: TraitDataHandle) -> Option<&dyn TraitDataSource> {
            self.sources
                .get(&handle)
                .map(|s| s as &dyn TraitDataSource)
        }

        fn locator(&self, handle: TraitDataHandle) -> Option<TraitLocator> {
            self.sources
                .contains_key(&handle)
                .then_some(TraitLocator::default())
        }
    }
}
