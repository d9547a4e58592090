// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WDM Notify message layout.
//!
//! Centralizes the context tags of the Notify and Update requests so the
//! builders and the decode side agree byte-for-byte. **Never hardcode these
//! elsewhere!**
//!
//! # Notify request
//!
//! ```text
//! anonymous structure {
//!   [1] SubscriptionId   : unsigned (optional)
//!   [2] ExpiryTime       : signed ms (optional)
//!   [3] DataList         : array of DataElement (optional)
//!   [4] EventList        : array (optional)
//! }
//! ```
//!
//! # DataElement
//!
//! ```text
//! anonymous structure {
//!   [1] Path             : path container (locator + relative tags)
//!   [2] Version          : unsigned (required version on the update side)
//!   [3] DeletedKeys      : array of unsigned item keys (optional)
//!   [4] Data             : value at the path (optional)
//!   [5] PartialChange    : bool, dictionary continuation follows (optional)
//! }
//! ```
//!
//! # Path container
//!
//! ```text
//! path {
//!   [1] ProfileId  : unsigned, or array [profile, max_version, min_version]
//!                    when the schema's version range is not 1..1
//!   [2] ResourceId : unsigned (omitted when addressing self)
//!   [3] InstanceId : unsigned (omitted when zero)
//!   ... null-valued elements carrying the tags from the trait root
//!       down to the addressed node
//! }
//! ```
//!
//! # Merge semantics
//!
//! Structure-valued Data merges field-wise into the subscriber's copy:
//! absent fields are untouched. A dictionary replaces wholesale when
//! written as a member of its parent (the path names the parent, the data
//! nests the dictionary under its own tag) and merges item-wise when the
//! path names the dictionary itself; chunk continuations use the merge
//! form with PartialChange set on every chunk but the last.

mod builder;

pub use builder::{BuilderState, NotifyRequestBuilder};
pub(crate) use builder::encode_element_path;

// Notify request context tags.
pub const TAG_SUBSCRIPTION_ID: u8 = 1;
pub const TAG_EXPIRY_TIME: u8 = 2;
pub const TAG_DATA_LIST: u8 = 3;
pub const TAG_EVENT_LIST: u8 = 4;

// DataElement context tags.
pub const TAG_ELEMENT_PATH: u8 = 1;
pub const TAG_ELEMENT_VERSION: u8 = 2;
pub const TAG_ELEMENT_DELETED_KEYS: u8 = 3;
pub const TAG_ELEMENT_DATA: u8 = 4;
pub const TAG_ELEMENT_PARTIAL_CHANGE: u8 = 5;

// Path locator context tags.
pub const TAG_PATH_PROFILE_ID: u8 = 1;
pub const TAG_PATH_RESOURCE_ID: u8 = 2;
pub const TAG_PATH_INSTANCE_ID: u8 = 3;

// Update request context tags.
pub const TAG_UPDATE_EXPIRY_TIME: u8 = 1;
pub const TAG_UPDATE_DATA_LIST: u8 = 2;
