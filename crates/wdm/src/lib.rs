// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # WDM - Weave Data Management publisher core
//!
//! A pure Rust implementation of the WDM publisher engine: dirty-path
//! tracking over schema trees, minimal-diff computation, and packing of
//! change data into size-bounded Notify messages - designed for small
//! MCUs (fixed-size pools, no per-event allocation, graceful degradation
//! under every capacity ceiling).
//!
//! ## Quick Start
//!
//! ```ignore
//! use wdm::{EngineConfig, NotificationEngine, TraitPath};
//!
//! // Catalog and sink are application capabilities (see `catalog` and
//! // `subscription` module docs).
//! let mut engine = NotificationEngine::new(EngineConfig::default());
//! let id = engine.subscribe(peer_node_id, 1, &[temperature_trait])?;
//!
//! // Application marks data changed...
//! engine.set_dirty(TraitPath::new(temperature_trait, settings_path), &catalog)?;
//!
//! // ...the event loop packs and sends notifies...
//! engine.run(&catalog, &mut sink);
//!
//! // ...and the transport reports the delivery outcome.
//! engine.on_notify_confirm(id, true, &catalog)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        NotificationEngine                          |
//! |  two-level round-robin | in-flight budget | confirm bookkeeping    |
//! +--------------------------------------------------------------------+
//! |            GraphSolver (Basic | Intermediate)                      |
//! |  bounded dirty stores | LCA + merge sets | dictionary chunking     |
//! +--------------------------------------------------------------------+
//! |   NotifyRequestBuilder / UpdateEncoder                             |
//! |  FSM over one buffer | checkpointed elements | rollback on overflow|
//! +--------------------------------------------------------------------+
//! |   TraitPathStore | TraitSchemaEngine | TLV writer/reader           |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`NotificationEngine`] | Orchestrates dirty data into fair, bounded notifies |
//! | [`TraitPathStore`] | Fixed-capacity set of interest paths with flag bits |
//! | [`GraphSolver`] | Dirty tracking + minimal-diff retrieval (two variants) |
//! | [`NotifyRequestBuilder`] | Notify message FSM with element rollback |
//! | [`UpdateEncoder`] | Symmetric device-to-service write encoder |
//! | [`TraitSchemaEngine`] | Schema capability: ancestry, tags, dictionaries |
//!
//! ## Degradation guarantees
//!
//! Every bounded structure degrades toward *more* data, never lost data:
//! a full dirty store coarsens the trait to whole-instance dirty, a full
//! merge set widens an element to the whole LCA subtree, and an element
//! that outgrows the message either ends the message early (and stays
//! dirty) or chunks dictionary items across messages.

/// Trait catalog and data-source capability seams.
pub mod catalog;
/// Capacity ceilings and engine configuration - single source of truth.
pub mod config;
/// Notification engine orchestration (round-robin, in-flight budget).
pub mod engine;
/// Error types for all WDM operations.
pub mod error;
/// Notify/Update message layout and the notify request builder.
pub mod notify;
/// Fixed-capacity trait path store (dirty and in-progress tracking).
pub mod path;
/// Path handles, schema tables, and the schema capability interface.
pub mod schema;
/// Graph solvers: dirty paths to packed DataElements.
pub mod solver;
/// Subscription handlers and their pre-allocated arena.
pub mod subscription;
/// TLV encoding: bounds-checked writer with rollback, event-stream reader.
pub mod tlv;
/// Update encoder: the device-to-service write path.
pub mod update;

pub use catalog::{TraitCatalog, TraitDataSource, TraitLocator};
pub use config::EngineConfig;
pub use engine::{shared, NotificationEngine, RunOutcome, SharedEngine};
pub use error::{Error, Result};
pub use notify::{BuilderState, NotifyRequestBuilder};
pub use path::{PathFlags, TraitPath, TraitPathStore};
pub use schema::{
    PropertyFlags, PropertyInfo, PropertyPathHandle, TraitDataHandle, TraitSchema,
    TraitSchemaEngine, NULL_PROPERTY_PATH_HANDLE, ROOT_PROPERTY_PATH_HANDLE,
};
pub use solver::{
    BasicGraphSolver, DictionaryCursor, GraphSolver, IntermediateGraphSolver, MergeHandleSet,
    Retrieval, SolverKind,
};
pub use subscription::{
    HandlerState, NotifySink, SubscriptionArena, SubscriptionHandler, SubscriptionId,
};
pub use tlv::{Tag, TlvElement, TlvReader, TlvWriter};
pub use update::{UpdateEncoder, UpdateOutcome};

/// WDM crate version string.
pub const VERSION: &str = "0.3.2";
