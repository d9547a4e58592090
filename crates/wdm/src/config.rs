// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WDM publisher configuration - single source of truth.
//!
//! Centralizes every capacity ceiling of the publisher core. These are hard
//! limits: the engine degrades (coarsens a diff, cuts a message short) when
//! it hits one, it never grows past it. **Never hardcode these elsewhere!**
//!
//! Sizing targets small MCUs: all stores are allocated once at init and the
//! engine performs no allocation per dirty mark or per notify.

use crate::solver::SolverKind;

/// Maximum concurrently established subscriptions.
///
/// One publisher-side handler slot is pre-allocated per subscription.
pub const MAX_SUBSCRIPTIONS: usize = 8;

/// Maximum trait instances a single subscription may cover.
pub const MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION: usize = 8;

/// Capacity of the intermediate solver's dirty-path store.
///
/// When full, an incoming dirty mark collapses the affected trait instance
/// to "whole instance dirty" rather than being dropped.
pub const MAX_DIRTY_PATHS: usize = 8;

/// Maximum dirty children of a lowest-common-ancestor that can be named in
/// one DataElement's merge set.
///
/// Overflow degrades to replacing the whole LCA subtree.
pub const MAX_MERGE_HANDLES: usize = 4;

/// Maximum schema-tree depth of any property path.
///
/// Bounds the tag arrays used while encoding relative paths.
pub const MAX_PATH_DEPTH: usize = 8;

/// Maximum notifies simultaneously awaiting a delivery confirm.
pub const MAX_NOTIFIES_IN_FLIGHT: usize = 2;

/// Default size of one outgoing notify buffer, in bytes.
pub const DEFAULT_NOTIFY_BUFFER_SIZE: usize = 1024;

/// Capacity of the update encoder's in-progress path list.
pub const MAX_UPDATE_PATHS: usize = 16;

/// Maximum open TLV containers in one message.
///
/// Outer struct + DataList + DataElement + Path/Data + nested data leaves
/// headroom below this.
pub const MAX_TLV_NESTING: usize = 12;

/// Runtime-selected engine knobs.
///
/// Capacity ceilings above are compile-time; these are the few knobs an
/// embedding chooses at engine construction, including which solver
/// variant every subscription gets.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Graph solver variant used for all subscriptions.
    pub solver: SolverKind,
    /// Size of each outgoing notify buffer.
    pub notify_buffer_size: usize,
    /// In-flight notify budget across all subscriptions.
    pub max_notifies_in_flight: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            solver: SolverKind::Intermediate,
            notify_buffer_size: DEFAULT_NOTIFY_BUFFER_SIZE,
            max_notifies_in_flight: MAX_NOTIFIES_IN_FLIGHT,
        }
    }
}
