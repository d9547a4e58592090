// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription handlers and their pre-allocated arena.
//!
//! One [`SubscriptionHandler`] exists per established subscriber, holding
//! everything the notification engine tracks for it: the subscribed trait
//! instances, the per-subscriber graph solver, the in-flight path list of
//! the unconfirmed notify, and the resumption cursors. Handlers live in a
//! [`SubscriptionArena`] of fixed slots with generation counters; a stale
//! [`SubscriptionId`] (slot reused after teardown) is rejected instead of
//! silently addressing the new occupant.

use crate::config::{
    MAX_DIRTY_PATHS, MAX_SUBSCRIPTIONS, MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION,
};
use crate::error::{Error, Result};
use crate::path::TraitPathStore;
use crate::schema::TraitDataHandle;
use crate::solver::{DictionaryCursor, GraphSolver};

/// Generation-counted handle to one arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    index: u16,
    generation: u32,
}

impl SubscriptionId {
    pub fn index(self) -> usize {
        usize::from(self.index)
    }
}

/// Handler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Initial whole-instance data has not been fully delivered yet.
    Establishing,
    /// Establishment complete; only change notifies flow.
    Active,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct InstanceState {
    pub(crate) handle: TraitDataHandle,
    /// Whole-instance emission still owed (set at establishment).
    pub(crate) retrieve_all_pending: bool,
}

/// Transport seam: hand a finalized notify buffer to the send path.
///
/// The delivery outcome comes back asynchronously through
/// `NotificationEngine::on_notify_confirm`; `send_notify` only reports
/// whether the message was accepted for transmission.
pub trait NotifySink {
    fn send_notify(
        &mut self,
        id: SubscriptionId,
        peer_node_id: u64,
        message: &[u8],
    ) -> Result<()>;
}

/// Per-subscriber publisher state.
pub struct SubscriptionHandler {
    peer_node_id: u64,
    /// Wire-level subscription id echoed in every notify header.
    subscription_id: u64,
    state: HandlerState,
    pub(crate) instances: Vec<InstanceState>,
    pub(crate) solver: Box<dyn GraphSolver>,
    /// Paths included in the unconfirmed notify; cleared on delivery,
    /// merged back into the dirty store on failure.
    pub(crate) in_flight: TraitPathStore,
    /// Chunked dictionary continuation carried across messages.
    pub(crate) pending_chunk: Option<(TraitDataHandle, DictionaryCursor)>,
    /// Round-robin resumption cursor across this handler's instances.
    pub(crate) cur_trait_instance_idx: usize,
    /// One unconfirmed notify at a time per subscriber.
    pub(crate) notify_in_flight: bool,
}

impl core::fmt::Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionHandler")
            .field("peer_node_id", &self.peer_node_id)
            .field("subscription_id", &self.subscription_id)
            .field("state", &self.state)
            .field("instances", &self.instances)
            .field("in_flight", &self.in_flight)
            .field("pending_chunk", &self.pending_chunk)
            .field("cur_trait_instance_idx", &self.cur_trait_instance_idx)
            .field("notify_in_flight", &self.notify_in_flight)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandler {
    pub(crate) fn new(
        peer_node_id: u64,
        subscription_id: u64,
        traits: &[TraitDataHandle],
        mut solver: Box<dyn GraphSolver>,
    ) -> Result<Self> {
        if traits.is_empty() || traits.len() > MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION {
            return Err(Error::InvalidArgument);
        }
        let mut instances = Vec::with_capacity(MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION);
        for &handle in traits {
            solver.add_trait(handle)?;
            instances.push(InstanceState {
                handle,
                retrieve_all_pending: true,
            });
        }
        Ok(Self {
            peer_node_id,
            subscription_id,
            state: HandlerState::Establishing,
            instances,
            solver,
            in_flight: TraitPathStore::with_capacity(
                MAX_DIRTY_PATHS * MAX_TRAIT_INSTANCES_PER_SUBSCRIPTION,
            ),
            pending_chunk: None,
            cur_trait_instance_idx: 0,
            notify_in_flight: false,
        })
    }

    pub fn peer_node_id(&self) -> u64 {
        self.peer_node_id
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn subscribes_to(&self, handle: TraitDataHandle) -> bool {
        self.instances.iter().any(|i| i.handle == handle)
    }

    /// Anything left to pack into a notify?
    pub fn has_pending_work(&self) -> bool {
        self.pending_chunk.is_some()
            || self
                .instances
                .iter()
                .any(|i| i.retrieve_all_pending || self.solver.is_dirty(i.handle))
    }

    /// Establishment completes once nothing is owed and nothing is in
    /// flight; returns true on the Establishing -> Active edge.
    pub(crate) fn try_complete_establishment(&mut self) -> bool {
        if self.state == HandlerState::Establishing
            && !self.has_pending_work()
            && !self.notify_in_flight
        {
            self.state = HandlerState::Active;
            return true;
        }
        false
    }
}

struct Slot {
    generation: u32,
    handler: Option<SubscriptionHandler>,
}

/// Fixed-slot handler arena with generation-counted ids.
pub struct SubscriptionArena {
    slots: Vec<Slot>,
}

impl SubscriptionArena {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SUBSCRIPTIONS);
        for _ in 0..MAX_SUBSCRIPTIONS {
            slots.push(Slot {
                generation: 0,
                handler: None,
            });
        }
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.handler.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Place a handler in the first free slot.
    pub fn insert(&mut self, handler: SubscriptionHandler) -> Result<SubscriptionId> {
        let Some(index) = self.slots.iter().position(|s| s.handler.is_none()) else {
            return Err(Error::NoSpareSubscription);
        };
        self.slots[index].handler = Some(handler);
        Ok(SubscriptionId {
            index: index as u16,
            generation: self.slots[index].generation,
        })
    }

    pub fn get(&self, id: SubscriptionId) -> Result<&SubscriptionHandler> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.handler.as_ref())
            .ok_or(Error::SubscriptionGone)
    }

    pub fn get_mut(&mut self, id: SubscriptionId) -> Result<&mut SubscriptionHandler> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.handler.as_mut())
            .ok_or(Error::SubscriptionGone)
    }

    /// Tear a subscription down; the slot's generation advances so stale
    /// ids no longer resolve.
    pub fn remove(&mut self, id: SubscriptionId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation && s.handler.is_some())
            .ok_or(Error::SubscriptionGone)?;
        slot.handler = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Occupied slot at `index`, with its current id.
    pub fn handler_at_mut(
        &mut self,
        index: usize,
    ) -> Option<(SubscriptionId, &mut SubscriptionHandler)> {
        let slot = self.slots.get_mut(index)?;
        let generation = slot.generation;
        let handler = slot.handler.as_mut()?;
        Some((
            SubscriptionId {
                index: index as u16,
                generation,
            },
            handler,
        ))
    }

    pub fn handler_at(&self, index: usize) -> Option<(SubscriptionId, &SubscriptionHandler)> {
        let slot = self.slots.get(index)?;
        let generation = slot.generation;
        let handler = slot.handler.as_ref()?;
        Some((
            SubscriptionId {
                index: index as u16,
                generation,
            },
            handler,
        ))
    }
}

impl Default for SubscriptionArena {
    fn default() -> Self {
        Self::new()
    }
}
