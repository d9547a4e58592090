// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notification engine: packs dirty data into notifies, fairly.
//!
//! The engine round-robins at two levels - across subscription handlers,
//! and within a handler across its trait instances - using explicit
//! resumption cursors, so a chatty subscriber or an oversized trait never
//! starves the rest. Each `run()` builds at most one notify per handler
//! with spare in-flight budget; whatever does not fit stays dirty and is
//! picked up where the cursors point on the next call.
//!
//! # Threading
//!
//! All engine operations are synchronous and not internally thread-safe;
//! the embedding serializes `set_dirty` (application side) against
//! `run`/`on_notify_confirm` (event loop side). [`SharedEngine`] is the
//! conventional wrapper when the two sides live on different threads.


use crate::catalog::TraitCatalog;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::notify::NotifyRequestBuilder;
use crate::path::TraitPath;
use crate::schema::TraitDataHandle;
use crate::solver::{new_solver, Retrieval};
use crate::subscription::{
    NotifySink, SubscriptionArena, SubscriptionHandler, SubscriptionId,
};

/// Conventional cross-thread wrapper; see the module docs.
pub type SharedEngine = std::sync::Arc<parking_lot::Mutex<NotificationEngine>>;

/// Wrap an engine for use from multiple threads.
pub fn shared(engine: NotificationEngine) -> SharedEngine {
    std::sync::Arc::new(parking_lot::Mutex::new(engine))
}

/// Outcome of one `run()` pass.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Notifies handed to the sink this pass.
    pub notifies_sent: usize,
    /// Handler builds that failed (other handlers were still served).
    pub failed_builds: usize,
    /// First error encountered, if any.
    pub last_error: Option<Error>,
}

/// Publisher-side notification orchestrator.
pub struct NotificationEngine {
    config: EngineConfig,
    arena: SubscriptionArena,
    /// Output buffer, allocated once and reused for every build.
    scratch: Vec<u8>,
    /// Round-robin resumption cursor across arena slots.
    cur_subscription_idx: usize,
    num_notifies_in_flight: usize,
}

impl NotificationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let scratch = vec![0u8; config.notify_buffer_size];
        Self {
            config,
            arena: SubscriptionArena::new(),
            scratch,
            cur_subscription_idx: 0,
            num_notifies_in_flight: 0,
        }
    }

    pub fn num_notifies_in_flight(&self) -> usize {
        self.num_notifies_in_flight
    }

    pub fn handler(&self, id: SubscriptionId) -> Result<&SubscriptionHandler> {
        self.arena.get(id)
    }

    /// Establish a subscription over `traits`; every instance owes the
    /// subscriber a whole-instance notify before the handler goes Active.
    pub fn subscribe(
        &mut self,
        peer_node_id: u64,
        subscription_id: u64,
        traits: &[TraitDataHandle],
    ) -> Result<SubscriptionId> {
        let handler = SubscriptionHandler::new(
            peer_node_id,
            subscription_id,
            traits,
            new_solver(self.config.solver),
        )?;
        let id = self.arena.insert(handler)?;
        log::debug!(
            "[notify] subscription {subscription_id} established for peer {peer_node_id:#x} ({} traits)",
            traits.len()
        );
        Ok(id)
    }

    /// Tear a subscription down, releasing its slot and in-flight budget.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<()> {
        if self.arena.get(id)?.notify_in_flight {
            self.num_notifies_in_flight = self.num_notifies_in_flight.saturating_sub(1);
        }
        self.arena.remove(id)
    }

    /// Record a property change for every subscriber interested in it.
    pub fn set_dirty(&mut self, path: TraitPath, catalog: &dyn TraitCatalog) -> Result<()> {
        let schema = catalog.schema_or_err(path.trait_handle)?;
        for idx in 0..self.arena.slot_count() {
            if let Some((_, handler)) = self.arena.handler_at_mut(idx) {
                if handler.subscribes_to(path.trait_handle) {
                    handler.solver.set_dirty(path, schema)?;
                }
            }
        }
        Ok(())
    }

    /// Any handler with pending work?
    pub fn has_pending_work(&self) -> bool {
        (0..self.arena.slot_count()).any(|i| {
            self.arena
                .handler_at(i)
                .is_some_and(|(_, h)| h.has_pending_work())
        })
    }

    /// Build and send notifies while in-flight budget and pending work
    /// remain. A failed build is logged and charged to the outcome; the
    /// remaining handlers still get their turn.
    pub fn run(&mut self, catalog: &dyn TraitCatalog, sink: &mut dyn NotifySink) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let slot_count = self.arena.slot_count();
        let mut no_progress = 0;

        while self.num_notifies_in_flight < self.config.max_notifies_in_flight
            && no_progress < slot_count
        {
            let mut picked = None;
            for i in 0..slot_count {
                let idx = (self.cur_subscription_idx + i) % slot_count;
                if let Some((_, handler)) = self.arena.handler_at(idx) {
                    if !handler.notify_in_flight && handler.has_pending_work() {
                        picked = Some(idx);
                        break;
                    }
                }
            }
            let Some(idx) = picked else { break };
            // Advance regardless of outcome: this is what keeps one
            // handler from monopolizing consecutive passes.
            self.cur_subscription_idx = (idx + 1) % slot_count;

            match self.build_single_notify_request(idx, catalog, sink) {
                Ok(true) => {
                    outcome.notifies_sent += 1;
                    no_progress = 0;
                }
                Ok(false) => no_progress += 1,
                Err(err) => {
                    log::warn!("[notify] build failed for slot {idx}: {err}");
                    outcome.failed_builds += 1;
                    if outcome.last_error.is_none() {
                        outcome.last_error = Some(err);
                    }
                    no_progress += 1;
                }
            }
        }
        outcome
    }

    /// Delivery outcome for the handler's unconfirmed notify.
    ///
    /// Delivered: the paths packed into that notify are forgotten. Not
    /// delivered: they are merged back into the dirty store (degrading to
    /// whole-instance dirtiness if it overflows) and retried naturally on
    /// the next `run()`.
    pub fn on_notify_confirm(
        &mut self,
        id: SubscriptionId,
        delivered: bool,
        catalog: &dyn TraitCatalog,
    ) -> Result<()> {
        let handler = self.arena.get_mut(id)?;
        if !handler.notify_in_flight {
            return Err(Error::IncorrectState);
        }
        handler.notify_in_flight = false;
        self.num_notifies_in_flight = self.num_notifies_in_flight.saturating_sub(1);

        if delivered {
            handler.in_flight.clear();
            if handler.try_complete_establishment() {
                log::info!(
                    "[notify] subscription {} fully established",
                    handler.subscription_id()
                );
            }
        } else {
            log::warn!(
                "[notify] notify for subscription {} not delivered, re-marking dirty",
                handler.subscription_id()
            );
            Self::restore_dirty(handler, catalog);
        }
        Ok(())
    }

    /// Build one notify for the handler in `idx` and hand it to the sink.
    /// Returns false when the handler produced nothing to send.
    fn build_single_notify_request(
        &mut self,
        idx: usize,
        catalog: &dyn TraitCatalog,
        sink: &mut dyn NotifySink,
    ) -> Result<bool> {
        let result = self.build_and_send(idx, catalog, sink);
        if result.is_err() {
            // The message was abandoned: anything drained into the
            // in-flight list this build must go back to dirty.
            if let Some((_, handler)) = self.arena.handler_at_mut(idx) {
                Self::restore_dirty(handler, catalog);
            }
        }
        result
    }

    fn build_and_send(
        &mut self,
        idx: usize,
        catalog: &dyn TraitCatalog,
        sink: &mut dyn NotifySink,
    ) -> Result<bool> {
        let Some((id, handler)) = self.arena.handler_at_mut(idx) else {
            return Ok(false);
        };

        let mut builder = NotifyRequestBuilder::new(&mut self.scratch);
        builder.start_notify_request(Some(handler.subscription_id()), None)?;
        builder.start_data_list()?;

        let mut message_full = false;

        // A chunked dictionary from the previous message continues first.
        if let Some((handle, cursor)) = handler.pending_chunk.take() {
            match handler.solver.retrieve_trait_instance_data(
                &mut builder,
                handle,
                catalog,
                false,
                Some(cursor),
                &mut handler.in_flight,
            ) {
                Ok(Retrieval { more: Some(next), .. }) => {
                    if next == cursor && builder.data_elements_written() <= 1 {
                        // Not a single item fit into an empty message: no
                        // amount of retrying makes this dictionary fit.
                        handler.pending_chunk = Some((handle, cursor));
                        log::error!(
                            "[notify] dictionary item of trait {handle} exceeds the notify buffer"
                        );
                        return Err(Error::BufferTooSmall);
                    }
                    handler.pending_chunk = Some((handle, next));
                    message_full = true;
                }
                Ok(Retrieval { more: None, .. }) => {
                    // Chunk finished; establishment credit for the trait.
                    if let Some(inst) = handler
                        .instances
                        .iter_mut()
                        .find(|i| i.handle == handle)
                    {
                        inst.retrieve_all_pending = false;
                    }
                }
                Err(Error::BufferTooSmall) => {
                    handler.pending_chunk = Some((handle, cursor));
                    if builder.data_elements_written() == 0 {
                        return Err(Error::BufferTooSmall);
                    }
                    message_full = true;
                }
                Err(err) => {
                    handler.pending_chunk = Some((handle, cursor));
                    return Err(err);
                }
            }
        }

        if !message_full {
            let num_instances = handler.instances.len();
            let start = handler.cur_trait_instance_idx % num_instances.max(1);
            'instances: for k in 0..num_instances {
                let i = (start + k) % num_instances;
                loop {
                    let handle = handler.instances[i].handle;
                    let retrieve_all = handler.instances[i].retrieve_all_pending;
                    if !(retrieve_all || handler.solver.is_dirty(handle)) {
                        break;
                    }
                    match handler.solver.retrieve_trait_instance_data(
                        &mut builder,
                        handle,
                        catalog,
                        retrieve_all,
                        None,
                        &mut handler.in_flight,
                    ) {
                        Ok(Retrieval {
                            more: None,
                            element_written,
                        }) => {
                            handler.instances[i].retrieve_all_pending = false;
                            handler.cur_trait_instance_idx = (i + 1) % num_instances;
                            if !element_written {
                                break;
                            }
                            // Same instance may hold further dirty groups.
                        }
                        Ok(Retrieval { more: Some(cursor), .. }) => {
                            // Dictionary cut mid-element: the message is
                            // full, continuation rides the next one.
                            handler.pending_chunk = Some((handle, cursor));
                            handler.cur_trait_instance_idx = i;
                            break 'instances;
                        }
                        Err(Error::BufferTooSmall) => {
                            if builder.data_elements_written() == 0 {
                                log::error!(
                                    "[notify] diff for trait {handle} exceeds an empty notify buffer"
                                );
                                return Err(Error::BufferTooSmall);
                            }
                            // Element rolled back, instance stays dirty;
                            // resume at this instance next message.
                            handler.cur_trait_instance_idx = i;
                            break 'instances;
                        }
                        Err(err) => {
                            // One broken trait must not silence the rest.
                            log::warn!("[notify] skipping trait {handle}: {err}");
                            handler.cur_trait_instance_idx = (i + 1) % num_instances;
                            break;
                        }
                    }
                }
            }
        }

        if builder.data_elements_written() == 0 {
            return Ok(false);
        }

        builder.end_data_list()?;
        let len = builder.end_notify_request()?;
        let peer = handler.peer_node_id();
        match sink.send_notify(id, peer, &self.scratch[..len]) {
            Ok(()) => {
                handler.notify_in_flight = true;
                self.num_notifies_in_flight += 1;
                log::trace!(
                    "[notify] sent {} bytes to peer {peer:#x} (subscription {})",
                    len,
                    handler.subscription_id()
                );
                Ok(true)
            }
            Err(err) => {
                log::warn!("[notify] send to peer {peer:#x} failed: {err}");
                Err(Error::SendFailed)
            }
        }
    }

    /// Merge the in-flight path list back into the dirty store and drop
    /// any chunk continuation (the element will be re-sent whole).
    fn restore_dirty(handler: &mut SubscriptionHandler, catalog: &dyn TraitCatalog) {
        let mut idx = handler.in_flight.first_valid_item();
        while let Some(i) = idx {
            if let Some(tp) = handler.in_flight.item(i) {
                match catalog.schema(tp.trait_handle) {
                    Some(schema) => {
                        let _ = handler.solver.set_dirty(tp, schema);
                    }
                    None => log::warn!(
                        "[notify] dropping dirty path for unknown trait {}",
                        tp.trait_handle
                    ),
                }
            }
            idx = handler.in_flight.next_valid_item(i);
        }
        handler.in_flight.clear();
        handler.pending_chunk = None;
    }
}
