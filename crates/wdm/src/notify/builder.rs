// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Notify request builder.
//!
//! A state machine over one output buffer that packs DataElements into a
//! size-bounded Notify message. Every element write is checkpointed: if it
//! does not fit, the buffer is restored to the last committed element
//! boundary and the element leaves no trace. The partially-filled message
//! stays valid and sendable.
//!
//! # States
//!
//! ```text
//! Idle --start_notify_request--> Ready
//! Ready <--move_to_state--> BuildingDataList
//! Ready <--move_to_state--> BuildingEventList
//! Ready --end_notify_request--> (finalized buffer)
//! ```
//!
//! `move_to_state` is the single transition entry point: it closes whatever
//! list is open before opening the requested one, and rejects transitions
//! that are not part of the diagram with `IncorrectState`.

use super::{
    TAG_DATA_LIST, TAG_ELEMENT_DATA, TAG_ELEMENT_DELETED_KEYS, TAG_ELEMENT_PARTIAL_CHANGE,
    TAG_ELEMENT_PATH, TAG_ELEMENT_VERSION, TAG_EVENT_LIST, TAG_EXPIRY_TIME, TAG_PATH_INSTANCE_ID,
    TAG_PATH_PROFILE_ID, TAG_PATH_RESOURCE_ID, TAG_SUBSCRIPTION_ID,
};
use crate::catalog::TraitLocator;
use crate::config::MAX_PATH_DEPTH;
use crate::error::{Error, Result};
use crate::schema::{PropertyPathHandle, TraitSchemaEngine, ROOT_PROPERTY_PATH_HANDLE};
use crate::tlv::{Checkpoint, Tag, TlvWriter};

/// Builder FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Idle,
    Ready,
    BuildingDataList,
    BuildingEventList,
}

/// Incremental Notify message encoder over a caller-supplied buffer.
pub struct NotifyRequestBuilder<'a> {
    writer: TlvWriter<'a>,
    state: BuilderState,
    data_elements: usize,
}

impl<'a> NotifyRequestBuilder<'a> {
    /// Attach the builder to an empty output buffer.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            writer: TlvWriter::new(buffer),
            state: BuilderState::Idle,
            data_elements: 0,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    /// DataElements committed so far.
    pub fn data_elements_written(&self) -> usize {
        self.data_elements
    }

    pub fn bytes_written(&self) -> usize {
        self.writer.offset()
    }

    /// Open the outer request structure and write the header fields.
    pub fn start_notify_request(
        &mut self,
        subscription_id: Option<u64>,
        expiry_time_ms: Option<i64>,
    ) -> Result<()> {
        if self.state != BuilderState::Idle {
            return Err(Error::IncorrectState);
        }
        self.writer.start_structure(Tag::Anonymous)?;
        if let Some(id) = subscription_id {
            self.writer.put_unsigned(Tag::Context(TAG_SUBSCRIPTION_ID), id)?;
        }
        if let Some(expiry) = expiry_time_ms {
            self.writer.put_signed(Tag::Context(TAG_EXPIRY_TIME), expiry)?;
        }
        self.state = BuilderState::Ready;
        Ok(())
    }

    /// Single allowed transition entry point between the Ready and
    /// list-building states.
    pub fn move_to_state(&mut self, desired: BuilderState) -> Result<()> {
        use BuilderState::{BuildingDataList, BuildingEventList, Ready};

        if self.state == desired {
            return Ok(());
        }
        match (self.state, desired) {
            (Ready, BuildingDataList) => {
                self.writer.start_array(Tag::Context(TAG_DATA_LIST))?;
            }
            (Ready, BuildingEventList) => {
                self.writer.start_array(Tag::Context(TAG_EVENT_LIST))?;
            }
            (BuildingDataList | BuildingEventList, Ready) => {
                self.writer.end_container()?;
            }
            (BuildingDataList, BuildingEventList) => {
                self.writer.end_container()?;
                self.writer.start_array(Tag::Context(TAG_EVENT_LIST))?;
            }
            (BuildingEventList, BuildingDataList) => {
                self.writer.end_container()?;
                self.writer.start_array(Tag::Context(TAG_DATA_LIST))?;
            }
            // Idle is entered and left only through start/end_notify_request.
            _ => return Err(Error::IncorrectState),
        }
        self.state = desired;
        Ok(())
    }

    pub fn start_data_list(&mut self) -> Result<()> {
        self.move_to_state(BuilderState::BuildingDataList)
    }

    pub fn end_data_list(&mut self) -> Result<()> {
        if self.state != BuilderState::BuildingDataList {
            return Err(Error::IncorrectState);
        }
        self.move_to_state(BuilderState::Ready)
    }

    pub fn start_event_list(&mut self) -> Result<()> {
        self.move_to_state(BuilderState::BuildingEventList)
    }

    pub fn end_event_list(&mut self) -> Result<()> {
        if self.state != BuilderState::BuildingEventList {
            return Err(Error::IncorrectState);
        }
        self.move_to_state(BuilderState::Ready)
    }

    /// Write one DataElement; on any failure the buffer is rolled back to
    /// the previous element boundary and the error is returned.
    ///
    /// `write_data` receives the writer and the Data field's tag and
    /// encodes the value at `element_path`; it returns `Some(cursor)` when
    /// it could only write a dictionary prefix (the element is then marked
    /// as a partial change). Application dirty-state is never touched here;
    /// a rollback affects the buffer alone.
    pub fn write_data_element<C, F>(
        &mut self,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        element_path: PropertyPathHandle,
        version: u64,
        deleted_keys: &[u16],
        write_data: F,
    ) -> Result<Option<C>>
    where
        F: FnOnce(&mut TlvWriter<'_>, Tag) -> Result<Option<C>>,
    {
        if self.state != BuilderState::BuildingDataList {
            return Err(Error::IncorrectState);
        }
        let cp = self.writer.checkpoint();
        match self.write_data_element_inner(locator, schema, element_path, version, deleted_keys, write_data)
        {
            Ok(more) => {
                self.data_elements += 1;
                Ok(more)
            }
            Err(err) => {
                // Leave no trace of the partial element.
                self.writer.rollback(cp)?;
                Err(err)
            }
        }
    }

    fn write_data_element_inner<C, F>(
        &mut self,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        element_path: PropertyPathHandle,
        version: u64,
        deleted_keys: &[u16],
        write_data: F,
    ) -> Result<Option<C>>
    where
        F: FnOnce(&mut TlvWriter<'_>, Tag) -> Result<Option<C>>,
    {
        self.writer.start_structure(Tag::Anonymous)?;

        self.write_path(locator, schema, element_path)?;
        self.writer.put_unsigned(Tag::Context(TAG_ELEMENT_VERSION), version)?;

        if !deleted_keys.is_empty() {
            self.writer.start_array(Tag::Context(TAG_ELEMENT_DELETED_KEYS))?;
            for key in deleted_keys {
                self.writer.put_unsigned(Tag::Anonymous, u64::from(*key))?;
            }
            self.writer.end_container()?;
        }

        let more = write_data(&mut self.writer, Tag::Context(TAG_ELEMENT_DATA))?;
        if more.is_some() {
            self.writer.put_bool(Tag::Context(TAG_ELEMENT_PARTIAL_CHANGE), true)?;
        }

        self.writer.end_container()?;
        Ok(more)
    }

    fn write_path(
        &mut self,
        locator: &TraitLocator,
        schema: &dyn TraitSchemaEngine,
        element_path: PropertyPathHandle,
    ) -> Result<()> {
        encode_element_path(&mut self.writer, locator, schema, element_path)
    }

    /// Write one event into the open EventList, checkpointed like a
    /// DataElement.
    pub fn write_event<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut TlvWriter<'_>) -> Result<()>,
    {
        if self.state != BuilderState::BuildingEventList {
            return Err(Error::IncorrectState);
        }
        let cp = self.writer.checkpoint();
        match write(&mut self.writer) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.writer.rollback(cp)?;
                Err(err)
            }
        }
    }

    /// Expose a checkpoint of the underlying writer.
    pub fn checkpoint(&self) -> Checkpoint {
        self.writer.checkpoint()
    }

    /// Roll the underlying writer back; element accounting is the caller's
    /// responsibility when bypassing `write_data_element`.
    pub fn rollback(&mut self, cp: Checkpoint) -> Result<()> {
        self.writer.rollback(cp)
    }

    /// Close any open list and the outer structure; returns the finalized
    /// message length.
    pub fn end_notify_request(mut self) -> Result<usize> {
        match self.state {
            BuilderState::Idle => return Err(Error::IncorrectState),
            BuilderState::BuildingDataList | BuilderState::BuildingEventList => {
                self.move_to_state(BuilderState::Ready)?;
            }
            BuilderState::Ready => {}
        }
        self.writer.end_container()?;
        self.writer.finalize()
    }
}

/// Encode one DataElement Path container: locator fields, then the tags
/// from the trait root down to `element_path`. Shared between the notify
/// builder and the update encoder.
pub(crate) fn encode_element_path(
    writer: &mut TlvWriter<'_>,
    locator: &TraitLocator,
    schema: &dyn TraitSchemaEngine,
    element_path: PropertyPathHandle,
) -> Result<()> {
    writer.start_path(Tag::Context(TAG_ELEMENT_PATH))?;

    let (min_version, max_version) = schema.version_range();
    if (min_version, max_version) == (1, 1) {
        writer.put_unsigned(Tag::Context(TAG_PATH_PROFILE_ID), u64::from(schema.profile_id()))?;
    } else {
        writer.start_array(Tag::Context(TAG_PATH_PROFILE_ID))?;
        writer.put_unsigned(Tag::Anonymous, u64::from(schema.profile_id()))?;
        writer.put_unsigned(Tag::Anonymous, u64::from(max_version))?;
        writer.put_unsigned(Tag::Anonymous, u64::from(min_version))?;
        writer.end_container()?;
    }

    if let Some(resource_id) = locator.resource_id {
        writer.put_unsigned(Tag::Context(TAG_PATH_RESOURCE_ID), resource_id)?;
    }
    if locator.instance_id != 0 {
        writer.put_unsigned(Tag::Context(TAG_PATH_INSTANCE_ID), locator.instance_id)?;
    }

    let mut tags = [Tag::Anonymous; MAX_PATH_DEPTH];
    let n = schema.relative_path_tags(ROOT_PROPERTY_PATH_HANDLE, element_path, &mut tags)?;
    for tag in &tags[..n] {
        writer.put_null(*tag)?;
    }

    writer.end_container()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::testutil::*;
    use crate::tlv::{TlvElement, TlvReader};

    fn locator() -> TraitLocator {
        TraitLocator::default()
    }

    fn count_data_elements(buf: &[u8]) -> usize {
        let mut r = TlvReader::new(buf);
        let mut in_data_list = false;
        let mut count = 0;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            match elem {
                TlvElement::ArrayStart if tag == Tag::Context(TAG_DATA_LIST) => {
                    in_data_list = true;
                }
                TlvElement::StructureStart if in_data_list && r.depth() == 3 => {
                    count += 1;
                }
                TlvElement::ContainerEnd if r.depth() == 1 => {
                    in_data_list = false;
                }
                _ => {}
            }
        }
        count
    }

    fn write_leaf_42(w: &mut TlvWriter<'_>, tag: Tag) -> crate::error::Result<Option<()>> {
        w.put_unsigned(tag, 42)?;
        Ok(None)
    }

    #[test]
    fn test_builder_fsm_happy_path() {
        let schema = test_schema();
        let mut buf = [0u8; 256];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        assert_eq!(b.state(), BuilderState::Idle);

        b.start_notify_request(Some(7), None).expect("start");
        assert_eq!(b.state(), BuilderState::Ready);

        b.start_data_list().expect("data list");
        b.write_data_element(&locator(), &schema, H_C, 3, &[], write_leaf_42)
            .expect("element");
        b.end_data_list().expect("end list");

        let len = b.end_notify_request().expect("finalize");
        assert!(len > 0);
        assert_eq!(count_data_elements(&buf[..len]), 1);
    }

    #[test]
    fn test_builder_rejects_element_outside_data_list() {
        let schema = test_schema();
        let mut buf = [0u8; 256];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        let err = b
            .write_data_element(&locator(), &schema, H_C, 1, &[], write_leaf_42)
            .unwrap_err();
        assert_eq!(err, Error::IncorrectState);
    }

    #[test]
    fn test_builder_move_to_state_is_noop_when_already_there() {
        let mut buf = [0u8; 128];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("open");
        let before = b.bytes_written();
        b.move_to_state(BuilderState::BuildingDataList).expect("noop");
        assert_eq!(b.bytes_written(), before);
    }

    #[test]
    fn test_builder_switches_between_lists() {
        let mut buf = [0u8; 128];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("data");
        b.move_to_state(BuilderState::BuildingEventList).expect("switch");
        assert_eq!(b.state(), BuilderState::BuildingEventList);
        b.write_event(|w| w.put_unsigned(Tag::Anonymous, 1)).expect("event");
        let len = b.end_notify_request().expect("finalize");

        // Both lists decode: DataList closed before EventList opened.
        let mut r = TlvReader::new(&buf[..len]);
        let mut saw_data = false;
        let mut saw_event = false;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            if elem == TlvElement::ArrayStart {
                saw_data |= tag == Tag::Context(TAG_DATA_LIST);
                saw_event |= tag == Tag::Context(TAG_EVENT_LIST);
            }
        }
        assert!(saw_data && saw_event);
    }

    #[test]
    fn test_builder_rollback_atomicity_exact_fit() {
        // P4: size the buffer so that N-1 elements fit and the Nth fails;
        // the finalized buffer must decode to exactly N-1 elements.
        let schema = test_schema();

        // Measure one element.
        let mut probe = [0u8; 512];
        let one_len = {
            let mut b = NotifyRequestBuilder::new(&mut probe);
            b.start_notify_request(None, None).expect("start");
            b.start_data_list().expect("list");
            let before = b.bytes_written();
            b.write_data_element(&locator(), &schema, H_C, 1, &[], write_leaf_42)
                .expect("element");
            b.bytes_written() - before
        };

        // Room for the envelope plus two elements and change.
        let mut buf = vec![0u8; 2 + 2 + 2 * one_len + one_len / 2];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("list");

        let mut written = 0;
        for _ in 0..3 {
            match b.write_data_element(&locator(), &schema, H_C, 1, &[], write_leaf_42) {
                Ok(_) => written += 1,
                Err(Error::BufferTooSmall) => break,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(written, 2);

        b.end_data_list().expect("end list");
        let len = b.end_notify_request().expect("finalize");
        assert_eq!(count_data_elements(&buf[..len]), 2);

        // Every element in the finalized buffer is well-formed.
        let mut r = TlvReader::new(&buf[..len]);
        while r.next().expect("decode clean").is_some() {}
    }

    #[test]
    fn test_builder_partial_change_flag() {
        let schema = test_schema();
        let mut buf = [0u8; 256];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("list");
        b.write_data_element(&locator(), &schema, H_DICT, 1, &[], |w, tag| {
            w.start_structure(tag)?;
            w.end_container()?;
            Ok(Some(()))
        })
        .expect("partial element");
        let len = b.end_notify_request().expect("finalize");

        let mut r = TlvReader::new(&buf[..len]);
        let mut saw_partial = false;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            if tag == Tag::Context(TAG_ELEMENT_PARTIAL_CHANGE) {
                assert_eq!(elem, TlvElement::Bool(true));
                saw_partial = true;
            }
        }
        assert!(saw_partial);
    }

    #[test]
    fn test_builder_deleted_keys_array() {
        let schema = test_schema();
        let mut buf = [0u8; 256];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("list");
        b.write_data_element(&locator(), &schema, H_DICT, 1, &[3, 9], |w, tag| {
            w.start_structure(tag)?;
            w.end_container()?;
            Ok(None::<()>)
        })
        .expect("element");
        let len = b.end_notify_request().expect("finalize");

        let mut r = TlvReader::new(&buf[..len]);
        let mut keys = Vec::new();
        let mut in_deleted = false;
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            match elem {
                TlvElement::ArrayStart if tag == Tag::Context(TAG_ELEMENT_DELETED_KEYS) => {
                    in_deleted = true;
                }
                TlvElement::Unsigned(k) if in_deleted => keys.push(k),
                TlvElement::ContainerEnd if in_deleted => in_deleted = false,
                _ => {}
            }
        }
        assert_eq!(keys, vec![3, 9]);
    }

    #[test]
    fn test_builder_path_encodes_locator_and_tags() {
        let schema = test_schema();
        let mut buf = [0u8; 256];
        let mut b = NotifyRequestBuilder::new(&mut buf);
        b.start_notify_request(None, None).expect("start");
        b.start_data_list().expect("list");
        let loc = TraitLocator {
            resource_id: Some(0xAABB),
            instance_id: 2,
        };
        b.write_data_element(&loc, &schema, H_D, 1, &[], write_leaf_42)
            .expect("element");
        let len = b.end_notify_request().expect("finalize");

        let mut r = TlvReader::new(&buf[..len]);
        let mut in_path = false;
        let mut profile = None;
        let mut resource = None;
        let mut instance = None;
        let mut path_tags = Vec::new();
        while let Some((tag, elem)) = r.next().expect("well-formed") {
            match elem {
                TlvElement::PathStart => in_path = true,
                TlvElement::ContainerEnd if in_path => in_path = false,
                TlvElement::Unsigned(v) if in_path => match tag {
                    Tag::Context(TAG_PATH_PROFILE_ID) => profile = Some(v),
                    Tag::Context(TAG_PATH_RESOURCE_ID) => resource = Some(v),
                    Tag::Context(TAG_PATH_INSTANCE_ID) => instance = Some(v),
                    _ => {}
                },
                TlvElement::Null if in_path => path_tags.push(tag),
                _ => {}
            }
        }
        assert_eq!(profile, Some(u64::from(TEST_PROFILE_ID)));
        assert_eq!(resource, Some(0xAABB));
        assert_eq!(instance, Some(2));
        // root -> a -> b -> d
        assert_eq!(
            path_tags,
            vec![Tag::Context(1), Tag::Context(1), Tag::Context(2)]
        );
    }
}
