// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked TLV writer over a caller-supplied buffer.
//!
//! Every write is checked against the buffer length and fails with
//! `Error::BufferTooSmall` without mutating the cursor past the end. The
//! writer never allocates; container nesting lives in a fixed depth stack.
//!
//! # Checkpoint / rollback
//!
//! `checkpoint()` snapshots the cursor and container depth into a
//! [`Checkpoint`] value; `rollback()` restores both, erasing every element
//! written in between. A rolled-back buffer is indistinguishable from one
//! where the intervening writes never happened, which is what lets message
//! builders back out a DataElement that did not fit.

use super::{
    ContainerType, Tag, ELEM_ARRAY, ELEM_BOOL_FALSE, ELEM_BOOL_TRUE, ELEM_BYTES_1, ELEM_END,
    ELEM_FLOAT64, ELEM_INT1, ELEM_NULL, ELEM_PATH, ELEM_STRUCTURE, ELEM_UINT1, ELEM_UTF8_1,
    TAG_FORM_ANON, TAG_FORM_CONTEXT, TAG_FORM_IMPLICIT16, TAG_FORM_IMPLICIT32,
};
use crate::config::MAX_TLV_NESTING;
use crate::error::{Error, Result};

/// Snapshot of the writer's cursor and container depth.
///
/// Obtained from [`TlvWriter::checkpoint`]; only valid for rollback on the
/// writer that produced it, and only while no container open at snapshot
/// time has been closed since.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    offset: usize,
    depth: usize,
}

/// TLV writer with container tracking.
pub struct TlvWriter<'a> {
    buffer: &'a mut [u8],
    offset: usize,
    stack: [Option<ContainerType>; MAX_TLV_NESTING],
    depth: usize,
}

impl<'a> TlvWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            stack: [None; MAX_TLV_NESTING],
            depth: 0,
        }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    /// Currently open container depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Snapshot cursor and depth for a later rollback.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            offset: self.offset,
            depth: self.depth,
        }
    }

    /// Restore the writer to a prior checkpoint.
    ///
    /// Fails with `IncorrectState` if a container open at checkpoint time
    /// has been closed since (the stack below the checkpoint would be
    /// unreconstructible).
    pub fn rollback(&mut self, cp: Checkpoint) -> Result<()> {
        if cp.depth > self.depth || cp.offset > self.offset {
            return Err(Error::IncorrectState);
        }
        for slot in self.stack.iter_mut().take(self.depth).skip(cp.depth) {
            *slot = None;
        }
        self.offset = cp.offset;
        self.depth = cp.depth;
        Ok(())
    }

    /// Finish writing; fails if containers remain open.
    pub fn finalize(self) -> Result<usize> {
        if self.depth != 0 {
            return Err(Error::IncorrectState);
        }
        Ok(self.offset)
    }

    pub fn put_unsigned(&mut self, tag: Tag, value: u64) -> Result<()> {
        let (width_code, size) = int_width(value);
        self.put_control_and_tag(ELEM_UINT1 + width_code, tag)?;
        self.put_raw(&value.to_le_bytes()[..size])
    }

    pub fn put_signed(&mut self, tag: Tag, value: i64) -> Result<()> {
        let magnitude = if value < 0 {
            !(value as u64)
        } else {
            value as u64
        };
        // A signed N-byte field holds one less magnitude bit than unsigned.
        let (width_code, size) = int_width(magnitude.saturating_mul(2));
        self.put_control_and_tag(ELEM_INT1 + width_code, tag)?;
        self.put_raw(&value.to_le_bytes()[..size])
    }

    pub fn put_bool(&mut self, tag: Tag, value: bool) -> Result<()> {
        let elem = if value { ELEM_BOOL_TRUE } else { ELEM_BOOL_FALSE };
        self.put_control_and_tag(elem, tag)
    }

    pub fn put_f64(&mut self, tag: Tag, value: f64) -> Result<()> {
        self.put_control_and_tag(ELEM_FLOAT64, tag)?;
        self.put_raw(&value.to_bits().to_le_bytes())
    }

    pub fn put_null(&mut self, tag: Tag) -> Result<()> {
        self.put_control_and_tag(ELEM_NULL, tag)
    }

    pub fn put_string(&mut self, tag: Tag, value: &str) -> Result<()> {
        self.put_length_prefixed(ELEM_UTF8_1, tag, value.as_bytes())
    }

    pub fn put_bytes(&mut self, tag: Tag, value: &[u8]) -> Result<()> {
        self.put_length_prefixed(ELEM_BYTES_1, tag, value)
    }

    pub fn start_structure(&mut self, tag: Tag) -> Result<()> {
        self.start_container(ContainerType::Structure, ELEM_STRUCTURE, tag)
    }

    pub fn start_array(&mut self, tag: Tag) -> Result<()> {
        self.start_container(ContainerType::Array, ELEM_ARRAY, tag)
    }

    pub fn start_path(&mut self, tag: Tag) -> Result<()> {
        self.start_container(ContainerType::Path, ELEM_PATH, tag)
    }

    /// Close the innermost open container.
    pub fn end_container(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::IncorrectState);
        }
        self.put_raw(&[control_byte(TAG_FORM_ANON, ELEM_END)])?;
        self.depth -= 1;
        self.stack[self.depth] = None;
        Ok(())
    }

    fn start_container(&mut self, kind: ContainerType, elem: u8, tag: Tag) -> Result<()> {
        if self.depth >= MAX_TLV_NESTING {
            return Err(Error::NestingTooDeep);
        }
        self.put_control_and_tag(elem, tag)?;
        self.stack[self.depth] = Some(kind);
        self.depth += 1;
        Ok(())
    }

    fn put_length_prefixed(&mut self, base_elem: u8, tag: Tag, value: &[u8]) -> Result<()> {
        let (width_code, size) = int_width(value.len() as u64);
        self.put_control_and_tag(base_elem + width_code, tag)?;
        self.put_raw(&(value.len() as u64).to_le_bytes()[..size])?;
        self.put_raw(value)
    }

    fn put_control_and_tag(&mut self, elem: u8, tag: Tag) -> Result<()> {
        match tag {
            Tag::Anonymous => self.put_raw(&[control_byte(TAG_FORM_ANON, elem)]),
            Tag::Context(num) => {
                self.put_raw(&[control_byte(TAG_FORM_CONTEXT, elem), num])
            }
            Tag::Implicit(num) if num <= 0xFFFF => {
                self.put_raw(&[control_byte(TAG_FORM_IMPLICIT16, elem)])?;
                self.put_raw(&(num as u16).to_le_bytes())
            }
            Tag::Implicit(num) => {
                self.put_raw(&[control_byte(TAG_FORM_IMPLICIT32, elem)])?;
                self.put_raw(&num.to_le_bytes())
            }
        }
    }

    fn put_raw(&mut self, data: &[u8]) -> Result<()> {
        if self.offset + data.len() > self.buffer.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buffer[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(())
    }
}

fn control_byte(tag_form: u8, elem: u8) -> u8 {
    (tag_form << 5) | elem
}

/// Smallest integer width holding `value`: (width code offset, byte count).
fn int_width(value: u64) -> (u8, usize) {
    if value <= u64::from(u8::MAX) {
        (0, 1)
    } else if value <= u64::from(u16::MAX) {
        (1, 2)
    } else if value <= u64::from(u32::MAX) {
        (2, 4)
    } else {
        (3, 8)
    }
}
