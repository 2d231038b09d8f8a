//! Structural check of v1 updates before they reach yrs.
//!
//! yrs turns string payloads into `str` without validating them, so a delta
//! carrying invalid UTF-8 corrupts the document store. [`check_update_v1`]
//! walks the block layout in the same order as `Update::decode_v1` and
//! rejects the update if any string, key or type name is not UTF-8. It also
//! bounds element counts by the remaining input and caps nesting of
//! embedded values.

use std::str::Utf8Error;
use thiserror::Error;
use yrs::block::{
    ClientID, BLOCK_GC_REF_NUMBER, BLOCK_ITEM_ANY_REF_NUMBER, BLOCK_ITEM_BINARY_REF_NUMBER,
    BLOCK_ITEM_DELETED_REF_NUMBER, BLOCK_ITEM_DOC_REF_NUMBER, BLOCK_ITEM_EMBED_REF_NUMBER,
    BLOCK_ITEM_FORMAT_REF_NUMBER, BLOCK_ITEM_JSON_REF_NUMBER, BLOCK_ITEM_MOVE_REF_NUMBER,
    BLOCK_ITEM_STRING_REF_NUMBER, BLOCK_ITEM_TYPE_REF_NUMBER, BLOCK_SKIP_REF_NUMBER,
    HAS_ORIGIN, HAS_PARENT_SUB, HAS_RIGHT_ORIGIN,
};
use yrs::encoding::read::{self, Cursor, Read};
use yrs::types::{
    TYPE_REFS_ARRAY, TYPE_REFS_DOC, TYPE_REFS_MAP, TYPE_REFS_TEXT, TYPE_REFS_UNDEFINED,
    TYPE_REFS_XML_ELEMENT, TYPE_REFS_XML_FRAGMENT, TYPE_REFS_XML_HOOK, TYPE_REFS_XML_TEXT,
};

/// Deepest nesting of arrays and maps accepted inside one embedded value.
pub const MAX_VALUE_DEPTH: usize = 128;

// Tags of the binary `Any` encoding.
const ANY_UNDEFINED: u8 = 127;
const ANY_NULL: u8 = 126;
const ANY_INTEGER: u8 = 125;
const ANY_FLOAT32: u8 = 124;
const ANY_FLOAT64: u8 = 123;
const ANY_BIGINT: u8 = 122;
const ANY_FALSE: u8 = 121;
const ANY_TRUE: u8 = 120;
const ANY_STRING: u8 = 119;
const ANY_MAP: u8 = 118;
const ANY_ARRAY: u8 = 117;
const ANY_BUFFER: u8 = 116;

#[derive(Debug, Error)]
pub enum InvalidUpdate {
    #[error(transparent)]
    Read(#[from] read::Error),
    #[error("string payload is not valid UTF-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("unknown {kind} tag {tag}")]
    UnknownTag { kind: &'static str, tag: u8 },
    #[error("count {0} exceeds the remaining input")]
    Count(u64),
    #[error("embedded value nested too deeply")]
    TooDeep,
}

/// Check that `update` is safe to hand to `Update::decode_v1`.
///
/// Only the block section is walked: the delete set that follows it holds
/// integers only.
pub fn check_update_v1(update: &[u8]) -> Result<(), InvalidUpdate> {
    let mut walker = Walker {
        cursor: Cursor::new(update),
    };

    let clients = walker.count()?;
    for _ in 0..clients {
        let blocks = walker.count()?;
        let _client: u32 = walker.cursor.read_var()?;
        let _clock: u32 = walker.cursor.read_var()?;
        for _ in 0..blocks {
            walker.block()?;
        }
    }
    Ok(())
}

struct Walker<'a> {
    cursor: Cursor<'a>,
}

impl Walker<'_> {
    fn remaining(&self) -> usize {
        self.cursor.buf.len() - self.cursor.next
    }

    /// An element count. Every element takes at least one byte.
    fn count(&mut self) -> Result<u64, InvalidUpdate> {
        let count: u64 = self.cursor.read_var()?;
        if count > self.remaining() as u64 {
            return Err(InvalidUpdate::Count(count));
        }
        Ok(count)
    }

    fn string(&mut self) -> Result<(), InvalidUpdate> {
        let raw = self.cursor.read_buf()?;
        std::str::from_utf8(raw)?;
        Ok(())
    }

    fn id(&mut self) -> Result<(), InvalidUpdate> {
        let _client: u32 = self.cursor.read_var()?;
        let _clock: u32 = self.cursor.read_var()?;
        Ok(())
    }

    fn block(&mut self) -> Result<(), InvalidUpdate> {
        let info = self.cursor.read_u8()?;
        if info == BLOCK_SKIP_REF_NUMBER || info == BLOCK_GC_REF_NUMBER {
            let _len: u32 = self.cursor.read_var()?;
            return Ok(());
        }

        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        // Without origins the item names its parent explicitly.
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            let named_root: u32 = self.cursor.read_var()?;
            if named_root == 1 {
                self.string()?;
            } else {
                self.id()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.string()?;
            }
        }

        self.content(info & 0b1111)
    }

    fn content(&mut self, kind: u8) -> Result<(), InvalidUpdate> {
        match kind {
            BLOCK_ITEM_DELETED_REF_NUMBER => {
                let _len: u32 = self.cursor.read_var()?;
            }
            BLOCK_ITEM_JSON_REF_NUMBER => {
                // yrs reads one string past the stored count.
                let count = self.count()?;
                for _ in 0..=count {
                    self.string()?;
                }
            }
            BLOCK_ITEM_BINARY_REF_NUMBER => {
                self.cursor.read_buf()?;
            }
            BLOCK_ITEM_STRING_REF_NUMBER | BLOCK_ITEM_EMBED_REF_NUMBER => self.string()?,
            BLOCK_ITEM_FORMAT_REF_NUMBER => {
                self.string()?;
                self.string()?;
            }
            BLOCK_ITEM_TYPE_REF_NUMBER => self.type_ref()?,
            BLOCK_ITEM_ANY_REF_NUMBER => {
                let count = self.count()?;
                for _ in 0..count {
                    self.value(0)?;
                }
            }
            BLOCK_ITEM_DOC_REF_NUMBER => {
                self.string()?;
                self.value(0)?;
            }
            BLOCK_ITEM_MOVE_REF_NUMBER => {
                let flags: i32 = self.cursor.read_var()?;
                let _start_client: ClientID = self.cursor.read_var()?;
                let _start_clock: u32 = self.cursor.read_var()?;
                if flags & 0b1 == 0 {
                    let _end_client: ClientID = self.cursor.read_var()?;
                    let _end_clock: u32 = self.cursor.read_var()?;
                }
            }
            tag => return Err(InvalidUpdate::UnknownTag { kind: "content", tag }),
        }
        Ok(())
    }

    fn type_ref(&mut self) -> Result<(), InvalidUpdate> {
        match self.cursor.read_u8()? {
            TYPE_REFS_XML_ELEMENT => self.string(),
            TYPE_REFS_ARRAY | TYPE_REFS_MAP | TYPE_REFS_TEXT | TYPE_REFS_XML_FRAGMENT
            | TYPE_REFS_XML_HOOK | TYPE_REFS_XML_TEXT | TYPE_REFS_DOC | TYPE_REFS_UNDEFINED => {
                Ok(())
            }
            tag => Err(InvalidUpdate::UnknownTag { kind: "type", tag }),
        }
    }

    fn value(&mut self, depth: usize) -> Result<(), InvalidUpdate> {
        if depth > MAX_VALUE_DEPTH {
            return Err(InvalidUpdate::TooDeep);
        }
        match self.cursor.read_u8()? {
            ANY_UNDEFINED | ANY_NULL | ANY_FALSE | ANY_TRUE => {}
            ANY_INTEGER => {
                let _value: i64 = self.cursor.read_var()?;
            }
            ANY_FLOAT32 => {
                self.cursor.read_exact(4)?;
            }
            ANY_FLOAT64 | ANY_BIGINT => {
                self.cursor.read_exact(8)?;
            }
            ANY_STRING => self.string()?,
            ANY_MAP => {
                let count = self.count()?;
                for _ in 0..count {
                    self.string()?;
                    self.value(depth + 1)?;
                }
            }
            ANY_ARRAY => {
                let count = self.count()?;
                for _ in 0..count {
                    self.value(depth + 1)?;
                }
            }
            ANY_BUFFER => {
                self.cursor.read_buf()?;
            }
            tag => return Err(InvalidUpdate::UnknownTag { kind: "value", tag }),
        }
        Ok(())
    }
}
