//
// handler.rs -- typed key/value accessors: the map's polymorphism boundary
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the zb-map software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! `KeyHandler`/`ValueHandler` know how to hash a key, compare a key against
//! memory at an address, and copy keys/values into and out of memory. They
//! are the map's polymorphism boundary: all raw, unsafe-adjacent byte
//! copying is isolated behind this capability set so [`crate::ZbMap`] itself
//! stays ordinary safe Rust.
//!
//! Handlers are built with explicit constructors (`BytesHandler::new`,
//! `U32Handler::new`, `U64Handler::new`) rather than discovered via runtime
//! type reflection.

use crate::hashutil::hash_key;
use crate::store::Store;
use crate::{Error, Result};

/// Knows how to hash, compare, stage, and copy a fixed-width key.
pub trait KeyHandler {
    /// Fixed width this handler reserves per block.
    fn key_length(&self) -> usize;

    /// Stages `key` as the handler's current operand. Fails with
    /// [`Error::KeyTooLong`] if `key` cannot fit in the handler's reserved
    /// width.
    fn set_key(&mut self, key: &[u8]) -> Result<()>;

    /// Hash of the currently staged key.
    fn hash(&self) -> u32;

    /// Byte-wise compares the staged key against the key stored at
    /// `address` in `store`.
    fn equals_key_at(&self, store: &mut dyn Store, address: u64) -> Result<bool>;

    /// Writes the staged key to `address`.
    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()>;

    /// Reads the logical key bytes stored at `address`.
    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>>;
}

/// Knows how to stage and copy a fixed-width value.
pub trait ValueHandler {
    /// Fixed width this handler reserves per block.
    fn value_length(&self) -> usize;

    /// Stages `value` as the handler's current operand. Fails with
    /// [`Error::ValueTooLong`] if `value` cannot fit in the handler's
    /// reserved width.
    fn set_value(&mut self, value: &[u8]) -> Result<()>;

    /// Writes the staged value to `address`.
    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()>;

    /// Reads the logical value bytes stored at `address`.
    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>>;
}

const LEN_PREFIX: usize = 4;

/// Variable-length byte-array handler.
///
/// The reserved slot is `LEN_PREFIX + max_len` bytes: a 4-byte native-endian
/// length prefix followed by up to `max_len` content bytes, zero-padded.
/// This lets `key_length()`/`value_length()` stay a single fixed width (as
/// the bucket layout requires) while still storing keys/values shorter than
/// the configured maximum without ambiguity from zero-padding alone.
#[derive(Debug, Clone)]
pub struct BytesHandler {
    max_len: usize,
    staged: Vec<u8>,
}

impl BytesHandler {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            staged: Vec::new(),
        }
    }

    fn slot_len(&self) -> usize {
        LEN_PREFIX + self.max_len
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_len {
            return Err(Error::KeyTooLong {
                supplied: len,
                max: self.max_len,
            });
        }
        Ok(())
    }

    fn encode(&self, bytes: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; self.slot_len()];
        buf[..LEN_PREFIX].copy_from_slice(&(bytes.len() as u32).to_ne_bytes());
        buf[LEN_PREFIX..LEN_PREFIX + bytes.len()].copy_from_slice(bytes);
        buf
    }

    fn decode(&self, slot: &[u8]) -> Vec<u8> {
        let len = u32::from_ne_bytes(slot[..LEN_PREFIX].try_into().unwrap()) as usize;
        slot[LEN_PREFIX..LEN_PREFIX + len].to_vec()
    }
}

impl KeyHandler for BytesHandler {
    fn key_length(&self) -> usize {
        self.slot_len()
    }

    fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.check_len(key.len())?;
        self.staged = key.to_vec();
        Ok(())
    }

    fn hash(&self) -> u32 {
        hash_key(&self.staged)
    }

    fn equals_key_at(&self, store: &mut dyn Store, address: u64) -> Result<bool> {
        let mut slot = vec![0u8; self.slot_len()];
        store.read(&mut slot, address)?;
        Ok(self.decode(&slot) == self.staged)
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        store.write(&self.encode(&self.staged), address)?;
        Ok(())
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        let mut slot = vec![0u8; self.slot_len()];
        store.read(&mut slot, address)?;
        Ok(self.decode(&slot))
    }
}

impl ValueHandler for BytesHandler {
    fn value_length(&self) -> usize {
        self.slot_len()
    }

    fn set_value(&mut self, value: &[u8]) -> Result<()> {
        self.check_len(value.len()).map_err(|e| match e {
            Error::KeyTooLong { supplied, max } => Error::ValueTooLong { supplied, max },
            other => other,
        })?;
        self.staged = value.to_vec();
        Ok(())
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        KeyHandler::write_to(self, store, address)
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        KeyHandler::read_from(self, store, address)
    }
}

/// Packed 4-byte unsigned integer handler: an exact fixed width, no length
/// prefix needed.
#[derive(Debug, Clone, Default)]
pub struct U32Handler {
    staged: u32,
}

impl U32Handler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyHandler for U32Handler {
    fn key_length(&self) -> usize {
        4
    }

    fn set_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != 4 {
            return Err(Error::KeyTooLong {
                supplied: key.len(),
                max: 4,
            });
        }
        self.staged = u32::from_ne_bytes(key.try_into().unwrap());
        Ok(())
    }

    fn hash(&self) -> u32 {
        hash_key(&self.staged.to_ne_bytes())
    }

    fn equals_key_at(&self, store: &mut dyn Store, address: u64) -> Result<bool> {
        let mut buf = [0u8; 4];
        store.read(&mut buf, address)?;
        Ok(u32::from_ne_bytes(buf) == self.staged)
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        store.write(&self.staged.to_ne_bytes(), address)?;
        Ok(())
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        let mut buf = [0u8; 4];
        store.read(&mut buf, address)?;
        Ok(buf.to_vec())
    }
}

/// Packed 8-byte unsigned integer ("long") handler: an exact fixed width.
#[derive(Debug, Clone, Default)]
pub struct U64Handler {
    staged: u64,
}

impl U64Handler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyHandler for U64Handler {
    fn key_length(&self) -> usize {
        8
    }

    fn set_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != 8 {
            return Err(Error::KeyTooLong {
                supplied: key.len(),
                max: 8,
            });
        }
        self.staged = u64::from_ne_bytes(key.try_into().unwrap());
        Ok(())
    }

    fn hash(&self) -> u32 {
        hash_key(&self.staged.to_ne_bytes())
    }

    fn equals_key_at(&self, store: &mut dyn Store, address: u64) -> Result<bool> {
        let mut buf = [0u8; 8];
        store.read(&mut buf, address)?;
        Ok(u64::from_ne_bytes(buf) == self.staged)
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        store.write(&self.staged.to_ne_bytes(), address)?;
        Ok(())
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        let mut buf = [0u8; 8];
        store.read(&mut buf, address)?;
        Ok(buf.to_vec())
    }
}

impl ValueHandler for U32Handler {
    fn value_length(&self) -> usize {
        4
    }

    fn set_value(&mut self, value: &[u8]) -> Result<()> {
        KeyHandler::set_key(self, value).map_err(|e| match e {
            Error::KeyTooLong { supplied, max } => Error::ValueTooLong { supplied, max },
            other => other,
        })
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        KeyHandler::write_to(self, store, address)
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        KeyHandler::read_from(self, store, address)
    }
}

impl ValueHandler for U64Handler {
    fn value_length(&self) -> usize {
        8
    }

    fn set_value(&mut self, value: &[u8]) -> Result<()> {
        KeyHandler::set_key(self, value).map_err(|e| match e {
            Error::KeyTooLong { supplied, max } => Error::ValueTooLong { supplied, max },
            other => other,
        })
    }

    fn write_to(&self, store: &mut dyn Store, address: u64) -> Result<()> {
        KeyHandler::write_to(self, store, address)
    }

    fn read_from(&self, store: &mut dyn Store, address: u64) -> Result<Vec<u8>> {
        KeyHandler::read_from(self, store, address)
    }
}
