//
// bucket.rs -- bucket/block byte layout and arena operations
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the zb-map software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! The arena is an append-only sequence of fixed-size buckets. Each bucket
//! has a header (id, depth, fill count, overflow pointer) followed by a run
//! of fixed-size blocks. This module owns the bit-exact byte layout and the
//! per-bucket operations (`add_block`, `remove_block`, `relocate_block`,
//! `overflow`, ...) that [`crate::ZbMap`] composes into put/get/remove and
//! bucket splitting.
//!
//! ```text
//! Bucket:
//!   off  0: int64  bucketId
//!   off  8: int32  depth
//!   off 12: int32  fillCount
//!   off 16: int64  overflowPointer  (0 = none)
//!   off 24: Block[0..blocksPerBucket]
//!
//! Block:
//!   off  0: int32  blockLength   (0 = free slot, else header + keyLen + valueLen)
//!   off  4: byte[keyLength]      key
//!   off  4 + keyLength: byte[valueLength] value
//! ```

use crate::error::Error;
use crate::ser::{read_i32, read_u64, write_i32, write_u64};
use crate::store::{BufferBacking, LoadedBuffer, Store};
use crate::Result;

/// Byte size of a bucket's fixed header.
pub const BUCKET_HEADER_LEN: u64 = 24;
/// Byte size of a block's fixed header (`blockLength`).
pub const BLOCK_HEADER_LEN: u64 = 4;

/// Layout parameters shared by every bucket in an arena: fixed key/value
/// widths and blocks-per-bucket, computed once at map construction.
#[derive(Debug, Clone, Copy)]
pub struct BucketLayout {
    key_length: usize,
    value_length: usize,
    blocks_per_bucket: usize,
}

impl BucketLayout {
    pub fn new(key_length: usize, value_length: usize, blocks_per_bucket: usize) -> Self {
        Self {
            key_length,
            value_length,
            blocks_per_bucket,
        }
    }

    /// Fixed byte length of a single block, header included.
    pub fn block_len(&self) -> u64 {
        BLOCK_HEADER_LEN + self.key_length as u64 + self.value_length as u64
    }

    /// Fixed byte length of a whole bucket, header and all blocks included.
    pub fn bucket_len(&self) -> u64 {
        BUCKET_HEADER_LEN + self.blocks_per_bucket as u64 * self.block_len()
    }

    /// Absolute store address of block `slot` within the bucket at `addr`.
    fn block_addr(&self, addr: u64, slot: usize) -> u64 {
        addr + BUCKET_HEADER_LEN + slot as u64 * self.block_len()
    }

    fn key_addr(&self, addr: u64, slot: usize) -> u64 {
        self.block_addr(addr, slot) + BLOCK_HEADER_LEN
    }

    fn value_addr(&self, addr: u64, slot: usize) -> u64 {
        self.key_addr(addr, slot) + self.key_length as u64
    }
}

/// In-memory view of a bucket's header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketHeader {
    pub bucket_id: u64,
    pub depth: u32,
    pub fill_count: u32,
    pub overflow_pointer: u64,
}

impl BucketHeader {
    fn decode(buf: &[u8]) -> Self {
        Self {
            bucket_id: read_u64(&buf[0..8]),
            depth: read_i32(&buf[8..12]) as u32,
            fill_count: read_i32(&buf[12..16]) as u32,
            overflow_pointer: read_u64(&buf[16..24]),
        }
    }

    fn encode_into(&self, buf: &mut [u8]) {
        write_u64(&mut buf[0..8], self.bucket_id);
        write_i32(&mut buf[8..12], self.depth as i32);
        write_i32(&mut buf[12..16], self.fill_count as i32);
        write_u64(&mut buf[16..24], self.overflow_pointer);
    }
}

/// The append-only bucket arena. Owns a [`Store`] and a [`BucketLayout`];
/// `high_water_mark` is the next free address for `allocate_new_bucket`.
///
/// Header reads/writes -- by far the hottest, most repeated access pattern
/// (every `add_block`/`remove_block`/`relocate_block`/`overflow` call reads
/// a header before it writes one back) -- go through a single-window
/// [`LoadedBuffer`] rather than a fresh `Store` round trip each time. Block
/// key/value bytes are read directly through the handler capability set
/// instead, since those addresses are scattered across whichever slot a
/// given operation touches and don't share the single hot window's locality.
pub struct BucketArray<S: Store> {
    store: S,
    layout: BucketLayout,
    high_water_mark: u64,
    header_window: LoadedBuffer,
}

impl<S: Store> BucketArray<S> {
    pub fn new(store: S, layout: BucketLayout) -> Self {
        let high_water_mark = store.len();
        Self {
            store,
            layout,
            high_water_mark,
            // `u64::MAX` is not a valid bucket address, so the first real
            // `header()`/`write_header()` call always forces a fresh load
            // rather than matching this sentinel window by coincidence.
            header_window: LoadedBuffer::new(BufferBacking::Heap, u64::MAX, BUCKET_HEADER_LEN as usize),
        }
    }

    pub fn store(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn header(&mut self, addr: u64) -> Result<BucketHeader> {
        self.header_window.ensure_loaded(&mut self.store, addr, BUCKET_HEADER_LEN as usize)?;
        Ok(BucketHeader::decode(self.header_window.as_slice()))
    }

    fn write_header(&mut self, addr: u64, header: &BucketHeader) -> Result<()> {
        self.header_window.ensure_loaded(&mut self.store, addr, BUCKET_HEADER_LEN as usize)?;
        header.encode_into(self.header_window.as_mut_slice());
        self.header_window.write_back(&mut self.store)
    }

    /// Allocates a zero-initialised bucket `(id, depth)`, writes its header,
    /// and advances the high-water mark. Returns the new bucket's address.
    pub fn allocate_new_bucket(&mut self, id: u64, depth: u32) -> Result<u64> {
        let addr = self.high_water_mark;
        let bucket_len = self.layout.bucket_len();
        self.store.write(&vec![0u8; bucket_len as usize], addr)?;
        self.high_water_mark = addr + bucket_len;

        self.write_header(
            addr,
            &BucketHeader {
                bucket_id: id,
                depth,
                fill_count: 0,
                overflow_pointer: 0,
            },
        )?;
        Ok(addr)
    }

    #[cfg(test)]
    fn block_length_field(&mut self, addr: u64, slot: usize) -> Result<i32> {
        let block_addr = self.layout.block_addr(addr, slot);
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        self.store.read(&mut buf, block_addr)?;
        Ok(read_i32(&buf))
    }

    fn set_block_length_field(&mut self, addr: u64, slot: usize, value: i32) -> Result<()> {
        let block_addr = self.layout.block_addr(addr, slot);
        let mut buf = [0u8; BLOCK_HEADER_LEN as usize];
        write_i32(&mut buf, value);
        self.store.write(&buf, block_addr)?;
        Ok(())
    }

    fn occupied_block_len(&self) -> i32 {
        (BLOCK_HEADER_LEN + self.layout.key_length as u64 + self.layout.value_length as u64) as i32
    }

    /// Appends a block at the first free slot in bucket `addr`, writing the
    /// key/value bytes via the supplied closures. Returns `false` (without
    /// mutating the bucket) if the bucket is already full.
    pub fn add_block(
        &mut self,
        addr: u64,
        key_write: impl FnOnce(&mut dyn Store, u64) -> Result<()>,
        value_write: impl FnOnce(&mut dyn Store, u64) -> Result<()>,
    ) -> Result<bool> {
        let header = self.header(addr)?;
        let slot = header.fill_count as usize;
        if slot >= self.layout.blocks_per_bucket {
            return Ok(false);
        }

        let key_addr = self.layout.key_addr(addr, slot);
        let value_addr = self.layout.value_addr(addr, slot);
        key_write(&mut self.store, key_addr)?;
        value_write(&mut self.store, value_addr)?;

        let occupied = self.occupied_block_len();
        self.set_block_length_field(addr, slot, occupied)?;
        self.write_header(
            addr,
            &BucketHeader {
                fill_count: header.fill_count + 1,
                ..header
            },
        )?;
        Ok(true)
    }

    /// Overwrites the value bytes at `(addr, slot)` in place.
    pub fn update_value(
        &mut self,
        addr: u64,
        slot: usize,
        value_write: impl FnOnce(&mut dyn Store, u64) -> Result<()>,
    ) -> Result<()> {
        let value_addr = self.layout.value_addr(addr, slot);
        value_write(&mut self.store, value_addr)
    }

    /// Removes block `slot`, shifting all trailing blocks in the bucket down
    /// by one block length, and decrements fill count. Overflow chain
    /// members are not pulled back into the primary bucket.
    pub fn remove_block(&mut self, addr: u64, slot: usize) -> Result<()> {
        let header = self.header(addr)?;
        let fill_count = header.fill_count as usize;
        debug_assert!(slot < fill_count);

        let block_len = self.layout.block_len() as usize;
        for i in slot..fill_count - 1 {
            let mut buf = vec![0u8; block_len];
            let src = self.layout.block_addr(addr, i + 1);
            self.store.read(&mut buf, src)?;
            let dst = self.layout.block_addr(addr, i);
            self.store.write(&buf, dst)?;
        }

        let last = fill_count - 1;
        self.set_block_length_field(addr, last, 0)?;
        self.write_header(
            addr,
            &BucketHeader {
                fill_count: header.fill_count - 1,
                ..header
            },
        )?;
        Ok(())
    }

    /// Byte-wise compares the caller's key against the key stored at
    /// `(addr, slot)`, via the supplied comparison closure.
    pub fn key_equals(
        &mut self,
        addr: u64,
        slot: usize,
        equals: impl FnOnce(&mut dyn Store, u64) -> Result<bool>,
    ) -> Result<bool> {
        let key_addr = self.layout.key_addr(addr, slot);
        equals(&mut self.store, key_addr)
    }

    pub fn read_key(
        &mut self,
        addr: u64,
        slot: usize,
        read: impl FnOnce(&mut dyn Store, u64) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        read(&mut self.store, self.layout.key_addr(addr, slot))
    }

    pub fn read_value(
        &mut self,
        addr: u64,
        slot: usize,
        read: impl FnOnce(&mut dyn Store, u64) -> Result<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        read(&mut self.store, self.layout.value_addr(addr, slot))
    }

    /// True if slot `slot` of bucket `addr` holds a live block.
    #[cfg(test)]
    fn is_occupied(&mut self, addr: u64, slot: usize) -> Result<bool> {
        Ok(self.block_length_field(addr, slot)? != 0)
    }

    pub fn fill_count(&mut self, addr: u64) -> Result<u32> {
        Ok(self.header(addr)?.fill_count)
    }

    /// Relocates the block at `(src_addr, src_slot)` into `dst_addr`'s first
    /// free slot, then compacts the source bucket as if by `remove_block`.
    /// Fails with [`Error::MapFull`] if `dst_addr` has no free slot.
    pub fn relocate_block(&mut self, src_addr: u64, src_slot: usize, dst_addr: u64) -> Result<()> {
        let dst_header = self.header(dst_addr)?;
        let dst_slot = dst_header.fill_count as usize;
        if dst_slot >= self.layout.blocks_per_bucket {
            return Err(Error::MapFull);
        }

        let block_len = self.layout.block_len() as usize;
        let mut buf = vec![0u8; block_len];
        let src_block_addr = self.layout.block_addr(src_addr, src_slot);
        self.store.read(&mut buf, src_block_addr)?;

        let dst_block_addr = self.layout.block_addr(dst_addr, dst_slot);
        self.store.write(&buf, dst_block_addr)?;

        self.write_header(
            dst_addr,
            &BucketHeader {
                fill_count: dst_header.fill_count + 1,
                ..dst_header
            },
        )?;

        self.remove_block(src_addr, src_slot)
    }

    /// Overwrites the `depth` field of bucket `addr`'s header in place.
    /// Used by a bucket split to raise the filled bucket's local depth.
    pub fn set_depth(&mut self, addr: u64, depth: u32) -> Result<()> {
        let header = self.header(addr)?;
        self.write_header(addr, &BucketHeader { depth, ..header })
    }

    /// Allocates a new bucket sharing `addr`'s `(id, depth)` and links it
    /// via `addr`'s `overflowPointer`. Returns the new bucket's address.
    pub fn overflow(&mut self, addr: u64) -> Result<u64> {
        let header = self.header(addr)?;
        let new_addr = self.allocate_new_bucket(header.bucket_id, header.depth)?;
        self.write_header(
            addr,
            &BucketHeader {
                overflow_pointer: new_addr,
                ..header
            },
        )?;
        Ok(new_addr)
    }

    /// Ratio of used block bytes to allocated block bytes, across only
    /// non-overflow (primary) buckets at the given addresses.
    pub fn load_factor(&mut self, primary_addrs: &[u64]) -> Result<f64> {
        let mut used = 0u64;
        let mut allocated = 0u64;
        let block_len = self.layout.block_len();
        for &addr in primary_addrs {
            let header = self.header(addr)?;
            used += header.fill_count as u64 * block_len;
            allocated += self.layout.blocks_per_bucket as u64 * block_len;
        }
        if allocated == 0 {
            return Ok(0.0);
        }
        Ok(used as f64 / allocated as f64)
    }

    pub fn get_count_of_used_bytes(&mut self, addrs: &[u64]) -> Result<u64> {
        let block_len = self.layout.block_len();
        let mut total = 0u64;
        for &addr in addrs {
            total += self.header(addr)?.fill_count as u64 * block_len;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn layout() -> BucketLayout {
        BucketLayout::new(4, 4, 2)
    }

    fn write_u32_key(store: &mut dyn Store, addr: u64, v: u32) -> Result<()> {
        store.write(&v.to_ne_bytes(), addr)?;
        Ok(())
    }

    fn read_u32_val(store: &mut dyn Store, addr: u64) -> Result<Vec<u8>> {
        let mut buf = [0u8; 4];
        store.read(&mut buf, addr)?;
        Ok(buf.to_vec())
    }

    #[test]
    fn allocate_new_bucket_zero_initialised() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let addr = arena.allocate_new_bucket(3, 2).unwrap();
        let header = arena.header(addr).unwrap();
        assert_eq!(header.bucket_id, 3);
        assert_eq!(header.depth, 2);
        assert_eq!(header.fill_count, 0);
        assert_eq!(header.overflow_pointer, 0);
    }

    #[test]
    fn add_block_fills_then_reports_full() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let addr = arena.allocate_new_bucket(0, 0).unwrap();

        assert!(arena
            .add_block(
                addr,
                |s, a| write_u32_key(s, a, 1),
                |s, a| write_u32_key(s, a, 100)
            )
            .unwrap());
        assert!(arena
            .add_block(
                addr,
                |s, a| write_u32_key(s, a, 2),
                |s, a| write_u32_key(s, a, 200)
            )
            .unwrap());
        assert!(!arena
            .add_block(
                addr,
                |s, a| write_u32_key(s, a, 3),
                |s, a| write_u32_key(s, a, 300)
            )
            .unwrap());

        assert_eq!(arena.fill_count(addr).unwrap(), 2);
    }

    #[test]
    fn remove_block_compacts_trailing_blocks() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let addr = arena.allocate_new_bucket(0, 0).unwrap();
        for (k, v) in [(1u32, 10u32), (2, 20)] {
            arena
                .add_block(addr, |s, a| write_u32_key(s, a, k), |s, a| write_u32_key(s, a, v))
                .unwrap();
        }

        arena.remove_block(addr, 0).unwrap();
        assert_eq!(arena.fill_count(addr).unwrap(), 1);
        let remaining = arena.read_value(addr, 0, read_u32_val).unwrap();
        assert_eq!(u32::from_ne_bytes(remaining.try_into().unwrap()), 20);
        assert!(!arena.is_occupied(addr, 1).unwrap());
    }

    #[test]
    fn relocate_block_moves_and_compacts_source() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let src = arena.allocate_new_bucket(0, 1).unwrap();
        let dst = arena.allocate_new_bucket(2, 2).unwrap();
        arena
            .add_block(src, |s, a| write_u32_key(s, a, 7), |s, a| write_u32_key(s, a, 70))
            .unwrap();

        arena.relocate_block(src, 0, dst).unwrap();

        assert_eq!(arena.fill_count(src).unwrap(), 0);
        assert_eq!(arena.fill_count(dst).unwrap(), 1);
        let moved = arena.read_value(dst, 0, read_u32_val).unwrap();
        assert_eq!(u32::from_ne_bytes(moved.try_into().unwrap()), 70);
    }

    #[test]
    fn overflow_links_new_bucket_same_id_and_depth() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let addr = arena.allocate_new_bucket(5, 3).unwrap();
        let overflow_addr = arena.overflow(addr).unwrap();

        let primary = arena.header(addr).unwrap();
        let secondary = arena.header(overflow_addr).unwrap();
        assert_eq!(primary.overflow_pointer, overflow_addr);
        assert_eq!(secondary.bucket_id, 5);
        assert_eq!(secondary.depth, 3);
    }

    #[test]
    fn header_window_stays_consistent_across_interleaved_buckets() {
        // Regression test for the header-access path through `BucketArray`'s
        // single-window `LoadedBuffer`: reading bucket A, then B, then A
        // again must never return B's (or stale) header fields for A.
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let a = arena.allocate_new_bucket(10, 1).unwrap();
        let b = arena.allocate_new_bucket(20, 2).unwrap();

        assert_eq!(arena.header(a).unwrap().bucket_id, 10);
        assert_eq!(arena.header(b).unwrap().bucket_id, 20);
        assert_eq!(arena.header(a).unwrap().bucket_id, 10);

        arena.set_depth(a, 5).unwrap();
        assert_eq!(arena.header(b).unwrap().depth, 2);
        assert_eq!(arena.header(a).unwrap().depth, 5);
    }

    #[test]
    fn load_factor_reflects_fill_across_buckets() {
        let mut arena = BucketArray::new(MemStore::new(), layout());
        let a = arena.allocate_new_bucket(0, 1).unwrap();
        let b = arena.allocate_new_bucket(1, 1).unwrap();
        arena
            .add_block(a, |s, ad| write_u32_key(s, ad, 1), |s, ad| write_u32_key(s, ad, 1))
            .unwrap();

        // 1 of 4 total block slots used across the two buckets.
        assert!((arena.load_factor(&[a, b]).unwrap() - 0.25).abs() < 1e-9);
    }
}
