//
// options.rs -- map configuration
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the zb-map software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Builder for the six tunables governing directory size, bucket capacity,
//! key/value widths, and the overflow-vs-grow load factor. There is no
//! read/write/create distinction at the type level: whichever `Store` the
//! caller constructs already decides read-only vs. read-write, so a single
//! plain builder suffices.

/// Directory starts at this size (rounded up to a power of two by the
/// caller of [`Options::initial_table_size`]).
pub const DEFAULT_INITIAL_TABLE_SIZE: usize = 32;
/// Hard cap on directory doubling.
pub const DEFAULT_MAX_TABLE_SIZE: usize = 1 << 27;
/// Default blocks per bucket.
pub const DEFAULT_MIN_BLOCK_COUNT_PER_BUCKET: usize = 16;
/// Below this ratio, prefer overflow chaining over directory doubling.
pub const DEFAULT_LOAD_FACTOR_OVERFLOW_LIMIT: f64 = 0.6;

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub(crate) initial_table_size: usize,
    pub(crate) max_table_size: usize,
    pub(crate) min_block_count_per_bucket: usize,
    pub(crate) max_key_length: usize,
    pub(crate) max_value_length: usize,
    pub(crate) load_factor_overflow_limit: f64,
}

impl Options {
    /// Starts a builder; `max_key_length`/`max_value_length` are required
    /// (there is no sane default stored-key/value width) and must be set
    /// before the map can be constructed.
    pub fn new(max_key_length: usize, max_value_length: usize) -> Self {
        Self {
            initial_table_size: DEFAULT_INITIAL_TABLE_SIZE,
            max_table_size: DEFAULT_MAX_TABLE_SIZE,
            min_block_count_per_bucket: DEFAULT_MIN_BLOCK_COUNT_PER_BUCKET,
            max_key_length,
            max_value_length,
            load_factor_overflow_limit: DEFAULT_LOAD_FACTOR_OVERFLOW_LIMIT,
        }
    }

    pub fn initial_table_size(mut self, size: usize) -> Self {
        self.initial_table_size = size.next_power_of_two();
        self
    }

    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn min_block_count_per_bucket(mut self, count: usize) -> Self {
        self.min_block_count_per_bucket = count;
        self
    }

    pub fn load_factor_overflow_limit(mut self, limit: f64) -> Self {
        self.load_factor_overflow_limit = limit;
        self
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    pub fn max_value_length(&self) -> usize {
        self.max_value_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_table() {
        let opts = Options::new(16, 16);
        assert_eq!(opts.initial_table_size, 32);
        assert_eq!(opts.max_table_size, 1 << 27);
        assert_eq!(opts.min_block_count_per_bucket, 16);
        assert!((opts.load_factor_overflow_limit - 0.6).abs() < 1e-9);
    }

    #[test]
    fn initial_table_size_rounds_up_to_power_of_two() {
        let opts = Options::new(16, 16).initial_table_size(20);
        assert_eq!(opts.initial_table_size, 32);
    }
}
