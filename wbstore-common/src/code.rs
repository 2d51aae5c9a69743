// Copyright 2026 wbstore Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Debug, Display};

use bitflags::bitflags;
use bytes::Bytes;

/// Fixed-length, content-derived identifier used to look up a block.
///
/// Cloning a routing key is cheap, the bytes are reference counted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(Bytes);

impl RoutingKey {
    /// Create a routing key from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Create a routing key by copying the given slice.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Raw bytes of the routing key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the routing key in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the routing key has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for RoutingKey {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for RoutingKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl AsRef<[u8]> for RoutingKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Debug for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RoutingKey({self})")
    }
}

/// A fixed-size, content-addressed immutable record persisted by a block store.
///
/// Content equality is expressed through [`PartialEq`]: two blocks are equal if and only if they carry the same
/// content under the same key.
pub trait StorableBlock: Send + Sync + Debug + PartialEq + 'static {
    /// The routing key used to look up the block.
    fn routing_key(&self) -> RoutingKey;

    /// The full key of the block, used to verify reconstructed content.
    fn full_key(&self) -> &[u8];
}

bitflags! {
    /// Caller-supplied flags for block reads.
    ///
    /// The write-back layer never interprets them; they are passed through to the backing store and to block
    /// reconstruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadFlags: u8 {
        /// Do not promote the block on a backing store hit.
        const DONT_PROMOTE = 1;
        /// The caller may read blocks from the client cache.
        const CAN_READ_CLIENT_CACHE = 1 << 1;
        /// The caller may read blocks from the slashdot cache.
        const CAN_READ_SLASHDOT_CACHE = 1 << 2;
        /// Ignore blocks stored in the legacy format.
        const IGNORE_OLD_BLOCKS = 1 << 3;
    }
}

/// Metadata reported back to the caller by a block read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockMetadata {
    old_block: bool,
}

impl BlockMetadata {
    /// Mark the block as stored in the legacy format.
    pub fn set_old_block(&mut self) {
        self.old_block = true;
    }

    /// Returns `true` if the block was stored in the legacy format.
    pub fn is_old_block(&self) -> bool {
        self.old_block
    }
}
