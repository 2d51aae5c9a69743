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

use std::sync::Arc;

use bytes::Bytes;
use wbstore_common::{
    code::{BlockMetadata, ReadFlags, RoutingKey, StorableBlock},
    error::Result,
};

/// A fixed-record block store.
///
/// [`crate::WriteBackCache`] implements this trait as well, so it can be placed in front of any conforming store as a
/// drop-in proxy.
pub trait BlockStore: Send + Sync + 'static {
    /// The block type persisted by the store.
    type Block: StorableBlock + Clone;

    /// Fetch a block.
    ///
    /// Returns `Ok(None)` if the block is not in the store. Fails with [`wbstore_common::error::Error::Verify`] if
    /// the stored content is corrupt or does not match `full_key`.
    fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Option<Self::Block>>;

    /// Persist a block with its raw data and header.
    ///
    /// Fails with [`wbstore_common::error::Error::Collision`] if `overwrite` is not set and the key already holds
    /// different content in a collision-possible store.
    fn put(&self, block: Self::Block, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()>;

    /// Probabilistic membership test. False positives are allowed, false negatives are not.
    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool;

    /// Rebuild and verify a block from its raw data and header.
    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Self::Block>;

    /// Size of one on-disk record. Uniform for every block of the store.
    fn entry_record_size(&self) -> usize;

    /// Returns `true` if two different contents can map to the same routing key.
    fn collisions_possible(&self) -> bool;

    /// Start the store.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Close the store.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl<S> BlockStore for Arc<S>
where
    S: BlockStore,
{
    type Block = S::Block;

    fn fetch(
        &self,
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Option<Self::Block>> {
        (**self).fetch(routing_key, full_key, flags, meta)
    }

    fn put(&self, block: Self::Block, data: Bytes, header: Bytes, overwrite: bool, old_block: bool) -> Result<()> {
        (**self).put(block, data, header, overwrite, old_block)
    }

    fn probably_in_store(&self, routing_key: &RoutingKey) -> bool {
        (**self).probably_in_store(routing_key)
    }

    fn construct(
        &self,
        data: &[u8],
        header: &[u8],
        routing_key: &RoutingKey,
        full_key: &[u8],
        flags: ReadFlags,
        meta: Option<&mut BlockMetadata>,
    ) -> Result<Self::Block> {
        (**self).construct(data, header, routing_key, full_key, flags, meta)
    }

    fn entry_record_size(&self) -> usize {
        (**self).entry_record_size()
    }

    fn collisions_possible(&self) -> bool {
        (**self).collisions_possible()
    }

    fn start(&self) -> Result<()> {
        (**self).start()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}
