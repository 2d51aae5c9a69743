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

use crate::code::RoutingKey;

/// Error returned by write-back caches and backing stores.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A non-overwrite put targets a key that already holds different content.
    #[error("key collision: {key}")]
    Collision {
        /// The routing key that collided.
        key: RoutingKey,
    },
    /// Block content failed verification.
    #[error("verify error: {0}")]
    Verify(String),
    /// I/O error from a backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The store has been closed.
    #[error("store closed")]
    Closed,
    /// Config error.
    #[error("config error: {0}")]
    Config(String),
    /// Other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a collision error for the given key.
    pub fn collision(key: RoutingKey) -> Self {
        Self::Collision { key }
    }

    /// Build a verify error.
    pub fn verify(msg: impl Into<String>) -> Self {
        Self::Verify(msg.into())
    }

    /// Build a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap any other error.
    pub fn other(e: impl Into<anyhow::Error>) -> Self {
        Self::Other(e.into())
    }

    /// Returns `true` if the error is a key collision.
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }
}

/// Result type for wbstore.
pub type Result<T> = core::result::Result<T, Error>;
