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

pub use mixtrics::metrics::BoxedRegistry;
pub use wbstore_common::{
    code::{BlockMetadata, ReadFlags, RoutingKey, StorableBlock},
    error::{Error, Result},
    runtime::RuntimeOptions,
};

pub use crate::{
    cache::{WriteBackCache, WriteBackCacheBuilder},
    config::TrackerConfig,
    metrics::Metrics,
    shutdown::ShutdownHook,
    store::BlockStore,
    tracker::{Evicted, FlushTarget, TargetId, Tracker, TrackerBuilder},
};
