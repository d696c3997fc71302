// Copyright 2025 the tidenet authors
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

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::debug;

use crate::request::dispatcher::log_handler_panic;
use crate::request::Request;
use crate::AppError::IllegalState;
use crate::{AppError, AppResult};

/// Single-handler routing: one router per message id, with three phases run
/// in order. Default implementations are empty so a router defines only the
/// phases it cares about.
#[async_trait]
pub trait Router: Send + Sync {
    async fn pre_handle(&self, _request: &mut Request) {}
    async fn handle(&self, _request: &mut Request) {}
    async fn post_handle(&self, _request: &mut Request) {}
}

/// One stage of a middleware-slice route. Stages continue the chain through
/// [`Request::next`]; returning without calling it terminates the chain.
#[async_trait]
pub trait RouterHandler: Send + Sync {
    async fn handle(&self, request: &mut Request);
}

/// Frozen routing table, read-only while serving.
pub(crate) enum Routes {
    Single(HashMap<u32, Arc<dyn Router>>),
    Slices(HashMap<u32, Arc<Vec<Arc<dyn RouterHandler>>>>),
}

/// Mutable registration surface used before the server starts. The two
/// routing styles are mutually exclusive per instance.
pub struct RouteTable {
    slices_mode: bool,
    single: HashMap<u32, Arc<dyn Router>>,
    slices: HashMap<u32, Vec<Arc<dyn RouterHandler>>>,
    prelude: Vec<Arc<dyn RouterHandler>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        RouteTable::new(false)
    }
}

impl RouteTable {
    pub fn new(slices_mode: bool) -> Self {
        RouteTable {
            slices_mode,
            single: HashMap::new(),
            slices: HashMap::new(),
            prelude: Vec::new(),
        }
    }

    pub fn add_router(&mut self, msg_id: u32, router: Arc<dyn Router>) -> AppResult<()> {
        if self.slices_mode {
            return Err(IllegalState(
                "instance is configured for slices routing".to_string(),
            ));
        }
        if self.single.insert(msg_id, router).is_some() {
            return Err(AppError::InvalidValue(format!(
                "duplicate router for message id {}",
                msg_id
            )));
        }
        Ok(())
    }

    /// Appends a handler run before every per-id chain.
    pub fn use_prelude(&mut self, handler: Arc<dyn RouterHandler>) -> AppResult<()> {
        if !self.slices_mode {
            return Err(IllegalState(
                "prelude handlers require slices routing".to_string(),
            ));
        }
        self.prelude.push(handler);
        Ok(())
    }

    pub fn add_route_slices(
        &mut self,
        msg_id: u32,
        handlers: Vec<Arc<dyn RouterHandler>>,
    ) -> AppResult<()> {
        if !self.slices_mode {
            return Err(IllegalState(
                "instance is configured for single-handler routing".to_string(),
            ));
        }
        if self.slices.insert(msg_id, handlers).is_some() {
            return Err(AppError::InvalidValue(format!(
                "duplicate route slices for message id {}",
                msg_id
            )));
        }
        Ok(())
    }

    pub(crate) fn slices_mode(&self) -> bool {
        self.slices_mode
    }

    pub(crate) fn contains(&self, msg_id: u32) -> bool {
        self.single.contains_key(&msg_id) || self.slices.contains_key(&msg_id)
    }

    pub(crate) fn freeze(self) -> Routes {
        if self.slices_mode {
            let prelude = self.prelude;
            let map = self
                .slices
                .into_iter()
                .map(|(id, handlers)| {
                    let full: Vec<_> = prelude.iter().cloned().chain(handlers).collect();
                    (id, Arc::new(full))
                })
                .collect();
            Routes::Slices(map)
        } else {
            Routes::Single(self.single)
        }
    }
}

/// Catches panics from downstream stages, logs them with the message id, and
/// returns normally so the connection keeps serving.
pub struct Recovery;

#[async_trait]
impl RouterHandler for Recovery {
    async fn handle(&self, request: &mut Request) {
        let msg_id = request.message().id();
        if let Err(payload) = AssertUnwindSafe(request.next()).catch_unwind().await {
            log_handler_panic(msg_id, payload);
        }
    }
}

/// Logs the wall time spent in the downstream stages.
pub struct ElapsedTime;

#[async_trait]
impl RouterHandler for ElapsedTime {
    async fn handle(&self, request: &mut Request) {
        let msg_id = request.message().id();
        let start = Instant::now();
        request.next().await;
        debug!(msg_id, elapsed = ?start.elapsed(), "route chain completed");
    }
}
