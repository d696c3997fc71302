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

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn};

use crate::network::Connection;
use crate::protocol::{Message, Packet};
use crate::request::interceptor::{Chain, Interceptor, InterceptorChain};
use crate::request::request::ValuePool;
use crate::request::router::Routes;
use crate::request::Request;
use crate::service::WorkerMode;
use crate::utils::{panic_message, WorkerPool, WorkerPoolConfig};
use crate::{AppError, AppResult};

/// The inbound dispatch machinery assembled at server start: the interceptor
/// chain (decode stage, user stages, terminal routing stage) plus the worker
/// pool behind the terminal stage.
pub(crate) struct MsgDispatcher {
    chain: InterceptorChain,
    core: Arc<DispatchCore>,
}

pub(crate) struct DispatcherOptions {
    pub worker_pool_size: usize,
    pub max_worker_task_len: usize,
    pub worker_mode: WorkerMode,
    pub request_pool_mode: bool,
}

impl MsgDispatcher {
    pub(crate) fn start(
        routes: Routes,
        user_interceptors: Vec<Arc<dyn Interceptor>>,
        packet: Arc<dyn Packet>,
        options: DispatcherOptions,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Arc<MsgDispatcher> {
        let value_pool = options
            .request_pool_mode
            .then(|| ValuePool::new(options.worker_pool_size.max(1)));
        let core = Arc::new(DispatchCore {
            routes,
            value_pool,
            binds: DashMap::new(),
            bind_seq: AtomicUsize::new(0),
        });

        let pool = (options.worker_pool_size > 0).then(|| {
            let dispatch_core = core.clone();
            Arc::new(WorkerPool::new(
                notify_shutdown,
                shutdown_complete_tx,
                move |request: Request| {
                    let core = dispatch_core.clone();
                    async move { core.dispatch(request).await }
                },
                WorkerPoolConfig {
                    channel_capacity: options.max_worker_task_len,
                    num_workers: options.worker_pool_size,
                },
            ))
        });

        let mut nodes: Vec<Arc<dyn Interceptor>> = vec![Arc::new(DecodeInterceptor { packet })];
        nodes.extend(user_interceptors);
        nodes.push(Arc::new(DispatchInterceptor {
            core: core.clone(),
            pool,
            worker_mode: options.worker_mode,
            num_workers: options.worker_pool_size,
        }));

        Arc::new(MsgDispatcher {
            chain: InterceptorChain::new(nodes),
            core,
        })
    }

    pub(crate) fn new_request(&self, conn: Arc<Connection>, msg: Message) -> Request {
        match &self.core.value_pool {
            Some(pool) => Request::with_values(conn, msg, pool.checkout()),
            None => Request::new(conn, msg),
        }
    }

    /// Runs a framed message through the interceptor chain. An error means
    /// the stream is corrupt and the connection must close.
    pub(crate) async fn execute(&self, request: Request) -> AppResult<()> {
        self.chain.execute(request).await
    }

    /// Drops per-connection dispatch state once a connection is gone.
    pub(crate) fn release_connection(&self, conn_id: u64) {
        self.core.binds.remove(&conn_id);
    }
}

/// Routing state shared by the terminal interceptor and the worker pool.
pub(crate) struct DispatchCore {
    routes: Routes,
    value_pool: Option<ValuePool>,
    binds: DashMap<u64, usize>,
    bind_seq: AtomicUsize,
}

impl DispatchCore {
    /// Routes one request to its handler(s). Handler panics are contained
    /// here so they never take down a worker or a reader.
    pub(crate) async fn dispatch(&self, mut request: Request) {
        let msg_id = request.message().id();
        let routed = async {
            match &self.routes {
                Routes::Single(map) => match map.get(&msg_id) {
                    Some(router) => {
                        router.pre_handle(&mut request).await;
                        router.handle(&mut request).await;
                        router.post_handle(&mut request).await;
                    }
                    None => {
                        warn!(msg_id, "no router registered, dropping message");
                    }
                },
                Routes::Slices(map) => match map.get(&msg_id) {
                    Some(handlers) => {
                        request.bind_handlers(handlers.clone());
                        request.next().await;
                    }
                    None => {
                        warn!(msg_id, "no route slices registered, dropping message");
                    }
                },
            }
            request
        };

        match AssertUnwindSafe(routed).catch_unwind().await {
            Ok(request) => {
                if let Some(pool) = &self.value_pool {
                    pool.recycle(request.into_values());
                }
            }
            Err(payload) => log_handler_panic(msg_id, payload),
        }
    }
}

/// Logs a caught handler panic with the message id and the first few
/// captured stack frames.
pub(crate) fn log_handler_panic(msg_id: u32, payload: Box<dyn Any + Send>) {
    // std backtraces print two lines per frame
    let frames = Backtrace::force_capture()
        .to_string()
        .lines()
        .take(10)
        .collect::<Vec<_>>()
        .join("\n");
    let reason = panic_message(&*payload);
    error!(msg_id, frames, "handler panicked: {reason}");
}

/// First chain stage: splits the framed bytes into (tag, value) and replaces
/// the skeletal message with the decoded one.
struct DecodeInterceptor {
    packet: Arc<dyn Packet>,
}

#[async_trait]
impl Interceptor for DecodeInterceptor {
    async fn intercept(&self, mut chain: Chain<'_>) -> AppResult<()> {
        let frame = chain.request().message().data().clone();
        let msg = self.packet.unpack(frame)?;
        chain.request_mut().set_message(msg);
        chain.proceed().await
    }
}

/// Terminal chain stage: hands the request to the worker owning this
/// connection, or routes inline when the pool is disabled.
struct DispatchInterceptor {
    core: Arc<DispatchCore>,
    pool: Option<Arc<WorkerPool<Request>>>,
    worker_mode: WorkerMode,
    num_workers: usize,
}

impl DispatchInterceptor {
    fn worker_index(&self, conn_id: u64) -> usize {
        match self.worker_mode {
            WorkerMode::Hash => (conn_id % self.num_workers as u64) as usize,
            WorkerMode::Bind => *self
                .core
                .binds
                .entry(conn_id)
                .or_insert_with(|| {
                    self.core.bind_seq.fetch_add(1, Ordering::Relaxed) % self.num_workers
                }),
        }
    }
}

#[async_trait]
impl Interceptor for DispatchInterceptor {
    async fn intercept(&self, chain: Chain<'_>) -> AppResult<()> {
        let request = chain.into_request();
        match &self.pool {
            Some(pool) => {
                let worker_id = self.worker_index(request.connection().id());
                pool.send(request, worker_id)
                    .await
                    .map_err(|e| AppError::ChannelSend(e.to_string()))
            }
            None => {
                self.core.dispatch(request).await;
                Ok(())
            }
        }
    }
}
