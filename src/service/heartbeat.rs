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

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::network::Connection;
use crate::request::{Request, Router, RouterHandler};
use crate::AppError;

/// Probe messages default to this id unless rebound.
pub const HEARTBEAT_DEFAULT_MSG_ID: u32 = 99999;

pub type HeartbeatMsgFn = Arc<dyn Fn(&Arc<Connection>) -> Vec<u8> + Send + Sync>;
pub type OnRemoteNotAliveFn = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Periodic liveness probe template. The server holds one and binds a clone
/// to every accepted connection; each tick either sends a probe or, once the
/// peer has been silent past the window, fires the not-alive reaction.
#[derive(Clone)]
pub struct HeartbeatChecker {
    interval: Duration,
    msg_id: u32,
    make_msg: HeartbeatMsgFn,
    on_remote_not_alive: OnRemoteNotAliveFn,
}

impl HeartbeatChecker {
    pub fn new(interval: Duration) -> Self {
        HeartbeatChecker {
            interval,
            msg_id: HEARTBEAT_DEFAULT_MSG_ID,
            make_msg: Arc::new(|_conn| b"ping".to_vec()),
            on_remote_not_alive: Arc::new(|conn| conn.stop()),
        }
    }

    pub fn with_msg_id(mut self, msg_id: u32) -> Self {
        self.msg_id = msg_id;
        self
    }

    pub fn with_make_msg(
        mut self,
        f: impl Fn(&Arc<Connection>) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.make_msg = Arc::new(f);
        self
    }

    pub fn with_on_remote_not_alive(
        mut self,
        f: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
    ) -> Self {
        self.on_remote_not_alive = Arc::new(f);
        self
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub(crate) fn spawn(self, conn: Arc<Connection>, heartbeat_max: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(conn_id = conn.id(), "heartbeat checker started");
            loop {
                tokio::select! {
                    _ = conn.cancelled() => break,
                    _ = time::sleep(self.interval) => {
                        if !conn.is_alive(heartbeat_max) {
                            info!(
                                conn_id = conn.id(),
                                window = ?heartbeat_max,
                                "remote not alive, firing reaction"
                            );
                            let reaction = self.on_remote_not_alive.clone();
                            if std::panic::catch_unwind(AssertUnwindSafe(|| reaction(&conn)))
                                .is_err()
                            {
                                error!(conn_id = conn.id(), "not-alive callback panicked");
                                conn.stop();
                            }
                            break;
                        }
                        let payload = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                            (self.make_msg)(&conn)
                        })) {
                            Ok(payload) => payload,
                            Err(_) => {
                                error!(conn_id = conn.id(), "heartbeat message callback panicked");
                                continue;
                            }
                        };
                        match conn.send_buff_msg(self.msg_id, &payload) {
                            Ok(()) => {}
                            Err(AppError::BufferFull) => {
                                warn!(conn_id = conn.id(), "probe skipped, send queue full");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            debug!(conn_id = conn.id(), "heartbeat checker exited");
        })
    }
}

/// Routed handler for inbound probes (single-handler style). Receiving the
/// probe already refreshed the peer's liveness stamp.
pub struct HeartbeatRouter;

#[async_trait]
impl Router for HeartbeatRouter {
    async fn handle(&self, request: &mut Request) {
        debug!(
            conn_id = request.connection().id(),
            "received heartbeat probe"
        );
    }
}

/// Slices-style counterpart of [`HeartbeatRouter`].
pub struct HeartbeatHandler;

#[async_trait]
impl RouterHandler for HeartbeatHandler {
    async fn handle(&self, request: &mut Request) {
        debug!(
            conn_id = request.connection().id(),
            "received heartbeat probe"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let checker = HeartbeatChecker::new(Duration::from_secs(1));
        assert_eq!(checker.msg_id(), HEARTBEAT_DEFAULT_MSG_ID);
        let conn = Connection::mock();
        assert_eq!((checker.make_msg)(&conn), b"ping".to_vec());
    }

    #[test]
    fn test_clone_keeps_binding() {
        let checker = HeartbeatChecker::new(Duration::from_secs(1)).with_msg_id(7);
        assert_eq!(checker.clone().msg_id(), 7);
    }
}
