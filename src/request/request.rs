use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::network::Connection;
use crate::protocol::Message;
use crate::request::RouterHandler;

type ValueMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Everything a handler sees for one inbound message: the connection it
/// arrived on, the (decoded) message, a per-request key-value store, and the
/// cursor over the slices-router handler chain.
///
/// A request lives from framing until the handler chain returns; handlers
/// must not stash references to it past that point.
pub struct Request {
    conn: Arc<Connection>,
    msg: Message,
    values: ValueMap,
    handlers: Arc<Vec<Arc<dyn RouterHandler>>>,
    step: usize,
}

impl Request {
    pub(crate) fn new(conn: Arc<Connection>, msg: Message) -> Self {
        Self::with_values(conn, msg, ValueMap::default())
    }

    pub(crate) fn with_values(conn: Arc<Connection>, msg: Message, values: ValueMap) -> Self {
        Request {
            conn,
            msg,
            values,
            handlers: Arc::new(Vec::new()),
            step: 0,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub(crate) fn set_message(&mut self, msg: Message) {
        self.msg = msg;
    }

    /// Attaches an opaque value visible to later interceptors and handlers.
    pub fn set_value(&mut self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.values.insert(key.into(), value);
    }

    pub fn value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.get(key).cloned()
    }

    /// Typed accessor over [`Request::value`].
    pub fn value_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.value(key).and_then(|v| v.downcast::<T>().ok())
    }

    pub fn remove_value(&mut self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.remove(key)
    }

    pub(crate) fn bind_handlers(&mut self, handlers: Arc<Vec<Arc<dyn RouterHandler>>>) {
        self.handlers = handlers;
        self.step = 0;
    }

    /// Runs the next handler in the slices chain. A handler that returns
    /// without calling `next` terminates the chain.
    pub async fn next(&mut self) {
        let handlers = self.handlers.clone();
        if let Some(handler) = handlers.get(self.step) {
            self.step += 1;
            handler.handle(self).await;
        }
    }

    /// Pins the cursor past the end of the chain so no further handler runs.
    pub fn abort(&mut self) {
        self.step = self.handlers.len();
    }

    pub(crate) fn into_values(self) -> ValueMap {
        self.values
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("conn_id", &self.conn.id())
            .field("msg", &self.msg)
            .field("step", &self.step)
            .finish()
    }
}

/// Free-list of per-request value maps, sized one slot per worker. Checked
/// out maps are cleared before reuse, so a recycled request never observes a
/// previous request's values.
pub(crate) struct ValuePool {
    slots: ArrayQueue<ValueMap>,
}

impl ValuePool {
    pub(crate) fn new(capacity: usize) -> Self {
        ValuePool {
            slots: ArrayQueue::new(capacity),
        }
    }

    pub(crate) fn checkout(&self) -> ValueMap {
        self.slots.pop().unwrap_or_default()
    }

    pub(crate) fn recycle(&self, mut values: ValueMap) {
        values.clear();
        let _ = self.slots.push(values);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_values_round_trip() {
        let conn = Connection::mock();
        let mut req = Request::new(conn, Message::new(1, Bytes::from_static(b"x")));
        req.set_value("who", Arc::new("tester".to_string()));
        assert_eq!(*req.value_as::<String>("who").unwrap(), "tester");
        assert!(req.value_as::<u32>("who").is_none());
        req.remove_value("who");
        assert!(req.value("who").is_none());
    }

    #[test]
    fn test_pool_clears_recycled_maps() {
        let pool = ValuePool::new(2);
        let mut values = pool.checkout();
        values.insert("k".into(), Arc::new(1u32) as Arc<dyn Any + Send + Sync>);
        pool.recycle(values);
        assert!(pool.checkout().is_empty());
    }
}
