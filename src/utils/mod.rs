use std::any::Any;

mod worker_pool;

pub use worker_pool::{WorkerPool, WorkerPoolConfig};

/// Renders a caught panic payload for logging, shared by the dispatch path
/// and the worker supervisors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
