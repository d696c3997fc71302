//! Inbound dispatch: the per-message [`Request`], the interceptor pipeline,
//! and the message-id-addressed routers it terminates in.

pub use interceptor::{Chain, Interceptor, InterceptorChain};
pub use request::Request;
pub use router::{ElapsedTime, Recovery, RouteTable, Router, RouterHandler};

pub(crate) use dispatcher::{DispatcherOptions, MsgDispatcher};

mod dispatcher;
mod interceptor;
mod request;
mod router;
