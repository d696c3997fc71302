use std::sync::Arc;

use async_trait::async_trait;

use crate::request::Request;
use crate::AppResult;

/// A stage in the inbound processing pipeline.
///
/// An interceptor receives the chain cursor; it may mutate the request,
/// attach values for later stages, short-circuit by returning without calling
/// [`Chain::proceed`], or await `proceed` to observe post-chain state.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, chain: Chain<'_>) -> AppResult<()>;
}

/// Cursor over the ordered interceptor list: an index plus a borrow of the
/// list, moved by value from stage to stage.
pub struct Chain<'a> {
    nodes: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
}

impl<'a> Chain<'a> {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn into_request(self) -> Request {
        self.request
    }

    /// Advances to the next interceptor; a no-op past the end of the list.
    pub async fn proceed(mut self) -> AppResult<()> {
        match self.nodes.get(self.index) {
            Some(node) => {
                let node = node.clone();
                self.index += 1;
                node.intercept(self).await
            }
            None => Ok(()),
        }
    }
}

/// The ordered pipeline, fixed once the server starts.
pub struct InterceptorChain {
    nodes: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub(crate) fn new(nodes: Vec<Arc<dyn Interceptor>>) -> Self {
        InterceptorChain { nodes }
    }

    pub(crate) async fn execute(&self, request: Request) -> AppResult<()> {
        Chain {
            nodes: &self.nodes,
            index: 0,
            request,
        }
        .proceed()
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::network::Connection;
    use crate::protocol::Message;

    struct Tag {
        key: &'static str,
        order: Arc<AtomicU32>,
        seen_at: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Interceptor for Tag {
        async fn intercept(&self, mut chain: Chain<'_>) -> AppResult<()> {
            self.seen_at
                .store(self.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            chain
                .request_mut()
                .set_value(self.key, Arc::new(true) as Arc<dyn std::any::Any + Send + Sync>);
            chain.proceed().await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Interceptor for ShortCircuit {
        async fn intercept(&self, _chain: Chain<'_>) -> AppResult<()> {
            // drop the chain without proceeding
            Ok(())
        }
    }

    struct MustNotRun;

    #[async_trait]
    impl Interceptor for MustNotRun {
        async fn intercept(&self, _chain: Chain<'_>) -> AppResult<()> {
            panic!("stage past a short-circuit must not run");
        }
    }

    fn request() -> Request {
        Request::new(Connection::mock(), Message::new(1, Bytes::from_static(b"x")))
    }

    #[tokio::test]
    async fn test_stages_run_in_registration_order() {
        let order = Arc::new(AtomicU32::new(0));
        let first = Arc::new(AtomicU32::new(99));
        let second = Arc::new(AtomicU32::new(99));
        let chain = InterceptorChain::new(vec![
            Arc::new(Tag {
                key: "a",
                order: order.clone(),
                seen_at: first.clone(),
            }),
            Arc::new(Tag {
                key: "b",
                order: order.clone(),
                seen_at: second.clone(),
            }),
        ]);
        chain.execute(request()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_the_chain() {
        let chain =
            InterceptorChain::new(vec![Arc::new(ShortCircuit), Arc::new(MustNotRun)]);
        chain.execute(request()).await.unwrap();
    }
}
