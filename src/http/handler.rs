//! Handler chain.
//!
//! A handler inspects or builds the response on a [`Request`] and tells the
//! chain whether to keep going. Response builders on `Request` all return
//! [`Flow::Stop`], so the common shape is `return req.send_string("...")`.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::http::request::Request;

/// Outcome of one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Run the next handler in the chain.
    Continue,
    /// Skip the rest of the chain and finalize the response.
    Stop,
}

/// One step of a handler chain.
///
/// Implemented for any `fn(&mut Request) -> BoxFuture<'_, Flow>`:
///
/// ```ignore
/// fn hello(req: &mut Request) -> BoxFuture<'_, Flow> {
///     Box::pin(async move { req.send_string("hello") })
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Flow> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        (self)(req)
    }
}

pub type BoxedHandler = Arc<dyn Handler>;

/// Box an async handler.
pub fn handler<H: Handler>(h: H) -> BoxedHandler {
    Arc::new(h)
}

/// Handler that never awaits.
struct SyncHandler<F>(F);

impl<F> Handler for SyncHandler<F>
where
    F: Fn(&mut Request) -> Flow + Send + Sync + 'static,
{
    fn call<'a>(&'a self, req: &'a mut Request) -> BoxFuture<'a, Flow> {
        let flow = (self.0)(req);
        Box::pin(std::future::ready(flow))
    }
}

/// Box a synchronous handler, e.g. `sync_handler(|req: &mut Request| req.next())`.
pub fn sync_handler<F>(f: F) -> BoxedHandler
where
    F: Fn(&mut Request) -> Flow + Send + Sync + 'static,
{
    Arc::new(SyncHandler(f))
}

/// Ordered handlers for one route.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<BoxedHandler>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<BoxedHandler>) -> Self {
        Self { handlers }
    }

    /// This chain followed by `more`.
    pub fn extend(&self, more: &[BoxedHandler]) -> Self {
        let mut handlers = self.handlers.clone();
        handlers.extend_from_slice(more);
        Self { handlers }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run handlers in order until one returns [`Flow::Stop`].
    pub async fn run(&self, req: &mut Request) -> Flow {
        for handler in &self.handlers {
            if handler.call(req).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}
