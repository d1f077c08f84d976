//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Connection accepted by the supervisor's listener
//!     → server.rs (axum router + middleware for this generation)
//!     → router.rs (route table → handler chain)
//!     → request.rs (Request built, chain run, panics recovered)
//!     → handler.rs (handlers in order until one returns Flow::Stop)
//!     → request.rs finalize (status, headers, one Content variant)
//!     → access log record
//! ```

pub mod content;
pub mod diagnostics;
pub mod handler;
pub mod request;
pub mod router;
pub mod server;
pub mod tracker;
pub mod variable;

pub use content::Content;
pub use handler::{handler, sync_handler, BoxedHandler, Flow, Handler, HandlerChain};
pub use request::{BodyError, HandlerPanic, Request};
pub use router::{RouteTable, RouterGroup};
pub use server::{BoxError, InitError, ServerInstance, ServerRuntime, ServerState};
pub use variable::Variable;
