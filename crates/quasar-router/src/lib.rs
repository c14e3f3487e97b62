pub mod auth;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod request;
pub mod request_log;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{RouteError, TransportError};
pub use handlers::app;
pub use metrics::RouterMetrics;
pub use pipeline::InferenceRouter;
pub use request::InferenceRequest;
pub use request_log::RequestLog;
pub use state::AppState;
pub use transport::{InferenceReply, Transport, TransportChain};
