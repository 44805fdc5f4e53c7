//! # dataminer-proxy
//!
//! One [`ProxyInstance`] per active conversation: a transparent WebSocket
//! tunnel to the upstream, an in-order [`Dispatcher`] that persists and
//! publishes every upstream event, and return-channel delivery back to the
//! client (inlay or SSE).

pub mod delivery;
pub mod dispatcher;
pub mod instance;
mod notify;
pub mod server;
pub mod tunnel;

pub use delivery::ReturnChannel;
pub use dispatcher::{decide, Action, Dispatcher, FrameOutcome};
pub use instance::{
    ClosedInstance, InstanceConfig, InstanceListeners, InstanceState, ProxyInstance, StopReason,
};
pub use server::load_tls;
