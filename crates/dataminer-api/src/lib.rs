//! # dataminer-api
//!
//! The conversation router. Clients connect here first; each conversation id
//! gets its own proxy instance on a random port, and the router answers with
//! a redirect to it. A reaper sweeps instances that lost their connection.

pub mod error;
pub mod ports;
pub mod reaper;
pub mod registry;
pub mod router;

pub use error::ApiError;
pub use ports::PortAllocator;
pub use reaper::{spawn_reaper, ReaperHandle};
pub use registry::{ActiveConversation, ConversationRegistry, RedirectTarget};
pub use router::{app, AppState};
