pub mod api;
pub mod config;
mod controller;
pub mod error;
mod operation;
pub mod store;

pub use api::{HttpUserApi, UserApi};
pub use controller::{IntentListener, SessionController, SessionState};
pub use error::SessionError;
pub use operation::{OperationResult, PendingOperation, SessionResponse};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
