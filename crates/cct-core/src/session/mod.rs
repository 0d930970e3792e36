pub mod manager;
mod pump;
pub mod types;

pub use manager::{AgentSession, SdkClientFactory, SessionManager};
pub use types::{
    MessageRecord, MessageRole, PermissionMode, Session, SessionOptions, SessionStatus, StatusFilter,
};
