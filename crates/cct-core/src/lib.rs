pub mod cleanup;
pub mod config;
pub mod error;
pub mod git;
pub mod permission;
pub mod rules;
pub mod sdk;
pub mod session;
pub mod settings;
pub mod storage;

pub use config::{ProviderEntry, ServerConfig};
pub use error::{CctError, Result};
pub use permission::{PermissionRequest, PermissionResponse};
pub use rules::{check_always_allow, MatchMode, Rule};
pub use sdk::{AgentSdkClient, MockSdkClient, SdkClientOptions, SdkMessage, SubprocessSdkClient};
pub use session::{
    MessageRecord, MessageRole, Session, SessionManager, SessionOptions, SessionStatus, StatusFilter,
};
pub use settings::SettingsStore;
pub use storage::Storage;
