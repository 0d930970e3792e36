mod client;
mod mock;
mod subprocess;

pub use client::{
    AgentSdkClient, CanUseTool, CanUseToolFuture, ContentBlock, ImageSource, PermissionDecision,
    SdkClientOptions, SdkMessage, SdkTurnResult,
};
pub use mock::MockSdkClient;
pub use subprocess::SubprocessSdkClient;
