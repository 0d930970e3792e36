mod broker;

pub use broker::{deliver_response, evaluate, PermissionRequest, PermissionResponse};
