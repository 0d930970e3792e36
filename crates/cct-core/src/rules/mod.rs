mod engine;
mod pattern;

pub use engine::check_always_allow;
pub use pattern::{MatchMode, Rule};
