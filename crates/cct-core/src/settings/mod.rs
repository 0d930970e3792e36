mod store;

pub use store::SettingsStore;
