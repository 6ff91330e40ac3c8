// crates/flowcore/src/events/mod.rs

mod notifier;

pub use notifier::{notify_quietly, BroadcastNotifier, NoopNotifier, NotifyError, StatusChange, StatusNotifier};
