pub mod notification_store;
pub mod notifier;

pub use notification_store::*;
pub use notifier::*;
