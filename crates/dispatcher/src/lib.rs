pub mod dispatcher;
pub mod documents;
pub mod housekeeping;
pub mod links;
pub mod lock;
pub mod queue;
pub mod store;
pub mod templates;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use dispatcher::{DispatchOutcome, DispatchPorts, NotificationDispatcher};
pub use housekeeping::Housekeeper;
