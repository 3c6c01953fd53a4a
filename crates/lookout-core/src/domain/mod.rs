//! Domain model (messages and options).

pub mod message;
pub mod options;

pub use message::{Delivery, Message, MessageId};
pub use options::{WatcherOptions, WorkerOptions};
