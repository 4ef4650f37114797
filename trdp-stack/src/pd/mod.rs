//! The process-data plane: cyclic latest-value publish/subscribe.

pub mod publisher;
pub mod subscriber;

pub use publisher::{PdEmit, Publication, PublisherIndex, SendCallback};
pub use subscriber::{GetOutcome, PdSample, Subscription, SubscriberIndex, TimeoutPolicy};
