//! In-process pub/sub bus wired into every gateway operation.
//!
//! Topics are dotted lowercase paths (`fhir.patient.read`); subscriptions
//! may target an exact topic or a subtree via a trailing `*` wildcard.
//! Synchronous subscribers run inline on the emitter's task, asynchronous
//! subscribers on dedicated worker tasks, both with panic and error
//! isolation so a misbehaving observer can never interrupt the emitter or
//! its siblings.

mod dispatcher;
mod topic;
mod types;

pub use dispatcher::{EventDispatcher, Subscription, SubscriptionId, subscriber};
pub use topic::{Topic, TopicPattern};
pub use types::{DeliveryMode, Event, EventContext, SubscriberError};
