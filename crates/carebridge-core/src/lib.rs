pub mod error;
pub mod events;
pub mod id;
pub mod resource;
pub mod time;

pub use error::{Error, ErrorKind, Result};
pub use events::{
    DeliveryMode, Event, EventContext, EventDispatcher, Subscription, SubscriptionId, Topic,
    TopicPattern,
};
pub use id::generate_id;
pub use resource::{Bundle, BundleEntry, BundleType, Resource, ResourceType};
pub use time::now_utc;
