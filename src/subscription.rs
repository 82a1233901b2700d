//! Topic subscriptions: the listener registry and notification delivery.

mod dispatcher;
mod registry;

pub(crate) use dispatcher::{Delivery, DeliveryQueue, NotificationDispatcher};
pub(crate) use registry::{
    Attach, JoinedListener, Listener, PendingTopic, Removal, SubscriptionRegistry,
};
pub use registry::SubscriptionHandle;
