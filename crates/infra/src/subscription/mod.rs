//! Read-side subscriptions.

pub mod catch_up;

pub use catch_up::{batch_size, sla, CatchUpConfig, CatchUpSubscription, SubscriptionState};
