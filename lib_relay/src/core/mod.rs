//! # Core Module
//!
//! Demand-driven lifecycle of the upstream feed. The [`SubscriptionManager`]
//! reference-counts connected clients and owns the single active
//! [`UpstreamFeed`] activation: the first subscriber starts it, the last one
//! stops it, and no sequence of joins and leaves can ever leave two running.

/// Subscriber reference counting and feed activation.
pub mod subscription;

pub use subscription::{SubscriptionManager, UpstreamFeed};
