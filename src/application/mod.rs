//! Application layer - the subscription multiplexer and delivery engine.
//!
//! - `name_resolver` - primary ↔ internal metric names
//! - `subscription_registry` - refcounted upstream subscriptions
//! - `rate_limiter` - per-metric delivery gate
//! - `dispatcher` - facade tying the above together; receives broker samples

mod dispatcher;
mod error;
mod name_resolver;
mod rate_limiter;
mod subscription_registry;

pub use dispatcher::Dispatcher;
pub use error::SinkError;
pub use name_resolver::NameResolver;
pub use rate_limiter::RateLimiter;
pub use subscription_registry::SubscriptionRegistry;
