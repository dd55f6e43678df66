//! Rate limiting logic: counters, keys, policies, profiles and the limiter.

mod counter;
mod key;
mod limiter;
mod policy;
mod profile;
mod registry;

pub use counter::{CounterRecord, ExpiryMode, MAX_WINDOW};
pub use key::BucketKey;
pub use limiter::{Decision, RateLimiter, Verdict};
pub use policy::{KeyStrategy, LimitPolicy, SkipRule, StandardPolicy};
pub use profile::{LimiterProfile, ProfileConfig, DEFAULT_MESSAGE};
pub use registry::LimiterSet;
