//! Rate limiting logic and state management.

mod counter;
mod limiter;
mod policy;
mod rule;
mod source;

pub use counter::BucketCounter;
pub use limiter::{LimiterPool, UNKNOWN_IDENTITY};
pub use policy::{ActivePolicy, PolicyDocument, RuleSpec, SelectorValue};
pub use rule::SelectorRule;
pub use source::{HttpPolicySource, PolicySource, StaticPolicySource};
