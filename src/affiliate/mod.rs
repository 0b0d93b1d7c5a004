//! Affiliate URL matching, firing and attribution.

pub mod attribution;
pub mod delivery;
pub mod limits;
pub mod patterns;
pub mod tracker;

pub use attribution::{ATTRIBUTION_COOKIE, AttributionRecord, AttributionStore};
pub use delivery::DeliveryStrategy;
pub use limits::DailyLimitGovernor;
pub use patterns::{PatternHit, PatternMatcher, RejectedPattern};
pub use tracker::{AffiliateDeps, AffiliateTracker, CheckOutcome, ScheduledFire};
