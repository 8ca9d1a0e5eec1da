//! C1 — tenant-aware reverse proxy & policy engine (spec §4.1).

pub mod cache;
pub mod enrichment;
pub mod policy;
pub mod proxy;
pub mod rate_limit;

pub use enrichment::{EnrichedRequest, RouteBase, TenantSource};
pub use policy::{PolicyConfig, PolicyEntry, PolicyEngine, PolicyEvaluation, PolicyMode, PolicyType};
pub use rate_limit::{DynamicLogOverrides, PartitionCount, RateLimitAggregator, RejectionSummary, run_window_timer};
