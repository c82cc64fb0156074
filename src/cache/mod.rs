//! On-disk usage snapshots and the policy deciding when to reuse them.
//!
//! One snapshot file exists per (lab, resource, date), named
//! `<lab>_<resource>_<YYYYMMDD>.json` inside the data directory. A snapshot
//! dated today or yesterday satisfies its pair; anything older is collected
//! again and eventually removed by [`expire`].

pub mod expiry;
pub mod freshness;
pub mod snapshot;

pub use expiry::expire;
pub use freshness::{check_freshness, fresh_snapshots, CollectTarget, FreshnessReport};
pub use snapshot::UsageSnapshot;
