#![allow(dead_code)]

pub use fleetcast_test_utils::builders;
pub use fleetcast_test_utils::fakes;
pub use fleetcast_test_utils::world;
pub use fleetcast_test_utils::{init_tracing, with_timeout};

use chrono::{DateTime, TimeZone, Utc};

/// 2024-01-01T00:00:00Z; a Monday.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}
