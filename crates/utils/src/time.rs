use chrono::{DateTime, SubsecRound, Utc};

/// Current UTC time truncated to whole seconds.
///
/// Every timestamp we persist is ISO-8601 with second precision, so the
/// truncation happens once here rather than at each call site.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
