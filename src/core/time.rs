use std::time::Duration;

use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn add_std(value: PrimitiveDateTime, delay: Duration) -> PrimitiveDateTime {
    value.saturating_add(time::Duration::try_from(delay).unwrap_or(time::Duration::MAX))
}

pub(crate) fn sub_std(value: PrimitiveDateTime, delay: Duration) -> PrimitiveDateTime {
    value.saturating_sub(time::Duration::try_from(delay).unwrap_or(time::Duration::MAX))
}

/// Time left until `deadline`, zero when it already passed.
pub(crate) fn until(deadline: PrimitiveDateTime, now: PrimitiveDateTime) -> Duration {
    Duration::try_from(deadline - now).unwrap_or(Duration::ZERO)
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}
