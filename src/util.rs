use std::time::Instant;

/// Merge two optional deadlines, keeping the one that comes first.
pub(crate) trait Soonest {
    fn soonest(self, other: Self) -> Self;
}

impl Soonest for Option<Instant> {
    fn soonest(self, other: Self) -> Self {
        match (self, other) {
            (Some(v1), Some(v2)) => Some(v1.min(v2)),
            (None, v) => v,
            (v, None) => v,
        }
    }
}
