use time::{Date, Duration, PrimitiveDateTime, Time};

use super::sample::Quantity;

pub const BUCKET_MINUTES: i64 = 30;
pub const BUCKETS_PER_DAY: usize = 48;

/// One half-hour slot of the reconciled series.
///
/// `start` is always aligned to a `:00`/`:30` boundary (one of the 48
/// fixed offsets in a civil day). `entity` carries the meter code for
/// wide multi-meter tables and is `None` for single-column tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub start: PrimitiveDateTime,
    pub quantity: Quantity,
    pub value: Option<f64>,
    pub entity: Option<String>,
}

impl Bucket {
    pub fn is_aligned(&self) -> bool {
        is_boundary(self.start)
    }

    /// End of the half-hour period, as shown in operator reports
    /// ("period ending HH:MM").
    pub fn period_ending(&self) -> PrimitiveDateTime {
        self.start + Duration::minutes(BUCKET_MINUTES)
    }
}

/// True when a timestamp sits exactly on a half-hour boundary.
pub fn is_boundary(ts: PrimitiveDateTime) -> bool {
    let t = ts.time();
    (t.minute() == 0 || t.minute() == 30) && t.second() == 0 && t.nanosecond() == 0
}

/// Align a timestamp down to the start of the bucket containing it.
pub fn floor_to_bucket(ts: PrimitiveDateTime) -> PrimitiveDateTime {
    let t = ts.time();
    let minute = if t.minute() >= 30 { 30 } else { 0 };
    PrimitiveDateTime::new(ts.date(), Time::from_hms(t.hour(), minute, 0).expect("valid time"))
}

pub fn slot_index(t: Time) -> usize {
    (t.hour() as usize) * 2 + if t.minute() >= 30 { 1 } else { 0 }
}

/// Start timestamp of slot `index` (0..=47) within `date`.
pub fn slot_start(date: Date, index: usize) -> PrimitiveDateTime {
    debug_assert!(index < BUCKETS_PER_DAY);
    let hour = (index / 2) as u8;
    let minute = if index % 2 == 1 { 30 } else { 0 };
    PrimitiveDateTime::new(date, Time::from_hms(hour, minute, 0).expect("valid time"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn floor_aligns_to_half_hour_boundaries() {
        assert_eq!(floor_to_bucket(datetime!(2024-06-01 10:29:59)), datetime!(2024-06-01 10:00:00));
        assert_eq!(floor_to_bucket(datetime!(2024-06-01 10:30:00)), datetime!(2024-06-01 10:30:00));
        assert_eq!(floor_to_bucket(datetime!(2024-06-01 10:45:10)), datetime!(2024-06-01 10:30:00));
    }

    #[test]
    fn slot_indexes_cover_the_day() {
        assert_eq!(slot_index(datetime!(2024-06-01 00:00:00).time()), 0);
        assert_eq!(slot_index(datetime!(2024-06-01 00:30:00).time()), 1);
        assert_eq!(slot_index(datetime!(2024-06-01 23:30:00).time()), 47);
        for i in 0..BUCKETS_PER_DAY {
            let start = slot_start(datetime!(2024-06-01 00:00:00).date(), i);
            assert!(is_boundary(start));
            assert_eq!(slot_index(start.time()), i);
        }
    }

    #[test]
    fn period_ending_is_thirty_minutes_after_start() {
        let b = Bucket {
            start: datetime!(2024-06-01 11:30:00),
            quantity: Quantity::Power,
            value: Some(1.0),
            entity: None,
        };
        assert_eq!(b.period_ending(), datetime!(2024-06-01 12:00:00));
        assert!(b.is_aligned());
    }
}
