use std::sync::Arc;

use series_client::domain::Sample;
use time::{Date, Duration, Month, PrimitiveDateTime, Time, Weekday};

use crate::pipeline::{Envelope, IngestError, Transform};

/// Daylight-saving transition table for the reference civil timezone
/// (UK rules: saving of one hour between 01:00 UTC on the last Sunday
/// of March and 01:00 UTC on the last Sunday of October).
///
/// Civil-local timestamps carry no offset, so resolution follows the
/// table: read the civil time as if it were UTC, look up whether that
/// instant falls inside a saving period, and subtract the saving if it
/// does. Boundary hours on transition days resolve through this same
/// lookup; nothing is special-cased by calendar date.
pub struct TransitionTable {
    saving: Duration,
    // Half-open [start, end) saving periods, expressed in UTC.
    periods: Vec<(PrimitiveDateTime, PrimitiveDateTime)>,
    first_year: i32,
    last_year: i32,
}

fn last_sunday(year: i32, month: Month) -> Date {
    // Both transition months have 31 days.
    let mut d = Date::from_calendar_date(year, month, 31).expect("valid calendar date");
    while d.weekday() != Weekday::Sunday {
        d = d.previous_day().expect("month has a Sunday");
    }
    d
}

impl TransitionTable {
    /// Build the UK table covering `first_year..=last_year` inclusive.
    pub fn uk(first_year: i32, last_year: i32) -> Self {
        let one_am = Time::from_hms(1, 0, 0).expect("valid time");
        let periods = (first_year..=last_year)
            .map(|y| {
                let start = PrimitiveDateTime::new(last_sunday(y, Month::March), one_am);
                let end = PrimitiveDateTime::new(last_sunday(y, Month::October), one_am);
                (start, end)
            })
            .collect();
        Self { saving: Duration::hours(1), periods, first_year, last_year }
    }

    fn covers(&self, instant_utc: PrimitiveDateTime) -> bool {
        let y = instant_utc.year();
        y >= self.first_year && y <= self.last_year
    }

    /// Whether the saving offset is in force at a UTC instant.
    pub fn saving_in_force(&self, instant_utc: PrimitiveDateTime) -> Result<bool, IngestError> {
        if !self.covers(instant_utc) {
            return Err(IngestError::TimezoneAmbiguity(format!(
                "{instant_utc} is outside the transition table ({}..={})",
                self.first_year, self.last_year
            )));
        }
        Ok(self
            .periods
            .iter()
            .any(|(start, end)| instant_utc >= *start && instant_utc < *end))
    }

    /// Resolve a civil-local wall-clock time to UTC.
    pub fn civil_to_utc(&self, civil: PrimitiveDateTime) -> Result<PrimitiveDateTime, IngestError> {
        if self.saving_in_force(civil)? {
            Ok(civil - self.saving)
        } else {
            Ok(civil)
        }
    }

    /// The wall-clock time shown in the reference timezone at a UTC
    /// instant. Used where a rule is stated in local time, such as the
    /// detector's settlement cutoff.
    pub fn utc_to_civil(&self, utc: PrimitiveDateTime) -> Result<PrimitiveDateTime, IngestError> {
        if self.saving_in_force(utc)? {
            Ok(utc + self.saving)
        } else {
            Ok(utc)
        }
    }
}

/// Pipeline stage converting civil-local sample timestamps to UTC.
///
/// Attach this only to sources whose native stamps are wall-clock
/// local. A UTC-native source run through it would be shifted twice,
/// and nothing downstream can detect that.
#[derive(Clone)]
pub struct CivilTimeNormalizer {
    table: Arc<TransitionTable>,
}

impl CivilTimeNormalizer {
    pub fn new(table: Arc<TransitionTable>) -> Self {
        Self { table }
    }
}

#[async_trait::async_trait]
impl Transform for CivilTimeNormalizer {
    async fn apply(&self, mut input: Envelope<Sample>) -> Result<Envelope<Sample>, IngestError> {
        debug_assert!(input.payload.source.is_civil_local());
        input.payload.ts = self.table.civil_to_utc(input.payload.ts)?;
        Ok(input)
    }
}

/// Sanity validation applied to every sample before aggregation:
/// timestamps in a broad window, values finite.
#[derive(Clone, Default)]
pub struct SampleValidation;

#[async_trait::async_trait]
impl Transform for SampleValidation {
    async fn apply(&self, input: Envelope<Sample>) -> Result<Envelope<Sample>, IngestError> {
        let s = &input.payload;
        let year = s.ts.year();
        if !(2000..=2100).contains(&year) {
            metrics::counter!("validation_rejected_total").increment(1);
            return Err(IngestError::Format(format!("timestamp {} out of allowed range", s.ts)));
        }
        if let Some(v) = s.value {
            if !v.is_finite() {
                metrics::counter!("validation_rejected_total").increment(1);
                return Err(IngestError::Format(format!("non-finite value for {:?}", s.quantity)));
            }
        }
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    // 2024: clocks go forward 31 March, back 27 October.

    #[test]
    fn summer_civil_times_lose_an_hour() {
        let table = TransitionTable::uk(2015, 2030);
        let utc = table.civil_to_utc(datetime!(2024-06-15 14:30:00)).unwrap();
        assert_eq!(utc, datetime!(2024-06-15 13:30:00));
    }

    #[test]
    fn winter_civil_times_pass_through() {
        let table = TransitionTable::uk(2015, 2030);
        let utc = table.civil_to_utc(datetime!(2024-01-15 14:30:00)).unwrap();
        assert_eq!(utc, datetime!(2024-01-15 14:30:00));
    }

    #[test]
    fn spring_forward_gap_resolves_through_the_table() {
        let table = TransitionTable::uk(2015, 2030);
        // 02:30 local on 31 March 2024 does not exist on a wall clock;
        // the table lookup resolves it as saving time.
        let utc = table.civil_to_utc(datetime!(2024-03-31 02:30:00)).unwrap();
        assert_eq!(utc, datetime!(2024-03-31 01:30:00));
    }

    #[test]
    fn autumn_back_ambiguity_resolves_to_standard_time() {
        let table = TransitionTable::uk(2015, 2030);
        // 01:30 local on 27 October 2024 occurs twice; the lookup at
        // the as-UTC instant lands after the 01:00 UTC transition.
        let utc = table.civil_to_utc(datetime!(2024-10-27 01:30:00)).unwrap();
        assert_eq!(utc, datetime!(2024-10-27 01:30:00));
    }

    #[test]
    fn transition_boundaries_are_half_open() {
        let table = TransitionTable::uk(2015, 2030);
        assert!(table.saving_in_force(datetime!(2024-03-31 01:00:00)).unwrap());
        assert!(!table.saving_in_force(datetime!(2024-03-31 00:59:59)).unwrap());
        assert!(!table.saving_in_force(datetime!(2024-10-27 01:00:00)).unwrap());
        assert!(table.saving_in_force(datetime!(2024-10-27 00:59:59)).unwrap());
    }

    #[test]
    fn utc_maps_back_to_summer_wall_clock() {
        let table = TransitionTable::uk(2015, 2030);
        let civil = table.utc_to_civil(datetime!(2024-06-15 13:30:00)).unwrap();
        assert_eq!(civil, datetime!(2024-06-15 14:30:00));
        let winter = table.utc_to_civil(datetime!(2024-01-15 13:30:00)).unwrap();
        assert_eq!(winter, datetime!(2024-01-15 13:30:00));
    }

    #[test]
    fn out_of_table_years_are_an_ambiguity_error() {
        let table = TransitionTable::uk(2015, 2030);
        let res = table.civil_to_utc(datetime!(1999-06-15 12:00:00));
        assert!(matches!(res, Err(IngestError::TimezoneAmbiguity(_))));
    }

    #[test]
    fn last_sundays_match_known_transition_dates() {
        assert_eq!(last_sunday(2024, Month::March), datetime!(2024-03-31 00:00).date());
        assert_eq!(last_sunday(2024, Month::October), datetime!(2024-10-27 00:00).date());
        assert_eq!(last_sunday(2016, Month::March), datetime!(2016-03-27 00:00).date());
        assert_eq!(last_sunday(2016, Month::October), datetime!(2016-10-30 00:00).date());
    }
}
