pub mod meter_flows;
pub mod platform_json;
pub mod readings_export;
pub mod station_csv;
pub mod weather_csv;

use time::{Date, Month, PrimitiveDateTime, Time};

use crate::pipeline::IngestError;

/// Parse a date written either ISO (`2016-01-30`) or with slashes
/// (`2016/01/30` or `30/01/2016`).
pub(crate) fn parse_flexible_date(s: &str) -> Result<Date, IngestError> {
    let norm = s.trim().replace('/', "-");
    let parts: Vec<&str> = norm.split('-').collect();
    if parts.len() != 3 {
        return Err(IngestError::Format(format!("unrecognized date '{s}'")));
    }
    let nums: Vec<i32> = parts
        .iter()
        .map(|p| p.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .map_err(|e| IngestError::Format(format!("unrecognized date '{s}': {e}")))?;
    // Year-first when the first component is four digits, else day-first.
    let (y, m, d) = if parts[0].len() == 4 {
        (nums[0], nums[1], nums[2])
    } else {
        (nums[2], nums[1], nums[0])
    };
    let month = Month::try_from(m as u8)
        .map_err(|e| IngestError::Format(format!("unrecognized month in '{s}': {e}")))?;
    Date::from_calendar_date(y, month, d as u8)
        .map_err(|e| IngestError::Format(format!("invalid date '{s}': {e}")))
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub(crate) fn parse_flexible_time(s: &str) -> Result<Time, IngestError> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(IngestError::Format(format!("unrecognized time '{s}'")));
    }
    let get = |i: usize| -> Result<u8, IngestError> {
        parts
            .get(i)
            .map_or(Ok(0), |p| p.trim().parse::<u8>())
            .map_err(|e| IngestError::Format(format!("unrecognized time '{s}': {e}")))
    };
    Time::from_hms(get(0)?, get(1)?, get(2)?)
        .map_err(|e| IngestError::Format(format!("invalid time '{s}': {e}")))
}

pub(crate) fn combine(date: &str, time: &str) -> Result<PrimitiveDateTime, IngestError> {
    Ok(PrimitiveDateTime::new(parse_flexible_date(date)?, parse_flexible_time(time)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn dates_parse_year_first_and_day_first() {
        assert_eq!(parse_flexible_date("2016-01-30").unwrap(), datetime!(2016-01-30 00:00).date());
        assert_eq!(parse_flexible_date("2016/01/30").unwrap(), datetime!(2016-01-30 00:00).date());
        assert_eq!(parse_flexible_date("30/01/2016").unwrap(), datetime!(2016-01-30 00:00).date());
    }

    #[test]
    fn times_parse_with_and_without_seconds() {
        assert_eq!(combine("2016-01-30", "12:30").unwrap(), datetime!(2016-01-30 12:30:00));
        assert_eq!(combine("2016-01-30", "12:30:15").unwrap(), datetime!(2016-01-30 12:30:15));
    }

    #[test]
    fn garbage_is_a_format_error() {
        assert!(matches!(parse_flexible_date("soon"), Err(IngestError::Format(_))));
        assert!(matches!(parse_flexible_time("midday"), Err(IngestError::Format(_))));
    }
}
