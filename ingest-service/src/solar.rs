use std::f64::consts::PI;

use time::{Date, Duration, PrimitiveDateTime, Time};

/// Sunrise and sunset (UTC) for one civil date at a fixed location,
/// from the NOAA fractional-year / equation-of-time approximation
/// with the standard 90.833 degree zenith. Accurate to a couple of
/// minutes at UK latitudes, which is ample: the detector pads the
/// window by a full hour each side.
pub fn sun_times(date: Date, latitude: f64, longitude: f64) -> Option<(PrimitiveDateTime, PrimitiveDateTime)> {
    let day_of_year = date.ordinal() as f64;
    let gamma = 2.0 * PI / 365.0 * (day_of_year - 1.0 + 0.5);

    let eqtime_min = 229.18
        * (0.000075 + 0.001868 * gamma.cos()
            - 0.032077 * gamma.sin()
            - 0.014615 * (2.0 * gamma).cos()
            - 0.040849 * (2.0 * gamma).sin());
    let decl = 0.006918 - 0.399912 * gamma.cos() + 0.070257 * gamma.sin()
        - 0.006758 * (2.0 * gamma).cos()
        + 0.000907 * (2.0 * gamma).sin()
        - 0.002697 * (3.0 * gamma).cos()
        + 0.00148 * (3.0 * gamma).sin();

    let lat = latitude.to_radians();
    let zenith = 90.833f64.to_radians();
    let cos_ha = zenith.cos() / (lat.cos() * decl.cos()) - lat.tan() * decl.tan();
    if !(-1.0..=1.0).contains(&cos_ha) {
        // Polar day or night; no rise/set on this date.
        return None;
    }
    let ha_deg = cos_ha.acos().to_degrees();

    let sunrise_min = 720.0 - 4.0 * (longitude + ha_deg) - eqtime_min;
    let sunset_min = 720.0 - 4.0 * (longitude - ha_deg) - eqtime_min;

    let midnight = PrimitiveDateTime::new(date, Time::MIDNIGHT);
    Some((
        midnight + Duration::seconds((sunrise_min * 60.0).round() as i64),
        midnight + Duration::seconds((sunset_min * 60.0).round() as i64),
    ))
}

/// The daylight window inside which a zero generation reading is
/// suspicious: strictly after sunrise + 1h and strictly before
/// sunset - 1h. Very-low-angle sun legitimately produces near-zero
/// output, so the fringes are excluded.
#[derive(Debug, Clone, Copy)]
pub struct DaylightWindow {
    pub earliest: PrimitiveDateTime,
    pub latest: PrimitiveDateTime,
}

impl DaylightWindow {
    pub fn for_date(date: Date, latitude: f64, longitude: f64) -> Option<Self> {
        let (sunrise, sunset) = sun_times(date, latitude, longitude)?;
        Some(Self { earliest: sunrise + Duration::hours(1), latest: sunset - Duration::hours(1) })
    }

    pub fn contains(&self, ts: PrimitiveDateTime) -> bool {
        ts > self.earliest && ts < self.latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    // Bristol, UK.
    const LAT: f64 = 51.459;
    const LON: f64 = -2.602;

    #[test]
    fn midsummer_sun_times_bracket_the_day() {
        let (sunrise, sunset) = sun_times(datetime!(2024-06-21 00:00).date(), LAT, LON).unwrap();
        // Roughly 03:53 and 20:31 UTC; allow generous slack.
        assert!(sunrise > datetime!(2024-06-21 03:30:00) && sunrise < datetime!(2024-06-21 04:30:00));
        assert!(sunset > datetime!(2024-06-21 20:00:00) && sunset < datetime!(2024-06-21 21:00:00));
    }

    #[test]
    fn midwinter_day_is_short() {
        let (sunrise, sunset) = sun_times(datetime!(2024-12-21 00:00).date(), LAT, LON).unwrap();
        assert!(sunrise > datetime!(2024-12-21 07:30:00) && sunrise < datetime!(2024-12-21 08:45:00));
        assert!(sunset > datetime!(2024-12-21 15:30:00) && sunset < datetime!(2024-12-21 16:45:00));
        assert!(sunset - sunrise < Duration::hours(9));
    }

    #[test]
    fn window_excludes_the_hour_after_sunrise() {
        let date = datetime!(2024-06-21 00:00).date();
        let (sunrise, _) = sun_times(date, LAT, LON).unwrap();
        let window = DaylightWindow::for_date(date, LAT, LON).unwrap();
        assert!(!window.contains(sunrise + Duration::minutes(10)));
        assert!(window.contains(datetime!(2024-06-21 12:00:00)));
    }

    #[test]
    fn polar_latitudes_have_no_window_in_midsummer() {
        assert!(sun_times(datetime!(2024-06-21 00:00).date(), 80.0, 0.0).is_none());
    }
}
