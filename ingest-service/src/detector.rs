use std::collections::HashMap;

use series_client::db::day_queries::MeterDayRow;
use series_client::domain::{
    bucket::{slot_index, slot_start, BUCKETS_PER_DAY},
    AnomalyKind, AnomalyRecord,
};
use time::{Date, Duration, PrimitiveDateTime, Time};

use crate::solar::DaylightWindow;

#[derive(Debug, Clone)]
pub struct DetectorParams {
    /// Irradiance (W/m2) above which zero generation is implausible.
    pub decent_irradiance: f64,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self { decent_irradiance: 10.0 }
    }
}

/// The civil date a scheduled run should examine: yesterday, except
/// that before 06:00 on the wall clock we go one further day back
/// because the metering platform settles a day's readings at 06:00.
/// Callers pass civil-local time (UTC resolved through the transition
/// table), not raw UTC.
pub fn target_date(now_local: PrimitiveDateTime) -> Date {
    let days_back = if now_local.time() < time::macros::time!(6:00) { 2 } else { 1 };
    (PrimitiveDateTime::new(now_local.date(), Time::MIDNIGHT) - Duration::days(days_back)).date()
}

/// Scan one day of the reconciled power series for missing buckets and
/// implausible zero-output readings.
///
/// `rows` are the stored buckets of `date` (time-ordered), with one
/// cell per meter in the order of `meters`. `irradiance` carries one
/// map per independent weather source, labelled for the report.
/// Findings come back ordered by bucket then meter, so grouping a
/// bucket's meters onto one report line is a linear pass.
pub fn detect(
    date: Date,
    meters: &[String],
    rows: &[MeterDayRow],
    irradiance: &[(String, HashMap<PrimitiveDateTime, f64>)],
    window: Option<DaylightWindow>,
    latest_known: Option<PrimitiveDateTime>,
    params: &DetectorParams,
) -> Vec<AnomalyRecord> {
    let mut findings = Vec::new();

    if rows.is_empty() {
        let mut context = format!("no power data found for {date}");
        if let Some(latest) = latest_known {
            context.push_str(&format!("; most recent power data is from {}", latest.date()));
        }
        findings.push(AnomalyRecord {
            date,
            bucket_start: slot_start(date, 0),
            entity: None,
            kind: AnomalyKind::Missing,
            context,
        });
        return findings;
    }

    let mut by_slot: HashMap<usize, &MeterDayRow> = HashMap::new();
    for row in rows {
        if row.bucket_start.date() == date {
            by_slot.insert(slot_index(row.bucket_start.time()), row);
        }
    }

    for slot in 0..BUCKETS_PER_DAY {
        let bucket_start = slot_start(date, slot);
        let row = match by_slot.get(&slot) {
            Some(row) => *row,
            None => {
                let ending = bucket_start + Duration::minutes(30);
                findings.push(AnomalyRecord {
                    date,
                    bucket_start,
                    entity: None,
                    kind: AnomalyKind::Missing,
                    context: format!(
                        "no power data recorded for any meter for period ending {:02}:{:02}",
                        ending.hour(),
                        ending.minute()
                    ),
                });
                continue;
            }
        };

        for (meter, value) in meters.iter().zip(row.values.iter()) {
            match value {
                None => findings.push(AnomalyRecord {
                    date,
                    bucket_start,
                    entity: Some(meter.clone()),
                    kind: AnomalyKind::Missing,
                    context: "missing power data".to_string(),
                }),
                Some(v) if *v == 0.0 => {
                    let bright: Vec<String> = irradiance
                        .iter()
                        .filter_map(|(label, map)| {
                            map.get(&bucket_start)
                                .filter(|sr| **sr > params.decent_irradiance)
                                .map(|sr| format!("{label} = {sr}"))
                        })
                        .collect();
                    let in_window = window.map(|w| w.contains(bucket_start)).unwrap_or(false);
                    if !bright.is_empty() && in_window {
                        findings.push(AnomalyRecord {
                            date,
                            bucket_start,
                            entity: Some(meter.clone()),
                            kind: AnomalyKind::UnexpectedZero,
                            context: format!(
                                "no power output despite solar radiation readings {}",
                                bright.join(", ")
                            ),
                        });
                    }
                }
                Some(_) => {}
            }
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const LAT: f64 = 51.459;
    const LON: f64 = -2.602;

    fn meters() -> Vec<String> {
        vec!["pv2_gen".to_string(), "hh1".to_string()]
    }

    fn full_day_except(date: Date, skip: &[usize], value: f64) -> Vec<MeterDayRow> {
        (0..BUCKETS_PER_DAY)
            .filter(|slot| !skip.contains(slot))
            .map(|slot| MeterDayRow {
                bucket_start: slot_start(date, slot),
                values: vec![Some(value), Some(value)],
            })
            .collect()
    }

    #[test]
    fn target_date_is_yesterday_after_six() {
        assert_eq!(
            target_date(datetime!(2024-06-10 09:15:00)),
            datetime!(2024-06-09 00:00).date()
        );
    }

    #[test]
    fn target_date_shifts_back_before_six() {
        assert_eq!(
            target_date(datetime!(2024-06-10 05:59:00)),
            datetime!(2024-06-08 00:00).date()
        );
    }

    #[test]
    fn settlement_cutoff_follows_the_wall_clock() {
        let table = crate::normalize::TransitionTable::uk(2015, 2030);
        // 05:30 UTC in June is 06:30 on the wall clock; the cutoff has
        // already passed, so only one day back.
        let local = table.utc_to_civil(datetime!(2024-06-10 05:30:00)).unwrap();
        assert_eq!(target_date(local), datetime!(2024-06-09 00:00).date());
        // In January the same UTC instant is still before the cutoff.
        let winter = table.utc_to_civil(datetime!(2024-01-10 05:30:00)).unwrap();
        assert_eq!(target_date(winter), datetime!(2024-01-08 00:00).date());
    }

    #[test]
    fn a_single_absent_bucket_is_the_only_finding() {
        let date = datetime!(2024-06-09 00:00).date();
        let rows = full_day_except(date, &[24], 5.0);
        let findings = detect(date, &meters(), &rows, &[], None, None, &DetectorParams::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, AnomalyKind::Missing);
        assert_eq!(findings[0].bucket_start, slot_start(date, 24));
        assert!(findings[0].entity.is_none());
        assert!(findings[0].context.contains("period ending 12:30"));
    }

    #[test]
    fn zero_at_solar_noon_with_bright_sky_is_flagged() {
        let date = datetime!(2024-06-09 00:00).date();
        let mut rows = full_day_except(date, &[], 5.0);
        let noon_slot = 24; // 12:00
        rows[noon_slot].values = vec![Some(0.0), Some(5.0)];

        let mut sol = HashMap::new();
        sol.insert(slot_start(date, noon_slot), 200.0);
        let window = DaylightWindow::for_date(date, LAT, LON);

        let findings = detect(
            date,
            &meters(),
            &rows,
            &[("station".to_string(), sol)],
            window,
            None,
            &DetectorParams::default(),
        );
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, AnomalyKind::UnexpectedZero);
        assert_eq!(findings[0].entity.as_deref(), Some("pv2_gen"));
        assert!(findings[0].context.contains("station = 200"));
    }

    #[test]
    fn zero_just_after_sunrise_is_not_flagged() {
        let date = datetime!(2024-06-09 00:00).date();
        let window = DaylightWindow::for_date(date, LAT, LON).unwrap();
        let sunrise = window.earliest - Duration::hours(1);
        // First boundary at least ten minutes after sunrise, still
        // inside the hour-long exclusion fringe.
        let slot = (0..BUCKETS_PER_DAY)
            .find(|s| {
                let t = slot_start(date, *s);
                t >= sunrise + Duration::minutes(10) && t < window.earliest
            })
            .expect("a bucket inside the exclusion fringe");

        let mut rows = full_day_except(date, &[], 5.0);
        rows[slot].values = vec![Some(0.0), Some(5.0)];
        let mut sol = HashMap::new();
        sol.insert(slot_start(date, slot), 50.0);

        let findings = detect(
            date,
            &meters(),
            &rows,
            &[("station".to_string(), sol)],
            Some(window),
            None,
            &DetectorParams::default(),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn dim_sky_zero_is_not_flagged() {
        let date = datetime!(2024-06-09 00:00).date();
        let mut rows = full_day_except(date, &[], 5.0);
        rows[24].values = vec![Some(0.0), Some(5.0)];
        let mut sol = HashMap::new();
        sol.insert(slot_start(date, 24), 5.0); // below threshold
        let window = DaylightWindow::for_date(date, LAT, LON);

        let findings = detect(
            date,
            &meters(),
            &rows,
            &[("station".to_string(), sol)],
            window,
            None,
            &DetectorParams::default(),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn null_meter_cells_are_per_meter_missing_findings() {
        let date = datetime!(2024-06-09 00:00).date();
        let mut rows = full_day_except(date, &[], 5.0);
        rows[10].values = vec![None, Some(5.0)];
        let findings = detect(date, &meters(), &rows, &[], None, None, &DetectorParams::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].entity.as_deref(), Some("pv2_gen"));
        assert_eq!(findings[0].kind, AnomalyKind::Missing);
    }

    #[test]
    fn a_day_with_no_rows_reports_the_target_date() {
        let date = datetime!(2024-06-09 00:00).date();
        let findings = detect(
            date,
            &meters(),
            &[],
            &[],
            None,
            Some(datetime!(2024-06-01 23:30:00)),
            &DetectorParams::default(),
        );
        assert_eq!(findings.len(), 1);
        assert!(findings[0].context.contains("2024-06-09"));
        assert!(findings[0].context.contains("2024-06-01"));
    }

    #[test]
    fn findings_come_back_in_bucket_order() {
        let date = datetime!(2024-06-09 00:00).date();
        let rows = full_day_except(date, &[5, 30], 5.0);
        let findings = detect(date, &meters(), &rows, &[], None, None, &DetectorParams::default());
        let starts: Vec<_> = findings.iter().map(|f| f.bucket_start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }
}
