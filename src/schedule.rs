use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

const DEFAULT_WINDOW_START: &str = "00:00:00";
const DEFAULT_WINDOW_END: &str = "06:00:00";
const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Which remediation variant a schedule drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleCategory {
    SolutionEmpty,
    PartialDataMissing,
}

impl ScheduleCategory {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PartialDataMissing" => ScheduleCategory::PartialDataMissing,
            _ => ScheduleCategory::SolutionEmpty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleCategory::SolutionEmpty => "SolutionEmpty",
            ScheduleCategory::PartialDataMissing => "PartialDataMissing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Once,
    Daily,
    Weekdays,
    Weekly,
    Custom,
}

impl Recurrence {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "once" => Recurrence::Once,
            "weekdays" => Recurrence::Weekdays,
            "weekly" => Recurrence::Weekly,
            "custom" => Recurrence::Custom,
            _ => Recurrence::Daily,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekdays => "weekdays",
            Recurrence::Weekly => "weekly",
            Recurrence::Custom => "custom",
        }
    }
}

/// A declarative recurrence rule fetched from the runtime API.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
    pub category: ScheduleCategory,
    pub recurrence: Recurrence,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub timezone: String,
    pub max_batch_size: usize,
    pub selection_criteria: Value,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ScheduleParseError {
    #[error("schedule record has no id")]
    MissingId,
}

impl Schedule {
    /// Parse a raw runtime record into the internal model. Unknown or
    /// malformed optional fields fall back to defaults; only a missing id
    /// is fatal.
    pub fn parse(raw: &Value) -> Result<Schedule, ScheduleParseError> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(ScheduleParseError::MissingId)?
            .to_string();

        let active = match raw.get("isActive") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
            Some(_) => true,
        };

        let selection_criteria = match raw.get("selectionCriteria") {
            Some(Value::String(encoded)) => {
                serde_json::from_str(encoded).unwrap_or_else(|_| Value::Object(Default::default()))
            }
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(other) => other.clone(),
        };

        Ok(Schedule {
            id,
            name: string_or_default(raw.get("name")),
            description: raw
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            active,
            category: ScheduleCategory::parse(&string_or_default(raw.get("category"))),
            recurrence: Recurrence::parse(&string_or_default(raw.get("recurrencePattern"))),
            window_start: parse_time(raw.get("windowStartTime"), DEFAULT_WINDOW_START),
            window_end: parse_time(raw.get("windowEndTime"), DEFAULT_WINDOW_END),
            timezone: raw
                .get("timezone")
                .and_then(Value::as_str)
                .unwrap_or("UTC")
                .to_string(),
            max_batch_size: raw
                .get("maxBatchSize")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            selection_criteria,
            total_executions: raw
                .get("totalExecutions")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            successful_executions: raw
                .get("successfulExecutions")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            failed_executions: raw
                .get("failedExecutions")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            next_execution_at: raw
                .get("nextExecutionDate")
                .and_then(Value::as_str)
                .and_then(parse_instant),
            last_execution_at: raw
                .get("lastExecutionDate")
                .and_then(Value::as_str)
                .and_then(parse_instant),
        })
    }
}

fn string_or_default(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_time(value: Option<&Value>, default: &str) -> NaiveTime {
    let text = value.and_then(Value::as_str).unwrap_or(default);
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .unwrap_or_else(|_| {
            warn!(%text, "unparseable time of day; using default");
            NaiveTime::parse_from_str(default, "%H:%M:%S").unwrap_or(NaiveTime::MIN)
        })
}

/// Parse an instant, tolerating a truncated `+00` offset suffix and
/// timezone-naive values (interpreted as UTC).
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let candidate = if text.ends_with("+00") {
        format!("{}:00", text)
    } else {
        text.to_string()
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&candidate) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Pure due-now predicate: active, next execution reached, and the local
/// time of day inside the inclusive execution window.
pub fn is_due(schedule: &Schedule, now: DateTime<Utc>) -> bool {
    if !schedule.active {
        return false;
    }
    let next = match schedule.next_execution_at {
        Some(next) => next,
        None => return false,
    };
    if next > now {
        return false;
    }
    within_window(
        schedule.window_start,
        schedule.window_end,
        &schedule.timezone,
        now,
    )
}

/// Window membership in the schedule's timezone. Endpoints are inclusive.
/// When start > end the window crosses midnight and is the union
/// `[start, 24:00) U [00:00, end]`. Invalid timezone names fall back to UTC.
fn within_window(start: NaiveTime, end: NaiveTime, tz_name: &str, now: DateTime<Utc>) -> bool {
    let tz: Tz = tz_name.parse().unwrap_or(Tz::UTC);
    let current = now.with_timezone(&tz).time();
    if start <= end {
        start <= current && current <= end
    } else {
        current >= start || current <= end
    }
}

/// Recompute the next execution instant after a run. `once` schedules get
/// none; everything else lands on a future day at the window-start time of
/// day (in UTC).
pub fn next_execution_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let next_date = match schedule.recurrence {
        Recurrence::Once => return None,
        Recurrence::Weekdays => {
            let mut date = today + Duration::days(1);
            while matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                date += Duration::days(1);
            }
            date
        }
        Recurrence::Weekly => today + Duration::weeks(1),
        Recurrence::Daily | Recurrence::Custom => today + Duration::days(1),
    };
    Some(Utc.from_utc_datetime(&next_date.and_time(schedule.window_start)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn make_schedule(next_execution_at: Option<DateTime<Utc>>) -> Schedule {
        Schedule {
            id: "sched-001".to_string(),
            name: "Test Schedule".to_string(),
            description: None,
            active: true,
            category: ScheduleCategory::SolutionEmpty,
            recurrence: Recurrence::Daily,
            window_start: time(0, 0),
            window_end: time(6, 0),
            timezone: "UTC".to_string(),
            max_batch_size: 100,
            selection_criteria: json!({}),
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            next_execution_at,
            last_execution_at: None,
        }
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn instant(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
        )
    }

    #[test]
    fn inactive_schedule_is_never_due() {
        let mut schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        schedule.active = false;
        assert!(!is_due(&schedule, instant(2026, 2, 9, 2, 0)));
    }

    #[test]
    fn missing_next_execution_is_not_due() {
        let schedule = make_schedule(None);
        assert!(!is_due(&schedule, instant(2026, 2, 9, 2, 0)));
    }

    #[test]
    fn future_next_execution_is_not_due() {
        let schedule = make_schedule(Some(instant(2026, 2, 10, 0, 0)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 2, 0)));
    }

    #[test]
    fn past_next_execution_inside_window_is_due() {
        let schedule = make_schedule(Some(instant(2026, 2, 9, 0, 0)));
        assert!(is_due(&schedule, instant(2026, 2, 9, 2, 0)));
    }

    #[test]
    fn past_next_execution_outside_window_is_not_due() {
        let schedule = make_schedule(Some(instant(2026, 2, 9, 0, 0)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 14, 0)));
    }

    #[test]
    fn window_endpoints_are_inclusive() {
        let schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        assert!(is_due(&schedule, instant(2026, 2, 9, 0, 0)));
        assert!(is_due(&schedule, instant(2026, 2, 9, 6, 0)));
    }

    #[test]
    fn degenerate_window_matches_only_the_exact_minute() {
        let mut schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        schedule.window_start = time(3, 30);
        schedule.window_end = time(3, 30);
        assert!(is_due(&schedule, instant(2026, 2, 9, 3, 30)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 3, 31)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 3, 29)));
    }

    #[test]
    fn midnight_crossing_window() {
        let mut schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        schedule.window_start = time(22, 0);
        schedule.window_end = time(6, 0);
        assert!(is_due(&schedule, instant(2026, 2, 9, 23, 30)));
        assert!(is_due(&schedule, instant(2026, 2, 9, 3, 0)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 12, 0)));
    }

    #[test]
    fn kuala_lumpur_window_at_two_am_local() {
        let mut schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        schedule.timezone = "Asia/Kuala_Lumpur".to_string();
        // 18:00 UTC is 02:00 the next day in Kuala Lumpur (+08:00).
        assert!(is_due(&schedule, instant(2026, 2, 9, 18, 0)));
        // 10:00 UTC is 18:00 local, outside the window.
        assert!(!is_due(&schedule, instant(2026, 2, 9, 10, 0)));
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let mut schedule = make_schedule(Some(instant(2026, 2, 8, 0, 0)));
        schedule.timezone = "Not/AZone".to_string();
        assert!(is_due(&schedule, instant(2026, 2, 9, 2, 0)));
        assert!(!is_due(&schedule, instant(2026, 2, 9, 14, 0)));
    }

    #[test]
    fn next_execution_once_is_none() {
        let mut schedule = make_schedule(None);
        schedule.recurrence = Recurrence::Once;
        assert_eq!(next_execution_after(&schedule, instant(2026, 2, 9, 2, 0)), None);
    }

    #[test]
    fn next_execution_daily_is_tomorrow_at_window_start() {
        let mut schedule = make_schedule(None);
        schedule.window_start = time(1, 30);
        assert_eq!(
            next_execution_after(&schedule, instant(2026, 2, 9, 2, 0)),
            Some(instant(2026, 2, 10, 1, 30))
        );
    }

    #[test]
    fn next_execution_weekdays_skips_the_weekend() {
        let mut schedule = make_schedule(None);
        schedule.recurrence = Recurrence::Weekdays;
        // 2026-02-06 is a Friday; the next weekday is Monday the 9th.
        assert_eq!(
            next_execution_after(&schedule, instant(2026, 2, 6, 2, 0)),
            Some(instant(2026, 2, 9, 0, 0))
        );
    }

    #[test]
    fn next_execution_weekly_adds_seven_days() {
        let mut schedule = make_schedule(None);
        schedule.recurrence = Recurrence::Weekly;
        assert_eq!(
            next_execution_after(&schedule, instant(2026, 2, 9, 2, 0)),
            Some(instant(2026, 2, 16, 0, 0))
        );
    }

    #[test]
    fn unknown_recurrence_defaults_to_daily() {
        assert_eq!(Recurrence::parse("fortnightly"), Recurrence::Daily);
        let mut schedule = make_schedule(None);
        schedule.recurrence = Recurrence::Custom;
        assert_eq!(
            next_execution_after(&schedule, instant(2026, 2, 9, 2, 0)),
            Some(instant(2026, 2, 10, 0, 0))
        );
    }

    #[test]
    fn parse_reads_recognised_fields() {
        let raw = json!({
            "id": "sched-42",
            "name": "Nightly Solution Sweep",
            "description": "clean up empty solutions",
            "isActive": true,
            "category": "SolutionEmpty",
            "recurrencePattern": "weekdays",
            "windowStartTime": "22:00:00",
            "windowEndTime": "06:00:00",
            "timezone": "Asia/Kuala_Lumpur",
            "maxBatchSize": 25,
            "selectionCriteria": "{\"remediationState\": \"DETECTED\"}",
            "totalExecutions": 7,
            "successfulExecutions": 6,
            "failedExecutions": 1,
            "nextExecutionDate": "2026-02-09T22:00:00+00",
            "lastExecutionDate": "2026-02-08T22:00:07+00:00",
        });
        let schedule = Schedule::parse(&raw).unwrap();
        assert_eq!(schedule.id, "sched-42");
        assert_eq!(schedule.recurrence, Recurrence::Weekdays);
        assert_eq!(schedule.window_start, time(22, 0));
        assert_eq!(schedule.window_end, time(6, 0));
        assert_eq!(schedule.max_batch_size, 25);
        assert_eq!(schedule.selection_criteria["remediationState"], "DETECTED");
        assert_eq!(schedule.total_executions, 7);
        assert_eq!(
            schedule.next_execution_at,
            Some(instant(2026, 2, 9, 22, 0))
        );
    }

    #[test]
    fn parse_round_trip_preserves_recognised_fields() {
        let raw = json!({
            "id": "sched-7",
            "name": "Weekly OE",
            "isActive": false,
            "category": "PartialDataMissing",
            "recurrencePattern": "weekly",
            "windowStartTime": "01:15:00",
            "windowEndTime": "04:45:00",
            "timezone": "UTC",
            "maxBatchSize": 10,
            "totalExecutions": 3,
            "successfulExecutions": 2,
            "failedExecutions": 1,
            "nextExecutionDate": "2026-03-01T01:15:00+00:00",
        });
        let parsed = Schedule::parse(&raw).unwrap();
        let encoded = json!({
            "id": parsed.id,
            "name": parsed.name,
            "isActive": parsed.active,
            "category": parsed.category.as_str(),
            "recurrencePattern": parsed.recurrence.as_str(),
            "windowStartTime": parsed.window_start.format("%H:%M:%S").to_string(),
            "windowEndTime": parsed.window_end.format("%H:%M:%S").to_string(),
            "timezone": parsed.timezone,
            "maxBatchSize": parsed.max_batch_size,
            "totalExecutions": parsed.total_executions,
            "successfulExecutions": parsed.successful_executions,
            "failedExecutions": parsed.failed_executions,
            "nextExecutionDate": parsed.next_execution_at.unwrap().to_rfc3339(),
        });
        let reparsed = Schedule::parse(&encoded).unwrap();
        assert_eq!(reparsed.id, parsed.id);
        assert_eq!(reparsed.active, parsed.active);
        assert_eq!(reparsed.category, parsed.category);
        assert_eq!(reparsed.recurrence, parsed.recurrence);
        assert_eq!(reparsed.window_start, parsed.window_start);
        assert_eq!(reparsed.window_end, parsed.window_end);
        assert_eq!(reparsed.max_batch_size, parsed.max_batch_size);
        assert_eq!(reparsed.next_execution_at, parsed.next_execution_at);
    }

    #[test]
    fn parse_without_id_fails() {
        assert!(Schedule::parse(&json!({ "name": "anonymous" })).is_err());
    }

    #[test]
    fn parse_defaults_for_sparse_records() {
        let schedule = Schedule::parse(&json!({ "id": "sched-min" })).unwrap();
        assert!(schedule.active);
        assert_eq!(schedule.category, ScheduleCategory::SolutionEmpty);
        assert_eq!(schedule.recurrence, Recurrence::Daily);
        assert_eq!(schedule.window_start, time(0, 0));
        assert_eq!(schedule.window_end, time(6, 0));
        assert_eq!(schedule.max_batch_size, 100);
        assert_eq!(schedule.next_execution_at, None);
    }
}
