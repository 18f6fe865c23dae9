//! Trigger calculation: when should a job run next?
//!
//! Cron expressions are matched against *local wall-clock* fields in the
//! job's timezone, then resolved to a UTC instant:
//!
//! | Local time situation     | Resolution                                   |
//! |--------------------------|----------------------------------------------|
//! | Unique                   | That instant                                 |
//! | Repeated (fall back)     | Earliest instant only, never twice           |
//! | Skipped (spring forward) | Pre-transition offset, i.e. shifted past the jump |
//!
//! Five-field expressions use crontab conventions and are translated to the
//! seconds-first dialect of the `cron` crate:
//!
//! - weekday numbers 0-7 (0 and 7 are Sunday) become day names;
//! - when both day-of-month and day-of-week are restricted, a day matches if
//!   *either* field does, so the expression becomes a union of two schedules.
//!
//! Six/seven-field expressions and `@daily`-style macros are passed through
//! unchanged.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Upper bound on candidates inspected when resolving DST overlaps.
const MAX_CANDIDATES: usize = 1_000;

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed, validated cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    source: String,
    /// Fires whenever any member fires.
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let schedules = translate_expression(expression)?
            .iter()
            .map(|translated| {
                cron::Schedule::from_str(translated)
                    .map_err(|e| SchedulerError::InvalidSchedule(format!("{expression}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source: expression.trim().to_string(),
            schedules,
        })
    }

    /// The expression as written by the operator.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `from`, evaluated in `tz`.
    pub fn next_after(&self, tz: Tz, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Iterate wall-clock candidates by treating local time as if it were UTC,
        // so the iterator itself never sees a gap or an overlap.
        let local = from.with_timezone(&tz).naive_local();
        let anchor = Utc.from_utc_datetime(&local);

        self.schedules
            .iter()
            .filter_map(|schedule| {
                schedule
                    .after(&anchor)
                    .take(MAX_CANDIDATES)
                    .filter_map(|candidate| resolve_local(tz, candidate.naive_utc()))
                    .find(|instant| *instant > from)
            })
            .min()
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Resolve a wall-clock time in `tz` to a single UTC instant.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Spring-forward gap: use the offset that was in force a day earlier.
            let before = naive.checked_sub_signed(TimeDelta::days(1))?;
            let offset = tz.offset_from_local_datetime(&before).earliest()?.fix();
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}

/// Translate crontab syntax into one or more expressions in the `cron`
/// crate's seconds-first syntax. The job fires at the earliest of them.
pub fn translate_expression(expression: &str) -> Result<Vec<String>> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(SchedulerError::InvalidSchedule(
            "empty cron expression".to_string(),
        ));
    }
    if trimmed.starts_with('@') {
        return Ok(vec![trimmed.to_string()]);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            let weekdays = crontab_weekdays(dow)
                .map_err(|reason| SchedulerError::InvalidSchedule(format!("{trimmed}: {reason}")))?;
            if is_restricted(dom) && is_restricted(dow) {
                Ok(vec![
                    format!("0 {minute} {hour} {dom} {month} *"),
                    format!("0 {minute} {hour} * {month} {weekdays}"),
                ])
            } else {
                Ok(vec![format!("0 {minute} {hour} {dom} {month} {weekdays}")])
            }
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => Ok(vec![fields.join(" ")]),
        _ => Err(SchedulerError::InvalidSchedule(format!(
            "{trimmed}: expected 5, 6 or 7 fields, got {}",
            fields.len()
        ))),
    }
}

/// Crontab treats a day field starting with `*` as unrestricted.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*')
}

/// Rewrite a crontab day-of-week field as day names.
///
/// The `cron` crate numbers Sunday as 1 and rejects ranges that run past
/// Saturday, so the field is expanded to a set of days and emitted as
/// Monday-first runs with Sunday last (`1-7` becomes `MON-SAT,SUN`).
fn crontab_weekdays(field: &str) -> std::result::Result<String, String> {
    if field == "*" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid weekday step in '{item}'")),
            },
            None => (item, None),
        };
        let (first, last) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((from, to))) => (weekday_number(from)?, weekday_number(to)?),
            // `5/2` runs to the end of the week.
            (_, None) if step.is_some() => {
                let day = weekday_number(range)?;
                (day, day.max(6))
            }
            (_, None) => {
                let day = weekday_number(range)?;
                (day, day)
            }
        };
        if first > last {
            return Err(format!("backwards weekday range '{item}'"));
        }
        for day in (first..=last).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let mut parts = Vec::new();
    let mut day = 1;
    while day <= 6 {
        if !days[day] {
            day += 1;
            continue;
        }
        let start = day;
        while day < 6 && days[day + 1] {
            day += 1;
        }
        if start == day {
            parts.push(WEEKDAY_NAMES[day].to_string());
        } else {
            parts.push(format!("{}-{}", WEEKDAY_NAMES[start], WEEKDAY_NAMES[day]));
        }
        day += 1;
    }
    if days[0] {
        parts.push(WEEKDAY_NAMES[0].to_string());
    }
    Ok(parts.join(","))
}

/// Crontab weekday number (0-7) or three-letter name.
fn weekday_number(token: &str) -> std::result::Result<usize, String> {
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("weekday {n} out of range"))
        };
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .ok_or_else(|| format!("unknown weekday '{token}'"))
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(name.to_string()))
}

/// Computes next trigger times, parsing each cron expression once.
///
/// Stateless apart from the parse cache, so results depend only on the inputs.
#[derive(Debug, Default)]
pub struct TriggerCalculator {
    cache: DashMap<String, Arc<CronSchedule>>,
}

impl TriggerCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parsed schedule for `expression`, from cache when possible.
    pub fn schedule(&self, expression: &str) -> Result<Arc<CronSchedule>> {
        if let Some(hit) = self.cache.get(expression) {
            return Ok(Arc::clone(hit.value()));
        }
        let parsed = Arc::new(CronSchedule::parse(expression)?);
        self.cache
            .insert(expression.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// Fail fast on anything that would make `next_trigger` error later.
    pub fn validate(&self, trigger: Option<&Trigger>, timezone: &str) -> Result<()> {
        let tz = parse_timezone(timezone)?;
        match trigger {
            Some(Trigger::Cron { expression }) => {
                let schedule = self.schedule(expression)?;
                if schedule.next_after(tz, Utc::now()).is_none() {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "{expression}: never fires again"
                    )));
                }
                Ok(())
            }
            Some(Trigger::Interval { every_ms }) => interval_delta(*every_ms).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Next due instant strictly after `from`, or `None` for manual-only jobs.
    pub fn next_trigger(
        &self,
        trigger: Option<&Trigger>,
        timezone: &str,
        from: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        match trigger {
            Some(Trigger::Cron { expression }) => {
                let tz = parse_timezone(timezone)?;
                Ok(self.schedule(expression)?.next_after(tz, from))
            }
            Some(Trigger::Interval { every_ms }) => Ok(Some(from + interval_delta(*every_ms)?)),
            None => Ok(None),
        }
    }
}

fn interval_delta(every_ms: u64) -> Result<TimeDelta> {
    if every_ms == 0 {
        return Err(SchedulerError::InvalidSchedule(
            "repeat_every_ms must be greater than zero".to_string(),
        ));
    }
    i64::try_from(every_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("repeat_every_ms out of range: {every_ms}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Weekday};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekday_cron_skips_weekend_in_sao_paulo() {
        let calc = TriggerCalculator::new();
        let tz = parse_timezone("America/Sao_Paulo").unwrap();
        // Saturday 2026-10-17 09:00 local (UTC-3).
        let from = tz
            .with_ymd_and_hms(2026, 10, 17, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let next = calc
            .next_trigger(
                Some(&Trigger::cron("0 9 * * MON-FRI")),
                "America/Sao_Paulo",
                from,
            )
            .unwrap()
            .unwrap();

        let local = next.with_timezone(&tz);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!(local.day(), 19);
        assert_eq!(next, utc(2026, 10, 19, 12, 0));
    }

    fn weekdays_of(expression: &str) -> String {
        let translated = translate_expression(expression).unwrap();
        assert_eq!(translated.len(), 1, "{translated:?}");
        translated[0].rsplit(' ').next().unwrap().to_string()
    }

    #[test]
    fn numeric_weekdays_follow_crontab_numbering() {
        assert_eq!(
            translate_expression("0 9 * * 1-5").unwrap(),
            vec!["0 0 9 * * MON-FRI"]
        );
        assert_eq!(weekdays_of("0 0 * * 0"), "SUN");
        assert_eq!(weekdays_of("0 0 * * 7"), "SUN");
        assert_eq!(weekdays_of("0 0 * * 1,3"), "MON,WED");
        assert_eq!(weekdays_of("0 0 * * */2"), "TUE,THU,SAT,SUN");
        assert_eq!(weekdays_of("0 0 * * 1-5/2"), "MON,WED,FRI");
        assert_eq!(weekdays_of("0 0 * * *"), "*");
    }

    #[test]
    fn ranges_ending_on_sunday_seven() {
        assert_eq!(weekdays_of("0 9 * * 6-7"), "SAT,SUN");
        assert_eq!(weekdays_of("0 9 * * 5-7"), "FRI-SAT,SUN");
        assert_eq!(weekdays_of("0 9 * * 1-7"), "MON-SAT,SUN");
        assert_eq!(weekdays_of("0 9 * * 0-6"), "MON-SAT,SUN");
        assert_eq!(weekdays_of("0 9 * * sat,0"), "SAT,SUN");

        for expression in ["0 9 * * 6-7", "0 9 * * 5-7", "0 9 * * 1-7", "0 9 * * 0-6"] {
            assert!(CronSchedule::parse(expression).is_ok(), "{expression}");
        }
    }

    #[test]
    fn weekend_schedule_fires_saturday_then_sunday() {
        let calc = TriggerCalculator::new();
        let trigger = Trigger::cron("0 9 * * 6-7");
        // Thursday.
        let sat = calc
            .next_trigger(Some(&trigger), "UTC", utc(2026, 10, 15, 12, 0))
            .unwrap()
            .unwrap();
        assert_eq!(sat, utc(2026, 10, 17, 9, 0));
        let sun = calc.next_trigger(Some(&trigger), "UTC", sat).unwrap().unwrap();
        assert_eq!(sun, utc(2026, 10, 18, 9, 0));
        let following = calc.next_trigger(Some(&trigger), "UTC", sun).unwrap().unwrap();
        assert_eq!(following, utc(2026, 10, 24, 9, 0));
    }

    #[test]
    fn bad_weekdays_are_rejected() {
        for expression in [
            "0 9 * * 8",
            "0 9 * * 5-1",
            "0 9 * * FRI-SUN",
            "0 9 * * 1/0",
            "0 9 * * xyz",
        ] {
            assert!(CronSchedule::parse(expression).is_err(), "{expression}");
        }
    }

    #[test]
    fn restricted_day_fields_match_either() {
        assert_eq!(
            translate_expression("0 9 13 * FRI").unwrap(),
            vec!["0 0 9 13 * *", "0 0 9 * * FRI"]
        );
        assert_eq!(translate_expression("0 9 */2 * FRI").unwrap().len(), 1);

        let calc = TriggerCalculator::new();
        let trigger = Trigger::cron("0 9 13 * FRI");
        // Thursday 2026-10-15: the Friday comes before the next 13th.
        let next = calc
            .next_trigger(Some(&trigger), "UTC", utc(2026, 10, 15, 12, 0))
            .unwrap();
        assert_eq!(next, Some(utc(2026, 10, 16, 9, 0)));
        // 2026-12-13 is a Sunday: the 13th alone is enough.
        let next = calc
            .next_trigger(Some(&trigger), "UTC", utc(2026, 12, 12, 12, 0))
            .unwrap();
        assert_eq!(next, Some(utc(2026, 12, 13, 9, 0)));
    }

    #[test]
    fn numeric_and_named_weekdays_agree() {
        let calc = TriggerCalculator::new();
        let from = utc(2026, 10, 17, 12, 0);
        let named = calc
            .next_trigger(Some(&Trigger::cron("0 9 * * MON-FRI")), "UTC", from)
            .unwrap();
        let numeric = calc
            .next_trigger(Some(&Trigger::cron("0 9 * * 1-5")), "UTC", from)
            .unwrap();
        assert_eq!(named, numeric);
        assert_eq!(numeric, Some(utc(2026, 10, 19, 9, 0)));
    }

    #[test]
    fn extended_forms_pass_through() {
        assert_eq!(
            translate_expression("30 0 9 * * Mon").unwrap(),
            vec!["30 0 9 * * Mon"]
        );
        assert_eq!(translate_expression(" @daily ").unwrap(), vec!["@daily"]);
        assert!(translate_expression("* * *").is_err());
        assert!(translate_expression("   ").is_err());
    }

    #[test]
    fn strictly_after_from() {
        let calc = TriggerCalculator::new();
        let from = utc(2026, 10, 15, 9, 0);
        let next = calc
            .next_trigger(Some(&Trigger::cron("0 9 * * *")), "UTC", from)
            .unwrap();
        assert_eq!(next, Some(utc(2026, 10, 16, 9, 0)));
    }

    #[test]
    fn interval_is_measured_from_given_time() {
        let calc = TriggerCalculator::new();
        let completed = utc(2026, 10, 15, 9, 1) + TimeDelta::seconds(30);
        let next = calc
            .next_trigger(Some(&Trigger::every_ms(60_000)), "UTC", completed)
            .unwrap();
        assert_eq!(next, Some(completed + TimeDelta::seconds(60)));
    }

    #[test]
    fn manual_only_has_no_trigger() {
        let calc = TriggerCalculator::new();
        assert_eq!(calc.next_trigger(None, "UTC", Utc::now()).unwrap(), None);
    }

    #[test]
    fn spring_forward_gap_fires_once_after_jump() {
        // 2026-03-08 02:30 does not exist in New York; clocks jump 02:00 -> 03:00.
        let calc = TriggerCalculator::new();
        let from = utc(2026, 3, 7, 12, 0);
        let next = calc
            .next_trigger(Some(&Trigger::cron("30 2 * * *")), "America/New_York", from)
            .unwrap()
            .unwrap();
        // 02:30 EST == 03:30 EDT == 07:30 UTC.
        assert_eq!(next, utc(2026, 3, 8, 7, 30));

        let after = calc
            .next_trigger(Some(&Trigger::cron("30 2 * * *")), "America/New_York", next)
            .unwrap()
            .unwrap();
        // Back to 02:30 EDT the following day.
        assert_eq!(after, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn fall_back_overlap_fires_once() {
        // 01:30 happens twice in New York on 2026-11-01.
        let calc = TriggerCalculator::new();
        let trigger = Trigger::cron("30 1 * * *");
        let first = calc
            .next_trigger(Some(&trigger), "America/New_York", utc(2026, 10, 31, 12, 0))
            .unwrap()
            .unwrap();
        assert_eq!(first, utc(2026, 11, 1, 5, 30)); // 01:30 EDT

        let completed = first + TimeDelta::milliseconds(500);
        let second = calc
            .next_trigger(Some(&trigger), "America/New_York", completed)
            .unwrap()
            .unwrap();
        assert_eq!(second, utc(2026, 11, 2, 6, 30)); // next day, 01:30 EST
    }

    #[test]
    fn invalid_inputs_are_configuration_errors() {
        let calc = TriggerCalculator::new();
        let err = calc
            .validate(Some(&Trigger::cron("not a cron")), "UTC")
            .unwrap_err();
        assert!(err.is_configuration());

        let err = calc
            .validate(Some(&Trigger::cron("0 9 * * *")), "Bogus/Zone")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTimezone(_)));

        let err = calc
            .validate(Some(&Trigger::every_ms(0)), "UTC")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn expressions_are_parsed_once() {
        let calc = TriggerCalculator::new();
        let a = calc.schedule("*/5 * * * *").unwrap();
        let b = calc.schedule("*/5 * * * *").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.source(), "*/5 * * * *");
    }
}
