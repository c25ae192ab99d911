// Recurrence expression parsing and next occurrence calculation
//
// Supported forms:
// - RFC 3339 instant ("2026-10-20T09:00:00Z"), a one-shot recurrence
// - 5-field Unix cron ("min hour dom month dow", 0 or 7 = Sunday)
// - 6/7-field cron with leading seconds and optional trailing year
//
// Day-of-month and day-of-week both have to match. Unix cron matches either
// one when both are restricted, so a 5-field expression restricting both is
// rejected rather than read differently.
// - @yearly, @monthly, @weekly, @daily and @hourly shortcuts

use crate::errors::ScheduleError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A parsed recurrence expression
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// A single pinned instant
    OneShot(DateTime<Utc>),
    /// A cron schedule; `pinned` is set when every field names exactly one value
    Cron {
        schedule: Box<CronSchedule>,
        pinned: bool,
    },
}

impl Recurrence {
    /// Parse and validate a recurrence expression
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(invalid(expression, "expression is empty"));
        }

        if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Recurrence::OneShot(instant.with_timezone(&Utc)));
        }

        if trimmed.starts_with('@') {
            let schedule = parse_cron_expression(expression, trimmed)?;
            return Ok(Recurrence::Cron {
                schedule: Box::new(schedule),
                pinned: false,
            });
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                if is_restricted(fields[2]) && is_restricted(fields[4]) {
                    return Err(invalid(
                        expression,
                        "day-of-month and day-of-week cannot both be restricted",
                    ));
                }
                let day_of_week = normalize_unix_day_of_week(fields[4])
                    .map_err(|reason| invalid(expression, &reason))?;
                format!(
                    "0 {} {} {} {} {}",
                    fields[0], fields[1], fields[2], fields[3], day_of_week
                )
            }
            6 | 7 => fields.join(" "),
            n => {
                return Err(invalid(
                    expression,
                    &format!("expected 5, 6 or 7 fields, found {}", n),
                ))
            }
        };

        let schedule = parse_cron_expression(expression, &normalized)?;
        Ok(Recurrence::Cron {
            schedule: Box::new(schedule),
            pinned: fields.len() == 7 && is_pinned(&fields),
        })
    }

    /// True when the expression can yield at most one instant
    pub fn is_one_shot(&self) -> bool {
        match self {
            Recurrence::OneShot(_) => true,
            Recurrence::Cron { pinned, .. } => *pinned,
        }
    }

    /// Next instant strictly after `after`, evaluated in `timezone`.
    ///
    /// Returns `None` when the recurrence has nothing left to produce.
    pub fn next_after(&self, after: DateTime<Utc>, timezone: Tz) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::OneShot(at) => (*at > after).then_some(*at),
            Recurrence::Cron { schedule, .. } => schedule
                .after(&after.with_timezone(&timezone))
                .next()
                .map(|next| next.with_timezone(&Utc)),
        }
    }
}

/// Compute the next occurrence of `expression` strictly after `after`
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
    timezone: Tz,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(Recurrence::parse(expression)?.next_after(after, timezone))
}

/// Validate an expression without computing anything
pub fn validate_expression(expression: &str) -> Result<(), ScheduleError> {
    Recurrence::parse(expression).map(|_| ())
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    Tz::from_str(name).map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// Timezone used when none is configured
pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

fn parse_cron_expression(original: &str, normalized: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(normalized).map_err(|e| invalid(original, &e.to_string()))
}

fn invalid(expression: &str, reason: &str) -> ScheduleError {
    ScheduleError::InvalidExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

fn is_restricted(field: &str) -> bool {
    !matches!(field, "*" | "?")
}

/// Every field except day-of-week names a single numeric value.
fn is_pinned(fields: &[&str]) -> bool {
    fields.iter().enumerate().all(|(index, field)| {
        if index == 5 {
            matches!(*field, "*" | "?") || field.chars().all(|c| c.is_ascii_alphanumeric())
        } else {
            field.chars().all(|c| c.is_ascii_digit())
        }
    })
}

/// Rewrite a Unix day-of-week field (0-7, Sunday = 0 or 7) into day names.
///
/// Numeric ranges and steps are expanded into explicit lists; named tokens
/// pass through untouched.
fn normalize_unix_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be greater than 0".to_string());
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        if !range.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '*') {
            parts.push(item.to_string());
            continue;
        }

        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (parse_day(start)?, parse_day(end)?),
                None => {
                    let start = parse_day(range)?;
                    (start, if step.is_some() { 6 } else { start })
                }
            },
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", range));
        }

        let mut day = start;
        while day <= end {
            let name = DAY_NAMES[(day % 7) as usize];
            if !parts.iter().any(|p| p == name) {
                parts.push(name.to_string());
            }
            day += step.unwrap_or(1);
        }
    }

    Ok(parts.join(","))
}

fn parse_day(value: &str) -> Result<u32, String> {
    let day: u32 = value
        .parse()
        .map_err(|_| format!("invalid day-of-week value '{}'", value))?;
    if day > 7 {
        return Err(format!("day-of-week value {} out of range 0-7", day));
    }
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_weekly_named_day() {
        // 2024-01-01 is a Monday
        let next = next_occurrence("0 9 * * Mon", at(2024, 1, 1, 0, 0), default_timezone())
            .unwrap();
        assert_eq!(next, Some(at(2024, 1, 1, 9, 0)));

        let next = next_occurrence("0 9 * * Mon", at(2024, 1, 1, 9, 0), default_timezone())
            .unwrap();
        assert_eq!(next, Some(at(2024, 1, 8, 9, 0)));
    }

    #[test]
    fn test_unix_numeric_day_of_week() {
        // 1 = Monday in the 5-field form
        let next = next_occurrence("30 8 * * 1", at(2024, 1, 2, 0, 0), default_timezone())
            .unwrap();
        assert_eq!(next, Some(at(2024, 1, 8, 8, 30)));

        // 0 and 7 both mean Sunday (2024-01-07)
        for expr in ["0 12 * * 0", "0 12 * * 7"] {
            let next = next_occurrence(expr, at(2024, 1, 1, 0, 0), default_timezone()).unwrap();
            assert_eq!(next, Some(at(2024, 1, 7, 12, 0)), "{}", expr);
        }
    }

    #[test]
    fn test_normalize_day_of_week() {
        assert_eq!(normalize_unix_day_of_week("1-5").unwrap(), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(normalize_unix_day_of_week("5-7").unwrap(), "Fri,Sat,Sun");
        assert_eq!(normalize_unix_day_of_week("*/2").unwrap(), "Sun,Tue,Thu,Sat");
        assert_eq!(normalize_unix_day_of_week("0,6").unwrap(), "Sun,Sat");
        assert_eq!(normalize_unix_day_of_week("Mon-Fri").unwrap(), "Mon-Fri");
        assert!(normalize_unix_day_of_week("8").is_err());
        assert!(normalize_unix_day_of_week("5-2").is_err());
        assert!(normalize_unix_day_of_week("*/0").is_err());
    }

    #[test]
    fn test_day_of_month_and_day_of_week_not_both_restricted() {
        let err = Recurrence::parse("0 9 1 * Mon").unwrap_err();
        assert!(err.to_string().contains("cannot both be restricted"));
        assert!(Recurrence::parse("0 9 1-7 * 1").is_err());

        assert!(Recurrence::parse("0 9 1 * *").is_ok());
        assert!(Recurrence::parse("0 9 ? * Mon").is_ok());
        // Six and seven fields keep the cron crate's reading: both must match
        let next = next_occurrence("0 0 9 1 * Mon", at(2024, 1, 2, 0, 0), default_timezone())
            .unwrap();
        assert_eq!(next, Some(at(2024, 4, 1, 9, 0)));
    }

    #[test]
    fn test_six_field_expression_with_seconds() {
        let next = next_occurrence("30 0 12 * * *", at(2024, 1, 1, 0, 0), default_timezone())
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 30).unwrap());
    }

    #[test]
    fn test_invalid_field_count() {
        let err = Recurrence::parse("* * *").unwrap_err();
        assert!(err.to_string().contains("expected 5, 6 or 7 fields"));
    }

    #[test]
    fn test_invalid_field_range() {
        assert!(Recurrence::parse("61 * * * *").is_err());
        assert!(Recurrence::parse("0 25 * * *").is_err());
        assert!(Recurrence::parse("").is_err());
        assert!(Recurrence::parse("not a cron").is_err());
    }

    #[test]
    fn test_one_shot_instant() {
        let recurrence = Recurrence::parse("2024-01-01T00:05:00Z").unwrap();
        assert!(recurrence.is_one_shot());
        assert_eq!(
            recurrence.next_after(at(2024, 1, 1, 0, 0), default_timezone()),
            Some(at(2024, 1, 1, 0, 5))
        );
        // Not after the reference instant: nothing left, not an error
        assert_eq!(
            recurrence.next_after(at(2024, 1, 1, 0, 5), default_timezone()),
            None
        );
    }

    #[test]
    fn test_pinned_cron_is_one_shot() {
        let recurrence = Recurrence::parse("0 0 9 20 10 * 2026").unwrap();
        assert!(recurrence.is_one_shot());
        assert_eq!(
            recurrence.next_after(at(2026, 1, 1, 0, 0), default_timezone()),
            Some(at(2026, 10, 20, 9, 0))
        );
        assert_eq!(
            recurrence.next_after(at(2026, 10, 20, 9, 0), default_timezone()),
            None
        );

        assert!(!Recurrence::parse("0 9 * * *").unwrap().is_one_shot());
        assert!(!Recurrence::parse("0 0 9 * 10 * 2026").unwrap().is_one_shot());
    }

    #[test]
    fn test_shortcut_expression() {
        let next = next_occurrence("@daily", at(2024, 1, 1, 10, 0), default_timezone()).unwrap();
        assert_eq!(next, Some(at(2024, 1, 2, 0, 0)));
    }

    #[test]
    fn test_timezone_evaluation() {
        let tz = parse_timezone("Asia/Ho_Chi_Minh").unwrap();
        // 09:00 in UTC+7 is 02:00 UTC
        let next = next_occurrence("0 9 * * *", at(2024, 1, 1, 0, 0), tz).unwrap();
        assert_eq!(next, Some(at(2024, 1, 1, 2, 0)));
    }

    #[test]
    fn test_parse_timezone_rejects_unknown() {
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }
}
