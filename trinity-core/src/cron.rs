//! Cron expression handling for schedules
//!
//! Users write standard 5-field cron (minute hour day-of-month month
//! day-of-week). The `cron` crate wants a seconds field, so parsing
//! prepends one; scheduling is timezone-aware via `chrono-tz`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// A validated 5-field cron expression
#[derive(Debug, Clone)]
pub struct CronExpression {
    raw: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    /// Parse and validate a 5-field expression
    ///
    /// A 4- or 6-field expression is rejected at write time. The `cron`
    /// crate numbers days-of-week Quartz-style (1 = Sunday), so the
    /// standard 0-6 field is shifted before parsing.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!(
                "invalid cron expression '{expression}': expected 5 fields, got {}",
                fields.len()
            )));
        }
        let dow = normalize_day_of_week(fields[4]).ok_or_else(|| {
            Error::Validation(format!(
                "invalid cron expression '{expression}': bad day-of-week field"
            ))
        })?;
        let with_seconds = format!(
            "0 {} {} {} {} {dow}",
            fields[0], fields[1], fields[2], fields[3]
        );
        let schedule = cron::Schedule::from_str(&with_seconds).map_err(|e| {
            Error::Validation(format!("invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Self {
            raw: fields.join(" "),
            schedule,
        })
    }

    /// The normalized 5-field form
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Next fire time strictly after `after`, evaluated in `tz` and
    /// returned in UTC
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz);
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Human-readable rendering for common patterns
    ///
    /// A curated table short-circuits the expressions people actually
    /// write; everything else renders as the raw expression.
    pub fn describe(&self) -> String {
        match self.raw.as_str() {
            "* * * * *" => "Every minute".to_string(),
            "*/5 * * * *" => "Every 5 minutes".to_string(),
            "*/10 * * * *" => "Every 10 minutes".to_string(),
            "*/15 * * * *" => "Every 15 minutes".to_string(),
            "*/30 * * * *" => "Every 30 minutes".to_string(),
            "0 * * * *" => "Every hour".to_string(),
            "0 */2 * * *" => "Every 2 hours".to_string(),
            "0 */6 * * *" => "Every 6 hours".to_string(),
            "0 0 * * *" => "Daily at midnight".to_string(),
            "0 9 * * *" => "Daily at 9:00".to_string(),
            "0 12 * * *" => "Daily at noon".to_string(),
            "0 9 * * 1-5" => "Weekdays at 9:00".to_string(),
            "0 0 * * 0" => "Weekly on Sunday".to_string(),
            "0 0 * * 1" => "Weekly on Monday".to_string(),
            "0 0 1 * *" => "Monthly on the 1st".to_string(),
            other => format!("cron: {other}"),
        }
    }
}

// Shift standard numeric days-of-week (0-7, both 0 and 7 = Sunday) to
// the parser's 1-7 range. Names and wildcards pass through.
fn normalize_day_of_week(field: &str) -> Option<String> {
    fn shift(token: &str) -> Option<String> {
        if token.chars().all(|c| c.is_ascii_digit()) {
            let value: u8 = token.parse().ok()?;
            if value > 7 {
                return None;
            }
            return Some(((value % 7) + 1).to_string());
        }
        // Names (MON, fri) and '*' are already in the parser's terms
        Some(token.to_string())
    }

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (part, None),
        };
        let shifted = match range.split_once('-') {
            Some((a, b)) => format!("{}-{}", shift(a)?, shift(b)?),
            None if range == "*" => "*".to_string(),
            None => shift(range)?,
        };
        parts.push(match step {
            Some(step) => format!("{shifted}/{step}"),
            None => shifted,
        });
    }
    Some(parts.join(","))
}

/// Parse an IANA timezone name, defaulting to UTC for the empty string
pub fn parse_timezone(name: &str) -> Result<Tz> {
    if name.is_empty() {
        return Ok(chrono_tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| Error::Validation(format!("unknown timezone '{name}'")))
}
