//! Five-field cron expressions (minute hour day-of-month month day-of-week).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use croner::Cron;

/// Error parsing a cron expression.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error(transparent)]
    Pattern(#[from] croner::errors::CronError),
}

/// A parsed cron schedule evaluated in UTC. Day-of-month and day-of-week
/// combine with OR when both are restricted.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    cron: Cron,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let source = expression.trim();
        let expanded = match source {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let fields = expanded.split_whitespace().count();
        if fields != 5 {
            return Err(CronError::FieldCount(fields));
        }

        Ok(Self {
            source: source.to_string(),
            cron: Cron::new(expanded).parse()?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching minute strictly after `after`, if the pattern ever matches.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&after, false).ok()
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_minute_advances_to_next_boundary() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 12, 0, 30)),
            Some(at(2024, 3, 1, 12, 1, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 12, 1, 0)),
            Some(at(2024, 3, 1, 12, 2, 0))
        );
    }

    #[test]
    fn steps_ranges_and_weekdays() {
        // Every 15 minutes during business hours on weekdays.
        let cron = CronExpr::parse("*/15 9-17 * * MON-FRI").unwrap();
        // 2024-03-01 is a Friday.
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 17, 50, 0)),
            Some(at(2024, 3, 4, 9, 0, 0))
        );
        assert_eq!(
            cron.next_after(at(2024, 3, 4, 9, 0, 0)),
            Some(at(2024, 3, 4, 9, 15, 0))
        );
    }

    #[test]
    fn daily_and_month_rollover() {
        let cron = CronExpr::parse("@daily").unwrap();
        assert_eq!(cron.as_str(), "@daily");
        assert_eq!(
            cron.next_after(at(2024, 12, 31, 8, 0, 0)),
            Some(at(2025, 1, 1, 0, 0, 0))
        );

        let leap = CronExpr::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            leap.next_after(at(2024, 3, 1, 0, 0, 0)),
            Some(at(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn restricted_day_fields_combine_with_or() {
        // The 1st of the month or any Sunday.
        let cron = CronExpr::parse("0 6 1 * 0").unwrap();
        // 2024-03-02 is a Saturday, the 3rd a Sunday.
        assert_eq!(
            cron.next_after(at(2024, 3, 1, 7, 0, 0)),
            Some(at(2024, 3, 3, 6, 0, 0))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(matches!(
            CronExpr::parse("* * * *"),
            Err(CronError::FieldCount(4))
        ));
        assert!(matches!(
            CronExpr::parse("0 * * * * *"),
            Err(CronError::FieldCount(6))
        ));
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }
}
