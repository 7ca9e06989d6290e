use crate::error::{ReportError, Result};
use crate::utils::last_day_of_month;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A calendar reporting month.
///
/// The window covers `[start(), end()]` where `end()` is the last second of
/// the month. Measurements "at" a month boundary use [`ReportPeriod::start`]
/// of the following month, so on-hand-end of `m` and on-hand-first of `m + 1`
/// are the same instant. Serialized as "YYYY-MM".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportPeriod {
    pub year: i32,
    pub month: u32,
}

impl ReportPeriod {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(ReportError::InvalidPeriod(format!(
                "month {} must be between 1 and 12",
                month
            )));
        }
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(ReportError::InvalidPeriod(format!(
                "year {} is out of range",
                year
            )));
        }
        Ok(Self { year, month })
    }

    pub fn containing(timestamp: NaiveDateTime) -> Self {
        Self {
            year: timestamp.year(),
            month: timestamp.month(),
        }
    }

    /// Parses "YYYY-MM".
    pub fn parse(period: &str) -> Result<Self> {
        let start_str = format!("{}-01", period.trim());
        let date = NaiveDate::parse_from_str(&start_str, "%Y-%m-%d").map_err(|_| {
            ReportError::InvalidPeriod(format!(
                "Invalid period format: {}. Expected YYYY-MM",
                period
            ))
        })?;
        Self::new(date.year(), date.month())
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        last_day_of_month(self.year, self.month)
    }

    pub fn start(&self) -> NaiveDateTime {
        self.first_day().and_time(NaiveTime::MIN)
    }

    pub fn end(&self) -> NaiveDateTime {
        let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        self.last_day().and_time(last_second)
    }

    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        timestamp >= self.start() && timestamp <= self.end()
    }

    pub fn contains_strictly(&self, timestamp: NaiveDateTime) -> bool {
        timestamp > self.start() && timestamp < self.end()
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn advance(&self, months: u32) -> Self {
        (0..months).fold(*self, |period, _| period.next())
    }

    /// Months whose report carries the previous quarter's closing inventory.
    pub fn carries_quarterly_inventory(&self) -> bool {
        matches!(self.month, 1 | 4 | 7 | 10)
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl TryFrom<String> for ReportPeriod {
    type Error = ReportError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ReportPeriod> for String {
    fn from(period: ReportPeriod) -> Self {
        period.to_string()
    }
}

impl JsonSchema for ReportPeriod {
    fn schema_name() -> String {
        "ReportPeriod".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        let mut schema = String::json_schema(gen).into_object();
        schema.string().pattern = Some(r"^\d{4}-\d{2}$".to_string());
        Schema::Object(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let period = ReportPeriod::parse("2023-02").unwrap();
        assert_eq!(period, ReportPeriod { year: 2023, month: 2 });
        assert_eq!(period.to_string(), "2023-02");
        assert!(ReportPeriod::parse("2023-13").is_err());
        assert!(ReportPeriod::parse("February").is_err());
    }

    #[test]
    fn test_json_uses_month_strings() {
        let period: ReportPeriod = serde_json::from_str(r#""2023-07""#).unwrap();
        assert_eq!(period, ReportPeriod::new(2023, 7).unwrap());
        assert_eq!(serde_json::to_string(&period).unwrap(), r#""2023-07""#);

        assert!(serde_json::from_str::<ReportPeriod>(r#""2023-13""#).is_err());
        assert!(serde_json::from_str::<ReportPeriod>(r#"{"year": 2023, "month": 13}"#).is_err());
        assert!(serde_json::from_str::<ReportPeriod>(r#"{"year": 2023, "month": 7}"#).is_err());
    }

    #[test]
    fn test_window_bounds() {
        let feb = ReportPeriod::new(2024, 2).unwrap();
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert!(feb.contains(feb.start()));
        assert!(feb.contains(feb.end()));
        assert!(!feb.contains_strictly(feb.start()));
        assert!(!feb.contains(feb.next().start()));
    }

    #[test]
    fn test_next_and_prev_wrap_years() {
        let dec = ReportPeriod::new(2023, 12).unwrap();
        assert_eq!(dec.next(), ReportPeriod::new(2024, 1).unwrap());
        assert_eq!(dec.next().prev(), dec);
        assert_eq!(dec.advance(14), ReportPeriod::new(2025, 2).unwrap());
        assert_eq!(dec.advance(0), dec);
    }

    #[test]
    fn test_quarterly_months() {
        let flagged: Vec<u32> = (1..=12)
            .filter(|m| ReportPeriod::new(2023, *m).unwrap().carries_quarterly_inventory())
            .collect();
        assert_eq!(flagged, vec![1, 4, 7, 10]);
    }
}
