//! Billing month value type.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a billing month string is not `YYYY-MM`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid billing month '{input}': expected YYYY-MM")]
pub struct BillingMonthParseError {
    pub input: String,
}

/// A calendar month that raw costs and invoices are grouped by.
///
/// Parsed from `YYYY-MM`, persisted as the first day of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingMonth {
    year: i32,
    month: u32,
}

impl BillingMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    /// Build from any date inside the month.
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .expect("billing month is validated at construction")
    }

    /// Last day of the month.
    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().expect("month has a predecessor day")
    }

    /// Midnight UTC at the start of the month.
    pub fn start_instant(&self) -> DateTime<Utc> {
        self.first_day()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc()
    }

    /// Midnight UTC at the start of the following month (exclusive bound).
    pub fn end_instant(&self) -> DateTime<Utc> {
        self.next().start_instant()
    }

    /// The following calendar month.
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

    /// Whether `date` falls inside this month.
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Whether the inclusive window `[from, to]` overlaps this month.
    /// An open-ended window (`to = None`) overlaps every month from `from` on.
    pub fn overlaps(&self, from: NaiveDate, to: Option<NaiveDate>) -> bool {
        let starts_in_time = from <= self.last_day();
        let ends_in_time = to.map(|t| t >= self.first_day()).unwrap_or(true);
        starts_in_time && ends_in_time
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingMonth {
    type Err = BillingMonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || BillingMonthParseError {
            input: s.to_string(),
        };

        let (year_part, month_part) = s.split_once('-').ok_or_else(err)?;
        if year_part.len() != 4 || month_part.len() != 2 {
            return Err(err());
        }

        let year: i32 = year_part.parse().map_err(|_| err())?;
        let month: u32 = month_part.parse().map_err(|_| err())?;

        Self::new(year, month).ok_or_else(err)
    }
}

impl TryFrom<String> for BillingMonth {
    type Error = BillingMonthParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillingMonth> for String {
    fn from(value: BillingMonth) -> Self {
        value.to_string()
    }
}
