//! Partial-precision FHIR dates and their index ranges.
//!
//! A `date` such as `2020-05` covers every day of May 2020, so it is indexed
//! (and searched) as an inclusive range of epoch days. A `dateTime` or
//! `instant` is indexed as an inclusive range of epoch milliseconds at the
//! precision it was written with.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// `num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// The precision a date was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePrecision {
    Year,
    Month,
    Day,
}

/// A FHIR `date` value with year, month, or day precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirDate {
    /// First day covered by the value.
    pub start: NaiveDate,
    /// Precision of the written value.
    pub precision: DatePrecision,
}

impl FhirDate {
    /// Parses `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let year: i32 = parts.next()?.parse().ok()?;
        let month = parts.next();
        let day = parts.next();
        if parts.next().is_some() {
            return None;
        }
        match (month, day) {
            (None, None) => Some(Self {
                start: NaiveDate::from_ymd_opt(year, 1, 1)?,
                precision: DatePrecision::Year,
            }),
            (Some(m), None) => Some(Self {
                start: NaiveDate::from_ymd_opt(year, m.parse().ok()?, 1)?,
                precision: DatePrecision::Month,
            }),
            (Some(m), Some(d)) => Some(Self {
                start: NaiveDate::from_ymd_opt(year, m.parse().ok()?, d.parse().ok()?)?,
                precision: DatePrecision::Day,
            }),
            (None, Some(_)) => None,
        }
    }

    /// Last day covered by the value.
    pub fn end(&self) -> NaiveDate {
        let next = match self.precision {
            DatePrecision::Year => self.start.checked_add_months(Months::new(12)),
            DatePrecision::Month => self.start.checked_add_months(Months::new(1)),
            DatePrecision::Day => self.start.succ_opt(),
        };
        next.and_then(|d| d.pred_opt()).unwrap_or(self.start)
    }

    /// Inclusive range of epoch days.
    pub fn epoch_day_range(&self) -> (i64, i64) {
        (epoch_day(self.start), epoch_day(self.end()))
    }
}

/// The precision a dateTime was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateTimePrecision {
    Year,
    Month,
    Day,
    Second,
    Millisecond,
}

/// A FHIR `dateTime` or `instant` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FhirDateTime {
    /// First instant covered by the value.
    pub start: DateTime<Utc>,
    /// Precision of the written value.
    pub precision: DateTimePrecision,
}

impl FhirDateTime {
    /// Parses a dateTime; values without a time part are taken at UTC midnight.
    pub fn parse(value: &str) -> Option<Self> {
        if value.contains('T') {
            let parsed = DateTime::parse_from_rfc3339(value).ok()?;
            let precision = if value.contains('.') {
                DateTimePrecision::Millisecond
            } else {
                DateTimePrecision::Second
            };
            return Some(Self {
                start: parsed.with_timezone(&Utc),
                precision,
            });
        }
        let date = FhirDate::parse(value)?;
        let precision = match date.precision {
            DatePrecision::Year => DateTimePrecision::Year,
            DatePrecision::Month => DateTimePrecision::Month,
            DatePrecision::Day => DateTimePrecision::Day,
        };
        Some(Self {
            start: Utc.from_utc_datetime(&date.start.and_time(NaiveTime::MIN)),
            precision,
        })
    }

    /// Wraps an exact instant.
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        Self {
            start: instant,
            precision: DateTimePrecision::Millisecond,
        }
    }

    /// Last instant covered by the value.
    pub fn end(&self) -> DateTime<Utc> {
        let date = self.start.date_naive();
        let next = match self.precision {
            DateTimePrecision::Year => date
                .with_day(1)
                .and_then(|d| d.with_month(1))
                .and_then(|d| d.checked_add_months(Months::new(12)))
                .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))),
            DateTimePrecision::Month => date
                .with_day(1)
                .and_then(|d| d.checked_add_months(Months::new(1)))
                .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))),
            DateTimePrecision::Day => date
                .succ_opt()
                .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN))),
            DateTimePrecision::Second => Some(self.start + Duration::seconds(1)),
            DateTimePrecision::Millisecond => Some(self.start + Duration::milliseconds(1)),
        };
        next.map(|n| n - Duration::milliseconds(1))
            .unwrap_or(self.start)
    }

    /// Inclusive range of epoch milliseconds.
    pub fn epoch_millis_range(&self) -> (i64, i64) {
        (self.start.timestamp_millis(), self.end().timestamp_millis())
    }
}

/// Days since 1970-01-01.
pub fn epoch_day(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
}
