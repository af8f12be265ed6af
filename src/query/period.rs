use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::date_util::{last_day_of_month, quarter_of};
use crate::error::{Error, Result};

static RE_HALF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-H([12])$").unwrap());
static RE_QUARTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-Q([1-4])$").unwrap());
static RE_WEEK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-W(\d{1,2})$").unwrap());
static RE_MONTH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})$").unwrap());

/// An inclusive day range. Activity timestamps are filtered by calendar day,
/// matching the `[startDate, endDate]` pairs the transport layer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::DateRange(format!("{start} > {end}")));
        }
        Ok(Self { start, end })
    }

    /// Parse a `["YYYY-MM-DD", "YYYY-MM-DD"]` pair.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d")
            .map_err(|_| Error::DateRange(format!("invalid date: {start}")))?;
        let end = NaiveDate::parse_from_str(end.trim(), "%Y-%m-%d")
            .map_err(|_| Error::DateRange(format!("invalid date: {end}")))?;
        Self::new(start, end)
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d <= self.end
    }

    pub fn contains_range(&self, other: &DateRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    /// Intersection of two ranges, or None when they do not overlap.
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }

    /// The immediately preceding window of equal length:
    /// `[start - (end - start), start)`. A single-day range degenerates to an
    /// empty window under that formula, so it maps to the prior day instead.
    pub fn previous(&self) -> DateRange {
        let span = (self.end - self.start).num_days();
        if span == 0 {
            let prev = self.start - Duration::days(1);
            return DateRange { start: prev, end: prev };
        }
        DateRange {
            start: self.start - Duration::days(span),
            end: self.start - Duration::days(1),
        }
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Time bucket size for rollup partitions and result rows.
/// Ordered finest to coarsest, so `a <= b` means "a is at least as fine as b".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Day,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            other => Err(Error::PeriodParse(format!("unknown granularity: {other}"))),
        }
    }

    /// Start of the bucket containing `d`.
    pub fn truncate(&self, d: NaiveDate) -> NaiveDate {
        match self {
            Granularity::Day => d,
            Granularity::Month => NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap(),
            Granularity::Quarter => {
                let start_month = (quarter_of(d) as u32 - 1) * 3 + 1;
                NaiveDate::from_ymd_opt(d.year(), start_month, 1).unwrap()
            }
            Granularity::Year => NaiveDate::from_ymd_opt(d.year(), 1, 1).unwrap(),
        }
    }

    /// Start of the bucket after the one containing `d`.
    pub fn next(&self, d: NaiveDate) -> NaiveDate {
        let start = self.truncate(d);
        match self {
            Granularity::Day => start + Duration::days(1),
            Granularity::Month => last_day_of_month(start.year(), start.month()) + Duration::days(1),
            Granularity::Quarter => {
                let end_month = start.month() + 2;
                last_day_of_month(start.year(), end_month) + Duration::days(1)
            }
            Granularity::Year => NaiveDate::from_ymd_opt(start.year() + 1, 1, 1).unwrap(),
        }
    }

    /// The full day range of the bucket containing `d`.
    pub fn bucket_range(&self, d: NaiveDate) -> DateRange {
        let start = self.truncate(d);
        DateRange {
            start,
            end: self.next(start) - Duration::days(1),
        }
    }

    /// Canonical key for the bucket containing `d`, e.g. `2025-Q2`, `2025-05`.
    pub fn bucket_key(&self, d: NaiveDate) -> String {
        let start = self.truncate(d);
        match self {
            Granularity::Day => start.format("%Y-%m-%d").to_string(),
            Granularity::Month => start.format("%Y-%m").to_string(),
            Granularity::Quarter => format!("{}-Q{}", start.year(), quarter_of(start)),
            Granularity::Year => format!("{}", start.year()),
        }
    }

    /// Bucket start dates covering `range`, in order.
    pub fn buckets(&self, range: &DateRange) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = self.truncate(range.start);
        while d <= range.end {
            out.push(d);
            d = self.next(d);
        }
        out
    }

    /// Whether `range` starts and ends exactly on bucket boundaries.
    pub fn aligns(&self, range: &DateRange) -> bool {
        self.truncate(range.start) == range.start
            && self.next(range.end) == range.end + Duration::days(1)
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        };
        write!(f, "{s}")
    }
}

/// A named time period for CLI queries and leaderboards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Half(i32, u8),
    Quarter(i32, u8),
    Month(i32, u8),
    Week(i32, u8),
    Rolling(u32, NaiveDate),
}

impl Period {
    /// Parse a period string.
    ///
    /// Supported formats:
    /// - `2025` — year
    /// - `2025-H1` — half
    /// - `2025-Q1` — quarter
    /// - `2025-01` — month
    /// - `2025-W05` — ISO week
    /// - `30d` — rolling last N days, ending today
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        // Rolling: "30d", "7d", etc.
        if s.ends_with('d') || s.ends_with('D') {
            if let Ok(n) = s[..s.len() - 1].parse::<u32>() {
                if n == 0 {
                    return Err(Error::PeriodParse("rolling period must be >= 1 day".into()));
                }
                let today = chrono::Local::now().date_naive();
                return Ok(Period::Rolling(n, today));
            }
        }

        // Year: "2025"
        if s.len() == 4 {
            if let Ok(year) = s.parse::<i32>() {
                return Ok(Period::Year(year));
            }
        }

        if let Some(caps) = RE_HALF.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let half: u8 = caps[2].parse().unwrap();
            return Ok(Period::Half(year, half));
        }

        if let Some(caps) = RE_QUARTER.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let q: u8 = caps[2].parse().unwrap();
            return Ok(Period::Quarter(year, q));
        }

        if let Some(caps) = RE_WEEK.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let week: u8 = caps[2].parse().unwrap();
            if (1..=53).contains(&week) {
                return Ok(Period::Week(year, week));
            }
        }

        if let Some(caps) = RE_MONTH.captures(s) {
            let year: i32 = caps[1].parse().unwrap();
            let month: u8 = caps[2].parse().unwrap();
            if (1..=12).contains(&month) {
                return Ok(Period::Month(year, month));
            }
        }

        Err(Error::PeriodParse(format!("unrecognized period: {s}")))
    }

    /// Canonical key string for display.
    pub fn to_key(&self) -> String {
        match self {
            Period::Year(y) => format!("{y}"),
            Period::Half(y, h) => format!("{y}-H{h}"),
            Period::Quarter(y, q) => format!("{y}-Q{q}"),
            Period::Month(y, m) => format!("{y}-{m:02}"),
            Period::Week(y, w) => format!("{y}-W{w:02}"),
            Period::Rolling(n, _) => format!("{n}d"),
        }
    }

    /// The inclusive day range this period covers.
    pub fn date_range(&self) -> DateRange {
        match self {
            Period::Year(y) => DateRange {
                start: NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
            },
            Period::Half(y, h) => {
                if *h == 1 {
                    DateRange {
                        start: NaiveDate::from_ymd_opt(*y, 1, 1).unwrap(),
                        end: NaiveDate::from_ymd_opt(*y, 6, 30).unwrap(),
                    }
                } else {
                    DateRange {
                        start: NaiveDate::from_ymd_opt(*y, 7, 1).unwrap(),
                        end: NaiveDate::from_ymd_opt(*y, 12, 31).unwrap(),
                    }
                }
            }
            Period::Quarter(y, q) => {
                let start_month = (*q as u32 - 1) * 3 + 1;
                DateRange {
                    start: NaiveDate::from_ymd_opt(*y, start_month, 1).unwrap(),
                    end: last_day_of_month(*y, *q as u32 * 3),
                }
            }
            Period::Month(y, m) => DateRange {
                start: NaiveDate::from_ymd_opt(*y, *m as u32, 1).unwrap(),
                end: last_day_of_month(*y, *m as u32),
            },
            Period::Week(y, w) => {
                let start = NaiveDate::from_isoywd_opt(*y, *w as u32, Weekday::Mon).unwrap();
                DateRange {
                    start,
                    end: start + Duration::days(6),
                }
            }
            Period::Rolling(n, as_of) => DateRange {
                start: *as_of - Duration::days(*n as i64 - 1),
                end: *as_of,
            },
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}
