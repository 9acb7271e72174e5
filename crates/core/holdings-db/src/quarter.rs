//! Calendar quarters, the partition key of every holdings table.
//!
//! A [`YearQuarter`] owns the half-open date range `[start_date, end_date)`; the end of one
//! quarter is by construction the start of the next, so partitions derived from consecutive
//! quarters never overlap and never leave gaps.

use std::{fmt, str::FromStr};

use chrono::{Datelike as _, NaiveDate};

/// Earliest year accepted for a quarter.
pub const MIN_YEAR: i32 = 1;

/// Latest year accepted for a quarter (its Q4 still ends inside a four-digit year).
pub const MAX_YEAR: i32 = 9998;

/// One of the four calendar quarters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    /// All quarters in calendar order.
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    /// Quarter from its number (1..=4).
    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(Quarter::Q1),
            2 => Some(Quarter::Q2),
            3 => Some(Quarter::Q3),
            4 => Some(Quarter::Q4),
            _ => None,
        }
    }

    /// Quarter number (1..=4).
    pub fn number(self) -> u32 {
        match self {
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }

    /// First month of the quarter: January, April, July or October.
    pub fn start_month(self) -> u32 {
        (self.number() - 1) * 3 + 1
    }

    /// Quarter containing the given month (1..=12).
    fn from_month(month: u32) -> Option<Self> {
        Self::from_number((month.checked_sub(1)?) / 3 + 1)
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.number())
    }
}

/// Errors that occur when building or parsing a quarter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuarterParseError {
    /// Token does not follow the `Q{1-4}_{YYYY}` shape
    #[error("invalid quarter token '{token}', expected Q{{1-4}}_{{YYYY}} (e.g. Q2_2013)")]
    InvalidToken { token: String },

    /// Quarter number outside 1..=4
    #[error("quarter must be between 1 and 4, got {quarter}")]
    QuarterOutOfRange { quarter: i64 },

    /// Year outside the supported range
    #[error("year must be between {MIN_YEAR} and {MAX_YEAR}, got {year}")]
    YearOutOfRange { year: i64 },
}

/// A `(year, quarter)` pair: the identity of one partition.
///
/// Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearQuarter {
    year: i32,
    quarter: Quarter,
}

impl YearQuarter {
    /// Builds a quarter, rejecting years outside [`MIN_YEAR`]..=[`MAX_YEAR`].
    pub fn new(year: i32, quarter: Quarter) -> Result<Self, QuarterParseError> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(QuarterParseError::YearOutOfRange { year: year.into() });
        }
        Ok(Self { year, quarter })
    }

    /// Builds a quarter from raw integers as they appear in holdings rows.
    pub fn from_parts(year: i32, quarter: i32) -> Result<Self, QuarterParseError> {
        let quarter = u32::try_from(quarter)
            .ok()
            .and_then(Quarter::from_number)
            .ok_or(QuarterParseError::QuarterOutOfRange {
                quarter: quarter.into(),
            })?;
        Self::new(year, quarter)
    }

    /// Quarter containing the given calendar date.
    pub fn from_date(date: NaiveDate) -> Result<Self, QuarterParseError> {
        let quarter = Quarter::from_month(date.month()).ok_or(
            QuarterParseError::QuarterOutOfRange {
                quarter: date.month().into(),
            },
        )?;
        Self::new(date.year(), quarter)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> Quarter {
        self.quarter
    }

    /// First calendar day of the quarter: the partition key value of every row it holds.
    pub fn start_date(&self) -> NaiveDate {
        // Always valid: the year range is checked on construction and day 1 exists in every month
        NaiveDate::from_ymd_opt(self.year, self.quarter.start_month(), 1)
            .unwrap_or(NaiveDate::MIN)
    }

    /// Exclusive end of the quarter, i.e. the start of the next quarter.
    pub fn end_date(&self) -> NaiveDate {
        self.next().start_date()
    }

    /// The following quarter; Q4 rolls over to Q1 of the next year.
    pub fn next(&self) -> Self {
        match self.quarter {
            Quarter::Q1 => Self { quarter: Quarter::Q2, ..*self },
            Quarter::Q2 => Self { quarter: Quarter::Q3, ..*self },
            Quarter::Q3 => Self { quarter: Quarter::Q4, ..*self },
            Quarter::Q4 => Self {
                year: self.year + 1,
                quarter: Quarter::Q1,
            },
        }
    }

    /// Whether `date` lies in `[start_date, end_date)`.
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date() <= date && date < self.end_date()
    }

    /// Deterministic partition name: `{table}_{year}_q{quarter}`.
    pub fn partition_name(&self, table: &str) -> String {
        format!("{table}_{}_q{}", self.year, self.quarter.number())
    }
}

impl fmt::Display for YearQuarter {
    /// Formats as the window token, e.g. `Q2_2013`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.quarter, self.year)
    }
}

impl FromStr for YearQuarter {
    type Err = QuarterParseError;

    /// Parses the `Q{1-4}_{YYYY}` window token.
    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let invalid = || QuarterParseError::InvalidToken {
            token: token.to_string(),
        };

        let (quarter, year) = token
            .strip_prefix('Q')
            .or_else(|| token.strip_prefix('q'))
            .and_then(|rest| rest.split_once('_'))
            .ok_or_else(invalid)?;

        let all_digits =
            |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if year.len() != 4 || !all_digits(year) || !all_digits(quarter) {
            return Err(invalid());
        }
        let quarter: i64 = quarter.parse().map_err(|_| invalid())?;
        let year: i32 = year.parse().map_err(|_| invalid())?;

        let quarter = u32::try_from(quarter)
            .ok()
            .and_then(Quarter::from_number)
            .ok_or(QuarterParseError::QuarterOutOfRange { quarter })?;
        Self::new(year, quarter)
    }
}

/// Inclusive window of quarters, e.g. `Q2_2013..=Q2_2025`.
///
/// A window whose start lies after its end is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarterWindow {
    start: YearQuarter,
    end: YearQuarter,
}

impl QuarterWindow {
    pub fn new(start: YearQuarter, end: YearQuarter) -> Self {
        Self { start, end }
    }

    /// Parses both bounds from window tokens.
    pub fn parse(start: &str, end: &str) -> Result<Self, QuarterParseError> {
        Ok(Self::new(start.parse()?, end.parse()?))
    }

    pub fn start(&self) -> YearQuarter {
        self.start
    }

    pub fn end(&self) -> YearQuarter {
        self.end
    }

    /// Number of quarters in the window.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Quarters of the window in chronological order.
    pub fn iter(&self) -> QuarterIter {
        QuarterIter {
            next: (!self.is_empty()).then_some(self.start),
            end: self.end,
        }
    }
}

impl IntoIterator for QuarterWindow {
    type Item = YearQuarter;
    type IntoIter = QuarterIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &QuarterWindow {
    type Item = YearQuarter;
    type IntoIter = QuarterIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the quarters of a [`QuarterWindow`].
#[derive(Debug, Clone)]
pub struct QuarterIter {
    next: Option<YearQuarter>,
    end: YearQuarter,
}

impl Iterator for QuarterIter {
    type Item = YearQuarter;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = (current < self.end).then(|| current.next());
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yq(year: i32, quarter: i32) -> YearQuarter {
        YearQuarter::from_parts(year, quarter).expect("valid quarter")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn start_dates_follow_quarter_months() {
        assert_eq!(yq(2013, 1).start_date(), date(2013, 1, 1));
        assert_eq!(yq(2013, 2).start_date(), date(2013, 4, 1));
        assert_eq!(yq(2013, 3).start_date(), date(2013, 7, 1));
        assert_eq!(yq(2013, 4).start_date(), date(2013, 10, 1));
    }

    #[test]
    fn q4_ends_at_next_january() {
        assert_eq!(yq(2013, 4).end_date(), date(2014, 1, 1));
        assert_eq!(yq(2013, 4).next(), yq(2014, 1));
    }

    #[test]
    fn adjacent_quarters_share_their_boundary() {
        let window = QuarterWindow::new(yq(2010, 1), yq(2016, 4));
        let quarters: Vec<_> = window.iter().collect();

        for pair in quarters.windows(2) {
            assert_eq!(pair[0].end_date(), pair[1].start_date());
        }
    }

    #[test]
    fn contains_is_half_open() {
        let q2 = yq(2013, 2);
        assert!(q2.contains(date(2013, 4, 1)));
        assert!(q2.contains(date(2013, 6, 30)));
        assert!(!q2.contains(date(2013, 7, 1)));
        assert!(!q2.contains(date(2013, 3, 31)));
    }

    #[test]
    fn from_date_maps_to_containing_quarter() {
        assert_eq!(YearQuarter::from_date(date(2013, 12, 31)), Ok(yq(2013, 4)));
        assert_eq!(YearQuarter::from_date(date(2014, 3, 31)), Ok(yq(2014, 1)));
        assert_eq!(YearQuarter::from_date(date(2014, 4, 1)), Ok(yq(2014, 2)));
    }

    #[test]
    fn partition_name_is_deterministic() {
        assert_eq!(yq(2013, 2).partition_name("t"), "t_2013_q2");
        assert_eq!(yq(2024, 4).partition_name("holdings"), "holdings_2024_q4");
    }

    #[test]
    fn from_parts_rejects_out_of_range_quarters() {
        assert_eq!(
            YearQuarter::from_parts(2013, 5),
            Err(QuarterParseError::QuarterOutOfRange { quarter: 5 })
        );
        assert_eq!(
            YearQuarter::from_parts(2013, 0),
            Err(QuarterParseError::QuarterOutOfRange { quarter: 0 })
        );
        assert!(matches!(
            YearQuarter::from_parts(0, 1),
            Err(QuarterParseError::YearOutOfRange { year: 0 })
        ));
    }

    #[test]
    fn token_round_trips_through_display() {
        let parsed: YearQuarter = "Q2_2013".parse().expect("valid token");
        assert_eq!(parsed, yq(2013, 2));
        assert_eq!(parsed.to_string(), "Q2_2013");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        for token in ["", "Q2", "2013_Q2", "Q2-2013", "Q_2013", "Q2_13", "Qx_2013"] {
            assert!(
                matches!(
                    token.parse::<YearQuarter>(),
                    Err(QuarterParseError::InvalidToken { .. })
                ),
                "token {token:?} should be invalid"
            );
        }
        assert_eq!(
            "Q5_2013".parse::<YearQuarter>(),
            Err(QuarterParseError::QuarterOutOfRange { quarter: 5 })
        );
    }

    #[test]
    fn signed_quarter_or_year_is_rejected() {
        for token in ["Q+2_2013", "Q-2_2013", "Q2_+2013", "Q2_+201", "Q2_-201", "Q 2_2013"] {
            assert!(
                matches!(
                    token.parse::<YearQuarter>(),
                    Err(QuarterParseError::InvalidToken { .. })
                ),
                "token {token:?} should be invalid"
            );
        }
    }

    #[test]
    fn window_is_inclusive_and_crosses_years() {
        let window = QuarterWindow::parse("Q3_2013", "Q2_2014").expect("valid window");
        let tokens: Vec<String> = window.iter().map(|q| q.to_string()).collect();

        assert_eq!(tokens, ["Q3_2013", "Q4_2013", "Q1_2014", "Q2_2014"]);
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn single_quarter_window_yields_one_quarter() {
        let window = QuarterWindow::parse("Q1_2013", "Q1_2013").expect("valid window");
        assert_eq!(window.iter().collect::<Vec<_>>(), [yq(2013, 1)]);
    }

    #[test]
    fn reversed_window_is_empty() {
        let window = QuarterWindow::parse("Q2_2014", "Q1_2014").expect("valid window");
        assert!(window.is_empty());
        assert_eq!(window.iter().count(), 0);
    }
}
