//! CUSIP security identifiers.
//!
//! Filings and mapping sources disagree on formatting: leading zeros get dropped by
//! spreadsheet tooling, case varies and surrounding whitespace is common. Both sides of the
//! quarter join go through [`Cusip::normalize`] before they reach the database, so the
//! equality join in the filter runner compares canonical values.

use std::fmt;

/// Length of a canonical CUSIP.
pub const CUSIP_LEN: usize = 9;

/// A normalized, nine-character security identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cusip(String);

impl Cusip {
    /// Canonical form of a raw identifier: trimmed, upper-cased, left-padded with `0` to nine
    /// characters and truncated to nine.
    ///
    /// ```
    /// use holdings_db::Cusip;
    ///
    /// assert_eq!(Cusip::normalize(" 37833100 ").as_str(), "037833100");
    /// assert_eq!(Cusip::normalize("g1151c101").as_str(), "G1151C101");
    /// assert_eq!(Cusip::normalize("0378331005").as_str(), "037833100");
    /// ```
    pub fn normalize(raw: &str) -> Self {
        let trimmed = raw.trim().to_ascii_uppercase();
        let mut padded = format!("{trimmed:0>CUSIP_LEN$}");
        if let Some((cut, _)) = padded.char_indices().nth(CUSIP_LEN) {
            padded.truncate(cut);
        }
        Self(padded)
    }

    /// Whether the identifier is a placeholder carrying no identity (`""`, `"0"` or all
    /// zeros). Placeholders would join against every other placeholder, so loaders drop them.
    pub fn is_placeholder(&self) -> bool {
        self.0.chars().all(|ch| ch == '0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Cusip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cusip {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Cusip {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

impl sqlx::Type<sqlx::Postgres> for Cusip {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<sqlx::Postgres>>::type_info()
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for Cusip {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'_>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <&str as sqlx::Encode<'_, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pads_short_identifiers() {
        assert_eq!(Cusip::normalize("123").as_str(), "000000123");
        assert_eq!(Cusip::normalize("").as_str(), "000000000");
    }

    #[test]
    fn normalize_keeps_canonical_identifiers() {
        assert_eq!(Cusip::normalize("037833100").as_str(), "037833100");
    }

    #[test]
    fn normalize_truncates_long_identifiers() {
        assert_eq!(Cusip::normalize("037833100ABC").as_str(), "037833100");
    }

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(Cusip::normalize("\t594918104\n").as_str(), "594918104");
        assert_eq!(Cusip::normalize("g5960l103").as_str(), "G5960L103");
    }

    #[test]
    fn placeholders_are_detected() {
        assert!(Cusip::normalize("").is_placeholder());
        assert!(Cusip::normalize("   ").is_placeholder());
        assert!(Cusip::normalize("0").is_placeholder());
        assert!(Cusip::normalize("000000000").is_placeholder());
        assert!(!Cusip::normalize("037833100").is_placeholder());
        assert!(!Cusip::normalize("G5960L103").is_placeholder());
    }
}
