//! Core domain model and validation rules for the PNCP tender sync.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pncp-core";

/// Contract-modality codes recognized by the portal (leilão, pregão,
/// dispensa, credenciamento, ...). Walks iterate all of them in order.
pub const MODALITY_CODES: std::ops::RangeInclusive<u8> = 1..=13;

/// Page size every search request is issued with.
pub const PAGE_SIZE: u32 = 50;

/// Calendar window a sync walk covers, bounded inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("expected an 8-digit date (YYYYMMDD), got {0:?}")]
    Format(String),
    #[error("range start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parses the portal's compact `YYYYMMDD` form used in query strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, DateRangeError> {
        Self::new(parse_compact_date(start)?, parse_compact_date(end)?)
    }

    /// Yesterday through today, the window the hourly delta job walks.
    pub fn last_day(today: NaiveDate) -> Self {
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        Self {
            start: yesterday,
            end: today,
        }
    }

    pub fn start_compact(&self) -> String {
        self.start.format("%Y%m%d").to_string()
    }

    pub fn end_compact(&self) -> String {
        self.end.format("%Y%m%d").to_string()
    }
}

fn parse_compact_date(input: &str) -> Result<NaiveDate, DateRangeError> {
    if input.len() != 8 || !input.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DateRangeError::Format(input.to_string()));
    }
    NaiveDate::parse_from_str(input, "%Y%m%d")
        .map_err(|_| DateRangeError::Format(input.to_string()))
}

/// Government sub-unit issuing tenders. Created if absent, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrganizationalUnit {
    pub unit_code: String,
    pub name: String,
    pub city: Option<String>,
    pub state_name: Option<String>,
    pub state_abbr: Option<String>,
    pub ibge_code: Option<String>,
}

/// Legal entity (keyed by tax id) behind a tender. Created if absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContractingEntity {
    pub tax_id: String,
    pub name: String,
    pub branch_code: Option<String>,
    pub sphere_code: Option<String>,
}

/// Statutory basis authorizing a procurement instrument. Created if absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLegalBasis {
    pub code: i32,
    pub name: String,
    pub description: Option<String>,
}

/// Fully mapped tender row, foreign keys already resolved.
///
/// `global_update_date` is the authoritative change marker: a stored row is
/// only touched when the incoming value differs from the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTender {
    pub control_number: String,
    pub purchase_number: Option<String>,
    pub purchase_year: Option<i32>,
    pub purchase_sequence: Option<i32>,
    pub process: Option<String>,
    pub modality_id: i32,
    pub modality_name: Option<String>,
    pub instrument_type_name: Option<String>,
    pub status_id: Option<i32>,
    pub status_name: Option<String>,
    pub object: String,
    pub estimated_total: Option<f64>,
    pub approved_total: Option<f64>,
    pub inclusion_date: Option<DateTime<Utc>>,
    pub publication_date: Option<DateTime<Utc>>,
    pub global_update_date: Option<DateTime<Utc>>,
    pub proposal_opening_date: Option<DateTime<Utc>>,
    pub proposal_closing_date: Option<DateTime<Utc>>,
    pub dispute_mode_id: Option<i32>,
    pub dispute_mode_name: Option<String>,
    pub srp: bool,
    pub submitted_by: Option<String>,
    pub source_system_url: Option<String>,
    pub eprocess_url: Option<String>,
    pub organizational_unit_id: i64,
    pub contracting_entity_id: i64,
    pub legal_basis_id: i64,
}

/// Why a raw record was dropped from a page instead of written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    MissingControlNumber,
    MissingOrganizationalUnit,
    MissingContractingEntity,
    MissingLegalBasis,
    EstimatedValueOutOfRange,
    ApprovedValueOutOfRange,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::MissingControlNumber => "missing-control-number",
            RejectReason::MissingOrganizationalUnit => "missing-organizational-unit",
            RejectReason::MissingContractingEntity => "missing-contracting-entity",
            RejectReason::MissingLegalBasis => "missing-legal-basis",
            RejectReason::EstimatedValueOutOfRange => "estimated-value-out-of-range",
            RejectReason::ApprovedValueOutOfRange => "approved-value-out-of-range",
        }
    }
}

/// Monetary columns only hold values inside the signed 32-bit range; rows
/// violating the bound are dropped whole, never defaulted.
pub fn within_monetary_bound(value: f64) -> bool {
    value.is_finite() && value >= i32::MIN as f64 && value <= i32::MAX as f64
}

/// Title-cases a reference display name at creation time.
///
/// The portal delivers names in all caps; stored rows keep one canonical
/// casing so repeated pages never produce near-duplicate spellings.
pub fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_dates_parse_and_roundtrip() {
        let range = DateRange::parse("20250101", "20250108").unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2025, 1, 8).unwrap());
        assert_eq!(range.start_compact(), "20250101");
        assert_eq!(range.end_compact(), "20250108");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        assert_eq!(
            DateRange::parse("2025-01-01", "20250108"),
            Err(DateRangeError::Format("2025-01-01".to_string()))
        );
        assert!(matches!(
            DateRange::parse("20250101", "2025"),
            Err(DateRangeError::Format(_))
        ));
        assert!(matches!(
            DateRange::parse("20250199", "20250201"),
            Err(DateRangeError::Format(_))
        ));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            DateRange::parse("20250108", "20250101"),
            Err(DateRangeError::Inverted { .. })
        ));
    }

    #[test]
    fn last_day_spans_yesterday_to_today() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let range = DateRange::last_day(today);
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());
        assert_eq!(range.end, today);
    }

    #[test]
    fn monetary_bound_accepts_ordinary_values() {
        assert!(within_monetary_bound(150_000.50));
        assert!(within_monetary_bound(0.0));
        assert!(within_monetary_bound(-1.0));
        assert!(within_monetary_bound(i32::MAX as f64));
        assert!(within_monetary_bound(i32::MIN as f64));
    }

    #[test]
    fn monetary_bound_rejects_overflow_and_non_finite() {
        assert!(!within_monetary_bound(1e20));
        assert!(!within_monetary_bound(i32::MAX as f64 + 1.0));
        assert!(!within_monetary_bound(f64::NAN));
        assert!(!within_monetary_bound(f64::INFINITY));
        assert!(!within_monetary_bound(f64::NEG_INFINITY));
    }

    #[test]
    fn names_are_title_cased() {
        assert_eq!(
            title_case("SECRETARIA MUNICIPAL DE OBRAS"),
            "Secretaria Municipal De Obras"
        );
        assert_eq!(title_case("  prefeitura   de  niterói "), "Prefeitura De Niterói");
        assert_eq!(title_case(""), "");
    }
}
