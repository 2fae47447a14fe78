//! Core domain model, archive schemas and field normalization for proptx.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Month, NaiveDate, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "proptx-core";

/// Square feet per square metre as used by the token API feed.
pub const SQFT_PER_SQM_API: f64 = 10.76391042;

/// Square feet per square metre as used by the search-form pages.
pub const SQFT_PER_SQM_SEARCH: f64 = 10.764;

/// Raw text the source uses for "not applicable". Rewritten before persisting
/// because CSV readers treat it as a missing value.
pub const SOURCE_NA_TEXT: &str = "NA";
pub const SOURCE_NA_REPLACEMENT: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("empty period token")]
    Empty,
    #[error("unrecognised period token {0:?}")]
    Unrecognised(String),
    #[error("month out of range in period token {0:?}")]
    MonthOutOfRange(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("field {field} is not a number: {raw:?}")]
    InvalidNumber { field: &'static str, raw: String },
    #[error("field {field} must be a non-negative whole number, got {value}")]
    InvalidCount { field: &'static str, value: f64 },
    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),
    #[error("area must be positive to derive a unit price, got {0:?}")]
    NonPositiveArea(Option<f64>),
    #[error(transparent)]
    Period(#[from] PeriodError),
}

// ---------------------------------------------------------------------------
// Numeric coercion
// ---------------------------------------------------------------------------

fn is_missing_text(text: &str) -> bool {
    matches!(
        text.to_ascii_uppercase().as_str(),
        "" | "-" | "NA" | "N.A." | "N/A" | "NAN" | "NULL"
    )
}

/// Parse a numeric cell. Blank and placeholder cells become `None`, never zero.
pub fn parse_optional_number(
    field: &'static str,
    raw: &str,
) -> Result<Option<f64>, NormalizeError> {
    let cleaned = raw
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '$' && !c.is_whitespace())
        .collect::<String>();
    if is_missing_text(&cleaned) {
        return Ok(None);
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(NormalizeError::InvalidNumber {
            field,
            raw: raw.to_string(),
        }),
    }
}

pub fn parse_required_number(field: &'static str, raw: &str) -> Result<f64, NormalizeError> {
    parse_optional_number(field, raw)?.ok_or(NormalizeError::MissingField(field))
}

pub fn parse_optional_count(field: &'static str, raw: &str) -> Result<Option<u32>, NormalizeError> {
    match parse_optional_number(field, raw)? {
        None => Ok(None),
        Some(value) if value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 => {
            Ok(Some(value as u32))
        }
        Some(value) => Err(NormalizeError::InvalidCount { field, value }),
    }
}

pub fn parse_required_count(field: &'static str, raw: &str) -> Result<u32, NormalizeError> {
    parse_optional_count(field, raw)?.ok_or(NormalizeError::MissingField(field))
}

// ---------------------------------------------------------------------------
// Period resolution
// ---------------------------------------------------------------------------

/// Last calendar day of `month` in `year`, derived from the first day of the
/// following month.
pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Two-digit years follow the POSIX `%y` pivot: 69-99 are 19xx, 00-68 are 20xx.
fn expand_year(digits: &str, token: &str) -> Result<i32, PeriodError> {
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(PeriodError::Unrecognised(token.to_string()));
    }
    let value: i32 = digits
        .parse()
        .map_err(|_| PeriodError::Unrecognised(token.to_string()))?;
    match digits.len() {
        2 if value <= 68 => Ok(2000 + value),
        2 => Ok(1900 + value),
        4 => Ok(value),
        _ => Err(PeriodError::Unrecognised(token.to_string())),
    }
}

/// Parse a period token into `(year, month)`.
///
/// Accepted shapes: `MMYY` (`0220`), `Mon-YY` (`Feb-20`) and `Mon YYYY`
/// (`FEB 2020`). Month names are matched case-insensitively.
pub fn parse_period(token: &str) -> Result<(i32, u32), PeriodError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(PeriodError::Empty);
    }

    if token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
        let month: u32 = token[..2]
            .parse()
            .map_err(|_| PeriodError::Unrecognised(token.to_string()))?;
        if !(1..=12).contains(&month) {
            return Err(PeriodError::MonthOutOfRange(token.to_string()));
        }
        let year = expand_year(&token[2..], token)?;
        return Ok((year, month));
    }

    let mut parts = token
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|p| !p.is_empty());
    let (Some(month_part), Some(year_part), None) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(PeriodError::Unrecognised(token.to_string()));
    };
    let month = Month::from_str(month_part)
        .map_err(|_| PeriodError::Unrecognised(token.to_string()))?
        .number_from_month();
    let year = expand_year(year_part, token)?;
    Ok((year, month))
}

/// Resolve a coarse period token to the last day of its month.
pub fn resolve_period(token: &str) -> Result<NaiveDate, PeriodError> {
    let (year, month) = parse_period(token)?;
    last_day_of_month(year, month).ok_or_else(|| PeriodError::MonthOutOfRange(token.to_string()))
}

/// Render `(year, month)` the way the search forms expect it, e.g. `MAR 2017`.
pub fn format_month_year(year: i32, month: u32) -> Option<String> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(first.format("%b %Y").to_string().to_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Categorical mappings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaleType {
    NewSale,
    SubSale,
    Resale,
    Unknown,
}

impl SaleType {
    /// Map the feed's numeric sale code. Unrecognised codes are kept as `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "1" => Self::NewSale,
            "2" => Self::SubSale,
            "3" => Self::Resale,
            _ => Self::Unknown,
        }
    }

    pub fn from_label(label: &str) -> Self {
        let normalized = label
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        match normalized.as_str() {
            "new sale" => Self::NewSale,
            "sub sale" => Self::SubSale,
            "resale" => Self::Resale,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NewSale => "New Sale",
            Self::SubSale => "Sub Sale",
            Self::Resale => "Resale",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for SaleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for SaleType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for SaleType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

// ---------------------------------------------------------------------------
// Area and unit price derivation
// ---------------------------------------------------------------------------

/// Area in both unit systems plus the unit prices derived from them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaPricing {
    pub area_sqm: f64,
    pub area_sqft: f64,
    pub unit_price_psm: f64,
    pub unit_price_psf: f64,
}

pub fn unit_price(price: f64, area: Option<f64>) -> Result<f64, NormalizeError> {
    if !(price.is_finite() && price > 0.0) {
        return Err(NormalizeError::NonPositivePrice(price));
    }
    match area {
        Some(a) if a.is_finite() && a > 0.0 => Ok(price / a),
        other => Err(NormalizeError::NonPositiveArea(other)),
    }
}

impl AreaPricing {
    pub fn from_sqm(
        price: f64,
        area_sqm: Option<f64>,
        sqft_per_sqm: f64,
    ) -> Result<Self, NormalizeError> {
        let unit_price_psm = unit_price(price, area_sqm)?;
        let area_sqm = area_sqm.ok_or(NormalizeError::NonPositiveArea(None))?;
        let area_sqft = area_sqm * sqft_per_sqm;
        Ok(Self {
            area_sqm,
            area_sqft,
            unit_price_psm,
            unit_price_psf: unit_price(price, Some(area_sqft))?,
        })
    }

    pub fn from_sqft(
        price: f64,
        area_sqft: Option<f64>,
        sqft_per_sqm: f64,
    ) -> Result<Self, NormalizeError> {
        let unit_price_psf = unit_price(price, area_sqft)?;
        let area_sqft = area_sqft.ok_or(NormalizeError::NonPositiveArea(None))?;
        let area_sqm = area_sqft / sqft_per_sqm;
        Ok(Self {
            area_sqm,
            area_sqft,
            unit_price_psm: unit_price(price, Some(area_sqm))?,
            unit_price_psf,
        })
    }
}

// ---------------------------------------------------------------------------
// Archive schemas
// ---------------------------------------------------------------------------

/// Fixed column layout and uniqueness rule of one archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSchema {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    /// Columns whose persisted text identifies one real-world row.
    pub business_key: &'static [&'static str],
    /// Column to sort descending by when the archive file is first created.
    pub sort_desc_on_create: Option<&'static str>,
}

impl ArchiveSchema {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }

    pub fn business_key_indices(&self) -> Vec<usize> {
        self.business_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    pub fn header_matches<'a, I>(&self, header: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let header = header.into_iter().map(str::trim).collect::<Vec<_>>();
        header.len() == self.columns.len()
            && header.iter().zip(self.columns).all(|(a, b)| a == b)
    }
}

/// A row type that can live in a CSV archive.
pub trait ArchiveRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const SCHEMA: ArchiveSchema;

    /// Persisted text of every column, in `SCHEMA.columns` order.
    fn to_fields(&self) -> Vec<String>;
}

pub fn format_f64(value: f64) -> String {
    value.to_string()
}

pub fn format_opt_f64(value: Option<f64>) -> String {
    value.map(format_f64).unwrap_or_default()
}

pub fn format_opt_u32(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn format_date(value: NaiveDate) -> String {
    value.format("%Y-%m-%d").to_string()
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// One transaction from the token API feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTransactionRow {
    pub y: Option<f64>,
    pub x: Option<f64>,
    pub street: String,
    pub project: String,
    pub market_segment: String,
    pub area_sqm: f64,
    pub area_sqft: f64,
    pub price: f64,
    pub nett_price: Option<f64>,
    pub unit_price_psm: f64,
    pub unit_price_psf: f64,
    pub floor_range: String,
    pub num_units: u32,
    pub reference_period: NaiveDate,
    pub type_of_sale: SaleType,
    pub property_type: String,
    pub district: u32,
    pub type_of_area: String,
    pub tenure: String,
    pub observation_time: DateTime<Utc>,
}

impl ArchiveRecord for ApiTransactionRow {
    const SCHEMA: ArchiveSchema = ArchiveSchema {
        name: "api-transactions",
        columns: &[
            "y",
            "x",
            "street",
            "project",
            "market_segment",
            "area_sqm",
            "area_sqft",
            "price",
            "nett_price",
            "unit_price_psm",
            "unit_price_psf",
            "floor_range",
            "num_units",
            "reference_period",
            "type_of_sale",
            "property_type",
            "district",
            "type_of_area",
            "tenure",
            "observation_time",
        ],
        business_key: &[
            "street",
            "project",
            "market_segment",
            "area_sqm",
            "price",
            "nett_price",
            "floor_range",
            "num_units",
            "reference_period",
            "type_of_sale",
            "property_type",
            "district",
            "type_of_area",
            "tenure",
        ],
        sort_desc_on_create: None,
    };

    fn to_fields(&self) -> Vec<String> {
        vec![
            format_opt_f64(self.y),
            format_opt_f64(self.x),
            self.street.clone(),
            self.project.clone(),
            self.market_segment.clone(),
            format_f64(self.area_sqm),
            format_f64(self.area_sqft),
            format_f64(self.price),
            format_opt_f64(self.nett_price),
            format_f64(self.unit_price_psm),
            format_f64(self.unit_price_psf),
            self.floor_range.clone(),
            self.num_units.to_string(),
            format_date(self.reference_period),
            self.type_of_sale.label().to_string(),
            self.property_type.clone(),
            self.district.to_string(),
            self.type_of_area.clone(),
            self.tenure.clone(),
            format_timestamp(self.observation_time),
        ]
    }
}

/// One transaction scraped from the transaction search form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTransactionRow {
    pub project_name: String,
    pub street_name: String,
    pub property_type: String,
    pub postal_district: u32,
    pub market_segment: String,
    pub tenure: String,
    pub type_of_sale: SaleType,
    pub num_units: u32,
    pub price: f64,
    pub nett_price: Option<f64>,
    pub area_sqft: f64,
    pub type_of_area: String,
    pub floor: String,
    pub unit_price_psf: f64,
    pub reference_period: NaiveDate,
    pub area_sqm: f64,
    pub unit_price_psm: f64,
}

impl ArchiveRecord for SearchTransactionRow {
    const SCHEMA: ArchiveSchema = ArchiveSchema {
        name: "search-transactions",
        columns: &[
            "project_name",
            "street_name",
            "property_type",
            "postal_district",
            "market_segment",
            "tenure",
            "type_of_sale",
            "num_units",
            "price",
            "nett_price",
            "area_sqft",
            "type_of_area",
            "floor",
            "unit_price_psf",
            "reference_period",
            "area_sqm",
            "unit_price_psm",
        ],
        business_key: &[
            "project_name",
            "street_name",
            "property_type",
            "postal_district",
            "market_segment",
            "tenure",
            "type_of_sale",
            "num_units",
            "price",
            "nett_price",
            "area_sqft",
            "type_of_area",
            "floor",
            "unit_price_psf",
        ],
        sort_desc_on_create: Some("reference_period"),
    };

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.project_name.clone(),
            self.street_name.clone(),
            self.property_type.clone(),
            self.postal_district.to_string(),
            self.market_segment.clone(),
            self.tenure.clone(),
            self.type_of_sale.label().to_string(),
            self.num_units.to_string(),
            format_f64(self.price),
            format_opt_f64(self.nett_price),
            format_f64(self.area_sqft),
            self.type_of_area.clone(),
            self.floor.clone(),
            format_f64(self.unit_price_psf),
            format_date(self.reference_period),
            format_f64(self.area_sqm),
            format_f64(self.unit_price_psm),
        ]
    }
}

/// One project line from the monthly summary page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub project_name: String,
    pub street_name: String,
    pub developer: String,
    pub property_type: String,
    pub locality: String,
    pub total_num_units_in_project: Option<u32>,
    pub cumulative_units_launched_to_date: Option<u32>,
    pub cumulative_units_sold_to_date: Option<u32>,
    pub total_num_unsold_units: Option<u32>,
    pub cumulative_units_launched_unsold: Option<u32>,
    pub units_launched_month: Option<u32>,
    pub units_sold_month: Option<u32>,
    pub median_price_psf: Option<f64>,
    pub lowest_price_psf: Option<f64>,
    pub highest_price_psf: Option<f64>,
    pub reference_period: NaiveDate,
}

const SUMMARY_COLUMNS: &[&str] = &[
    "project_name",
    "street_name",
    "developer",
    "property_type",
    "locality",
    "total_num_units_in_project",
    "cumulative_units_launched_to_date",
    "cumulative_units_sold_to_date",
    "total_num_unsold_units",
    "cumulative_units_launched_unsold",
    "units_launched_month",
    "units_sold_month",
    "median_price_psf",
    "lowest_price_psf",
    "highest_price_psf",
    "reference_period",
];

impl ArchiveRecord for SummaryRow {
    const SCHEMA: ArchiveSchema = ArchiveSchema {
        name: "summary",
        columns: SUMMARY_COLUMNS,
        business_key: SUMMARY_COLUMNS,
        sort_desc_on_create: None,
    };

    fn to_fields(&self) -> Vec<String> {
        vec![
            self.project_name.clone(),
            self.street_name.clone(),
            self.developer.clone(),
            self.property_type.clone(),
            self.locality.clone(),
            format_opt_u32(self.total_num_units_in_project),
            format_opt_u32(self.cumulative_units_launched_to_date),
            format_opt_u32(self.cumulative_units_sold_to_date),
            format_opt_u32(self.total_num_unsold_units),
            format_opt_u32(self.cumulative_units_launched_unsold),
            format_opt_u32(self.units_launched_month),
            format_opt_u32(self.units_sold_month),
            format_opt_f64(self.median_price_psf),
            format_opt_f64(self.lowest_price_psf),
            format_opt_f64(self.highest_price_psf),
            format_date(self.reference_period),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn digit_period_tokens_snap_to_month_end() {
        assert_eq!(resolve_period("0220").unwrap(), ymd(2020, 2, 29));
        assert_eq!(resolve_period("0221").unwrap(), ymd(2021, 2, 28));
        assert_eq!(resolve_period("1219").unwrap(), ymd(2019, 12, 31));
        assert_eq!(resolve_period("0400").unwrap(), ymd(2000, 4, 30));
    }

    #[test]
    fn textual_period_tokens_snap_to_month_end() {
        assert_eq!(resolve_period("Feb-20").unwrap(), ymd(2020, 2, 29));
        assert_eq!(resolve_period("feb-21").unwrap(), ymd(2021, 2, 28));
        assert_eq!(resolve_period("MAR 2017").unwrap(), ymd(2017, 3, 31));
        assert_eq!(resolve_period("Nov-99").unwrap(), ymd(1999, 11, 30));
    }

    #[test]
    fn century_leap_rules_follow_the_calendar() {
        assert_eq!(last_day_of_month(1900, 2), Some(ymd(1900, 2, 28)));
        assert_eq!(last_day_of_month(2000, 2), Some(ymd(2000, 2, 29)));
        assert_eq!(last_day_of_month(2024, 12), Some(ymd(2024, 12, 31)));
        assert_eq!(last_day_of_month(2024, 13), None);
    }

    #[test]
    fn malformed_period_tokens_are_rejected() {
        assert_eq!(resolve_period(""), Err(PeriodError::Empty));
        assert!(matches!(resolve_period("1320"), Err(PeriodError::MonthOutOfRange(_))));
        assert!(matches!(resolve_period("Foo-20"), Err(PeriodError::Unrecognised(_))));
        assert!(matches!(resolve_period("Feb-2"), Err(PeriodError::Unrecognised(_))));
        assert!(matches!(resolve_period("Feb 20 21"), Err(PeriodError::Unrecognised(_))));
    }

    #[test]
    fn month_year_rendering_matches_form_values() {
        assert_eq!(format_month_year(2017, 3).as_deref(), Some("MAR 2017"));
        assert_eq!(parse_period("MAR 2017").unwrap(), (2017, 3));
    }

    #[test]
    fn sale_codes_map_with_unknown_sentinel() {
        assert_eq!(SaleType::from_code("1"), SaleType::NewSale);
        assert_eq!(SaleType::from_code("2"), SaleType::SubSale);
        assert_eq!(SaleType::from_code(" 3 "), SaleType::Resale);
        assert_eq!(SaleType::from_code("9"), SaleType::Unknown);
        assert_eq!(SaleType::from_code(""), SaleType::Unknown);
        assert_eq!(SaleType::from_label("New  Sale"), SaleType::NewSale);
        assert_eq!(SaleType::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn numeric_cells_treat_placeholders_as_missing() {
        assert_eq!(parse_optional_number("price", "1,250,000").unwrap(), Some(1_250_000.0));
        assert_eq!(parse_optional_number("price", " $980.5 ").unwrap(), Some(980.5));
        assert_eq!(parse_optional_number("nett_price", "").unwrap(), None);
        assert_eq!(parse_optional_number("nett_price", "-").unwrap(), None);
        assert_eq!(parse_optional_number("nett_price", "N.A.").unwrap(), None);
        assert!(matches!(
            parse_optional_number("price", "abc"),
            Err(NormalizeError::InvalidNumber { field: "price", .. })
        ));
        assert_eq!(
            parse_required_number("price", ""),
            Err(NormalizeError::MissingField("price"))
        );
        assert_eq!(parse_required_count("num_units", "2").unwrap(), 2);
        assert!(parse_required_count("num_units", "1.5").is_err());
    }

    #[test]
    fn unit_prices_are_derived_per_source_constant() {
        let api = AreaPricing::from_sqm(1_000_000.0, Some(100.0), SQFT_PER_SQM_API).unwrap();
        assert!((api.area_sqft - 1076.391042).abs() < 1e-9);
        assert!((api.unit_price_psm - 10_000.0).abs() < 1e-9);
        assert!((api.unit_price_psf - 1_000_000.0 / api.area_sqft).abs() < 1e-9);

        let search = AreaPricing::from_sqft(1_076_400.0, Some(1076.4), SQFT_PER_SQM_SEARCH).unwrap();
        assert!((search.area_sqm - 100.0).abs() < 1e-9);
        assert!((search.unit_price_psf - 1000.0).abs() < 1e-9);
        assert!((search.unit_price_psm - 1_076_400.0 / search.area_sqm).abs() < 1e-6);
    }

    #[test]
    fn zero_or_missing_area_is_an_invalid_record() {
        assert_eq!(
            AreaPricing::from_sqm(1.0, Some(0.0), SQFT_PER_SQM_API),
            Err(NormalizeError::NonPositiveArea(Some(0.0)))
        );
        assert_eq!(
            AreaPricing::from_sqft(1.0, None, SQFT_PER_SQM_SEARCH),
            Err(NormalizeError::NonPositiveArea(None))
        );
        assert_eq!(unit_price(0.0, Some(10.0)), Err(NormalizeError::NonPositivePrice(0.0)));
    }

    #[test]
    fn schemas_resolve_business_key_positions() {
        let schema = SearchTransactionRow::SCHEMA;
        assert_eq!(schema.business_key_indices().len(), schema.business_key.len());
        assert!(schema.header_matches(schema.columns.iter().copied()));
        assert!(!schema.header_matches(["project_name", "street_name"]));
        let api_key = ApiTransactionRow::SCHEMA.business_key_indices();
        assert_eq!(api_key[..2], [2, 3]);
        assert!(!api_key.contains(&0) && !api_key.contains(&1));
        assert_eq!(SummaryRow::SCHEMA.business_key_indices().len(), 16);
    }
}
