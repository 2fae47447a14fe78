//! Source adapter contracts + the three URA data source adapters.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use proptx_core::{
    format_month_year, last_day_of_month, parse_optional_count, parse_optional_number,
    parse_period, parse_required_count, parse_required_number, resolve_period, ApiTransactionRow,
    ArchiveRecord, AreaPricing, NormalizeError, SaleType, SearchTransactionRow, SummaryRow,
    SQFT_PER_SQM_API, SQFT_PER_SQM_SEARCH,
};
use proptx_storage::{poll_until, FetchError, HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "proptx-adapters";

const SESSION_COOKIE: &str = "JSESSIONID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

/// A raw record that could not be normalized. The rest of its segment is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<RejectedRecord>,
}

impl<T> Default for ParsedBatch<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

impl<T> ParsedBatch<T> {
    fn push(&mut self, index: usize, outcome: Result<T, NormalizeError>) {
        match outcome {
            Ok(row) => self.rows.push(row),
            Err(err) => self.rejected.push(RejectedRecord {
                index,
                reason: err.to_string(),
            }),
        }
    }
}

/// One remote data source: how to open a session, split the work into
/// independently fetchable segments, and turn each segment into rows.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Row: ArchiveRecord;
    type Session: Send + Sync;
    type Segment: fmt::Display + Send + Sync;

    fn source_id(&self) -> &str;

    async fn open_session(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Self::Session, AdapterError>;

    fn plan_segments(&self, session: &Self::Session) -> Vec<Self::Segment>;

    async fn fetch_segment(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        session: &Self::Session,
        segment: &Self::Segment,
    ) -> Result<String, AdapterError>;

    fn parse_segment(
        &self,
        ctx: &AdapterContext,
        segment: &Self::Segment,
        body: &str,
    ) -> Result<ParsedBatch<Self::Row>, AdapterError>;
}

// ---------------------------------------------------------------------------
// Shared HTML helpers
// ---------------------------------------------------------------------------

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Payload(format!("selector {css}: {e}")))
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .map(cell_text)
        .filter(|t| !t.is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq)]
struct HtmlTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// First `<table>` in the document: header cells from the first row holding
/// `th`, data rows from every row holding `td`.
fn first_table(body: &str) -> Result<Option<HtmlTable>, AdapterError> {
    let document = Html::parse_document(body);
    let table_sel = selector("table")?;
    let tr_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let td_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };

    let mut out = HtmlTable::default();
    for tr in table.select(&tr_sel) {
        let tds = tr.select(&td_sel).map(cell_text).collect::<Vec<_>>();
        if !tds.is_empty() {
            out.rows.push(tds);
            continue;
        }
        if out.headers.is_empty() {
            out.headers = tr.select(&th_sel).map(cell_text).collect();
        }
    }
    Ok(Some(out))
}

/// Header text with footnote markers and repeated whitespace removed, so
/// `"Area (Sqft)¹"` and `"No. of  Units"` compare by their words.
fn normalize_header(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '¹' | '²' | '³' | '⁴' | '⁵' | '*'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// GET the search page until the server has issued a session cookie.
async fn open_cookie_session(
    http: &HttpFetcher,
    source_id: &str,
    search_url: &str,
) -> Result<(String, String), AdapterError> {
    let policy = http.backoff();
    poll_until(&policy, move |attempt| async move {
        let page = http.send(source_id, &HttpRequest::get(search_url)).await?;
        let cookie = http.cookie_value(search_url, SESSION_COOKIE);
        if cookie.is_none() {
            debug!(source_id, attempt, "session cookie not issued yet");
        }
        Ok::<_, FetchError>(cookie.map(|id| (id, page.text())))
    })
    .await
    .map_err(|err| match err {
        FetchError::NotReady { attempts } => AdapterError::SourceUnavailable(format!(
            "no {SESSION_COOKIE} cookie from {search_url} after {attempts} attempts"
        )),
        other => AdapterError::Fetch(other),
    })
}

/// POST a search form, retrying while the server still refuses the fresh
/// session. Any delivered page counts as ready; a page without a result table
/// is an empty segment.
async fn post_search_form(
    http: &HttpFetcher,
    source_id: &str,
    request: &HttpRequest,
) -> Result<String, AdapterError> {
    let policy = http.backoff();
    poll_until(&policy, move |_| async move {
        match http.send(source_id, request).await {
            Ok(resp) => Ok(Some(resp.text())),
            Err(FetchError::HttpStatus { status: 401 | 403, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    })
    .await
    .map_err(|err| match err {
        FetchError::NotReady { attempts } => AdapterError::SourceUnavailable(format!(
            "session still refused by {} after {attempts} attempts",
            request.url
        )),
        other => AdapterError::Fetch(other),
    })
}

fn session_url(submit_url: &str, jsessionid: &str) -> String {
    format!("{submit_url};jsessionid={jsessionid}")
}

// ---------------------------------------------------------------------------
// Token API
// ---------------------------------------------------------------------------

fn default_token_url() -> String {
    "https://www.ura.gov.sg/uraDataService/insertNewToken.action".to_string()
}

fn default_data_url() -> String {
    "https://www.ura.gov.sg/uraDataService/invokeUraDS".to_string()
}

fn default_service() -> String {
    "PMI_Resi_Transaction".to_string()
}

fn default_batches() -> Vec<u8> {
    vec![1, 2, 3, 4]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UraApiSettings {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_data_url")]
    pub data_url: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_batches")]
    pub batches: Vec<u8>,
}

impl Default for UraApiSettings {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            data_url: default_data_url(),
            service: default_service(),
            batches: default_batches(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UraApiAdapter {
    source_id: String,
    access_key: String,
    settings: UraApiSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSession {
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Result", default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope {
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Result", default)]
    result: Vec<ApiProject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiProject {
    #[serde(default)]
    street: String,
    #[serde(default)]
    project: String,
    #[serde(default)]
    market_segment: String,
    #[serde(default)]
    x: Option<JsonValue>,
    #[serde(default)]
    y: Option<JsonValue>,
    #[serde(default)]
    transaction: Vec<JsonValue>,
}

fn is_failure_status(status: Option<&str>) -> bool {
    status.is_some_and(|s| !s.eq_ignore_ascii_case("success"))
}

/// Text of a JSON scalar; the feed mixes quoted and bare numbers.
fn json_text(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn api_row(
    project: &ApiProject,
    trans: &JsonValue,
    observed: DateTime<Utc>,
) -> Result<ApiTransactionRow, NormalizeError> {
    let field = |name: &str| json_text(trans.get(name));

    let price = parse_required_number("price", &field("price"))?;
    let area_sqm = parse_required_number("area", &field("area"))?;
    let pricing = AreaPricing::from_sqm(price, Some(area_sqm), SQFT_PER_SQM_API)?;

    Ok(ApiTransactionRow {
        y: parse_optional_number("y", &json_text(project.y.as_ref()))?,
        x: parse_optional_number("x", &json_text(project.x.as_ref()))?,
        street: project.street.trim().to_string(),
        project: project.project.trim().to_string(),
        market_segment: project.market_segment.trim().to_string(),
        area_sqm: pricing.area_sqm,
        area_sqft: pricing.area_sqft,
        price,
        nett_price: parse_optional_number("nettPrice", &field("nettPrice"))?,
        unit_price_psm: pricing.unit_price_psm,
        unit_price_psf: pricing.unit_price_psf,
        floor_range: field("floorRange"),
        num_units: parse_required_count("noOfUnits", &field("noOfUnits"))?,
        reference_period: resolve_period(&field("contractDate"))?,
        type_of_sale: SaleType::from_code(&field("typeOfSale")),
        property_type: field("propertyType"),
        district: parse_required_count("district", &field("district"))?,
        type_of_area: field("typeOfArea"),
        tenure: field("tenure"),
        observation_time: observed,
    })
}

impl UraApiAdapter {
    pub fn new(source_id: impl Into<String>, access_key: impl Into<String>, settings: UraApiSettings) -> Self {
        Self {
            source_id: source_id.into(),
            access_key: access_key.into(),
            settings,
        }
    }

    /// Flatten the project/transaction nesting of one batch response.
    pub fn parse_batch(
        body: &str,
        observed: DateTime<Utc>,
    ) -> Result<ParsedBatch<ApiTransactionRow>, AdapterError> {
        let envelope: DataEnvelope =
            serde_json::from_str(body).map_err(|e| AdapterError::Payload(e.to_string()))?;
        if is_failure_status(envelope.status.as_deref()) {
            return Err(AdapterError::SourceUnavailable(format!(
                "data service answered {:?}: {}",
                envelope.status.unwrap_or_default(),
                envelope.message.unwrap_or_default()
            )));
        }

        let mut batch = ParsedBatch::default();
        let mut index = 0usize;
        for project in &envelope.result {
            for trans in &project.transaction {
                batch.push(index, api_row(project, trans, observed));
                index += 1;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl SourceAdapter for UraApiAdapter {
    type Row = ApiTransactionRow;
    type Session = ApiSession;
    type Segment = u8;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn open_session(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<ApiSession, AdapterError> {
        let request = HttpRequest::get(&self.settings.token_url).header("AccessKey", &self.access_key);
        let resp = http.send(&self.source_id, &request).await?;
        let envelope: TokenEnvelope = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Payload(format!("token response: {e}")))?;

        match envelope.result.filter(|t| !t.trim().is_empty()) {
            Some(token) if !is_failure_status(envelope.status.as_deref()) => {
                info!(source_id = %self.source_id, "obtained api token");
                Ok(ApiSession { token })
            }
            _ => Err(AdapterError::SourceUnavailable(format!(
                "token endpoint refused: {}",
                envelope.message.unwrap_or_default()
            ))),
        }
    }

    fn plan_segments(&self, _session: &ApiSession) -> Vec<u8> {
        self.settings.batches.clone()
    }

    async fn fetch_segment(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
        session: &ApiSession,
        batch: &u8,
    ) -> Result<String, AdapterError> {
        let request = HttpRequest::get(&self.settings.data_url)
            .header("AccessKey", &self.access_key)
            .header("Token", &session.token)
            .query("service", &self.settings.service)
            .query("batch", batch.to_string());
        Ok(http.send(&self.source_id, &request).await?.text())
    }

    fn parse_segment(
        &self,
        ctx: &AdapterContext,
        _batch: &u8,
        body: &str,
    ) -> Result<ParsedBatch<ApiTransactionRow>, AdapterError> {
        Self::parse_batch(body, ctx.fetched_at)
    }
}

// ---------------------------------------------------------------------------
// Transaction search form
// ---------------------------------------------------------------------------

fn default_tx_search_url() -> String {
    "https://www.ura.gov.sg/realEstateIIWeb/transaction/search.action".to_string()
}

fn default_tx_submit_url() -> String {
    "https://www.ura.gov.sg/realEstateIIWeb/transaction/submitSearch.action".to_string()
}

/// Landed, strata landed, apartments and condos, executive condos.
fn default_property_types() -> Vec<String> {
    ["lp", "sl", "ac", "ec"].map(String::from).to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSearchSettings {
    #[serde(default = "default_tx_search_url")]
    pub search_url: String,
    #[serde(default = "default_tx_submit_url")]
    pub submit_url: String,
    #[serde(default = "default_property_types")]
    pub property_types: Vec<String>,
}

impl Default for TransactionSearchSettings {
    fn default() -> Self {
        Self {
            search_url: default_tx_search_url(),
            submit_url: default_tx_submit_url(),
            property_types: default_property_types(),
        }
    }
}

/// Districts and the widest period window offered by the search page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDiscovery {
    pub districts: Vec<String>,
    pub from_period: String,
    pub to_period: String,
}

#[derive(Debug, Clone)]
pub struct TransactionSearchSession {
    pub post_url: String,
    pub discovery: SearchDiscovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSegment {
    pub property_type: String,
    pub district: String,
}

impl fmt::Display for TransactionSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.property_type, self.district)
    }
}

const FROM_PERIOD_SELECT: &str = "#searchForm_selectedFromPeriodPostalDistrict option";
const TO_PERIOD_SELECT: &str = "#searchForm_selectedToPeriodPostalDistrict option";

/// Column of each result-table header, keyed by its normalized text.
const SEARCH_HEADERS: [(&str, &str); 15] = [
    ("project name", "project_name"),
    ("street name", "street_name"),
    ("type", "property_type"),
    ("postal district", "postal_district"),
    ("market segment", "market_segment"),
    ("tenure", "tenure"),
    ("type of sale", "type_of_sale"),
    ("no. of units", "num_units"),
    ("price ($)", "price"),
    ("nett price ($)", "nett_price"),
    ("area (sqft)", "area_sqft"),
    ("type of area", "type_of_area"),
    ("floor level", "floor"),
    ("unit price ($psf)", "unit_price_psf"),
    ("date of sale", "reference_period"),
];

fn period_bound(
    options: &[String],
    pick: fn((i32, u32), (i32, u32)) -> (i32, u32),
) -> Result<String, AdapterError> {
    let mut bound: Option<(i32, u32)> = None;
    for option in options {
        let ym = parse_period(option)
            .map_err(|e| AdapterError::Payload(format!("period option {option:?}: {e}")))?;
        bound = Some(bound.map_or(ym, |b| pick(b, ym)));
    }
    let (year, month) =
        bound.ok_or_else(|| AdapterError::Payload("search page lists no periods".to_string()))?;
    format_month_year(year, month)
        .ok_or_else(|| AdapterError::Payload(format!("invalid period {year}-{month}")))
}

struct SearchColumns {
    idx: [usize; 15],
}

impl SearchColumns {
    fn resolve(headers: &[String]) -> Result<Self, AdapterError> {
        let normalized = headers.iter().map(|h| normalize_header(h)).collect::<Vec<_>>();
        let mut idx = [0usize; 15];
        for (slot, (label, column)) in SEARCH_HEADERS.iter().enumerate() {
            idx[slot] = normalized
                .iter()
                .position(|h| h == label)
                .ok_or_else(|| AdapterError::Payload(format!("result table lacks {column} column")))?;
        }
        Ok(Self { idx })
    }

    fn get<'a>(&self, row: &'a [String], slot: usize) -> &'a str {
        row.get(self.idx[slot]).map(String::as_str).unwrap_or("")
    }
}

fn search_row(cols: &SearchColumns, raw: &[String]) -> Result<SearchTransactionRow, NormalizeError> {
    let text = |slot: usize| cols.get(raw, slot).to_string();

    let price = parse_required_number("price", &text(8))?;
    let area_sqft = parse_optional_number("area_sqft", &text(10))?;
    let pricing = AreaPricing::from_sqft(price, area_sqft, SQFT_PER_SQM_SEARCH)?;

    Ok(SearchTransactionRow {
        project_name: text(0),
        street_name: text(1),
        property_type: text(2),
        postal_district: parse_required_count("postal_district", &text(3))?,
        market_segment: text(4),
        tenure: text(5),
        type_of_sale: SaleType::from_label(&text(6)),
        num_units: parse_required_count("num_units", &text(7))?,
        price,
        nett_price: parse_optional_number("nett_price", &text(9))?,
        area_sqft: pricing.area_sqft,
        type_of_area: text(11),
        floor: text(12),
        unit_price_psf: pricing.unit_price_psf,
        reference_period: resolve_period(&text(14))?,
        area_sqm: pricing.area_sqm,
        unit_price_psm: pricing.unit_price_psm,
    })
}

#[derive(Debug, Clone)]
pub struct TransactionSearchAdapter {
    source_id: String,
    settings: TransactionSearchSettings,
}

impl TransactionSearchAdapter {
    pub fn new(source_id: impl Into<String>, settings: TransactionSearchSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }

    pub fn discover(search_page: &str) -> Result<SearchDiscovery, AdapterError> {
        let document = Html::parse_document(search_page);
        let districts = select_all_texts(&document, "#select1 option")?;
        if districts.is_empty() {
            return Err(AdapterError::Payload("search page lists no postal districts".to_string()));
        }
        let from_options = select_all_texts(&document, FROM_PERIOD_SELECT)?;
        let to_options = select_all_texts(&document, TO_PERIOD_SELECT)?;

        Ok(SearchDiscovery {
            districts,
            from_period: period_bound(&from_options, std::cmp::min)?,
            to_period: period_bound(&to_options, std::cmp::max)?,
        })
    }

    pub fn form_fields(discovery: &SearchDiscovery, segment: &TransactionSegment) -> Vec<(String, String)> {
        [
            ("submissionType", "pd"),
            ("selectedFromPeriodProjectName", discovery.from_period.as_str()),
            ("selectedToPeriodProjectName", discovery.to_period.as_str()),
            ("__multiselect_selectedProjects1", ""),
            ("selectedFromPeriodPostalDistrict", discovery.from_period.as_str()),
            ("selectedToPeriodPostalDistrict", discovery.to_period.as_str()),
            ("propertyType", segment.property_type.as_str()),
            ("postalDistrictList", "28"),
            ("selectedPostalDistricts1", segment.district.as_str()),
            ("__multiselect_selectedPostalDistricts1", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn parse_results(body: &str) -> Result<ParsedBatch<SearchTransactionRow>, AdapterError> {
        let Some(table) = first_table(body)? else {
            debug!("no result table; no transactions for this segment");
            return Ok(ParsedBatch::default());
        };
        let cols = SearchColumns::resolve(&table.headers)?;

        let mut batch = ParsedBatch::default();
        for (index, raw) in table.rows.iter().enumerate() {
            batch.push(index, search_row(&cols, raw));
        }
        Ok(batch)
    }
}

#[async_trait]
impl SourceAdapter for TransactionSearchAdapter {
    type Row = SearchTransactionRow;
    type Session = TransactionSearchSession;
    type Segment = TransactionSegment;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn open_session(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<TransactionSearchSession, AdapterError> {
        let (jsessionid, page) =
            open_cookie_session(http, &self.source_id, &self.settings.search_url).await?;
        let discovery = Self::discover(&page)?;
        info!(
            source_id = %self.source_id,
            districts = discovery.districts.len(),
            from = %discovery.from_period,
            to = %discovery.to_period,
            "discovered search window"
        );
        Ok(TransactionSearchSession {
            post_url: session_url(&self.settings.submit_url, &jsessionid),
            discovery,
        })
    }

    fn plan_segments(&self, session: &TransactionSearchSession) -> Vec<TransactionSegment> {
        self.settings
            .property_types
            .iter()
            .flat_map(|property_type| {
                session.discovery.districts.iter().map(move |district| TransactionSegment {
                    property_type: property_type.clone(),
                    district: district.clone(),
                })
            })
            .collect()
    }

    async fn fetch_segment(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
        session: &TransactionSearchSession,
        segment: &TransactionSegment,
    ) -> Result<String, AdapterError> {
        let request = HttpRequest::post_form(
            &session.post_url,
            Self::form_fields(&session.discovery, segment),
        );
        post_search_form(http, &self.source_id, &request).await
    }

    fn parse_segment(
        &self,
        _ctx: &AdapterContext,
        _segment: &TransactionSegment,
        body: &str,
    ) -> Result<ParsedBatch<SearchTransactionRow>, AdapterError> {
        Self::parse_results(body)
    }
}

// ---------------------------------------------------------------------------
// Monthly summary form
// ---------------------------------------------------------------------------

fn default_summary_search_url() -> String {
    "https://www.ura.gov.sg/realEstateIIWeb/price/search.action".to_string()
}

fn default_summary_submit_url() -> String {
    "https://www.ura.gov.sg/realEstateIIWeb/price/submitSearch.action".to_string()
}

fn default_start_month() -> String {
    "2007-06".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySearchSettings {
    #[serde(default = "default_summary_search_url")]
    pub search_url: String,
    #[serde(default = "default_summary_submit_url")]
    pub submit_url: String,
    /// First month queried, as `YYYY-MM`.
    #[serde(default = "default_start_month")]
    pub start_month: String,
}

impl Default for SummarySearchSettings {
    fn default() -> Self {
        Self {
            search_url: default_summary_search_url(),
            submit_url: default_summary_submit_url(),
            start_month: default_start_month(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SummaryMonth {
    pub year: i32,
    pub month: u32,
}

impl fmt::Display for SummaryMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone)]
pub struct SummarySession {
    pub post_url: String,
    pub start: NaiveDate,
    pub cutoff: NaiveDate,
}

/// Figures for a month are published mid-way through the following month, so
/// the window ends one month back after the 20th and two months back before.
pub fn publication_cutoff(today: NaiveDate) -> NaiveDate {
    let back = if today.day() > 20 { 1 } else { 2 };
    today.checked_sub_months(Months::new(back)).unwrap_or(today)
}

/// Every month whose first day falls before `cutoff`, starting at `start`.
pub fn months_until(start: NaiveDate, cutoff: NaiveDate) -> Vec<SummaryMonth> {
    let mut out = Vec::new();
    let mut cursor = start.with_day(1).unwrap_or(start);
    while cursor < cutoff {
        out.push(SummaryMonth {
            year: cursor.year(),
            month: cursor.month(),
        });
        match cursor.checked_add_months(Months::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    out
}

fn parse_start_month(text: &str) -> Result<NaiveDate, AdapterError> {
    NaiveDate::parse_from_str(&format!("{}-01", text.trim()), "%Y-%m-%d")
        .map_err(|e| AdapterError::Payload(format!("start_month {text:?}: {e}")))
}

/// Median cells read like `"Median: 1,234"`; only the figure is kept.
fn median_figure(cell: &str) -> &str {
    cell.rsplit(':').next().unwrap_or(cell).trim()
}

const SUMMARY_CELLS: usize = 15;
const SUMMARY_FOOTER_ROWS: usize = 2;

fn summary_row(raw: &[String], reference_period: NaiveDate) -> Result<SummaryRow, NormalizeError> {
    if raw.len() < SUMMARY_CELLS {
        return Err(NormalizeError::MissingField("summary cell"));
    }
    let count = |field: &'static str, i: usize| parse_optional_count(field, &raw[i]);
    let number = |field: &'static str, text: &str| parse_optional_number(field, text);

    Ok(SummaryRow {
        project_name: raw[0].clone(),
        street_name: raw[1].clone(),
        developer: raw[2].clone(),
        property_type: raw[3].clone(),
        locality: raw[4].clone(),
        total_num_units_in_project: count("total_num_units_in_project", 5)?,
        cumulative_units_launched_to_date: count("cumulative_units_launched_to_date", 6)?,
        cumulative_units_sold_to_date: count("cumulative_units_sold_to_date", 7)?,
        total_num_unsold_units: count("total_num_unsold_units", 8)?,
        cumulative_units_launched_unsold: count("cumulative_units_launched_unsold", 9)?,
        units_launched_month: count("units_launched_month", 10)?,
        units_sold_month: count("units_sold_month", 11)?,
        median_price_psf: number("median_price_psf", median_figure(&raw[12]))?,
        lowest_price_psf: number("lowest_price_psf", &raw[13])?,
        highest_price_psf: number("highest_price_psf", &raw[14])?,
        reference_period,
    })
}

#[derive(Debug, Clone)]
pub struct SummarySearchAdapter {
    source_id: String,
    settings: SummarySearchSettings,
}

impl SummarySearchAdapter {
    pub fn new(source_id: impl Into<String>, settings: SummarySearchSettings) -> Self {
        Self {
            source_id: source_id.into(),
            settings,
        }
    }

    pub fn form_fields(month: &SummaryMonth) -> Vec<(String, String)> {
        vec![
            ("yearSelect".to_string(), month.year.to_string()),
            ("monthSelect".to_string(), month.month.to_string()),
        ]
    }

    pub fn parse_month(body: &str, month: &SummaryMonth) -> Result<ParsedBatch<SummaryRow>, AdapterError> {
        let reference_period = last_day_of_month(month.year, month.month)
            .ok_or_else(|| AdapterError::Payload(format!("invalid month {month}")))?;
        let Some(table) = first_table(body)? else {
            debug!(%month, "no result table; no figures for this month");
            return Ok(ParsedBatch::default());
        };

        let keep = table.rows.len().saturating_sub(SUMMARY_FOOTER_ROWS);
        let mut batch = ParsedBatch::default();
        for (index, raw) in table.rows.iter().take(keep).enumerate() {
            batch.push(index, summary_row(raw, reference_period));
        }
        Ok(batch)
    }
}

#[async_trait]
impl SourceAdapter for SummarySearchAdapter {
    type Row = SummaryRow;
    type Session = SummarySession;
    type Segment = SummaryMonth;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn open_session(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SummarySession, AdapterError> {
        let start = parse_start_month(&self.settings.start_month)?;
        let cutoff = publication_cutoff(ctx.fetched_at.date_naive());
        let (jsessionid, _) =
            open_cookie_session(http, &self.source_id, &self.settings.search_url).await?;
        info!(source_id = %self.source_id, %start, %cutoff, "scraping summary months");
        Ok(SummarySession {
            post_url: session_url(&self.settings.submit_url, &jsessionid),
            start,
            cutoff,
        })
    }

    fn plan_segments(&self, session: &SummarySession) -> Vec<SummaryMonth> {
        months_until(session.start, session.cutoff)
    }

    async fn fetch_segment(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
        session: &SummarySession,
        month: &SummaryMonth,
    ) -> Result<String, AdapterError> {
        let request = HttpRequest::post_form(&session.post_url, Self::form_fields(month));
        post_search_form(http, &self.source_id, &request).await
    }

    fn parse_segment(
        &self,
        _ctx: &AdapterContext,
        month: &SummaryMonth,
        body: &str,
    ) -> Result<ParsedBatch<SummaryRow>, AdapterError> {
        Self::parse_month(body, month)
    }
}
