//! CSV archive persistence + HTTP fetch utilities for proptx.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use proptx_core::{ArchiveRecord, SOURCE_NA_REPLACEMENT, SOURCE_NA_TEXT};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "proptx-storage";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("corrupt archive {}: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },
    #[error("archive i/o failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MergeOutcome {
    pub existing_rows: usize,
    pub incoming_rows: usize,
    pub duplicates_dropped: usize,
    pub written_rows: usize,
    pub created: bool,
}

/// Archive row tagged with its zero-based position; serializes as one flat object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedRow<T> {
    pub id: usize,
    #[serde(flatten)]
    pub row: T,
}

/// Directory holding every archive file, one per source.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn merge<T: ArchiveRecord>(
        &self,
        relative: impl AsRef<Path>,
        new_rows: &[T],
    ) -> Result<MergeOutcome, ArchiveError> {
        merge_into_archive(self.archive_path(relative), new_rows)
    }
}

fn open_archive(path: &Path) -> Result<Option<csv::Reader<BufReader<File>>>, ArchiveError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(ArchiveError::corrupt(path, format!("unreadable: {err}"))),
    };
    Ok(Some(
        csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(BufReader::new(file)),
    ))
}

fn validate_header<T: ArchiveRecord>(
    path: &Path,
    reader: &mut csv::Reader<BufReader<File>>,
) -> Result<csv::StringRecord, ArchiveError> {
    let header = reader
        .headers()
        .map_err(|err| ArchiveError::corrupt(path, format!("unreadable header: {err}")))?
        .clone();
    if !T::SCHEMA.header_matches(header.iter()) {
        return Err(ArchiveError::corrupt(
            path,
            format!(
                "header [{}] does not match {} schema [{}]",
                header.iter().collect::<Vec<_>>().join(","),
                T::SCHEMA.name,
                T::SCHEMA.columns.join(",")
            ),
        ));
    }
    Ok(header)
}

/// Load every row of an archive. A missing file is an empty archive.
pub fn load_archive<T: ArchiveRecord>(path: impl AsRef<Path>) -> Result<Vec<T>, ArchiveError> {
    let path = path.as_ref();
    let Some(mut reader) = open_archive(path)? else {
        return Ok(Vec::new());
    };
    validate_header::<T>(path, &mut reader)?;
    let mut rows = Vec::new();
    for (idx, record) in reader.deserialize::<T>().enumerate() {
        let row = record.map_err(|err| ArchiveError::corrupt(path, format!("row #{}: {err}", idx + 1)))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Read up to `limit` rows after skipping `offset`, tagging each with its
/// position in the file. Ids are only stable until the next rewrite.
pub fn read_archive_page<T: ArchiveRecord>(
    path: impl AsRef<Path>,
    offset: usize,
    limit: usize,
) -> Result<Vec<IndexedRow<T>>, ArchiveError> {
    let path = path.as_ref();
    let Some(mut reader) = open_archive(path)? else {
        return Ok(Vec::new());
    };
    let header = validate_header::<T>(path, &mut reader)?;
    let mut page = Vec::with_capacity(limit.min(1024));
    for (id, record) in reader.records().enumerate().skip(offset).take(limit) {
        let record =
            record.map_err(|err| ArchiveError::corrupt(path, format!("row #{}: {err}", id + 1)))?;
        let row = record
            .deserialize::<T>(Some(&header))
            .map_err(|err| ArchiveError::corrupt(path, format!("row #{}: {err}", id + 1)))?;
        page.push(IndexedRow { id, row });
    }
    Ok(page)
}

fn scrub_source_na(fields: &mut [String]) {
    for field in fields.iter_mut() {
        if field == SOURCE_NA_TEXT {
            *field = SOURCE_NA_REPLACEMENT.to_string();
        }
    }
}

/// Fold `new_rows` into the archive at `path`.
///
/// Existing rows come first and win over incoming rows with the same business
/// key. The file is replaced through a temp-file rename, so a failed run
/// leaves the previous archive untouched.
pub fn merge_into_archive<T: ArchiveRecord>(
    path: impl AsRef<Path>,
    new_rows: &[T],
) -> Result<MergeOutcome, ArchiveError> {
    let path = path.as_ref();
    let schema = T::SCHEMA;
    let span = info_span!("archive_merge", schema = schema.name, path = %path.display());
    let _guard = span.enter();

    let existing = match open_archive(path)? {
        Some(mut reader) => {
            validate_header::<T>(path, &mut reader)?;
            let mut rows = Vec::new();
            for (idx, record) in reader.deserialize::<T>().enumerate() {
                let row = record
                    .map_err(|err| ArchiveError::corrupt(path, format!("row #{}: {err}", idx + 1)))?;
                rows.push(row.to_fields());
            }
            info!(rows = rows.len(), "found existing archive; combining and dropping duplicates");
            Some(rows)
        }
        None => {
            info!("no existing archive; dropping duplicates from fetched rows");
            None
        }
    };

    let created = existing.is_none();
    let existing = existing.unwrap_or_default();
    let mut outcome = MergeOutcome {
        existing_rows: existing.len(),
        incoming_rows: new_rows.len(),
        created,
        ..MergeOutcome::default()
    };

    let key_indices = schema.business_key_indices();
    let mut seen = HashSet::with_capacity(existing.len() + new_rows.len());
    let mut merged = Vec::with_capacity(existing.len() + new_rows.len());
    for mut fields in existing
        .into_iter()
        .chain(new_rows.iter().map(ArchiveRecord::to_fields))
    {
        scrub_source_na(&mut fields);
        let key = key_indices
            .iter()
            .map(|&i| fields[i].clone())
            .collect::<Vec<_>>();
        if seen.insert(key) {
            merged.push(fields);
        } else {
            outcome.duplicates_dropped += 1;
        }
    }

    if created {
        if let Some(idx) = schema.sort_desc_on_create.and_then(|c| schema.column_index(c)) {
            merged.sort_by(|a, b| b[idx].cmp(&a[idx]));
        }
    }

    write_archive_atomically(path, schema.columns, &merged)?;
    outcome.written_rows = merged.len();
    info!(
        rows = outcome.written_rows,
        dropped = outcome.duplicates_dropped,
        "saved archive"
    );
    Ok(outcome)
}

fn write_archive_atomically(
    path: &Path,
    columns: &[&str],
    rows: &[Vec<String>],
) -> Result<(), ArchiveError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ArchiveError::io(parent, err))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("archive.csv");
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = write_rows(&temp_path, columns, rows)
        .and_then(|()| fs::rename(&temp_path, path).map_err(|err| ArchiveError::io(path, err)));
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_rows(temp_path: &Path, columns: &[&str], rows: &[Vec<String>]) -> Result<(), ArchiveError> {
    let io_err = |err: io::Error| ArchiveError::io(temp_path, err);
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .map_err(io_err)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    writer
        .write_record(columns)
        .map_err(|err| io_err(err.into()))?;
    for row in rows {
        writer.write_record(row).map_err(|err| io_err(err.into()))?;
    }
    let buffered = writer.into_inner().map_err(|err| io_err(err.into_error()))?;
    let file = buffered.into_inner().map_err(|err| io_err(err.into_error()))?;
    file.sync_all().map_err(io_err)
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_secs(1),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Spaces out requests to the remote service.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// One outbound request. Rebuilt on every retry attempt.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub form: Option<Vec<(String, String)>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            form: None,
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            form: Some(form),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("remote not ready after {attempts} attempts")]
    NotReady { attempts: usize },
}

/// Cookie-keeping HTTP client with retry, backoff and polite pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cookies: Arc<Jar>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let cookies = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_provider(cookies.clone())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            cookies,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Value of a session cookie the remote has set for `url`.
    pub fn cookie_value(&self, url: &str, name: &str) -> Option<String> {
        let url = reqwest::Url::parse(url).ok()?;
        let header = self.cookies.cookies(&url)?;
        let text = header.to_str().ok()?;
        text.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        }
        builder
    }

    pub async fn send(
        &self,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, method = %request.method, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }

    async fn send_with_retries(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::NotReady {
                attempts: self.backoff.max_retries + 1,
            }),
        }
    }
}

/// Repeat `probe` until it yields a value, backing off between attempts.
///
/// `Ok(None)` from the probe means "not ready yet"; errors end polling.
pub async fn poll_until<T, F, Fut>(policy: &BackoffPolicy, mut probe: F) -> Result<T, FetchError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Option<T>, FetchError>>,
{
    for attempt in 0..=policy.max_retries {
        if let Some(value) = probe(attempt).await? {
            return Ok(value);
        }
        if attempt < policy.max_retries {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        }
    }
    Err(FetchError::NotReady {
        attempts: policy.max_retries + 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptx_core::{SaleType, SearchTransactionRow};
    use tempfile::tempdir;

    fn row(project: &str, price: f64, month: u32) -> SearchTransactionRow {
        let area_sqft = 1000.0;
        let area_sqm = area_sqft / proptx_core::SQFT_PER_SQM_SEARCH;
        SearchTransactionRow {
            project_name: project.to_string(),
            street_name: "ORCHARD ROAD".to_string(),
            property_type: "Condominium".to_string(),
            postal_district: 9,
            market_segment: "CCR".to_string(),
            tenure: "Freehold".to_string(),
            type_of_sale: SaleType::Resale,
            num_units: 1,
            price,
            nett_price: None,
            area_sqft,
            type_of_area: "Strata".to_string(),
            floor: "06 to 10".to_string(),
            unit_price_psf: price / area_sqft,
            reference_period: proptx_core::last_day_of_month(2020, month).unwrap(),
            area_sqm,
            unit_price_psm: price / area_sqm,
        }
    }

    fn numbered_rows(n: usize) -> Vec<SearchTransactionRow> {
        (0..n)
            .map(|i| row(&format!("PROJECT {i}"), 1_000_000.0 + i as f64, 1))
            .collect()
    }

    #[test]
    fn merging_same_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("total_transactions.csv");
        let batch = numbered_rows(5);

        merge_into_archive(&path, &batch).expect("first merge");
        let once = fs::read(&path).expect("read once");
        let outcome = merge_into_archive(&path, &batch).expect("second merge");
        let twice = fs::read(&path).expect("read twice");

        assert_eq!(once, twice);
        assert_eq!(outcome.existing_rows, 5);
        assert_eq!(outcome.duplicates_dropped, 5);
        assert_eq!(outcome.written_rows, 5);
        assert!(!outcome.created);
    }

    #[test]
    fn disjoint_batches_union_completely() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let all = numbered_rows(7);

        merge_into_archive(&path, &all[..3]).expect("existing");
        let outcome = merge_into_archive(&path, &all[3..]).expect("incoming");

        assert_eq!(outcome.written_rows, 7);
        assert_eq!(load_archive::<SearchTransactionRow>(&path).unwrap().len(), 7);
    }

    #[test]
    fn existing_row_wins_on_key_collision() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let original = row("THE SAIL", 1_500_000.0, 3);
        merge_into_archive(&path, &[original.clone()]).unwrap();

        // reference_period is outside this schema's business key.
        let mut refetched = original.clone();
        refetched.reference_period = NaiveDate::from_ymd_opt(2020, 4, 30).unwrap();
        let outcome = merge_into_archive(&path, &[refetched]).unwrap();

        let stored = load_archive::<SearchTransactionRow>(&path).unwrap();
        assert_eq!(outcome.duplicates_dropped, 1);
        assert_eq!(stored, vec![original]);
    }

    #[test]
    fn duplicates_within_a_fresh_batch_collapse_to_first() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let first = row("A", 1_000_000.0, 1);
        let mut second = first.clone();
        second.reference_period = NaiveDate::from_ymd_opt(2020, 6, 30).unwrap();

        let outcome = merge_into_archive(&path, &[first.clone(), second]).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.written_rows, 1);
        assert_eq!(load_archive::<SearchTransactionRow>(&path).unwrap(), vec![first]);
    }

    #[test]
    fn fresh_archive_is_sorted_by_reference_period_descending() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let rows = vec![row("A", 1.0e6, 1), row("B", 2.0e6, 5), row("C", 3.0e6, 3)];

        merge_into_archive(&path, &rows).unwrap();
        let stored = load_archive::<SearchTransactionRow>(&path).unwrap();
        let names = stored.iter().map(|r| r.project_name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["B", "C", "A"]);

        // Later merges append without re-sorting.
        merge_into_archive(&path, &[row("D", 4.0e6, 12)]).unwrap();
        let stored = load_archive::<SearchTransactionRow>(&path).unwrap();
        assert_eq!(stored.last().unwrap().project_name, "D");
    }

    #[test]
    fn na_text_is_rewritten_before_persisting() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let mut with_na = row("A", 1.0e6, 1);
        with_na.type_of_area = "NA".to_string();
        with_na.floor = "NA".to_string();

        merge_into_archive(&path, &[with_na.clone()]).unwrap();
        let stored = load_archive::<SearchTransactionRow>(&path).unwrap();
        assert_eq!(stored[0].type_of_area, "-");
        assert_eq!(stored[0].floor, "-");

        // The same raw row fetched again still collapses onto the stored one.
        let outcome = merge_into_archive(&path, &[with_na]).unwrap();
        assert_eq!(outcome.written_rows, 1);
    }

    #[test]
    fn header_and_missing_values_are_written_as_plain_csv() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        merge_into_archive(&path, &[row("A", 1_200_000.0, 2)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            SearchTransactionRow::SCHEMA.columns.join(",")
        );
        let data = lines.next().unwrap();
        assert!(data.contains(",1200000,,1000,"), "{data}");
        assert!(data.contains(",2020-02-29,"), "{data}");
    }

    #[test]
    fn mismatched_header_is_rejected_and_file_left_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        let legacy = b"project_name,street_name,type\nA,B,Condo\n";
        fs::write(&path, legacy).unwrap();

        let err = merge_into_archive(&path, &numbered_rows(2)).unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArchive { .. }));
        assert_eq!(fs::read(&path).unwrap(), legacy);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn undecodable_row_is_corrupt() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        merge_into_archive(&path, &numbered_rows(1)).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("A,B,C,not-a-number,,,,,,,,,,,,,\n");
        fs::write(&path, &text).unwrap();

        let err = merge_into_archive(&path, &numbered_rows(1)).unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArchive { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), text);
    }

    fn temp_files_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn failed_write_is_io_and_keeps_previous_archive() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        merge_into_archive(&path, &numbered_rows(3)).unwrap();
        let before = fs::read(&path).unwrap();

        // Ragged rows make the csv writer fail after the temp file exists.
        let ragged = vec![
            numbered_rows(1)[0].to_fields(),
            vec!["too short".to_string()],
        ];
        let err = write_archive_atomically(&path, SearchTransactionRow::SCHEMA.columns, &ragged)
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Io { .. }), "{err}");
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(temp_files_in(dir.path()).is_empty());
    }

    #[test]
    fn failed_rename_is_io_and_removes_temp_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("archive.csv");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();

        let rows = numbered_rows(2)
            .iter()
            .map(ArchiveRecord::to_fields)
            .collect::<Vec<_>>();
        let err = write_archive_atomically(&path, SearchTransactionRow::SCHEMA.columns, &rows)
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Io { .. }), "{err}");
        assert!(path.join("keep").is_file());
        assert!(temp_files_in(dir.path()).is_empty());
    }

    #[test]
    fn api_rows_differing_only_in_coordinates_collapse() {
        use proptx_core::ApiTransactionRow;

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("total_transactions.csv");
        let without_coords = ApiTransactionRow {
            y: None,
            x: None,
            street: "JALAN KAYU".to_string(),
            project: "THE GARDENS".to_string(),
            market_segment: "OCR".to_string(),
            area_sqm: 100.0,
            area_sqft: 100.0 * proptx_core::SQFT_PER_SQM_API,
            price: 1_000_000.0,
            nett_price: None,
            unit_price_psm: 10_000.0,
            unit_price_psf: 1_000_000.0 / (100.0 * proptx_core::SQFT_PER_SQM_API),
            floor_range: "01-05".to_string(),
            num_units: 1,
            reference_period: proptx_core::last_day_of_month(2020, 2).unwrap(),
            type_of_sale: SaleType::NewSale,
            property_type: "Condominium".to_string(),
            district: 28,
            type_of_area: "Strata".to_string(),
            tenure: "99 yrs lease commencing from 2015".to_string(),
            observation_time: chrono::Utc::now(),
        };
        let mut with_coords = without_coords.clone();
        with_coords.y = Some(29000.1);
        with_coords.x = Some(31000.5);

        merge_into_archive(&path, &[without_coords.clone()]).unwrap();
        let outcome = merge_into_archive(&path, &[with_coords]).unwrap();

        assert_eq!(outcome.duplicates_dropped, 1);
        assert_eq!(outcome.written_rows, 1);
        let stored = load_archive::<ApiTransactionRow>(&path).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].y, None);
    }

    #[test]
    fn pages_are_sliced_by_offset_and_limit() {
        let dir = tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        store.merge("archive.csv", &numbered_rows(250)).unwrap();
        let path = store.archive_path("archive.csv");

        let first = read_archive_page::<SearchTransactionRow>(&path, 0, 100).unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first.first().unwrap().id, 0);
        assert_eq!(first.last().unwrap().id, 99);

        let tail = read_archive_page::<SearchTransactionRow>(&path, 200, 100).unwrap();
        assert_eq!(tail.len(), 50);
        assert_eq!(tail.first().unwrap().id, 200);
        assert_eq!(tail.last().unwrap().id, 249);

        assert!(read_archive_page::<SearchTransactionRow>(&path, 300, 100)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn missing_archive_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("absent.csv");
        assert!(load_archive::<SearchTransactionRow>(&path).unwrap().is_empty());
        assert!(read_archive_page::<SearchTransactionRow>(&path, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn polling_stops_once_probe_is_ready() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let mut calls = 0usize;
        let value = poll_until(&policy, |attempt| {
            calls += 1;
            async move { Ok::<_, FetchError>((attempt == 2).then_some("ready")) }
        })
        .await
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn polling_gives_up_after_budget() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let err = poll_until(&policy, |_| async { Ok::<Option<()>, FetchError>(None) })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotReady { attempts: 3 }));
    }

    #[test]
    fn status_classification_retries_only_transient_failures() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }
}
