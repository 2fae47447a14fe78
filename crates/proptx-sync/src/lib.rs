//! Sync pipeline orchestration: fetch each source, normalize, merge into its archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use proptx_adapters::{
    AdapterContext, SourceAdapter, SummarySearchAdapter, SummarySearchSettings,
    TransactionSearchAdapter, TransactionSearchSettings, UraApiAdapter, UraApiSettings,
};
use proptx_storage::{
    merge_into_archive, HttpClientConfig, HttpFetcher, MergeOutcome, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "proptx-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = std::collections::HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {} in registry", source.source_id);
            }
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Archive file, relative to the data directory.
    pub archive: PathBuf,
    #[serde(flatten)]
    pub kind: SourceKind,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    UraApi(UraApiSettings),
    TransactionSearch(TransactionSearchSettings),
    SummarySearch(SummarySearchSettings),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub ura_access_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_interval_ms: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("PROPTX_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: lookup("PROPTX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("data")),
            workspace_root,
            ura_access_key: lookup("URA_ACCESS_KEY").filter(|k| !k.trim().is_empty()),
            user_agent: lookup("PROPTX_USER_AGENT").unwrap_or_else(|| "proptx-bot/0.1".to_string()),
            http_timeout_secs: lookup("PROPTX_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            request_interval_ms: lookup("PROPTX_REQUEST_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            scheduler_enabled: lookup("PROPTX_SCHEDULER_ENABLED")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            // Monthly figures are published on the 15th.
            sync_cron: lookup("PROPTX_SYNC_CRON").unwrap_or_else(|| "0 0 6 16 * *".to_string()),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: (self.request_interval_ms > 0).then(|| TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(self.request_interval_ms),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Partial,
    Degraded,
    SessionFailed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub archive_path: String,
    pub status: SourceStatus,
    pub segments_planned: usize,
    pub segments_succeeded: usize,
    pub segments_failed: usize,
    pub rows_parsed: usize,
    pub records_rejected: usize,
    pub merge: Option<MergeOutcome>,
    pub error: Option<String>,
}

impl SourceRunReport {
    fn new(source_id: &str, archive: &Path, status: SourceStatus) -> Self {
        Self {
            source_id: source_id.to_string(),
            archive_path: archive.display().to_string(),
            status,
            segments_planned: 0,
            segments_succeeded: 0,
            segments_failed: 0,
            rows_parsed: 0,
            records_rejected: 0,
            merge: None,
            error: None,
        }
    }

    /// The source was attempted but nothing usable came back.
    pub fn is_degraded(&self) -> bool {
        matches!(self.status, SourceStatus::Degraded | SourceStatus::SessionFailed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunReport>,
    pub report_path: String,
}

impl SyncRunSummary {
    pub fn is_degraded(&self) -> bool {
        self.sources.iter().any(SourceRunReport::is_degraded)
    }

    pub fn rows_written(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|s| s.merge.map(|m| m.written_rows))
            .sum()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            http,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_filtered(None).await
    }

    /// Run every enabled source, or only `only` when given.
    pub async fn run_filtered(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_locked(only).await
    }

    /// Scheduler entry point: a tick that lands while a run is in flight is skipped.
    pub async fn run_scheduled_tick(&self) -> Option<SyncRunSummary> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous sync still running; skipping scheduled tick");
            return None;
        };
        match self.run_locked(None).await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %format!("{err:#}"), "scheduled sync failed");
                None
            }
        }
    }

    async fn run_locked(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let registry = self.load_source_registry().await?;
        if let Some(id) = only {
            if !registry.sources.iter().any(|s| s.source_id == id) {
                bail!("unknown source {id}");
            }
        }
        let selected = registry
            .sources
            .iter()
            .filter(|s| only.map_or(s.enabled, |id| s.source_id == id))
            .collect::<Vec<_>>();
        info!(%run_id, sources = selected.len(), "starting sync run");

        let mut reports = Vec::with_capacity(selected.len());
        for source in selected {
            reports.push(self.run_registered_source(source, &ctx).await?);
        }

        let finished_at = Utc::now();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources: reports,
            report_path: String::new(),
        };
        let report_path = self.write_report(&summary).await?;
        summary.report_path = report_path.display().to_string();
        info!(
            %run_id,
            rows = summary.rows_written(),
            degraded = summary.is_degraded(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_registered_source(
        &self,
        source: &SourceConfig,
        ctx: &AdapterContext,
    ) -> Result<SourceRunReport> {
        let archive = self.config.data_dir.join(&source.archive);
        match &source.kind {
            SourceKind::UraApi(settings) => match &self.config.ura_access_key {
                Some(key) => {
                    let adapter = UraApiAdapter::new(&source.source_id, key, settings.clone());
                    self.run_source(&adapter, &archive, ctx).await
                }
                None => {
                    warn!(source_id = %source.source_id, "URA_ACCESS_KEY not set; skipping source");
                    let mut report = SourceRunReport::new(&source.source_id, &archive, SourceStatus::Skipped);
                    report.error = Some("URA_ACCESS_KEY not set".to_string());
                    Ok(report)
                }
            },
            SourceKind::TransactionSearch(settings) => {
                let adapter = TransactionSearchAdapter::new(&source.source_id, settings.clone());
                self.run_source(&adapter, &archive, ctx).await
            }
            SourceKind::SummarySearch(settings) => {
                let adapter = SummarySearchAdapter::new(&source.source_id, settings.clone());
                self.run_source(&adapter, &archive, ctx).await
            }
        }
    }

    /// Fetch every segment of one source and merge the surviving rows.
    ///
    /// Segment and record failures are logged and counted; only a merge
    /// failure is returned as an error.
    pub async fn run_source<A: SourceAdapter>(
        &self,
        adapter: &A,
        archive: &Path,
        ctx: &AdapterContext,
    ) -> Result<SourceRunReport> {
        let source_id = adapter.source_id().to_string();
        let mut report = SourceRunReport::new(&source_id, archive, SourceStatus::Completed);

        let session = match adapter.open_session(&self.http, ctx).await {
            Ok(session) => session,
            Err(err) => {
                error!(%source_id, error = %err, "could not open source session");
                report.status = SourceStatus::SessionFailed;
                report.error = Some(err.to_string());
                return Ok(report);
            }
        };

        let segments = adapter.plan_segments(&session);
        report.segments_planned = segments.len();
        info!(%source_id, segments = segments.len(), "fetching segments");

        let mut rows = Vec::new();
        for segment in &segments {
            let parsed = match adapter.fetch_segment(&self.http, ctx, &session, segment).await {
                Ok(body) => adapter.parse_segment(ctx, segment, &body),
                Err(err) => Err(err),
            };
            match parsed {
                Ok(batch) => {
                    report.segments_succeeded += 1;
                    for rejected in &batch.rejected {
                        warn!(
                            %source_id,
                            %segment,
                            index = rejected.index,
                            reason = %rejected.reason,
                            "skipping invalid record"
                        );
                    }
                    report.records_rejected += batch.rejected.len();
                    report.rows_parsed += batch.rows.len();
                    info!(%source_id, %segment, rows = batch.rows.len(), "retrieved rows");
                    rows.extend(batch.rows);
                }
                Err(err) => {
                    report.segments_failed += 1;
                    warn!(%source_id, %segment, error = %err, "segment unavailable; ignoring");
                }
            }
        }

        if report.segments_planned > 0 && report.segments_succeeded == 0 {
            warn!(%source_id, "no segment succeeded; archive left untouched");
            report.status = SourceStatus::Degraded;
            return Ok(report);
        }

        let path = archive.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || merge_into_archive(&path, &rows))
            .await
            .context("archive merge task failed")?
            .with_context(|| format!("merging {source_id} into {}", archive.display()))?;
        report.merge = Some(outcome);
        if report.segments_failed > 0 {
            report.status = SourceStatus::Partial;
        }
        Ok(report)
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.sources_path();
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        SourceRegistry::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_report(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        let dir = self.config.reports_root().join(summary.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("run_summary.json");
        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub async fn run_sync_once_from_env(only: Option<&str>) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_filtered(only).await
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            info!("scheduled sync triggered");
            pipeline.run_scheduled_tick().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline).await.map(Some)
}
