use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DrawsyncConfig;
use crate::content_store::{ContentKind, ContentStore, SideRecord};
use crate::error::{FailureKind, PipelineError};
use crate::extract::{DiagramParser, join_fragments, parser_for};
use crate::index::{IndexMode, IndexSyncReport, sync_index};
use crate::metadata::{DiagramKey, DiagramRecord, MetadataStore, SeenUpdate, StoreOp, unix_timestamp};
use crate::rate_limit::RateLimiter;
use crate::remote::{
    ClientOptions, ConfluenceConfig, ConfluenceTransport, RemoteContentClient, RemoteDiagram,
    RemoteTransport, RetryPolicy,
};
use crate::render::{PreviewRenderer, renderer_from_config};
use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every space the remote lists.
    All,
    Spaces(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub targets: Targets,
    pub dry_run: bool,
    pub batch_size: usize,
    pub workers: usize,
    pub max_fetch_retries: usize,
    pub retry_delay_ms: u64,
}

impl ExtractOptions {
    /// Explicit spaces win over the configured list; an empty result means all spaces.
    pub fn from_config(config: &DrawsyncConfig, spaces: Option<Vec<String>>) -> Self {
        let spaces = spaces
            .filter(|spaces| !spaces.is_empty())
            .unwrap_or_else(|| config.remote.spaces.clone());
        Self {
            targets: if spaces.is_empty() {
                Targets::All
            } else {
                Targets::Spaces(spaces)
            },
            dry_run: false,
            batch_size: config.extract.batch_size,
            workers: config.extract.workers,
            max_fetch_retries: config.extract.max_fetch_retries,
            retry_delay_ms: config.extract.retry_delay_ms,
        }
    }

    fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_fetch_retries,
            base_delay_ms: self.retry_delay_ms,
        }
    }
}

/// State owned by one extraction run: throttle, cancellation flag and request counter.
pub struct CrawlSession {
    transport: Arc<dyn RemoteTransport>,
    limiter: Arc<RateLimiter>,
    cancel: AtomicBool,
    requests: Arc<AtomicUsize>,
    client_options: ClientOptions,
}

impl CrawlSession {
    pub fn new(transport: Arc<dyn RemoteTransport>, config: &DrawsyncConfig) -> Self {
        Self::with_limiter(
            transport,
            RateLimiter::per_second(config.remote.rate_limit_per_second),
            ClientOptions {
                page_size: config.remote.page_size,
                skip_personal_spaces: config.remote.skip_personal_spaces,
                listing_retry: RetryPolicy {
                    max_retries: config.extract.max_fetch_retries,
                    base_delay_ms: config.extract.retry_delay_ms,
                },
            },
        )
    }

    pub fn with_limiter(
        transport: Arc<dyn RemoteTransport>,
        limiter: RateLimiter,
        client_options: ClientOptions,
    ) -> Self {
        Self {
            transport,
            limiter: Arc::new(limiter),
            cancel: AtomicBool::new(false),
            requests: Arc::new(AtomicUsize::new(0)),
            client_options,
        }
    }

    pub fn client(&self) -> RemoteContentClient {
        RemoteContentClient::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.limiter),
            Arc::clone(&self.requests),
            self.client_options,
        )
    }

    /// Stops the run at the next checkpoint.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

/// Local collaborators shared by all workers of a run.
pub struct ExtractContext<'a> {
    pub db_path: &'a Path,
    pub content: &'a ContentStore,
    pub parser: &'a dyn DiagramParser,
    pub renderer: &'a dyn PreviewRenderer,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CrawlCounts {
    pub listed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub revived: usize,
    pub deleted: usize,
    pub failed: usize,
    pub vanished: usize,
    pub would_create: usize,
    pub would_update: usize,
    pub would_delete: usize,
}

impl CrawlCounts {
    fn absorb(&mut self, other: &CrawlCounts) {
        self.listed += other.listed;
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.revived += other.revived;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.vanished += other.vanished;
        self.would_create += other.would_create;
        self.would_update += other.would_update;
        self.would_delete += other.would_delete;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub identity: String,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceReport {
    pub space_key: String,
    /// `true` when the listing ran to the end, which is what allows tombstoning.
    pub complete: bool,
    pub listing_error: Option<String>,
    pub counts: CrawlCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub success: bool,
    pub dry_run: bool,
    pub cancelled: bool,
    pub totals: CrawlCounts,
    pub spaces: Vec<SpaceReport>,
    pub failures: Vec<FailureEntry>,
    pub errors: Vec<String>,
    pub request_count: usize,
    pub index: Option<IndexSyncReport>,
}

struct SpaceOutcome {
    report: SpaceReport,
    failures: Vec<FailureEntry>,
}

/// Builds the Confluence transport from configuration and runs one extraction,
/// followed by an incremental index sync unless `sync_search_index` is off.
pub fn extract_from_remote(
    paths: &ResolvedPaths,
    config: &DrawsyncConfig,
    options: &ExtractOptions,
    sync_search_index: bool,
) -> Result<ExtractReport> {
    let transport = ConfluenceTransport::new(ConfluenceConfig::from_config(config)?)?;
    let session = CrawlSession::new(Arc::new(transport), config);
    let content = ContentStore::new(&paths.content_dir);
    let parser = parser_for(config.parser.kind);
    let renderer = renderer_from_config(&config.render);
    let context = ExtractContext {
        db_path: &paths.db_path,
        content: &content,
        parser: parser.as_ref(),
        renderer: renderer.as_ref(),
    };

    let mut report = run_extract(&session, &context, options)?;
    if sync_search_index && !options.dry_run {
        let store = MetadataStore::open(&paths.db_path)?;
        report.index = Some(sync_index(&paths.index_path, &store, IndexMode::Incremental)?);
    }
    Ok(report)
}

/// Crawls every target space. Per-diagram and per-space failures end up in
/// the report; only a store write failure aborts the run.
pub fn run_extract(
    session: &CrawlSession,
    context: &ExtractContext<'_>,
    options: &ExtractOptions,
) -> Result<ExtractReport> {
    // Applies migrations once before workers open their own connections.
    if !options.dry_run {
        MetadataStore::open(context.db_path)?;
    }

    let client = session.client();
    let mut report = ExtractReport {
        success: true,
        dry_run: options.dry_run,
        cancelled: false,
        totals: CrawlCounts::default(),
        spaces: Vec::new(),
        failures: Vec::new(),
        errors: Vec::new(),
        request_count: 0,
        index: None,
    };

    let spaces = match &options.targets {
        Targets::Spaces(spaces) => dedup_spaces(spaces),
        Targets::All => match client.list_spaces() {
            Ok(spaces) => spaces,
            Err(err) => {
                warn!(error = %err, "space listing failed");
                report.errors.push(format!("failed to list spaces: {err}"));
                report.success = false;
                report.request_count = session.request_count();
                return Ok(report);
            }
        },
    };
    info!(
        spaces = spaces.len(),
        dry_run = options.dry_run,
        parser = context.parser.name(),
        renderer = context.renderer.is_enabled(),
        "extraction started"
    );

    let queue = Mutex::new(spaces.into_iter().collect::<VecDeque<_>>());
    let outcomes: Mutex<Vec<SpaceOutcome>> = Mutex::new(Vec::new());
    let fatal: Mutex<Option<PipelineError>> = Mutex::new(None);
    let worker_count = options.workers.max(1);

    thread::scope(|scope| {
        for worker in 0..worker_count {
            let client = client.clone();
            let queue = &queue;
            let outcomes = &outcomes;
            let fatal = &fatal;
            scope.spawn(move || {
                let opened = if options.dry_run {
                    MetadataStore::open_read_only(context.db_path)
                } else {
                    MetadataStore::open(context.db_path).map(Some)
                };
                let store = match opened {
                    Ok(store) => store,
                    Err(err) => {
                        record_fatal(fatal, PipelineError::store_write(err));
                        session.cancel();
                        return;
                    }
                };
                loop {
                    if session.is_cancelled() {
                        break;
                    }
                    let Some(space) = lock(queue).pop_front() else {
                        break;
                    };
                    debug!(worker, space = %space, "space claimed");
                    let result = match &store {
                        _ if options.dry_run => {
                            preview_space(&space, &client, store.as_ref(), options, session)
                        }
                        Some(store) => crawl_space(&space, &client, store, context, options, session),
                        None => Err(PipelineError::StoreWriteFailure(
                            "metadata store is not open".to_string(),
                        )),
                    };
                    match result {
                        Ok(outcome) => lock(outcomes).push(outcome),
                        Err(err) => {
                            warn!(space = %space, error = %err, "aborting extraction");
                            record_fatal(fatal, err);
                            session.cancel();
                            break;
                        }
                    }
                }
            });
        }
    });

    if let Some(err) = lock(&fatal).take() {
        return Err(anyhow!(err)).context("extraction aborted");
    }

    let mut outcomes = std::mem::take(&mut *lock(&outcomes));
    outcomes.sort_by(|left, right| left.report.space_key.cmp(&right.report.space_key));
    for outcome in outcomes {
        report.totals.absorb(&outcome.report.counts);
        if let Some(error) = &outcome.report.listing_error {
            report
                .errors
                .push(format!("{}: {error}", outcome.report.space_key));
        }
        report.failures.extend(outcome.failures);
        report.spaces.push(outcome.report);
    }
    report.cancelled = session.is_cancelled();
    report.success = report.errors.is_empty() && report.failures.is_empty() && !report.cancelled;
    report.request_count = session.request_count();
    info!(
        created = report.totals.created,
        updated = report.totals.updated,
        unchanged = report.totals.unchanged,
        deleted = report.totals.deleted,
        failed = report.totals.failed,
        requests = report.request_count,
        "extraction finished"
    );
    Ok(report)
}

fn crawl_space(
    space_key: &str,
    client: &RemoteContentClient,
    store: &MetadataStore,
    context: &ExtractContext<'_>,
    options: &ExtractOptions,
    session: &CrawlSession,
) -> Result<SpaceOutcome, PipelineError> {
    let mut counts = CrawlCounts::default();
    let mut failures = Vec::new();
    let mut listing_error = None;
    let mut complete = true;
    let mut seen: HashSet<DiagramKey> = HashSet::new();
    let mut pending = PendingBatch::default();
    let mut since_checkpoint = 0usize;
    let batch_size = options.batch_size.max(1);
    let fetch_retry = options.fetch_retry();

    for item in client.list_diagram_attachments(space_key) {
        let remote = match item {
            Ok(remote) => remote,
            Err(err) => {
                warn!(space = %space_key, error = %err, "diagram listing failed; skipping tombstones");
                listing_error = Some(err.to_string());
                complete = false;
                break;
            }
        };
        counts.listed += 1;
        let key = DiagramKey::new(space_key, &remote.page_id, &remote.diagram_id);
        let existing = store.get(&key).map_err(PipelineError::store_write)?;

        let now = unix_timestamp().map_err(PipelineError::store_write)?;
        match &existing {
            Some(record) if record.content_fingerprint == remote.fingerprint => {
                seen.insert(key.clone());
                pending.ops.push(StoreOp::Seen(seen_update(key, &remote, now)));
                counts.unchanged += 1;
            }
            _ => {
                let token = remote.fetch_token.clone();
                match fetch_retry.run("fetch diagram", || client.fetch_diagram_bytes(&token)) {
                    Ok(bytes) => {
                        let materialized = materialize(
                            space_key,
                            &remote,
                            existing.as_ref(),
                            &bytes,
                            now,
                            context,
                        )?;
                        seen.insert(key);
                        pending.ops.push(materialized.op);
                        pending.stale_previews.extend(materialized.stale_preview);
                        if existing.is_some() {
                            counts.updated += 1;
                        } else {
                            counts.created += 1;
                        }
                        if let Some(failure) = materialized.failure {
                            counts.failed += 1;
                            failures.push(failure);
                        }
                    }
                    Err(PipelineError::NotFound(reason)) => {
                        debug!(identity = %key, reason = %reason, "diagram vanished before fetch");
                        counts.vanished += 1;
                    }
                    Err(err @ PipelineError::StoreWriteFailure(_)) => return Err(err),
                    Err(err) => {
                        warn!(identity = %key, error = %err, "diagram fetch failed");
                        counts.failed += 1;
                        failures.push(failure_entry(&key, &err));
                        match &existing {
                            // Keep the stored copy alive; a tombstone stays a tombstone.
                            Some(record) if !record.deleted => {
                                seen.insert(key.clone());
                                pending
                                    .ops
                                    .push(StoreOp::Seen(seen_update(key.clone(), &remote, now)));
                                pending.ops.push(StoreOp::RecordFailure {
                                    key,
                                    reason: err.to_string(),
                                });
                            }
                            Some(_) => {}
                            None => {
                                seen.insert(key);
                                pending.ops.push(StoreOp::Upsert(listing_only_record(
                                    space_key,
                                    &remote,
                                    now,
                                    err.to_string(),
                                )));
                            }
                        }
                    }
                }
            }
        }

        since_checkpoint += 1;
        if since_checkpoint >= batch_size {
            checkpoint(store, context.content, &mut pending, &mut counts)?;
            since_checkpoint = 0;
            if session.is_cancelled() {
                info!(space = %space_key, "cancelled at checkpoint");
                complete = false;
                break;
            }
        }
    }
    checkpoint(store, context.content, &mut pending, &mut counts)?;

    if complete && !session.is_cancelled() {
        let tombstoned = store.mark_unseen_as_deleted(space_key, &seen)?;
        for key in &tombstoned {
            debug!(identity = %key, "tombstoned");
        }
        counts.deleted = tombstoned.len();
    } else {
        complete = false;
    }

    info!(
        space = %space_key,
        listed = counts.listed,
        created = counts.created,
        updated = counts.updated,
        deleted = counts.deleted,
        complete,
        "space crawled"
    );
    Ok(SpaceOutcome {
        report: SpaceReport {
            space_key: space_key.to_string(),
            complete,
            listing_error,
            counts,
        },
        failures,
    })
}

/// Dry run: compares the listing with whatever the store already holds.
/// Nothing is fetched and nothing is written; a missing store is empty.
fn preview_space(
    space_key: &str,
    client: &RemoteContentClient,
    store: Option<&MetadataStore>,
    options: &ExtractOptions,
    session: &CrawlSession,
) -> Result<SpaceOutcome, PipelineError> {
    let mut counts = CrawlCounts::default();
    let mut listing_error = None;
    let mut complete = true;
    let mut seen: HashSet<DiagramKey> = HashSet::new();
    let batch_size = options.batch_size.max(1);

    for item in client.list_diagram_attachments(space_key) {
        let remote = match item {
            Ok(remote) => remote,
            Err(err) => {
                warn!(space = %space_key, error = %err, "diagram listing failed");
                listing_error = Some(err.to_string());
                complete = false;
                break;
            }
        };
        counts.listed += 1;
        let key = DiagramKey::new(space_key, &remote.page_id, &remote.diagram_id);
        let existing = match store {
            Some(store) => store.get(&key).map_err(PipelineError::store_write)?,
            None => None,
        };
        match &existing {
            None => counts.would_create += 1,
            Some(record) if record.deleted || record.content_fingerprint != remote.fingerprint => {
                counts.would_update += 1
            }
            Some(_) => counts.unchanged += 1,
        }
        seen.insert(key);

        if counts.listed % batch_size == 0 && session.is_cancelled() {
            complete = false;
            break;
        }
    }

    if complete
        && !session.is_cancelled()
        && let Some(store) = store
    {
        counts.would_delete = store
            .list_space(space_key)
            .map_err(PipelineError::store_write)?
            .iter()
            .filter(|record| !seen.contains(&record.key()))
            .count();
    }
    let complete = complete && !session.is_cancelled();

    info!(
        space = %space_key,
        listed = counts.listed,
        would_create = counts.would_create,
        would_update = counts.would_update,
        would_delete = counts.would_delete,
        "space previewed"
    );
    Ok(SpaceOutcome {
        report: SpaceReport {
            space_key: space_key.to_string(),
            complete,
            listing_error,
            counts,
        },
        failures: Vec::new(),
    })
}

/// Ops waiting for the next checkpoint, plus preview files that only become
/// unreferenced once those ops are committed.
#[derive(Default)]
struct PendingBatch {
    ops: Vec<StoreOp>,
    stale_previews: Vec<String>,
}

struct Materialized {
    op: StoreOp,
    failure: Option<FailureEntry>,
    stale_preview: Option<String>,
}

/// Extracts, renders and writes one changed diagram, returning the metadata
/// op to queue. Content is on disk before the op can be committed.
fn materialize(
    space_key: &str,
    remote: &RemoteDiagram,
    existing: Option<&DiagramRecord>,
    bytes: &[u8],
    now: i64,
    context: &ExtractContext<'_>,
) -> Result<Materialized, PipelineError> {
    let key = DiagramKey::new(space_key, &remote.page_id, &remote.diagram_id);
    let mut failure = None;
    let extracted_text = match context.parser.extract_text(bytes) {
        Ok(fragments) => join_fragments(&fragments),
        Err(err) => {
            warn!(identity = %key, error = %err, "text extraction failed");
            failure = Some(failure_entry(&key, &err));
            String::new()
        }
    };

    let native = context
        .content
        .write(space_key, &remote.diagram_id, ContentKind::Native, bytes)?;

    let mut preview_path = None;
    let mut stale_preview = None;
    if context.renderer.is_enabled() {
        match context
            .renderer
            .render_preview(space_key, &remote.page_id, bytes)
        {
            Ok(image) => {
                let written =
                    context
                        .content
                        .write(space_key, &remote.diagram_id, ContentKind::Preview, &image)?;
                preview_path = Some(written.path);
            }
            Err(err) => {
                warn!(identity = %key, error = %err, "preview render failed");
                stale_preview = Some(ContentStore::relative_path(
                    space_key,
                    &remote.diagram_id,
                    ContentKind::Preview,
                )?);
                if failure.is_none() {
                    failure = Some(failure_entry(&key, &err));
                }
            }
        }
    }

    let local_revision = existing
        .filter(|record| record.last_extracted_at.is_some())
        .map(|record| record.local_revision + 1)
        .unwrap_or(1);
    context.content.write_side_record(&SideRecord {
        space_key: space_key.to_string(),
        page_id: remote.page_id.clone(),
        diagram_id: remote.diagram_id.clone(),
        page_title: remote.page_title.clone(),
        diagram_name: remote.diagram_name.clone(),
        content_fingerprint: remote.fingerprint.clone(),
        local_revision,
        extracted_at: now,
    })?;

    let record = DiagramRecord {
        space_key: space_key.to_string(),
        page_id: remote.page_id.clone(),
        diagram_id: remote.diagram_id.clone(),
        page_title: remote.page_title.clone(),
        diagram_name: remote.diagram_name.clone(),
        content_fingerprint: remote.fingerprint.clone(),
        local_revision: 0,
        extracted_text,
        content_path: Some(native.path),
        preview_path,
        last_extracted_at: Some(now),
        last_seen_at: now,
        deleted: false,
        last_error: failure.as_ref().map(|failure| failure.reason.clone()),
        change_seq: 0,
    };
    Ok(Materialized {
        op: StoreOp::Upsert(record),
        failure,
        stale_preview,
    })
}

/// Listing metadata for a new diagram whose content could not be fetched. The
/// empty fingerprint never matches a remote one, so the next run fetches again.
fn listing_only_record(
    space_key: &str,
    remote: &RemoteDiagram,
    now: i64,
    reason: String,
) -> DiagramRecord {
    DiagramRecord {
        space_key: space_key.to_string(),
        page_id: remote.page_id.clone(),
        diagram_id: remote.diagram_id.clone(),
        page_title: remote.page_title.clone(),
        diagram_name: remote.diagram_name.clone(),
        content_fingerprint: String::new(),
        local_revision: 0,
        extracted_text: String::new(),
        content_path: None,
        preview_path: None,
        last_extracted_at: None,
        last_seen_at: now,
        deleted: false,
        last_error: Some(reason),
        change_seq: 0,
    }
}

fn checkpoint(
    store: &MetadataStore,
    content: &ContentStore,
    pending: &mut PendingBatch,
    counts: &mut CrawlCounts,
) -> Result<(), PipelineError> {
    if pending.ops.is_empty() {
        return Ok(());
    }
    let outcome = store.apply_batch(&pending.ops)?;
    counts.revived += outcome.revived;
    debug!(ops = pending.ops.len(), "checkpoint committed");
    pending.ops.clear();
    for stale in pending.stale_previews.drain(..) {
        if let Err(err) = content.delete(&stale) {
            warn!(path = %stale, error = %err, "failed to remove stale preview");
        }
    }
    Ok(())
}

fn seen_update(key: DiagramKey, remote: &RemoteDiagram, now: i64) -> SeenUpdate {
    SeenUpdate {
        key,
        page_title: remote.page_title.clone(),
        diagram_name: remote.diagram_name.clone(),
        seen_at: now,
    }
}

fn failure_entry(key: &DiagramKey, err: &PipelineError) -> FailureEntry {
    FailureEntry {
        identity: key.identity(),
        kind: err.kind(),
        reason: err.to_string(),
    }
}

fn dedup_spaces(spaces: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for space in spaces {
        let space = space.trim();
        if !space.is_empty() && !out.iter().any(|existing| existing == space) {
            out.push(space.to_string());
        }
    }
    out
}

fn record_fatal(slot: &Mutex<Option<PipelineError>>, err: PipelineError) {
    let mut guard = lock(slot);
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::extract::QuickXmlParser;
    use crate::remote::memory::MemoryTransport;
    use crate::render::DisabledRenderer;

    const SYSTEM: &[u8] = br#"<mxfile><diagram name="Page-1"><mxGraphModel><root>
<mxCell id="0"/><mxCell id="1" parent="0"/>
<mxCell id="2" value="Load Balancer" vertex="1" parent="1"/>
</root></mxGraphModel></diagram></mxfile>"#;

    const SYSTEM_V2: &[u8] = br#"<mxfile><diagram name="Page-1"><mxGraphModel><root>
<mxCell id="0"/><mxCell id="2" value="Load Balancer" vertex="1"/>
<mxCell id="3" value="Cache" vertex="1"/>
</root></mxGraphModel></diagram></mxfile>"#;

    struct Fixture {
        _temp: TempDir,
        db_path: std::path::PathBuf,
        content: ContentStore,
        transport: Arc<MemoryTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempdir().expect("tempdir");
            let db_path = temp.path().join("data/metadata.db");
            let content = ContentStore::new(temp.path().join("content"));
            Self {
                _temp: temp,
                db_path,
                content,
                transport: Arc::new(MemoryTransport::new()),
            }
        }

        fn session(&self) -> CrawlSession {
            CrawlSession::with_limiter(
                self.transport.clone(),
                RateLimiter::per_second(0),
                ClientOptions {
                    page_size: 2,
                    skip_personal_spaces: true,
                    listing_retry: RetryPolicy {
                        max_retries: 0,
                        base_delay_ms: 0,
                    },
                },
            )
        }

        fn run(&self, options: &ExtractOptions) -> ExtractReport {
            self.run_with(&self.session(), options, &DisabledRenderer)
        }

        fn run_with(
            &self,
            session: &CrawlSession,
            options: &ExtractOptions,
            renderer: &dyn PreviewRenderer,
        ) -> ExtractReport {
            let context = ExtractContext {
                db_path: &self.db_path,
                content: &self.content,
                parser: &QuickXmlParser,
                renderer,
            };
            run_extract(session, &context, options).expect("extract")
        }

        fn store(&self) -> MetadataStore {
            MetadataStore::open(&self.db_path).expect("store")
        }

        fn record(&self, diagram_id: &str) -> DiagramRecord {
            self.store()
                .get(&DiagramKey::new("DEMO", "100", diagram_id))
                .expect("get")
                .expect("record exists")
        }
    }

    fn options() -> ExtractOptions {
        ExtractOptions {
            targets: Targets::All,
            dry_run: false,
            batch_size: 2,
            workers: 2,
            max_fetch_retries: 2,
            retry_delay_ms: 0,
        }
    }

    #[test]
    fn repeated_runs_only_refresh_unchanged_diagrams() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att2", "network", 1, SYSTEM);

        let first = fixture.run(&options());
        assert!(first.success);
        assert_eq!(first.totals.created, 2);
        let created = fixture.record("att1");
        assert_eq!(created.local_revision, 1);
        assert_eq!(created.extracted_text, "Page-1 Load Balancer");
        assert!(fixture.content.exists(created.content_path.as_deref().expect("path")));
        let downloads_after_first = fixture.transport.downloads().len();

        let second = fixture.run(&options());
        assert_eq!(second.totals.unchanged, 2);
        assert_eq!(second.totals.created + second.totals.updated, 0);
        assert_eq!(fixture.transport.downloads().len(), downloads_after_first);
        let refreshed = fixture.record("att1");
        assert_eq!(refreshed.local_revision, 1);
        assert_eq!(refreshed.change_seq, created.change_seq);
        assert_eq!(refreshed.last_extracted_at, created.last_extracted_at);
    }

    #[test]
    fn new_remote_version_is_reextracted() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.run(&options());

        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 2, SYSTEM_V2);
        let report = fixture.run(&options());
        assert_eq!(report.totals.updated, 1);
        let record = fixture.record("att1");
        assert_eq!(record.local_revision, 2);
        assert_eq!(record.content_fingerprint, "att1:v2");
        assert!(record.extracted_text.contains("Cache"));
    }

    #[test]
    fn removed_diagram_is_tombstoned_only_after_complete_listing() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att2", "network", 1, SYSTEM);
        fixture.run(&options());

        fixture.transport.remove_diagram("DEMO", "att2");
        fixture.transport.break_listing("DEMO", true);
        let broken = fixture.run(&options());
        assert!(!broken.success);
        assert!(!broken.spaces[0].complete);
        assert_eq!(broken.totals.deleted, 0);
        assert!(!fixture.record("att2").deleted);

        fixture.transport.break_listing("DEMO", false);
        let report = fixture.run(&options());
        assert_eq!(report.totals.deleted, 1);
        assert!(fixture.record("att2").deleted);
        assert!(!fixture.record("att1").deleted);
    }

    #[test]
    fn dry_run_reports_without_fetching_or_writing() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.run(&options());
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 2, SYSTEM_V2);
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att3", "flow", 1, SYSTEM);
        let seq_before = fixture.store().current_change_seq().expect("seq");
        let downloads_before = fixture.transport.downloads().len();

        let report = fixture.run(&ExtractOptions {
            dry_run: true,
            ..options()
        });
        assert!(report.dry_run);
        assert_eq!(report.totals.would_create, 1);
        assert_eq!(report.totals.would_update, 1);
        assert_eq!(report.totals.would_delete, 0);
        assert_eq!(fixture.transport.downloads().len(), downloads_before);
        assert_eq!(fixture.store().current_change_seq().expect("seq"), seq_before);
        assert_eq!(fixture.record("att1").local_revision, 1);
    }

    #[test]
    fn dry_run_on_fresh_state_creates_nothing() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);

        let report = fixture.run(&ExtractOptions {
            dry_run: true,
            ..options()
        });
        assert!(report.success);
        assert_eq!(report.totals.would_create, 1);
        assert_eq!(report.totals.would_delete, 0);
        assert!(fixture.transport.downloads().is_empty());
        assert!(!fixture.db_path.exists());
        assert!(!fixture.db_path.parent().expect("data dir").exists());
        assert_eq!(fixture.content.usage().expect("usage").files, 0);
    }

    #[test]
    fn malformed_diagram_is_stored_with_empty_text_and_error() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "bad", "broken", 1, b"<mxfile><diagram>");

        let report = fixture.run(&options());
        assert_eq!(report.totals.created, 2);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.failures[0].identity, "DEMO/100/bad");
        assert_eq!(report.failures[0].kind, FailureKind::MalformedDiagram);

        let bad = fixture.record("bad");
        assert_eq!(bad.extracted_text, "");
        assert!(bad.last_error.is_some());
        assert_eq!(fixture.record("att1").extracted_text, "Page-1 Load Balancer");
    }

    #[test]
    fn transient_download_failures_are_retried() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.transport.fail_downloads("/download/att1/v1", 2);

        let report = fixture.run(&options());
        assert!(report.success);
        assert_eq!(report.totals.created, 1);
        assert_eq!(fixture.transport.downloads().len(), 3);
    }

    #[test]
    fn exhausted_retries_keep_existing_record_alive_and_flag_it() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.run(&options());

        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 2, SYSTEM_V2);
        fixture.transport.fail_downloads("/download/att1/v2", 10);
        let report = fixture.run(&options());
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::RemoteUnavailable);
        assert_eq!(report.totals.deleted, 0);

        let record = fixture.record("att1");
        assert!(!record.deleted);
        assert_eq!(record.content_fingerprint, "att1:v1");
        assert!(record.last_error.is_some());
    }

    #[test]
    fn new_diagram_with_failed_fetch_is_listed_and_fetched_later() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.transport.fail_downloads("/download/att1/v1", 10);

        let report = fixture.run(&options());
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.totals.created, 0);
        let listed = fixture.record("att1");
        assert!(!listed.deleted);
        assert_eq!(listed.diagram_name, "system");
        assert_eq!(listed.local_revision, 0);
        assert!(listed.content_path.is_none());
        assert!(listed.last_extracted_at.is_none());
        assert!(listed.last_error.is_some());
        assert_ne!(listed.content_fingerprint, "att1:v1");

        fixture.transport.fail_downloads("/download/att1/v1", 0);
        let retried = fixture.run(&options());
        assert!(retried.success);
        assert_eq!(retried.totals.updated, 1);
        let fetched = fixture.record("att1");
        assert_eq!(fetched.local_revision, 1);
        assert_eq!(fetched.content_fingerprint, "att1:v1");
        assert!(fetched.content_path.is_some());
        assert!(fetched.last_error.is_none());
        assert_eq!(fetched.extracted_text, "Page-1 Load Balancer");
    }

    #[test]
    fn vanished_diagram_is_not_seen_and_gets_tombstoned() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture.run(&options());

        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 2, SYSTEM_V2);
        fixture.transport.mark_missing("/download/att1/v2");
        let report = fixture.run(&options());
        assert_eq!(report.totals.vanished, 1);
        assert_eq!(report.totals.deleted, 1);
        assert!(fixture.record("att1").deleted);
    }

    #[test]
    fn cancelled_session_skips_remaining_spaces() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        let session = fixture.session();
        session.cancel();

        let report = fixture.run_with(&session, &options(), &DisabledRenderer);
        assert!(report.cancelled);
        assert!(!report.success);
        assert!(report.spaces.is_empty());
        assert!(fixture.transport.downloads().is_empty());
    }

    #[test]
    fn explicit_targets_limit_the_crawl() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture
            .transport
            .put_diagram("OPS", "200", "Runbook", "att9", "oncall", 1, SYSTEM);

        let report = fixture.run(&ExtractOptions {
            targets: Targets::Spaces(vec!["OPS".to_string(), "OPS".to_string()]),
            ..options()
        });
        assert_eq!(report.spaces.len(), 1);
        assert_eq!(report.spaces[0].space_key, "OPS");
        let stats = fixture.store().stats().expect("stats");
        assert_eq!(stats.active, 1);
    }

    struct FlakyRenderer;

    impl PreviewRenderer for FlakyRenderer {
        fn render_preview(
            &self,
            _space_key: &str,
            _page_id: &str,
            native: &[u8],
        ) -> Result<Vec<u8>, PipelineError> {
            if native == SYSTEM {
                Ok(b"png".to_vec())
            } else {
                Err(PipelineError::RenderFailed("exporter crashed".to_string()))
            }
        }
    }

    #[test]
    fn render_failure_leaves_preview_empty_but_keeps_record() {
        let fixture = Fixture::new();
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 1, SYSTEM);
        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att2", "network", 1, SYSTEM_V2);

        let report = fixture.run_with(&fixture.session(), &options(), &FlakyRenderer);
        assert_eq!(report.totals.created, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::RenderFailed);

        let rendered = fixture.record("att1");
        let preview = rendered.preview_path.expect("preview path");
        assert_eq!(fixture.content.read(&preview).expect("preview"), b"png");
        let failed = fixture.record("att2");
        assert!(failed.preview_path.is_none());
        assert!(failed.extracted_text.contains("Cache"));

        fixture
            .transport
            .put_diagram("DEMO", "100", "Architecture", "att1", "system", 2, SYSTEM_V2);
        fixture.run_with(&fixture.session(), &options(), &FlakyRenderer);
        let rerendered = fixture.record("att1");
        assert!(rerendered.preview_path.is_none());
        assert!(!fixture.content.exists(&preview));
    }

    #[test]
    fn stale_preview_survives_a_failed_checkpoint() {
        let fixture = Fixture::new();
        let store = fixture.store();
        let preview = fixture
            .content
            .write("DEMO", "att1", ContentKind::Preview, b"png")
            .expect("preview")
            .path;
        rusqlite::Connection::open(&fixture.db_path)
            .expect("raw connection")
            .execute_batch("DROP TABLE diagrams")
            .expect("drop");

        let mut pending = PendingBatch {
            ops: vec![StoreOp::RecordFailure {
                key: DiagramKey::new("DEMO", "100", "att1"),
                reason: "boom".to_string(),
            }],
            stale_previews: vec![preview.clone()],
        };
        let mut counts = CrawlCounts::default();
        let result = checkpoint(&store, &fixture.content, &mut pending, &mut counts);
        assert!(matches!(result, Err(PipelineError::StoreWriteFailure(_))));
        assert!(fixture.content.exists(&preview));
        assert_eq!(pending.stale_previews, vec![preview]);
    }

    #[test]
    fn options_prefer_explicit_spaces_over_config() {
        let mut config = DrawsyncConfig::default();
        config.remote.spaces = vec!["ARCH".to_string()];
        let from_config = ExtractOptions::from_config(&config, None);
        assert_eq!(from_config.targets, Targets::Spaces(vec!["ARCH".to_string()]));
        let explicit = ExtractOptions::from_config(&config, Some(vec!["DEMO".to_string()]));
        assert_eq!(explicit.targets, Targets::Spaces(vec!["DEMO".to_string()]));
        assert_eq!(
            ExtractOptions::from_config(&DrawsyncConfig::default(), None).targets,
            Targets::All
        );
    }
}
