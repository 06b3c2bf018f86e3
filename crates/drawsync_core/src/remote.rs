use std::collections::{HashSet, VecDeque};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DrawsyncConfig;
use crate::error::PipelineError;
use crate::rate_limit::RateLimiter;

pub const DRAWIO_MEDIA_TYPE: &str = "application/vnd.jgraph.mxfile";

/// Opaque handle used to download one diagram revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FetchToken(String);

impl FetchToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One diagram as described by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDiagram {
    pub page_id: String,
    pub page_title: String,
    pub diagram_id: String,
    pub diagram_name: String,
    pub fingerprint: String,
    pub fetch_token: FetchToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Offset of the next batch, `None` on the last one.
    pub next_start: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttachment {
    pub id: String,
    pub title: String,
    pub media_type: Option<String>,
    pub version: i64,
    pub download: String,
}

/// A page that embeds at least one diagram macro.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub page_id: String,
    pub title: String,
    /// `diagramName` parameters of the page's diagram macros.
    pub diagram_names: Vec<String>,
    pub attachments: Vec<RemoteAttachment>,
    /// Set when the page carries more attachments than were embedded.
    pub more_attachments_from: Option<usize>,
}

/// Raw remote access; every method issues exactly one request.
pub trait RemoteTransport: Send + Sync {
    fn space_batch(&self, start: usize, limit: usize) -> Result<Batch<String>, PipelineError>;

    fn page_batch(
        &self,
        space_key: &str,
        start: usize,
        limit: usize,
    ) -> Result<Batch<RemotePage>, PipelineError>;

    fn attachment_batch(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> Result<Batch<RemoteAttachment>, PipelineError>;

    fn download(&self, token: &FetchToken) -> Result<Vec<u8>, PipelineError>;
}

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn run<T>(
        &self,
        what: &str,
        mut operation: impl FnMut() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let mut attempt = 0usize;
        loop {
            match operation() {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    warn!(what, attempt, error = %err, "transient remote failure; retrying");
                    self.wait_before_retry(attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub page_size: usize,
    pub skip_personal_spaces: bool,
    pub listing_retry: RetryPolicy,
}

/// Paginated, throttled view over a [`RemoteTransport`].
#[derive(Clone)]
pub struct RemoteContentClient {
    transport: Arc<dyn RemoteTransport>,
    limiter: Arc<RateLimiter>,
    requests: Arc<AtomicUsize>,
    options: ClientOptions,
}

impl RemoteContentClient {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        limiter: Arc<RateLimiter>,
        requests: Arc<AtomicUsize>,
        options: ClientOptions,
    ) -> Self {
        Self {
            transport,
            limiter,
            requests,
            options: ClientOptions {
                page_size: options.page_size.max(1),
                ..options
            },
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn list_spaces(&self) -> Result<Vec<String>, PipelineError> {
        let mut spaces = Vec::new();
        let mut start = 0usize;
        loop {
            let batch = self.listing_call("list spaces", || {
                self.transport.space_batch(start, self.options.page_size)
            })?;
            for key in batch.items {
                if self.options.skip_personal_spaces && key.starts_with('~') {
                    continue;
                }
                if !spaces.contains(&key) {
                    spaces.push(key);
                }
            }
            match batch.next_start {
                Some(next) if next > start => start = next,
                Some(_) => {
                    return Err(PipelineError::RemoteUnavailable(
                        "space listing did not advance".to_string(),
                    ));
                }
                None => break,
            }
        }
        Ok(spaces)
    }

    /// Lazily walks every diagram of a space. Each call starts from the first
    /// page; items with an already yielded identity are skipped.
    pub fn list_diagram_attachments(&self, space_key: &str) -> DiagramListing<'_> {
        DiagramListing {
            client: self,
            space_key: space_key.to_string(),
            next_start: Some(0),
            buffer: VecDeque::new(),
            yielded: HashSet::new(),
            failed: false,
        }
    }

    pub fn fetch_diagram_bytes(&self, token: &FetchToken) -> Result<Vec<u8>, PipelineError> {
        self.throttled(|| self.transport.download(token))
    }

    fn throttled<T>(
        &self,
        operation: impl FnOnce() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        self.limiter.acquire();
        self.requests.fetch_add(1, Ordering::Relaxed);
        operation()
    }

    fn listing_call<T>(
        &self,
        what: &str,
        mut operation: impl FnMut() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        self.options
            .listing_retry
            .run(what, || self.throttled(&mut operation))
    }

    fn page_diagrams(&self, page: RemotePage) -> Result<Vec<RemoteDiagram>, PipelineError> {
        let mut attachments = page.attachments;
        let mut next = page.more_attachments_from;
        while let Some(start) = next {
            let batch = self.listing_call("list attachments", || {
                self.transport
                    .attachment_batch(&page.page_id, start, self.options.page_size)
            })?;
            attachments.extend(batch.items);
            next = match batch.next_start {
                Some(following) if following > start => Some(following),
                Some(_) => {
                    return Err(PipelineError::RemoteUnavailable(format!(
                        "attachment listing of page {} did not advance",
                        page.page_id
                    )));
                }
                None => None,
            };
        }

        Ok(attachments
            .into_iter()
            .filter(|attachment| is_diagram_attachment(attachment, &page.diagram_names))
            .map(|attachment| RemoteDiagram {
                page_id: page.page_id.clone(),
                page_title: page.title.clone(),
                fingerprint: format!("{}:v{}", attachment.id, attachment.version),
                diagram_id: attachment.id,
                diagram_name: attachment.title,
                fetch_token: FetchToken::new(attachment.download),
            })
            .collect())
    }
}

pub struct DiagramListing<'c> {
    client: &'c RemoteContentClient,
    space_key: String,
    next_start: Option<usize>,
    buffer: VecDeque<RemoteDiagram>,
    yielded: HashSet<(String, String)>,
    failed: bool,
}

impl Iterator for DiagramListing<'_> {
    type Item = Result<RemoteDiagram, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(diagram) = self.buffer.pop_front() {
                let identity = (diagram.page_id.clone(), diagram.diagram_id.clone());
                if self.yielded.insert(identity) {
                    return Some(Ok(diagram));
                }
                debug!(
                    space = %self.space_key,
                    page_id = %diagram.page_id,
                    diagram_id = %diagram.diagram_id,
                    "duplicate diagram in listing skipped"
                );
                continue;
            }
            if self.failed {
                return None;
            }
            let start = self.next_start?;
            match self.fetch_batch(start) {
                Ok(()) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl DiagramListing<'_> {
    fn fetch_batch(&mut self, start: usize) -> Result<(), PipelineError> {
        let client = self.client;
        let batch = client.listing_call("list diagram pages", || {
            client
                .transport
                .page_batch(&self.space_key, start, client.options.page_size)
        })?;
        self.next_start = match batch.next_start {
            Some(next) if next > start => Some(next),
            Some(_) => {
                return Err(PipelineError::RemoteUnavailable(format!(
                    "diagram listing of space {} did not advance",
                    self.space_key
                )));
            }
            None => None,
        };
        for page in batch.items {
            self.buffer.extend(client.page_diagrams(page)?);
        }
        Ok(())
    }
}

fn is_diagram_attachment(attachment: &RemoteAttachment, diagram_names: &[String]) -> bool {
    if attachment.media_type.as_deref() == Some(DRAWIO_MEDIA_TYPE) {
        return true;
    }
    diagram_names.iter().any(|name| {
        attachment.title == *name
            || attachment
                .title
                .strip_suffix(".drawio")
                .is_some_and(|stem| stem == name)
    })
}

/// `diagramName` parameters of every draw.io macro in a storage-format body.
pub fn drawio_macro_names(storage: &str) -> Vec<String> {
    const MACRO_OPEN: &str = "<ac:structured-macro";
    const MACRO_CLOSE: &str = "</ac:structured-macro>";

    let mut names: Vec<String> = Vec::new();
    let mut rest = storage;
    while let Some(found) = rest.find(MACRO_OPEN) {
        let after = &rest[found..];
        let block_end = after
            .find(MACRO_CLOSE)
            .map(|index| index + MACRO_CLOSE.len())
            .unwrap_or(after.len());
        let block = &after[..block_end];
        let header = &block[..block.find('>').unwrap_or(block.len())];
        if header.contains("ac:name=\"drawio\"")
            && let Some(name) = macro_parameter(block, "diagramName")
            && !names.contains(&name)
        {
            names.push(name);
        }
        // Step past the opening tag only; macros nest.
        rest = &after[MACRO_OPEN.len()..];
    }
    names
}

fn macro_parameter(block: &str, parameter: &str) -> Option<String> {
    let open = format!("<ac:parameter ac:name=\"{parameter}\">");
    let start = block.find(&open)? + open.len();
    let end = start + block[start..].find("</ac:parameter>")?;
    let value = block[start..end]
        .trim()
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    (!value.is_empty()).then_some(value)
}

#[derive(Debug, Clone)]
pub struct ConfluenceConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl ConfluenceConfig {
    /// Base URL from config (env overrides already applied), credentials from env.
    pub fn from_config(config: &DrawsyncConfig) -> Result<Self> {
        let Some(base_url) = config.remote.url.as_deref().map(str::trim) else {
            bail!(
                "remote url is not configured\nSet CONFLUENCE_URL or [remote].url in .drawsync/config.toml"
            );
        };
        if base_url.is_empty() {
            bail!("remote url is empty");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: env_value("CONFLUENCE_USERNAME"),
            password: env_value("CONFLUENCE_PASSWORD"),
            user_agent: config.user_agent(),
            timeout_ms: config.remote.timeout_ms,
        })
    }
}

/// Confluence REST transport over a blocking `reqwest` client.
pub struct ConfluenceTransport {
    client: Client,
    config: ConfluenceConfig,
}

impl ConfluenceTransport {
    pub fn new(config: ConfluenceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self { client, config })
    }

    fn get(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::blocking::Response, PipelineError> {
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.base_url, path)
        };
        let mut request = self.client.get(&url).query(query);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_deref());
        }
        let response = request
            .send()
            .map_err(|err| PipelineError::RemoteUnavailable(format!("{what}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, what));
        }
        Ok(response)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, PipelineError> {
        self.get(what, path, query)?
            .json::<T>()
            .map_err(|err| PipelineError::RemoteUnavailable(format!("{what}: invalid JSON: {err}")))
    }
}

impl RemoteTransport for ConfluenceTransport {
    fn space_batch(&self, start: usize, limit: usize) -> Result<Batch<String>, PipelineError> {
        let parsed: Paged<SpaceItem> = self.get_json(
            "list spaces",
            "/rest/api/space",
            &[("start", start.to_string()), ("limit", limit.to_string())],
        )?;
        let next_start = parsed.next_start(start);
        Ok(Batch {
            items: parsed.results.into_iter().map(|space| space.key).collect(),
            next_start,
        })
    }

    fn page_batch(
        &self,
        space_key: &str,
        start: usize,
        limit: usize,
    ) -> Result<Batch<RemotePage>, PipelineError> {
        let cql = format!(
            "space=\"{}\" and macro=drawio and type=page",
            space_key.replace('"', "\\\"")
        );
        let parsed: Paged<PageItem> = self.get_json(
            "list diagram pages",
            "/rest/api/content/search",
            &[
                ("cql", cql),
                ("start", start.to_string()),
                ("limit", limit.to_string()),
                (
                    "expand",
                    "body.storage,children.attachment,children.attachment.version".to_string(),
                ),
            ],
        )?;
        let next_start = parsed.next_start(start);
        let items = parsed
            .results
            .into_iter()
            .map(|page| {
                let storage = page
                    .body
                    .and_then(|body| body.storage)
                    .map(|storage| storage.value)
                    .unwrap_or_default();
                let attachments = page
                    .children
                    .and_then(|children| children.attachment)
                    .unwrap_or_default();
                let more_attachments_from = attachments.next_start(0);
                RemotePage {
                    diagram_names: drawio_macro_names(&storage),
                    attachments: attachments
                        .results
                        .into_iter()
                        .map(AttachmentItem::into_remote)
                        .collect(),
                    more_attachments_from,
                    page_id: page.id,
                    title: page.title,
                }
            })
            .collect();
        Ok(Batch { items, next_start })
    }

    fn attachment_batch(
        &self,
        page_id: &str,
        start: usize,
        limit: usize,
    ) -> Result<Batch<RemoteAttachment>, PipelineError> {
        let parsed: Paged<AttachmentItem> = self.get_json(
            "list attachments",
            &format!("/rest/api/content/{}/child/attachment", urlencoding::encode(page_id)),
            &[
                ("start", start.to_string()),
                ("limit", limit.to_string()),
                ("expand", "version".to_string()),
            ],
        )?;
        let next_start = parsed.next_start(start);
        Ok(Batch {
            items: parsed
                .results
                .into_iter()
                .map(AttachmentItem::into_remote)
                .collect(),
            next_start,
        })
    }

    fn download(&self, token: &FetchToken) -> Result<Vec<u8>, PipelineError> {
        let bytes = self
            .get("download diagram", token.as_str(), &[])?
            .bytes()
            .map_err(|err| PipelineError::RemoteUnavailable(format!("download diagram: {err}")))?;
        Ok(bytes.to_vec())
    }
}

fn classify_status(status: StatusCode, what: &str) -> PipelineError {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return PipelineError::NotFound(format!("{what}: HTTP {status}"));
    }
    if is_retryable_status(status) {
        return PipelineError::RemoteUnavailable(format!("{what}: HTTP {status} (retryable)"));
    }
    PipelineError::RemoteUnavailable(format!("{what}: HTTP {status}"))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    ) || status.is_server_error()
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
struct Paged<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default, rename = "_links")]
    links: Links,
}

impl<T> Default for Paged<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            links: Links::default(),
        }
    }
}

impl<T> Paged<T> {
    fn next_start(&self, start: usize) -> Option<usize> {
        if self.links.next.is_some() && !self.results.is_empty() {
            Some(start + self.results.len())
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct Links {
    next: Option<String>,
    download: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpaceItem {
    key: String,
}

#[derive(Debug, Deserialize)]
struct PageItem {
    id: String,
    title: String,
    body: Option<PageBody>,
    children: Option<PageChildren>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    storage: Option<StorageValue>,
}

#[derive(Debug, Deserialize)]
struct StorageValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct PageChildren {
    attachment: Option<Paged<AttachmentItem>>,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    id: String,
    title: String,
    metadata: Option<MediaTypeHolder>,
    extensions: Option<MediaTypeHolder>,
    version: Option<VersionItem>,
    #[serde(default, rename = "_links")]
    links: Links,
}

#[derive(Debug, Deserialize)]
struct MediaTypeHolder {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionItem {
    number: i64,
}

impl AttachmentItem {
    fn into_remote(self) -> RemoteAttachment {
        let media_type = self
            .metadata
            .and_then(|holder| holder.media_type)
            .or_else(|| self.extensions.and_then(|holder| holder.media_type));
        RemoteAttachment {
            version: self.version.map(|version| version.number).unwrap_or(1),
            download: self.links.download.unwrap_or_default(),
            id: self.id,
            title: self.title,
            media_type,
        }
    }
}
