use std::io::{BufRead, Write};

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::content_store::ContentStore;
use crate::error::PipelineError;
use crate::index::{SearchField, SearchHit, SearchIndex, SearchQuery};
use crate::metadata::{DiagramKey, DiagramRecord, MetadataStore, SpaceSummary};
use crate::remote::DRAWIO_MEDIA_TYPE;
use crate::runtime::ResolvedPaths;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct DiagramSummary {
    pub identity: String,
    pub space_key: String,
    pub page_id: String,
    pub diagram_id: String,
    pub page_title: String,
    pub diagram_name: String,
    pub local_revision: i64,
    pub has_preview: bool,
    pub last_error: Option<String>,
}

impl From<&DiagramRecord> for DiagramSummary {
    fn from(record: &DiagramRecord) -> Self {
        Self {
            identity: record.key().identity(),
            space_key: record.space_key.clone(),
            page_id: record.page_id.clone(),
            diagram_id: record.diagram_id.clone(),
            page_title: record.page_title.clone(),
            diagram_name: record.diagram_name.clone(),
            local_revision: record.local_revision,
            has_preview: record.preview_path.is_some(),
            last_error: record.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagramDetail {
    pub identity: String,
    #[serde(flatten)]
    pub record: DiagramRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct Blob {
    pub identity: String,
    pub media_type: &'static str,
    pub base64: String,
}

/// Read-only view over the metadata store, content files and search index.
pub struct QueryService {
    store: MetadataStore,
    index: Option<SearchIndex>,
    content: ContentStore,
}

impl QueryService {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        let store = MetadataStore::open_existing(&paths.db_path)?;
        let index = SearchIndex::open_existing(&paths.index_path)?;
        if index.is_none() {
            warn!("search index not built; falling back to metadata scans");
        }
        Ok(Self::from_parts(
            store,
            index,
            ContentStore::new(&paths.content_dir),
        ))
    }

    pub fn from_parts(
        store: MetadataStore,
        index: Option<SearchIndex>,
        content: ContentStore,
    ) -> Self {
        Self {
            store,
            index,
            content,
        }
    }

    pub fn spaces(&self) -> Result<Vec<SpaceSummary>> {
        self.store.list_space_summaries()
    }

    pub fn list(&self, space_key: &str) -> Result<Vec<DiagramSummary>> {
        Ok(self
            .store
            .list_space(space_key)?
            .iter()
            .map(DiagramSummary::from)
            .collect())
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        match &self.index {
            Some(index) => index.search(query),
            None => self.search_like(query),
        }
    }

    /// Active record for `key`; tombstoned rows are reported as missing.
    pub fn get(&self, key: &DiagramKey) -> Result<DiagramDetail> {
        let record = self
            .store
            .get(key)?
            .filter(|record| !record.deleted)
            .ok_or_else(|| anyhow!(PipelineError::NotFound(format!("diagram {key}"))))?;
        Ok(DiagramDetail {
            identity: key.identity(),
            record,
        })
    }

    pub fn content(&self, key: &DiagramKey) -> Result<Vec<u8>> {
        let detail = self.get(key)?;
        let path = detail
            .record
            .content_path
            .ok_or_else(|| anyhow!(PipelineError::NotFound(format!("content of {key}"))))?;
        Ok(self.content.read(&path)?)
    }

    pub fn preview(&self, key: &DiagramKey) -> Result<Vec<u8>> {
        let detail = self.get(key)?;
        let path = detail
            .record
            .preview_path
            .ok_or_else(|| anyhow!(PipelineError::NotFound(format!("preview of {key}"))))?;
        Ok(self.content.read(&path)?)
    }

    fn search_like(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let needle = query.text.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let records = self.store.list_all_active(query.space.as_deref())?;
        let hits = records
            .iter()
            .filter(|record| {
                let haystacks: Vec<&str> = match query.field {
                    Some(SearchField::Name) => vec![record.diagram_name.as_str()],
                    Some(SearchField::Title) => vec![record.page_title.as_str()],
                    Some(SearchField::Content) => vec![record.extracted_text.as_str()],
                    None => vec![
                        record.diagram_name.as_str(),
                        record.page_title.as_str(),
                        record.extracted_text.as_str(),
                    ],
                };
                haystacks
                    .iter()
                    .any(|haystack| haystack.to_lowercase().contains(&needle))
            })
            .take(query.limit.max(1))
            .map(|record| SearchHit {
                identity: record.key().identity(),
                space_key: record.space_key.clone(),
                page_id: record.page_id.clone(),
                diagram_id: record.diagram_id.clone(),
                diagram_name: record.diagram_name.clone(),
                page_title: record.page_title.clone(),
                snippet: String::new(),
                rank: 0.0,
            })
            .collect();
        Ok(hits)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Spaces,
    List {
        space: String,
    },
    Search {
        query: String,
        field: Option<String>,
        space: Option<String>,
        limit: Option<usize>,
    },
    Get {
        identity: String,
    },
    Content {
        identity: String,
    },
    Preview {
        identity: String,
    },
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServeStats {
    pub requests: usize,
    pub errors: usize,
}

/// Answers one JSON request per input line with one JSON response line.
/// Malformed requests get an error response; only I/O failures end the loop.
pub fn serve<R: BufRead, W: Write>(
    service: &QueryService,
    input: R,
    mut output: W,
) -> Result<ServeStats> {
    let mut stats = ServeStats::default();
    for line in input.lines() {
        let line = line.context("failed to read request line")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.requests += 1;
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => match handle(service, request) {
                Ok(result) => Response {
                    ok: true,
                    result: Some(result),
                    error: None,
                    kind: None,
                },
                Err(err) => error_response(&err),
            },
            Err(err) => Response {
                ok: false,
                result: None,
                error: Some(format!("invalid request: {err}")),
                kind: Some("invalid_request"),
            },
        };
        if !response.ok {
            stats.errors += 1;
        }
        let encoded = serde_json::to_string(&response).context("failed to encode response")?;
        writeln!(output, "{encoded}").context("failed to write response")?;
        output.flush().context("failed to flush response")?;
    }
    debug!(requests = stats.requests, errors = stats.errors, "serve loop finished");
    Ok(stats)
}

fn handle(service: &QueryService, request: Request) -> Result<serde_json::Value> {
    let value = match request {
        Request::Spaces => serde_json::to_value(service.spaces()?)?,
        Request::List { space } => serde_json::to_value(service.list(&space)?)?,
        Request::Search {
            query,
            field,
            space,
            limit,
        } => {
            let field = field.as_deref().map(SearchField::parse).transpose()?;
            serde_json::to_value(service.search(&SearchQuery {
                text: query,
                field,
                space,
                limit: limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
            })?)?
        }
        Request::Get { identity } => {
            serde_json::to_value(service.get(&DiagramKey::parse(&identity)?)?)?
        }
        Request::Content { identity } => {
            let bytes = service.content(&DiagramKey::parse(&identity)?)?;
            serde_json::to_value(Blob {
                identity,
                media_type: DRAWIO_MEDIA_TYPE,
                base64: BASE64.encode(bytes),
            })?
        }
        Request::Preview { identity } => {
            let bytes = service.preview(&DiagramKey::parse(&identity)?)?;
            serde_json::to_value(Blob {
                identity,
                media_type: "image/png",
                base64: BASE64.encode(bytes),
            })?
        }
    };
    Ok(value)
}

fn error_response(err: &anyhow::Error) -> Response {
    let kind = err
        .downcast_ref::<PipelineError>()
        .map(|err| err.kind().as_str())
        .unwrap_or("error");
    Response {
        ok: false,
        result: None,
        error: Some(format!("{err:#}")),
        kind: Some(kind),
    }
}
