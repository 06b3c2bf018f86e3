use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use drawsync_core::content_store::ContentStore;
use drawsync_core::crawl::{CrawlSession, ExtractContext, ExtractOptions, Targets, run_extract};
use drawsync_core::error::PipelineError;
use drawsync_core::extract::QuickXmlParser;
use drawsync_core::index::{IndexMode, SearchIndex, SearchQuery, sync_index};
use drawsync_core::metadata::{DiagramKey, MetadataStore};
use drawsync_core::query::{QueryService, serve};
use drawsync_core::rate_limit::RateLimiter;
use drawsync_core::remote::{
    Batch, ClientOptions, DRAWIO_MEDIA_TYPE, FetchToken, RemoteAttachment, RemotePage,
    RemoteTransport, RetryPolicy,
};
use drawsync_core::render::DisabledRenderer;
use serde_json::Value;
use tempfile::tempdir;

const OVERVIEW_V1: &[u8] = br#"<mxfile><diagram name="Page-1"><mxGraphModel><root>
<mxCell id="0"/><mxCell id="1" parent="0"/>
<mxCell id="2" value="Load Balancer" vertex="1" parent="1"/>
</root></mxGraphModel></diagram></mxfile>"#;

const OVERVIEW_V2: &[u8] = br#"<mxfile><diagram name="Page-1"><mxGraphModel><root>
<mxCell id="0"/><mxCell id="1" parent="0"/>
<mxCell id="2" value="Load Balancer" vertex="1" parent="1"/>
<mxCell id="3" value="Cache Cluster" vertex="1" parent="1"/>
</root></mxGraphModel></diagram></mxfile>"#;

const NETWORK: &[u8] = br#"<mxfile><diagram name="Edge"><mxGraphModel><root>
<mxCell id="0"/><mxCell id="4" value="Core Router" vertex="1" parent="0"/>
</root></mxGraphModel></diagram></mxfile>"#;

/// Single-space remote with one page; attachments keyed by id.
#[derive(Default)]
struct FakeConfluence {
    attachments: Mutex<BTreeMap<String, (i64, Vec<u8>)>>,
}

impl FakeConfluence {
    fn publish(&self, id: &str, version: i64, bytes: &[u8]) {
        self.attachments
            .lock()
            .expect("lock")
            .insert(id.to_string(), (version, bytes.to_vec()));
    }

    fn unpublish(&self, id: &str) {
        self.attachments.lock().expect("lock").remove(id);
    }
}

impl RemoteTransport for FakeConfluence {
    fn space_batch(&self, _start: usize, _limit: usize) -> Result<Batch<String>, PipelineError> {
        Ok(Batch {
            items: vec!["DEMO".to_string()],
            next_start: None,
        })
    }

    fn page_batch(
        &self,
        space_key: &str,
        start: usize,
        _limit: usize,
    ) -> Result<Batch<RemotePage>, PipelineError> {
        if space_key != "DEMO" || start > 0 {
            return Ok(Batch {
                items: Vec::new(),
                next_start: None,
            });
        }
        let attachments = self
            .attachments
            .lock()
            .expect("lock")
            .iter()
            .map(|(id, (version, _))| RemoteAttachment {
                id: id.clone(),
                title: format!("{id}.drawio"),
                media_type: Some(DRAWIO_MEDIA_TYPE.to_string()),
                version: *version,
                download: format!("{id}@{version}"),
            })
            .collect();
        Ok(Batch {
            items: vec![RemotePage {
                page_id: "100".to_string(),
                title: "Architecture".to_string(),
                diagram_names: Vec::new(),
                attachments,
                more_attachments_from: None,
            }],
            next_start: None,
        })
    }

    fn attachment_batch(
        &self,
        _page_id: &str,
        _start: usize,
        _limit: usize,
    ) -> Result<Batch<RemoteAttachment>, PipelineError> {
        Ok(Batch {
            items: Vec::new(),
            next_start: None,
        })
    }

    fn download(&self, token: &FetchToken) -> Result<Vec<u8>, PipelineError> {
        let (id, version) = token
            .as_str()
            .split_once('@')
            .ok_or_else(|| PipelineError::NotFound(token.as_str().to_string()))?;
        let attachments = self.attachments.lock().expect("lock");
        match attachments.get(id) {
            Some((current, bytes)) if current.to_string() == version => Ok(bytes.clone()),
            _ => Err(PipelineError::NotFound(token.as_str().to_string())),
        }
    }
}

fn session(remote: &Arc<FakeConfluence>) -> CrawlSession {
    CrawlSession::with_limiter(
        remote.clone(),
        RateLimiter::per_second(0),
        ClientOptions {
            page_size: 25,
            skip_personal_spaces: true,
            listing_retry: RetryPolicy {
                max_retries: 0,
                base_delay_ms: 0,
            },
        },
    )
}

fn options() -> ExtractOptions {
    ExtractOptions {
        targets: Targets::Spaces(vec!["DEMO".to_string()]),
        dry_run: false,
        batch_size: 10,
        workers: 2,
        max_fetch_retries: 0,
        retry_delay_ms: 0,
    }
}

fn search_identities(index: &SearchIndex, text: &str) -> Vec<String> {
    index
        .search(&SearchQuery {
            text: text.to_string(),
            field: None,
            space: None,
            limit: 10,
        })
        .expect("search")
        .into_iter()
        .map(|hit| hit.identity)
        .collect()
}

#[test]
fn extract_index_and_serve_follow_remote_changes() {
    let temp = tempdir().expect("tempdir");
    let db_path = temp.path().join("data/metadata.db");
    let index_path = temp.path().join("data/search.db");
    let content = ContentStore::new(temp.path().join("content"));
    let remote = Arc::new(FakeConfluence::default());
    let context = ExtractContext {
        db_path: &db_path,
        content: &content,
        parser: &QuickXmlParser,
        renderer: &DisabledRenderer,
    };

    remote.publish("overview", 1, OVERVIEW_V1);
    remote.publish("network", 1, NETWORK);
    remote.publish("brokenthing", 1, b"<mxfile><diagram>");
    let first = run_extract(&session(&remote), &context, &options()).expect("first extract");
    assert!(!first.success);
    assert_eq!(first.totals.created, 3);
    assert_eq!(first.totals.failed, 1);
    assert_eq!(first.failures[0].identity, "DEMO/100/brokenthing");

    let store = MetadataStore::open(&db_path).expect("store");
    let overview = DiagramKey::new("DEMO", "100", "overview");
    let network = DiagramKey::new("DEMO", "100", "network");
    let broken = DiagramKey::new("DEMO", "100", "brokenthing");
    let unparsed = store.get(&broken).expect("get").expect("broken diagram stored");
    assert_eq!(unparsed.extracted_text, "");
    assert!(unparsed.last_error.is_some());
    assert_eq!(store.get(&overview).expect("get").expect("overview").local_revision, 1);

    let report = sync_index(&index_path, &store, IndexMode::Incremental).expect("first sync");
    assert_eq!(report.documents, 3);
    assert!(report.convergence.converged);
    {
        let index = SearchIndex::open(&index_path).expect("index");
        assert_eq!(search_identities(&index, "balancer"), vec![overview.identity()]);
        assert_eq!(search_identities(&index, "router"), vec![network.identity()]);
        assert_eq!(search_identities(&index, "brokenthing"), vec![broken.identity()]);
    }

    remote.publish("overview", 2, OVERVIEW_V2);
    remote.unpublish("network");
    remote.unpublish("brokenthing");
    let second = run_extract(&session(&remote), &context, &options()).expect("second extract");
    assert!(second.success);
    assert_eq!(second.totals.updated, 1);
    assert_eq!(second.totals.deleted, 2);
    assert_eq!(store.get(&overview).expect("get").expect("overview").local_revision, 2);

    let report = sync_index(&index_path, &store, IndexMode::Incremental).expect("second sync");
    assert_eq!(report.documents, 1);
    assert!(report.convergence.converged);
    assert!(report.watermark_after > report.watermark_before);

    let tombstone = store.get(&network).expect("get").expect("tombstone kept");
    assert!(tombstone.deleted);
    assert!(store.get(&broken).expect("get").expect("tombstone kept").deleted);

    let index = SearchIndex::open(&index_path).expect("index");
    assert!(search_identities(&index, "router").is_empty());
    assert!(search_identities(&index, "brokenthing").is_empty());
    assert_eq!(search_identities(&index, "cache"), vec![overview.identity()]);

    let service = QueryService::from_parts(
        MetadataStore::open(&db_path).expect("store"),
        Some(index),
        ContentStore::new(temp.path().join("content")),
    );
    let requests = format!(
        "{}\n{}\n{}\n{}\n",
        r#"{"op":"spaces"}"#,
        format_args!(r#"{{"op":"content","identity":"{}"}}"#, overview.identity()),
        format_args!(r#"{{"op":"get","identity":"{}"}}"#, network.identity()),
        r#"{"op":"get","identity":"DEMO/100/missing"}"#,
    );
    let mut output = Vec::new();
    let stats = serve(&service, Cursor::new(requests), &mut output).expect("serve");
    assert_eq!(stats.requests, 4);

    let responses: Vec<Value> = String::from_utf8(output)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json"))
        .collect();
    assert_eq!(responses[0]["result"][0]["space_key"], "DEMO");
    assert_eq!(responses[0]["result"][0]["diagrams"], 1);

    let encoded = responses[1]["result"]["base64"].as_str().expect("base64");
    assert_eq!(BASE64.decode(encoded).expect("decode"), OVERVIEW_V2);

    assert_eq!(responses[2]["ok"], false);
    assert_eq!(responses[2]["kind"], "not_found");
    assert_eq!(responses[3]["kind"], "not_found");
    assert_eq!(stats.errors, 2);
}
