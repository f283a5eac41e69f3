use async_trait::async_trait;
use chrono::FixedOffset;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::LogSource;
use crate::error::TraceError;
use crate::model::{LogEntry, LogQuery};
use crate::parser::RecordParser;
use crate::settings::{SearchSettings, parse_utc_offset};

const RANGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
/// Default `index.max_result_window`; `from + size` may not exceed it.
const MAX_RESULT_WINDOW: usize = 10_000;

/// Queries an OpenSearch-compatible `_search` endpoint.
#[derive(Debug, Clone)]
pub struct SearchSource {
    client: Client,
    settings: SearchSettings,
    host: Option<String>,
    offset: FixedOffset,
    parser: RecordParser
}

impl SearchSource {
    pub fn new(
        host: Option<&str>,
        settings: &SearchSettings
    ) -> Result<Self, TraceError> {
        let offset = parse_utc_offset(&settings.time_zone)?;
        let client = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_certs)
            .build()
            .map_err(|err| {
                TraceError::config(
                    format!("failed to build http client: {err}"),
                    "check the opensearch TLS settings",
                )
            })?;

        Ok(Self {
            client,
            settings: settings.clone(),
            host: host.map(str::to_string),
            offset,
            parser: RecordParser::new(settings.mapping.clone(), offset)
        })
    }

    /// Builds the client and pings the cluster root.
    pub async fn connect(
        host: Option<&str>,
        settings: &SearchSettings
    ) -> Result<Self, TraceError> {
        let source = Self::new(host, settings)?;
        let response = source
            .authorize(source.client.get(source.settings.base_url()))
            .send()
            .await
            .map_err(|err| source.transport_error(err))?;
        source.check_status(response.status(), "").map(|()| source)
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder
    ) -> reqwest::RequestBuilder {
        match self.settings.username.as_deref() {
            Some(user) => request.basic_auth(user, self.settings.password.as_deref()),
            None => request
        }
    }

    fn transport_error(
        &self,
        err: reqwest::Error
    ) -> TraceError {
        if err.is_connect() || err.is_timeout() {
            TraceError::network(
                format!(
                    "cannot connect to opensearch at {}: {err}",
                    self.settings.base_url()
                ),
                "check opensearch.host, opensearch.port and opensearch.use_ssl",
            )
        } else {
            TraceError::query(
                format!("opensearch request failed: {err}"),
                "check the opensearch server logs",
            )
        }
    }

    fn check_status(
        &self,
        status: StatusCode,
        body: &str
    ) -> Result<(), TraceError> {
        if status.is_success() {
            return Ok(());
        }
        let index = &self.settings.index;
        Err(match status {
            StatusCode::UNAUTHORIZED => TraceError::auth(
                "opensearch rejected the credentials",
                "check your OpenSearch username and password",
            ),
            StatusCode::FORBIDDEN => TraceError::query(
                format!("access denied to index {index}"),
                "check that the OpenSearch user has read permission on the index",
            ),
            StatusCode::NOT_FOUND => TraceError::query(
                format!("index not found: {index}"),
                "check that the index name in opensearch.index is correct",
            ),
            other => TraceError::query(
                format!("opensearch returned {other}: {}", truncate(body, 300)),
                "check the query and the opensearch server logs",
            )
        })
    }
}

impl SearchSource {
    /// One page of raw hits plus the total the backend reports, if any.
    async fn fetch_page(
        &self,
        url: &str,
        body: &Value
    ) -> Result<(Vec<Value>, Option<u64>), TraceError> {
        debug!("opensearch query: url={url}, body={body}");
        let response = self
            .authorize(self.client.post(url))
            .json(body)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        let text = response.text().await.map_err(|err| self.transport_error(err))?;
        self.check_status(status, &text)?;

        let mut parsed: Value = serde_json::from_str(&text).map_err(|err| {
            TraceError::query(
                format!("malformed opensearch response: {err}"),
                "check that opensearch.host points at an OpenSearch node",
            )
        })?;
        let total = parsed
            .pointer("/hits/total/value")
            .or_else(|| parsed.pointer("/hits/total"))
            .and_then(Value::as_u64);
        let hits = match parsed.pointer_mut("/hits/hits").map(Value::take) {
            Some(Value::Array(hits)) => hits,
            _ => Vec::new()
        };
        Ok((hits, total))
    }
}

#[async_trait]
impl LogSource for SearchSource {
    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    async fn query(
        &self,
        query: &LogQuery
    ) -> Result<Vec<LogEntry>, TraceError> {
        let mut body = build_query(&self.settings, self.host.as_deref(), query, self.offset);
        let url = format!("{}/{}/_search", self.settings.base_url(), self.settings.index);
        let page_size = self.settings.max_hits.max(1);

        let mut hits: Vec<Value> = Vec::new();
        let mut total = None;
        loop {
            if let Some(fields) = body.as_object_mut() {
                fields.insert("from".to_string(), json!(hits.len()));
            }
            let (page, page_total) = self.fetch_page(&url, &body).await?;
            total = total.or(page_total);
            let fetched = page.len();
            hits.extend(page);

            if fetched < page_size || total.is_some_and(|total| hits.len() as u64 >= total) {
                break;
            }
            if hits.len() + page_size > MAX_RESULT_WINDOW {
                break;
            }
        }
        if let Some(total) = total
            && total > hits.len() as u64
        {
            warn!(
                "search results truncated: index={}, host={}, total={total}, fetched={}",
                self.settings.index,
                self.host.as_deref().unwrap_or("*"),
                hits.len()
            );
        }

        let mut entries = Vec::with_capacity(hits.len());
        let mut last_error = None;
        for hit in &hits {
            match self.parser.parse(hit) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!("skipping search hit: error={err}");
                    last_error = Some(err);
                }
            }
        }
        if entries.is_empty()
            && let Some(err) = last_error
        {
            return Err(err);
        }

        let ids = query.requested_ids();
        if !ids.is_empty() {
            entries.retain(|entry| {
                entry.mail_id.as_deref().is_some_and(|id| ids.contains(&id))
            });
        }

        info!(
            "opensearch query done: index={}, host={}, hits={}, entries={}",
            self.settings.index,
            self.host.as_deref().unwrap_or("*"),
            hits.len(),
            entries.len()
        );
        Ok(entries)
    }

    fn without_host_filter(&self) -> Option<Box<dyn LogSource>> {
        self.host.as_ref()?;
        Some(Box::new(Self { host: None, ..self.clone() }))
    }
}

/// Search request body for `query`, scoped to `host` when given.
pub fn build_query(
    settings: &SearchSettings,
    host: Option<&str>,
    query: &LogQuery,
    offset: FixedOffset
) -> Value {
    let mapping = &settings.mapping;
    let mut must = Vec::new();

    if let Some(facility) = mapping.facility.as_deref() {
        must.push(json!({ "match": { facility: "mail" } }));
    }
    if let Some(host) = host {
        must.push(json!({ "match": { mapping.hostname.as_str(): host } }));
    }
    if let Some(window) = query.window {
        let (start, end) = window.local_bounds(offset);
        let upper = if window.end_inclusive() { "lte" } else { "lt" };
        must.push(json!({
            "range": {
                mapping.timestamp.as_str(): {
                    "gte": start.format(RANGE_FORMAT).to_string(),
                    upper: end.format(RANGE_FORMAT).to_string(),
                    "time_zone": settings.time_zone,
                }
            }
        }));
    }

    for keyword in query.keywords.iter().filter(|kw| !kw.is_empty()) {
        must.push(json!({
            "wildcard": {
                mapping.message.as_str(): format!("*{}*", keyword.to_lowercase())
            }
        }));
    }

    if let Some(id) = query.mail_id.as_deref() {
        must.push(id_clause(settings, id));
    }
    if !query.mail_ids.is_empty() {
        must.push(match mapping.queueid.as_deref() {
            Some(path) => json!({ "terms": { path: query.mail_ids } }),
            None => json!({
                "bool": {
                    "should": query
                        .mail_ids
                        .iter()
                        .map(|id| id_clause(settings, id))
                        .collect::<Vec<_>>(),
                    "minimum_should_match": 1,
                }
            })
        });
    }
    if let Some(message_id) = query.message_id.as_deref() {
        let path = mapping.message_id.as_deref().unwrap_or(&mapping.message);
        must.push(json!({ "match_phrase": { path: message_id } }));
    }

    json!({
        "from": 0,
        "size": settings.max_hits,
        "track_total_hits": true,
        "sort": [{ mapping.timestamp.as_str(): { "order": "asc" } }],
        "query": { "bool": { "must": must } },
    })
}

fn id_clause(
    settings: &SearchSettings,
    id: &str
) -> Value {
    match settings.mapping.queueid.as_deref() {
        Some(path) => json!({ "term": { path: id } }),
        None => json!({
            "wildcard": {
                settings.mapping.message.as_str(): format!("{}*", id.to_lowercase())
            }
        })
    }
}

fn truncate(
    text: &str,
    max: usize
) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::model::TimeWindow;
    use crate::settings::FieldMapping;

    fn settings_for(server: &MockServer) -> SearchSettings {
        let address = server.address();
        SearchSettings {
            host: address.ip().to_string(),
            port: address.port(),
            username: Some("admin".to_string()),
            password: Some("admin".to_string()),
            index: "mail-logs".to_string(),
            time_zone: "+03:00".to_string(),
            mapping: FieldMapping {
                facility: Some("log.syslog.facility.name".to_string()),
                service: Some("log.syslog.appname".to_string()),
                ..FieldMapping::default()
            },
            ..SearchSettings::default()
        }
    }

    fn hit(
        ts: &str,
        message: &str
    ) -> Value {
        json!({
            "_source": {
                "@timestamp": ts,
                "message": message,
                "host": { "name": "mx1" },
                "log": { "syslog": { "appname": "postfix/smtp" } }
            }
        })
    }

    #[test]
    fn builds_window_keyword_and_host_filters() {
        let settings = SearchSettings {
            index: "mail-logs".to_string(),
            time_zone: "+03:00".to_string(),
            mapping: FieldMapping {
                facility: Some("log.syslog.facility.name".to_string()),
                ..FieldMapping::default()
            },
            ..SearchSettings::default()
        };
        let time = NaiveDateTime::parse_from_str("2025-02-01 10:00:00", "%Y-%m-%d %H:%M:%S")
            .expect("time");
        let query = LogQuery::for_keywords(
            vec!["Bob@Example.org".to_string()],
            Some(TimeWindow::Around {
                time,
                range: chrono::TimeDelta::try_hours(1).expect("hour"),
            }),
        );
        let offset = parse_utc_offset("+03:00").expect("offset");

        let body = build_query(&settings, Some("mx1"), &query, offset);
        assert_eq!(
            body,
            json!({
                "from": 0,
                "size": 1000,
                "track_total_hits": true,
                "sort": [{ "@timestamp": { "order": "asc" } }],
                "query": { "bool": { "must": [
                    { "match": { "log.syslog.facility.name": "mail" } },
                    { "match": { "host.name": "mx1" } },
                    { "range": { "@timestamp": {
                        "gte": "2025-02-01T09:00:00",
                        "lte": "2025-02-01T11:00:00",
                        "time_zone": "+03:00"
                    } } },
                    { "wildcard": { "message": "*bob@example.org*" } }
                ] } }
            })
        );
    }

    #[test]
    fn identifier_filters_follow_the_mapping() {
        let mut settings = SearchSettings::default();
        let offset = parse_utc_offset("+00:00").expect("offset");
        let single = LogQuery::for_mail_id("AAA111");

        let body = build_query(&settings, None, &single, offset);
        assert_eq!(
            body.pointer("/query/bool/must/0"),
            Some(&json!({ "wildcard": { "message": "aaa111*" } }))
        );

        settings.mapping.queueid = Some("postfix.queueid".to_string());
        let batch = LogQuery {
            mail_ids: vec!["AAA111".to_string(), "BBB222".to_string()],
            ..LogQuery::default()
        };
        let body = build_query(&settings, None, &batch, offset);
        assert_eq!(
            body.pointer("/query/bool/must/0"),
            Some(&json!({ "terms": { "postfix.queueid": ["AAA111", "BBB222"] } }))
        );
    }

    #[tokio::test]
    async fn parses_hits_and_filters_exact_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mail-logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": { "hits": [
                    hit("2025-02-01T10:00:00Z", "AAA111: to=<bob@example.org>, status=sent"),
                    hit("2025-02-01T10:00:01Z", "AAA1119: removed"),
                ] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = SearchSource::new(Some("mx1"), &settings_for(&server))
            .expect("source should build");
        let entries = source
            .query(&LogQuery::for_mail_id("AAA111"))
            .await
            .expect("query should succeed");

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].service, "postfix/smtp");
        assert_eq!(entries[0].message, "to=<bob@example.org>, status=sent");

        let requests = server.received_requests().await.expect("recorded requests");
        let sent: Value =
            serde_json::from_slice(&requests[0].body).expect("json request body");
        assert_eq!(
            sent.pointer("/query/bool/must/1"),
            Some(&json!({ "match": { "host.name": "mx1" } }))
        );
        assert!(requests[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn pages_until_the_reported_total() {
        let server = MockServer::start().await;
        for (from, page) in [
            (0, vec![
                hit("2025-02-01T10:00:00Z", "AAA111: from=<alice@example.com>"),
                hit("2025-02-01T10:00:01Z", "AAA111: removed"),
            ]),
            (2, vec![
                hit("2025-02-01T10:00:02Z", "BBB222: from=<carol@example.com>"),
                hit("2025-02-01T10:00:03Z", "BBB222: removed"),
            ]),
            (4, vec![hit("2025-02-01T10:00:04Z", "CCC333: from=<dave@example.com>")]),
        ] {
            Mock::given(method("POST"))
                .and(path("/mail-logs/_search"))
                .and(body_partial_json(json!({ "from": from })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "hits": { "total": { "value": 5, "relation": "eq" }, "hits": page }
                })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let settings = SearchSettings { max_hits: 2, ..settings_for(&server) };
        let source = SearchSource::new(None, &settings).expect("source should build");
        let entries = source.query(&LogQuery::default()).await.expect("query should succeed");

        let ids: Vec<Option<&str>> =
            entries.iter().map(|entry| entry.mail_id.as_deref()).collect();
        assert_eq!(
            ids,
            vec![Some("AAA111"), Some("AAA111"), Some("BBB222"), Some("BBB222"), Some("CCC333")]
        );
    }

    #[tokio::test]
    async fn stops_at_the_result_window() {
        let server = MockServer::start().await;
        let page: Vec<Value> = (0..10_000)
            .map(|_| hit("2025-02-01T10:00:00Z", "AAA111: removed"))
            .collect();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": { "total": { "value": 25_000, "relation": "eq" }, "hits": page }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = SearchSettings { max_hits: 10_000, ..settings_for(&server) };
        let source = SearchSource::new(None, &settings).expect("source should build");
        let entries = source.query(&LogQuery::default()).await.expect("query should succeed");

        assert_eq!(entries.len(), 10_000);
    }

    #[tokio::test]
    async fn maps_http_status_to_error_kinds() {
        for (status, code, hint) in [
            (401, "CONNECTION_AUTH", "username and password"),
            (403, "QUERY", "permission"),
            (404, "QUERY", "index name"),
            (500, "QUERY", "server logs"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("{}"))
                .mount(&server)
                .await;

            let source = SearchSource::new(Some("mx1"), &settings_for(&server))
                .expect("source should build");
            let err = source
                .query(&LogQuery::default())
                .await
                .expect_err("error status should fail");
            assert_eq!(err.code(), code, "status {status}");
            assert!(err.suggestion().contains(hint), "status {status}: {}", err.suggestion());
        }
    }

    #[tokio::test]
    async fn unreachable_node_is_a_network_error() {
        let settings = SearchSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            index: "mail-logs".to_string(),
            ..SearchSettings::default()
        };
        let err = SearchSource::connect(None, &settings)
            .await
            .expect_err("nothing listens on port 1");
        assert_eq!(err.code(), "CONNECTION_NETWORK");
    }

    #[test]
    fn host_filter_can_be_dropped_once() {
        let source = SearchSource::new(Some("mx1"), &SearchSettings::default())
            .expect("source should build");
        let relaxed = source.without_host_filter().expect("host filter removed");
        assert_eq!(relaxed.host(), None);
        assert!(relaxed.without_host_filter().is_none());
    }
}
