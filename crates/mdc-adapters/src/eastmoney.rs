use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mdc_core::{bare_symbol, EntityKind, Market, RawPayload, RawRow, SectorBoard, Target};
use mdc_storage::{HttpFetcher, ProviderFailure};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_at, json_rows, strip_jsonp, strip_markup, unsupported, Provider};

const SOURCE_ID: &str = "eastmoney";
const PUSH_BASE: &str = "https://push2.eastmoney.com";
const SEARCH_BASE: &str = "https://search-api-web.eastmoney.com";
const REFERER: &str = "https://quote.eastmoney.com/";

const QUOTE_FIELDS: &str = "f2,f3,f4,f5,f6,f12,f14,f124";
const SECTOR_FIELDS: &str = "f3,f8,f12,f14,f20,f104,f105,f128,f136";

/// `secid` used by the push API: `1.` for Shanghai, `0.` otherwise.
fn secid(symbol: &str) -> String {
    let prefix = match Market::from_symbol(symbol) {
        Market::Sh => 1,
        Market::Sz | Market::Bj => 0,
    };
    format!("{prefix}.{}", bare_symbol(symbol))
}

fn parse_json(body: &[u8]) -> Result<JsonValue, ProviderFailure> {
    let text = String::from_utf8_lossy(body);
    serde_json::from_str(strip_jsonp(&text))
        .map_err(|err| ProviderFailure::malformed(format!("eastmoney json: {err}")))
}

/// Rows under `data.diff`; a null `data` means the target has no listing.
fn diff_rows(value: &JsonValue) -> Result<Vec<RawRow>, ProviderFailure> {
    match json_at(value, &["data", "diff"]) {
        Some(diff) => Ok(json_rows(diff)),
        None => Err(ProviderFailure::EmptyPayload),
    }
}

/// Real-time quote for one symbol via the `ulist.np` endpoint.
#[derive(Debug, Clone)]
pub struct EastmoneyQuoteProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl EastmoneyQuoteProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| PUSH_BASE.to_string()),
        }
    }
}

#[async_trait]
impl Provider for EastmoneyQuoteProvider {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Quote
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        let Target::Symbol { symbol } = target else {
            return Err(unsupported(target));
        };
        let url = format!(
            "{}/api/qt/ulist.np/get?fltt=2&invt=2&fields={QUOTE_FIELDS}&secids={}",
            self.base_url.trim_end_matches('/'),
            secid(symbol)
        );
        let resp = self.http.fetch_bytes(SOURCE_ID, &url, Some(REFERER)).await?;
        let rows = diff_rows(&parse_json(&resp.body)?)?;
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }
        Ok(RawPayload::new(SOURCE_ID, EntityKind::Quote, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

/// Board ranking sorted by change percent, via the `clist` endpoint.
#[derive(Debug, Clone)]
pub struct EastmoneySectorProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl EastmoneySectorProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| PUSH_BASE.to_string()),
        }
    }
}

#[async_trait]
impl Provider for EastmoneySectorProvider {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Sector
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        let Target::TopSectors { board, top_n } = target else {
            return Err(unsupported(target));
        };
        let board_filter = match board {
            SectorBoard::Concept => "m:90+t:3",
            SectorBoard::Industry => "m:90+t:2",
        };
        let url = format!(
            "{}/api/qt/clist/get?pn=1&pz={}&po=1&np=1&fltt=2&invt=2&fid=f3&fs={board_filter}&fields={SECTOR_FIELDS}",
            self.base_url.trim_end_matches('/'),
            (*top_n).max(1)
        );
        let resp = self.http.fetch_bytes(SOURCE_ID, &url, Some(REFERER)).await?;
        let rows = diff_rows(&parse_json(&resp.body)?)?;
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }
        debug!(%board, rows = rows.len(), "eastmoney sector rows");
        Ok(RawPayload::new(SOURCE_ID, EntityKind::Sector, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

/// Per-stock news search.
#[derive(Debug, Clone)]
pub struct EastmoneyNewsProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_size: usize,
}

impl EastmoneyNewsProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| SEARCH_BASE.to_string()),
            page_size: 20,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl Provider for EastmoneyNewsProvider {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::News
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        let Target::Symbol { symbol } = target else {
            return Err(unsupported(target));
        };
        let code = bare_symbol(symbol);
        let param = json!({
            "uid": "",
            "keyword": code,
            "type": ["cmsArticleWebOld"],
            "client": "web",
            "clientType": "web",
            "clientVersion": "curr",
            "param": {
                "cmsArticleWebOld": {
                    "searchScope": "default",
                    "sort": "default",
                    "pageIndex": 1,
                    "pageSize": self.page_size,
                    "preTag": "<em>",
                    "postTag": "</em>"
                }
            }
        });
        let url = reqwest::Url::parse_with_params(
            &format!("{}/search/jsonp", self.base_url.trim_end_matches('/')),
            &[("cb", "jQuery"), ("param", param.to_string().as_str())],
        )
        .map_err(|err| ProviderFailure::Rejected {
            message: err.to_string(),
        })?;

        let resp = self
            .http
            .fetch_bytes(SOURCE_ID, url.as_str(), Some("https://so.eastmoney.com/"))
            .await?;
        let value = parse_json(&resp.body)?;
        let articles = json_at(&value, &["result", "cmsArticleWebOld"])
            .map(json_rows)
            .unwrap_or_default();

        let rows: Vec<RawRow> = articles
            .into_iter()
            .map(|mut row| {
                for key in ["title", "content"] {
                    if let Some(JsonValue::String(text)) = row.get(key) {
                        let cleaned = strip_markup(text);
                        row.insert(key.to_string(), JsonValue::String(cleaned));
                    }
                }
                row.insert("code".to_string(), JsonValue::String(code.clone()));
                row
            })
            .collect();
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }

        Ok(RawPayload::new(SOURCE_ID, EntityKind::News, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_storage::HttpClientConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    #[test]
    fn secid_follows_exchange() {
        assert_eq!(secid("600584"), "1.600584");
        assert_eq!(secid("sz000001"), "0.000001");
        assert_eq!(secid("300750"), "0.300750");
    }

    #[tokio::test]
    async fn quote_provider_reads_diff_rows() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/qt/ulist.np/get"))
            .and(query_param("secids", "1.600584"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rc": 0,
                "data": {"total": 1, "diff": [
                    {"f2": 41.28, "f3": 2.11, "f4": 0.85, "f5": 532118, "f6": 2190512384.0,
                     "f12": "600584", "f14": "长电科技", "f124": 1772416800}
                ]}
            })))
            .mount(&server)
            .await;

        let provider = EastmoneyQuoteProvider::new(fetcher(), Some(server.uri()));
        let payload = provider.fetch(&Target::symbol("600584")).await.unwrap();
        assert_eq!(payload.source_id, "eastmoney");
        assert_eq!(payload.rows.len(), 1);
        assert_eq!(payload.rows[0]["f12"], "600584");
        assert!(!payload.body.is_empty());
    }

    #[tokio::test]
    async fn null_data_is_an_empty_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/qt/ulist.np/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rc": 0, "data": null})))
            .mount(&server)
            .await;

        let provider = EastmoneyQuoteProvider::new(fetcher(), Some(server.uri()));
        let err = provider.fetch(&Target::symbol("600584")).await.unwrap_err();
        assert_eq!(err, ProviderFailure::EmptyPayload);
    }

    #[tokio::test]
    async fn sector_provider_filters_by_board() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/qt/clist/get"))
            .and(query_param("fs", "m:90 t:2"))
            .and(query_param("pz", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"total": 86, "diff": [
                    {"f12": "BK0475", "f14": "银行", "f3": 1.52, "f8": 0.41, "f20": 1.2e13,
                     "f104": 40, "f105": 2, "f128": "招商银行", "f136": 3.1},
                    {"f12": "BK0896", "f14": "白酒", "f3": 1.1, "f8": 0.9, "f20": 4.1e12,
                     "f104": 18, "f105": 1, "f128": "贵州茅台", "f136": 2.2}
                ]}
            })))
            .mount(&server)
            .await;

        let provider = EastmoneySectorProvider::new(fetcher(), Some(server.uri()));
        let target = Target::TopSectors {
            board: SectorBoard::Industry,
            top_n: 2,
        };
        let payload = provider.fetch(&target).await.unwrap();
        assert_eq!(payload.rows.len(), 2);
        assert_eq!(payload.target, Some(target));

        let err = provider.fetch(&Target::Headlines).await.unwrap_err();
        assert!(err.blames_target());
    }

    #[tokio::test]
    async fn news_provider_unwraps_jsonp_and_cleans_titles() {
        let server = MockServer::start().await;
        let body = r#"jQuery({"code":0,"result":{"cmsArticleWebOld":[
            {"date":"2026-03-02 09:15:00","title":"<em>长电科技</em>发布年报","content":"净利润增长","mediaName":"证券时报","url":"http://finance.eastmoney.com/a/1.html"},
            {"date":"2026-03-02 10:05:00","title":"<em>长电科技</em>&amp;华为 &quot;合作&quot;","content":"","mediaName":"证券时报","url":"http://finance.eastmoney.com/a/2.html"}
        ]}})"#;
        Mock::given(method("GET"))
            .and(path("/search/jsonp"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let provider = EastmoneyNewsProvider::new(fetcher(), Some(server.uri()));
        let payload = provider.fetch(&Target::symbol("sh600584")).await.unwrap();
        assert_eq!(payload.rows.len(), 2);
        assert_eq!(payload.rows[0]["title"], "长电科技发布年报");
        assert_eq!(payload.rows[0]["code"], "600584");
        assert_eq!(payload.rows[1]["title"], "长电科技&华为 \"合作\"");
    }
}
