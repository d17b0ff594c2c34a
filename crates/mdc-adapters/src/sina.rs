use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use encoding_rs::GBK;
use mdc_core::{bare_symbol, EntityKind, Market, RawPayload, RawRow, SectorBoard, Target};
use mdc_storage::{HttpFetcher, ProviderFailure};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::{json_at, json_rows, unsupported, Provider};

const SOURCE_ID: &str = "sina";
const ROLL_SOURCE_ID: &str = "sina-roll";
const HQ_BASE: &str = "https://hq.sinajs.cn";
const SECTOR_BASE: &str = "https://vip.stock.finance.sina.com.cn";
const ROLL_BASE: &str = "https://feed.mix.sina.com.cn";
const REFERER: &str = "https://finance.sina.com.cn/";

/// Minimum comma-separated values in a complete `hq_str` quote line.
const QUOTE_MIN_FIELDS: usize = 32;
const SECTOR_FIELDS: [&str; 13] = [
    "code",
    "name",
    "company_count",
    "avg_price",
    "change",
    "change_pct",
    "volume",
    "amount",
    "lead_symbol",
    "lead_change_pct",
    "lead_price",
    "lead_change",
    "lead_name",
];

/// Sina serves its quote and board feeds in GBK.
fn decode_gbk(body: &[u8]) -> String {
    let (text, _, had_errors) = GBK.decode(body);
    if had_errors {
        warn!("sina payload contained bytes outside GBK");
    }
    text.into_owned()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse `var hq_str_sh600584="name,open,prev_close,price,...";` into a row.
pub(crate) fn parse_quote_line(line: &str) -> Result<Option<RawRow>, ProviderFailure> {
    let Some(rest) = line.trim().strip_prefix("var hq_str_") else {
        return Ok(None);
    };
    let (symbol, quoted) = rest
        .split_once('=')
        .ok_or_else(|| ProviderFailure::malformed("quote line without '='"))?;
    let inner = quoted.trim().trim_end_matches(';').trim_matches('"');
    if inner.is_empty() {
        return Err(ProviderFailure::UnsupportedTarget {
            target: symbol.to_string(),
        });
    }

    let values: Vec<&str> = inner.split(',').collect();
    if values.len() < QUOTE_MIN_FIELDS {
        return Err(ProviderFailure::malformed(format!(
            "quote line for {symbol} has {} fields",
            values.len()
        )));
    }

    let number = |idx: usize| values[idx].trim().parse::<f64>().ok();
    let mut row = Map::new();
    row.insert("symbol".into(), JsonValue::from(symbol));
    row.insert("name".into(), JsonValue::from(values[0].trim()));
    for (key, idx) in [("open", 1), ("prev_close", 2), ("price", 3), ("high", 4), ("low", 5)] {
        if let Some(v) = number(idx) {
            row.insert(key.into(), JsonValue::from(v));
        }
    }
    row.insert("volume".into(), JsonValue::from(values[8].trim()));
    row.insert("amount".into(), JsonValue::from(values[9].trim()));
    row.insert(
        "datetime".into(),
        JsonValue::from(format!("{} {}", values[30].trim(), values[31].trim())),
    );

    if let (Some(price), Some(prev_close)) = (number(3), number(2)) {
        let change = price - prev_close;
        row.insert("change".into(), JsonValue::from(round2(change)));
        if prev_close > 0.0 {
            row.insert(
                "change_pct".into(),
                JsonValue::from(round2(change / prev_close * 100.0)),
            );
        }
    }
    Ok(Some(row))
}

/// Parse the `var S_Finance_bankuai_* = {...}` board object.
pub(crate) fn parse_sector_object(text: &str) -> Result<Vec<RawRow>, ProviderFailure> {
    let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) else {
        return Err(ProviderFailure::malformed("sector feed without object literal"));
    };
    if close < open {
        return Err(ProviderFailure::malformed("sector feed without object literal"));
    }
    let object: Map<String, JsonValue> = serde_json::from_str(&text[open..=close])
        .map_err(|err| ProviderFailure::malformed(format!("sector feed json: {err}")))?;

    let mut rows = Vec::with_capacity(object.len());
    for value in object.values() {
        let Some(line) = value.as_str() else { continue };
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() < SECTOR_FIELDS.len() {
            continue;
        }
        let row: RawRow = SECTOR_FIELDS
            .iter()
            .zip(parts)
            .map(|(key, value)| (key.to_string(), JsonValue::from(value.trim())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Real-time quote from `hq.sinajs.cn`.
#[derive(Debug, Clone)]
pub struct SinaQuoteProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl SinaQuoteProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| HQ_BASE.to_string()),
        }
    }
}

#[async_trait]
impl Provider for SinaQuoteProvider {
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
        let code = format!("{}{}", Market::from_symbol(symbol), bare_symbol(symbol));
        let url = format!("{}/list={code}", self.base_url.trim_end_matches('/'));
        let resp = self.http.fetch_bytes(SOURCE_ID, &url, Some(REFERER)).await?;

        let text = decode_gbk(&resp.body);
        let mut rows = Vec::new();
        for line in text.lines() {
            if let Some(row) = parse_quote_line(line)? {
                rows.push(row);
            }
        }
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }

        Ok(RawPayload::new(SOURCE_ID, EntityKind::Quote, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

/// Concept and industry board snapshots. The feed is unsorted and complete;
/// ranking and truncation happen downstream.
#[derive(Debug, Clone)]
pub struct SinaSectorProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl SinaSectorProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| SECTOR_BASE.to_string()),
        }
    }
}

#[async_trait]
impl Provider for SinaSectorProvider {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::Sector
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        let Target::TopSectors { board, .. } = target else {
            return Err(unsupported(target));
        };
        let endpoint = match board {
            SectorBoard::Concept => "q/view/newFLJK.php?param=class",
            SectorBoard::Industry => "q/view/newSinaHy.php",
        };
        let url = format!("{}/{endpoint}", self.base_url.trim_end_matches('/'));
        let resp = self.http.fetch_bytes(SOURCE_ID, &url, Some(REFERER)).await?;

        let rows = parse_sector_object(&decode_gbk(&resp.body))?;
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }

        Ok(RawPayload::new(SOURCE_ID, EntityKind::Sector, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

/// Market-wide rolling headlines from the Sina finance feed.
#[derive(Debug, Clone)]
pub struct SinaRollNewsProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_size: usize,
}

impl SinaRollNewsProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or_else(|| ROLL_BASE.to_string()),
            page_size: 50,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }
}

#[async_trait]
impl Provider for SinaRollNewsProvider {
    fn source_id(&self) -> &str {
        ROLL_SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::News
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        if !matches!(target, Target::Headlines) {
            return Err(unsupported(target));
        }
        let url = format!(
            "{}/api/roll/get?pageid=153&lid=2516&num={}&page=1",
            self.base_url.trim_end_matches('/'),
            self.page_size
        );
        let resp = self
            .http
            .fetch_bytes(ROLL_SOURCE_ID, &url, Some(REFERER))
            .await?;
        let value: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|err| ProviderFailure::malformed(format!("sina roll json: {err}")))?;
        let rows = json_at(&value, &["result", "data"])
            .map(json_rows)
            .unwrap_or_default();
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }

        Ok(RawPayload::new(ROLL_SOURCE_ID, EntityKind::News, Utc::now())
            .for_target(target)
            .with_body(resp.content_type, resp.body)
            .with_rows(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_storage::HttpClientConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const QUOTE_LINE: &str = "var hq_str_sh600584=\"长电科技,40.50,40.43,41.28,41.60,40.10,41.27,41.28,53211800,2190512384.00,100,41.27,200,41.26,300,41.25,400,41.24,500,41.23,100,41.28,200,41.29,300,41.30,400,41.31,500,41.32,2026-03-02,10:00:00,00\";";

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    #[test]
    fn quote_line_computes_change_from_previous_close() {
        let row = parse_quote_line(QUOTE_LINE).unwrap().expect("row");
        assert_eq!(row["symbol"], "sh600584");
        assert_eq!(row["name"], "长电科技");
        assert_eq!(row["price"], 41.28);
        assert_eq!(row["change"], 0.85);
        assert_eq!(row["change_pct"], 2.1);
        assert_eq!(row["volume"], "53211800");
        assert_eq!(row["datetime"], "2026-03-02 10:00:00");
    }

    #[test]
    fn empty_quote_line_blames_the_target() {
        let err = parse_quote_line("var hq_str_sh999999=\"\";").unwrap_err();
        assert!(err.blames_target());
        assert!(parse_quote_line("").unwrap().is_none());
        assert!(matches!(
            parse_quote_line("var hq_str_sh600584=\"a,b,c\";"),
            Err(ProviderFailure::Malformed { .. })
        ));
    }

    #[test]
    fn sector_object_rows_are_split_by_position() {
        let text = r#"var S_Finance_bankuai_class = {"gn_hwqc":"gn_hwqc,华为汽车,52,18.61,0.45,2.48,912345678,12345678901,sz002594,6.12,231.5,13.35,比亚迪","bad":"x,y"};"#;
        let rows = parse_sector_object(text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["code"], "gn_hwqc");
        assert_eq!(rows[0]["name"], "华为汽车");
        assert_eq!(rows[0]["change_pct"], "2.48");
        assert_eq!(rows[0]["lead_name"], "比亚迪");
    }

    #[tokio::test]
    async fn quote_provider_decodes_gbk() {
        let server = MockServer::start().await;
        let (encoded, _, _) = GBK.encode(QUOTE_LINE);
        Mock::given(method("GET"))
            .and(path("/list=sh600584"))
            .and(header("referer", REFERER))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(encoded.into_owned()))
            .mount(&server)
            .await;

        let provider = SinaQuoteProvider::new(fetcher(), Some(server.uri()));
        let payload = provider.fetch(&Target::symbol("600584")).await.unwrap();
        assert_eq!(payload.rows.len(), 1);
        assert_eq!(payload.rows[0]["name"], "长电科技");
    }

    #[tokio::test]
    async fn roll_news_serves_headlines_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/roll/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"status": {"code": 0}, "data": [
                    {"title": "A股三大指数集体高开", "url": "https://finance.sina.com.cn/a.shtml",
                     "intro": "沪指涨0.5%", "media_name": "新浪财经", "ctime": "1772416800"}
                ]}
            })))
            .mount(&server)
            .await;

        let provider = SinaRollNewsProvider::new(fetcher(), Some(server.uri()));
        let payload = provider.fetch(&Target::Headlines).await.unwrap();
        assert_eq!(payload.source_id, "sina-roll");
        assert_eq!(payload.rows[0]["media_name"], "新浪财经");

        let err = provider.fetch(&Target::symbol("600584")).await.unwrap_err();
        assert!(err.blames_target());
    }
}
