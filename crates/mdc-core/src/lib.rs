//! Core domain model for the market data collector: entity kinds, collection
//! targets, raw provider payloads and the canonical record shapes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, SecondsFormat, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

/// Offset used by mainland exchanges and by most provider timestamps.
pub const CHINA_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Canonical record category being collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Quote,
    Sector,
    News,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Quote, EntityKind::Sector, EntityKind::News];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Sector => "sector",
            Self::News => "news",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quote" | "quotes" => Ok(Self::Quote),
            "sector" | "sectors" => Ok(Self::Sector),
            "news" => Ok(Self::News),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Listing venue of an A-share symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    Sh,
    Sz,
    Bj,
}

impl Market {
    /// Infer the venue from a bare six-digit code (`600584` → `sh`).
    ///
    /// Accepts codes already carrying a venue prefix (`sz000001`).
    pub fn from_symbol(symbol: &str) -> Self {
        if let Some(market) = Self::explicit(symbol) {
            return market;
        }
        match symbol.trim().chars().next() {
            Some('6') | Some('9') => Self::Sh,
            Some('4') | Some('8') => Self::Bj,
            _ => Self::Sz,
        }
    }

    /// Venue named by a `sh`/`sz`/`bj` prefix, if the code carries one.
    pub fn explicit(symbol: &str) -> Option<Self> {
        let lower = symbol.trim().to_ascii_lowercase();
        [("sh", Self::Sh), ("sz", Self::Sz), ("bj", Self::Bj)]
            .into_iter()
            .find(|(prefix, _)| lower.starts_with(prefix))
            .map(|(_, market)| market)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sh => "sh",
            Self::Sz => "sz",
            Self::Bj => "bj",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip a venue prefix, leaving the bare exchange code.
pub fn bare_symbol(symbol: &str) -> String {
    let trimmed = symbol.trim();
    let lower = trimmed.to_ascii_lowercase();
    for prefix in ["sh", "sz", "bj"] {
        if lower.starts_with(prefix) && trimmed.len() > 2 {
            return trimmed[2..].to_string();
        }
    }
    trimmed.to_string()
}

/// Sector taxonomy a ranking belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorBoard {
    Concept,
    Industry,
}

impl SectorBoard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "concept",
            Self::Industry => "industry",
        }
    }
}

impl fmt::Display for SectorBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work inside a collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// A followed stock: its quote, or its news feed.
    Symbol { symbol: String },
    /// The top-N ranking of one sector board, collected as a single target.
    TopSectors { board: SectorBoard, top_n: usize },
    /// Market-wide headline feed.
    Headlines,
}

impl Target {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self::Symbol {
            symbol: symbol.into(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Symbol { symbol } => symbol.clone(),
            Self::TopSectors { board, top_n } => format!("{board}-top{top_n}"),
            Self::Headlines => "headlines".to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// One provider row keyed by the provider's own field names.
pub type RawRow = Map<String, JsonValue>;

/// Unnormalized result of a single provider call, tagged with the producing source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_id: String,
    pub kind: EntityKind,
    pub fetched_at: DateTime<Utc>,
    pub content_type: String,
    /// Target the payload answers, when the provider was asked for one.
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default, skip_serializing)]
    pub body: Vec<u8>,
    pub rows: Vec<RawRow>,
}

impl RawPayload {
    pub fn new(source_id: impl Into<String>, kind: EntityKind, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            fetched_at,
            content_type: "application/json".to_string(),
            target: None,
            body: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn for_target(mut self, target: &Target) -> Self {
        self.target = Some(target.clone());
        self
    }

    pub fn with_rows(mut self, rows: Vec<RawRow>) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        self.content_type = content_type.into();
        self.body = body;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    pub market: Market,
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub last_price: f64,
    pub change_amount: Option<f64>,
    pub change_percent: Option<f64>,
    /// Shares, not lots.
    pub volume: Option<u64>,
    pub turnover: Option<f64>,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorEntry {
    pub board: SectorBoard,
    pub sector_name: String,
    pub sector_code: String,
    /// 1-based; zero until the orchestrator ranks the batch.
    pub rank: u32,
    pub change_percent: f64,
    pub total_market_cap: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub advancing_count: Option<u32>,
    pub declining_count: Option<u32>,
    pub lead_stock_name: Option<String>,
    pub lead_stock_change_percent: Option<f64>,
    pub polled_at: DateTime<Utc>,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub fingerprint: String,
    pub symbol: Option<String>,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    /// Outlet that published the article, as reported by the provider.
    pub source_name: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_id: String,
}

impl NewsItem {
    pub fn compute_fingerprint(&self) -> String {
        news_fingerprint(&self.title, &self.url, self.published_at)
    }
}

/// Stable identity of a news article: SHA-256 over `title|url|published`.
pub fn news_fingerprint(title: &str, url: &str, published_at: DateTime<Utc>) -> String {
    let published = published_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut hasher = Sha256::new();
    hasher.update(title.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(url.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(published.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalized record, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Quote(QuoteRecord),
    Sector(SectorEntry),
    News(NewsItem),
}

impl CanonicalRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Quote(_) => EntityKind::Quote,
            Self::Sector(_) => EntityKind::Sector,
            Self::News(_) => EntityKind::News,
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::Quote(q) => &q.source_id,
            Self::Sector(s) => &s.source_id,
            Self::News(n) => &n.source_id,
        }
    }

    /// Identity used for idempotent storage: time series rows key on
    /// (entity, polling timestamp), news keys on its fingerprint.
    ///
    /// Quote identity includes the venue: `sh000001` and `sz000001` share a
    /// bare code.
    pub fn upsert_key(&self) -> String {
        match self {
            Self::Quote(q) => format!("{}:{}:{}", q.market, q.symbol, q.timestamp.timestamp()),
            Self::Sector(s) => format!("{}:{}:{}", s.board, s.sector_code, s.polled_at.timestamp()),
            Self::News(n) => n.fingerprint.clone(),
        }
    }
}

pub fn china_offset() -> FixedOffset {
    FixedOffset::east_opt(CHINA_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Whether `now` falls inside an A-share continuous trading session
/// (09:30-11:30 and 13:00-15:00 China time, Monday to Friday).
pub fn is_trading_session(now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&china_offset());
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let t = local.time();
    let within = |start: (u32, u32), end: (u32, u32)| {
        match (
            NaiveTime::from_hms_opt(start.0, start.1, 0),
            NaiveTime::from_hms_opt(end.0, end.1, 0),
        ) {
            (Some(s), Some(e)) => t >= s && t <= e,
            _ => false,
        }
    };
    within((9, 30), (11, 30)) || within((13, 0), (15, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn market_is_inferred_from_code_prefix() {
        assert_eq!(Market::from_symbol("600584"), Market::Sh);
        assert_eq!(Market::from_symbol("000001"), Market::Sz);
        assert_eq!(Market::from_symbol("300750"), Market::Sz);
        assert_eq!(Market::from_symbol("830799"), Market::Bj);
        assert_eq!(Market::from_symbol("sz600000"), Market::Sz);
        assert_eq!(Market::explicit("SH000001"), Some(Market::Sh));
        assert_eq!(Market::explicit("000001"), None);
        assert_eq!(bare_symbol("sh600584"), "600584");
        assert_eq!(bare_symbol("600584"), "600584");
    }

    #[test]
    fn fingerprint_ignores_provider_and_is_stable() {
        let published = ts(2026, 3, 2, 2, 30);
        let a = news_fingerprint("Q3 earnings beat", "https://news.example/a", published);
        let b = news_fingerprint(" Q3 earnings beat ", "https://news.example/a", published);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let later = news_fingerprint("Q3 earnings beat", "https://news.example/a", ts(2026, 3, 2, 2, 31));
        assert_ne!(a, later);
    }

    #[test]
    fn upsert_keys_follow_entity_identity() {
        let polled = ts(2026, 3, 2, 2, 0);
        let quote = CanonicalRecord::Quote(QuoteRecord {
            symbol: "600584".into(),
            market: Market::Sh,
            name: None,
            timestamp: polled,
            last_price: 41.28,
            change_amount: None,
            change_percent: None,
            volume: None,
            turnover: None,
            source_id: "eastmoney".into(),
        });
        assert_eq!(quote.kind(), EntityKind::Quote);
        assert_eq!(quote.upsert_key(), format!("sh:600584:{}", polled.timestamp()));
        assert_eq!(quote.source_id(), "eastmoney");
    }

    #[test]
    fn quote_keys_keep_index_and_stock_with_same_code_apart() {
        let polled = ts(2026, 3, 2, 2, 0);
        let quote = |market| {
            CanonicalRecord::Quote(QuoteRecord {
                symbol: "000001".into(),
                market,
                name: None,
                timestamp: polled,
                last_price: 1.0,
                change_amount: None,
                change_percent: None,
                volume: None,
                turnover: None,
                source_id: "eastmoney".into(),
            })
        };
        assert_ne!(quote(Market::Sh).upsert_key(), quote(Market::Sz).upsert_key());
    }

    #[test]
    fn canonical_records_serialize_with_kind_tag() {
        let record = CanonicalRecord::News(NewsItem {
            fingerprint: "abc".into(),
            symbol: Some("600584".into()),
            title: "t".into(),
            summary: None,
            url: "u".into(),
            source_name: None,
            published_at: ts(2026, 3, 2, 2, 0),
            source_id: "sina-roll".into(),
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "news");
        let back: CanonicalRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn trading_session_uses_china_time() {
        // Monday 2026-03-02 10:00 +08:00 == 02:00 UTC
        assert!(is_trading_session(ts(2026, 3, 2, 2, 0)));
        // lunch break 12:00 +08:00
        assert!(!is_trading_session(ts(2026, 3, 2, 4, 0)));
        // Saturday
        assert!(!is_trading_session(ts(2026, 3, 7, 2, 0)));
    }

    #[test]
    fn entity_kind_parses_plural_forms() {
        assert_eq!("quotes".parse::<EntityKind>().unwrap(), EntityKind::Quote);
        assert_eq!("Sector".parse::<EntityKind>().unwrap(), EntityKind::Sector);
        assert!("bonds".parse::<EntityKind>().is_err());
    }
}
