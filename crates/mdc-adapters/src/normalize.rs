//! Static mapping tables from provider row shapes to canonical records.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use mdc_core::{
    bare_symbol, news_fingerprint, CanonicalRecord, EntityKind, Market, NewsItem, QuoteRecord,
    RawPayload, RawRow, SectorBoard, SectorEntry, Target, CHINA_UTC_OFFSET_SECS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

/// Canonical field a provider column can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Symbol,
    Name,
    Timestamp,
    LastPrice,
    ChangeAmount,
    ChangePercent,
    Volume,
    Turnover,
    SectorName,
    SectorCode,
    TotalMarketCap,
    TurnoverRate,
    AdvancingCount,
    DecliningCount,
    LeadStockName,
    LeadStockChangePercent,
    Title,
    Summary,
    Url,
    SourceName,
    PublishedAt,
}

impl CanonicalField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Symbol => "symbol",
            Self::Name => "name",
            Self::Timestamp => "timestamp",
            Self::LastPrice => "last_price",
            Self::ChangeAmount => "change_amount",
            Self::ChangePercent => "change_percent",
            Self::Volume => "volume",
            Self::Turnover => "turnover",
            Self::SectorName => "sector_name",
            Self::SectorCode => "sector_code",
            Self::TotalMarketCap => "total_market_cap",
            Self::TurnoverRate => "turnover_rate",
            Self::AdvancingCount => "advancing_count",
            Self::DecliningCount => "declining_count",
            Self::LeadStockName => "lead_stock_name",
            Self::LeadStockChangePercent => "lead_stock_change_percent",
            Self::Title => "title",
            Self::Summary => "summary",
            Self::Url => "url",
            Self::SourceName => "source_name",
            Self::PublishedAt => "published_at",
        }
    }

    /// Fields each entity kind reads, in record order.
    fn for_kind(kind: EntityKind) -> &'static [CanonicalField] {
        use CanonicalField::*;
        match kind {
            EntityKind::Quote => &[
                Symbol,
                Name,
                Timestamp,
                LastPrice,
                ChangeAmount,
                ChangePercent,
                Volume,
                Turnover,
            ],
            EntityKind::Sector => &[
                SectorName,
                SectorCode,
                ChangePercent,
                TotalMarketCap,
                TurnoverRate,
                AdvancingCount,
                DecliningCount,
                LeadStockName,
                LeadStockChangePercent,
            ],
            EntityKind::News => &[Symbol, Title, Summary, Url, SourceName, PublishedAt],
        }
    }

    fn default_coercion(&self) -> Coercion {
        use CanonicalField::*;
        match self {
            Timestamp | PublishedAt => Coercion::Timestamp,
            Volume | AdvancingCount | DecliningCount => Coercion::Integer,
            LastPrice | ChangeAmount | ChangePercent | Turnover | TotalMarketCap | TurnoverRate
            | LeadStockChangePercent => Coercion::Number,
            _ => Coercion::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    /// Trimmed string; empty becomes absent.
    Text,
    /// Float, accepting thousand separators, `%`, `万`/`亿` and `-` for absent.
    Number,
    /// Non-negative whole number.
    Integer,
    /// Board lots, multiplied out to shares.
    Lots,
    /// Epoch seconds/millis, RFC 3339 or one of the mapping's formats.
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub source: String,
    pub target: CanonicalField,
    pub coerce: Coercion,
}

impl FieldRule {
    pub fn new(source: impl Into<String>, target: CanonicalField, coerce: Coercion) -> Self {
        Self {
            source: source.into(),
            target,
            coerce,
        }
    }
}

fn default_timestamp_formats() -> Vec<String> {
    [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y%m%d%H%M%S",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_utc_offset_hours() -> i32 {
    CHINA_UTC_OFFSET_SECS / 3600
}

/// Mapping table for one `(kind, source)` pair. Several rules may feed the
/// same canonical field; the first one with a value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub kind: EntityKind,
    pub source_id: String,
    pub fields: Vec<FieldRule>,
    #[serde(default = "default_timestamp_formats")]
    pub timestamp_formats: Vec<String>,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

impl FieldMapping {
    pub fn new(kind: EntityKind, source_id: impl Into<String>, fields: Vec<FieldRule>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            fields,
            timestamp_formats: default_timestamp_formats(),
            utc_offset_hours: default_utc_offset_hours(),
        }
    }

    /// Table for providers whose rows already use canonical field names.
    pub fn canonical(kind: EntityKind, source_id: impl Into<String>) -> Self {
        let fields = CanonicalField::for_kind(kind)
            .iter()
            .map(|f| FieldRule::new(f.as_str(), *f, f.default_coercion()))
            .collect();
        Self::new(kind, source_id, fields)
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(mdc_core::china_offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum NormalizeError {
    #[error("row {row}: missing required field {field}")]
    MissingRequiredField { row: usize, field: String },
    #[error("row {row}: cannot parse {field} from {value:?}")]
    UnparsableValue {
        row: usize,
        field: String,
        value: String,
    },
    #[error("no mapping table for {kind} from {source_id}")]
    UnknownMapping { kind: EntityKind, source_id: String },
}

/// Records produced from one payload, plus the rows that could not be mapped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub records: Vec<CanonicalRecord>,
    pub rejected: Vec<NormalizeError>,
}

#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Text(String),
    Number(f64),
    Count(u64),
    Time(DateTime<Utc>),
}

#[derive(Debug, Default)]
struct MappedRow {
    values: HashMap<CanonicalField, Coerced>,
}

impl MappedRow {
    fn text(&self, field: CanonicalField) -> Option<String> {
        match self.values.get(&field)? {
            Coerced::Text(s) => Some(s.clone()),
            Coerced::Number(n) => Some(n.to_string()),
            Coerced::Count(n) => Some(n.to_string()),
            Coerced::Time(t) => Some(t.to_rfc3339()),
        }
    }

    fn number(&self, field: CanonicalField) -> Option<f64> {
        match self.values.get(&field)? {
            Coerced::Number(n) => Some(*n),
            Coerced::Count(n) => Some(*n as f64),
            _ => None,
        }
    }

    fn count(&self, field: CanonicalField) -> Option<u64> {
        match self.values.get(&field)? {
            Coerced::Count(n) => Some(*n),
            Coerced::Number(n) if *n >= 0.0 => Some(n.round() as u64),
            _ => None,
        }
    }

    fn time(&self, field: CanonicalField) -> Option<DateTime<Utc>> {
        match self.values.get(&field)? {
            Coerced::Time(t) => Some(*t),
            _ => None,
        }
    }
}

/// Maps raw provider rows to canonical records using per-source tables.
#[derive(Debug, Clone, Default)]
pub struct SchemaNormalizer {
    tables: HashMap<(EntityKind, String), FieldMapping>,
}

impl SchemaNormalizer {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Normalizer preloaded with the tables for every built-in provider.
    pub fn with_builtin_tables() -> Self {
        let mut normalizer = Self::empty();
        for mapping in builtin_tables() {
            normalizer.register(mapping);
        }
        normalizer
    }

    /// Add or replace the table for `(mapping.kind, mapping.source_id)`.
    pub fn register(&mut self, mapping: FieldMapping) {
        self.tables
            .insert((mapping.kind, mapping.source_id.clone()), mapping);
    }

    pub fn has_mapping(&self, kind: EntityKind, source_id: &str) -> bool {
        self.tables.contains_key(&(kind, source_id.to_string()))
    }

    pub fn normalize(
        &self,
        kind: EntityKind,
        source_id: &str,
        payload: &RawPayload,
    ) -> Result<Normalized, NormalizeError> {
        let mapping = self
            .tables
            .get(&(kind, source_id.to_string()))
            .ok_or_else(|| NormalizeError::UnknownMapping {
                kind,
                source_id: source_id.to_string(),
            })?;

        let mut out = Normalized::default();
        for (index, row) in payload.rows.iter().enumerate() {
            match map_row(mapping, index, row)
                .and_then(|mapped| build_record(kind, source_id, index, &mapped, payload))
            {
                Ok(record) => out.records.push(record),
                Err(err) => {
                    debug!(%kind, source_id, %err, "rejected row");
                    out.rejected.push(err);
                }
            }
        }

        if out.records.is_empty() && !out.rejected.is_empty() {
            return Err(out.rejected.swap_remove(0));
        }
        Ok(out)
    }
}

fn map_row(mapping: &FieldMapping, row_index: usize, row: &RawRow) -> Result<MappedRow, NormalizeError> {
    let mut mapped = MappedRow::default();
    for rule in &mapping.fields {
        if mapped.values.contains_key(&rule.target) {
            continue;
        }
        let Some(raw) = row.get(&rule.source) else {
            continue;
        };
        let unparsable = || NormalizeError::UnparsableValue {
            row: row_index,
            field: rule.source.clone(),
            value: display_raw(raw),
        };
        let value = match rule.coerce {
            Coercion::Text => coerce_text(raw).map(Coerced::Text),
            Coercion::Number => coerce_number(raw).ok_or_else(unparsable)?.map(Coerced::Number),
            Coercion::Integer => coerce_count(raw, 1).ok_or_else(unparsable)?.map(Coerced::Count),
            Coercion::Lots => coerce_count(raw, 100).ok_or_else(unparsable)?.map(Coerced::Count),
            Coercion::Timestamp => coerce_timestamp(raw, mapping)
                .ok_or_else(unparsable)?
                .map(Coerced::Time),
        };
        if let Some(value) = value {
            mapped.values.insert(rule.target, value);
        }
    }
    Ok(mapped)
}

fn build_record(
    kind: EntityKind,
    source_id: &str,
    row: usize,
    mapped: &MappedRow,
    payload: &RawPayload,
) -> Result<CanonicalRecord, NormalizeError> {
    let missing = |field: CanonicalField| NormalizeError::MissingRequiredField {
        row,
        field: field.as_str().to_string(),
    };

    let record = match kind {
        EntityKind::Quote => {
            let raw_symbol = mapped
                .text(CanonicalField::Symbol)
                .or_else(|| target_symbol(payload))
                .ok_or_else(|| missing(CanonicalField::Symbol))?;
            let market = quote_market(&raw_symbol, payload);
            CanonicalRecord::Quote(QuoteRecord {
                symbol: bare_symbol(&raw_symbol),
                market,
                name: mapped.text(CanonicalField::Name),
                timestamp: mapped
                    .time(CanonicalField::Timestamp)
                    .unwrap_or(payload.fetched_at),
                last_price: mapped
                    .number(CanonicalField::LastPrice)
                    .ok_or_else(|| missing(CanonicalField::LastPrice))?,
                change_amount: mapped.number(CanonicalField::ChangeAmount),
                change_percent: mapped.number(CanonicalField::ChangePercent),
                volume: mapped.count(CanonicalField::Volume),
                turnover: mapped.number(CanonicalField::Turnover),
                source_id: source_id.to_string(),
            })
        }
        EntityKind::Sector => {
            let board = match &payload.target {
                Some(Target::TopSectors { board, .. }) => *board,
                _ => SectorBoard::Concept,
            };
            let to_u32 = |field| mapped.count(field).and_then(|n| u32::try_from(n).ok());
            CanonicalRecord::Sector(SectorEntry {
                board,
                sector_name: mapped
                    .text(CanonicalField::SectorName)
                    .ok_or_else(|| missing(CanonicalField::SectorName))?,
                sector_code: mapped
                    .text(CanonicalField::SectorCode)
                    .ok_or_else(|| missing(CanonicalField::SectorCode))?,
                rank: 0,
                change_percent: mapped
                    .number(CanonicalField::ChangePercent)
                    .ok_or_else(|| missing(CanonicalField::ChangePercent))?,
                total_market_cap: mapped.number(CanonicalField::TotalMarketCap),
                turnover_rate: mapped.number(CanonicalField::TurnoverRate),
                advancing_count: to_u32(CanonicalField::AdvancingCount),
                declining_count: to_u32(CanonicalField::DecliningCount),
                lead_stock_name: mapped.text(CanonicalField::LeadStockName),
                lead_stock_change_percent: mapped.number(CanonicalField::LeadStockChangePercent),
                polled_at: payload.fetched_at,
                source_id: source_id.to_string(),
            })
        }
        EntityKind::News => {
            let title = mapped
                .text(CanonicalField::Title)
                .ok_or_else(|| missing(CanonicalField::Title))?;
            let url = mapped
                .text(CanonicalField::Url)
                .ok_or_else(|| missing(CanonicalField::Url))?;
            let published_at = mapped
                .time(CanonicalField::PublishedAt)
                .ok_or_else(|| missing(CanonicalField::PublishedAt))?;
            CanonicalRecord::News(NewsItem {
                fingerprint: news_fingerprint(&title, &url, published_at),
                symbol: mapped
                    .text(CanonicalField::Symbol)
                    .or_else(|| target_symbol(payload))
                    .map(|s| bare_symbol(&s)),
                title,
                summary: mapped.text(CanonicalField::Summary),
                url,
                source_name: mapped.text(CanonicalField::SourceName),
                published_at,
                source_id: source_id.to_string(),
            })
        }
    };
    Ok(record)
}

fn target_symbol(payload: &RawPayload) -> Option<String> {
    match &payload.target {
        Some(Target::Symbol { symbol }) => Some(symbol.clone()),
        _ => None,
    }
}

/// Venue of a quote row. Providers often echo the bare code, so a prefixed
/// target for the same code decides before the code-range guess does.
fn quote_market(raw_symbol: &str, payload: &RawPayload) -> Market {
    Market::explicit(raw_symbol)
        .or_else(|| {
            target_symbol(payload)
                .filter(|target| bare_symbol(target) == bare_symbol(raw_symbol))
                .and_then(|target| Market::explicit(&target))
        })
        .unwrap_or_else(|| Market::from_symbol(raw_symbol))
}

fn display_raw(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_text(raw: &JsonValue) -> Option<String> {
    let text = match raw {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// `None` means unparsable; `Some(None)` means an explicit "no value".
pub fn coerce_number(raw: &JsonValue) -> Option<Option<f64>> {
    match raw {
        JsonValue::Null => Some(None),
        JsonValue::Number(n) => Some(n.as_f64().filter(|v| v.is_finite())),
        JsonValue::String(s) => parse_number_text(s),
        _ => None,
    }
}

fn parse_number_text(text: &str) -> Option<Option<f64>> {
    let mut cleaned: String = text.trim().chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '-') {
        return Some(None);
    }

    let mut multiplier = 1.0;
    if let Some(stripped) = cleaned.strip_suffix('%') {
        cleaned = stripped.to_string();
    }
    if let Some(stripped) = cleaned.strip_suffix('亿') {
        multiplier = 1e8;
        cleaned = stripped.to_string();
    } else if let Some(stripped) = cleaned.strip_suffix('万') {
        multiplier = 1e4;
        cleaned = stripped.to_string();
    }
    if let Some(stripped) = cleaned.strip_prefix('+') {
        cleaned = stripped.to_string();
    }

    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(Some(value * multiplier))
}

fn coerce_count(raw: &JsonValue, multiplier: u64) -> Option<Option<u64>> {
    let value = match coerce_number(raw)? {
        Some(v) => v,
        None => return Some(None),
    };
    if value < 0.0 {
        return None;
    }
    let whole = value.round() as u64;
    Some(whole.checked_mul(multiplier))
}

fn coerce_timestamp(raw: &JsonValue, mapping: &FieldMapping) -> Option<Option<DateTime<Utc>>> {
    match raw {
        JsonValue::Null => Some(None),
        JsonValue::Number(n) => n.as_i64().and_then(from_epoch).map(Some),
        JsonValue::String(s) => {
            let text = s.trim();
            if text.is_empty() || text == "-" {
                return Some(None);
            }
            if text.chars().all(|c| c.is_ascii_digit()) && text.len() >= 10 && text.len() != 14 {
                return text.parse::<i64>().ok().and_then(from_epoch).map(Some);
            }
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(Some(parsed.with_timezone(&Utc)));
            }
            let offset = mapping.offset();
            for format in &mapping.timestamp_formats {
                if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                    return local_to_utc(offset, naive).map(Some);
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                return local_to_utc(offset, date.and_hms_opt(0, 0, 0)?).map(Some);
            }
            None
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn local_to_utc(offset: FixedOffset, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn rules(entries: &[(&str, CanonicalField, Coercion)]) -> Vec<FieldRule> {
    entries
        .iter()
        .map(|(source, target, coerce)| FieldRule::new(*source, *target, *coerce))
        .collect()
}

/// Tables for every built-in provider.
pub fn builtin_tables() -> Vec<FieldMapping> {
    use CanonicalField as F;
    use Coercion as C;

    let mut tables = vec![
        FieldMapping::new(
            EntityKind::Quote,
            "eastmoney",
            rules(&[
                ("f12", F::Symbol, C::Text),
                ("f14", F::Name, C::Text),
                ("f124", F::Timestamp, C::Timestamp),
                ("f2", F::LastPrice, C::Number),
                ("f4", F::ChangeAmount, C::Number),
                ("f3", F::ChangePercent, C::Number),
                ("f5", F::Volume, C::Lots),
                ("f6", F::Turnover, C::Number),
            ]),
        ),
        FieldMapping::new(
            EntityKind::Quote,
            "sina",
            rules(&[
                ("symbol", F::Symbol, C::Text),
                ("name", F::Name, C::Text),
                ("datetime", F::Timestamp, C::Timestamp),
                ("price", F::LastPrice, C::Number),
                ("change", F::ChangeAmount, C::Number),
                ("change_pct", F::ChangePercent, C::Number),
                ("volume", F::Volume, C::Integer),
                ("amount", F::Turnover, C::Number),
            ]),
        ),
        FieldMapping::new(
            EntityKind::Sector,
            "eastmoney",
            rules(&[
                ("f14", F::SectorName, C::Text),
                ("f12", F::SectorCode, C::Text),
                ("f3", F::ChangePercent, C::Number),
                ("f20", F::TotalMarketCap, C::Number),
                ("f8", F::TurnoverRate, C::Number),
                ("f104", F::AdvancingCount, C::Integer),
                ("f105", F::DecliningCount, C::Integer),
                ("f128", F::LeadStockName, C::Text),
                ("f136", F::LeadStockChangePercent, C::Number),
            ]),
        ),
        FieldMapping::new(
            EntityKind::Sector,
            "sina",
            rules(&[
                ("name", F::SectorName, C::Text),
                ("code", F::SectorCode, C::Text),
                ("change_pct", F::ChangePercent, C::Number),
                ("lead_name", F::LeadStockName, C::Text),
                ("lead_change_pct", F::LeadStockChangePercent, C::Number),
            ]),
        ),
        FieldMapping::new(
            EntityKind::News,
            "eastmoney",
            rules(&[
                ("code", F::Symbol, C::Text),
                ("title", F::Title, C::Text),
                ("content", F::Summary, C::Text),
                ("url", F::Url, C::Text),
                ("mediaName", F::SourceName, C::Text),
                ("date", F::PublishedAt, C::Timestamp),
            ]),
        ),
        FieldMapping::new(
            EntityKind::News,
            "sina-roll",
            rules(&[
                ("title", F::Title, C::Text),
                ("intro", F::Summary, C::Text),
                ("summary", F::Summary, C::Text),
                ("url", F::Url, C::Text),
                ("media_name", F::SourceName, C::Text),
                ("ctime", F::PublishedAt, C::Timestamp),
            ]),
        ),
        FieldMapping::new(
            EntityKind::News,
            "html-headlines",
            rules(&[
                ("title", F::Title, C::Text),
                ("summary", F::Summary, C::Text),
                ("url", F::Url, C::Text),
                ("source", F::SourceName, C::Text),
                ("published", F::PublishedAt, C::Timestamp),
            ]),
        ),
    ];
    for kind in EntityKind::ALL {
        tables.push(FieldMapping::canonical(kind, "fixture"));
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).single().unwrap()
    }

    fn payload(kind: EntityKind, source: &str, rows: Vec<JsonValue>) -> RawPayload {
        let rows = rows
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        RawPayload::new(source, kind, fetched_at()).with_rows(rows)
    }

    #[test]
    fn number_coercion_handles_provider_notation() {
        assert_eq!(coerce_number(&json!("1,234.5")), Some(Some(1234.5)));
        assert_eq!(coerce_number(&json!("-3.25%")), Some(Some(-3.25)));
        assert_eq!(coerce_number(&json!("+1.5%")), Some(Some(1.5)));
        assert_eq!(coerce_number(&json!("12万")), Some(Some(120_000.0)));
        assert_eq!(coerce_number(&json!("3亿")), Some(Some(300_000_000.0)));
        assert_eq!(coerce_number(&json!("-")), Some(None));
        assert_eq!(coerce_number(&json!("")), Some(None));
        assert_eq!(coerce_number(&json!(null)), Some(None));
        assert_eq!(coerce_number(&json!(7)), Some(Some(7.0)));
        assert_eq!(coerce_number(&json!("abc")), None);
    }

    #[test]
    fn eastmoney_quote_rows_map_to_canonical_quotes() {
        let p = payload(
            EntityKind::Quote,
            "eastmoney",
            vec![json!({
                "f12": "600584", "f14": "长电科技", "f2": 41.28, "f3": 2.11,
                "f4": 0.85, "f5": 532_118, "f6": 2_190_512_384.0, "f124": 1_772_416_800
            })],
        );
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Quote, "eastmoney", &p)
            .unwrap();

        assert!(out.rejected.is_empty());
        let CanonicalRecord::Quote(q) = &out.records[0] else {
            panic!("expected quote");
        };
        assert_eq!(q.symbol, "600584");
        assert_eq!(q.market, Market::Sh);
        assert_eq!(q.name.as_deref(), Some("长电科技"));
        assert_eq!(q.last_price, 41.28);
        assert_eq!(q.volume, Some(53_211_800));
        assert_eq!(q.timestamp, DateTime::from_timestamp(1_772_416_800, 0).unwrap());
        assert_eq!(q.source_id, "eastmoney");
    }

    #[test]
    fn bare_index_code_takes_the_venue_of_its_target() {
        let p = payload(
            EntityKind::Quote,
            "eastmoney",
            vec![json!({"f12": "000001", "f14": "上证指数", "f2": 3350.12, "f124": 1_772_416_800})],
        )
        .for_target(&Target::symbol("sh000001"));
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Quote, "eastmoney", &p)
            .unwrap();
        let CanonicalRecord::Quote(q) = &out.records[0] else {
            panic!("expected quote");
        };
        assert_eq!(q.symbol, "000001");
        assert_eq!(q.market, Market::Sh);
    }

    #[test]
    fn quote_without_timestamp_falls_back_to_fetch_time() {
        let p = payload(
            EntityKind::Quote,
            "fixture",
            vec![json!({"symbol": "sz000001", "last_price": "11.20"})],
        );
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Quote, "fixture", &p)
            .unwrap();
        let CanonicalRecord::Quote(q) = &out.records[0] else {
            panic!("expected quote");
        };
        assert_eq!(q.symbol, "000001");
        assert_eq!(q.market, Market::Sz);
        assert_eq!(q.timestamp, fetched_at());
    }

    #[test]
    fn bad_rows_are_rejected_but_good_rows_survive() {
        let p = payload(
            EntityKind::Sector,
            "eastmoney",
            vec![
                json!({"f14": "半导体", "f12": "BK1036", "f3": 3.4}),
                json!({"f14": "白酒", "f12": "BK0896"}),
                json!({"f14": "银行", "f12": "BK0475", "f3": "n/a"}),
            ],
        );
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Sector, "eastmoney", &p)
            .unwrap();

        assert_eq!(out.records.len(), 1);
        assert_eq!(out.rejected.len(), 2);
        assert!(matches!(
            &out.rejected[0],
            NormalizeError::MissingRequiredField { row: 1, field } if field == "change_percent"
        ));
        assert!(matches!(
            &out.rejected[1],
            NormalizeError::UnparsableValue { row: 2, field, .. } if field == "f3"
        ));
    }

    #[test]
    fn payload_fails_when_every_row_fails() {
        let p = payload(EntityKind::News, "sina-roll", vec![json!({"title": "only a title"})]);
        let err = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::News, "sina-roll", &p)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::MissingRequiredField { row: 0, .. }));
    }

    #[test]
    fn unknown_source_has_no_mapping() {
        let p = payload(EntityKind::Quote, "tushare", vec![json!({"code": "600584"})]);
        let err = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Quote, "tushare", &p)
            .unwrap_err();
        assert_eq!(
            err,
            NormalizeError::UnknownMapping {
                kind: EntityKind::Quote,
                source_id: "tushare".into()
            }
        );
    }

    #[test]
    fn news_times_are_read_in_provider_offset_and_fingerprinted() {
        let p = RawPayload::new("eastmoney", EntityKind::News, fetched_at())
            .for_target(&Target::symbol("600584"))
            .with_rows(vec![json!({
                "title": "长电科技发布年报", "url": "https://finance.eastmoney.com/a/1.html",
                "date": "2026-03-02 09:15:00", "mediaName": "证券时报"
            })
            .as_object()
            .cloned()
            .unwrap()]);
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::News, "eastmoney", &p)
            .unwrap();
        let CanonicalRecord::News(n) = &out.records[0] else {
            panic!("expected news");
        };
        assert_eq!(n.published_at, Utc.with_ymd_and_hms(2026, 3, 2, 1, 15, 0).single().unwrap());
        assert_eq!(n.symbol.as_deref(), Some("600584"));
        assert_eq!(n.fingerprint, n.compute_fingerprint());
        assert_eq!(n.source_name.as_deref(), Some("证券时报"));
    }

    #[test]
    fn registered_tables_extend_the_builtins() {
        let mut normalizer = SchemaNormalizer::with_builtin_tables();
        assert!(!normalizer.has_mapping(EntityKind::Quote, "akshare"));
        normalizer.register(FieldMapping::new(
            EntityKind::Quote,
            "akshare",
            vec![
                FieldRule::new("代码", CanonicalField::Symbol, Coercion::Text),
                FieldRule::new("最新价", CanonicalField::LastPrice, Coercion::Number),
                FieldRule::new("成交量", CanonicalField::Volume, Coercion::Lots),
            ],
        ));
        let p = payload(
            EntityKind::Quote,
            "akshare",
            vec![json!({"代码": "000001", "最新价": "11.02", "成交量": "1,200"})],
        );
        let out = normalizer.normalize(EntityKind::Quote, "akshare", &p).unwrap();
        let CanonicalRecord::Quote(q) = &out.records[0] else {
            panic!("expected quote");
        };
        assert_eq!(q.volume, Some(120_000));
    }

    #[test]
    fn sector_board_comes_from_the_target() {
        let p = RawPayload::new("sina", EntityKind::Sector, fetched_at())
            .for_target(&Target::TopSectors {
                board: SectorBoard::Industry,
                top_n: 10,
            })
            .with_rows(vec![json!({"name": "玻璃行业", "code": "new_blhy", "change_pct": "-0.26"})
                .as_object()
                .cloned()
                .unwrap()]);
        let out = SchemaNormalizer::with_builtin_tables()
            .normalize(EntityKind::Sector, "sina", &p)
            .unwrap();
        let CanonicalRecord::Sector(s) = &out.records[0] else {
            panic!("expected sector");
        };
        assert_eq!(s.board, SectorBoard::Industry);
        assert_eq!(s.change_percent, -0.26);
        assert_eq!(s.polled_at, fetched_at());
        assert_eq!(s.rank, 0);
    }
}
