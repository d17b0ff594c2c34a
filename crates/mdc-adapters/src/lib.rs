//! Provider contracts, the built-in market data providers and the schema
//! normalizer that turns their rows into canonical records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use mdc_core::{EntityKind, RawPayload, RawRow, Target};
use mdc_storage::{HttpFetcher, ProviderFailure};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod eastmoney;
mod html;
pub mod normalize;
mod sina;

pub use eastmoney::{EastmoneyNewsProvider, EastmoneyQuoteProvider, EastmoneySectorProvider};
pub use html::{HtmlHeadlineProvider, HtmlHeadlineSpec};
pub use normalize::{
    builtin_tables, CanonicalField, Coercion, FieldMapping, FieldRule, NormalizeError, Normalized,
    SchemaNormalizer,
};
pub use sina::{SinaQuoteProvider, SinaRollNewsProvider, SinaSectorProvider};

/// One external data source for one entity kind.
#[async_trait]
pub trait Provider: Send + Sync {
    fn source_id(&self) -> &str;
    fn entity_kind(&self) -> EntityKind;

    /// Single attempt at fetching `target`. Retrying belongs to the caller.
    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure>;
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter {adapter} cannot serve {kind}")]
    UnsupportedKind { adapter: String, kind: EntityKind },
    #[error("invalid css selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Provider entry as written in the collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "adapter", rename_all = "kebab-case")]
pub enum ProviderSpec {
    Eastmoney {
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    Sina {
        #[serde(default)]
        base_url: Option<String>,
    },
    SinaRoll {
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        page_size: Option<usize>,
    },
    HtmlHeadlines(HtmlHeadlineSpec),
    Fixture {
        #[serde(default)]
        source_id: Option<String>,
        path: PathBuf,
    },
}

impl ProviderSpec {
    pub fn adapter_name(&self) -> &'static str {
        match self {
            Self::Eastmoney { .. } => "eastmoney",
            Self::Sina { .. } => "sina",
            Self::SinaRoll { .. } => "sina-roll",
            Self::HtmlHeadlines(_) => "html-headlines",
            Self::Fixture { .. } => "fixture",
        }
    }
}

/// Build the provider a config entry describes for `kind`.
pub fn provider_from_spec(
    kind: EntityKind,
    spec: &ProviderSpec,
    http: Arc<HttpFetcher>,
) -> Result<Arc<dyn Provider>, AdapterError> {
    let unsupported = || AdapterError::UnsupportedKind {
        adapter: spec.adapter_name().to_string(),
        kind,
    };
    let provider: Arc<dyn Provider> = match (spec, kind) {
        (ProviderSpec::Eastmoney { base_url, .. }, EntityKind::Quote) => {
            Arc::new(EastmoneyQuoteProvider::new(http, base_url.clone()))
        }
        (ProviderSpec::Eastmoney { base_url, .. }, EntityKind::Sector) => {
            Arc::new(EastmoneySectorProvider::new(http, base_url.clone()))
        }
        (ProviderSpec::Eastmoney { base_url, page_size }, EntityKind::News) => Arc::new(
            EastmoneyNewsProvider::new(http, base_url.clone()).with_page_size(page_size.unwrap_or(20)),
        ),
        (ProviderSpec::Sina { base_url }, EntityKind::Quote) => {
            Arc::new(SinaQuoteProvider::new(http, base_url.clone()))
        }
        (ProviderSpec::Sina { base_url }, EntityKind::Sector) => {
            Arc::new(SinaSectorProvider::new(http, base_url.clone()))
        }
        (ProviderSpec::SinaRoll { base_url, page_size }, EntityKind::News) => Arc::new(
            SinaRollNewsProvider::new(http, base_url.clone()).with_page_size(page_size.unwrap_or(50)),
        ),
        (ProviderSpec::HtmlHeadlines(html), EntityKind::News) => {
            Arc::new(HtmlHeadlineProvider::new(http, html.clone())?)
        }
        (ProviderSpec::Fixture { source_id, path }, kind) => Arc::new(FixtureProvider::new(
            source_id.clone().unwrap_or_else(|| "fixture".to_string()),
            kind,
            path.clone(),
        )),
        _ => return Err(unsupported()),
    };
    Ok(provider)
}

/// Serves rows from a JSON file, for offline runs and tests.
///
/// The file is either an array of rows used for every target, or an object
/// keyed by target label (`600584`, `concept-top20`, `headlines`).
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    source_id: String,
    kind: EntityKind,
    path: PathBuf,
}

impl FixtureProvider {
    pub fn new(source_id: impl Into<String>, kind: EntityKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn entity_kind(&self) -> EntityKind {
        self.kind
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        let body = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))
            .map_err(|err| ProviderFailure::Connection {
                message: format!("{err:#}"),
            })?;
        let value: JsonValue = serde_json::from_slice(&body)
            .map_err(|err| ProviderFailure::malformed(format!("fixture json: {err}")))?;

        let rows = match &value {
            JsonValue::Array(_) => json_rows(&value),
            JsonValue::Object(map) => match map.get(&target.label()) {
                Some(entry) => json_rows(entry),
                None => {
                    return Err(ProviderFailure::UnsupportedTarget {
                        target: target.label(),
                    })
                }
            },
            _ => return Err(ProviderFailure::malformed("fixture must be an array or object")),
        };
        if rows.is_empty() {
            return Err(ProviderFailure::EmptyPayload);
        }

        Ok(RawPayload::new(self.source_id.clone(), self.kind, Utc::now())
            .for_target(target)
            .with_body("application/json", body)
            .with_rows(rows))
    }
}

/// Rows from a JSON array, or from an object of rows keyed by position.
pub(crate) fn json_rows(value: &JsonValue) -> Vec<RawRow> {
    match value {
        JsonValue::Array(items) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
        JsonValue::Object(map) => map.values().filter_map(|v| v.as_object().cloned()).collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

/// Unwrap `callback({...})` into its JSON argument.
pub(crate) fn strip_jsonp(text: &str) -> &str {
    let trimmed = text.trim().trim_end_matches(';');
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close && !trimmed.starts_with('{') => {
            &trimmed[open + 1..close]
        }
        _ => trimmed,
    }
}

/// Text content of an HTML fragment: drops inline tags such as the `<em>`
/// highlighting search APIs add and decodes entities.
pub(crate) fn strip_markup(text: &str) -> String {
    scraper::Html::parse_fragment(text)
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

pub(crate) fn unsupported(target: &Target) -> ProviderFailure {
    ProviderFailure::UnsupportedTarget {
        target: target.label(),
    }
}
