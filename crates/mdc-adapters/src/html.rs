use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use mdc_core::{EntityKind, RawPayload, RawRow, Target};
use mdc_storage::{HttpFetcher, ProviderFailure};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{unsupported, AdapterError, Provider};

const SOURCE_ID: &str = "html-headlines";

/// Where the headline list lives on a page and how to read each item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlHeadlineSpec {
    pub url: String,
    /// One match per headline.
    pub item_selector: String,
    pub title_selector: String,
    /// Element carrying `href`; defaults to the title element.
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub time_selector: Option<String>,
    #[serde(default)]
    pub summary_selector: Option<String>,
    /// Outlet name recorded on every item.
    #[serde(default)]
    pub source_name: Option<String>,
}

#[derive(Debug)]
struct Selectors {
    item: Selector,
    title: Selector,
    link: Option<Selector>,
    time: Option<Selector>,
    summary: Option<Selector>,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_optional(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(parse_selector).transpose()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_text(item: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Headlines scraped from any HTML list page.
#[derive(Debug)]
pub struct HtmlHeadlineProvider {
    http: Arc<HttpFetcher>,
    spec: HtmlHeadlineSpec,
    selectors: Selectors,
}

impl HtmlHeadlineProvider {
    pub fn new(http: Arc<HttpFetcher>, spec: HtmlHeadlineSpec) -> Result<Self, AdapterError> {
        let selectors = Selectors {
            item: parse_selector(&spec.item_selector)?,
            title: parse_selector(&spec.title_selector)?,
            link: parse_optional(&spec.link_selector)?,
            time: parse_optional(&spec.time_selector)?,
            summary: parse_optional(&spec.summary_selector)?,
        };
        Ok(Self {
            http,
            spec,
            selectors,
        })
    }

    fn extract(&self, html: &str, page_url: &str, fetched_at: &str) -> Vec<RawRow> {
        let base = reqwest::Url::parse(page_url).ok();
        let document = Html::parse_document(html);
        let mut rows = Vec::new();

        for item in document.select(&self.selectors.item) {
            let Some(title) = select_text(&item, &self.selectors.title) else {
                continue;
            };
            let link_selector = self.selectors.link.as_ref().unwrap_or(&self.selectors.title);
            let href = item
                .select(link_selector)
                .next()
                .and_then(|n| n.value().attr("href"))
                .or_else(|| item.value().attr("href"));
            let Some(href) = href else { continue };
            let url = match &base {
                Some(base) => base
                    .join(href.trim())
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.trim().to_string()),
                None => href.trim().to_string(),
            };

            let mut row = RawRow::new();
            row.insert("title".into(), JsonValue::from(title));
            row.insert("url".into(), JsonValue::from(url));
            let published = self
                .selectors
                .time
                .as_ref()
                .and_then(|sel| select_text(&item, sel))
                .unwrap_or_else(|| fetched_at.to_string());
            row.insert("published".into(), JsonValue::from(published));
            if let Some(summary) = self.selectors.summary.as_ref().and_then(|sel| select_text(&item, sel)) {
                row.insert("summary".into(), JsonValue::from(summary));
            }
            if let Some(source) = &self.spec.source_name {
                row.insert("source".into(), JsonValue::from(source.clone()));
            }
            rows.push(row);
        }
        rows
    }
}

#[async_trait]
impl Provider for HtmlHeadlineProvider {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    fn entity_kind(&self) -> EntityKind {
        EntityKind::News
    }

    async fn fetch(&self, target: &Target) -> Result<RawPayload, ProviderFailure> {
        if !matches!(target, Target::Headlines) {
            return Err(unsupported(target));
        }
        let resp = self.http.fetch_bytes(SOURCE_ID, &self.spec.url, None).await?;
        let fetched_at = Utc::now();
        let html = String::from_utf8_lossy(&resp.body);
        let rows = self.extract(
            &html,
            &resp.final_url,
            &fetched_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if rows.is_empty() {
            return Err(ProviderFailure::schema(format!(
                "no headlines matched {:?}",
                self.spec.item_selector
            )));
        }

        Ok(RawPayload::new(SOURCE_ID, EntityKind::News, fetched_at)
            .for_target(target)
            .with_body(resp.content_type, resp.body.clone())
            .with_rows(rows))
    }
}
