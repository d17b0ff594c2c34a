use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mdc_adapters::{FixtureProvider, Provider, SchemaNormalizer};
use mdc_core::{CanonicalRecord, EntityKind, Market, SectorBoard, Target};
use serde::{de::DeserializeOwned, Deserialize};

#[derive(Debug, PartialEq, Deserialize)]
struct GoldenSector {
    sector_code: String,
    sector_name: String,
    change_percent: f64,
    advancing_count: Option<u32>,
    declining_count: Option<u32>,
    lead_stock_name: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize)]
struct GoldenNews {
    title: String,
    url: String,
    summary: Option<String>,
    source_name: Option<String>,
    published_at: DateTime<Utc>,
}

fn fixture_path(parts: &[&str]) -> PathBuf {
    let mut path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    for part in parts {
        path = path.join(part);
    }
    path
}

fn read_snapshot<T: DeserializeOwned>(path: &Path) -> T {
    let text = fs::read_to_string(path).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

#[tokio::test]
async fn eastmoney_concept_board_matches_snapshot() {
    let provider = FixtureProvider::new(
        "eastmoney",
        EntityKind::Sector,
        fixture_path(&["eastmoney", "sector_concept.json"]),
    );
    let target = Target::TopSectors {
        board: SectorBoard::Concept,
        top_n: 5,
    };
    let payload = provider.fetch(&target).await.expect("fixture payload");
    let normalized = SchemaNormalizer::with_builtin_tables()
        .normalize(EntityKind::Sector, "eastmoney", &payload)
        .expect("normalize");

    // the row with "-" for change percent has nothing to rank on
    assert_eq!(normalized.rejected.len(), 1);

    let actual: Vec<GoldenSector> = normalized
        .records
        .iter()
        .map(|record| match record {
            CanonicalRecord::Sector(s) => {
                assert_eq!(s.board, SectorBoard::Concept);
                assert_eq!(s.polled_at, payload.fetched_at);
                GoldenSector {
                    sector_code: s.sector_code.clone(),
                    sector_name: s.sector_name.clone(),
                    change_percent: s.change_percent,
                    advancing_count: s.advancing_count,
                    declining_count: s.declining_count,
                    lead_stock_name: s.lead_stock_name.clone(),
                }
            }
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    let expected: Vec<GoldenSector> =
        read_snapshot(&fixture_path(&["eastmoney", "sector_concept.snapshot.json"]));
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn sina_roll_headlines_match_snapshot() {
    let provider = FixtureProvider::new(
        "sina-roll",
        EntityKind::News,
        fixture_path(&["sina-roll", "headlines.json"]),
    );
    let payload = provider.fetch(&Target::Headlines).await.expect("fixture payload");
    let normalized = SchemaNormalizer::with_builtin_tables()
        .normalize(EntityKind::News, "sina-roll", &payload)
        .expect("normalize");

    assert_eq!(normalized.rejected.len(), 1);

    let actual: Vec<GoldenNews> = normalized
        .records
        .iter()
        .map(|record| match record {
            CanonicalRecord::News(n) => {
                assert_eq!(n.fingerprint, n.compute_fingerprint());
                assert_eq!(n.symbol, None);
                GoldenNews {
                    title: n.title.clone(),
                    url: n.url.clone(),
                    summary: n.summary.clone(),
                    source_name: n.source_name.clone(),
                    published_at: n.published_at,
                }
            }
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    let expected: Vec<GoldenNews> =
        read_snapshot(&fixture_path(&["sina-roll", "headlines.snapshot.json"]));
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn sina_quote_rows_normalize_per_symbol() {
    let provider = FixtureProvider::new("sina", EntityKind::Quote, fixture_path(&["sina", "quote.json"]));
    let normalizer = SchemaNormalizer::with_builtin_tables();

    let payload = provider.fetch(&Target::symbol("000001")).await.expect("fixture payload");
    let normalized = normalizer
        .normalize(EntityKind::Quote, "sina", &payload)
        .expect("normalize");
    let CanonicalRecord::Quote(q) = &normalized.records[0] else {
        panic!("expected quote");
    };
    assert_eq!(q.symbol, "000001");
    assert_eq!(q.market, Market::Sz);
    assert_eq!(q.last_price, 11.2);
    assert_eq!(q.volume, Some(120_345_600));
    assert_eq!(q.change_percent, Some(1.63));
    assert_eq!(
        q.timestamp,
        DateTime::parse_from_rfc3339("2026-03-02T10:00:03+08:00")
            .expect("ts")
            .with_timezone(&Utc)
    );
}
