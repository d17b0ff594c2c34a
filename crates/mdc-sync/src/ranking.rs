use std::cmp::Ordering;

use mdc_core::SectorEntry;

fn ranking_order(a: &SectorEntry, b: &SectorEntry) -> Ordering {
    b.change_percent
        .total_cmp(&a.change_percent)
        .then_with(|| a.sector_code.cmp(&b.sector_code))
}

/// Sort by change percent descending (ties by code ascending), keep the top
/// `top_n` (all when zero) and assign 1-based ranks. Re-ranking a ranked
/// list leaves it unchanged.
pub fn rank_sectors(mut entries: Vec<SectorEntry>, top_n: usize) -> Vec<SectorEntry> {
    entries.sort_by(ranking_order);
    if top_n > 0 {
        entries.truncate(top_n);
    }
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = u32::try_from(index + 1).unwrap_or(u32::MAX);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mdc_core::SectorBoard;

    fn entry(code: &str, change_percent: f64) -> SectorEntry {
        SectorEntry {
            board: SectorBoard::Industry,
            sector_name: format!("sector {code}"),
            sector_code: code.into(),
            rank: 0,
            change_percent,
            total_market_cap: None,
            turnover_rate: None,
            advancing_count: None,
            declining_count: None,
            lead_stock_name: None,
            lead_stock_change_percent: None,
            polled_at: Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).single().unwrap(),
            source_id: "eastmoney".into(),
        }
    }

    fn codes(entries: &[SectorEntry]) -> Vec<(&str, u32)> {
        entries.iter().map(|e| (e.sector_code.as_str(), e.rank)).collect()
    }

    #[test]
    fn ties_break_on_ascending_code() {
        let ranked = rank_sectors(
            vec![entry("000001", 5.2), entry("000002", 5.2), entry("000003", 7.1)],
            0,
        );
        assert_eq!(
            codes(&ranked),
            vec![("000003", 1), ("000001", 2), ("000002", 3)]
        );
    }

    #[test]
    fn ranking_is_idempotent() {
        let once = rank_sectors(
            vec![entry("b", -1.0), entry("a", 3.0), entry("c", 3.0), entry("d", 0.0)],
            0,
        );
        let twice = rank_sectors(once.clone(), 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn top_n_truncates_after_sorting() {
        let ranked = rank_sectors(
            vec![entry("a", 1.0), entry("b", 4.0), entry("c", 2.0), entry("d", 3.0)],
            2,
        );
        assert_eq!(codes(&ranked), vec![("b", 1), ("d", 2)]);
    }

    #[test]
    fn ranks_are_a_permutation_of_one_to_n() {
        let ranked = rank_sectors(
            (0..25)
                .map(|i| entry(&format!("{:06}", i), ((i * 7) % 5) as f64))
                .collect(),
            0,
        );
        let ranks: Vec<u32> = ranked.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=25).collect::<Vec<u32>>());
        for pair in ranked.windows(2) {
            assert!(pair[0].change_percent >= pair[1].change_percent);
        }
    }
}
