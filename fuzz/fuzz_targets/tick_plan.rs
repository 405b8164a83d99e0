#![no_main]

use libfuzzer_sys::fuzz_target;
use mirrorhost_core::filter::ItemFilter;
use mirrorhost_core::model::{History, HistoryPoint, ItemId, ItemMapping, ReplayCursor};
use mirrorhost_core::replay::plan_tick;

// Each 4-byte chunk describes one item: history length, mapping tag,
// cursor position, value seed.
fuzz_target!(|data: &[u8]| {
    let mut history = History::new();
    let mut mapping = ItemMapping::new();
    let mut cursor = ReplayCursor::new();

    for (i, chunk) in data.chunks_exact(4).take(32).enumerate() {
        let id = ItemId::from(i as u64);
        let len = usize::from(chunk[0] % 24);
        let points = (0..len)
            .map(|n| HistoryPoint::new(n as i64, i64::from(chunk[3]) + n as i64))
            .collect();
        history.insert(id.clone(), points);

        match chunk[1] % 4 {
            0 => {}
            1 => {
                mapping.insert(id.clone(), "MTR.latency".to_string());
            }
            _ => {
                mapping.insert(id.clone(), format!("trapper.item{i}"));
            }
        }
        if chunk[2] % 3 != 0 {
            cursor.advance(id, usize::from(chunk[2] % 32));
        }
    }

    let filter = ItemFilter::new(vec!["MTR".to_string()]);
    let mut cursor = cursor;
    for _ in 0..26 {
        let Ok(plan) = plan_tick(&history, &mapping, &cursor, &filter) else {
            // Only a stale cursor may be rejected.
            assert!(cursor.iter().any(|(id, idx)| {
                history.get(id).is_some_and(|points| idx >= points.len())
            }));
            return;
        };

        assert!(plan.staged.len() <= plan.replayable_items);
        assert!(plan.sent_points <= plan.total_points);
        assert!((0.0..=100.0).contains(&plan.progress()));
        for staged in &plan.staged {
            assert!(!staged.key.starts_with("MTR"));
            assert!(staged.index < history[&staged.item_id].len());
        }
        cursor = if plan.cycle_complete {
            ReplayCursor::new()
        } else {
            plan.cursor
        };
    }
});
