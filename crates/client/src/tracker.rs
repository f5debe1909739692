use std::collections::HashMap;

// Per-item progress held in memory only. A fresh page load starts empty;
// the authoritative item state stays on the server.
#[derive(Debug, Default)]
pub struct UploadTracker {
    items: HashMap<i64, ItemProgress>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ItemProgress {
    upload_count: u32,
    completed: bool,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_upload(&mut self, item_id: i64) {
        self.items.entry(item_id).or_default().upload_count += 1;
    }

    pub fn mark_completed(&mut self, item_id: i64) {
        self.items.entry(item_id).or_default().completed = true;
    }

    pub fn upload_count(&self, item_id: i64) -> u32 {
        self.items
            .get(&item_id)
            .map(|progress| progress.upload_count)
            .unwrap_or(0)
    }

    pub fn is_completed(&self, item_id: i64) -> bool {
        self.items
            .get(&item_id)
            .map(|progress| progress.completed)
            .unwrap_or(false)
    }

    /// Filters `item_ids` down to the ones not yet marked completed,
    /// keeping the input order.
    pub fn pending(&self, item_ids: &[i64]) -> Vec<i64> {
        item_ids
            .iter()
            .copied()
            .filter(|item_id| !self.is_completed(*item_id))
            .collect()
    }
}
