use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Sliding-window limiter over caller-chosen string keys. The key table
// is bounded; once full, the most idle keys are evicted first.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut table = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !table.contains_key(key) && table.len() >= self.max_keys {
            evict_idle(&mut table, now, self.window, self.max_keys);
        }

        let stamps = table.entry(key.to_string()).or_default();
        prune(stamps, now, self.window);
        if stamps.len() >= limit as usize {
            return false;
        }
        stamps.push_back(now);

        true
    }
}

fn evict_idle(
    table: &mut HashMap<String, VecDeque<Instant>>,
    now: Instant,
    window: Duration,
    max_keys: usize,
) {
    table.retain(|_, stamps| {
        prune(stamps, now, window);
        !stamps.is_empty()
    });

    // Still full after dropping expired keys: sacrifice the ones whose
    // latest event is oldest.
    while table.len() >= max_keys {
        let Some(victim) = table
            .iter()
            .min_by_key(|(_, stamps)| stamps.back().copied())
            .map(|(key, _)| key.clone())
        else {
            break;
        };
        table.remove(&victim);
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = stamps.front() {
        if now.duration_since(*front) > window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}
