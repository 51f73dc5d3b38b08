//! Notification dedup ledger.
//!
//! Each user-facing notification carries a tag. A tag fires once and is then
//! suppressed for as long as it stays in the ledger. How long that is depends
//! on the tag's [`Retention`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Grace period after an emergency condition last held.
pub const EMERGENCY_GRACE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_LEDGER_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Stays until capacity pressure or an explicit `forget`.
    Indefinite,
    /// Evicted a fixed time after firing (rule cooldowns).
    AfterFired(Duration),
    /// Evicted a fixed time after the condition was last observed.
    AfterLastSeen(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupEntry {
    pub tag: String,
    pub fired_at: Instant,
    pub evict_at: Option<Instant>,
    retention: Retention,
}

impl DedupEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.evict_at.map_or(true, |at| now < at)
    }
}

/// Instance-owned ledger of fired tags.
#[derive(Debug)]
pub struct DedupLedger {
    entries: HashMap<String, DedupEntry>,
    capacity: usize,
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl DedupLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an occurrence of `tag`. Returns true when it should fire.
    ///
    /// A live entry suppresses the occurrence; for `AfterLastSeen` tags it
    /// also pushes the eviction deadline out from `now`.
    pub fn observe(&mut self, tag: &str, retention: Retention, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(tag) {
            if entry.is_live(now) {
                if let Retention::AfterLastSeen(grace) = entry.retention {
                    entry.evict_at = Some(now + grace);
                }
                return false;
            }
            self.entries.remove(tag);
        }

        let evict_at = match retention {
            Retention::Indefinite => None,
            Retention::AfterFired(ttl) | Retention::AfterLastSeen(ttl) => Some(now + ttl),
        };
        self.entries.insert(
            tag.to_string(),
            DedupEntry {
                tag: tag.to_string(),
                fired_at: now,
                evict_at,
                retention,
            },
        );
        self.enforce_capacity();
        true
    }

    pub fn contains(&self, tag: &str, now: Instant) -> bool {
        self.entries.get(tag).is_some_and(|e| e.is_live(now))
    }

    pub fn get(&self, tag: &str) -> Option<&DedupEntry> {
        self.entries.get(tag)
    }

    pub fn forget(&mut self, tag: &str) -> bool {
        self.entries.remove(tag).is_some()
    }

    /// Drop expired entries. Returns how many were evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before - self.entries.len()
    }

    pub fn next_eviction(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.evict_at).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn enforce_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.fired_at)
                .map(|e| e.tag.clone());
            match oldest {
                Some(tag) => {
                    self.entries.remove(&tag);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_fires_once_while_present() {
        let now = Instant::now();
        let mut ledger = DedupLedger::default();
        assert!(ledger.observe("safety-evt-1", Retention::Indefinite, now));
        for i in 1..50 {
            assert!(!ledger.observe(
                "safety-evt-1",
                Retention::Indefinite,
                now + Duration::from_secs(i * 3600)
            ));
        }
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_emergency_grace_extends_while_condition_holds() {
        let start = Instant::now();
        let tag = "emergency-A1B2C3-7700";
        let retention = Retention::AfterLastSeen(EMERGENCY_GRACE);
        let mut ledger = DedupLedger::default();

        assert!(ledger.observe(tag, retention, start));
        // Still squawking 9 minutes later
        let last_seen = start + Duration::from_secs(9 * 60);
        assert!(!ledger.observe(tag, retention, last_seen));
        assert_eq!(ledger.get(tag).unwrap().evict_at, Some(last_seen + EMERGENCY_GRACE));

        // 10 minutes after the first sighting but inside the grace of the last
        assert!(!ledger.observe(tag, retention, start + Duration::from_secs(15 * 60)));
    }

    #[test]
    fn test_emergency_recurs_after_grace() {
        let start = Instant::now();
        let tag = "emergency-A1B2C3-7700";
        let retention = Retention::AfterLastSeen(EMERGENCY_GRACE);
        let mut ledger = DedupLedger::default();

        assert!(ledger.observe(tag, retention, start));
        // Reverted to 1200: no observations. Sweep past the grace period.
        let after = start + EMERGENCY_GRACE + Duration::from_secs(1);
        assert_eq!(ledger.sweep(after), 1);
        assert!(ledger.observe(tag, retention, after));
    }

    #[test]
    fn test_expired_entry_refires_without_sweep() {
        let start = Instant::now();
        let mut ledger = DedupLedger::default();
        let cooldown = Retention::AfterFired(Duration::from_secs(60));
        assert!(ledger.observe("rule-r1-A1", cooldown, start));
        assert!(!ledger.observe("rule-r1-A1", cooldown, start + Duration::from_secs(59)));
        assert!(!ledger.contains("rule-r1-A1", start + Duration::from_secs(60)));
        assert!(ledger.observe("rule-r1-A1", cooldown, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let start = Instant::now();
        let mut ledger = DedupLedger::new(2);
        assert!(ledger.observe("a", Retention::Indefinite, start));
        assert!(ledger.observe("b", Retention::Indefinite, start + Duration::from_secs(1)));
        assert!(ledger.observe("c", Retention::Indefinite, start + Duration::from_secs(2)));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get("a").is_none());
        assert!(ledger.forget("b"));
        assert_eq!(ledger.next_eviction(), None);
    }
}
