// Session factory statistics - lock-free counters and a serializable snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($name:ident => $incr:ident),* $(,)?) => {
        /// Running counters shared by every session of a factory
        #[derive(Debug)]
        pub struct Statistics {
            start_time: DateTime<Utc>,
            $($name: AtomicU64,)*
        }

        impl Statistics {
            pub fn new() -> Self {
                Self {
                    start_time: Utc::now(),
                    $($name: AtomicU64::new(0),)*
                }
            }

            $(
                pub fn $incr(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    start_time: self.start_time,
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }

        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct StatisticsSnapshot {
            pub start_time: DateTime<Utc>,
            $(pub $name: u64,)*
        }
    };
}

counters! {
    sessions_opened => session_opened,
    sessions_closed => session_closed,
    transactions => transaction_started,
    successful_transactions => transaction_committed,
    flushes => flushed,
    entity_loads => entity_loaded,
    entity_fetches => entity_fetched,
    entity_inserts => entity_inserted,
    entity_updates => entity_updated,
    entity_deletes => entity_deleted,
    collection_recreates => collection_recreated,
    collection_updates => collection_updated,
    collection_removes => collection_removed,
    cache_hits => cache_hit,
    cache_misses => cache_miss,
    cache_puts => cache_put,
    optimistic_failures => optimistic_failure,
    statements => statement_prepared,
    queries => query_executed,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.entity_inserted();
        stats.entity_inserted();
        stats.flushed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.entity_inserts, 2);
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.entity_deletes, 0);

        stats.clear();
        assert_eq!(stats.snapshot().entity_inserts, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Statistics::new();
        stats.cache_hit();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["cache_hits"], 1);
    }
}
