// Identifier generation - snowflake, increment and UUID strategies
// Snowflake layout: [timestamp:42][node_id:10][sequence:12]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use crate::core::Identifier;
use crate::error::{AppError, AppResult};

/// Time-ordered 64-bit identifiers, 4096 per millisecond per node
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node_id: u16,
    sequence: AtomicU64,
    last_timestamp: AtomicU64,
}

impl SnowflakeGenerator {
    pub fn new(node_id: u16) -> AppResult<Self> {
        if node_id >= 1024 {
            return Err(AppError::ConfigurationError(format!(
                "Node id must be less than 1024, got {}",
                node_id
            )));
        }
        Ok(Self {
            node_id,
            sequence: AtomicU64::new(0),
            last_timestamp: AtomicU64::new(0),
        })
    }

    /// Generator with a random node id
    pub fn random() -> Self {
        Self {
            node_id: rand::random::<u16>() % 1024,
            sequence: AtomicU64::new(0),
            last_timestamp: AtomicU64::new(0),
        }
    }

    fn now_millis() -> AppResult<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|e| AppError::IdGenerationError(format!("Clock went backwards: {}", e)))
    }

    pub fn next_id(&self) -> AppResult<i64> {
        loop {
            let now = Self::now_millis()?;
            let last_ts = self.last_timestamp.load(Ordering::Relaxed);

            let sequence = if now == last_ts {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                if seq >= 4096 {
                    // Sequence exhausted for this millisecond
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                seq
            } else {
                self.last_timestamp.store(now, Ordering::Relaxed);
                self.sequence.store(1, Ordering::Relaxed);
                0
            };

            let id = ((now & 0x3FF_FFFF_FFFF) << 22)
                | ((self.node_id as u64) << 12)
                | (sequence & 0xFFF);
            return Ok(id as i64);
        }
    }

    pub fn extract_node_id(id: i64) -> u16 {
        ((id as u64) >> 12 & 0x3FF) as u16
    }

    pub fn extract_sequence(id: i64) -> u16 {
        ((id as u64) & 0xFFF) as u16
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }
}

/// In-memory max(id)+1 counters, one per table, seeded from the database
#[derive(Debug, Default)]
pub struct IncrementGenerator {
    counters: Mutex<HashMap<String, i64>>,
}

impl IncrementGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_seeded(&self, table: &str) -> bool {
        self.counters
            .lock()
            .map(|c| c.contains_key(table))
            .unwrap_or(false)
    }

    /// Record the current maximum; keeps the larger value if already seeded
    pub fn seed(&self, table: &str, max_id: i64) -> AppResult<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| AppError::IdGenerationError("Increment counters poisoned".to_string()))?;
        let entry = counters.entry(table.to_string()).or_insert(max_id);
        if *entry < max_id {
            *entry = max_id;
        }
        debug!("Seeded increment counter for {} at {}", table, *entry);
        Ok(())
    }

    pub fn next_id(&self, table: &str) -> AppResult<i64> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| AppError::IdGenerationError("Increment counters poisoned".to_string()))?;
        let counter = counters.get_mut(table).ok_or_else(|| {
            AppError::IdGenerationError(format!("Increment counter for {} not seeded", table))
        })?;
        *counter += 1;
        Ok(*counter)
    }
}

pub fn uuid_identifier() -> Identifier {
    Identifier::Text(Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snowflake_ids() {
        let generator = SnowflakeGenerator::new(123).unwrap();
        let id1 = generator.next_id().unwrap();
        let id2 = generator.next_id().unwrap();

        assert_ne!(id1, id2);
        assert!(id2 > id1);
        assert_eq!(SnowflakeGenerator::extract_node_id(id1), 123);
        assert_eq!(SnowflakeGenerator::extract_node_id(id2), 123);
    }

    #[test]
    fn test_node_id_range() {
        assert!(SnowflakeGenerator::new(1024).is_err());
        assert!(SnowflakeGenerator::random().node_id() < 1024);
    }

    #[test]
    fn test_increment_counters() {
        let generator = IncrementGenerator::new();
        assert!(generator.next_id("authors").is_err());

        generator.seed("authors", 41).unwrap();
        assert_eq!(generator.next_id("authors").unwrap(), 42);
        // reseeding never moves a counter backwards
        generator.seed("authors", 10).unwrap();
        assert_eq!(generator.next_id("authors").unwrap(), 43);
    }

    #[test]
    fn test_uuid_identifier_is_text() {
        let id = uuid_identifier();
        assert!(Uuid::parse_str(id.as_str().unwrap()).is_ok());
    }
}
