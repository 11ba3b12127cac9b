//! Inventory records shared by the buffer and the durable repositories

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A pending inventory snapshot held in the write-behind buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedRecord {
    /// Key account that owns this game user, if it could be resolved
    pub owner_id: Option<i64>,
    pub entity_id: String,
    /// Raw request body, stored hex-encoded and never interpreted
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl BufferedRecord {
    pub fn new(owner_id: Option<i64>, entity_id: String, payload: Vec<u8>) -> Self {
        Self {
            owner_id,
            entity_id,
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// The latest persisted snapshot for one game user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInventory {
    pub owner_id: Option<i64>,
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

/// Point in time `threshold` ago, clamped to the earliest representable time
pub fn cutoff(threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_hex_encoded() {
        let record = BufferedRecord::new(Some(3), "42".to_string(), b"{}".to_vec());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"], "7b7d");

        let decoded: BufferedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn cutoff_clamps_huge_thresholds() {
        assert_eq!(cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert!(cutoff(Duration::from_secs(60)) < Utc::now());
    }
}
