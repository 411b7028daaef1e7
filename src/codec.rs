//! Record codecs for data persisted in the coordination store
//!
//! Every entry in the cluster tree holds exactly one serialized record. A
//! record is always written whole, so a watcher can never observe a
//! half-updated record.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{
    IndexRecord, MasterRecord, MetricsRecord, NodeRecord, ServingMarker, ShardAssignment,
    ShardRecord,
};

/// A value that can be stored as the data of a cluster tree entry
pub trait Record: Serialize + DeserializeOwned + Sized {
    /// Name used in codec error messages
    const KIND: &'static str;

    /// Serialize the whole record
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::codec(Self::KIND, e.to_string()))
    }

    /// Deserialize a record previously produced by [`Record::encode`]
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::codec(Self::KIND, "empty record"));
        }
        serde_json::from_slice(bytes).map_err(|e| Error::codec(Self::KIND, e.to_string()))
    }
}

impl Record for IndexRecord {
    const KIND: &'static str = "index record";
}

impl Record for ShardRecord {
    const KIND: &'static str = "shard record";
}

impl Record for ShardAssignment {
    const KIND: &'static str = "shard assignment";
}

impl Record for ServingMarker {
    const KIND: &'static str = "serving marker";
}

impl Record for NodeRecord {
    const KIND: &'static str = "node record";
}

impl Record for MasterRecord {
    const KIND: &'static str = "master record";
}

impl Record for MetricsRecord {
    const KIND: &'static str = "metrics record";
}

/// One-line human readable summary of an entry's data, used by `show-structure`
pub fn summarize(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(value) => value.to_string(),
        Err(_) => format!("<{} bytes>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricValues, NodeId, NodeStatus};

    #[test]
    fn test_index_record_codec() {
        let record = IndexRecord::new("docs", "/data/docs", "standard", 2);
        let bytes = record.encode().unwrap();
        let decoded = IndexRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert!(!decoded.deployed);
    }

    #[test]
    fn test_decode_empty_fails() {
        let err = NodeRecord::decode(&[]).unwrap_err();
        assert!(err.to_string().contains("node record"));
    }

    #[test]
    fn test_decode_wrong_kind_fails() {
        let bytes = NodeRecord::new(NodeId::from("n1:2000"), "n1").encode().unwrap();
        assert!(IndexRecord::decode(&bytes).is_err());
    }

    #[test]
    fn test_node_status_encoding() {
        let mut record = NodeRecord::new(NodeId::from("n1:2000"), "n1");
        record.status = NodeStatus::ShuttingDown;
        let text = String::from_utf8(record.encode().unwrap()).unwrap();
        assert!(text.contains("\"shutting_down\""));
    }

    #[test]
    fn test_metrics_absent_fields_omitted() {
        let values = MetricValues {
            open_shards: Some(3),
            ..Default::default()
        };
        let record = MetricsRecord::new(NodeId::from("n1:2000"), values);
        let text = String::from_utf8(record.encode().unwrap()).unwrap();
        assert!(text.contains("open_shards"));
        assert!(!text.contains("resident_bytes"));

        let decoded = MetricsRecord::decode(text.as_bytes()).unwrap();
        assert_eq!(decoded.values.open_shards, Some(3));
        assert_eq!(decoded.values.resident_bytes, None);
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(b""), "");
        assert_eq!(summarize(b"{\"a\":1}"), "{\"a\":1}");
        assert_eq!(summarize(&[0xff, 0x00]), "<2 bytes>");
    }
}
