//! Operational limits enforced by the codec and registries.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest single wire record body the decoder will accept.
    pub max_record_bytes: usize,
    /// Largest number of records accepted from one transport frame.
    pub max_frame_records: usize,
    /// Largest string field (keys, priority keys, column names) on the wire.
    pub max_key_bytes: usize,
    /// Largest opaque blob (set/list elements, signal payloads) on the wire.
    pub max_blob_bytes: usize,
    /// Most tag pairs a subject may carry.
    pub max_subject_tags: usize,
    /// Most elements accepted in one set/list/dict-map wire collection.
    pub max_collection_items: usize,

    /// Control messages the aggregator will queue while demand is exhausted.
    pub max_pending_control: usize,
    /// Aggregators one location registry will fan changes out to.
    pub max_registry_subscribers: usize,
    /// Subscribers one endpoint will serve.
    pub max_endpoint_subscribers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_record_bytes: 1 << 20,
            max_frame_records: 1024,
            max_key_bytes: 256,
            max_blob_bytes: 1 << 18,
            max_subject_tags: 32,
            max_collection_items: 64 * 1024,
            max_pending_control: 4096,
            max_registry_subscribers: 1024,
            max_endpoint_subscribers: 1024,
        }
    }
}
