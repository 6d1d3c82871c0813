use serde::{Deserialize, Serialize};

use crate::entity::{StorageEntity, SyncEntity};
use crate::model::timestamp_now;

/// Entity used by the unit tests; mirrors a typical schema with the two
/// reserved fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TestItem {
    pub id: String,
    pub value1: String,
    pub value2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_identity: Option<String>,
    pub date_created: String,
}

impl TestItem {
    pub fn new(id: &str, value1: &str, value2: &str) -> Self {
        Self {
            id: id.to_string(),
            value1: value1.to_string(),
            value2: value2.to_string(),
            node_identity: Some("did:example:node1".to_string()),
            date_created: timestamp_now(),
        }
    }

    /// A row as it appears inside a published changeset: identity stripped.
    pub fn stripped(id: &str, value1: &str, value2: &str) -> Self {
        Self {
            node_identity: None,
            ..Self::new(id, value1, value2)
        }
    }

    pub fn with_created(mut self, timestamp: &str) -> Self {
        self.date_created = timestamp.to_string();
        self
    }
}

impl StorageEntity for TestItem {
    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

impl SyncEntity for TestItem {
    fn node_identity(&self) -> Option<&str> {
        self.node_identity.as_deref()
    }

    fn set_node_identity(&mut self, identity: Option<String>) {
        self.node_identity = identity;
    }

    fn set_date_created(&mut self, timestamp: String) {
        self.date_created = timestamp;
    }
}
