//! Index settings and field mappings for access-log documents.

use serde_json::{json, Map, Value};

use crate::config::SearchConfig;

/// Fields indexed as full text with an exact-match `keyword` sub-field.
pub const TEXT_FIELDS: &[&str] = &[
    "method", "host", "path", "ip", "traceno", "trace_id", "span_id", "message",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub shards: u32,
    pub replicas: u32,
}

impl Default for IndexSchema {
    fn default() -> Self {
        Self {
            shards: 1,
            replicas: 0,
        }
    }
}

impl IndexSchema {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            shards: config.shards,
            replicas: config.replicas,
        }
    }

    pub fn mappings(&self) -> Value {
        let mut properties = Map::new();
        for field in TEXT_FIELDS {
            properties.insert(
                field.to_string(),
                json!({
                    "type": "text",
                    "fields": { "keyword": { "type": "keyword" } }
                }),
            );
        }
        properties.insert("timestamp".to_string(), json!({ "type": "date" }));
        properties.insert("response_time".to_string(), json!({ "type": "double" }));
        properties.insert("tags".to_string(), json!({ "type": "object", "dynamic": true }));

        json!({ "properties": properties })
    }

    /// Body of an index-creation request.
    pub fn to_json(&self) -> Value {
        json!({
            "settings": {
                "number_of_shards": self.shards,
                "number_of_replicas": self.replicas,
            },
            "mappings": self.mappings(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_time_keeps_fractions() {
        let body = IndexSchema::default().to_json();
        assert_eq!(body["mappings"]["properties"]["response_time"]["type"], "double");
        assert_eq!(body["mappings"]["properties"]["timestamp"]["type"], "date");
    }

    #[test]
    fn text_fields_have_keyword_subfield() {
        let mappings = IndexSchema::default().mappings();
        for field in TEXT_FIELDS {
            assert_eq!(mappings["properties"][field]["type"], "text");
            assert_eq!(
                mappings["properties"][field]["fields"]["keyword"]["type"],
                "keyword"
            );
        }
    }

    #[test]
    fn settings_follow_config() {
        let mut config = SearchConfig::default();
        config.shards = 3;
        config.replicas = 2;
        let body = IndexSchema::from_config(&config).to_json();
        assert_eq!(body["settings"]["number_of_shards"], 3);
        assert_eq!(body["settings"]["number_of_replicas"], 2);
    }
}
