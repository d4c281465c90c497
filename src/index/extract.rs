//! Per-resource-type summary extraction for index documents.
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{FileRecord, ResourceType};

/// Summary of one document as it appears in the index `items` list.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSummary {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// One secondary-index entry contributed by an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub index: &'static str,
    pub key: String,
    /// Unique indexes map a key to a single id; grouped ones to a list.
    pub unique: bool,
}

impl IndexKey {
    fn grouped(index: &'static str, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            unique: false,
        }
    }

    fn unique(index: &'static str, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            unique: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub item: ItemSummary,
    pub keys: Vec<IndexKey>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
}

pub trait IndexExtractor: Send + Sync {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError>;
}

pub struct PagesExtractor;
pub struct EndpointsExtractor;
pub struct RelationshipsExtractor;
pub struct PostmanExtractor;
pub struct N8nExtractor;
pub struct GenericExtractor;

/// Exhaustive dispatch; adding a resource type fails to compile until it
/// gets an extractor.
pub fn extractor_for(resource_type: ResourceType) -> &'static dyn IndexExtractor {
    match resource_type {
        ResourceType::Pages => &PagesExtractor,
        ResourceType::Endpoints => &EndpointsExtractor,
        ResourceType::Relationships => &RelationshipsExtractor,
        ResourceType::Postman => &PostmanExtractor,
        ResourceType::N8n => &N8nExtractor,
        ResourceType::Project | ResourceType::Result | ResourceType::Media => &GenericExtractor,
    }
}

/// First non-empty string (or number rendered as string) among `names`.
fn text(doc: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match doc.get(*name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Stable id for documents without an explicit one: subdirectory plus stem.
fn path_id(record: &FileRecord) -> String {
    match &record.subdirectory {
        Some(sub) => format!("{}/{}", sub, record.stem()),
        None => record.stem().to_string(),
    }
}

fn put(fields: &mut Map<String, Value>, name: &str, value: Option<String>) {
    fields.insert(name.to_string(), value.map_or(Value::Null, Value::String));
}

impl IndexExtractor for PagesExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = text(doc, &["page_id", "id"]).ok_or(ExtractError::MissingField("page_id"))?;
        let page_type = text(doc, &["page_type", "type"]).unwrap_or_else(|| "unknown".into());
        let route = text(doc, &["route", "path"]);

        let mut keys = vec![IndexKey::grouped("by_type", &page_type)];
        if let Some(route) = &route {
            keys.push(IndexKey::unique("by_route", route));
        }

        let mut fields = Map::new();
        put(&mut fields, "page_id", Some(id.clone()));
        put(&mut fields, "page_type", Some(page_type));
        put(&mut fields, "route", route);
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys,
        })
    }
}

impl IndexExtractor for EndpointsExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = text(doc, &["endpoint_id", "id"]).ok_or(ExtractError::MissingField("endpoint_id"))?;
        let method = text(doc, &["method", "http_method"])
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "UNKNOWN".into());
        let api_version = text(doc, &["api_version", "version"]).unwrap_or_else(|| "unknown".into());
        let path = text(doc, &["path", "endpoint_path", "url"]);

        let mut keys = vec![
            IndexKey::grouped("by_method", &method),
            IndexKey::grouped("by_api_version", &api_version),
        ];
        if let Some(path) = &path {
            keys.push(IndexKey::grouped("by_path", path));
        }

        let mut fields = Map::new();
        put(&mut fields, "endpoint_id", Some(id.clone()));
        put(&mut fields, "method", Some(method));
        put(&mut fields, "api_version", Some(api_version));
        put(&mut fields, "path", path);
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys,
        })
    }
}

impl IndexExtractor for RelationshipsExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = text(doc, &["relationship_id", "id"]).unwrap_or_else(|| path_id(record));
        let page_id = text(doc, &["page_id", "page"]);
        let endpoint_id = text(doc, &["endpoint_id", "endpoint"]);
        let direction = record.subdirectory.clone().unwrap_or_else(|| "root".into());

        let mut keys = vec![IndexKey::grouped("by_direction", &direction)];
        if let Some(page) = &page_id {
            keys.push(IndexKey::grouped("by_page", page));
        }
        if let Some(endpoint) = &endpoint_id {
            keys.push(IndexKey::grouped("by_endpoint", endpoint));
        }

        let mut fields = Map::new();
        put(&mut fields, "relationship_id", Some(id.clone()));
        put(&mut fields, "page_id", page_id);
        put(&mut fields, "endpoint_id", endpoint_id);
        put(&mut fields, "direction", Some(direction));
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys,
        })
    }
}

/// Requests are leaves of the `item` tree that carry a `request` member.
fn count_requests(items: &Value) -> u64 {
    match items {
        Value::Array(list) => list.iter().map(count_requests).sum(),
        Value::Object(obj) => {
            let own = u64::from(obj.contains_key("request"));
            own + obj.get("item").map_or(0, count_requests)
        }
        _ => 0,
    }
}

impl IndexExtractor for PostmanExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = path_id(record);
        let kind = record.subdirectory.clone().unwrap_or_else(|| "root".into());
        let name = doc
            .get("info")
            .and_then(Value::as_object)
            .and_then(|info| text(info, &["name"]))
            .or_else(|| text(doc, &["name"]));

        let mut fields = Map::new();
        put(&mut fields, "postman_id", Some(id.clone()));
        put(&mut fields, "name", name);
        put(&mut fields, "kind", Some(kind.clone()));
        if let Some(items) = doc.get("item") {
            fields.insert("request_count".into(), Value::from(count_requests(items)));
        }
        if let Some(values) = doc.get("values").and_then(Value::as_array) {
            fields.insert("variable_count".into(), Value::from(values.len()));
        }
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys: vec![IndexKey::grouped("by_kind", kind)],
        })
    }
}

impl IndexExtractor for N8nExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = text(doc, &["workflow_id", "id"]).unwrap_or_else(|| record.stem().to_string());
        let name = text(doc, &["name"]);
        let active = doc.get("active").and_then(Value::as_bool).unwrap_or(false);

        let mut fields = Map::new();
        put(&mut fields, "workflow_id", Some(id.clone()));
        put(&mut fields, "name", name);
        fields.insert("active".into(), Value::Bool(active));
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys: vec![IndexKey::grouped("by_active", active.to_string())],
        })
    }
}

impl IndexExtractor for GenericExtractor {
    fn extract(&self, record: &FileRecord, doc: &Map<String, Value>) -> Result<Extraction, ExtractError> {
        let id = path_id(record);
        let subdirectory = record.subdirectory.clone().unwrap_or_else(|| "root".into());

        let mut fields = Map::new();
        put(&mut fields, "id", Some(id.clone()));
        put(&mut fields, "name", text(doc, &["name", "title"]));
        put(&mut fields, "subdirectory", Some(subdirectory.clone()));
        put(&mut fields, "file_name", Some(record.name.clone()));
        Ok(Extraction {
            item: ItemSummary { id, fields },
            keys: vec![IndexKey::grouped("by_subdirectory", subdirectory)],
        })
    }
}
