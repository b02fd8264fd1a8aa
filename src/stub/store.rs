use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
};

use bson::{Bson, DateTime, Document, doc, oid::ObjectId};
use log::{debug, warn};

type Collection = BTreeMap<String, Document>;

const MANDATORY: [&str; 4] = ["action", "database", "collection", "document"];

pub(crate) fn error_response(message: &str) -> Document {
    doc! { "error": message }
}

pub(crate) fn missing_fields() -> Document {
    doc! { "error": "Missing mandatory field(s).", "fields": MANDATORY.to_vec() }
}

/// In-memory documents grouped by `(database, collection)`, ordered by `_id`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<(String, String), Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer one request envelope.
    pub fn process(&self, request: &Document) -> Document {
        let (Ok(action), Ok(database), Ok(collection), Ok(document)) = (
            request.get_str("action"),
            request.get_str("database"),
            request.get_str("collection"),
            request.get_document("document"),
        ) else {
            return missing_fields();
        };
        let options = request.get_document("options").ok();
        debug!("{action} on {database}:{collection}");

        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let docs = collections
            .entry((database.to_string(), collection.to_string()))
            .or_default();

        let mut response = match action {
            "create" => create(docs, document),
            "retrieve" => retrieve(docs, document, options),
            "update" => update(docs, document),
            "delete" => delete(docs, document),
            "count" => doc! { "count": count(docs, document) },
            other => {
                warn!("unsupported action '{other}'");
                error_response(&format!("Unsupported action {other}"))
            }
        };

        if matches!(action, "create" | "update") && !response.contains_key("error") {
            response.insert("database", database);
            response.insert("collection", collection);
        }
        response
    }

    pub fn len(&self, database: &str, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(database.to_string(), collection.to_string()))
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, database: &str, collection: &str) -> bool {
        self.len(database, collection) == 0
    }
}

fn key(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) => Some(*n as i64),
        _ => None,
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

fn version(entity: Bson) -> Document {
    doc! { "_id": ObjectId::new(), "entity": entity, "created": DateTime::now() }
}

fn create(docs: &mut Collection, document: &Document) -> Document {
    let mut document = document.clone();
    let id = match document.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            document.insert("_id", id.clone());
            id
        }
    };

    let k = key(&id);
    if docs.contains_key(&k) {
        return error_response("Document with _id already exists");
    }
    docs.insert(k, document);
    version(id)
}

fn retrieve(docs: &Collection, filter: &Document, options: Option<&Document>) -> Document {
    if let Some(id) = filter.get("_id").filter(|id| matches!(id, Bson::ObjectId(_))) {
        return match docs.get(&key(id)) {
            Some(doc) if matches_filter(doc, filter) => doc! { "result": doc.clone() },
            _ => error_response("Not found"),
        };
    }

    let descending = options
        .and_then(|o| o.get_document("sort").ok())
        .and_then(|s| s.get("_id"))
        .and_then(as_int)
        .is_some_and(|order| order < 0);
    let skip = options
        .and_then(|o| o.get("skip"))
        .and_then(as_int)
        .unwrap_or(0)
        .max(0) as usize;
    let limit = options
        .and_then(|o| o.get("limit"))
        .and_then(as_int)
        .filter(|l| *l > 0)
        .map_or(usize::MAX, |l| l as usize);

    let matching = docs.values().filter(|d| matches_filter(d, filter));
    let results: Vec<Bson> = if descending {
        matching.rev().skip(skip).take(limit).cloned().map(Bson::Document).collect()
    } else {
        matching.skip(skip).take(limit).cloned().map(Bson::Document).collect()
    };
    doc! { "results": results }
}

fn update(docs: &mut Collection, document: &Document) -> Document {
    if let Some(id) = document.get("_id") {
        let Some(stored) = docs.get_mut(&key(id)) else {
            return error_response("Not found");
        };
        merge(stored, document);
        return version(id.clone());
    }

    let (Ok(filter), Ok(spec)) = (document.get_document("filter"), document.get_document("update"))
    else {
        return error_response("Invalid update specification");
    };
    let fields = spec.get_document("$set").unwrap_or(spec);

    let mut success = Vec::new();
    for doc in docs.values_mut().filter(|d| matches_filter(d, filter)) {
        merge(doc, fields);
        if let Some(id) = doc.get("_id") {
            success.push(id.clone());
        }
    }
    doc! { "success": success, "failure": [], "history": [] }
}

fn merge(stored: &mut Document, fields: &Document) {
    for (k, v) in fields.iter().filter(|(k, _)| *k != "_id") {
        stored.insert(k, v.clone());
    }
}

fn delete(docs: &mut Collection, filter: &Document) -> Document {
    let removed: Vec<String> = docs
        .iter()
        .filter(|(_, d)| matches_filter(d, filter))
        .map(|(k, _)| k.clone())
        .collect();

    let success: Vec<Bson> = removed
        .iter()
        .filter_map(|k| docs.remove(k))
        .filter_map(|d| d.get("_id").cloned())
        .collect();
    doc! { "success": success, "failure": [], "history": [] }
}

fn count(docs: &Collection, filter: &Document) -> i64 {
    docs.values().filter(|d| matches_filter(d, filter)).count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str, document: Document) -> Document {
        doc! {
            "action": action,
            "database": "itest",
            "collection": "test",
            "document": document,
            "application": "surge",
            "skipVersion": false,
        }
    }

    #[test]
    fn store_create_and_retrieve() {
        let store = MemoryStore::new();
        let id = ObjectId::new();

        let created = store.process(&request("create", doc! { "_id": id, "key": "value" }));
        assert_eq!(created.get_object_id("entity").unwrap(), id);
        assert_eq!(created.get_str("database").unwrap(), "itest");

        let found = store.process(&request("retrieve", doc! { "_id": id }));
        let result = found.get_document("result").unwrap();
        assert_eq!(result.get_str("key").unwrap(), "value");
    }

    #[test]
    fn store_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let id = ObjectId::new();

        store.process(&request("create", doc! { "_id": id }));
        let dup = store.process(&request("create", doc! { "_id": id }));

        assert!(dup.get_str("error").is_ok());
        assert_eq!(store.len("itest", "test"), 1);
    }

    #[test]
    fn store_missing_fields() {
        let store = MemoryStore::new();
        let response = store.process(&doc! { "action": "create", "database": "itest" });

        assert_eq!(response.get_str("error").unwrap(), "Missing mandatory field(s).");
        assert_eq!(response.get_array("fields").unwrap().len(), 4);
    }

    #[test]
    fn store_retrieve_sorted_and_limited() {
        let store = MemoryStore::new();
        let ids: Vec<ObjectId> = (0..5).map(|_| ObjectId::new()).collect();
        for id in &ids {
            store.process(&request("create", doc! { "_id": *id }));
        }

        let mut req = request("retrieve", doc! {});
        req.insert("options", doc! { "sort": { "_id": -1 }, "limit": 2_i64 });
        let response = store.process(&req);
        let results = response.get_array("results").unwrap();

        assert_eq!(results.len(), 2);
        let first = results[0].as_document().unwrap().get_object_id("_id").unwrap();
        assert_eq!(first, ids[4]);
    }

    #[test]
    fn store_update_by_id_and_by_query() {
        let store = MemoryStore::new();
        let id = ObjectId::new();
        store.process(&request("create", doc! { "_id": id, "n": 1 }));

        store.process(&request("update", doc! { "_id": id, "n": 2 }));
        let response = store.process(&request(
            "update",
            doc! { "filter": { "_id": id }, "update": { "$set": { "tag": "q" } } },
        ));
        assert_eq!(response.get_array("success").unwrap().len(), 1);

        let found = store.process(&request("retrieve", doc! { "_id": id }));
        let result = found.get_document("result").unwrap();
        assert_eq!(result.get_i32("n").unwrap(), 2);
        assert_eq!(result.get_str("tag").unwrap(), "q");
    }

    #[test]
    fn store_delete_and_count() {
        let store = MemoryStore::new();
        for n in 0..4 {
            store.process(&request("create", doc! { "n": n % 2 }));
        }

        let counted = store.process(&request("count", doc! { "n": 1 }));
        assert_eq!(counted.get_i64("count").unwrap(), 2);

        let deleted = store.process(&request("delete", doc! { "n": 1 }));
        assert_eq!(deleted.get_array("success").unwrap().len(), 2);
        assert_eq!(store.len("itest", "test"), 2);

        let missing = store.process(&request("update", doc! { "_id": ObjectId::new() }));
        assert_eq!(missing.get_str("error").unwrap(), "Not found");
    }
}
