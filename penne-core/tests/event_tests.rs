// Copyright 2026 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use bson::{doc, oid::ObjectId, Bson, Document};
use chrono::{TimeZone, Utc};
use penne_core::event::{key_fingerprint, ChangeEvent, Namespace, OperationType};

fn event(operation: OperationType, key: Option<Document>, full: Option<Document>) -> ChangeEvent {
    ChangeEvent {
        operation,
        namespace: Namespace::new("testdb", "users"),
        document_key: key,
        full_document: full,
        cluster_time: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap(),
        resume_token: doc! { "_data": "8265F1C2A4000000012B" },
    }
}

#[test]
fn test_operation_type_serialization() {
    let json = serde_json::to_string(&OperationType::Update).unwrap();
    assert_eq!(json, "\"update\"");

    let other: OperationType = serde_json::from_str("\"replace\"").unwrap();
    assert_eq!(other, OperationType::Other("replace".to_string()));
    assert!(!other.is_replicable());
    assert_eq!(serde_json::to_string(&other).unwrap(), "\"replace\"");
}

#[test]
fn test_namespace_creation() {
    let ns = Namespace::new("testdb", "users");
    assert_eq!(ns.database, "testdb");
    assert_eq!(ns.collection, "users");
    assert_eq!(ns.full_name(), "testdb.users");
    assert_eq!(ns.to_string(), "testdb.users");
}

#[test]
fn test_change_event_insert() {
    let event = event(
        OperationType::Insert,
        Some(doc! { "_id": 123 }),
        Some(doc! { "_id": 123, "name": "Alice" }),
    );

    assert!(event.is_replicable());
    assert_eq!(event.document_id(), Some(&Bson::Int32(123)));
    assert_eq!(event.key_fingerprint(), Some(key_fingerprint(&doc! { "_id": 123 })));
}

#[test]
fn test_change_event_delete_is_not_replicable() {
    let event = event(OperationType::Delete, Some(doc! { "_id": 123 }), None);
    assert!(!event.is_replicable());
}

#[test]
fn test_event_without_document_key() {
    let event = event(OperationType::Other("invalidate".into()), None, None);
    assert!(event.document_id().is_none());
    assert!(event.key_fingerprint().is_none());
}

#[test]
fn test_change_event_json_field_names() {
    let event = event(
        OperationType::Insert,
        Some(doc! { "_id": "u1" }),
        Some(doc! { "_id": "u1", "name": "Alice" }),
    );

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["operationType"], "insert");
    assert_eq!(json["ns"]["database"], "testdb");
    assert_eq!(json["ns"]["collection"], "users");
    assert_eq!(json["documentKey"]["_id"], "u1");
    assert_eq!(json["fullDocument"]["name"], "Alice");
    assert_eq!(json["_id"]["_data"], "8265F1C2A4000000012B");
    assert_eq!(json["clusterTime"], "2026-03-01T10:00:00Z");
}

#[test]
fn test_missing_post_image_is_omitted() {
    let event = event(OperationType::Update, Some(doc! { "_id": "u1" }), None);
    let json = serde_json::to_value(&event).unwrap();
    assert!(json.get("fullDocument").is_none());
}

#[test]
fn test_change_event_json_roundtrip() {
    let original = event(
        OperationType::Update,
        Some(doc! { "_id": "u1" }),
        Some(doc! { "_id": "u1", "name": "Bob", "tags": ["a", "b"] }),
    );

    let json = serde_json::to_string(&original).unwrap();
    let decoded: ChangeEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_bson_serialization_roundtrip() {
    let original = event(
        OperationType::Insert,
        Some(doc! { "_id": 7 }),
        Some(doc! { "_id": 7, "total": 99.5, "nested": { "a": 1 } }),
    );

    let bson_doc = bson::to_document(&original).unwrap();
    let decoded: ChangeEvent = bson::from_document(bson_doc).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_fingerprint_is_field_order_sensitive() {
    let id = ObjectId::new();
    let a = doc! { "region": "eu", "_id": id };
    let b = doc! { "_id": id, "region": "eu" };

    assert_eq!(key_fingerprint(&a), key_fingerprint(&a.clone()));
    assert_ne!(key_fingerprint(&a), key_fingerprint(&b));
}
