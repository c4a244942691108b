mod common;

use common::fixture;
use serde_json::{Map, Value, json};
use tripbasket_media::services::document_service::DocumentError;

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[tokio::test]
async fn put_then_get_returns_the_document() {
    let fx = fixture().await;
    fx.documents
        .put("trips", "t1", object(json!({"title": "Dahab", "image": "images/a.png"})))
        .await
        .unwrap();

    let doc = fx.documents.get("trips", "t1").await.unwrap();
    assert_eq!(doc.data["title"], "Dahab");
    assert_eq!(doc.field_str("image"), Some("images/a.png"));
    assert!(matches!(
        fx.documents.get("trips", "t2").await,
        Err(DocumentError::NotFound { .. })
    ));
}

#[tokio::test]
async fn find_by_field_matches_exact_strings_within_a_collection() {
    let fx = fixture().await;
    for (collection, id, image) in [
        ("trips", "t1", "images/a.png"),
        ("trips", "t2", "images/a.png.bak"),
        ("trips", "t3", "images/a.png"),
        ("agencies", "a1", "images/a.png"),
    ] {
        fx.documents
            .put(collection, id, object(json!({"image": image})))
            .await
            .unwrap();
    }

    let found = fx
        .documents
        .find_by_field("trips", "image", "images/a.png")
        .await
        .unwrap();
    let ids: Vec<_> = found.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t3"]);

    // field names cannot smuggle JSON path syntax
    assert!(matches!(
        fx.documents.find_by_field("trips", "image\".x", "a").await,
        Err(DocumentError::InvalidName(_))
    ));
}

#[tokio::test]
async fn update_fields_merges_and_requires_existing_document() {
    let fx = fixture().await;
    fx.documents
        .put("users", "u1", object(json!({"name": "Mona", "photo_url": "images/u.png"})))
        .await
        .unwrap();

    fx.documents
        .update_fields(
            "users",
            "u1",
            object(json!({
                "photo_url": "images/optimized_u.webp",
                "photoUrl": "http://x",
                "dims": {"w": 32, "h": 32}
            })),
        )
        .await
        .unwrap();
    let doc = fx.documents.get("users", "u1").await.unwrap();
    assert_eq!(doc.data["name"], "Mona");
    assert_eq!(doc.data["photo_url"], "images/optimized_u.webp");
    assert_eq!(doc.data["photoUrl"], "http://x");
    assert_eq!(doc.data["dims"]["w"], 32);

    assert!(matches!(
        fx.documents
            .update_fields("users", "ghost", object(json!({"a": 1})))
            .await,
        Err(DocumentError::NotFound { .. })
    ));
}
