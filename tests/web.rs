#![cfg(target_arch = "wasm32")]

use idb_kv::{Error, IndexSpec, Key, KeyRangeDescriptor, StoreClient, StoreSpec};
use serde_json::{json, Value};
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

fn specs() -> Vec<StoreSpec> {
    vec![
        StoreSpec::new("kv").key_path("key"),
        StoreSpec::new("plain"),
        StoreSpec::new("contact")
            .key_path("id")
            .auto_increment(true)
            .index(IndexSpec::new("by_email", "email").unique(true)),
    ]
}

async fn fresh(name: &str) -> StoreClient {
    let client = StoreClient::browser().expect("IndexedDB not available");
    client
        .delete_database(name)
        .await
        .expect("Failed to clear old database");
    assert!(client
        .open_database(name, 1, &specs())
        .await
        .expect("Failed to open indexed DB"));
    client
}

#[wasm_bindgen_test]
async fn open() {
    let client = fresh("open").await;
    assert_eq!(client.version(), Some(1));
    assert_eq!(
        client.store_names(),
        vec!["contact".to_owned(), "kv".to_owned(), "plain".to_owned()]
    );

    // Same version again is not an upgrade.
    assert!(!client.open_database("open", 1, &specs()).await.unwrap());
}

#[wasm_bindgen_test]
async fn first_last_and_ranged_delete() {
    let client = fresh("first_last").await;
    client
        .set_item("kv", &json!({"key": "a", "value": 1}), None)
        .await
        .unwrap();
    client
        .set_item("kv", &json!({"key": "b", "value": 2}), None)
        .await
        .unwrap();

    let first: Option<Value> = client
        .get_first_item("kv", KeyRangeDescriptor::full())
        .await
        .unwrap();
    assert_eq!(first, Some(json!({"key": "a", "value": 1})));
    let last: Option<Value> = client
        .get_last_item("kv", KeyRangeDescriptor::full())
        .await
        .unwrap();
    assert_eq!(last, Some(json!({"key": "b", "value": 2})));

    client
        .delete_items("kv", KeyRangeDescriptor::bound("a", "a"))
        .await
        .unwrap();
    let count = client
        .count_items("kv", KeyRangeDescriptor::full())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[wasm_bindgen_test]
async fn generated_keys_and_unique_index() {
    let client = fresh("contacts").await;
    let ada = json!({"name": "Ada", "email": "ada@example.com"});

    let key = client.set_item("contact", &ada, None).await.unwrap();
    assert_eq!(key, Key::from(1));
    let stored: Option<Value> = client.get_item("contact", key).await.unwrap();
    assert_eq!(stored.unwrap()["id"], json!(1));

    match client.set_item("contact", &ada, None).await.unwrap_err() {
        Error::EngineOperationFailed(e) => assert_eq!(e.name, "ConstraintError"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[wasm_bindgen_test]
async fn iterate_in_key_order() {
    let client = fresh("iterate").await;
    let entries = vec![json!({"key": 3}), json!({"key": 1}), json!({"key": 2})];
    client.set_items("kv", &entries).await.unwrap();

    let iterator = client
        .get_iterator::<Value>("kv", KeyRangeDescriptor::full())
        .unwrap();
    let items = iterator.collect_items().await.unwrap();
    assert_eq!(
        items,
        vec![json!({"key": 1}), json!({"key": 2}), json!({"key": 3})]
    );
    assert_eq!(iterator.next_item().await.unwrap(), None);
}

#[wasm_bindgen_test]
async fn delete_all_then_count_is_zero() {
    let client = fresh("delete_all").await;
    client
        .set_item("plain", &json!("value"), Some(Key::from("k")))
        .await
        .unwrap();
    client.delete_all_items("plain").await.unwrap();
    let count = client
        .count_items("plain", KeyRangeDescriptor::full())
        .await
        .unwrap();
    assert_eq!(count, 0);
}
