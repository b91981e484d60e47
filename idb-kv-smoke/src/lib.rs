#![cfg(target_arch = "wasm32")]

use console_web::println;
use futures::StreamExt;
use idb_kv::{DatabaseConfig, KeyRangeDescriptor, StoreClient, StoreSpec};
use serde_json::{json, Value};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::spawn_local;

async fn main(version: u32) -> idb_kv::Result<()> {
    let client = StoreClient::browser()?;
    client.set_warning_handler(|warning| println!("Warning: {}", warning));

    let config = DatabaseConfig::new("test", version).store(StoreSpec::new("kv").key_path("key"));
    let upgraded = client.open(&config).await?;
    println!("Opened {:?} v{:?}, upgraded: {}", client.name(), client.version(), upgraded);

    client.set_item("kv", &json!({"key": "a", "value": 1}), None).await?;
    client.set_item("kv", &json!({"key": "b", "value": 2}), None).await?;

    let first: Option<Value> = client.get_first_item("kv", KeyRangeDescriptor::full()).await?;
    let last: Option<Value> = client.get_last_item("kv", KeyRangeDescriptor::full()).await?;
    println!("First: {:?}, last: {:?}", first, last);

    client
        .delete_items("kv", KeyRangeDescriptor::bound("a", "a"))
        .await?;
    let gone: Option<Value> = client.get_item("kv", "a").await?;
    println!("After delete: {:?}", gone);

    let mut items = client.get_iterator::<Value>("kv", KeyRangeDescriptor::full())?;
    while let Some(item) = items.next().await {
        println!("Item: {:?}", item?);
    }

    client.close_database();
    Ok(())
}

#[wasm_bindgen(start)]
pub fn run() {
    std::panic::set_hook(Box::new(console_error_panic_hook::hook));
    let version = 1;

    spawn_local(async move {
        match main(version).await {
            Ok(()) => println!("Success"),
            Err(e) => println!("Error: {}", e),
        }
    });
}
