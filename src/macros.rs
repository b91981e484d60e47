/// Collect a DOM list (anything with `length()` and `get(i)`) into a Rust
/// collection.
macro_rules! to_collection {
    ($list:expr => $ty:ty : $insert:ident) => {{
        let list = $list;
        let mut out = <$ty>::new();
        for i in 0..list.length() {
            if let Some(item) = list.get(i) {
                out.$insert(item);
            }
        }
        out
    }};
}

/// Build a JS array out of anything `JsValue` can be made from.
macro_rules! from_collection {
    ($items:expr) => {{
        let array = js_sys::Array::new();
        for item in $items {
            array.push(&wasm_bindgen::JsValue::from(item));
        }
        array
    }};
}
