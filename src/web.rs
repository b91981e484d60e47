//! The browser's IndexedDB through `web-sys`.
//!
//! Values cross the boundary as JSON: they are serialized with `serde_json` and
//! parsed into JS objects with `JSON.parse`, and read back the same way.

use std::{cell::RefCell, ops::Bound, rc::Rc};

use serde_json::Value;
use wasm_bindgen::{closure::Closure, JsCast, JsValue};
use web_sys::{
    DomException, IdbCursorDirection, IdbCursorWithValue, IdbDatabase, IdbIndexParameters,
    IdbKeyRange, IdbObjectStore, IdbObjectStoreParameters, IdbOpenDbRequest, IdbRequest,
    IdbRequestReadyState, IdbTransaction, IdbTransactionMode, IdbVersionChangeEvent,
};

use crate::{
    engine::{
        Capabilities, Connection, CursorDirection, CursorEntry, CursorRequest, DeleteRequest,
        Factory, Handler, ObjectStore, OpenRequest, ReadyState, Request, SchemaStore,
        Transaction, UpgradeDatabase, UpgradeHandler, VersionChange,
    },
    error::{EngineError, Error},
    key::{Key, KeyPath},
    key_range::KeyRange,
    schema::{IndexParameters, StoreParameters},
    transaction::TransactionMode,
};

type ClosureSlot = RefCell<Option<Closure<dyn FnMut()>>>;

impl From<JsValue> for EngineError {
    fn from(value: JsValue) -> Self {
        match value.dyn_ref::<DomException>() {
            Some(e) => EngineError::new(e.name(), e.message()),
            None => EngineError::new("Error", describe(&value)),
        }
    }
}

fn describe(value: &JsValue) -> String {
    value
        .as_string()
        .or_else(|| {
            js_sys::JSON::stringify(value)
                .ok()
                .filter(|s| !s.is_undefined())
                .map(String::from)
        })
        .unwrap_or_else(|| format!("{:?}", value))
}

fn key_to_js(key: &Key) -> JsValue {
    match key {
        Key::Number(n) => JsValue::from_f64(*n),
        Key::String(s) => JsValue::from_str(s),
        Key::Array(items) => from_collection!(items.iter().map(key_to_js)).into(),
    }
}

fn key_from_js(value: &JsValue) -> Option<Key> {
    if let Some(n) = value.as_f64() {
        Some(Key::Number(n))
    } else if let Some(s) = value.as_string() {
        Some(Key::String(s))
    } else if js_sys::Array::is_array(value) {
        let array: &js_sys::Array = value.unchecked_ref();
        array
            .iter()
            .map(|item| key_from_js(&item))
            .collect::<Option<Vec<_>>>()
            .map(Key::Array)
    } else {
        None
    }
}

fn value_to_js(value: &Value) -> Result<JsValue, EngineError> {
    let json = serde_json::to_string(value).map_err(|e| EngineError::data(e.to_string()))?;
    Ok(js_sys::JSON::parse(&json)?)
}

fn value_from_js(value: &JsValue) -> Result<Value, EngineError> {
    if value.is_undefined() {
        return Ok(Value::Null);
    }
    let json: String = js_sys::JSON::stringify(value)?.into();
    serde_json::from_str(&json).map_err(|e| EngineError::data(e.to_string()))
}

fn key_path_to_js(key_path: &KeyPath) -> JsValue {
    match key_path {
        KeyPath::None => JsValue::NULL,
        KeyPath::Single(path) => JsValue::from_str(path),
        KeyPath::Multi(paths) => from_collection!(paths.iter().map(String::as_str)).into(),
    }
}

fn key_range_to_js(range: Option<&KeyRange>) -> Result<JsValue, EngineError> {
    let range = match range {
        Some(range) => range,
        None => return Ok(JsValue::NULL),
    };

    let range = match range.bounds() {
        (Bound::Unbounded, Bound::Unbounded) => {
            IdbKeyRange::lower_bound(&JsValue::from_f64(f64::NEG_INFINITY))?
        }
        (lower, Bound::Unbounded) => {
            let (lower, open) = endpoint(lower);
            IdbKeyRange::lower_bound_with_open(&lower, open)?
        }
        (Bound::Unbounded, upper) => {
            let (upper, open) = endpoint(upper);
            IdbKeyRange::upper_bound_with_open(&upper, open)?
        }
        (lower, upper) => {
            let (lower, lower_open) = endpoint(lower);
            let (upper, upper_open) = endpoint(upper);
            IdbKeyRange::bound_with_lower_open_and_upper_open(&lower, &upper, lower_open, upper_open)?
        }
    };
    Ok(range.into())
}

fn endpoint(bound: Bound<&Key>) -> (JsValue, bool) {
    match bound {
        Bound::Included(key) => (key_to_js(key), false),
        Bound::Excluded(key) => (key_to_js(key), true),
        Bound::Unbounded => (JsValue::UNDEFINED, false),
    }
}

fn install(slot: &ClosureSlot, handler: Option<Handler>, set: impl FnOnce(Option<&js_sys::Function>)) {
    let closure = handler.map(Closure::wrap);
    set(closure.as_ref().map(|c| c.as_ref().unchecked_ref()));
    *slot.borrow_mut() = closure;
}

/// `window.indexedDB`, or the worker's equivalent.
pub struct WebFactory {
    inner: web_sys::IdbFactory,
    capabilities: Capabilities,
}

impl WebFactory {
    pub fn new() -> Result<Self, Error> {
        let global = js_sys::global();
        let factory = js_sys::Reflect::get(&global, &JsValue::from_str("indexedDB"))
            .map_err(|e| Error::UnsupportedEngine(describe(&e)))?;
        if factory.is_undefined() || factory.is_null() {
            return Err(Error::UnsupportedEngine(
                "indexedDB is not available in this environment".to_owned(),
            ));
        }

        Ok(Self {
            inner: factory.unchecked_into(),
            capabilities: Capabilities::default(),
        })
    }

    /// Override the detected capabilities, e.g. to enable index locales on
    /// engines that support them.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl Factory for WebFactory {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open(&self, name: &str, version: u32) -> Result<Rc<dyn OpenRequest>, EngineError> {
        let request = self.inner.open_with_u32(name, version)?;
        Ok(Rc::new(WebOpenRequest::new(request)))
    }

    fn delete_database(&self, name: &str) -> Result<Rc<dyn DeleteRequest>, EngineError> {
        let request = self.inner.delete_database(name)?;
        Ok(Rc::new(WebDeleteRequest {
            request: WebRequest::new(request.clone().into(), |_| Ok(())),
            open: request,
            onblocked: RefCell::new(None),
        }))
    }
}

struct WebRequest<T> {
    inner: IdbRequest,
    convert: fn(JsValue) -> Result<T, EngineError>,
    onsuccess: ClosureSlot,
    onerror: ClosureSlot,
}

impl<T> WebRequest<T> {
    fn new(inner: IdbRequest, convert: fn(JsValue) -> Result<T, EngineError>) -> Self {
        Self {
            inner,
            convert,
            onsuccess: RefCell::new(None),
            onerror: RefCell::new(None),
        }
    }
}

impl<T> Request<T> for WebRequest<T> {
    fn ready_state(&self) -> ReadyState {
        match self.inner.ready_state() {
            IdbRequestReadyState::Done => ReadyState::Done,
            _ => ReadyState::Pending,
        }
    }

    fn result(&self) -> Result<T, EngineError> {
        match self.inner.result() {
            Ok(value) => (self.convert)(value),
            Err(_) => match self.inner.error() {
                Ok(Some(e)) => Err(EngineError::new(e.name(), e.message())),
                Ok(None) => Err(EngineError::invalid_state("request failed without an error")),
                Err(e) => Err(e.into()),
            },
        }
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        install(&self.onsuccess, handler, |f| self.inner.set_onsuccess(f));
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        install(&self.onerror, handler, |f| self.inner.set_onerror(f));
    }
}

struct WebOpenRequest {
    request: WebRequest<Rc<dyn Connection>>,
    open: IdbOpenDbRequest,
    onupgradeneeded: RefCell<Option<Closure<dyn FnMut(IdbVersionChangeEvent)>>>,
    onblocked: ClosureSlot,
}

impl WebOpenRequest {
    fn new(open: IdbOpenDbRequest) -> Self {
        let request = WebRequest::new(open.clone().into(), |value| {
            let connection: Rc<dyn Connection> = Rc::new(WebConnection::new(value.unchecked_into()));
            Ok(connection)
        });
        Self {
            request,
            open,
            onupgradeneeded: RefCell::new(None),
            onblocked: RefCell::new(None),
        }
    }
}

impl Request<Rc<dyn Connection>> for WebOpenRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<Rc<dyn Connection>, EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl OpenRequest for WebOpenRequest {
    fn set_onupgradeneeded(&self, handler: Option<UpgradeHandler>) {
        let closure = handler.map(|mut handler| {
            let open = self.open.clone();
            Closure::wrap(Box::new(move |event: IdbVersionChangeEvent| {
                let db: IdbDatabase = match open.result() {
                    Ok(db) => db.unchecked_into(),
                    Err(e) => {
                        tracing::warn!(error = %describe(&e), "upgrade fired without a database");
                        return;
                    }
                };
                let upgrade = WebUpgrade {
                    db,
                    transaction: open.transaction(),
                };
                let change = VersionChange {
                    old_version: event.old_version() as u32,
                    new_version: event.new_version().unwrap_or_default() as u32,
                };
                handler(&upgrade, change);
            }) as Box<dyn FnMut(IdbVersionChangeEvent)>)
        });

        self.open
            .set_onupgradeneeded(closure.as_ref().map(|c| c.as_ref().unchecked_ref()));
        *self.onupgradeneeded.borrow_mut() = closure;
    }

    fn set_onblocked(&self, handler: Option<Handler>) {
        install(&self.onblocked, handler, |f| self.open.set_onblocked(f));
    }
}

struct WebDeleteRequest {
    request: WebRequest<()>,
    open: IdbOpenDbRequest,
    onblocked: ClosureSlot,
}

impl Request<()> for WebDeleteRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<(), EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl DeleteRequest for WebDeleteRequest {
    fn set_onblocked(&self, handler: Option<Handler>) {
        install(&self.onblocked, handler, |f| self.open.set_onblocked(f));
    }
}

struct WebUpgrade {
    db: IdbDatabase,
    transaction: Option<IdbTransaction>,
}

impl UpgradeDatabase for WebUpgrade {
    fn object_store_names(&self) -> Vec<String> {
        to_collection!(self.db.object_store_names() => Vec<String> : push)
    }

    fn create_object_store(
        &self,
        name: &str,
        parameters: &StoreParameters,
    ) -> Result<Rc<dyn SchemaStore>, EngineError> {
        let options = IdbObjectStoreParameters::new();
        if !parameters.key_path.is_none() {
            options.set_key_path(&key_path_to_js(&parameters.key_path));
        }
        options.set_auto_increment(parameters.auto_increment);

        let store = self
            .db
            .create_object_store_with_optional_parameters(name, &options)?;
        Ok(Rc::new(WebSchemaStore { store }))
    }

    fn delete_object_store(&self, name: &str) -> Result<(), EngineError> {
        Ok(self.db.delete_object_store(name)?)
    }

    fn abort(&self) {
        if let Some(transaction) = &self.transaction {
            if let Err(e) = transaction.abort() {
                tracing::warn!(error = %describe(&e), "failed to abort the upgrade");
            }
        }
    }
}

struct WebSchemaStore {
    store: IdbObjectStore,
}

impl SchemaStore for WebSchemaStore {
    fn name(&self) -> String {
        self.store.name()
    }

    fn create_index(&self, name: &str, parameters: &IndexParameters) -> Result<(), EngineError> {
        let options = IdbIndexParameters::new();
        options.set_unique(parameters.unique);
        options.set_multi_entry(parameters.multi_entry);
        if let Some(locale) = &parameters.locale {
            js_sys::Reflect::set(
                &options,
                &JsValue::from_str("locale"),
                &JsValue::from_str(locale),
            )?;
        }

        match &parameters.key_path {
            KeyPath::None => {
                return Err(EngineError::new(
                    "SyntaxError",
                    format!("index \"{}\" needs a key path", name),
                ))
            }
            KeyPath::Single(path) => {
                self.store
                    .create_index_with_str_and_optional_parameters(name, path, &options)?;
            }
            KeyPath::Multi(_) => {
                self.store.create_index_with_str_sequence_and_optional_parameters(
                    name,
                    &key_path_to_js(&parameters.key_path),
                    &options,
                )?;
            }
        }
        Ok(())
    }
}

struct WebConnection {
    db: IdbDatabase,
    onclose: ClosureSlot,
    onversionchange: ClosureSlot,
}

impl WebConnection {
    fn new(db: IdbDatabase) -> Self {
        Self {
            db,
            onclose: RefCell::new(None),
            onversionchange: RefCell::new(None),
        }
    }
}

impl Connection for WebConnection {
    fn name(&self) -> String {
        self.db.name()
    }

    fn version(&self) -> u32 {
        self.db.version() as u32
    }

    fn object_store_names(&self) -> Vec<String> {
        to_collection!(self.db.object_store_names() => Vec<String> : push)
    }

    fn transaction(
        &self,
        store: &str,
        mode: TransactionMode,
    ) -> Result<Rc<dyn Transaction>, EngineError> {
        let mode = match mode {
            TransactionMode::Readonly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let transaction = self.db.transaction_with_str_and_mode(store, mode)?;
        Ok(Rc::new(WebTransaction {
            transaction,
            oncomplete: RefCell::new(None),
            onabort: RefCell::new(None),
        }))
    }

    fn close(&self) {
        self.db.close();
    }

    fn set_onclose(&self, handler: Option<Handler>) {
        install(&self.onclose, handler, |f| self.db.set_onclose(f));
    }

    fn set_onversionchange(&self, handler: Option<Handler>) {
        install(&self.onversionchange, handler, |f| {
            self.db.set_onversionchange(f)
        });
    }
}

struct WebTransaction {
    transaction: IdbTransaction,
    oncomplete: ClosureSlot,
    onabort: ClosureSlot,
}

impl Transaction for WebTransaction {
    fn object_store(&self, name: &str) -> Result<Rc<dyn ObjectStore>, EngineError> {
        let store = self.transaction.object_store(name)?;
        Ok(Rc::new(WebObjectStore { store }))
    }

    fn abort(&self) -> Result<(), EngineError> {
        Ok(self.transaction.abort()?)
    }

    fn set_oncomplete(&self, handler: Option<Handler>) {
        install(&self.oncomplete, handler, |f| {
            self.transaction.set_oncomplete(f)
        });
    }

    fn set_onabort(&self, handler: Option<Handler>) {
        install(&self.onabort, handler, |f| self.transaction.set_onabort(f));
    }
}

struct WebObjectStore {
    store: IdbObjectStore,
}

fn unit(_: JsValue) -> Result<(), EngineError> {
    Ok(())
}

impl ObjectStore for WebObjectStore {
    fn get(&self, key: &Key) -> Result<Rc<dyn Request<Option<Value>>>, EngineError> {
        let request = self.store.get(&key_to_js(key))?;
        Ok(Rc::new(WebRequest::new(request, |value| {
            if value.is_undefined() {
                Ok(None)
            } else {
                value_from_js(&value).map(Some)
            }
        })))
    }

    fn put(&self, value: &Value, key: Option<&Key>) -> Result<Rc<dyn Request<Key>>, EngineError> {
        let value = value_to_js(value)?;
        let request = match key {
            Some(key) => self.store.put_with_key(&value, &key_to_js(key))?,
            None => self.store.put(&value)?,
        };
        Ok(Rc::new(WebRequest::new(request, |key| {
            key_from_js(&key).ok_or_else(|| EngineError::data("the engine returned an unsupported key"))
        })))
    }

    fn delete(&self, key: &Key) -> Result<Rc<dyn Request<()>>, EngineError> {
        let request = self.store.delete(&key_to_js(key))?;
        Ok(Rc::new(WebRequest::new(request, unit)))
    }

    fn delete_range(&self, range: &KeyRange) -> Result<Rc<dyn Request<()>>, EngineError> {
        let request = self.store.delete(&key_range_to_js(Some(range))?)?;
        Ok(Rc::new(WebRequest::new(request, unit)))
    }

    fn clear(&self) -> Result<Rc<dyn Request<()>>, EngineError> {
        let request = self.store.clear()?;
        Ok(Rc::new(WebRequest::new(request, unit)))
    }

    fn count(&self, range: Option<&KeyRange>) -> Result<Rc<dyn Request<u64>>, EngineError> {
        let request = match range {
            Some(range) => self.store.count_with_key(&key_range_to_js(Some(range))?)?,
            None => self.store.count()?,
        };
        Ok(Rc::new(WebRequest::new(request, |count| {
            count
                .as_f64()
                .map(|n| n as u64)
                .ok_or_else(|| EngineError::data("count did not return a number"))
        })))
    }

    fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        direction: CursorDirection,
    ) -> Result<Rc<dyn CursorRequest>, EngineError> {
        let direction = match direction {
            CursorDirection::Next => IdbCursorDirection::Next,
            CursorDirection::Prev => IdbCursorDirection::Prev,
        };
        let request = self
            .store
            .open_cursor_with_range_and_direction(&key_range_to_js(range)?, direction)?;
        Ok(Rc::new(WebCursorRequest {
            request: WebRequest::new(request, cursor_entry),
        }))
    }
}

fn cursor_entry(cursor: JsValue) -> Result<Option<CursorEntry>, EngineError> {
    if cursor.is_null() || cursor.is_undefined() {
        return Ok(None);
    }
    let cursor: IdbCursorWithValue = cursor.unchecked_into();
    let key = cursor.key()?;
    let key = key_from_js(&key).ok_or_else(|| EngineError::data("the cursor is on an unsupported key"))?;
    let value = value_from_js(&cursor.value()?)?;
    Ok(Some(CursorEntry { key, value }))
}

struct WebCursorRequest {
    request: WebRequest<Option<CursorEntry>>,
}

impl Request<Option<CursorEntry>> for WebCursorRequest {
    fn ready_state(&self) -> ReadyState {
        self.request.ready_state()
    }

    fn result(&self) -> Result<Option<CursorEntry>, EngineError> {
        self.request.result()
    }

    fn set_onsuccess(&self, handler: Option<Handler>) {
        self.request.set_onsuccess(handler)
    }

    fn set_onerror(&self, handler: Option<Handler>) {
        self.request.set_onerror(handler)
    }
}

impl CursorRequest for WebCursorRequest {
    fn advance(&self) -> Result<(), EngineError> {
        let cursor = self.request.inner.result()?;
        if cursor.is_null() || cursor.is_undefined() {
            return Err(EngineError::invalid_state("the cursor is past its end"));
        }
        let cursor: web_sys::IdbCursor = cursor.unchecked_into();
        Ok(cursor.continue_()?)
    }
}
