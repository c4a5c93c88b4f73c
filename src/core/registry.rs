/// Operation Registry
///
/// Name-keyed tables of tools, resources and prompts. Each table keeps
/// registration order so `*/list` output is stable. Resources are also
/// indexed by their synthesized `scheme://name` URI for `resources/read`.
///
/// Registration normally happens once at startup, but the tables sit behind
/// an `RwLock` so late registration never races a lookup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::error::HandlerError;
use crate::core::params::ToolContext;

/// Default scheme for synthesized resource URIs.
pub const DEFAULT_RESOURCE_SCHEME: &str = "mcp";

/// Tool handler: may suspend, may fail.
pub type ToolHandler =
    Arc<dyn Fn(ToolContext) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Resource handler: may suspend, may fail. A `Value::String` result is served
/// as plain text, anything else as JSON.
pub type ResourceHandler = ToolHandler;

/// Prompt handler: synchronous by contract, returns the prompt text.
pub type PromptHandler = Arc<dyn Fn(&ToolContext) -> Result<String, HandlerError> + Send + Sync>;

/// Wrap an async closure as a `ToolHandler`.
pub fn tool_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Wrap a synchronous closure as a `PromptHandler`.
pub fn prompt_fn<F>(f: F) -> PromptHandler
where
    F: Fn(&ToolContext) -> Result<String, HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Immutable metadata of a registered operation.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OperationDefinition {
    pub name: String,
    pub description: String,
    /// Input schema for tools, argument list for prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl OperationDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

struct Entry<H> {
    definition: OperationDefinition,
    handler: H,
}

/// Insertion-ordered, name-unique table.
struct OperationTable<H> {
    entries: Vec<Entry<H>>,
    index: HashMap<String, usize>,
}

impl<H: Clone> OperationTable<H> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert or overwrite in place. Returns true on a name collision.
    fn insert(&mut self, definition: OperationDefinition, handler: H) -> bool {
        match self.index.get(&definition.name) {
            Some(&slot) => {
                self.entries[slot] = Entry { definition, handler };
                true
            }
            None => {
                self.index
                    .insert(definition.name.clone(), self.entries.len());
                self.entries.push(Entry { definition, handler });
                false
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let Some(slot) = self.index.remove(name) else {
            return false;
        };
        self.entries.remove(slot);
        for idx in self.index.values_mut() {
            if *idx > slot {
                *idx -= 1;
            }
        }
        true
    }

    fn get(&self, name: &str) -> Option<(OperationDefinition, H)> {
        self.index.get(name).map(|&slot| {
            let entry = &self.entries[slot];
            (entry.definition.clone(), entry.handler.clone())
        })
    }

    fn definitions(&self) -> Vec<OperationDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }
}

struct Tables {
    tools: OperationTable<ToolHandler>,
    resources: OperationTable<ResourceHandler>,
    prompts: OperationTable<PromptHandler>,
    /// resource URI -> resource name
    resource_uris: HashMap<String, String>,
}

/// Registry of every operation the dispatcher can route to.
pub struct OperationRegistry {
    scheme: String,
    tables: RwLock<Tables>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::with_scheme(DEFAULT_RESOURCE_SCHEME)
    }

    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            tables: RwLock::new(Tables {
                tools: OperationTable::new(),
                resources: OperationTable::new(),
                prompts: OperationTable::new(),
                resource_uris: HashMap::new(),
            }),
        }
    }

    /// URI under which a resource named `name` is readable.
    pub fn resource_uri(&self, name: &str) -> String {
        format!("{}://{}", self.scheme, name)
    }

    pub fn register_tool(&self, definition: OperationDefinition, handler: ToolHandler) {
        let name = definition.name.clone();
        let replaced = self.write().tools.insert(definition, handler);
        log_registration("tool", &name, replaced);
    }

    pub fn register_resource(&self, definition: OperationDefinition, handler: ResourceHandler) {
        let name = definition.name.clone();
        let uri = self.resource_uri(&name);
        let replaced = {
            let mut tables = self.write();
            tables.resource_uris.insert(uri, name.clone());
            tables.resources.insert(definition, handler)
        };
        log_registration("resource", &name, replaced);
    }

    pub fn register_prompt(&self, definition: OperationDefinition, handler: PromptHandler) {
        let name = definition.name.clone();
        let replaced = self.write().prompts.insert(definition, handler);
        log_registration("prompt", &name, replaced);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.write().tools.remove(name)
    }

    pub fn unregister_resource(&self, name: &str) -> bool {
        let uri = self.resource_uri(name);
        let mut tables = self.write();
        tables.resource_uris.remove(&uri);
        tables.resources.remove(name)
    }

    pub fn unregister_prompt(&self, name: &str) -> bool {
        self.write().prompts.remove(name)
    }

    pub fn tool(&self, name: &str) -> Option<(OperationDefinition, ToolHandler)> {
        self.read().tools.get(name)
    }

    /// Look a resource up by its synthesized URI.
    pub fn resource_by_uri(&self, uri: &str) -> Option<(OperationDefinition, ResourceHandler)> {
        let tables = self.read();
        let name = tables.resource_uris.get(uri)?;
        tables.resources.get(name)
    }

    pub fn prompt(&self, name: &str) -> Option<(OperationDefinition, PromptHandler)> {
        self.read().prompts.get(name)
    }

    pub fn tools(&self) -> Vec<OperationDefinition> {
        self.read().tools.definitions()
    }

    pub fn resources(&self) -> Vec<OperationDefinition> {
        self.read().resources.definitions()
    }

    pub fn prompts(&self) -> Vec<OperationDefinition> {
        self.read().prompts.definitions()
    }

    // Handlers never run under the lock, so a poisoned lock still holds
    // consistent tables.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn log_registration(kind: &str, name: &str, replaced: bool) {
    if replaced {
        warn!(kind, name, "operation name collision, previous registration replaced");
    } else {
        debug!(kind, name, "operation registered");
    }
}
