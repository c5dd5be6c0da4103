//! File-manager commands.
//!
//! Every command is a [`CommandHandler`] registered once in the closed
//! [`CommandRegistry`]. The [`Dispatcher`] resolves the volume a request
//! addresses, validates required fields before any I/O, runs the handler
//! inside a [`CommandContext`] and translates failures into the `{error}`
//! envelope.
//!
//! ```text
//! option bag ──► Dispatcher ──► CommandHandler::validate
//!                    │                 │
//!                    │                 ▼
//!                    │          CommandHandler::run ──► Driver(s)
//!                    ▼
//!              Reply / FileDownload
//! ```

pub mod archive;
pub mod browse;
mod data_uri;
pub mod dispatcher;
pub mod edit;
pub mod error;
pub mod media;
pub mod session;
pub mod upload;

pub use dispatcher::{DispatchOptions, Dispatcher};
pub use error::{CommandError, CommandResult};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::registry::VolumeRegistry;
use crate::vfs::{Driver, Entry, FileDownload};
use crate::volume::Volume;

// ============================================================================
// Params
// ============================================================================

/// A decoded command option bag.
///
/// Keys with the form-encoding `[]` suffix are stored without it, so
/// `targets[]` and `targets` are the same field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    fields: Map<String, Value>,
}

impl Params {
    pub fn new(fields: Map<String, Value>) -> Self {
        let fields = fields
            .into_iter()
            .map(|(k, v)| match k.strip_suffix("[]") {
                Some(stripped) => (stripped.to_string(), v),
                None => (k, v),
            })
            .collect();
        Self { fields }
    }

    /// Parse a JSON object.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::new(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Present and not empty.
    pub fn has(&self, key: &str) -> bool {
        match self.fields.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(_) => true,
        }
    }

    /// A non-empty string field.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// A string or number field as text.
    pub fn string(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> CommandResult<&str> {
        self.str(key).ok_or_else(|| CommandError::params(key))
    }

    /// A list field. A single string counts as a one-element list.
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.fields.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn require_strings(&self, key: &str) -> CommandResult<Vec<String>> {
        let values = self.strings(key);
        if values.is_empty() {
            return Err(CommandError::params(key));
        }
        Ok(values)
    }

    /// `true`, a non-zero number, `"1"` or `"true"`.
    pub fn flag(&self, key: &str) -> bool {
        match self.fields.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
            _ => false,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn require_number(&self, key: &str) -> CommandResult<f64> {
        self.number(key).ok_or_else(|| CommandError::params(key))
    }
}

// ============================================================================
// Reply
// ============================================================================

/// The push-delta response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<Entry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<Entry>,
    /// Hashes of removed entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Command-specific payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure(error: Value) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Set a command-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "error": ["Error", e.to_string()] })
        })
    }
}

/// What a command hands back to the transport.
#[derive(Debug)]
pub enum CommandOutput {
    Reply(Reply),
    /// Raw content; the transport streams it instead of JSON.
    Download(FileDownload),
}

impl From<Reply> for CommandOutput {
    fn from(reply: Reply) -> Self {
        CommandOutput::Reply(reply)
    }
}

impl CommandOutput {
    /// The JSON envelope, if this is not a download.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            CommandOutput::Reply(reply) => Some(reply),
            CommandOutput::Download(_) => None,
        }
    }

    pub fn into_reply(self) -> Option<Reply> {
        match self {
            CommandOutput::Reply(reply) => Some(reply),
            CommandOutput::Download(_) => None,
        }
    }
}

/// Entry serialized for a payload field.
pub(crate) fn entries(list: &[Entry]) -> Value {
    serde_json::to_value(list).unwrap_or(Value::Array(Vec::new()))
}

// ============================================================================
// Context
// ============================================================================

/// Per-request state a handler runs in.
///
/// Drivers opened through the context share the request's abort token and
/// are destroyed by the dispatcher once the handler returns, whatever the
/// outcome.
pub struct CommandContext<'a> {
    dispatcher: &'a Dispatcher,
    volume: Option<Arc<Volume>>,
    abort: CancellationToken,
    drivers: Mutex<Vec<Arc<Driver>>>,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        dispatcher: &'a Dispatcher,
        volume: Option<Arc<Volume>>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            volume,
            abort,
            drivers: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatcher(&self) -> &'a Dispatcher {
        self.dispatcher
    }

    pub fn volumes(&self) -> &'a VolumeRegistry {
        self.dispatcher.volumes()
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    /// The volume the request addresses.
    pub fn volume(&self) -> CommandResult<Arc<Volume>> {
        self.volume.clone().ok_or(CommandError::NoVolumes)
    }

    /// Driver of the addressed volume.
    pub async fn driver(&self) -> CommandResult<Arc<Driver>> {
        let volume = self.volume()?;
        self.driver_for(&volume).await
    }

    /// Driver of any volume, opened at most once per request.
    ///
    /// The driver list stays locked while a driver opens, so concurrent
    /// lookups of one volume share a single driver.
    pub async fn driver_for(&self, volume: &Arc<Volume>) -> CommandResult<Arc<Driver>> {
        let mut drivers = self.drivers.lock().await;
        if let Some(driver) = drivers.iter().find(|d| d.volume().id() == volume.id()) {
            return Ok(driver.clone());
        }
        let driver = Arc::new(volume.open_driver(&self.abort).await?);
        drivers.push(driver.clone());
        Ok(driver)
    }

    /// Driver and backend id for a hash token.
    pub async fn resolve(&self, hash: &str) -> CommandResult<(Arc<Driver>, String)> {
        let (volume, id) = self.volumes().unhash(hash)?;
        let driver = self.driver_for(&volume).await?;
        Ok((driver, id))
    }

    /// Resolve several tokens that must all live on one volume.
    pub async fn resolve_all(&self, hashes: &[String]) -> CommandResult<(Arc<Driver>, Vec<String>)> {
        let mut ids = Vec::with_capacity(hashes.len());
        let mut driver: Option<Arc<Driver>> = None;
        for hash in hashes {
            let (d, id) = self.resolve(hash).await?;
            if let Some(first) = &driver {
                if first.volume().id() != d.volume().id() {
                    return Err(CommandError::params("targets"));
                }
            } else {
                driver = Some(d);
            }
            ids.push(id);
        }
        let driver = driver.ok_or_else(|| CommandError::params("targets"))?;
        Ok((driver, ids))
    }

    /// Destroy every driver opened for this request.
    pub(crate) async fn release(&self) {
        let drivers = std::mem::take(&mut *self.drivers.lock().await);
        for driver in drivers {
            driver.destroy().await;
        }
    }
}

// ============================================================================
// Handlers and registry
// ============================================================================

/// One protocol command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command name (`cmd` field).
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Fields that must be present and non-empty.
    fn required(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reject the request before any I/O happens.
    fn validate(&self, params: &Params) -> CommandResult<()> {
        match self.required().iter().find(|field| !params.has(field)) {
            Some(field) => Err(CommandError::params(*field)),
            None => Ok(()),
        }
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput>;
}

/// Command name → handler. Populated once; never extended at runtime.
pub struct CommandRegistry {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

impl CommandRegistry {
    /// Every supported command.
    pub fn builtin() -> Self {
        let handlers: Vec<Arc<dyn CommandHandler>> = vec![
            Arc::new(browse::Open),
            Arc::new(browse::Ls),
            Arc::new(browse::Tree),
            Arc::new(browse::Parents),
            Arc::new(browse::Info),
            Arc::new(browse::Size),
            Arc::new(browse::Subdirs),
            Arc::new(browse::Search),
            Arc::new(browse::ListTree),
            Arc::new(edit::Mkdir),
            Arc::new(edit::Mkfile),
            Arc::new(edit::Rename),
            Arc::new(edit::Rm),
            Arc::new(edit::Duplicate),
            Arc::new(edit::Paste),
            Arc::new(edit::Put),
            Arc::new(edit::Get),
            Arc::new(edit::Chmod),
            Arc::new(archive::Archive),
            Arc::new(archive::Extract),
            Arc::new(archive::ZipDl),
            Arc::new(media::File),
            Arc::new(media::Url),
            Arc::new(media::Tmb),
            Arc::new(media::Dim),
            Arc::new(media::Resize),
            Arc::new(upload::Upload),
            Arc::new(session::Abort),
            Arc::new(session::NetMount),
        ];
        Self {
            handlers: handlers.into_iter().map(|h| (h.name(), h)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Command names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
