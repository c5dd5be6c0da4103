//! Command dispatch: volume resolution, request scoping and error translation.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CommandContext, CommandError, CommandOutput, CommandRegistry, CommandResult, Params, Reply};
use crate::config::{ConfigError, KernelConfig};
use crate::registry::{BackendRegistry, VolumeRegistry};
use crate::staging::{ChunkTracker, StagingArea};
use crate::vfs::VfsError;
use crate::volume::{Volume, VolumeContext};

/// Upload chunk size advertised when the config sets none.
pub const DEFAULT_UPLOAD_MAX_SIZE: &str = "32M";

/// Connector prefix used when the config sets none.
pub const DEFAULT_CONNECTOR_URL: &str = "/connector";

/// Dispatcher settings taken from the kernel config.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Cancel commands running longer than this.
    pub timeout: Option<Duration>,
    pub upload_max_size: String,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            upload_max_size: DEFAULT_UPLOAD_MAX_SIZE.to_string(),
        }
    }
}

impl From<&KernelConfig> for DispatchOptions {
    fn from(config: &KernelConfig) -> Self {
        Self {
            timeout: config.operation_timeout(),
            upload_max_size: config
                .upload_max_size
                .clone()
                .unwrap_or_else(|| DEFAULT_UPLOAD_MAX_SIZE.to_string()),
        }
    }
}

/// Routes option bags to command handlers.
///
/// Owns the process-scoped registries; independent dispatchers share
/// nothing.
pub struct Dispatcher {
    volumes: VolumeRegistry,
    backends: BackendRegistry,
    commands: CommandRegistry,
    staging: StagingArea,
    volume_ctx: VolumeContext,
    scratch: Arc<Volume>,
    chunks: ChunkTracker,
    requests: InFlight,
    options: DispatchOptions,
}

/// Abort tokens of running requests by `reqid`.
///
/// A reused `reqid` registers alongside the earlier request; aborting it
/// cancels both, and each request removes only its own token.
#[derive(Debug, Default)]
pub struct InFlight {
    tokens: DashMap<String, Vec<(u64, CancellationToken)>>,
    seq: AtomicU64,
}

impl InFlight {
    pub fn register(&self, reqid: &str, token: CancellationToken) -> Registration<'_> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.tokens.entry(reqid.to_string()).or_default();
        if !slot.is_empty() {
            warn!(reqid, "request id already in flight");
        }
        slot.push((seq, token));
        Registration {
            owner: self,
            reqid: reqid.to_string(),
            seq,
        }
    }

    /// Cancel every request registered under `reqid`.
    pub fn cancel(&self, reqid: &str) -> bool {
        match self.tokens.get(reqid) {
            Some(slot) => {
                slot.iter().for_each(|(_, token)| token.cancel());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.iter().map(|slot| slot.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Keeps one token registered until dropped.
#[derive(Debug)]
pub struct Registration<'a> {
    owner: &'a InFlight,
    reqid: String,
    seq: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.owner.tokens.entry(self.reqid.clone()) {
            slot.get_mut().retain(|(seq, _)| *seq != self.seq);
            if slot.get().is_empty() {
                slot.remove();
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("volumes", &self.volumes.len())
            .field("backends", &self.backends)
            .field("in_flight", &self.requests.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        volumes: VolumeRegistry,
        backends: BackendRegistry,
        staging: StagingArea,
        volume_ctx: VolumeContext,
        options: DispatchOptions,
    ) -> Result<Self, ConfigError> {
        let scratch = staging.scratch_volume(&volume_ctx)?;
        Ok(Self {
            volumes,
            backends,
            commands: CommandRegistry::builtin(),
            staging,
            volume_ctx,
            scratch,
            chunks: ChunkTracker::new(),
            requests: InFlight::default(),
            options,
        })
    }

    /// Normalize the config, prepare the staging area and mount every volume.
    pub async fn from_config(mut config: KernelConfig) -> Result<Self, ConfigError> {
        config.normalize()?;
        let staging = StagingArea::new(config.staging_root());
        staging.prepare().await.map_err(|source| ConfigError::Io {
            path: staging.root().to_path_buf(),
            source,
        })?;
        let connector_url = config
            .connector_url
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECTOR_URL.to_string());
        let volume_ctx = staging.volume_context(connector_url, config.debug_timing);
        let backends = BackendRegistry::with_defaults();
        let volumes = VolumeRegistry::from_config(&config, &backends, &volume_ctx)?;
        for volume in volumes.list() {
            info!(id = volume.id(), name = volume.name(), kind = volume.kind(), "volume mounted");
        }
        Self::new(
            volumes,
            backends,
            staging,
            volume_ctx,
            DispatchOptions::from(&config),
        )
    }

    pub fn volumes(&self) -> &VolumeRegistry {
        &self.volumes
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn volume_context(&self) -> &VolumeContext {
        &self.volume_ctx
    }

    /// Local volume extracted archives are re-inserted from.
    pub fn scratch_volume(&self) -> &Arc<Volume> {
        &self.scratch
    }

    pub fn chunks(&self) -> &ChunkTracker {
        &self.chunks
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Cancel the in-flight request with this id. Returns false if unknown.
    pub fn abort_request(&self, reqid: &str) -> bool {
        let found = self.requests.cancel(reqid);
        if found {
            info!(reqid, "aborting request");
        }
        found
    }

    /// Number of requests currently registered for abort.
    pub fn in_flight(&self) -> usize {
        self.requests.len()
    }

    /// Run one command. Failures come back as `{error}` replies.
    pub async fn dispatch(&self, params: Params) -> CommandOutput {
        let start = Instant::now();
        let cmd = params.str("cmd").unwrap_or_default().to_string();
        let result = self.execute(&cmd, &params).await;
        info!("command '{cmd}' took {}ms", start.elapsed().as_millis());
        match result {
            Ok(output) => output,
            Err(e) => {
                e.log(&cmd);
                Reply::failure(e.to_wire()).into()
            }
        }
    }

    #[tracing::instrument(skip(self, params), name = "dispatch")]
    async fn execute(&self, cmd: &str, params: &Params) -> CommandResult<CommandOutput> {
        if cmd.is_empty() {
            return Err(CommandError::params("cmd"));
        }
        let handler = self
            .commands
            .get(cmd)
            .ok_or_else(|| CommandError::UnknownCommand(cmd.to_string()))?;
        handler.validate(params)?;

        let token = CancellationToken::new();
        let _registration = params
            .str("reqid")
            .map(|reqid| self.requests.register(reqid, token.clone()));

        let ctx = CommandContext::new(self, self.resolve_volume(params), token.clone());
        let run = handler.run(&ctx, params);
        let result = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(cmd, timeout_secs = limit.as_secs(), "command timed out");
                    token.cancel();
                    Err(VfsError::Aborted.into())
                }
            },
            None => run.await,
        };
        ctx.release().await;
        result
    }

    /// Volume named by the first hash among `target`, `targets[0]`, `dst`;
    /// the first volume when there is none or it does not resolve.
    fn resolve_volume(&self, params: &Params) -> Option<Arc<Volume>> {
        let hash = params
            .str("target")
            .map(str::to_string)
            .or_else(|| params.strings("targets").into_iter().next())
            .or_else(|| params.str("dst").map(str::to_string));
        let resolved = hash.and_then(|h| match self.volumes.unhash(&h) {
            Ok((volume, _)) => Some(volume),
            Err(e) => {
                debug!(hash = %h, error = %e, "falling back to the first volume");
                None
            }
        });
        resolved.or_else(|| self.volumes.first())
    }
}
