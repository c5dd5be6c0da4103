//! Request control and network mounts.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

use super::{CommandContext, CommandError, CommandHandler, CommandOutput, CommandResult, Params, Reply};
use crate::config::VolumeConfig;
use crate::hash;
use crate::vfs::ROOT_ID;
use crate::volume::Volume;

/// Protocol value that turns `netmount` into an unmount.
pub const NETUNMOUNT: &str = "netunmount";

pub struct Abort;

#[async_trait]
impl CommandHandler for Abort {
    fn name(&self) -> &'static str {
        "abort"
    }

    fn description(&self) -> &'static str {
        "Cancel an in-flight request by its request id"
    }

    fn required(&self) -> &'static [&'static str] {
        &["id"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let reqid = params.string("id").ok_or_else(|| CommandError::params("id"))?;
        if !ctx.dispatcher().abort_request(&reqid) {
            info!(reqid = %reqid, "no in-flight request to abort");
        }
        let mut reply = Reply::new();
        reply.error = Some(json!(0));
        Ok(reply.into())
    }
}

pub struct NetMount;

impl NetMount {
    /// Volume config from `options` plus the top-level connection fields.
    fn volume_config(params: &Params, kind: &str) -> CommandResult<VolumeConfig> {
        let mut config: Map<String, Value> = match params.get("options") {
            Some(Value::Object(options)) => options.clone(),
            _ => Map::new(),
        };
        for key in ["host", "port", "user", "pass"] {
            if let Some(value) = params.string(key) {
                config.insert(key.to_string(), Value::String(value));
            }
        }
        if let Some(root) = params.str("path") {
            config.insert("root".to_string(), Value::String(root.to_string()));
        }
        if let Some(port) = config.get("port").and_then(Value::as_str) {
            let port: u16 = port.trim().parse().map_err(|_| CommandError::params("port"))?;
            config.insert("port".to_string(), json!(port));
        }
        config.insert("driver".to_string(), Value::String(kind.to_string()));
        config.remove("id");

        let mut config: VolumeConfig =
            serde_json::from_value(Value::Object(config)).map_err(|_| CommandError::params("options"))?;
        let key = serde_json::to_string(&config).map_err(|_| CommandError::params("options"))?;
        config.id = format!("v{}_", hash::md5_hex(key));
        if config.name.is_empty() {
            config.name = config.host.clone().unwrap_or_default();
        }
        Ok(config)
    }

    async fn unmount(ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let failed = || {
            let mut reply = Reply::new().with("sync", true);
            reply.error = Some(json!("errNetUnMount"));
            reply
        };
        let Some(volume) = params.str("user").and_then(|id| ctx.volumes().get(id)) else {
            return Ok(failed().into());
        };
        let driver = ctx.driver_for(&volume).await?;
        match driver.unmount().await {
            Ok(true) => {}
            Ok(false) => return Ok(failed().into()),
            Err(e) => {
                warn!(volume = volume.id(), error = %e, "network unmount failed");
                return Ok(failed().into());
            }
        }
        ctx.volumes().unmount(volume.id());
        info!(volume = volume.id(), "volume unmounted");
        let mut reply = Reply::new();
        reply.removed.push(hash::encode(volume.id(), ROOT_ID));
        Ok(reply.into())
    }
}

#[async_trait]
impl CommandHandler for NetMount {
    fn name(&self) -> &'static str {
        "netmount"
    }

    fn description(&self) -> &'static str {
        "Mount or unmount a network volume"
    }

    fn required(&self) -> &'static [&'static str] {
        &["protocol", "host"]
    }

    async fn run(&self, ctx: &CommandContext<'_>, params: &Params) -> CommandResult<CommandOutput> {
        let protocol = params.require_str("protocol")?;
        if protocol == NETUNMOUNT {
            return Self::unmount(ctx, params).await;
        }
        let host = params.require_str("host")?;
        let dispatcher = ctx.dispatcher();
        let factory = dispatcher
            .backends()
            .by_protocol(protocol)
            .ok_or_else(|| CommandError::mount(["errNetMount", host, "Not NetMount driver."]))?;

        let config = Self::volume_config(params, factory.kind())?;
        if ctx.volumes().contains(&config.id) {
            return Err(CommandError::mount(["errNetMount", host, "Already mounted."]));
        }
        let volume = Volume::new(config, factory, dispatcher.volume_context())
            .map_err(|e| CommandError::mount(["errNetMount", host, e.to_string().as_str()]))?;
        let volume = Arc::new(volume);

        let driver = ctx.driver_for(&volume).await?;
        let mounted = driver.is_initialized() && matches!(driver.mount().await, Ok(true));
        if !mounted {
            return Err(CommandError::mount(["errNetMount", host, "Failed to mount."]));
        }
        if !ctx.volumes().mount(volume.clone()) {
            return Err(CommandError::mount(["errNetMount", host, "Already mounted."]));
        }
        info!(id = volume.id(), host, protocol, "network volume mounted");

        let mut reply = Reply::new();
        reply.added.push(driver.file_required(ROOT_ID).await?);
        Ok(reply.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_config_is_stable() {
        let params = Params::from_json(json!({
            "protocol": "ftp",
            "host": "ftp.example.org",
            "port": "2121",
            "path": "/pub",
            "options": { "subdirs": true },
        }))
        .unwrap();
        let a = NetMount::volume_config(&params, "ftp").unwrap();
        let b = NetMount::volume_config(&params, "ftp").unwrap();
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with('v') && a.id.ends_with('_'));
        assert_eq!(a.port, Some(2121));
        assert_eq!(a.root.as_deref(), Some("/pub"));
        assert_eq!(a.driver, "ftp");
        assert_eq!(a.name, "ftp.example.org");
        assert!(a.subdirs);

        let other = Params::from_json(json!({ "protocol": "ftp", "host": "ftp.example.net" })).unwrap();
        assert_ne!(NetMount::volume_config(&other, "ftp").unwrap().id, a.id);
    }

    #[test]
    fn test_bad_port_is_a_param_error() {
        let params =
            Params::from_json(json!({ "protocol": "ftp", "host": "h", "port": "many" })).unwrap();
        assert!(matches!(
            NetMount::volume_config(&params, "ftp"),
            Err(CommandError::Params(field)) if field == "port"
        ));
    }
}
