//! DCS 내장 보이스 채팅 (passive)
//!
//! prepare에서 `Config/serverSettings.lua`의 `cfg.advanced.voice_chat_server`를
//! `voice_chat_server` 옵션(기본 true)으로 맞춥니다.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::instance_home;
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, RegistryError,
    StatusField,
};
use crate::patcher::{ConfigPatch, KeyPath, PatchFormat, PatchOutcome};

pub struct VoiceChat {
    owner: String,
    server_settings: PathBuf,
    enabled: bool,
    running: bool,
}

impl VoiceChat {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = &spec.options;
        let enabled = match options.get("voice_chat_server") {
            None => true,
            Some(v) => v
                .as_bool()
                .ok_or_else(|| RegistryError::invalid("VoiceChat", "voice_chat_server", "must be true or false"))?,
        };
        let server_settings = match options.get_path("settings_file") {
            Some(path) => path,
            None => instance_home(ctx, "VoiceChat")?.join("Config").join("serverSettings.lua"),
        };
        Ok(Self {
            owner: ctx.owner(),
            server_settings,
            enabled,
            running: false,
        })
    }
}

#[async_trait]
impl Extension for VoiceChat {
    fn name(&self) -> &str {
        "VoiceChat"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Passive
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        let patch = ConfigPatch::new(&self.server_settings, PatchFormat::Lua { assignment: "cfg".into() })
            .set(KeyPath::new(["advanced", "voice_chat_server"]), self.enabled);
        if patch.apply()? != PatchOutcome::Unchanged {
            tracing::info!(
                "[{}] voice_chat_server = {} in {}",
                self.owner,
                self.enabled,
                self.server_settings.display()
            );
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        self.running = true;
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn render(&self) -> Vec<StatusField> {
        let state = if self.enabled { "enabled" } else { "disabled" };
        vec![StatusField::new("DCS Voice Chat", state)]
    }
}
