//! 임의의 외부 프로그램
//!
//! ```toml
//! [nodes.instances.extensions.Program]
//! command = "C:/tools/bot/bot.exe"
//! args = ["--serve"]
//! env = { BOT_TOKEN = "..." }
//! url = "http://localhost:8080"
//!
//! [nodes.instances.extensions.Program.config]
//! path = "C:/tools/bot/settings.ini"
//! format = "keyvalue"
//! settings = { General = { port = 8080 } }
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{process_spec, VersionProbe};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Launcher,
    RegistryError, StatusField,
};
use crate::patcher::{ConfigPatch, KeyPath, PatchFormat, PatchOutcome};
use crate::supervisor::process::ProcessSpec;

pub struct Program {
    owner: String,
    command: PathBuf,
    url: Option<String>,
    patch: Option<ConfigPatch>,
    spec_template: ProcessSpec,
    version: VersionProbe,
    launcher: Launcher,
}

impl Program {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = &spec.options;
        let command = options.require_path("Program", "command")?;
        let label = options
            .get_str("label")
            .map(str::to_string)
            .or_else(|| command.file_stem().map(|s| s.to_string_lossy().to_string()))
            .unwrap_or_else(|| "Program".to_string());

        let mut template = process_spec(&label, &command, options, ctx)
            .args(options.get_str_list("args").into_iter().map(|a| crate::utils::expand_vars(&a)));
        if let Some(cwd) = options.get_path("cwd") {
            template = template.cwd(cwd);
        }
        match options.get("env") {
            None => {}
            Some(Value::Object(env)) => {
                for (key, value) in env {
                    let Some(text) = crate::patcher::scalar_text(value) else {
                        return Err(RegistryError::invalid("Program", "env", "values must be scalars"));
                    };
                    template = template.env(key, crate::utils::expand_vars(&text));
                }
            }
            Some(_) => return Err(RegistryError::invalid("Program", "env", "must be a table")),
        }

        let patch = match options.get("config") {
            None => None,
            Some(block) => Some(config_patch(block)?),
        };

        Ok(Self {
            owner: ctx.owner(),
            url: options.get_str("url").map(str::to_string),
            version: VersionProbe::from_options(options, &command),
            launcher: Launcher::new(format!("{}:{}", ctx.owner(), label)),
            spec_template: template,
            command,
            patch,
        })
    }
}

/// `[config]` 블록 → 패치.
/// keyvalue 형식은 최상위 스칼라가 전역 키, 테이블이 섹션.
fn config_patch(block: &Value) -> Result<ConfigPatch, RegistryError> {
    let path = block
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| RegistryError::missing("Program", "config.path"))?;
    let format = match block.get("format").and_then(Value::as_str) {
        Some(f) => PatchFormat::from_str(f)
            .map_err(|e| RegistryError::invalid("Program", "config.format", e))?,
        None => PatchFormat::KeyValue,
    };
    let settings = match block.get("settings") {
        None => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(RegistryError::invalid("Program", "config.settings", "must be a table")),
    };

    let mut patch = ConfigPatch::new(crate::utils::expand_path(path), format.clone());
    for (key, value) in settings {
        match (&format, value) {
            (PatchFormat::KeyValue, Value::Object(section)) => {
                for (inner, v) in section {
                    patch.push(KeyPath::new([key.clone(), inner]), v);
                }
            }
            (_, value) => patch.push(KeyPath::new([key]), value),
        }
    }
    Ok(patch)
}

#[async_trait]
impl Extension for Program {
    fn name(&self) -> &str {
        "Program"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::ProcessBacked
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        if let Some(patch) = &self.patch {
            if patch.apply()? != PatchOutcome::Unchanged {
                tracing::info!("[{}] {} updated", self.owner, patch.target.display());
            }
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        if !self.command.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "{} not found",
                self.command.display()
            )));
        }
        let pid = self.launcher.launch(&self.spec_template, None).await?;
        tracing::info!("[{}] {} started (pid: {})", self.owner, self.spec_template.label(), pid);
        Ok(())
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), ExtensionError> {
        self.launcher.stop(grace).await
    }

    fn is_running(&self) -> bool {
        self.launcher.is_alive()
    }

    async fn version(&self) -> String {
        self.version.resolve().await
    }

    fn render(&self) -> Vec<StatusField> {
        let label = self.spec_template.label();
        let mut fields = Vec::new();
        if let Some(url) = &self.url {
            fields.push(StatusField::new(label, url.as_str()));
        }
        match self.launcher.pid() {
            Some(pid) if self.launcher.is_alive() => fields.push(StatusField::new("PID", pid.to_string())),
            _ if fields.is_empty() => fields.push(StatusField::new(label, "stopped")),
            _ => {}
        }
        fields
    }

    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }
}
