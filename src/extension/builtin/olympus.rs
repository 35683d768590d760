//! DCS Olympus (process-backed)
//!
//! `Config/olympus.json`에 포트/주소/비밀번호 해시를 병합하고
//! `node <frontend>/bin/www --config <olympus.json>`을 실행합니다.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{executable_name, instance_home, process_spec, VersionProbe};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Launcher, Options,
    PortRegistry, RegistryError, StatusField,
};
use crate::patcher::{ConfigPatch, KeyPath, PatchFormat, PatchOutcome};
use crate::supervisor::process::ProcessSpec;

pub const DEFAULT_BACKEND_PORT: u16 = 3001;
pub const DEFAULT_FRONTEND_PORT: u16 = 3000;
const ROLES: [(&str, &str); 3] = [
    ("gameMaster", "Game Master"),
    ("blueCommander", "Blue Commander"),
    ("redCommander", "Red Commander"),
];

/// 중첩 옵션 (`backend.port`)
fn nested<'a>(options: &'a Options, table: &str, key: &str) -> Option<&'a serde_json::Value> {
    options.get(table).and_then(|t| t.get(key))
}

fn nested_port(options: &Options, table: &str, default: u16) -> Result<u16, RegistryError> {
    match nested(options, table, "port") {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0)
            .ok_or_else(|| {
                RegistryError::invalid("Olympus", &format!("{}.port", table), "must be a port number")
            }),
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub struct Olympus {
    owner: String,
    ports: Arc<PortRegistry>,
    options: Options,
    public_ip: String,
    config_path: PathBuf,
    frontend_path: PathBuf,
    nodejs: PathBuf,
    backend_port: u16,
    frontend_port: u16,
    spec_template: ProcessSpec,
    version: VersionProbe,
    launcher: Launcher,
}

impl Olympus {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = spec.options.clone();
        let home = instance_home(ctx, "Olympus")?;
        let backend_port = nested_port(&options, "backend", DEFAULT_BACKEND_PORT)?;
        let frontend_port = nested_port(&options, "frontend", DEFAULT_FRONTEND_PORT)?;

        let install = options
            .get_path("installation")
            .unwrap_or_else(|| home.join("Mods").join("Services").join("Olympus"));
        let frontend_path = nested(&options, "frontend", "path")
            .and_then(|v| v.as_str())
            .map(crate::utils::expand_path)
            .unwrap_or_else(|| install.join("frontend"));
        let nodejs = options
            .get_path("nodejs")
            .unwrap_or_else(|| crate::utils::expand_path("%ProgramFiles%/nodejs"))
            .join(executable_name("node"));

        let config_path = options
            .get_path("config")
            .unwrap_or_else(|| home.join("Config").join("olympus.json"));
        let www = frontend_path.join("bin").join("www");
        let spec_template = process_spec("Olympus", &nodejs, &options, ctx)
            .arg(www.to_string_lossy())
            .arg("--config")
            .arg(config_path.to_string_lossy())
            .cwd(&frontend_path);

        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            public_ip: ctx.node.public_ip.clone(),
            version: VersionProbe::from_options(&options, &nodejs),
            spec_template,
            config_path,
            launcher: Launcher::new(format!("{}:Olympus", ctx.owner())),
            options,
            frontend_path,
            nodejs,
            backend_port,
            frontend_port,
        })
    }

    fn config_patch(&self) -> ConfigPatch {
        let address = nested(&self.options, "backend", "address")
            .and_then(|v| v.as_str())
            .unwrap_or("localhost");
        let mut patch = ConfigPatch::new(&self.config_path, PatchFormat::Json)
            .set("backend.address", address)
            .set("backend.port", self.backend_port)
            .set("frontend.port", self.frontend_port);
        for (role, _) in ROLES {
            // 설정 안 된 역할은 기존 해시 유지
            if let Some(plain) = self.password(role) {
                patch.push(
                    KeyPath::new(["authentication".to_string(), format!("{}Password", role)]),
                    hash_password(plain),
                );
            }
        }
        patch
    }

    fn password(&self, role: &str) -> Option<&str> {
        nested(&self.options, "authentication", &format!("{}Password", role)).and_then(|v| v.as_str())
    }
}

#[async_trait]
impl Extension for Olympus {
    fn name(&self) -> &str {
        "Olympus"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::ProcessBacked
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        self.ports.claim("Olympus backend", self.backend_port, &self.owner)?;
        self.ports.claim("Olympus frontend", self.frontend_port, &self.owner)?;
        if self.config_patch().apply()? != PatchOutcome::Unchanged {
            tracing::info!("[{}] {} updated", self.owner, self.config_path.display());
        }
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        let www = self.frontend_path.join("bin").join("www");
        if !www.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "{} does not exist",
                www.display()
            )));
        }
        if !self.nodejs.exists() {
            return Err(ExtensionError::NotInstalled(format!(
                "Node.js not found at {}",
                self.nodejs.display()
            )));
        }

        let marker = self.config_path.to_string_lossy().to_string();
        let pid = self.launcher.launch(&self.spec_template, Some(&marker)).await?;
        tracing::info!("[{}] Olympus started on port {} (pid: {})", self.owner, self.frontend_port, pid);
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
        let url = self
            .options
            .get_str("url")
            .map(str::to_string)
            .unwrap_or_else(|| format!("http://{}:{}", self.public_ip, self.frontend_port));
        let mut fields = vec![StatusField::new("Olympus", url)];
        if self.options.get_bool("show_passwords", false) {
            for (role, label) in ROLES {
                fields.push(StatusField::new(label, self.password(role).unwrap_or("")));
            }
        }
        fields
    }

    fn pid(&self) -> Option<u32> {
        self.launcher.pid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{InstanceInfo, NodeInfo, Scope};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn ctx(home: &Path, ports: Arc<PortRegistry>) -> ExtensionContext {
        ExtensionContext {
            node: NodeInfo {
                id: "n1".into(),
                public_ip: "198.51.100.4".into(),
                listen_address: "0.0.0.0".into(),
            },
            instance: Some(InstanceInfo {
                id: "i1".into(),
                name: "Training".into(),
                home: home.to_path_buf(),
            }),
            ports,
            peers: Arc::new(BTreeMap::new()),
            log_buffer_lines: 50,
        }
    }

    fn olympus(home: &Path, ports: Arc<PortRegistry>, options: serde_json::Value) -> Olympus {
        let spec = ExtensionSpec::new("Olympus", Scope::Instance, "i1", Options::from(options));
        Olympus::new(&spec, &ctx(home, ports)).unwrap()
    }

    #[test]
    fn test_hash_password() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_prepare_merges_config() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = tmp.path().join("Config").join("olympus.json");
        std::fs::create_dir_all(cfg.parent().unwrap()).unwrap();
        std::fs::write(
            &cfg,
            r#"{"backend": {"address": "localhost", "port": 3001}, "frontend": {"port": 3000, "customStuff": 1}}"#,
        )
        .unwrap();

        let ports = Arc::new(PortRegistry::new());
        let mut ext = olympus(
            tmp.path(),
            ports.clone(),
            json!({
                "backend": {"port": 4001},
                "frontend": {"port": 4000},
                "authentication": {"gameMasterPassword": "abc"}
            }),
        );
        ext.prepare().await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&cfg).unwrap()).unwrap();
        assert_eq!(written["backend"]["port"], 4001);
        assert_eq!(written["frontend"]["port"], 4000);
        assert_eq!(written["frontend"]["customStuff"], 1);
        assert_eq!(written["authentication"]["gameMasterPassword"], hash_password("abc"));
        assert!(written["authentication"].get("redCommanderPassword").is_none());
        assert_eq!(ports.owner_of(4001).unwrap().owner, "i1");
        assert_eq!(ports.owner_of(4000).unwrap().owner, "i1");
    }

    #[tokio::test]
    async fn test_startup_without_frontend_is_not_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ext = olympus(tmp.path(), Arc::new(PortRegistry::new()), json!({}));
        ext.prepare().await.unwrap();
        assert_eq!(ext.startup().await.unwrap_err().error_code(), "NOT_INSTALLED");
    }

    #[test]
    fn test_render_url_and_passwords() {
        let tmp = tempfile::tempdir().unwrap();
        let ext = olympus(tmp.path(), Arc::new(PortRegistry::new()), json!({}));
        assert_eq!(ext.render(), vec![StatusField::new("Olympus", "http://198.51.100.4:3000")]);

        let ext = olympus(
            tmp.path(),
            Arc::new(PortRegistry::new()),
            json!({
                "url": "https://olympus.example.org",
                "show_passwords": true,
                "authentication": {"blueCommanderPassword": "blue"}
            }),
        );
        let fields = ext.render();
        assert_eq!(fields[0].value, "https://olympus.example.org");
        assert_eq!(fields[2], StatusField::new("Blue Commander", "blue"));
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ExtensionSpec::new(
            "Olympus",
            Scope::Instance,
            "i1",
            Options::from(json!({"backend": {"port": "abc"}})),
        );
        let err = Olympus::new(&spec, &ctx(tmp.path(), Arc::new(PortRegistry::new()))).err().unwrap();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }
}
