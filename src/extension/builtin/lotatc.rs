//! LotAtc (passive)
//!
//! `Mods/Services/LotAtc/config.custom.lua`를 옵션에서 통째로 재생성하고,
//! `stats.json`을 주기적으로 읽어 접속 중인 GCI를 추적합니다. 프로세스는 띄우지 않습니다.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{display_host, instance_home};
use crate::extension::{
    Extension, ExtensionContext, ExtensionError, ExtensionKind, ExtensionSpec, Options,
    PortRegistry, RegistryError, ScheduledJob, ScheduledWork, StatusField,
};
use crate::patcher::{ConfigPatch, KeyPath, PatchFormat};

pub const DEFAULT_PORT: u16 = 10310;
const LUA_ASSIGNMENT: &str = "lotatc_inst.options";
/// config.custom.lua에 넣지 않는 표시/감독 전용 키
const LOCAL_KEYS: [&str; 5] = ["show_passwords", "host", "installation", "stats_interval_secs", "version"];

/// 진영별 GCI 이름 → IP
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gcis {
    pub blue: BTreeMap<String, String>,
    pub red: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct Stats {
    #[serde(default)]
    clients: StatsClients,
}

#[derive(Debug, Deserialize, Default)]
struct StatsClients {
    #[serde(default)]
    blue: Vec<StatsClient>,
    #[serde(default)]
    red: Vec<StatsClient>,
}

#[derive(Debug, Deserialize)]
struct StatsClient {
    name: String,
    #[serde(default)]
    ip: String,
}

pub struct LotAtc {
    owner: String,
    ports: Arc<PortRegistry>,
    options: Options,
    /// SRS 피어 옵션 (같은 인스턴스)
    srs: Option<Options>,
    dir: PathBuf,
    host: String,
    port: u16,
    observing: bool,
    gcis: Arc<Mutex<Gcis>>,
}

impl LotAtc {
    pub fn new(spec: &ExtensionSpec, ctx: &ExtensionContext) -> Result<Self, RegistryError> {
        let options = spec.options.clone();
        let port = options.port("LotAtc", "port", DEFAULT_PORT)?;
        let dir = match options.get_path("installation") {
            Some(dir) => dir,
            None => instance_home(ctx, "LotAtc")?.join("Mods").join("Services").join("LotAtc"),
        };
        Ok(Self {
            owner: ctx.owner(),
            ports: ctx.ports.clone(),
            srs: ctx.peer("SRS").filter(|o| o.enabled()).cloned(),
            host: display_host(&options, ctx),
            options,
            dir,
            port,
            observing: false,
            gcis: Arc::new(Mutex::new(Gcis::default())),
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.custom.lua")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dir.join("stats.json")
    }

    fn config_patch(&self) -> ConfigPatch {
        let mut patch = ConfigPatch::new(
            self.config_path(),
            PatchFormat::LuaOwned {
                assignment: LUA_ASSIGNMENT.to_string(),
            },
        );
        for (key, value) in self.options.without(&LOCAL_KEYS) {
            patch.push(KeyPath::new([key]), value);
        }
        patch.push(KeyPath::new(["dedicated_mode"]), true);
        patch.push(KeyPath::new(["dump_json_stats"]), true);

        if let Some(srs) = &self.srs {
            if let Some(installation) = srs.get_str("installation") {
                patch.push(KeyPath::new(["srs_path"]), installation);
            }
            patch.push(KeyPath::new(["srs_server"]), "127.0.0.1");
            patch.push(KeyPath::new(["srs_server_port"]), srs_port(srs));
        }
        patch
    }

    fn stats_job(&self) -> StatsPoll {
        StatsPoll {
            owner: self.owner.clone(),
            path: self.stats_path(),
            gcis: self.gcis.clone(),
        }
    }

    pub fn gcis(&self) -> Gcis {
        self.gcis.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

/// SRS 피어의 포트: `port` 옵션 → SRS.cfg → 기본값
fn srs_port(srs: &Options) -> u16 {
    if let Some(port) = srs.get_u16("port") {
        return port;
    }
    srs.get_path("config")
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|text| {
            crate::patcher::read_sections(&text)
                .get("Server Settings")
                .and_then(|s| s.get("SERVER_PORT"))
                .and_then(|p| p.parse().ok())
        })
        .unwrap_or(super::srs::DEFAULT_PORT)
}

#[async_trait]
impl Extension for LotAtc {
    fn name(&self) -> &str {
        "LotAtc"
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::Passive
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        self.config_patch().apply()?;
        self.ports.claim("LotAtc", self.port, &self.owner)?;
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        self.observing = true;
        if let Err(e) = self.stats_job().run().await {
            tracing::debug!("[{}] initial LotAtc stats read failed: {}", self.owner, e);
        }
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
        self.observing = false;
        if let Ok(mut gcis) = self.gcis.lock() {
            *gcis = Gcis::default();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.observing
    }

    async fn version(&self) -> String {
        self.options.get_str("version").unwrap_or_default().to_string()
    }

    fn render(&self) -> Vec<StatusField> {
        let mut fields = vec![StatusField::new("LotAtc", format!("{}:{}", self.host, self.port))];
        let blue = self.options.get_str("blue_password").unwrap_or("");
        let red = self.options.get_str("red_password").unwrap_or("");
        if self.options.get_bool("show_passwords", true) && (!blue.is_empty() || !red.is_empty()) {
            fields.push(StatusField::new("Blue Password", blue));
            fields.push(StatusField::new("Red Password", red));
        }
        if self.observing {
            let gcis = self.gcis();
            fields.push(StatusField::new(
                "GCIs",
                format!("blue {} / red {}", gcis.blue.len(), gcis.red.len()),
            ));
        }
        fields
    }

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        let secs = self.options.get_u64("stats_interval_secs").unwrap_or(10);
        Some(ScheduledWork {
            interval: Duration::from_secs(secs.max(1)),
            budget: Some(Duration::from_secs(5)),
            job: Arc::new(self.stats_job()),
        })
    }
}

/// stats.json → GCI 입장/퇴장
struct StatsPoll {
    owner: String,
    path: PathBuf,
    gcis: Arc<Mutex<Gcis>>,
}

impl StatsPoll {
    fn apply(&self, stats: Stats) {
        let current = Gcis {
            blue: stats.clients.blue.into_iter().map(|c| (c.name, c.ip)).collect(),
            red: stats.clients.red.into_iter().map(|c| (c.name, c.ip)).collect(),
        };
        let Ok(mut known) = self.gcis.lock() else {
            return;
        };
        for (coalition, before, after) in [
            ("blue", &known.blue, &current.blue),
            ("red", &known.red, &current.red),
        ] {
            for (name, ip) in after.iter().filter(|(n, _)| !before.contains_key(*n)) {
                tracing::info!("[{}] GCI {} joined {} ({})", self.owner, name, coalition, ip);
            }
            for name in before.keys().filter(|n| !after.contains_key(*n)) {
                tracing::info!("[{}] GCI {} left {}", self.owner, name, coalition);
            }
        }
        *known = current;
    }
}

#[async_trait]
impl ScheduledJob for StatsPoll {
    async fn run(&self) -> anyhow::Result<()> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            // LotAtc가 아직 파일을 만들지 않음
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.apply(serde_json::from_str::<Stats>(&text)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{InstanceInfo, NodeInfo, Scope};
    use serde_json::json;
    use std::path::Path;

    fn ctx(home: &Path, peers: BTreeMap<String, Options>) -> ExtensionContext {
        ExtensionContext {
            node: NodeInfo {
                id: "n1".into(),
                public_ip: "198.51.100.4".into(),
                listen_address: "0.0.0.0".into(),
            },
            instance: Some(InstanceInfo {
                id: "i1".into(),
                name: "i1".into(),
                home: home.to_path_buf(),
            }),
            ports: Arc::new(PortRegistry::new()),
            peers: Arc::new(peers),
            log_buffer_lines: 100,
        }
    }

    #[test]
    fn test_render_without_process() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ExtensionSpec::new("LotAtc", Scope::Instance, "i1", Options::from(json!({"port": 10310})));
        let ext = LotAtc::new(&spec, &ctx(tmp.path(), BTreeMap::new())).unwrap();
        assert_eq!(ext.kind(), ExtensionKind::Passive);
        assert_eq!(ext.render(), vec![StatusField::new("LotAtc", "198.51.100.4:10310")]);
        assert!(ext.pid().is_none());
    }

    #[tokio::test]
    async fn test_prepare_writes_owned_config_with_srs_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let mut peers = BTreeMap::new();
        peers.insert(
            "SRS".to_string(),
            Options::from(json!({"config": "/nope/SRS.cfg", "port": 5010})),
        );
        let spec = ExtensionSpec::new(
            "LotAtc",
            Scope::Instance,
            "i1",
            Options::from(json!({"port": 10311, "blue_password": "b", "show_passwords": false})),
        );
        let mut ext = LotAtc::new(&spec, &ctx(tmp.path(), peers)).unwrap();
        ext.prepare().await.unwrap();

        let text = std::fs::read_to_string(ext.config_path()).unwrap();
        assert!(text.starts_with("lotatc_inst.options = {\n"));
        assert!(text.contains("\t[\"port\"] = 10311,\n"));
        assert!(text.contains("\t[\"dedicated_mode\"] = true,\n"));
        assert!(text.contains("\t[\"srs_server_port\"] = 5010,\n"));
        assert!(!text.contains("show_passwords"));

        ext.prepare().await.unwrap();
        assert_eq!(std::fs::read_to_string(ext.config_path()).unwrap(), text);

        // show_passwords = false
        assert_eq!(ext.render().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_tracks_gcis() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ExtensionSpec::new("LotAtc", Scope::Instance, "i1", Options::new());
        let mut ext = LotAtc::new(&spec, &ctx(tmp.path(), BTreeMap::new())).unwrap();
        std::fs::create_dir_all(ext.stats_path().parent().unwrap()).unwrap();
        std::fs::write(
            ext.stats_path(),
            r#"{"clients": {"blue": [{"name": "Eagle", "ip": "10.0.0.1:1234"}], "red": []}}"#,
        )
        .unwrap();

        ext.startup().await.unwrap();
        assert!(ext.is_running());
        assert_eq!(ext.gcis().blue.len(), 1);
        assert!(ext.render().contains(&StatusField::new("GCIs", "blue 1 / red 0")));

        std::fs::write(ext.stats_path(), r#"{"clients": {"blue": [], "red": [{"name": "Bear"}]}}"#)
            .unwrap();
        ext.scheduled_task().unwrap().job.run().await.unwrap();
        let gcis = ext.gcis();
        assert!(gcis.blue.is_empty());
        assert!(gcis.red.contains_key("Bear"));

        ext.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(!ext.is_running());
    }
}
