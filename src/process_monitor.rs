//! OS process table lookups (stray detection).

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
    /// 프로세스 커맨드라인 인수 (예: ["SR-Server.exe", "-cfg=C:\\...\\server.cfg"])
    #[serde(default)]
    pub cmd: Vec<String>,
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new();
    sys.refresh_processes();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .map(|(pid, process)| RunningProcess {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
            cmd: process.cmd().to_vec(),
        })
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// 프로세스 이름 + 커맨드라인 패턴으로 검색
///
/// `cmd_patterns`가 비어 있으면 이름만 비교합니다. 비어 있지 않으면 커맨드라인 전체
/// 문자열에 패턴 중 하나 이상이 포함된 프로세스만 반환 — 같은 `node.exe`를 쓰는
/// Olympus 인스턴스 둘을 config 경로로 구분할 수 있습니다.
pub fn find_by_name_and_cmd(name: &str, cmd_patterns: &[String]) -> Vec<RunningProcess> {
    filter_processes(get_running_processes(), name, cmd_patterns)
}

fn filter_processes(
    processes: Vec<RunningProcess>,
    name: &str,
    cmd_patterns: &[String],
) -> Vec<RunningProcess> {
    let name_lower = name.to_lowercase();
    processes
        .into_iter()
        .filter(|p| {
            // 1단계: 프로세스 이름 매칭
            let proc_name = p.name.to_lowercase();
            if !(proc_name.contains(&name_lower) || name_lower.contains(&proc_name)) || proc_name.is_empty() {
                return false;
            }
            // 2단계: cmd_patterns가 있으면 커맨드라인도 매칭
            if cmd_patterns.is_empty() {
                return true;
            }
            let cmdline = p.cmd.join(" ").to_lowercase();
            cmd_patterns.iter().any(|pat| cmdline.contains(&pat.to_lowercase()))
        })
        .collect()
}

// sysinfo는 OS 프로세스 테이블 전체를 동기적으로 스캔하므로
// spawn_blocking으로 전용 블로킹 스레드풀에서 실행합니다.
pub async fn find_by_name_and_cmd_async(name: &str, cmd_patterns: &[String]) -> Vec<RunningProcess> {
    let name = name.to_string();
    let patterns = cmd_patterns.to_vec();
    tokio::task::spawn_blocking(move || find_by_name_and_cmd(&name, &patterns))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc(pid: u32, name: &str, cmd: &[&str]) -> RunningProcess {
        RunningProcess {
            pid,
            name: name.to_string(),
            executable_path: None,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_filter_by_name_and_marker() {
        let table = vec![
            proc(1, "SR-Server.exe", &["SR-Server.exe", "-cfg=C:\\a\\server.cfg"]),
            proc(2, "SR-Server.exe", &["SR-Server.exe", "-cfg=C:\\b\\server.cfg"]),
            proc(3, "node.exe", &["node", "www", "--config", "C:\\a\\olympus.json"]),
        ];
        let found = filter_processes(table.clone(), "SR-Server.exe", &["c:\\A\\server.cfg".into()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 1);

        let all_srs = filter_processes(table.clone(), "sr-server.exe", &[]);
        assert_eq!(all_srs.len(), 2);

        assert!(filter_processes(table, "lardoon", &[]).is_empty());
    }

    #[test]
    fn test_truncated_process_name_matches() {
        // 리눅스 comm은 15자로 잘림
        let table = vec![proc(7, "DCS-SR-Server.s", &["/bin/sh", "/tmp/x/DCS-SR-Server.sh", "-cfg=/tmp/x/a.cfg"])];
        let found = filter_processes(table, "DCS-SR-Server.sh", &["/tmp/x/a.cfg".into()]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_own_process_is_listed() {
        let own = std::process::id();
        assert!(get_running_processes().iter().any(|p| p.pid == own));
    }
}
