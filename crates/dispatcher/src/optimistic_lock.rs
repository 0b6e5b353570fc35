use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

/// 乐观锁版本记录
#[derive(Debug, Clone)]
pub struct VersionEntry {
    pub version: u64,
    pub last_writer: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// 乐观锁管理器
///
/// 基于版本计数的 CAS 校验，用于排它锁过重的场景
/// （例如对任务/资源元数据的并发读改写）。读取版本、本地修改、
/// 提交时校验版本未变，失败方自行重读重试。
#[derive(Debug, Default)]
pub struct OptimisticLockManager {
    versions: Mutex<HashMap<String, VersionEntry>>,
}

impl OptimisticLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取（并按需初始化）某资源的当前版本号
    pub async fn acquire_lock(&self, resource_id: &str, agent_id: &str) -> u64 {
        let mut versions = self.versions.lock().await;
        let entry = versions
            .entry(resource_id.to_string())
            .or_insert_with(|| VersionEntry {
                version: 0,
                last_writer: None,
                updated_at: Utc::now(),
            });
        debug!(resource_id, agent_id, version = entry.version, "读取乐观锁版本");
        entry.version
    }

    /// CAS 提交：版本未变则递增并记录写入者，否则不做任何修改返回 false
    pub async fn validate_and_update(
        &self,
        resource_id: &str,
        agent_id: &str,
        expected_version: u64,
    ) -> bool {
        let mut versions = self.versions.lock().await;
        let Some(entry) = versions.get_mut(resource_id) else {
            return false;
        };
        if entry.version != expected_version {
            debug!(
                resource_id,
                agent_id,
                expected_version,
                actual = entry.version,
                "乐观锁校验失败"
            );
            return false;
        }
        entry.version += 1;
        entry.last_writer = Some(agent_id.to_string());
        entry.updated_at = Utc::now();
        true
    }

    pub async fn current_version(&self, resource_id: &str) -> Option<u64> {
        let versions = self.versions.lock().await;
        versions.get(resource_id).map(|entry| entry.version)
    }

    pub async fn last_writer(&self, resource_id: &str) -> Option<String> {
        let versions = self.versions.lock().await;
        versions
            .get(resource_id)
            .and_then(|entry| entry.last_writer.clone())
    }
}
