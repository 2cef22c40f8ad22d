//! 컨테이너 디렉토리 -- 감시 네트워크에 있는 컨테이너의 공유 맵
//!
//! 프로세스 내 유일한 공유 가변 상태입니다.
//! 삽입/제거/조회는 각각 원자적이며, 순회는 스냅샷 복사본으로만 제공합니다.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use netwarden_core::types::ContainerRecord;

/// 컨테이너 ID를 키로 하는 레코드 맵
///
/// `Clone`은 같은 맵을 가리키는 핸들을 복제합니다.
#[derive(Debug, Clone, Default)]
pub struct ContainerDirectory {
    inner: Arc<Mutex<HashMap<String, ContainerRecord>>>,
}

impl ContainerDirectory {
    /// 빈 디렉토리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 레코드를 삽입합니다. 같은 ID의 기존 레코드는 교체되어 반환됩니다.
    pub async fn insert(&self, record: ContainerRecord) -> Option<ContainerRecord> {
        self.inner.lock().await.insert(record.id.clone(), record)
    }

    /// ID에 해당하는 레코드를 제거하고 반환합니다.
    pub async fn remove(&self, id: &str) -> Option<ContainerRecord> {
        self.inner.lock().await.remove(id)
    }

    /// 알려진 컨테이너인지 확인합니다.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.contains_key(id)
    }

    /// 전체 레코드의 스냅샷 (이름순)
    pub async fn snapshot(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<_> = self.inner.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_owned(),
            name: name.to_owned(),
            network: "bridge".to_owned(),
            ip_address: None,
            ports: Vec::new(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_contains() {
        let dir = ContainerDirectory::new();
        assert!(dir.insert(record("a", "alpha")).await.is_none());
        assert_eq!(dir.snapshot().await[0].name, "alpha");
        assert!(dir.contains("a").await);
        assert_eq!(dir.len().await, 1);
    }

    #[tokio::test]
    async fn insert_same_id_replaces() {
        let dir = ContainerDirectory::new();
        dir.insert(record("a", "old")).await;
        let previous = dir.insert(record("a", "new")).await;
        assert_eq!(previous.unwrap().name, "old");
        assert_eq!(dir.len().await, 1);
        assert_eq!(dir.snapshot().await[0].name, "new");
    }

    #[tokio::test]
    async fn remove_returns_last_snapshot_once() {
        let dir = ContainerDirectory::new();
        dir.insert(record("a", "alpha")).await;
        assert_eq!(dir.remove("a").await.unwrap().name, "alpha");
        assert!(dir.remove("a").await.is_none());
        assert!(dir.is_empty().await);
    }

    #[tokio::test]
    async fn snapshot_is_sorted_copy() {
        let dir = ContainerDirectory::new();
        dir.insert(record("2", "zeta")).await;
        dir.insert(record("1", "alpha")).await;

        let snapshot = dir.snapshot().await;
        let names: Vec<_> = snapshot.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        // 스냅샷 이후의 변경은 스냅샷에 반영되지 않음
        dir.remove("1").await;
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let dir = ContainerDirectory::new();
        let handle = dir.clone();
        handle.insert(record("a", "alpha")).await;
        assert!(dir.contains("a").await);
    }
}
