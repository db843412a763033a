/// In-process directory with lease expiry
///
/// Backs the directory server and doubles as the test directory for the
/// circuit initiator.

use super::{Directory, DirectoryError, RelayDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing::debug;
use veilnet_common::config::directory::LEASE_SECS;
use veilnet_common::Timestamp;

struct Registration {
    descriptor: RelayDescriptor,
    expires: Timestamp,
}

pub struct MemoryDirectory {
    entries: StdMutex<HashMap<String, Registration>>,
    lease: Duration,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(LEASE_SECS))
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            lease,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("directory lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn fetch(&self, prefix: &str) -> Result<Vec<RelayDescriptor>, DirectoryError> {
        let mut entries = self.entries.lock().expect("directory lock poisoned");
        // expired leases are reaped lazily on fetch
        entries.retain(|name, reg| {
            let live = !reg.expires.is_past();
            if !live {
                debug!("directory: lease for {:?} expired", name);
            }
            live
        });
        Ok(entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, reg)| reg.descriptor.clone())
            .collect())
    }

    async fn register(
        &self,
        name: &str,
        descriptor: RelayDescriptor,
    ) -> Result<Duration, DirectoryError> {
        if name.is_empty() {
            return Err(DirectoryError::Rejected("empty relay name".to_string()));
        }
        debug!("directory: registering {:?} as {}", name, descriptor);
        self.entries.lock().expect("directory lock poisoned").insert(
            name.to_string(),
            Registration {
                descriptor,
                expires: Timestamp::now().plus(self.lease),
            },
        );
        Ok(self.lease)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_common::AgentId;

    fn descriptor(group: u16, instance: u16) -> RelayDescriptor {
        RelayDescriptor::new(AgentId::new(group, instance), "127.0.0.1", 9201)
    }

    #[tokio::test]
    async fn test_register_and_fetch_by_prefix() {
        let dir = MemoryDirectory::new();
        dir.register("relay-1.1", descriptor(1, 1)).await.unwrap();
        dir.register("relay-1.2", descriptor(1, 2)).await.unwrap();
        dir.register("other-2.1", descriptor(2, 1)).await.unwrap();

        let relays = dir.fetch("relay-").await.unwrap();
        assert_eq!(relays.len(), 2);
        assert!(relays.iter().all(|r| r.agent.group() == 1));

        assert_eq!(dir.fetch("").await.unwrap().len(), 3);
        assert!(dir.fetch("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let dir = MemoryDirectory::new();
        dir.register("relay-1.1", descriptor(1, 1)).await.unwrap();
        dir.register("relay-1.1", RelayDescriptor::new(AgentId::new(1, 1), "10.0.0.5", 9999))
            .await
            .unwrap();

        let relays = dir.fetch("relay-").await.unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].host, "10.0.0.5");
    }

    #[tokio::test]
    async fn test_expired_lease_is_reaped() {
        let dir = MemoryDirectory::with_lease(Duration::from_secs(0));
        dir.register("relay-1.1", descriptor(1, 1)).await.unwrap();
        assert!(dir.fetch("relay-").await.unwrap().is_empty());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let dir = MemoryDirectory::new();
        assert!(matches!(
            dir.register("", descriptor(1, 1)).await,
            Err(DirectoryError::Rejected(_))
        ));
    }
}
