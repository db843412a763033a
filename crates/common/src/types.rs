use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identity of a relay on the overlay.
///
/// A 32-bit value composed of a 16-bit group number and a 16-bit instance
/// number. Only the external directory service gives it global meaning by
/// resolving it to a reachable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u32);

impl AgentId {
    pub fn new(group: u16, instance: u16) -> Self {
        Self(((group as u32) << 16) | instance as u32)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn group(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn instance(&self) -> u16 {
        self.0 as u16
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group(), self.instance())
    }
}

impl FromStr for AgentId {
    type Err = AgentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, instance) = s
            .split_once('.')
            .ok_or_else(|| AgentIdError::Format(s.to_string()))?;
        let group: u16 = group
            .parse()
            .map_err(|_| AgentIdError::Format(s.to_string()))?;
        let instance: u16 = instance
            .parse()
            .map_err(|_| AgentIdError::Format(s.to_string()))?;
        Ok(Self::new(group, instance))
    }
}

/// Agent id parse errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AgentIdError {
    #[error("invalid agent id {0:?}, expected \"group.instance\"")]
    Format(String),
}

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("System time before Unix epoch");
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    pub fn elapsed(&self) -> Duration {
        let now = Self::now();
        Duration::from_secs(now.0.saturating_sub(self.0))
    }

    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    pub fn is_past(&self) -> bool {
        Self::now().0 >= self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_parts() {
        let id = AgentId::new(9931, 7);
        assert_eq!(id.group(), 9931);
        assert_eq!(id.instance(), 7);
        assert_eq!(id, AgentId::from_u32(id.as_u32()));
    }

    #[test]
    fn test_agent_id_bytes_roundtrip() {
        let id = AgentId::new(0xBEEF, 0x0042);
        assert_eq!(AgentId::from_be_bytes(id.to_be_bytes()), id);
        assert_eq!(id.to_be_bytes(), [0xBE, 0xEF, 0x00, 0x42]);
    }

    #[test]
    fn test_agent_id_parse() {
        let id: AgentId = "12.34".parse().unwrap();
        assert_eq!(id, AgentId::new(12, 34));
        assert!("12".parse::<AgentId>().is_err());
        assert!("a.b".parse::<AgentId>().is_err());
        assert_eq!(id.to_string(), "12.34");
    }

    #[test]
    fn test_timestamp_lease() {
        let ts = Timestamp::now();
        assert!(!ts.plus(Duration::from_secs(60)).is_past());
        assert!(Timestamp::from_secs(ts.as_secs() - 10).is_past());
    }
}
