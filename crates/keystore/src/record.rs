use std::{
    fmt,
    net::IpAddr,
    num::ParseIntError,
    str::FromStr,
    time::SystemTime,
};

use rand::Rng;

/// Agent identifier. Assigned from a monotonic counter and rendered
/// zero-padded, the way it appears in `client.keys`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(u32);

impl AgentId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Symmetric key material returned to the agent, kept as the exact text
/// written to `client.keys`.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentKey(String);

impl AgentKey {
    /// 32 random bytes, hex encoded.
    pub fn random() -> Self {
        let bytes: [u8; 32] = rand::rng().random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for AgentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AgentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Keep key material out of logs.
        f.write_str("AgentKey(<redacted>)")
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid IP: {0}")]
pub struct InvalidAddr(pub String);

/// Address an enrollment is bound to: a concrete IP, a network, or the
/// `any` sentinel for agents reachable from anywhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AgentAddr {
    Any,
    Ip(IpAddr),
    Net(IpAddr, u8),
}

impl AgentAddr {
    pub fn is_any(&self) -> bool {
        matches!(self, AgentAddr::Any)
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAddr::Any => f.write_str("any"),
            AgentAddr::Ip(ip) => write!(f, "{ip}"),
            AgentAddr::Net(ip, prefix) => write!(f, "{ip}/{prefix}"),
        }
    }
}

impl FromStr for AgentAddr {
    type Err = InvalidAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "any" {
            return Ok(AgentAddr::Any);
        }
        if let Some((ip, prefix)) = s.split_once('/') {
            let ip: IpAddr = ip.parse().map_err(|_| InvalidAddr(s.to_owned()))?;
            let prefix: u8 = prefix.parse().map_err(|_| InvalidAddr(s.to_owned()))?;
            let max = if ip.is_ipv4() { 32 } else { 128 };
            if prefix > max {
                return Err(InvalidAddr(s.to_owned()));
            }
            return Ok(AgentAddr::Net(ip, prefix));
        }
        let ip: IpAddr = s.parse().map_err(|_| InvalidAddr(s.to_owned()))?;
        Ok(AgentAddr::Ip(ip))
    }
}

impl From<IpAddr> for AgentAddr {
    fn from(ip: IpAddr) -> Self {
        AgentAddr::Ip(ip)
    }
}

/// One enrolled agent as held by the [`KeyStore`](crate::KeyStore).
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    pub id: AgentId,
    pub name: String,
    pub addr: AgentAddr,
    pub key: AgentKey,
    pub group: Option<String>,
    pub registered_at: Option<SystemTime>,
}
