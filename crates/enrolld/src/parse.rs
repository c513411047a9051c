//! The request parser: a pure function from the raw request buffer to a
//! typed enrollment intent. Everything here is syntax; policy checks that
//! need the store or the filesystem live with the dispatcher.

use std::net::IpAddr;

use common::knobs::{
    AGENT_NAME_MAX,
    GROUP_NAME_MAX,
    MAX_GROUPS_PER_MULTIGROUP,
    MULTIGROUP_NAME_MAX,
};
use keystore::AgentAddr;

/// Why a group spec was rejected. The `Display` strings are the reasons
/// agents already know how to show their operators.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupNameError {
    #[error("characters '\\/:*?\"<>|,' are prohibited")]
    ProhibitedCharacters,
    #[error("white spaces are not allowed")]
    WhiteSpaces,
    #[error("consecutive ',' are not allowed")]
    ConsecutiveCommas,
    #[error("cannot start or end with ','")]
    LeadingOrTrailingComma,
    #[error("group is too large")]
    TooLarge,
    #[error("multigroup is too large")]
    MultigroupTooLarge,
    #[error("maximum multigroup reached")]
    TooManyGroups,
}

/// Rejections surfaced to the agent. `Display` is the exact reason line
/// written to the wire; the dispatcher appends the trailing blank line.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    #[error("ERROR: Invalid password")]
    InvalidPassword,
    #[error("ERROR: Invalid request for new agent")]
    Malformed,
    #[error("ERROR: Invalid agent name: {0}")]
    InvalidAgentName(String),
    #[error("ERROR: Invalid group name: {name}... {reason}")]
    InvalidGroupName {
        name: String,
        reason: GroupNameError,
    },
    #[error("ERROR: Invalid group: {0}")]
    UnknownGroup(String),
    #[error("ERROR: Invalid IP: {0}")]
    InvalidIp(String),
    #[error("ERROR: Duplicated IP: {0}")]
    DuplicatedIp(String),
    #[error("ERROR: The maximum number of agents has been reached")]
    AgentLimitReached,
    #[error("ERROR: Internal manager error adding agent: {0}")]
    Internal(String),
}

impl EnrollmentError {
    /// Protocol-level failures are logged at warn; plain policy rejections
    /// stay at info.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, EnrollmentError::Malformed)
    }
}

/// A syntactically valid enrollment request with owned fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentIntent {
    pub name: String,
    pub groups: Option<Vec<String>>,
    pub addr: AgentAddr,
}

/// Parses one request buffer:
///
/// ```text
/// [OSSEC PASS: <pw> ]OSSEC A:'<name>'[ G:'<g1,g2,...>'][ IP:'<ip-or-src>']
/// ```
///
/// Deterministic and free of I/O; the buffer is never consulted again once
/// the intent's owned fields are materialized.
pub fn parse_request(
    buf: &str,
    password: Option<&str>,
    peer: IpAddr,
    use_source_ip: bool,
) -> Result<EnrollmentIntent, EnrollmentError> {
    let mut rest = buf.trim_end_matches(['\r', '\n', '\0']);

    if let Some(password) = password {
        // Length-prefixed comparison: the configured password must be
        // followed by exactly one separating space.
        rest = rest
            .strip_prefix("OSSEC PASS: ")
            .and_then(|r| r.strip_prefix(password))
            .and_then(|r| r.strip_prefix(' '))
            .ok_or(EnrollmentError::InvalidPassword)?;
    }

    let after_tag = rest
        .strip_prefix("OSSEC A:'")
        .ok_or(EnrollmentError::Malformed)?;
    let (name, mut rest) = after_tag.split_once('\'').ok_or(EnrollmentError::Malformed)?;
    if !is_valid_agent_name(name) {
        return Err(EnrollmentError::InvalidAgentName(name.to_owned()));
    }

    let mut groups = None;
    if let Some(after) = rest.strip_prefix(" G:'") {
        let (raw, tail) = after.split_once('\'').ok_or(EnrollmentError::Malformed)?;
        if !raw.is_empty() {
            groups = Some(parse_multigroup(raw)?);
        }
        rest = tail;
    }

    let mut addr = if use_source_ip {
        AgentAddr::from(peer)
    } else {
        AgentAddr::Any
    };
    if let Some(after) = rest.strip_prefix(" IP:'") {
        let (raw, _) = after.split_once('\'').ok_or(EnrollmentError::Malformed)?;
        if raw == "src" {
            addr = AgentAddr::from(peer);
        } else {
            addr = raw
                .parse()
                .map_err(|_| EnrollmentError::InvalidIp(raw.to_owned()))?;
        }
    }

    Ok(EnrollmentIntent {
        name: name.to_owned(),
        groups,
        addr,
    })
}

/// Names may be any printable text that can't escape the store's file
/// layout or the wire framing: quotes, path separators and control
/// characters are rejected, everything else is the agent's business.
pub fn is_valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= *AGENT_NAME_MAX
        && name
            .chars()
            .all(|c| !c.is_control() && !matches!(c, '\'' | '"' | '/' | '\\'))
}

const PROHIBITED_GROUP_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

fn group_error(raw: &str, reason: GroupNameError) -> EnrollmentError {
    // Error strings truncate long specs the way logs do.
    let name: String = raw.chars().take(255).collect();
    EnrollmentError::InvalidGroupName { name, reason }
}

/// Validates a comma-delimited multigroup spec and splits it into its
/// elements, dropping duplicates while preserving first occurrence.
pub fn parse_multigroup(raw: &str) -> Result<Vec<String>, EnrollmentError> {
    if raw.len() > *MULTIGROUP_NAME_MAX {
        return Err(group_error(raw, GroupNameError::MultigroupTooLarge));
    }
    if raw.starts_with(',') || raw.ends_with(',') {
        return Err(group_error(raw, GroupNameError::LeadingOrTrailingComma));
    }
    if raw.contains(",,") {
        return Err(group_error(raw, GroupNameError::ConsecutiveCommas));
    }

    let mut groups: Vec<String> = Vec::new();
    let mut count = 0usize;
    for element in raw.split(',') {
        count += 1;
        if count > *MAX_GROUPS_PER_MULTIGROUP {
            return Err(group_error(raw, GroupNameError::TooManyGroups));
        }
        if element.chars().any(char::is_whitespace) {
            return Err(group_error(raw, GroupNameError::WhiteSpaces));
        }
        if element.contains(PROHIBITED_GROUP_CHARS) {
            return Err(group_error(raw, GroupNameError::ProhibitedCharacters));
        }
        if element.len() > *GROUP_NAME_MAX {
            return Err(group_error(element, GroupNameError::TooLarge));
        }
        if !groups.iter().any(|g| g == element) {
            groups.push(element.to_owned());
        }
    }
    Ok(groups)
}
