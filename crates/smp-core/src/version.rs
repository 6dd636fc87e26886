//! Agent version parsing and capability gates.
//!
//! Agent versions are dotted number strings like `3.1.1511.0`. Capability
//! checks are strictly-greater-than comparisons against the versions that
//! introduced each feature; unparseable versions gate to unsupported.

use std::cmp::Ordering;

use tracing::debug;

use crate::constants::{
    MUX_KEEP_ALIVE_DISABLED_AFTER, TCP_MULTIPLEXING_SUPPORTED_AFTER,
    TERMINATE_SESSION_FLAG_SUPPORTED_AFTER,
};

/// A parsed dotted version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    components: Vec<u64>,
}

impl Version {
    /// Parse a dotted number string.
    pub fn parse(input: &str) -> Option<Self> {
        if input.is_empty() {
            return None;
        }
        let components = input
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Self { components })
    }

    /// Compare component-wise, treating missing components as zero.
    pub fn compare(&self, other: &Version) -> Ordering {
        let len = self.components.len().max(other.components.len());
        for i in 0..len {
            let a = self.components.get(i).copied().unwrap_or(0);
            let b = other.components.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

fn is_greater_than(agent_version: &str, supported_version: &str) -> bool {
    let Some(agent) = Version::parse(agent_version) else {
        debug!(agent_version, "agent version failed to parse");
        return false;
    };
    let Some(supported) = Version::parse(supported_version) else {
        debug!(supported_version, "supported version failed to parse");
        return false;
    };
    agent.compare(&supported) == Ordering::Greater
}

/// True if the agent accepts the TerminateSession flag over the channel.
pub fn supports_terminate_session_flag(agent_version: &str) -> bool {
    is_greater_than(agent_version, TERMINATE_SESSION_FLAG_SUPPORTED_AFTER)
}

/// True if the agent multiplexes TCP connections over one channel.
pub fn supports_tcp_multiplexing(agent_version: &str) -> bool {
    is_greater_than(agent_version, TCP_MULTIPLEXING_SUPPORTED_AFTER)
}

/// True if mux keep-alive must be disabled for this agent.
pub fn supports_disable_mux_keep_alive(agent_version: &str) -> bool {
    is_greater_than(agent_version, MUX_KEEP_ALIVE_DISABLED_AFTER)
}
