//! Membership tags: versioned per-member state with SWIM merge rules
//!
//! Every member carries one tag under the configured key: a version counter,
//! a liveness state, and the member's region. Remote tags merge under SWIM
//! precedence: higher version wins outright; at equal versions SUSPECTED
//! may raise ALIVE, DEAD overrides everything but LEFT, and LEFT is
//! terminal. Downgrading out of SUSPECTED/DEAD requires the impugned member
//! itself to bump its version and claim ALIVE.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use huddle_store::{KeyValue, KvTxn, KvValidator, StoreError};

use crate::error::{GossipError, Result};

/// Liveness state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SwimState {
    #[default]
    Alive,
    Suspected,
    Dead,
    Left,
}

impl From<SwimState> for u8 {
    fn from(state: SwimState) -> u8 {
        match state {
            SwimState::Alive => 0,
            SwimState::Suspected => 1,
            SwimState::Dead => 2,
            SwimState::Left => 3,
        }
    }
}

impl TryFrom<u8> for SwimState {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SwimState::Alive),
            1 => Ok(SwimState::Suspected),
            2 => Ok(SwimState::Dead),
            3 => Ok(SwimState::Left),
            other => Err(format!("undefined SWIM state {other}")),
        }
    }
}

impl fmt::Display for SwimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwimState::Alive => "alive",
            SwimState::Suspected => "suspected",
            SwimState::Dead => "dead",
            SwimState::Left => "left",
        };
        f.write_str(name)
    }
}

fn u32_is_zero(v: &u32) -> bool {
    *v == 0
}

fn state_is_alive(s: &SwimState) -> bool {
    *s == SwimState::Alive
}

/// One member's membership tag. Encodes as a compact JSON record with
/// fields omitted at their zero values; the default tag encodes as `{}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwimTag {
    /// Monotonic within a single member's lifetime.
    #[serde(rename = "v", default, skip_serializing_if = "u32_is_zero")]
    pub version: u32,

    #[serde(rename = "s", default, skip_serializing_if = "state_is_alive")]
    pub state: SwimState,

    /// Fault-domain grouping; only ever changed by the owning member
    /// alongside a version bump.
    #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

impl SwimTag {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("SWIM tag serializes to JSON")
    }

    pub fn decode(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| GossipError::Decode(e.to_string()))
    }

    /// Decode a stored value, treating the empty string as "no tag yet".
    pub fn decode_stored(value: &str) -> Result<Self> {
        if value.is_empty() {
            return Ok(Self::default());
        }
        Self::decode(value)
    }
}

/// Data model for the membership-tag key: validation, SWIM merge, and
/// transaction creation.
pub struct TagValidator;

impl KvValidator for TagValidator {
    fn sync(&self, entry: &mut KeyValue, remote: Option<&KeyValue>) -> huddle_store::Result<bool> {
        let Some(remote) = remote else {
            return Ok(false);
        };

        let Ok(remote_tag) = SwimTag::decode(&remote.value) else {
            warn!("rejecting undecodable remote SWIM tag");
            return Ok(false);
        };

        let mut local_tag = match SwimTag::decode_stored(&entry.value) {
            Ok(tag) => tag,
            Err(_) => {
                // local value is beyond repair; take the remote verbatim
                warn!("dropping undecodable local SWIM tag");
                entry.value = remote.value.clone();
                return Ok(true);
            }
        };

        // higher version wins outright
        if remote_tag.version > local_tag.version {
            entry.value = remote.value.clone();
            return Ok(true);
        }
        if remote_tag.version < local_tag.version {
            return Ok(false);
        }

        // equal versions merge state only
        let changed = match remote_tag.state {
            SwimState::Suspected if local_tag.state == SwimState::Alive => {
                local_tag.state = SwimState::Suspected;
                true
            }
            SwimState::Dead if local_tag.state != SwimState::Left => {
                local_tag.state = SwimState::Dead;
                true
            }
            SwimState::Left if local_tag.state != SwimState::Left => {
                local_tag.state = SwimState::Left;
                true
            }
            _ => false,
        };

        if changed {
            entry.value = local_tag.encode();
        }
        Ok(changed)
    }

    fn validate(&self, kv: &KeyValue) -> bool {
        kv.value.is_empty() || SwimTag::decode(&kv.value).is_ok()
    }

    fn txn(&self, kv: KeyValue) -> huddle_store::Result<Box<dyn KvTxn>> {
        let tag = SwimTag::decode_stored(&kv.value)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Box::new(TagTransaction {
            old_version: tag.version,
            tag,
            before: kv.value,
            changed: false,
        }))
    }
}

/// Staged mutation of one member's tag. Claim operations report whether
/// they changed anything; the change flag is sticky for the transaction.
pub struct TagTransaction {
    before: String,
    tag: SwimTag,
    changed: bool,
    old_version: u32,
}

impl TagTransaction {
    pub fn state(&self) -> SwimState {
        self.tag.state
    }

    pub fn region(&self) -> &str {
        &self.tag.region
    }

    /// Version the tag carried when the transaction began.
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    /// Claim the member dead. LEFT is terminal and wins.
    pub fn claim_dead(&mut self) -> bool {
        if self.tag.state == SwimState::Left {
            return false;
        }
        if self.tag.state != SwimState::Dead {
            self.tag.state = SwimState::Dead;
            self.changed = true;
            return true;
        }
        false
    }

    /// Claim the member suspected. Only raises ALIVE.
    pub fn claim_suspected(&mut self) -> bool {
        match self.tag.state {
            SwimState::Dead | SwimState::Left | SwimState::Suspected => false,
            SwimState::Alive => {
                self.tag.state = SwimState::Suspected;
                self.changed = true;
                true
            }
        }
    }

    /// Claim the member alive, bumping the version so the correction
    /// supersedes the false positive at every peer.
    pub fn claim_alive(&mut self) -> bool {
        if self.tag.state == SwimState::Alive {
            return false;
        }
        self.tag.version = self.tag.version.wrapping_add(1);
        self.tag.state = SwimState::Alive;
        self.changed = true;
        true
    }

    /// Mark the member as having left. Terminal.
    pub fn leave(&mut self) -> bool {
        if self.tag.state != SwimState::Left {
            self.tag.state = SwimState::Left;
            self.changed = true;
        }
        true
    }

    /// Update the region, returning the previous one.
    pub fn set_region(&mut self, region: &str) -> String {
        let old = std::mem::take(&mut self.tag.region);
        if old != region {
            self.tag.region = region.to_string();
            self.changed = true;
        } else {
            self.tag.region = old.clone();
        }
        old
    }
}

impl KvTxn for TagTransaction {
    fn before(&self) -> &str {
        &self.before
    }

    fn updated(&self) -> bool {
        self.changed
    }

    fn after(&self) -> (bool, String) {
        (self.changed, self.tag.encode())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
