use std::cmp::Ordering;
use std::fmt;

use crate::clock::Clock;
use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lamport timestamp used for ordering changes.
pub type Lamport = u64;

/// Number of bytes in an actor identity.
pub const ACTOR_ID_LEN: usize = 12;

/// Identity of a replica. Fixed-width bytes, compared lexicographically only to break ties.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActorId(pub [u8; ACTOR_ID_LEN]);

impl ActorId {
    pub const INITIAL: ActorId = ActorId([0u8; ACTOR_ID_LEN]);
    pub const MAX: ActorId = ActorId([0xffu8; ACTOR_ID_LEN]);

    pub fn new(bytes: [u8; ACTOR_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 24 character hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let clean = hex.trim_start_matches("0x");
        if clean.len() != ACTOR_ID_LEN * 2 {
            return Err(Error::InvalidOperation(format!(
                "actor id must be {} hex characters, got {}",
                ACTOR_ID_LEN * 2,
                clean.len()
            )));
        }
        let mut bytes = [0u8; ACTOR_ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&clean[i * 2..i * 2 + 2], 16)
                .map_err(|e| Error::InvalidOperation(format!("actor id: {e}")))?;
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Causal stamp of an element or operation.
///
/// Ordered by `lamport`, then `actor`, then `delimiter`. The delimiter separates tickets issued
/// by the same change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TimeTicket {
    pub lamport: Lamport,
    pub delimiter: u32,
    pub actor: ActorId,
}

impl TimeTicket {
    /// Lowest possible ticket; the creation ticket of the document root.
    pub const INITIAL: TimeTicket = TimeTicket {
        lamport: 0,
        delimiter: 0,
        actor: ActorId::INITIAL,
    };

    /// Highest possible ticket; collecting with it reclaims every tombstone.
    pub const MAX: TimeTicket = TimeTicket {
        lamport: Lamport::MAX,
        delimiter: u32::MAX,
        actor: ActorId::MAX,
    };

    pub fn new(lamport: Lamport, delimiter: u32, actor: ActorId) -> Self {
        Self {
            lamport,
            delimiter,
            actor,
        }
    }

    pub fn after(&self, other: &TimeTicket) -> bool {
        self > other
    }

    /// The same ticket with a different delimiter.
    pub fn with_delimiter(&self, delimiter: u32) -> Self {
        Self {
            delimiter,
            ..*self
        }
    }

    pub fn to_id_string(&self) -> String {
        format!("{}:{}:{}", self.lamport, self.actor, self.delimiter)
    }
}

impl Ord for TimeTicket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.actor.cmp(&other.actor))
            .then_with(|| self.delimiter.cmp(&other.delimiter))
    }
}

impl PartialOrd for TimeTicket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TimeTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_id_string())
    }
}

/// Identifier of a change.
///
/// `server_seq` is assigned once the change has been acknowledged by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeId {
    pub client_seq: u64,
    pub server_seq: Option<u64>,
    pub lamport: Lamport,
    pub actor: ActorId,
}

impl ChangeId {
    pub fn initial(actor: ActorId) -> Self {
        Self {
            client_seq: 0,
            server_seq: None,
            lamport: 0,
            actor,
        }
    }

    /// Id of the next local change. The lamport comes from the document clock.
    pub fn next<C: Clock>(&self, clock: &mut C) -> Result<Self> {
        let client_seq = self.client_seq.checked_add(1).ok_or(Error::ClockOverflow)?;
        Ok(Self {
            client_seq,
            server_seq: None,
            lamport: clock.tick()?,
            actor: self.actor,
        })
    }

    pub fn create_time_ticket(&self, delimiter: u32) -> TimeTicket {
        TimeTicket::new(self.lamport, delimiter, self.actor)
    }

    pub fn with_actor(&self, actor: ActorId) -> Self {
        Self {
            actor,
            ..self.clone()
        }
    }
}

/// Sync position between a client and the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Checkpoint {
    pub server_seq: u64,
    pub client_seq: u64,
}

impl Checkpoint {
    pub fn new(server_seq: u64, client_seq: u64) -> Self {
        Self {
            server_seq,
            client_seq,
        }
    }

    /// Merge with another checkpoint, keeping the furthest position of each sequence.
    pub fn forward(&self, other: &Checkpoint) -> Checkpoint {
        Checkpoint {
            server_seq: self.server_seq.max(other.server_seq),
            client_seq: self.client_seq.max(other.client_seq),
        }
    }
}
