//! Layout stateids and their sequence numbers.
//!
//! The first successful LAYOUTGET that presents a non-layout stateid
//! (open, delegation or lock) establishes a layout stateid with seqid 1.
//! Every subsequent successful LAYOUTGET or LAYOUTRETURN for the same
//! (file, client) pair bumps the seqid by exactly one. Validation is strict:
//! a stale seqid and a guessed-ahead seqid are both rejected.

use rand::thread_rng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{LayoutError, Result};
use crate::types::{ClientId, FileId};

/// The stable identity part of a stateid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateidOther(pub [u8; 12]);

impl StateidOther {
    /// Hex rendering of the identity.
    pub fn as_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for StateidOther {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// A layout stateid bound to one (file, client) lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutStateid {
    /// File the lineage belongs to
    pub file_id: FileId,
    /// Client the lineage belongs to
    pub client_id: ClientId,
    /// Sequence number, 1 on issuance
    pub seqid: u32,
    /// Stable identity
    pub other: StateidOther,
}

impl fmt::Display for LayoutStateid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.seqid, self.other)
    }
}

/// A stateid presented by a client with a layout request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresentedStateid {
    /// Open stateid
    Open(StateidOther),
    /// Delegation stateid
    Delegation(StateidOther),
    /// Byte-range lock stateid
    Lock(StateidOther),
    /// Layout stateid
    Layout(LayoutStateid),
}

impl PresentedStateid {
    /// Whether this is an open, delegation or lock stateid.
    pub fn is_anchor(&self) -> bool {
        !matches!(self, PresentedStateid::Layout(_))
    }

    /// The layout stateid, if this is one.
    pub fn as_layout(&self) -> Option<&LayoutStateid> {
        match self {
            PresentedStateid::Layout(s) => Some(s),
            _ => None,
        }
    }
}

/// Issues, advances and validates layout stateids.
pub struct LayoutStateidSequencer {
    boot_prefix: [u8; 4],
    next_lineage: AtomicU64,
}

impl LayoutStateidSequencer {
    /// Creates a sequencer with a random per-instance prefix.
    pub fn new() -> Self {
        let mut boot_prefix = [0u8; 4];
        thread_rng().fill_bytes(&mut boot_prefix);
        Self {
            boot_prefix,
            next_lineage: AtomicU64::new(1),
        }
    }

    /// Issues a fresh stateid with seqid 1 for a (file, client) pair.
    pub fn issue(&self, file_id: FileId, client_id: ClientId) -> LayoutStateid {
        let lineage = self.next_lineage.fetch_add(1, Ordering::Relaxed);
        let mut other = [0u8; 12];
        other[0..4].copy_from_slice(&self.boot_prefix);
        other[4..12].copy_from_slice(&lineage.to_be_bytes());
        LayoutStateid {
            file_id,
            client_id,
            seqid: 1,
            other: StateidOther(other),
        }
    }

    /// Returns a copy with the next seqid. Wraps from `u32::MAX` to 1; 0 is never used.
    pub fn advance(&self, existing: &LayoutStateid) -> LayoutStateid {
        let seqid = match existing.seqid.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        LayoutStateid {
            seqid,
            ..*existing
        }
    }

    /// Whether `other` was handed out by this sequencer. Forged or foreign
    /// identities and those from an earlier server instance are not.
    pub fn issued(&self, other: &StateidOther) -> bool {
        if other.0[0..4] != self.boot_prefix {
            return false;
        }
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&other.0[4..12]);
        let lineage = u64::from_be_bytes(counter);
        lineage >= 1 && lineage < self.next_lineage.load(Ordering::Relaxed)
    }

    /// Checks a presented stateid against the authoritative one.
    pub fn validate(&self, presented: &LayoutStateid, authoritative: &LayoutStateid) -> Result<()> {
        if presented.other != authoritative.other {
            return Err(LayoutError::bad_stateid(format!(
                "stateid {} does not belong to the current layout lineage",
                presented.other
            )));
        }
        if presented.seqid != authoritative.seqid {
            return Err(LayoutError::bad_stateid(format!(
                "seqid {} is not current (expected {})",
                presented.seqid, authoritative.seqid
            )));
        }
        Ok(())
    }
}

impl Default for LayoutStateidSequencer {
    fn default() -> Self {
        Self::new()
    }
}
