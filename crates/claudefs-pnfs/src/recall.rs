//! Layout recall coordination.
//!
//! The coordinator decides when outstanding layouts must be taken back from
//! clients: conflicting requests, device failures reported by other clients,
//! and clients that keep punching holes in their own layouts. It issues
//! recalls over a callback channel, tracks them until the client returns the
//! range, and hands expired recalls back to the manager for revocation.
//!
//! The coordinator only reads the layout store. Every segment mutation
//! (revocation, forgetting) is performed by the manager.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::layout::IoReport;
use crate::stateid::LayoutStateid;
use crate::store::LayoutStore;
use crate::types::{ByteRange, ClientId, DeviceId, FileId, IoMode};

/// Why a layout is being recalled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecallReason {
    /// A client reported a device or path failure
    IoError,
    /// Another client requested a conflicting layout
    ConflictingAccess,
    /// Server policy (misbehaving client)
    Administrative,
}

/// An outstanding recall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecall {
    /// Recall id, unique per coordinator
    pub id: u64,
    /// Client asked to return the layout
    pub target_client_id: ClientId,
    /// File whose layout is recalled
    pub file_id: FileId,
    /// Layout stateid current when the recall was issued
    pub stateid: LayoutStateid,
    /// Why
    pub reason: RecallReason,
    /// Range to return
    pub affected_range: ByteRange,
    /// Modes to return
    pub io_mode: IoMode,
    /// Whether the client accepted the recall
    pub acknowledged: bool,
    /// When the recall was issued
    pub created_at: Instant,
    /// When the recall times out
    pub deadline: Instant,
}

/// Outbound callback traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecallEvent {
    /// CB_LAYOUTRECALL to send
    RecallIssued {
        /// Target client
        client_id: ClientId,
        /// Recalled file
        file_id: FileId,
        /// Recalled stateid
        stateid: LayoutStateid,
        /// Modes to return
        io_mode: IoMode,
        /// Range to return
        range: ByteRange,
        /// Why
        reason: RecallReason,
    },
    /// The client ignored a recall and its layout was revoked
    LayoutRevoked {
        /// Offending client
        client_id: ClientId,
        /// File whose layout was revoked
        file_id: FileId,
        /// Revoked stateid
        stateid: LayoutStateid,
    },
}

/// Client reply to a recall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecallReply {
    /// The client will return the layout
    Accepted,
    /// The client holds no matching layout
    NoMatchingLayout,
}

/// Inbound callback reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallAcknowledged {
    /// Replying client
    pub client_id: ClientId,
    /// Stateid named in the recall
    pub stateid: LayoutStateid,
    /// Reply
    pub reply: RecallReply,
}

/// Timing and threshold settings of the coordinator
#[derive(Debug, Clone, Copy)]
pub struct RecallPolicy {
    /// Time a client has to honor a recall
    pub recall_timeout: Duration,
    /// Time a blacklisted client is refused layouts
    pub blacklist_duration: Duration,
    /// Strikes tolerated before blacklisting
    pub misbehavior_threshold: u32,
}

impl Default for RecallPolicy {
    fn default() -> Self {
        Self {
            recall_timeout: Duration::from_secs(30),
            blacklist_duration: Duration::from_secs(60),
            misbehavior_threshold: 7,
        }
    }
}

/// Drives layout recalls.
pub struct RecallCoordinator {
    store: Arc<LayoutStore>,
    policy: RecallPolicy,
    pending: Mutex<HashMap<ClientId, Vec<PendingRecall>>>,
    strikes: DashMap<ClientId, u32>,
    blacklist: DashMap<ClientId, Instant>,
    events: mpsc::UnboundedSender<RecallEvent>,
    next_id: AtomicU64,
}

impl RecallCoordinator {
    /// Creates a coordinator and the receiving end of its callback channel.
    pub fn new(
        store: Arc<LayoutStore>,
        policy: RecallPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<RecallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            store,
            policy,
            pending: Mutex::new(HashMap::new()),
            strikes: DashMap::new(),
            blacklist: DashMap::new(),
            events: tx,
            next_id: AtomicU64::new(1),
        };
        (coordinator, rx)
    }

    fn emit(&self, event: RecallEvent) {
        if self.events.send(event).is_err() {
            debug!("recall event dropped, callback channel closed");
        }
    }

    // Creates a recall unless an outstanding one already covers it.
    fn issue(
        &self,
        client_id: ClientId,
        file_id: FileId,
        range: ByteRange,
        io_mode: IoMode,
        reason: RecallReason,
        now: Instant,
    ) -> Result<bool> {
        let Some(stateid) = self.store.current_stateid(file_id, client_id)? else {
            return Ok(false);
        };

        let recall = {
            let mut pending = self.pending.lock()?;
            let recalls = pending.entry(client_id).or_default();
            let covered = recalls.iter().any(|r| {
                r.file_id == file_id
                    && r.affected_range.contains(&range)
                    && r.io_mode.matches(io_mode)
            });
            if covered {
                return Ok(false);
            }
            let recall = PendingRecall {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                target_client_id: client_id,
                file_id,
                stateid,
                reason,
                affected_range: range,
                io_mode,
                acknowledged: false,
                created_at: now,
                deadline: now + self.policy.recall_timeout,
            };
            recalls.push(recall.clone());
            recall
        };

        info!(
            client = %client_id,
            file = %file_id,
            %range,
            ?reason,
            recall = recall.id,
            "layout recall issued"
        );
        self.emit(RecallEvent::RecallIssued {
            client_id,
            file_id,
            stateid,
            io_mode,
            range,
            reason,
        });
        Ok(true)
    }

    /// Recalls conflicting segments from every other holder. Returns the
    /// number of recalls created.
    pub fn on_conflict(
        &self,
        file_id: FileId,
        triggering_client: ClientId,
        io_mode: IoMode,
        range: ByteRange,
        now: Instant,
    ) -> Result<usize> {
        // A writer needs every overlapping segment back; a reader only the writers.
        let recall_mode = match io_mode {
            IoMode::Read => IoMode::ReadWrite,
            _ => IoMode::Any,
        };
        let mut issued = 0;
        for holder in self
            .store
            .conflicting_holders(file_id, triggering_client, io_mode, &range)?
        {
            if self.issue(
                holder,
                file_id,
                range,
                recall_mode,
                RecallReason::ConflictingAccess,
                now,
            )? {
                issued += 1;
            }
        }
        Ok(issued)
    }

    /// Devices made unusable by the errors in a report. Errors that name no
    /// device implicate every device of the reporter's layout on the file.
    pub fn fatal_devices(
        &self,
        file_id: FileId,
        reporting_client: ClientId,
        report: &IoReport,
    ) -> Result<Vec<DeviceId>> {
        let mut devices = BTreeSet::new();
        for err in &report.errors {
            if !err.code.is_device_fatal() {
                debug!(
                    file = %file_id,
                    client = %reporting_client,
                    code = ?err.code,
                    "non-fatal I/O error reported"
                );
                continue;
            }
            match err.device_id {
                Some(d) => {
                    devices.insert(d);
                }
                None => {
                    for seg in self.store.segments_of(file_id, reporting_client)? {
                        devices.extend(seg.body.device_ids());
                    }
                }
            }
        }
        Ok(devices.into_iter().collect())
    }

    /// Recalls every other client's segments that reference the given
    /// devices, on any file. Returns the number of recalls created.
    pub fn recall_device_users(
        &self,
        reporting_client: ClientId,
        devices: &[DeviceId],
        now: Instant,
    ) -> Result<usize> {
        let mut issued = 0;
        for device_id in devices {
            warn!(device = %device_id, client = %reporting_client, "device reported failing");
            for seg in self.store.segments_referencing(device_id)? {
                if seg.client_id == reporting_client {
                    continue;
                }
                if self.issue(
                    seg.client_id,
                    seg.file_id,
                    seg.range,
                    seg.io_mode,
                    RecallReason::IoError,
                    now,
                )? {
                    issued += 1;
                }
            }
        }
        Ok(issued)
    }

    /// Handles an I/O error report attached to a return or commit.
    pub fn on_io_error_report(
        &self,
        file_id: FileId,
        reporting_client: ClientId,
        report: &IoReport,
        now: Instant,
    ) -> Result<usize> {
        let devices = self.fatal_devices(file_id, reporting_client, report)?;
        self.recall_device_users(reporting_client, &devices, now)
    }

    /// Counts a strike against a client and recalls all of its layouts.
    /// Returns true when the client was blacklisted.
    ///
    /// An offence is a file return strictly inside one held segment, such as
    /// returning [4096, 12288) of a whole-file layout, which would punch a
    /// hole in it. Returns that trim a segment's head or tail, or cover it
    /// completely, are well-formed and reset the count instead.
    pub fn on_misbehaving_client(&self, client_id: ClientId, now: Instant) -> Result<bool> {
        let strikes = {
            let mut entry = self.strikes.entry(client_id).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(client = %client_id, strikes, "client returned a hole in its own layout");

        for file_id in self.store.files_of_client(client_id)? {
            self.issue(
                client_id,
                file_id,
                ByteRange::whole_file(),
                IoMode::Any,
                RecallReason::Administrative,
                now,
            )?;
        }

        if strikes > self.policy.misbehavior_threshold {
            self.strikes.remove(&client_id);
            self.blacklist_client(client_id, now);
            return Ok(true);
        }
        Ok(false)
    }

    /// Clears a client's strike count after a well-formed return.
    pub fn reset_strikes(&self, client_id: ClientId) {
        self.strikes.remove(&client_id);
    }

    /// Current strike count.
    pub fn strikes(&self, client_id: ClientId) -> u32 {
        self.strikes.get(&client_id).map_or(0, |s| *s)
    }

    /// Refuses layouts to a client for the configured duration.
    pub fn blacklist_client(&self, client_id: ClientId, now: Instant) {
        let until = now + self.policy.blacklist_duration;
        self.blacklist.insert(client_id, until);
        warn!(
            client = %client_id,
            duration_ms = self.policy.blacklist_duration.as_millis() as u64,
            "client blacklisted"
        );
    }

    /// Whether a client is blacklisted at `now`. Expired entries are dropped.
    pub fn is_blacklisted(&self, client_id: ClientId, now: Instant) -> bool {
        let until = match self.blacklist.get(&client_id) {
            Some(until) => *until,
            None => return false,
        };
        if now < until {
            return true;
        }
        self.blacklist.remove_if(&client_id, |_, u| *u <= now);
        false
    }

    /// Drops expired blacklist entries. Returns how many were dropped.
    pub fn prune_blacklist(&self, now: Instant) -> usize {
        let before = self.blacklist.len();
        self.blacklist.retain(|_, until| *until > now);
        before - self.blacklist.len()
    }

    /// Whether a recall of `client_id` overlapping `range` on `file_id` is
    /// still outstanding.
    pub fn outstanding(&self, client_id: ClientId, file_id: FileId, range: &ByteRange) -> Result<bool> {
        let pending = self.pending.lock()?;
        Ok(pending.get(&client_id).map_or(false, |recalls| {
            recalls
                .iter()
                .any(|r| r.file_id == file_id && r.affected_range.overlaps(range))
        }))
    }

    /// All outstanding recalls of a client.
    pub fn pending_for(&self, client_id: ClientId) -> Result<Vec<PendingRecall>> {
        let pending = self.pending.lock()?;
        Ok(pending.get(&client_id).cloned().unwrap_or_default())
    }

    /// Number of outstanding recalls.
    pub fn pending_count(&self) -> Result<usize> {
        let pending = self.pending.lock()?;
        Ok(pending.values().map(Vec::len).sum())
    }

    /// Resolves recalls the client has satisfied by returning layouts on
    /// `files`. Returns the number resolved.
    pub fn on_return(&self, client_id: ClientId, files: &[FileId]) -> Result<usize> {
        let candidates: Vec<PendingRecall> = {
            let pending = self.pending.lock()?;
            match pending.get(&client_id) {
                Some(recalls) => recalls
                    .iter()
                    .filter(|r| files.contains(&r.file_id))
                    .cloned()
                    .collect(),
                None => return Ok(0),
            }
        };

        let mut satisfied = Vec::new();
        for r in candidates {
            if !self
                .store
                .holds(r.file_id, client_id, &r.affected_range, r.io_mode)?
            {
                satisfied.push(r.id);
            }
        }
        if satisfied.is_empty() {
            return Ok(0);
        }

        let mut pending = self.pending.lock()?;
        if let Some(recalls) = pending.get_mut(&client_id) {
            recalls.retain(|r| !satisfied.contains(&r.id));
            if recalls.is_empty() {
                pending.remove(&client_id);
            }
        }
        info!(client = %client_id, resolved = satisfied.len(), "layout recalls resolved");
        Ok(satisfied.len())
    }

    /// Records a client's reply to a recall. Recalls answered with
    /// `NoMatchingLayout` are removed and returned so the manager can forget
    /// the recalled segments.
    pub fn acknowledged(&self, ack: &RecallAcknowledged) -> Result<Vec<PendingRecall>> {
        let mut pending = self.pending.lock()?;
        let Some(recalls) = pending.get_mut(&ack.client_id) else {
            debug!(client = %ack.client_id, "acknowledgement for unknown recall");
            return Ok(Vec::new());
        };

        let mut released = Vec::new();
        match ack.reply {
            RecallReply::Accepted => {
                for r in recalls.iter_mut().filter(|r| r.stateid.other == ack.stateid.other) {
                    r.acknowledged = true;
                }
            }
            RecallReply::NoMatchingLayout => {
                recalls.retain(|r| {
                    if r.stateid.other == ack.stateid.other {
                        released.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
                if recalls.is_empty() {
                    pending.remove(&ack.client_id);
                }
            }
        }
        debug!(client = %ack.client_id, reply = ?ack.reply, released = released.len(), "recall acknowledged");
        Ok(released)
    }

    /// Removes and returns recalls whose deadline passed.
    pub fn take_expired(&self, now: Instant) -> Result<Vec<PendingRecall>> {
        let mut pending = self.pending.lock()?;
        let mut expired = Vec::new();
        pending.retain(|_, recalls| {
            recalls.retain(|r| {
                if r.deadline <= now {
                    expired.push(r.clone());
                    false
                } else {
                    true
                }
            });
            !recalls.is_empty()
        });
        Ok(expired)
    }

    /// Drops every outstanding recall of a client on a file.
    pub fn discard(&self, client_id: ClientId, file_id: FileId) -> Result<usize> {
        let mut pending = self.pending.lock()?;
        let Some(recalls) = pending.get_mut(&client_id) else {
            return Ok(0);
        };
        let before = recalls.len();
        recalls.retain(|r| r.file_id != file_id);
        let dropped = before - recalls.len();
        if recalls.is_empty() {
            pending.remove(&client_id);
        }
        Ok(dropped)
    }

    /// Announces a revocation on the callback channel and blacklists the client.
    pub fn revoked(&self, recall: &PendingRecall, stateid: LayoutStateid, now: Instant) {
        self.emit(RecallEvent::LayoutRevoked {
            client_id: recall.target_client_id,
            file_id: recall.file_id,
            stateid,
        });
        self.blacklist_client(recall.target_client_id, now);
    }
}
