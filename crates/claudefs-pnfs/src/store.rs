//! Authoritative record of outstanding layout segments.
//!
//! State is kept per file, and within a file per client. Each (file, client)
//! pair has its own mutex, which is the single serialization point for that
//! pair's stateid lineage. Each file also publishes a read-mostly view of all
//! clients' segments, used for cross-client conflict detection and for the
//! recall coordinator's queries.
//!
//! A pair is unlinked as soon as it holds no live lineage, and a file as soon
//! as it has no pairs. Retired stateids stay recognizable afterwards because
//! every lineage identity comes from the store's own sequencer.
//!
//! Lock order is always device gate, then pair mutex, then file view. No code
//! path takes a pair mutex while holding a view lock or a map guard.

use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::device::{DeviceEntry, DeviceRegistry};
use crate::error::{LayoutError, Result};
use crate::layout::LayoutBody;
use crate::stateid::{LayoutStateid, LayoutStateidSequencer, PresentedStateid, StateidOther};
use crate::types::{ByteRange, ClientId, DeviceId, FileId, IoMode};

/// A contiguous range of a file held by one client in one I/O mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSegment {
    /// File the segment belongs to
    pub file_id: FileId,
    /// Holding client
    pub client_id: ClientId,
    /// READ or READ_WRITE
    pub io_mode: IoMode,
    /// Covered byte range
    pub range: ByteRange,
    /// Placement of the data
    pub body: LayoutBody,
    /// Whether the segment is dropped when the client closes the file
    pub return_on_close: bool,
}

impl LayoutSegment {
    fn mergeable(&self, other: &LayoutSegment) -> bool {
        self.io_mode == other.io_mode
            && self.return_on_close == other.return_on_close
            && self.body == other.body
    }

    /// Whether the segment references a device.
    pub fn references(&self, device_id: &DeviceId) -> bool {
        self.body.references(device_id)
    }
}

/// Lifecycle state of a live lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageState {
    /// Accepting gets, returns and commits
    Active,
    /// Closed by return-on-close; one final return retires it
    Closed,
}

#[derive(Debug)]
struct Lineage {
    stateid: LayoutStateid,
    state: LineageState,
    segments: Vec<LayoutSegment>,
}

#[derive(Debug, Default)]
struct PairState {
    lineage: Option<Lineage>,
    // Set when the pair is unlinked from its file; a stale handle must be looked up again.
    detached: bool,
}

impl PairState {
    fn segments(&self) -> &[LayoutSegment] {
        self.lineage.as_ref().map_or(&[], |l| &l.segments)
    }
}

type PairHandle = Arc<Mutex<PairState>>;

struct FileEntry {
    pairs: DashMap<ClientId, PairHandle>,
    view: RwLock<Vec<LayoutSegment>>,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            pairs: DashMap::new(),
            view: RwLock::new(Vec::new()),
        }
    }

    /// Replaces a client's published segments. Called with the pair mutex held.
    fn publish(&self, client_id: ClientId, segments: &[LayoutSegment]) -> Result<()> {
        let mut view = self.view.write()?;
        view.retain(|s| s.client_id != client_id);
        view.extend(segments.iter().cloned());
        Ok(())
    }
}

/// A LAYOUTGET as seen by the store.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    /// Target file
    pub file_id: FileId,
    /// Requesting client
    pub client_id: ClientId,
    /// Requested mode
    pub io_mode: IoMode,
    /// Requested range
    pub range: ByteRange,
    /// Stateid presented with the request
    pub stateid: PresentedStateid,
    /// Whether the granted segment is return-on-close
    pub return_on_close: bool,
}

/// A successful grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutGrant {
    /// Current layout stateid after the grant
    pub stateid: LayoutStateid,
    /// The client's segments covering the requested range in the requested mode
    pub segments: Vec<LayoutSegment>,
}

/// Result of a LAYOUTGET attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Layout granted
    Granted(LayoutGrant),
    /// Other clients hold conflicting segments; nothing changed
    Conflict {
        /// Clients to recall from
        holders: Vec<ClientId>,
    },
}

/// Which layouts a LAYOUTRETURN covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnScope {
    /// A range of one file, under its current layout stateid
    File {
        /// File being returned
        file_id: FileId,
        /// Returned range
        range: ByteRange,
        /// Current layout stateid
        stateid: LayoutStateid,
    },
    /// Every layout the client holds on files of a filesystem
    Fsid(u64),
    /// Every layout the client holds
    All,
}

/// Result of a LAYOUTRETURN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnOutcome {
    /// New stateid when segments remain; None when the lineage was retired
    pub stateid: Option<LayoutStateid>,
    /// Files whose layouts changed
    pub files: Vec<FileId>,
    /// The returned range lay strictly inside one held segment
    pub punched_hole: bool,
}

/// Authoritative layout state for all files.
pub struct LayoutStore {
    files: DashMap<FileId, Arc<FileEntry>>,
    sequencer: LayoutStateidSequencer,
    registry: Arc<DeviceRegistry>,
    // Held shared by grants and exclusively while a device is unregistered.
    device_gate: RwLock<()>,
}

impl LayoutStore {
    /// Creates an empty store validating layouts against `registry`.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            files: DashMap::new(),
            sequencer: LayoutStateidSequencer::new(),
            registry,
            device_gate: RwLock::new(()),
        }
    }

    fn existing_file(&self, file_id: FileId) -> Option<Arc<FileEntry>> {
        self.files.get(&file_id).map(|e| e.value().clone())
    }

    fn entries(&self) -> Vec<(FileId, Arc<FileEntry>)> {
        self.files
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // Finds the state of a (file, client) pair, creating it when `create` is set.
    fn lookup(
        &self,
        file_id: FileId,
        client_id: ClientId,
        create: bool,
    ) -> Option<(Arc<FileEntry>, PairHandle)> {
        if create {
            // The file's shard stays locked until the pair is linked, so pruning
            // cannot drop the file in between.
            let slot = self
                .files
                .entry(file_id)
                .or_insert_with(|| Arc::new(FileEntry::new()));
            let entry = slot.value().clone();
            let pair = entry.pairs.entry(client_id).or_default().value().clone();
            drop(slot);
            Some((entry, pair))
        } else {
            let entry = self.existing_file(file_id)?;
            let pair = entry.pairs.get(&client_id).map(|p| p.value().clone())?;
            Some((entry, pair))
        }
    }

    // Runs `f` under the pair mutex, then prunes the pair if it was left
    // without a lineage. None when the pair does not exist and `create` is unset.
    fn with_pair<T, F>(&self, file_id: FileId, client_id: ClientId, create: bool, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&FileEntry, &mut PairState) -> Result<T>,
    {
        let mut f = Some(f);
        loop {
            let Some((entry, pair)) = self.lookup(file_id, client_id, create) else {
                return Ok(None);
            };
            let mut state = pair.lock()?;
            if state.detached {
                continue;
            }
            let op = f
                .take()
                .ok_or_else(|| LayoutError::internal("pair operation ran twice"))?;
            let out = op(&entry, &mut *state);
            self.prune(file_id, client_id, &entry, &pair, &mut *state);
            return out.map(Some);
        }
    }

    // Unlinks a pair without a live lineage, and its file once no pairs remain.
    // Called with the pair mutex held.
    fn prune(
        &self,
        file_id: FileId,
        client_id: ClientId,
        entry: &Arc<FileEntry>,
        pair: &PairHandle,
        state: &mut PairState,
    ) {
        if state.lineage.is_some() || state.detached {
            return;
        }
        state.detached = true;
        entry.pairs.remove_if(&client_id, |_, p| Arc::ptr_eq(p, pair));
        let released = self
            .files
            .remove_if(&file_id, |_, e| Arc::ptr_eq(e, entry) && e.pairs.is_empty());
        if released.is_some() {
            debug!(file = %file_id, "file layout state released");
        }
    }

    // Every lineage identity comes from this store's sequencer, so one it
    // issued that is not the pair's live lineage has been retired.
    fn is_retired(&self, state: Option<&PairState>, other: &StateidOther) -> bool {
        let live = state.and_then(|s| s.lineage.as_ref()).map(|l| l.stateid.other);
        live != Some(*other) && self.sequencer.issued(other)
    }

    /// Grants a layout segment, or reports the clients whose segments conflict.
    pub fn get_layout(&self, req: &SegmentRequest, body: LayoutBody) -> Result<GrantOutcome> {
        if req.io_mode == IoMode::Any {
            return Err(LayoutError::invalid_argument("LAYOUTGET with iomode ANY"));
        }
        if req.range.is_empty() {
            return Err(LayoutError::invalid_argument("zero-length layout request"));
        }
        if let PresentedStateid::Layout(presented) = &req.stateid {
            check_owner(presented, req.file_id, req.client_id)?;
        }

        let _gate = self.device_gate.read()?;
        body.validate(&self.registry)?;

        // Only an open, lock or delegation stateid may create pair state.
        let create = req.stateid.is_anchor();
        let granted = self.with_pair(req.file_id, req.client_id, create, |entry, state| {
            self.grant(entry, state, req, body)
        })?;
        match (granted, req.stateid.as_layout()) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(presented)) if self.sequencer.issued(&presented.other) => {
                warn!(file = %req.file_id, client = %req.client_id, stateid = %presented, "retired stateid presented");
                Err(LayoutError::bad_stateid(format!(
                    "stateid {} was retired",
                    presented.other
                )))
            }
            (None, _) => Err(LayoutError::bad_stateid(
                "no layout is held; present an open, lock or delegation stateid",
            )),
        }
    }

    fn grant(
        &self,
        entry: &FileEntry,
        state: &mut PairState,
        req: &SegmentRequest,
        body: LayoutBody,
    ) -> Result<GrantOutcome> {
        let (stateid, fresh) = self.admit(state, req)?;

        let mut view = entry.view.write()?;
        let holders = conflicting(&view, req.client_id, req.io_mode, &req.range);
        if !holders.is_empty() {
            debug!(
                file = %req.file_id,
                client = %req.client_id,
                range = %req.range,
                holders = holders.len(),
                "layout request conflicts with other holders"
            );
            return Ok(GrantOutcome::Conflict { holders });
        }

        if fresh {
            if let Some(old) = state.lineage.take() {
                debug!(file = %req.file_id, client = %req.client_id, old = %old.stateid, "closed lineage replaced");
            }
            state.lineage = Some(Lineage {
                stateid,
                state: LineageState::Active,
                segments: Vec::new(),
            });
        }

        let lineage = state
            .lineage
            .as_mut()
            .ok_or_else(|| LayoutError::internal("lineage vanished under pair lock"))?;
        lineage.stateid = stateid;
        insert_coalesced(
            &mut lineage.segments,
            LayoutSegment {
                file_id: req.file_id,
                client_id: req.client_id,
                io_mode: req.io_mode,
                range: req.range,
                body,
                return_on_close: req.return_on_close,
            },
        );
        let segments: Vec<LayoutSegment> = lineage
            .segments
            .iter()
            .filter(|s| s.io_mode == req.io_mode && s.range.overlaps(&req.range))
            .cloned()
            .collect();

        view.retain(|s| s.client_id != req.client_id);
        view.extend(lineage.segments.iter().cloned());
        drop(view);

        info!(
            file = %req.file_id,
            client = %req.client_id,
            io_mode = ?req.io_mode,
            range = %req.range,
            stateid = %stateid,
            "layout granted"
        );
        Ok(GrantOutcome::Granted(LayoutGrant { stateid, segments }))
    }

    // Decides which stateid a grant would carry. Returns the stateid and
    // whether it starts a new lineage.
    fn admit(&self, state: &PairState, req: &SegmentRequest) -> Result<(LayoutStateid, bool)> {
        match &req.stateid {
            PresentedStateid::Layout(presented) => {
                if self.is_retired(Some(state), &presented.other) {
                    warn!(file = %req.file_id, client = %req.client_id, stateid = %presented, "retired stateid presented");
                    return Err(LayoutError::bad_stateid(format!(
                        "stateid {} was retired",
                        presented.other
                    )));
                }
                let lineage = state.lineage.as_ref().ok_or_else(|| {
                    LayoutError::bad_stateid("no layout is held; present an open, lock or delegation stateid")
                })?;
                if lineage.state == LineageState::Closed {
                    return Err(LayoutError::bad_stateid("layout was closed by return-on-close"));
                }
                if let Err(e) = self.sequencer.validate(presented, &lineage.stateid) {
                    warn!(file = %req.file_id, client = %req.client_id, stateid = %presented, "stale layout stateid");
                    return Err(e);
                }
                Ok((self.sequencer.advance(&lineage.stateid), false))
            }
            _ => match &state.lineage {
                Some(l) if l.state == LineageState::Active => Err(LayoutError::bad_stateid(
                    "a layout stateid must be presented while a layout is held",
                )),
                _ => Ok((self.sequencer.issue(req.file_id, req.client_id), true)),
            },
        }
    }

    /// Returns layouts. The file form validates the stateid; the wildcard
    /// forms retire every lineage of the client on matching files.
    pub fn return_layout(
        &self,
        client_id: ClientId,
        scope: &ReturnScope,
        io_mode: IoMode,
    ) -> Result<ReturnOutcome> {
        match scope {
            ReturnScope::File {
                file_id,
                range,
                stateid,
            } => self.return_file(client_id, *file_id, *range, stateid, io_mode),
            ReturnScope::Fsid(fsid) => self.return_bulk(client_id, |f| f.fsid == *fsid),
            ReturnScope::All => self.return_bulk(client_id, |_| true),
        }
    }

    fn return_file(
        &self,
        client_id: ClientId,
        file_id: FileId,
        range: ByteRange,
        stateid: &LayoutStateid,
        io_mode: IoMode,
    ) -> Result<ReturnOutcome> {
        check_owner(stateid, file_id, client_id)?;
        let returned = self.with_pair(file_id, client_id, false, |entry, state| {
            if self.is_retired(Some(state), &stateid.other) {
                warn!(file = %file_id, client = %client_id, stateid = %stateid, "return of retired stateid");
                return Err(LayoutError::bad_stateid(format!(
                    "stateid {} was already returned",
                    stateid.other
                )));
            }
            let lineage = state
                .lineage
                .as_mut()
                .ok_or_else(|| LayoutError::bad_stateid("no layout is held"))?;
            if let Err(e) = self.sequencer.validate(stateid, &lineage.stateid) {
                warn!(file = %file_id, client = %client_id, stateid = %stateid, "stale stateid on return");
                return Err(e);
            }

            let closed = lineage.state == LineageState::Closed;
            let punched_hole = !closed
                && lineage
                    .segments
                    .iter()
                    .any(|s| io_mode.matches(s.io_mode) && s.range.is_interior(&range));
            lineage.segments = carve(std::mem::take(&mut lineage.segments), &range, io_mode);

            let new_stateid = if closed || lineage.segments.is_empty() {
                None
            } else {
                lineage.stateid = self.sequencer.advance(&lineage.stateid);
                Some(lineage.stateid)
            };
            if new_stateid.is_none() {
                state.lineage = None;
            }
            entry.publish(client_id, state.segments())?;

            match new_stateid {
                Some(s) => info!(file = %file_id, client = %client_id, %range, stateid = %s, "layout partially returned"),
                None => info!(file = %file_id, client = %client_id, %range, "layout returned, lineage retired"),
            }
            Ok(ReturnOutcome {
                stateid: new_stateid,
                files: vec![file_id],
                punched_hole,
            })
        })?;

        returned.ok_or_else(|| {
            if self.sequencer.issued(&stateid.other) {
                warn!(file = %file_id, client = %client_id, stateid = %stateid, "return of retired stateid");
                LayoutError::bad_stateid(format!("stateid {} was already returned", stateid.other))
            } else {
                LayoutError::bad_stateid("no layout state for client")
            }
        })
    }

    fn return_bulk<F>(&self, client_id: ClientId, matches: F) -> Result<ReturnOutcome>
    where
        F: Fn(&FileId) -> bool,
    {
        let mut files = Vec::new();
        for (file_id, _) in self.entries() {
            if !matches(&file_id) {
                continue;
            }
            let retired = self.with_pair(file_id, client_id, false, |entry, state| {
                if state.lineage.take().is_none() {
                    return Ok(false);
                }
                entry.publish(client_id, &[])?;
                Ok(true)
            })?;
            if retired == Some(true) {
                files.push(file_id);
            }
        }
        files.sort();
        info!(client = %client_id, files = files.len(), "bulk layout return");
        Ok(ReturnOutcome {
            stateid: None,
            files,
            punched_hole: false,
        })
    }

    /// Validates a LAYOUTCOMMIT against the client's current layout.
    pub fn commit_layout(
        &self,
        file_id: FileId,
        client_id: ClientId,
        stateid: &LayoutStateid,
        range: ByteRange,
    ) -> Result<()> {
        check_owner(stateid, file_id, client_id)?;
        let checked = self.with_pair(file_id, client_id, false, |_, state| {
            if self.is_retired(Some(state), &stateid.other) {
                return Err(LayoutError::bad_layout(format!(
                    "layout {} was already returned",
                    stateid.other
                )));
            }
            let lineage = state
                .lineage
                .as_ref()
                .ok_or_else(|| LayoutError::bad_stateid("no layout is held"))?;
            if lineage.state == LineageState::Closed {
                return Err(LayoutError::bad_stateid("layout was closed by return-on-close"));
            }
            self.sequencer.validate(stateid, &lineage.stateid)?;

            if !range.is_empty() {
                let writable: Vec<ByteRange> = lineage
                    .segments
                    .iter()
                    .filter(|s| s.io_mode == IoMode::ReadWrite)
                    .map(|s| s.range)
                    .collect();
                if !range.covered_by(&writable) {
                    return Err(LayoutError::bad_layout(format!(
                        "commit range {} is not covered by a read-write layout",
                        range
                    )));
                }
            }
            Ok(())
        })?;

        match checked {
            Some(()) => {
                debug!(file = %file_id, client = %client_id, %range, "commit accepted");
                Ok(())
            }
            None if self.sequencer.issued(&stateid.other) => Err(LayoutError::bad_layout(format!(
                "layout {} was already returned",
                stateid.other
            ))),
            None => Err(LayoutError::bad_stateid("no layout state for client")),
        }
    }

    /// Close notification. Drops return-on-close segments and marks the
    /// lineage closed. Returns the number of segments dropped.
    pub fn close(&self, file_id: FileId, client_id: ClientId) -> Result<usize> {
        let dropped = self.with_pair(file_id, client_id, false, |entry, state| {
            let Some(lineage) = state.lineage.as_mut() else {
                return Ok(0);
            };
            if lineage.state == LineageState::Closed {
                return Ok(0);
            }

            let before = lineage.segments.len();
            lineage.segments.retain(|s| !s.return_on_close);
            let dropped = before - lineage.segments.len();
            if dropped > 0 {
                lineage.state = LineageState::Closed;
                entry.publish(client_id, state.segments())?;
                info!(file = %file_id, client = %client_id, dropped, "return-on-close segments released");
            }
            Ok(dropped)
        })?;
        Ok(dropped.unwrap_or(0))
    }

    /// Forcibly invalidates a client's layout on a file. Returns the retired stateid.
    pub fn revoke(&self, file_id: FileId, client_id: ClientId) -> Result<Option<LayoutStateid>> {
        let revoked = self.with_pair(file_id, client_id, false, |entry, state| {
            let retired = state.lineage.take().map(|l| l.stateid);
            if let Some(stateid) = retired {
                entry.publish(client_id, &[])?;
                warn!(file = %file_id, client = %client_id, %stateid, "layout revoked");
            }
            Ok(retired)
        })?;
        Ok(revoked.flatten())
    }

    /// Drops segments a client says it no longer holds, without advancing the
    /// seqid. Retires the lineage if nothing remains. Returns segments dropped.
    pub fn forget(
        &self,
        file_id: FileId,
        client_id: ClientId,
        range: ByteRange,
        io_mode: IoMode,
    ) -> Result<usize> {
        let touched = self.with_pair(file_id, client_id, false, |entry, state| {
            let Some(lineage) = state.lineage.as_mut() else {
                return Ok(0);
            };

            let touched = lineage
                .segments
                .iter()
                .filter(|s| io_mode.matches(s.io_mode) && s.range.overlaps(&range))
                .count();
            lineage.segments = carve(std::mem::take(&mut lineage.segments), &range, io_mode);
            if lineage.segments.is_empty() {
                state.lineage = None;
            }
            entry.publish(client_id, state.segments())?;
            debug!(file = %file_id, client = %client_id, %range, touched, "segments forgotten");
            Ok(touched)
        })?;
        Ok(touched.unwrap_or(0))
    }

    /// Removes a device from the registry unless an outstanding segment
    /// references it. Waits for grants in flight, and holds off new ones
    /// until the device is gone.
    pub fn unregister_device(&self, device_id: &DeviceId) -> Result<DeviceEntry> {
        let _gate = self.device_gate.write()?;
        if self.references_device(device_id)? {
            return Err(LayoutError::invalid_device(format!(
                "device {} is referenced by outstanding layouts",
                device_id
            )));
        }
        self.registry.unregister(device_id)
    }

    /// Current layout stateid of a live lineage.
    pub fn current_stateid(&self, file_id: FileId, client_id: ClientId) -> Result<Option<LayoutStateid>> {
        let stateid = self.with_pair(file_id, client_id, false, |_, state| {
            Ok(state.lineage.as_ref().map(|l| l.stateid))
        })?;
        Ok(stateid.flatten())
    }

    /// State of a live lineage.
    pub fn lineage_state(&self, file_id: FileId, client_id: ClientId) -> Result<Option<LineageState>> {
        let lineage = self.with_pair(file_id, client_id, false, |_, state| {
            Ok(state.lineage.as_ref().map(|l| l.state))
        })?;
        Ok(lineage.flatten())
    }

    /// Published segments of one client on one file.
    pub fn segments_of(&self, file_id: FileId, client_id: ClientId) -> Result<Vec<LayoutSegment>> {
        let Some(entry) = self.existing_file(file_id) else {
            return Ok(Vec::new());
        };
        let view = entry.view.read()?;
        Ok(view
            .iter()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect())
    }

    /// Whether a client still holds a segment overlapping `range` in a mode
    /// selected by `io_mode`.
    pub fn holds(
        &self,
        file_id: FileId,
        client_id: ClientId,
        range: &ByteRange,
        io_mode: IoMode,
    ) -> Result<bool> {
        let Some(entry) = self.existing_file(file_id) else {
            return Ok(false);
        };
        let view = entry.view.read()?;
        Ok(view.iter().any(|s| {
            s.client_id == client_id && io_mode.matches(s.io_mode) && s.range.overlaps(range)
        }))
    }

    /// Clients other than `client_id` whose segments conflict with the request.
    pub fn conflicting_holders(
        &self,
        file_id: FileId,
        client_id: ClientId,
        io_mode: IoMode,
        range: &ByteRange,
    ) -> Result<Vec<ClientId>> {
        let Some(entry) = self.existing_file(file_id) else {
            return Ok(Vec::new());
        };
        let view = entry.view.read()?;
        Ok(conflicting(&view, client_id, io_mode, range))
    }

    /// Files on which a client holds at least one segment.
    pub fn files_of_client(&self, client_id: ClientId) -> Result<Vec<FileId>> {
        let mut files = Vec::new();
        for (file_id, entry) in self.entries() {
            let view = entry.view.read()?;
            if view.iter().any(|s| s.client_id == client_id) {
                files.push(file_id);
            }
        }
        files.sort();
        Ok(files)
    }

    /// All outstanding segments that reference a device, on any file.
    pub fn segments_referencing(&self, device_id: &DeviceId) -> Result<Vec<LayoutSegment>> {
        let mut out = Vec::new();
        for (_, entry) in self.entries() {
            let view = entry.view.read()?;
            out.extend(view.iter().filter(|s| s.references(device_id)).cloned());
        }
        Ok(out)
    }

    /// Whether any outstanding segment references a device.
    pub fn references_device(&self, device_id: &DeviceId) -> Result<bool> {
        for (_, entry) in self.entries() {
            let view = entry.view.read()?;
            if view.iter().any(|s| s.references(device_id)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of outstanding segments across all files.
    pub fn segment_count(&self) -> Result<usize> {
        let mut n = 0;
        for (_, entry) in self.entries() {
            n += entry.view.read()?.len();
        }
        Ok(n)
    }
}

fn check_owner(stateid: &LayoutStateid, file_id: FileId, client_id: ClientId) -> Result<()> {
    if stateid.client_id != client_id {
        return Err(LayoutError::bad_stateid(format!(
            "stateid {} belongs to {}",
            stateid, stateid.client_id
        )));
    }
    if stateid.file_id != file_id {
        return Err(LayoutError::bad_stateid(format!(
            "stateid {} belongs to file {}",
            stateid, stateid.file_id
        )));
    }
    Ok(())
}


fn conflicting(
    view: &[LayoutSegment],
    client_id: ClientId,
    io_mode: IoMode,
    range: &ByteRange,
) -> Vec<ClientId> {
    let mut holders: Vec<ClientId> = view
        .iter()
        .filter(|s| {
            s.client_id != client_id && s.range.overlaps(range) && s.io_mode.conflicts_with(io_mode)
        })
        .map(|s| s.client_id)
        .collect();
    holders.sort();
    holders.dedup();
    holders
}

fn insert_coalesced(segments: &mut Vec<LayoutSegment>, mut seg: LayoutSegment) {
    loop {
        let merged = segments.iter().enumerate().find_map(|(i, s)| {
            if s.mergeable(&seg) {
                s.range.coalesce(&seg.range).map(|r| (i, r))
            } else {
                None
            }
        });
        match merged {
            Some((i, range)) => {
                segments.swap_remove(i);
                seg.range = range;
            }
            None => {
                segments.push(seg);
                break;
            }
        }
    }
    segments.sort_by_key(|s| (s.range.offset, s.io_mode as u32));
}

// Removes `range` from every segment selected by `io_mode`, splitting where needed.
fn carve(segments: Vec<LayoutSegment>, range: &ByteRange, io_mode: IoMode) -> Vec<LayoutSegment> {
    let mut out = Vec::with_capacity(segments.len() + 1);
    for seg in segments {
        if io_mode.matches(seg.io_mode) && seg.range.overlaps(range) {
            for piece in seg.range.subtract(range) {
                out.push(LayoutSegment {
                    range: piece,
                    ..seg.clone()
                });
            }
        } else {
            out.push(seg);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceTargets, NetAddr};
    use crate::layout::{Component, ObjectLayout, RaidAlgorithm, StripeMap};
    use crate::types::{AuthFlavor, LayoutType};

    const FILE: FileId = FileId { fsid: 1, ino: 100 };
    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn store() -> LayoutStore {
        let reg = Arc::new(DeviceRegistry::new());
        for n in 1..=2 {
            reg.register(
                DeviceId::from_u64(n),
                LayoutType::ObjectsV2,
                DeviceTargets::ips(vec![NetAddr::tcp("10.0.0.1.8.1")], vec![AuthFlavor::Sys]),
            )
            .unwrap();
        }
        LayoutStore::new(reg)
    }

    fn body() -> LayoutBody {
        LayoutBody::ObjectsV2(ObjectLayout {
            map: StripeMap {
                stripe_unit: 65536,
                group_width: 0,
                group_depth: 0,
                mirror_count: 0,
                raid_algorithm: RaidAlgorithm::Raid0,
            },
            components: (1..=2)
                .map(|n| Component {
                    device_id: DeviceId::from_u64(n),
                    file_handle: vec![n as u8],
                    auth_flavor: AuthFlavor::Sys,
                })
                .collect(),
        })
    }

    fn open() -> PresentedStateid {
        PresentedStateid::Open(StateidOther([9; 12]))
    }

    fn req(client: ClientId, io_mode: IoMode, range: ByteRange, stateid: PresentedStateid) -> SegmentRequest {
        SegmentRequest {
            file_id: FILE,
            client_id: client,
            io_mode,
            range,
            stateid,
            return_on_close: false,
        }
    }

    fn grant(store: &LayoutStore, r: &SegmentRequest) -> LayoutGrant {
        match store.get_layout(r, body()).unwrap() {
            GrantOutcome::Granted(g) => g,
            other => panic!("expected grant, got {:?}", other),
        }
    }

    #[test]
    fn test_first_get_issues_seqid_one() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        assert_eq!(g.stateid.seqid, 1);
        assert_eq!(g.segments.len(), 1);
        assert_eq!(g.segments[0].range, ByteRange::whole_file());
    }

    #[test]
    fn test_layout_stateid_without_lineage_fails() {
        let store = store();
        let seq = LayoutStateidSequencer::new();
        let bogus = PresentedStateid::Layout(seq.issue(FILE, A));
        let result = store.get_layout(&req(A, IoMode::Read, ByteRange::whole_file(), bogus), body());
        assert!(matches!(result, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_anchor_while_live_fails() {
        let store = store();
        grant(&store, &req(A, IoMode::Read, ByteRange::new(0, 4096), open()));
        let result = store.get_layout(&req(A, IoMode::Read, ByteRange::new(4096, 4096), open()), body());
        assert!(matches!(result, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_iomode_any_and_zero_length_rejected() {
        let store = store();
        let any = store.get_layout(&req(A, IoMode::Any, ByteRange::whole_file(), open()), body());
        assert!(matches!(any, Err(LayoutError::InvalidArgument { .. })));
        let empty = store.get_layout(&req(A, IoMode::Read, ByteRange::new(0, 0), open()), body());
        assert!(matches!(empty, Err(LayoutError::InvalidArgument { .. })));
    }

    #[test]
    fn test_adjacent_gets_coalesce() {
        let store = store();
        let g1 = grant(&store, &req(A, IoMode::ReadWrite, ByteRange::new(0, 4096), open()));
        let g2 = grant(
            &store,
            &req(A, IoMode::ReadWrite, ByteRange::new(4096, 4096), PresentedStateid::Layout(g1.stateid)),
        );
        assert_eq!(g2.stateid.seqid, 2);
        assert_eq!(g2.segments.len(), 1);
        assert_eq!(g2.segments[0].range, ByteRange::new(0, 8192));
        assert_eq!(store.segments_of(FILE, A).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_stateid_on_get_fails() {
        let store = store();
        let g1 = grant(&store, &req(A, IoMode::Read, ByteRange::new(0, 4096), open()));
        grant(
            &store,
            &req(A, IoMode::Read, ByteRange::new(8192, 4096), PresentedStateid::Layout(g1.stateid)),
        );
        let result = store.get_layout(
            &req(A, IoMode::Read, ByteRange::new(16384, 4096), PresentedStateid::Layout(g1.stateid)),
            body(),
        );
        assert!(matches!(result, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_conflict_reports_holders_without_change() {
        let store = store();
        grant(&store, &req(A, IoMode::ReadWrite, ByteRange::whole_file(), open()));
        let outcome = store
            .get_layout(&req(B, IoMode::Read, ByteRange::new(0, 4096), open()), body())
            .unwrap();
        assert_eq!(outcome, GrantOutcome::Conflict { holders: vec![A] });
        assert_eq!(store.current_stateid(FILE, B).unwrap(), None);
    }

    #[test]
    fn test_readers_do_not_conflict() {
        let store = store();
        grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        grant(&store, &req(B, IoMode::Read, ByteRange::whole_file(), open()));
        assert_eq!(store.segment_count().unwrap(), 2);
    }

    #[test]
    fn test_partial_return_splits_and_advances() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::ReadWrite, ByteRange::new(0, 16384), open()));
        let out = store
            .return_layout(
                A,
                &ReturnScope::File {
                    file_id: FILE,
                    range: ByteRange::new(0, 4096),
                    stateid: g.stateid,
                },
                IoMode::ReadWrite,
            )
            .unwrap();
        let s = out.stateid.unwrap();
        assert_eq!(s.seqid, 2);
        assert!(!out.punched_hole);
        let segs = store.segments_of(FILE, A).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].range, ByteRange::new(4096, 12288));
    }

    #[test]
    fn test_interior_return_flags_hole() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let out = store
            .return_layout(
                A,
                &ReturnScope::File {
                    file_id: FILE,
                    range: ByteRange::new(4096, 4096),
                    stateid: g.stateid,
                },
                IoMode::Read,
            )
            .unwrap();
        assert!(out.punched_hole);
        assert_eq!(store.segments_of(FILE, A).unwrap().len(), 2);
    }

    #[test]
    fn test_full_return_retires_then_reuse_fails() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::ReadWrite, ByteRange::whole_file(), open()));
        let scope = ReturnScope::File {
            file_id: FILE,
            range: ByteRange::whole_file(),
            stateid: g.stateid,
        };
        let out = store.return_layout(A, &scope, IoMode::Any).unwrap();
        assert_eq!(out.stateid, None);

        let commit = store.commit_layout(FILE, A, &g.stateid, ByteRange::new(0, 4096));
        assert!(matches!(commit, Err(LayoutError::BadLayout { .. })));
        let again = store.return_layout(A, &scope, IoMode::Any);
        assert!(matches!(again, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_return_unmatched_range_advances() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::new(0, 4096), open()));
        let out = store
            .return_layout(
                A,
                &ReturnScope::File {
                    file_id: FILE,
                    range: ByteRange::new(1 << 20, 4096),
                    stateid: g.stateid,
                },
                IoMode::Read,
            )
            .unwrap();
        assert_eq!(out.stateid.map(|s| s.seqid), Some(2));
    }

    #[test]
    fn test_foreign_client_return_fails() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let result = store.return_layout(
            B,
            &ReturnScope::File {
                file_id: FILE,
                range: ByteRange::whole_file(),
                stateid: g.stateid,
            },
            IoMode::Read,
        );
        assert!(matches!(result, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_bulk_return_retires_all() {
        let store = store();
        let other = FileId::new(2, 5);
        grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let mut r = req(A, IoMode::Read, ByteRange::whole_file(), open());
        r.file_id = other;
        grant(&store, &r);

        let out = store.return_layout(A, &ReturnScope::Fsid(1), IoMode::Any).unwrap();
        assert_eq!(out.files, vec![FILE]);
        assert_eq!(store.files_of_client(A).unwrap(), vec![other]);

        let out = store.return_layout(A, &ReturnScope::All, IoMode::Any).unwrap();
        assert_eq!(out.files, vec![other]);
        assert!(store.files_of_client(A).unwrap().is_empty());
    }

    #[test]
    fn test_commit_requires_rw_coverage() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::ReadWrite, ByteRange::new(0, 8192), open()));
        assert!(store.commit_layout(FILE, A, &g.stateid, ByteRange::new(0, 8192)).is_ok());
        assert!(store.commit_layout(FILE, A, &g.stateid, ByteRange::new(0, 0)).is_ok());
        let uncovered = store.commit_layout(FILE, A, &g.stateid, ByteRange::new(4096, 8192));
        assert!(matches!(uncovered, Err(LayoutError::BadLayout { .. })));
    }

    #[test]
    fn test_commit_with_read_layout_fails() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let result = store.commit_layout(FILE, A, &g.stateid, ByteRange::new(0, 4096));
        assert!(matches!(result, Err(LayoutError::BadLayout { .. })));
    }

    #[test]
    fn test_close_marks_lineage_closed() {
        let store = store();
        let mut r = req(A, IoMode::ReadWrite, ByteRange::whole_file(), open());
        r.return_on_close = true;
        let g = grant(&store, &r);

        assert_eq!(store.close(FILE, A).unwrap(), 1);
        assert_eq!(store.lineage_state(FILE, A).unwrap(), Some(LineageState::Closed));
        assert!(store.segments_of(FILE, A).unwrap().is_empty());

        let get = store.get_layout(
            &req(A, IoMode::Read, ByteRange::whole_file(), PresentedStateid::Layout(g.stateid)),
            body(),
        );
        assert!(matches!(get, Err(LayoutError::BadStateid { .. })));
        let commit = store.commit_layout(FILE, A, &g.stateid, ByteRange::new(0, 0));
        assert!(matches!(commit, Err(LayoutError::BadStateid { .. })));

        let scope = ReturnScope::File {
            file_id: FILE,
            range: ByteRange::whole_file(),
            stateid: g.stateid,
        };
        assert_eq!(store.return_layout(A, &scope, IoMode::Any).unwrap().stateid, None);
        assert!(store.return_layout(A, &scope, IoMode::Any).is_err());
    }

    #[test]
    fn test_fresh_anchor_replaces_closed_lineage() {
        let store = store();
        let mut r = req(A, IoMode::Read, ByteRange::whole_file(), open());
        r.return_on_close = true;
        let g1 = grant(&store, &r);
        store.close(FILE, A).unwrap();

        let g2 = grant(&store, &r);
        assert_eq!(g2.stateid.seqid, 1);
        assert_ne!(g2.stateid.other, g1.stateid.other);
    }

    #[test]
    fn test_close_without_roc_is_noop() {
        let store = store();
        grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        assert_eq!(store.close(FILE, A).unwrap(), 0);
        assert_eq!(store.lineage_state(FILE, A).unwrap(), Some(LineageState::Active));
    }

    #[test]
    fn test_revoke_retires_lineage() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        assert_eq!(store.revoke(FILE, A).unwrap(), Some(g.stateid));
        let result = store.get_layout(
            &req(A, IoMode::Read, ByteRange::whole_file(), PresentedStateid::Layout(g.stateid)),
            body(),
        );
        assert!(matches!(result, Err(LayoutError::BadStateid { .. })));
        assert_eq!(store.revoke(FILE, A).unwrap(), None);
    }

    #[test]
    fn test_forget_keeps_seqid() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::new(0, 8192), open()));
        store.forget(FILE, A, ByteRange::new(0, 4096), IoMode::Any).unwrap();
        assert_eq!(store.current_stateid(FILE, A).unwrap(), Some(g.stateid));
        store.forget(FILE, A, ByteRange::whole_file(), IoMode::Any).unwrap();
        assert_eq!(store.current_stateid(FILE, A).unwrap(), None);
    }

    #[test]
    fn test_device_reference_queries() {
        let store = store();
        grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        assert!(store.references_device(&DeviceId::from_u64(1)).unwrap());
        assert!(!store.references_device(&DeviceId::from_u64(3)).unwrap());
        assert_eq!(store.segments_referencing(&DeviceId::from_u64(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_body_rejected() {
        let store = store();
        let bad = LayoutBody::ObjectsV2(ObjectLayout {
            map: StripeMap {
                stripe_unit: 65536,
                group_width: 0,
                group_depth: 0,
                mirror_count: 0,
                raid_algorithm: RaidAlgorithm::Raid5,
            },
            components: vec![],
        });
        let result = store.get_layout(&req(A, IoMode::Read, ByteRange::whole_file(), open()), bad);
        assert!(matches!(result, Err(LayoutError::BadLayout { .. })));
    }

    #[test]
    fn test_commit_after_many_lineages_still_bad_layout() {
        let store = store();
        let whole = ByteRange::whole_file();
        let mut first = None;
        for _ in 0..40 {
            let g = grant(&store, &req(A, IoMode::ReadWrite, whole, open()));
            first.get_or_insert(g.stateid);
            let scope = ReturnScope::File {
                file_id: FILE,
                range: whole,
                stateid: g.stateid,
            };
            assert_eq!(store.return_layout(A, &scope, IoMode::Any).unwrap().stateid, None);
        }
        let first = first.unwrap();

        let commit = store.commit_layout(FILE, A, &first, ByteRange::new(0, 4096));
        assert!(matches!(commit, Err(LayoutError::BadLayout { .. })));
        let scope = ReturnScope::File {
            file_id: FILE,
            range: whole,
            stateid: first,
        };
        assert!(matches!(
            store.return_layout(A, &scope, IoMode::Any),
            Err(LayoutError::BadStateid { .. })
        ));

        // Same outcome while a newer lineage is live on the pair.
        grant(&store, &req(A, IoMode::ReadWrite, whole, open()));
        let commit = store.commit_layout(FILE, A, &first, ByteRange::new(0, 4096));
        assert!(matches!(commit, Err(LayoutError::BadLayout { .. })));
        let get = store.get_layout(&req(A, IoMode::Read, whole, PresentedStateid::Layout(first)), body());
        assert!(matches!(get, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_foreign_sequencer_stateid_is_not_retired() {
        let store = store();
        let foreign = LayoutStateidSequencer::new().issue(FILE, A);
        if store.sequencer.issued(&foreign.other) {
            return;
        }
        let commit = store.commit_layout(FILE, A, &foreign, ByteRange::new(0, 4096));
        assert!(matches!(commit, Err(LayoutError::BadStateid { .. })));
    }

    #[test]
    fn test_released_state_is_pruned() {
        let store = store();
        for ino in 0..200 {
            let mut r = req(A, IoMode::Read, ByteRange::whole_file(), open());
            r.file_id = FileId::new(3, ino);
            grant(&store, &r);
            store.revoke(r.file_id, A).unwrap();
        }
        assert_eq!(store.files.len(), 0);

        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let mut other = req(B, IoMode::Read, ByteRange::whole_file(), open());
        other.file_id = FileId::new(4, 1);
        grant(&store, &other);
        assert_eq!(store.return_layout(B, &ReturnScope::All, IoMode::Any).unwrap().files, vec![other.file_id]);
        assert_eq!(store.files.len(), 1);

        let scope = ReturnScope::File {
            file_id: FILE,
            range: ByteRange::whole_file(),
            stateid: g.stateid,
        };
        store.return_layout(A, &scope, IoMode::Any).unwrap();
        assert_eq!(store.files.len(), 0);
    }

    #[test]
    fn test_rejected_gets_leave_no_state() {
        let store = store();
        grant(&store, &req(A, IoMode::ReadWrite, ByteRange::whole_file(), open()));
        let conflict = store
            .get_layout(&req(B, IoMode::Read, ByteRange::whole_file(), open()), body())
            .unwrap();
        assert!(matches!(conflict, GrantOutcome::Conflict { .. }));
        let pairs = store.files.get(&FILE).map(|e| e.pairs.len());
        assert_eq!(pairs, Some(1));

        let mut unknown = req(B, IoMode::Read, ByteRange::whole_file(), open());
        unknown.file_id = FileId::new(9, 9);
        let bogus = LayoutStateidSequencer::new().issue(unknown.file_id, B);
        unknown.stateid = PresentedStateid::Layout(bogus);
        assert!(store.get_layout(&unknown, body()).is_err());
        assert!(store.files.get(&unknown.file_id).is_none());
    }

    #[test]
    fn test_unregister_refused_while_referenced() {
        let store = store();
        let g = grant(&store, &req(A, IoMode::Read, ByteRange::whole_file(), open()));
        let result = store.unregister_device(&DeviceId::from_u64(1));
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));

        let scope = ReturnScope::File {
            file_id: FILE,
            range: ByteRange::whole_file(),
            stateid: g.stateid,
        };
        store.return_layout(A, &scope, IoMode::Any).unwrap();
        assert!(store.unregister_device(&DeviceId::from_u64(1)).is_ok());
        let again = store.get_layout(&req(A, IoMode::Read, ByteRange::whole_file(), open()), body());
        assert!(matches!(again, Err(LayoutError::BadLayout { .. })));
    }

    #[test]
    fn test_unregister_waits_for_grant_in_flight() {
        let store = store();
        let device = DeviceId::from_u64(3);
        store
            .registry
            .register(device, LayoutType::ObjectsV2, DeviceTargets::dns("osd3", vec![AuthFlavor::Sys]))
            .unwrap();

        let in_flight = store.device_gate.read().unwrap();
        std::thread::scope(|s| {
            let unregister = s.spawn(|| store.unregister_device(&device));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!unregister.is_finished());
            drop(in_flight);
            assert!(unregister.join().unwrap().is_ok());
        });
        assert!(store.registry.lookup(&device).is_err());
    }
}
