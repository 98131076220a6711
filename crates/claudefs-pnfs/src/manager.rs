//! The layout manager: the operations a metadata server exposes for pNFS.
//!
//! `LayoutManager` owns the device registry, the layout store and the recall
//! coordinator, and composes them behind GETDEVICEINFO, LAYOUTGET,
//! LAYOUTRETURN and LAYOUTCOMMIT. It maps every failure to a [`LayoutError`]
//! and keeps operation counters.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::LayoutManagerConfig;
use crate::device::{DeviceEntry, DeviceRegistry, DeviceTargets};
use crate::error::{LayoutError, Result};
use crate::layout::{IoErrorCode, IoErrorReport, IoReport};
use crate::metadata::{CommitUpdate, CommittedAttrs, FileMetadataStore, MemoryMetadataStore};
use crate::placement::{LayoutProvider, StripedPlacement};
use crate::recall::{RecallAcknowledged, RecallCoordinator, RecallEvent, RecallPolicy};
use crate::stateid::{LayoutStateid, PresentedStateid};
use crate::stats::{LayoutStats, LayoutStatsSnapshot};
use crate::store::{GrantOutcome, LayoutSegment, LayoutStore, ReturnScope, SegmentRequest};
use crate::types::{ByteRange, ClientId, DeviceId, FileId, IoMode, LayoutType};

/// LAYOUTGET arguments.
#[derive(Debug, Clone)]
pub struct GetLayoutRequest {
    /// Target file
    pub file_id: FileId,
    /// Requesting client
    pub client_id: ClientId,
    /// Requested layout type
    pub layout_type: LayoutType,
    /// Requested I/O mode
    pub io_mode: IoMode,
    /// Requested range
    pub range: ByteRange,
    /// Open, lock, delegation or layout stateid
    pub stateid: PresentedStateid,
}

/// LAYOUTGET result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutResponse {
    /// Layout stateid to use for the next operation
    pub stateid: LayoutStateid,
    /// Layout type of the segments
    pub layout_type: LayoutType,
    /// Whether the segments are released on close
    pub return_on_close: bool,
    /// Granted segments
    pub segments: Vec<LayoutSegment>,
    /// Encoded layout content of each segment, in `segments` order
    pub content: Vec<Vec<u8>>,
}

/// LAYOUTCOMMIT arguments.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// Target file
    pub file_id: FileId,
    /// Committing client
    pub client_id: ClientId,
    /// Current layout stateid
    pub stateid: LayoutStateid,
    /// Range written through the layout
    pub range: ByteRange,
    /// The client hit an error writing to the devices
    pub is_error: bool,
    /// Offset of the last byte written
    pub last_write_offset: Option<u64>,
    /// Client-supplied modification time
    pub time_modify: Option<SystemTime>,
    /// Change in device space used
    pub delta_space_used: Option<i64>,
}

/// Façade over the registry, store and recall coordinator.
pub struct LayoutManager {
    config: LayoutManagerConfig,
    registry: Arc<DeviceRegistry>,
    store: Arc<LayoutStore>,
    recalls: Arc<RecallCoordinator>,
    provider: Arc<dyn LayoutProvider>,
    metadata: Arc<dyn FileMetadataStore>,
    stats: LayoutStats,
}

impl LayoutManager {
    /// Assembles a manager from its collaborators. Returns the receiving end
    /// of the recall callback channel.
    pub fn new(
        config: LayoutManagerConfig,
        registry: Arc<DeviceRegistry>,
        provider: Arc<dyn LayoutProvider>,
        metadata: Arc<dyn FileMetadataStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RecallEvent>)> {
        config.validate()?;
        let store = Arc::new(LayoutStore::new(registry.clone()));
        let policy = RecallPolicy {
            recall_timeout: config.recall_timeout(),
            blacklist_duration: config.blacklist_duration(),
            misbehavior_threshold: config.misbehavior_threshold,
        };
        let (recalls, events) = RecallCoordinator::new(store.clone(), policy);

        let manager = Self {
            config,
            registry,
            store,
            recalls: Arc::new(recalls),
            provider,
            metadata,
            stats: LayoutStats::new(),
        };
        Ok((manager, events))
    }

    /// Builds a manager with striped placement and in-memory attributes,
    /// registering the devices listed in the configuration.
    pub fn from_config(
        config: LayoutManagerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RecallEvent>)> {
        let registry = Arc::new(DeviceRegistry::new());
        let provider = Arc::new(StripedPlacement::new(registry.clone(), config.geometry()?));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let devices = config.devices.clone();

        let (manager, events) = Self::new(config, registry, provider, metadata)?;
        for d in devices {
            manager.register_device(d.device_id(), d.layout_type, d.targets)?;
        }
        Ok((manager, events))
    }

    /// The configuration in effect.
    pub fn config(&self) -> &LayoutManagerConfig {
        &self.config
    }

    /// The device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The layout store.
    pub fn store(&self) -> &Arc<LayoutStore> {
        &self.store
    }

    /// The recall coordinator.
    pub fn recalls(&self) -> &Arc<RecallCoordinator> {
        &self.recalls
    }

    fn require_enabled(&self, layout_type: LayoutType) -> Result<()> {
        if self.config.enables(layout_type) {
            Ok(())
        } else {
            Err(LayoutError::unsupported(format!("layout type {}", layout_type)))
        }
    }

    fn observe<T>(&self, op: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.stats.record_error(e);
            match e {
                LayoutError::Internal { .. } => error!(op, error = %e, "layout operation failed"),
                _ => debug!(op, error = %e, "layout operation rejected"),
            }
        }
        result
    }

    /// Registers a storage device.
    pub fn register_device(
        &self,
        device_id: DeviceId,
        layout_type: LayoutType,
        targets: DeviceTargets,
    ) -> Result<()> {
        self.require_enabled(layout_type)?;
        self.registry.register(device_id, layout_type, targets)
    }

    /// Removes a storage device that no outstanding layout references.
    pub fn unregister_device(&self, device_id: &DeviceId) -> Result<DeviceEntry> {
        self.store.unregister_device(device_id)
    }

    /// GETDEVICEINFO.
    pub fn get_device_info(&self, device_id: &DeviceId, layout_type: LayoutType) -> Result<DeviceEntry> {
        let result = self.require_enabled(layout_type).and_then(|_| {
            let entry = self.registry.lookup(device_id)?;
            if entry.layout_type != layout_type {
                return Err(LayoutError::unsupported(format!(
                    "device {} serves {}, not {}",
                    device_id, entry.layout_type, layout_type
                )));
            }
            Ok(entry)
        });
        self.observe("getdeviceinfo", result)
    }

    /// LAYOUTGET.
    pub fn get_layout(&self, req: &GetLayoutRequest) -> Result<LayoutResponse> {
        let result = self.get_layout_inner(req, Instant::now());
        if result.is_ok() {
            self.stats.record_grant();
        }
        self.observe("layoutget", result)
    }

    fn get_layout_inner(&self, req: &GetLayoutRequest, now: Instant) -> Result<LayoutResponse> {
        self.require_enabled(req.layout_type)?;

        if self.recalls.is_blacklisted(req.client_id, now) {
            return Err(LayoutError::try_later(format!(
                "{} is blacklisted",
                req.client_id
            )));
        }
        if self.recalls.outstanding(req.client_id, req.file_id, &req.range)? {
            return Err(LayoutError::try_later(format!(
                "recall outstanding for {} on {}",
                req.client_id, req.file_id
            )));
        }

        let body = self
            .provider
            .layout_for(req.file_id, req.layout_type, req.io_mode, req.range)?;
        let seg_req = SegmentRequest {
            file_id: req.file_id,
            client_id: req.client_id,
            io_mode: req.io_mode,
            range: req.range,
            stateid: req.stateid,
            return_on_close: self.config.return_on_close,
        };

        match self.store.get_layout(&seg_req, body)? {
            GrantOutcome::Granted(grant) => {
                let content = grant
                    .segments
                    .iter()
                    .map(|seg| seg.body.to_opaque())
                    .collect::<Result<Vec<_>>>()?;
                Ok(LayoutResponse {
                    stateid: grant.stateid,
                    layout_type: req.layout_type,
                    return_on_close: self.config.return_on_close,
                    segments: grant.segments,
                    content,
                })
            }
            GrantOutcome::Conflict { holders } => {
                let issued = self
                    .recalls
                    .on_conflict(req.file_id, req.client_id, req.io_mode, req.range, now)?;
                self.stats.record_recalls_issued(issued as u64);
                Err(LayoutError::try_later(format!(
                    "layout held by {} other client(s), recall in progress",
                    holders.len()
                )))
            }
        }
    }

    /// LAYOUTRETURN. Returns the new stateid when segments remain.
    pub fn return_layout(
        &self,
        client_id: ClientId,
        scope: &ReturnScope,
        io_mode: IoMode,
        io_report: &IoReport,
    ) -> Result<Option<LayoutStateid>> {
        let result = self.return_layout_inner(client_id, scope, io_mode, io_report, Instant::now());
        if result.is_ok() {
            self.stats.record_return();
        }
        self.observe("layoutreturn", result)
    }

    fn return_layout_inner(
        &self,
        client_id: ClientId,
        scope: &ReturnScope,
        io_mode: IoMode,
        io_report: &IoReport,
        now: Instant,
    ) -> Result<Option<LayoutStateid>> {
        // Devices named only implicitly must be resolved before the layout is gone.
        let failing: Vec<DeviceId> = match scope {
            ReturnScope::File { file_id, .. } if !io_report.is_empty() => {
                self.recalls.fatal_devices(*file_id, client_id, io_report)?
            }
            _ => io_report
                .errors
                .iter()
                .filter(|e| e.code.is_device_fatal())
                .filter_map(|e| e.device_id)
                .collect(),
        };

        let outcome = self.store.return_layout(client_id, scope, io_mode)?;

        if outcome.punched_hole {
            if self.recalls.on_misbehaving_client(client_id, now)? {
                self.stats.record_blacklisted();
            }
        } else {
            self.recalls.reset_strikes(client_id);
        }

        let resolved = self.recalls.on_return(client_id, &outcome.files)?;
        self.stats.record_recalls_resolved(resolved as u64);

        if !failing.is_empty() {
            let issued = self.recalls.recall_device_users(client_id, &failing, now)?;
            self.stats.record_recalls_issued(issued as u64);
        }
        Ok(outcome.stateid)
    }

    /// LAYOUTCOMMIT. Writes the new attributes through to the metadata store.
    pub fn commit_layout(&self, req: &CommitRequest) -> Result<CommittedAttrs> {
        let result = self.commit_layout_inner(req, Instant::now());
        if result.is_ok() {
            self.stats.record_commit();
        }
        self.observe("layoutcommit", result)
    }

    fn commit_layout_inner(&self, req: &CommitRequest, now: Instant) -> Result<CommittedAttrs> {
        self.store
            .commit_layout(req.file_id, req.client_id, &req.stateid, req.range)?;

        if req.is_error {
            let report = IoReport::single(IoErrorReport {
                device_id: None,
                range: req.range,
                is_write: true,
                code: IoErrorCode::Eio,
            });
            let issued = self
                .recalls
                .on_io_error_report(req.file_id, req.client_id, &report, now)?;
            self.stats.record_recalls_issued(issued as u64);
        }

        let update = CommitUpdate {
            range: req.range,
            last_write_offset: req.last_write_offset,
            time_modify: req.time_modify,
            delta_space_used: req.delta_space_used,
        };
        let attrs = self.metadata.apply_commit(req.file_id, &update)?;
        info!(
            file = %req.file_id,
            client = %req.client_id,
            size = attrs.size,
            size_changed = attrs.size_changed,
            "layout committed"
        );
        Ok(attrs)
    }

    /// Close notification for a client's last open of a file.
    pub fn close_file(&self, file_id: FileId, client_id: ClientId) -> Result<()> {
        let result = self.store.close(file_id, client_id).and_then(|dropped| {
            if dropped > 0 {
                let resolved = self.recalls.on_return(client_id, &[file_id])?;
                self.stats.record_recalls_resolved(resolved as u64);
            }
            Ok(())
        });
        self.observe("close", result)
    }

    /// Handles a client's reply to a recall.
    pub fn recall_acknowledged(&self, ack: RecallAcknowledged) -> Result<()> {
        let result = (|| -> Result<()> {
            for recall in self.recalls.acknowledged(&ack)? {
                self.store.forget(
                    recall.file_id,
                    recall.target_client_id,
                    recall.affected_range,
                    recall.io_mode,
                )?;
                self.stats.record_recalls_resolved(1);
            }
            Ok(())
        })();
        self.observe("recall_ack", result)
    }

    /// Revokes layouts whose recall deadline passed and blacklists their
    /// holders. Returns the number of expired recalls.
    pub fn sweep_expired_recalls(&self, now: Instant) -> Result<usize> {
        let expired = self.recalls.take_expired(now)?;
        for recall in &expired {
            warn!(
                client = %recall.target_client_id,
                file = %recall.file_id,
                recall = recall.id,
                "recall timed out"
            );
            if let Some(stateid) = self.store.revoke(recall.file_id, recall.target_client_id)? {
                self.stats.record_revocations(1);
                self.recalls.revoked(recall, stateid, now);
                self.stats.record_blacklisted();
            }
            self.recalls.discard(recall.target_client_id, recall.file_id)?;
        }
        self.stats.record_recalls_expired(expired.len() as u64);
        self.recalls.prune_blacklist(now);
        Ok(expired.len())
    }

    /// Spawns the maintenance loop: sweeps expired recalls on the configured
    /// interval and applies inbound recall acknowledgements, until `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut acks: mpsc::UnboundedReceiver<RecallAcknowledged>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = manager.config.sweep_interval_ms, "layout maintenance started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.sweep_expired_recalls(Instant::now()) {
                            error!(error = %e, "recall sweep failed");
                        }
                    }
                    Some(ack) = acks.recv() => {
                        if let Err(e) = manager.recall_acknowledged(ack) {
                            warn!(error = %e, "recall acknowledgement rejected");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("layout maintenance stopped");
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LayoutStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::NetAddr;
    use crate::stateid::StateidOther;
    use crate::types::AuthFlavor;

    fn config() -> LayoutManagerConfig {
        LayoutManagerConfig {
            layout_types: vec![LayoutType::ObjectsV2],
            devices: (1..=2)
                .map(|id| DeviceConfig {
                    id,
                    layout_type: LayoutType::ObjectsV2,
                    targets: DeviceTargets::ips(
                        vec![NetAddr::tcp(&format!("10.0.0.{}.8.1", id))],
                        vec![AuthFlavor::Sys],
                    ),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn get(file: FileId, client: ClientId, io_mode: IoMode, stateid: PresentedStateid) -> GetLayoutRequest {
        GetLayoutRequest {
            file_id: file,
            client_id: client,
            layout_type: LayoutType::ObjectsV2,
            io_mode,
            range: ByteRange::whole_file(),
            stateid,
        }
    }

    fn open() -> PresentedStateid {
        PresentedStateid::Open(StateidOther([3; 12]))
    }

    #[test]
    fn test_from_config_registers_devices() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        assert_eq!(mgr.registry().len(), 2);
        let entry = mgr
            .get_device_info(&DeviceId::from_u64(1), LayoutType::ObjectsV2)
            .unwrap();
        assert_eq!(entry.device_id, DeviceId::from_u64(1));
    }

    #[test]
    fn test_disabled_layout_type_unsupported() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        let mut req = get(FileId::new(1, 1), ClientId(1), IoMode::Read, open());
        req.layout_type = LayoutType::FlexFiles;
        assert!(matches!(mgr.get_layout(&req), Err(LayoutError::Unsupported { .. })));
        assert!(matches!(
            mgr.get_device_info(&DeviceId::from_u64(1), LayoutType::FlexFiles),
            Err(LayoutError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_get_device_info_unknown() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        assert!(matches!(
            mgr.get_device_info(&DeviceId::from_u64(99), LayoutType::ObjectsV2),
            Err(LayoutError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_no_devices_try_later() {
        let cfg = LayoutManagerConfig {
            devices: vec![],
            ..config()
        };
        let (mgr, _events) = LayoutManager::from_config(cfg).unwrap();
        let result = mgr.get_layout(&get(FileId::new(1, 1), ClientId(1), IoMode::Read, open()));
        assert!(matches!(result, Err(LayoutError::TryLater { .. })));
    }

    #[test]
    fn test_get_commit_return_cycle() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        let file = FileId::new(1, 7);
        let client = ClientId(1);

        let layout = mgr
            .get_layout(&get(file, client, IoMode::ReadWrite, open()))
            .unwrap();
        assert_eq!(layout.stateid.seqid, 1);
        assert_eq!(layout.segments[0].body.components().len(), 2);

        let attrs = mgr
            .commit_layout(&CommitRequest {
                file_id: file,
                client_id: client,
                stateid: layout.stateid,
                range: ByteRange::new(0, 8192),
                is_error: false,
                last_write_offset: Some(8191),
                time_modify: None,
                delta_space_used: Some(8192),
            })
            .unwrap();
        assert_eq!(attrs.size, 8192);

        let next = mgr
            .return_layout(
                client,
                &ReturnScope::File {
                    file_id: file,
                    range: ByteRange::whole_file(),
                    stateid: layout.stateid,
                },
                IoMode::Any,
                &IoReport::empty(),
            )
            .unwrap();
        assert_eq!(next, None);

        let snap = mgr.stats();
        assert_eq!(snap.layouts_granted, 1);
        assert_eq!(snap.layouts_committed, 1);
        assert_eq!(snap.layouts_returned, 1);
    }

    #[test]
    fn test_unregister_referenced_device_fails() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        mgr.get_layout(&get(FileId::new(1, 1), ClientId(1), IoMode::Read, open()))
            .unwrap();
        assert!(matches!(
            mgr.unregister_device(&DeviceId::from_u64(1)),
            Err(LayoutError::InvalidDevice { .. })
        ));
    }

    #[test]
    fn test_unregister_idle_device() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        mgr.unregister_device(&DeviceId::from_u64(2)).unwrap();
        assert_eq!(mgr.registry().len(), 1);
    }

    #[test]
    fn test_rejections_counted() {
        let (mgr, _events) = LayoutManager::from_config(config()).unwrap();
        let seq = crate::stateid::LayoutStateidSequencer::new();
        let bogus = PresentedStateid::Layout(seq.issue(FileId::new(1, 1), ClientId(1)));
        assert!(mgr
            .get_layout(&get(FileId::new(1, 1), ClientId(1), IoMode::Read, bogus))
            .is_err());
        assert_eq!(mgr.stats().stateid_rejections, 1);
    }
}
