#![warn(missing_docs)]

//! ClaudeFS pNFS subsystem: layout grants, layout stateids, recalls and commits
//! for the metadata server.
//!
//! Components, leaf first:
//! - [`device::DeviceRegistry`]: device ids to storage-node addresses
//! - [`stateid::LayoutStateidSequencer`]: layout stateid issuance and validation
//! - [`store::LayoutStore`]: outstanding segments per file, client and mode
//! - [`recall::RecallCoordinator`]: conflict, I/O error and misbehavior recalls
//! - [`manager::LayoutManager`]: GETDEVICEINFO, LAYOUTGET, LAYOUTRETURN, LAYOUTCOMMIT

pub mod config;
pub mod device;
pub mod error;
pub mod layout;
pub mod manager;
pub mod metadata;
pub mod placement;
pub mod recall;
pub mod stateid;
pub mod stats;
pub mod store;
pub mod types;

pub use config::{DeviceConfig, LayoutManagerConfig};
pub use device::{DeviceEntry, DeviceRegistry, DeviceTargets, NetAddr};
pub use error::{LayoutError, Result};
pub use layout::{IoErrorCode, IoErrorReport, IoReport, LayoutBody, StripeMap};
pub use manager::{CommitRequest, GetLayoutRequest, LayoutManager, LayoutResponse};
pub use recall::{RecallAcknowledged, RecallEvent, RecallReason, RecallReply};
pub use stateid::{LayoutStateid, PresentedStateid, StateidOther};
pub use store::{LayoutSegment, ReturnScope};
pub use types::{AuthFlavor, ByteRange, ClientId, DeviceId, FileId, IoMode, LayoutType};
