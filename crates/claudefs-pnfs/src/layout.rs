//! Layout payloads: object (v2) and Flexible File (RFC 8435) layout bodies,
//! stripe map validation and client I/O error reports.
//!
//! Opaque bytes from the wire are decoded once, here, into these types.
//! Nothing past this module handles untyped layout payloads.

use serde::{Deserialize, Serialize};

use crate::device::DeviceRegistry;
use crate::error::{LayoutError, Result};
use crate::types::{AuthFlavor, ByteRange, DeviceId, LayoutType};

/// RAID algorithm of an object layout stripe map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum RaidAlgorithm {
    /// Striping only
    Raid0 = 1,
    /// Dedicated parity
    Raid4 = 2,
    /// Distributed parity
    Raid5 = 3,
    /// Dual parity (P+Q)
    RaidPq = 4,
}

impl RaidAlgorithm {
    /// Converts a wire value, returning None for unknown algorithms.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(RaidAlgorithm::Raid0),
            2 => Some(RaidAlgorithm::Raid4),
            3 => Some(RaidAlgorithm::Raid5),
            4 => Some(RaidAlgorithm::RaidPq),
            _ => None,
        }
    }

    /// Minimum components per group.
    pub fn needed_components(self) -> u32 {
        match self {
            RaidAlgorithm::Raid0 => 1,
            RaidAlgorithm::Raid4 | RaidAlgorithm::Raid5 => 2,
            RaidAlgorithm::RaidPq => 3,
        }
    }
}

/// Striping geometry of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeMap {
    /// Stripe unit in bytes (> 0)
    pub stripe_unit: u64,
    /// Components per parity group (0 = all components form one group)
    pub group_width: u32,
    /// Stripe units per group before moving to the next group
    pub group_depth: u32,
    /// Additional copies of every component
    pub mirror_count: u32,
    /// RAID algorithm
    pub raid_algorithm: RaidAlgorithm,
}

impl StripeMap {
    /// Checks the map against the number of components it governs.
    pub fn validate(&self, component_count: usize) -> Result<()> {
        if self.stripe_unit == 0 {
            return Err(LayoutError::bad_layout("stripe unit is zero"));
        }

        let needed = self.raid_algorithm.needed_components();
        if self.group_width != 0 && self.group_width < needed {
            return Err(LayoutError::bad_layout(format!(
                "group width {} too small for {:?} (needs {})",
                self.group_width, self.raid_algorithm, needed
            )));
        }

        let needed = needed as u64 * (self.mirror_count as u64 + 1);
        let count = component_count as u64;
        if count == 0 {
            return Err(LayoutError::bad_layout("zero components"));
        }
        if count < needed {
            return Err(LayoutError::bad_layout(format!(
                "too few components: {} < {}",
                count, needed
            )));
        }
        if count % needed != 0 {
            return Err(LayoutError::bad_layout(format!(
                "{} components is not a multiple of {}",
                count, needed
            )));
        }
        Ok(())
    }
}

/// A stripe map as it arrives from the wire or from configuration, with
/// every field optional and the RAID algorithm as its raw code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStripeMap {
    /// Stripe unit in bytes
    #[serde(default)]
    pub stripe_unit: Option<u64>,
    /// Group width
    #[serde(default)]
    pub group_width: Option<u32>,
    /// Group depth
    #[serde(default)]
    pub group_depth: Option<u32>,
    /// Mirror count
    #[serde(default)]
    pub mirror_count: Option<u32>,
    /// RAID algorithm code (1 = RAID0, 2 = RAID4, 3 = RAID5, 4 = RAID_PQ)
    #[serde(default)]
    pub raid_algorithm: Option<u32>,
}

impl RawStripeMap {
    /// Decodes into a [`StripeMap`], rejecting missing fields and unknown algorithms.
    pub fn decode(&self) -> Result<StripeMap> {
        fn field<T: Copy>(v: Option<T>, name: &str) -> Result<T> {
            v.ok_or_else(|| LayoutError::bad_layout(format!("stripe map has no {}", name)))
        }

        let stripe_unit = field(self.stripe_unit, "stripe_unit")?;
        let group_width = field(self.group_width, "group_width")?;
        let group_depth = field(self.group_depth, "group_depth")?;
        let mirror_count = field(self.mirror_count, "mirror_count")?;
        let raid_code = field(self.raid_algorithm, "raid_algorithm")?;
        let raid_algorithm = RaidAlgorithm::from_u32(raid_code)
            .ok_or_else(|| LayoutError::bad_layout(format!("bad RAID type {}", raid_code)))?;

        if stripe_unit == 0 {
            return Err(LayoutError::bad_layout("stripe unit is zero"));
        }

        Ok(StripeMap {
            stripe_unit,
            group_width,
            group_depth,
            mirror_count,
            raid_algorithm,
        })
    }
}

/// One storage component of a layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Device holding the component
    pub device_id: DeviceId,
    /// File handle of the component object on the device
    pub file_handle: Vec<u8>,
    /// Credential flavor the client must use against the device
    pub auth_flavor: AuthFlavor,
}

/// Object-based layout body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLayout {
    /// Striping geometry
    pub map: StripeMap,
    /// Components in stripe order
    pub components: Vec<Component>,
}

/// A mirror group: components that hold identical copies of the data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexMirror {
    /// Data servers in this mirror, in stripe order
    pub components: Vec<Component>,
}

/// Flexible File layout body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexFileLayout {
    /// Stripe unit in bytes
    pub stripe_unit: u64,
    /// Mirror groups
    pub mirrors: Vec<FlexMirror>,
}

impl FlexFileLayout {
    /// Check if a stripe unit is valid (power of 2 and >= 4096)
    pub fn is_valid_stripe_unit(stripe_unit: u64) -> bool {
        stripe_unit >= 4096 && stripe_unit.is_power_of_two()
    }
}

/// A decoded layout payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutBody {
    /// LAYOUT4_OBJECTS_V2
    ObjectsV2(ObjectLayout),
    /// LAYOUT4_FLEX_FILES
    FlexFiles(FlexFileLayout),
}

impl LayoutBody {
    /// Layout type of the payload.
    pub fn layout_type(&self) -> LayoutType {
        match self {
            LayoutBody::ObjectsV2(_) => LayoutType::ObjectsV2,
            LayoutBody::FlexFiles(_) => LayoutType::FlexFiles,
        }
    }

    /// Striping geometry. Flexible File layouts are viewed as RAID0 with one
    /// mirror per copy.
    pub fn stripe_map(&self) -> StripeMap {
        match self {
            LayoutBody::ObjectsV2(l) => l.map,
            LayoutBody::FlexFiles(l) => StripeMap {
                stripe_unit: l.stripe_unit,
                group_width: l.mirrors.first().map_or(0, |m| m.components.len() as u32),
                group_depth: 0,
                mirror_count: (l.mirrors.len() as u32).saturating_sub(1),
                raid_algorithm: RaidAlgorithm::Raid0,
            },
        }
    }

    /// All components, in stripe order (mirror by mirror for Flexible Files).
    pub fn components(&self) -> Vec<&Component> {
        match self {
            LayoutBody::ObjectsV2(l) => l.components.iter().collect(),
            LayoutBody::FlexFiles(l) => l.mirrors.iter().flat_map(|m| m.components.iter()).collect(),
        }
    }

    /// Distinct devices referenced by the layout.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.components().iter().map(|c| c.device_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Whether the layout references a device.
    pub fn references(&self, device_id: &DeviceId) -> bool {
        self.components().iter().any(|c| &c.device_id == device_id)
    }

    /// Structural checks that need no device information.
    pub fn validate_structure(&self) -> Result<()> {
        match self {
            LayoutBody::ObjectsV2(l) => l.map.validate(l.components.len()),
            LayoutBody::FlexFiles(l) => {
                if !FlexFileLayout::is_valid_stripe_unit(l.stripe_unit) {
                    return Err(LayoutError::bad_layout(
                        "stripe_unit must be power of 2 and >= 4096",
                    ));
                }
                if l.mirrors.is_empty() {
                    return Err(LayoutError::bad_layout("layout has no mirrors"));
                }
                let width = l.mirrors[0].components.len();
                if l.mirrors.iter().any(|m| m.components.len() != width) {
                    return Err(LayoutError::bad_layout("mirrors differ in width"));
                }
                self.stripe_map().validate(width * l.mirrors.len())
            }
        }
    }

    /// Full validation: structure, then every component's device and credential.
    pub fn validate(&self, registry: &DeviceRegistry) -> Result<()> {
        self.validate_structure()?;

        let layout_type = self.layout_type();
        for comp in self.components() {
            let device = registry.lookup(&comp.device_id).map_err(|_| {
                LayoutError::bad_layout(format!(
                    "component references unknown device {}",
                    comp.device_id
                ))
            })?;
            if device.layout_type != layout_type {
                return Err(LayoutError::bad_layout(format!(
                    "device {} serves {}, not {}",
                    comp.device_id, device.layout_type, layout_type
                )));
            }
            if !device.allows(comp.auth_flavor) {
                return Err(LayoutError::bad_layout(format!(
                    "bad authentication type {:?} for device {}",
                    comp.auth_flavor, comp.device_id
                )));
            }
        }
        Ok(())
    }

    /// Encodes the payload for the transport layer.
    pub fn to_opaque(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| LayoutError::internal(format!("layout encode failed: {}", e)))
    }

    /// Decodes a payload received from the transport layer.
    pub fn from_opaque(layout_type: LayoutType, bytes: &[u8]) -> Result<Self> {
        let body: LayoutBody = bincode::deserialize(bytes)
            .map_err(|e| LayoutError::bad_layout(format!("undecodable layout body: {}", e)))?;
        if body.layout_type() != layout_type {
            return Err(LayoutError::bad_layout(format!(
                "bad layout type: expected {}, body is {}",
                layout_type,
                body.layout_type()
            )));
        }
        Ok(body)
    }
}

/// Error codes a client reports against a layout component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoErrorCode {
    /// Generic I/O error
    Eio = 1,
    /// Component object not found
    NotFound = 2,
    /// Device out of space
    NoSpace = 3,
    /// Credential rejected
    BadCred = 4,
    /// Access denied
    NoAccess = 5,
    /// Device unreachable
    Unreachable = 6,
    /// Device out of resources
    Resource = 7,
}

impl IoErrorCode {
    /// Converts a wire value. Zero (no error) and unknown values yield None.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(IoErrorCode::Eio),
            2 => Some(IoErrorCode::NotFound),
            3 => Some(IoErrorCode::NoSpace),
            4 => Some(IoErrorCode::BadCred),
            5 => Some(IoErrorCode::NoAccess),
            6 => Some(IoErrorCode::Unreachable),
            7 => Some(IoErrorCode::Resource),
            _ => None,
        }
    }

    /// Whether the error means the device or the path to it is unusable.
    pub fn is_device_fatal(self) -> bool {
        matches!(
            self,
            IoErrorCode::Eio | IoErrorCode::NotFound | IoErrorCode::Unreachable
        )
    }

    /// Whether the error reports an access-pattern or credential violation.
    pub fn is_access_violation(self) -> bool {
        matches!(self, IoErrorCode::BadCred | IoErrorCode::NoAccess)
    }
}

/// One I/O error reported by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoErrorReport {
    /// Failing device; None means "some component of this layout"
    pub device_id: Option<DeviceId>,
    /// Affected byte range
    pub range: ByteRange,
    /// Whether the failing I/O was a write
    pub is_write: bool,
    /// Error code
    pub code: IoErrorCode,
}

/// I/O errors attached to a layout return or commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoReport {
    /// Reported errors
    pub errors: Vec<IoErrorReport>,
}

impl IoReport {
    /// A report carrying no errors.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single error report.
    pub fn single(error: IoErrorReport) -> Self {
        Self {
            errors: vec![error],
        }
    }

    /// Whether the report carries no errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Decodes a report from the transport layer; an empty body is an empty report.
    pub fn from_opaque(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        bincode::deserialize(bytes)
            .map_err(|e| LayoutError::bad_layout(format!("undecodable I/O report: {}", e)))
    }
}
