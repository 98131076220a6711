//! Placement of file data on registered devices.
//!
//! A [`LayoutProvider`] decides which devices back a file and in what order.
//! The manager asks it for a body on every LAYOUTGET and then validates the
//! result like any other layout, so providers cannot bypass the stripe map
//! and credential checks.

use std::sync::Arc;

use tracing::debug;

use crate::device::{DeviceEntry, DeviceRegistry};
use crate::error::{LayoutError, Result};
use crate::layout::{
    Component, FlexFileLayout, FlexMirror, LayoutBody, ObjectLayout, StripeMap,
};
use crate::types::{ByteRange, FileId, IoMode, LayoutType};

/// Produces layout bodies for files.
pub trait LayoutProvider: Send + Sync {
    /// Builds the layout body a client should receive for a file range.
    fn layout_for(
        &self,
        file_id: FileId,
        layout_type: LayoutType,
        io_mode: IoMode,
        range: ByteRange,
    ) -> Result<LayoutBody>;
}

/// Default provider: stripes a file across the registered devices of the
/// requested layout type, starting at `ino % devices` and wrapping around.
pub struct StripedPlacement {
    registry: Arc<DeviceRegistry>,
    geometry: StripeMap,
}

impl StripedPlacement {
    /// Creates a provider using a fixed stripe geometry.
    pub fn new(registry: Arc<DeviceRegistry>, geometry: StripeMap) -> Self {
        Self { registry, geometry }
    }

    /// The configured geometry.
    pub fn geometry(&self) -> StripeMap {
        self.geometry
    }

    fn candidates(&self, file_id: FileId, layout_type: LayoutType) -> Result<Vec<DeviceEntry>> {
        let devices = self.registry.devices_of_type(layout_type);
        if devices.is_empty() {
            return Err(LayoutError::try_later(format!(
                "no {} devices registered",
                layout_type
            )));
        }
        let start = (file_id.ino % devices.len() as u64) as usize;
        let mut rotated = Vec::with_capacity(devices.len());
        rotated.extend_from_slice(&devices[start..]);
        rotated.extend_from_slice(&devices[..start]);
        Ok(rotated)
    }

    fn object_layout(&self, file_id: FileId, devices: &[DeviceEntry]) -> Result<LayoutBody> {
        let unit = self.geometry.raid_algorithm.needed_components() as usize
            * (self.geometry.mirror_count as usize + 1);
        let width = (devices.len() / unit) * unit;
        if width == 0 {
            return Err(LayoutError::try_later(format!(
                "{} devices registered, geometry needs {}",
                devices.len(),
                unit
            )));
        }

        let components = devices[..width]
            .iter()
            .enumerate()
            .map(|(idx, d)| component(file_id, idx, d))
            .collect();
        Ok(LayoutBody::ObjectsV2(ObjectLayout {
            map: self.geometry,
            components,
        }))
    }

    fn flex_layout(&self, file_id: FileId, devices: &[DeviceEntry]) -> Result<LayoutBody> {
        let mirrors = self.geometry.mirror_count as usize + 1;
        let per_mirror = devices.len() / mirrors;
        if per_mirror == 0 {
            return Err(LayoutError::try_later(format!(
                "{} devices registered, {} mirrors requested",
                devices.len(),
                mirrors
            )));
        }

        let mirrors = (0..mirrors)
            .map(|mi| {
                let start = mi * per_mirror;
                FlexMirror {
                    components: devices[start..start + per_mirror]
                        .iter()
                        .enumerate()
                        .map(|(idx, d)| component(file_id, start + idx, d))
                        .collect(),
                }
            })
            .collect();
        Ok(LayoutBody::FlexFiles(FlexFileLayout {
            stripe_unit: self.geometry.stripe_unit,
            mirrors,
        }))
    }
}

impl LayoutProvider for StripedPlacement {
    fn layout_for(
        &self,
        file_id: FileId,
        layout_type: LayoutType,
        io_mode: IoMode,
        range: ByteRange,
    ) -> Result<LayoutBody> {
        let devices = self.candidates(file_id, layout_type)?;
        let body = match layout_type {
            LayoutType::ObjectsV2 => self.object_layout(file_id, &devices)?,
            LayoutType::FlexFiles => self.flex_layout(file_id, &devices)?,
        };
        debug!(
            file = %file_id,
            %layout_type,
            ?io_mode,
            %range,
            components = body.components().len(),
            "placed layout"
        );
        Ok(body)
    }
}

// Component handles name the file and the component's slot in the stripe.
fn component(file_id: FileId, idx: usize, device: &DeviceEntry) -> Component {
    let mut file_handle = Vec::with_capacity(20);
    file_handle.extend_from_slice(&file_id.fsid.to_be_bytes());
    file_handle.extend_from_slice(&file_id.ino.to_be_bytes());
    file_handle.extend_from_slice(&(idx as u32).to_be_bytes());
    Component {
        device_id: device.device_id,
        file_handle,
        auth_flavor: device.preferred_flavor(),
    }
}
