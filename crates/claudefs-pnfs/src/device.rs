//! pNFS device registry: maps opaque device ids to storage-node addresses.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LayoutError, Result};
use crate::types::{AuthFlavor, DeviceId, LayoutType};

/// Transport used to reach a storage target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    /// TCP transport
    Tcp,
    /// RDMA transport (InfiniBand/RoCE)
    Rdma,
    /// UDP transport
    Udp,
}

impl Transport {
    /// Parses an RPC netid ("tcp", "rdma", "udp").
    pub fn from_netid(netid: &str) -> Option<Self> {
        match netid {
            "tcp" => Some(Transport::Tcp),
            "rdma" => Some(Transport::Rdma),
            "udp" => Some(Transport::Udp),
            _ => None,
        }
    }
}

/// A network address as presented at registration: RPC netid plus universal address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddr {
    /// RPC netid, e.g. "tcp"
    pub netid: String,
    /// Universal address, e.g. "192.168.1.10.8.1"
    pub addr: String,
}

impl NetAddr {
    /// A TCP address.
    pub fn tcp(addr: &str) -> Self {
        Self {
            netid: "tcp".to_string(),
            addr: addr.to_string(),
        }
    }
}

/// Unvalidated storage topology for a device, as supplied by the registering party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTargets {
    /// DNS name of the storage node
    #[serde(default)]
    pub fqdn: Option<String>,
    /// Ordered list of network addresses
    #[serde(default)]
    pub netaddrs: Vec<NetAddr>,
    /// Credential flavors the storage node accepts
    #[serde(default)]
    pub auth_flavors: Vec<AuthFlavor>,
}

impl DeviceTargets {
    /// Topology addressed by DNS name.
    pub fn dns(fqdn: &str, auth_flavors: Vec<AuthFlavor>) -> Self {
        Self {
            fqdn: Some(fqdn.to_string()),
            netaddrs: Vec::new(),
            auth_flavors,
        }
    }

    /// Topology addressed by an IP list.
    pub fn ips(netaddrs: Vec<NetAddr>, auth_flavors: Vec<AuthFlavor>) -> Self {
        Self {
            fqdn: None,
            netaddrs,
            auth_flavors,
        }
    }

    fn into_address(self) -> Result<DeviceAddress> {
        let fqdn = self.fqdn.filter(|f| !f.is_empty());

        match (fqdn, self.netaddrs.is_empty()) {
            (Some(_), false) => Err(LayoutError::invalid_device(
                "device has both IP address and DNS",
            )),
            (None, true) => Err(LayoutError::invalid_device("device has no addresses")),
            (Some(name), true) => Ok(DeviceAddress::Fqdn(name)),
            (None, false) => {
                let mut targets = Vec::with_capacity(self.netaddrs.len());
                for na in self.netaddrs {
                    match Transport::from_netid(&na.netid) {
                        Some(Transport::Tcp) => {}
                        _ => {
                            return Err(LayoutError::invalid_device(format!(
                                "device defined as non-tcp ({})",
                                na.netid
                            )))
                        }
                    }
                    if na.addr.is_empty() {
                        return Err(LayoutError::invalid_device("device has no address"));
                    }
                    targets.push(StorageTarget {
                        transport: Transport::Tcp,
                        addr: na.addr,
                    });
                }
                Ok(DeviceAddress::Netaddrs(targets))
            }
        }
    }
}

/// A validated storage endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    /// Transport kind
    pub transport: Transport,
    /// Universal address
    pub addr: String,
}

/// How a device is addressed: exactly one of a DNS name or an IP list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAddress {
    /// Resolved lazily by the caller
    Fqdn(String),
    /// Ordered endpoints, all TCP
    Netaddrs(Vec<StorageTarget>),
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device id
    pub device_id: DeviceId,
    /// Layout type the device serves
    pub layout_type: LayoutType,
    /// Storage-node addressing
    pub address: DeviceAddress,
    /// Credential flavors the device accepts
    pub auth_flavors: Vec<AuthFlavor>,
}

impl DeviceEntry {
    /// Whether the device accepts a credential flavor.
    pub fn allows(&self, flavor: AuthFlavor) -> bool {
        self.auth_flavors.contains(&flavor)
    }

    /// The flavor handed out in layouts that reference this device.
    pub fn preferred_flavor(&self) -> AuthFlavor {
        self.auth_flavors.first().copied().unwrap_or(AuthFlavor::Sys)
    }
}

/// Registry of devices backing layouts.
///
/// Entries are immutable once registered. Lookups run concurrently with
/// registration of unrelated devices.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, DeviceEntry>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
        }
    }

    /// Registers a device after validating its addressing.
    ///
    /// Re-registering an identical entry is a no-op; a different entry under
    /// an existing id fails with `InvalidDevice`.
    pub fn register(
        &self,
        device_id: DeviceId,
        layout_type: LayoutType,
        targets: DeviceTargets,
    ) -> Result<()> {
        if targets.auth_flavors.is_empty() {
            return Err(LayoutError::invalid_device(
                "device has an empty credential allow-list",
            ));
        }
        let auth_flavors = targets.auth_flavors.clone();
        let address = targets.into_address()?;
        let entry = DeviceEntry {
            device_id,
            layout_type,
            address,
            auth_flavors,
        };

        match self.devices.entry(device_id) {
            Entry::Occupied(existing) => {
                if existing.get() == &entry {
                    debug!(device = %device_id, "device re-registered unchanged");
                    Ok(())
                } else {
                    Err(LayoutError::invalid_device(format!(
                        "device {} already registered with a different topology",
                        device_id
                    )))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                info!(device = %device_id, %layout_type, "device registered");
                Ok(())
            }
        }
    }

    /// Looks up a device.
    pub fn lookup(&self, device_id: &DeviceId) -> Result<DeviceEntry> {
        self.devices
            .get(device_id)
            .map(|e| e.value().clone())
            .ok_or(LayoutError::UnknownDevice(*device_id))
    }

    /// Removes a device. Callers ensure no layout still references it.
    pub fn unregister(&self, device_id: &DeviceId) -> Result<DeviceEntry> {
        let (_, entry) = self
            .devices
            .remove(device_id)
            .ok_or(LayoutError::UnknownDevice(*device_id))?;
        info!(device = %device_id, "device unregistered");
        Ok(entry)
    }

    /// All devices serving a layout type, in device-id order.
    pub fn devices_of_type(&self, layout_type: LayoutType) -> Vec<DeviceEntry> {
        let mut devices: Vec<DeviceEntry> = self
            .devices
            .iter()
            .filter(|e| e.layout_type == layout_type)
            .map(|e| e.value().clone())
            .collect();
        devices.sort_by_key(|d| d.device_id);
        devices
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flavors() -> Vec<AuthFlavor> {
        vec![AuthFlavor::Sys]
    }

    #[test]
    fn test_register_ip_device() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(1);
        reg.register(
            id,
            LayoutType::ObjectsV2,
            DeviceTargets::ips(vec![NetAddr::tcp("192.168.1.1.8.1")], flavors()),
        )
        .unwrap();

        let entry = reg.lookup(&id).unwrap();
        assert_eq!(entry.layout_type, LayoutType::ObjectsV2);
        assert!(matches!(entry.address, DeviceAddress::Netaddrs(ref t) if t.len() == 1));
    }

    #[test]
    fn test_register_dns_device() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(2);
        reg.register(
            id,
            LayoutType::FlexFiles,
            DeviceTargets::dns("osd1.cluster.local", flavors()),
        )
        .unwrap();

        let entry = reg.lookup(&id).unwrap();
        assert_eq!(
            entry.address,
            DeviceAddress::Fqdn("osd1.cluster.local".to_string())
        );
    }

    #[test]
    fn test_register_both_forms_fails() {
        let reg = DeviceRegistry::new();
        let targets = DeviceTargets {
            fqdn: Some("osd1.cluster.local".to_string()),
            netaddrs: vec![NetAddr::tcp("192.168.1.1.8.1")],
            auth_flavors: flavors(),
        };
        let result = reg.register(DeviceId::from_u64(3), LayoutType::ObjectsV2, targets);
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_register_neither_form_fails() {
        let reg = DeviceRegistry::new();
        let targets = DeviceTargets {
            fqdn: Some(String::new()),
            netaddrs: vec![],
            auth_flavors: flavors(),
        };
        let result = reg.register(DeviceId::from_u64(4), LayoutType::ObjectsV2, targets);
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
    }

    #[test]
    fn test_register_non_tcp_fails() {
        let reg = DeviceRegistry::new();
        let targets = DeviceTargets::ips(
            vec![
                NetAddr::tcp("192.168.1.1.8.1"),
                NetAddr {
                    netid: "rdma".to_string(),
                    addr: "192.168.1.2.8.1".to_string(),
                },
            ],
            flavors(),
        );
        let result = reg.register(DeviceId::from_u64(5), LayoutType::ObjectsV2, targets);
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
    }

    #[test]
    fn test_register_empty_address_fails() {
        let reg = DeviceRegistry::new();
        let targets = DeviceTargets::ips(vec![NetAddr::tcp("")], flavors());
        let result = reg.register(DeviceId::from_u64(6), LayoutType::ObjectsV2, targets);
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
    }

    #[test]
    fn test_register_empty_allow_list_fails() {
        let reg = DeviceRegistry::new();
        let targets = DeviceTargets::dns("osd1", vec![]);
        let result = reg.register(DeviceId::from_u64(7), LayoutType::ObjectsV2, targets);
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
    }

    #[test]
    fn test_reregister_identical_is_noop() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(8);
        let targets = DeviceTargets::dns("osd1", flavors());
        reg.register(id, LayoutType::ObjectsV2, targets.clone()).unwrap();
        reg.register(id, LayoutType::ObjectsV2, targets).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_reregister_different_fails() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(9);
        reg.register(id, LayoutType::ObjectsV2, DeviceTargets::dns("osd1", flavors()))
            .unwrap();
        let result = reg.register(id, LayoutType::ObjectsV2, DeviceTargets::dns("osd2", flavors()));
        assert!(matches!(result, Err(LayoutError::InvalidDevice { .. })));
        assert_eq!(
            reg.lookup(&id).unwrap().address,
            DeviceAddress::Fqdn("osd1".to_string())
        );
    }

    #[test]
    fn test_lookup_unknown() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(10);
        assert_eq!(reg.lookup(&id), Err(LayoutError::UnknownDevice(id)));
    }

    #[test]
    fn test_unregister() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(11);
        reg.register(id, LayoutType::ObjectsV2, DeviceTargets::dns("osd1", flavors()))
            .unwrap();
        reg.unregister(&id).unwrap();
        assert!(reg.lookup(&id).is_err());
        assert!(matches!(
            reg.unregister(&id),
            Err(LayoutError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_devices_of_type_sorted() {
        let reg = DeviceRegistry::new();
        for n in [3u64, 1, 2] {
            reg.register(
                DeviceId::from_u64(n),
                LayoutType::ObjectsV2,
                DeviceTargets::dns(&format!("osd{}", n), flavors()),
            )
            .unwrap();
        }
        reg.register(
            DeviceId::from_u64(4),
            LayoutType::FlexFiles,
            DeviceTargets::dns("ds4", flavors()),
        )
        .unwrap();

        let ids: Vec<DeviceId> = reg
            .devices_of_type(LayoutType::ObjectsV2)
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(
            ids,
            vec![DeviceId::from_u64(1), DeviceId::from_u64(2), DeviceId::from_u64(3)]
        );
    }

    #[test]
    fn test_entry_allows_flavor() {
        let reg = DeviceRegistry::new();
        let id = DeviceId::from_u64(12);
        reg.register(
            id,
            LayoutType::ObjectsV2,
            DeviceTargets::dns("osd1", vec![AuthFlavor::Sys, AuthFlavor::RpcsecGss]),
        )
        .unwrap();
        let entry = reg.lookup(&id).unwrap();
        assert!(entry.allows(AuthFlavor::RpcsecGss));
        assert!(!entry.allows(AuthFlavor::None));
        assert_eq!(entry.preferred_flavor(), AuthFlavor::Sys);
    }
}
