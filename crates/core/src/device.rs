//! Device enumeration: group the HID interfaces of each Logitech USB device
//! into a bundle and open them as one transport.

use crate::error::{Error, Result};
use crate::transport::{HidTransport, UsbTransport};
use crate::{pids, LOGITECH_VID};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Vendor usage page of the HID++ collection.
pub const HIDPP_USAGE_PAGE: u16 = 0xFF00;
const GENERIC_DESKTOP_USAGE_PAGE: u16 = 0x0001;
const MOUSE_USAGE: u16 = 0x0002;
const KEYBOARD_USAGE: u16 = 0x0006;

/// Receiver product families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverFamily {
    Unifying,
    /// Bolt receivers speak BLE Pro.
    Bolt,
    Lightspeed,
    Gotthard,
}

impl ReceiverFamily {
    /// Look up the family from a USB product ID.
    pub fn from_pid(pid: u16) -> Option<Self> {
        match pid {
            pids::UNIFYING_RECEIVER | pids::UNIFYING_RECEIVER_2 => Some(Self::Unifying),
            pids::BOLT_RECEIVER => Some(Self::Bolt),
            pids::LIGHTSPEED_RECEIVER | pids::LIGHTSPEED_RECEIVER_2 | pids::LIGHTSPEED_RECEIVER_3 => {
                Some(Self::Lightspeed)
            }
            pids::GOTTHARD_RECEIVER => Some(Self::Gotthard),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unifying => "Unifying receiver",
            Self::Bolt => "Bolt receiver",
            Self::Lightspeed => "Lightspeed receiver",
            Self::Gotthard => "Gotthard receiver",
        }
    }

    /// Whether the receiver re-announces its slots on a fake-arrival write.
    pub fn supports_fake_arrival(&self) -> bool {
        !matches!(self, Self::Gotthard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    Receiver(ReceiverFamily),
    Device,
}

/// All interfaces of one physical USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBundle {
    /// Stable key used to recognise the device across enumerations.
    pub transport_id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub kind: BundleKind,
    pub hidpp_path: Option<CString>,
    pub mouse_path: Option<CString>,
    pub keyboard_path: Option<CString>,
}

impl DeviceBundle {
    pub fn is_receiver(&self) -> bool {
        matches!(self.kind, BundleKind::Receiver(_))
    }

    pub fn receiver_family(&self) -> Option<ReceiverFamily> {
        match self.kind {
            BundleKind::Receiver(family) => Some(family),
            BundleKind::Device => None,
        }
    }

    /// Human-readable label for listings.
    pub fn label(&self) -> String {
        match (&self.kind, &self.product) {
            (_, Some(product)) if !product.is_empty() => product.clone(),
            (BundleKind::Receiver(family), _) => family.name().to_string(),
            (BundleKind::Device, _) => format!("device 0x{:04X}", self.product_id),
        }
    }
}

/// Source of device bundles and their transports.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceBundle>>;

    fn open(&self, bundle: &DeviceBundle) -> Result<Arc<dyn HidTransport>>;
}

/// Interfaces without a serial number are grouped by their path minus the
/// per-interface suffix (`&mi_NN` on Windows, the trailing `.N` on sysfs
/// and IOKit style paths).
fn path_stem(path: &str) -> &str {
    let lower = path.to_ascii_lowercase();
    if let Some(pos) = lower.find("&mi_") {
        return &path[..pos];
    }
    match path.rfind('.') {
        Some(pos) if path[pos + 1..].bytes().all(|b| b.is_ascii_digit()) && pos + 1 < path.len() => {
            &path[..pos]
        }
        _ => path,
    }
}

fn bundle_key(vendor_id: u16, product_id: u16, serial: Option<&str>, path: &str) -> String {
    match serial.filter(|s| !s.is_empty()) {
        Some(serial) => format!("{vendor_id:04x}:{product_id:04x}:{serial}"),
        None => format!("{vendor_id:04x}:{product_id:04x}@{}", path_stem(path)),
    }
}

/// One enumerated HID interface, detached from hidapi so grouping can be
/// tested without hardware.
#[derive(Debug, Clone)]
struct InterfaceInfo {
    path: CString,
    vendor_id: u16,
    product_id: u16,
    usage_page: u16,
    usage: u16,
    serial: Option<String>,
    product: Option<String>,
}

fn group_interfaces(interfaces: Vec<InterfaceInfo>) -> Vec<DeviceBundle> {
    let mut bundles: BTreeMap<String, DeviceBundle> = BTreeMap::new();
    for iface in interfaces {
        if iface.vendor_id != LOGITECH_VID {
            continue;
        }
        let path = iface.path.to_string_lossy().into_owned();
        let key = bundle_key(iface.vendor_id, iface.product_id, iface.serial.as_deref(), &path);
        let bundle = bundles.entry(key.clone()).or_insert_with(|| DeviceBundle {
            transport_id: key,
            vendor_id: iface.vendor_id,
            product_id: iface.product_id,
            product: iface.product.clone(),
            serial: iface.serial.clone(),
            kind: ReceiverFamily::from_pid(iface.product_id)
                .map_or(BundleKind::Device, BundleKind::Receiver),
            hidpp_path: None,
            mouse_path: None,
            keyboard_path: None,
        });
        match (iface.usage_page, iface.usage) {
            (HIDPP_USAGE_PAGE, _) => {
                // Windows exposes short and long HID++ collections separately;
                // either node accepts both report ids for writes.
                bundle.hidpp_path.get_or_insert(iface.path);
            }
            (GENERIC_DESKTOP_USAGE_PAGE, MOUSE_USAGE) => {
                bundle.mouse_path.get_or_insert(iface.path);
            }
            (GENERIC_DESKTOP_USAGE_PAGE, KEYBOARD_USAGE) => {
                bundle.keyboard_path.get_or_insert(iface.path);
            }
            _ => {}
        }
    }
    bundles
        .into_values()
        .filter(|b| b.hidpp_path.is_some())
        .collect()
}

/// Enumerator backed by hidapi.
#[derive(Debug, Default)]
pub struct HidapiEnumerator;

impl HidapiEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceEnumerator for HidapiEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceBundle>> {
        debug!("Starting HID device enumeration");
        let api = hidapi::HidApi::new()?;
        let interfaces = api
            .device_list()
            .filter(|info| info.vendor_id() == LOGITECH_VID)
            .map(|info| InterfaceInfo {
                path: info.path().to_owned(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                usage_page: info.usage_page(),
                usage: info.usage(),
                serial: info.serial_number().map(str::to_string),
                product: info.product_string().map(str::to_string),
            })
            .collect();
        let bundles = group_interfaces(interfaces);
        for bundle in &bundles {
            info!(
                label = %bundle.label(),
                pid = format_args!("0x{:04X}", bundle.product_id),
                receiver = bundle.is_receiver(),
                transport_id = %bundle.transport_id,
                "Found Logitech device"
            );
        }
        debug!(count = bundles.len(), "Device enumeration complete");
        Ok(bundles)
    }

    fn open(&self, bundle: &DeviceBundle) -> Result<Arc<dyn HidTransport>> {
        let api = hidapi::HidApi::new()?;
        let hidpp_path = bundle
            .hidpp_path
            .as_deref()
            .ok_or_else(|| Error::DeviceNotFound(format!("{} has no HID++ interface", bundle.label())))?;
        let writer = api.open_path(hidpp_path)?;
        let reader = api.open_path(hidpp_path)?;
        let open_optional = |path: &Option<CString>, what: &str| {
            path.as_deref().and_then(|p| match api.open_path(p) {
                Ok(device) => Some(device),
                Err(e) => {
                    warn!(label = %bundle.label(), interface = what, error = %e, "Cannot open interface");
                    None
                }
            })
        };
        let mouse = open_optional(&bundle.mouse_path, "mouse");
        let keyboard = open_optional(&bundle.keyboard_path, "keyboard");
        info!(
            label = %bundle.label(),
            pid = format_args!("0x{:04X}", bundle.product_id),
            "Device opened"
        );
        Ok(Arc::new(UsbTransport::new(writer, reader, mouse, keyboard)))
    }
}

/// Enumerate every Logitech device bundle on the system.
pub fn discover_devices() -> Result<Vec<DeviceBundle>> {
    HidapiEnumerator::new().enumerate()
}
