//! BLE transport over a GATT client.
//!
//! HID++ over GATT has no report id byte: the characteristic carries the
//! report kind. The transport adds the id on the way in and strips it on the
//! way out so the dispatcher sees the same frames as over USB.

use crate::error::{Result, TransportError};
use crate::hidpp::{LONG_REPORT_ID, SHORT_REPORT_ID};
use crate::transport::{HidTransport, SubLink};
use std::time::Duration;
use tracing::trace;

/// Report id used for HID mouse reports once re-framed.
pub const MOUSE_REPORT_ID: u8 = 0x02;
/// Report id used for HID keyboard reports once re-framed.
pub const KEYBOARD_REPORT_ID: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattCharacteristic {
    HidppShort,
    HidppLong,
    MouseReport,
    KeyboardReport,
}

impl GattCharacteristic {
    fn report_id(self) -> u8 {
        match self {
            GattCharacteristic::HidppShort => SHORT_REPORT_ID,
            GattCharacteristic::HidppLong => LONG_REPORT_ID,
            GattCharacteristic::MouseReport => MOUSE_REPORT_ID,
            GattCharacteristic::KeyboardReport => KEYBOARD_REPORT_ID,
        }
    }

    fn for_link(link: SubLink) -> &'static [GattCharacteristic] {
        match link {
            SubLink::Hidpp => &[GattCharacteristic::HidppShort, GattCharacteristic::HidppLong],
            SubLink::Mouse => &[GattCharacteristic::MouseReport],
            SubLink::Keyboard => &[GattCharacteristic::KeyboardReport],
        }
    }
}

/// The BLE central the harness drives. Implemented outside this crate.
pub trait GattClient: Send + Sync {
    fn write(&self, characteristic: GattCharacteristic, value: &[u8]) -> Result<()>;

    /// Next notification from any of `characteristics`.
    fn next_notification(
        &self,
        characteristics: &[GattCharacteristic],
        timeout: Duration,
    ) -> Result<Option<(GattCharacteristic, Vec<u8>)>>;
}

pub struct BleTransport<G> {
    client: G,
}

impl<G: GattClient> BleTransport<G> {
    pub fn new(client: G) -> Self {
        Self { client }
    }
}

impl<G: GattClient> HidTransport for BleTransport<G> {
    fn write_report(&self, data: &[u8]) -> Result<()> {
        let characteristic = match data.first() {
            Some(&SHORT_REPORT_ID) => GattCharacteristic::HidppShort,
            Some(&LONG_REPORT_ID) => GattCharacteristic::HidppLong,
            other => {
                return Err(TransportError::Hid(format!(
                    "cannot write report id {other:02X?} over GATT"
                ))
                .into())
            }
        };
        trace!(
            characteristic = ?characteristic,
            report_hex = format_args!("{:02X?}", data),
            "GATT write"
        );
        self.client.write(characteristic, &data[1..])
    }

    fn read_report(&self, link: SubLink, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some((characteristic, value)) = self
            .client
            .next_notification(GattCharacteristic::for_link(link), timeout)?
        else {
            return Ok(None);
        };
        let mut report = Vec::with_capacity(value.len() + 1);
        report.push(characteristic.report_id());
        report.extend_from_slice(&value);
        Ok(Some(report))
    }

    fn sub_links(&self) -> Vec<SubLink> {
        vec![SubLink::Hidpp, SubLink::Mouse, SubLink::Keyboard]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeGatt {
        writes: Mutex<Vec<(GattCharacteristic, Vec<u8>)>>,
        notifications: Mutex<Vec<(GattCharacteristic, Vec<u8>)>>,
    }

    impl GattClient for FakeGatt {
        fn write(&self, characteristic: GattCharacteristic, value: &[u8]) -> Result<()> {
            self.writes.lock().push((characteristic, value.to_vec()));
            Ok(())
        }

        fn next_notification(
            &self,
            characteristics: &[GattCharacteristic],
            _timeout: Duration,
        ) -> Result<Option<(GattCharacteristic, Vec<u8>)>> {
            let mut pending = self.notifications.lock();
            let pos = pending.iter().position(|(c, _)| characteristics.contains(c));
            Ok(pos.map(|p| pending.remove(p)))
        }
    }

    #[test]
    fn write_strips_report_id() {
        let transport = BleTransport::new(FakeGatt::default());
        transport
            .write_report(&[0x11, 0xFF, 0x05, 0x10, 0x01])
            .unwrap();
        let writes = transport.client.writes.lock();
        assert_eq!(writes[0].0, GattCharacteristic::HidppLong);
        assert_eq!(writes[0].1, vec![0xFF, 0x05, 0x10, 0x01]);
    }

    #[test]
    fn write_rejects_non_hidpp() {
        let transport = BleTransport::new(FakeGatt::default());
        assert!(transport.write_report(&[0x02, 0x00]).is_err());
    }

    #[test]
    fn read_restores_report_id_per_link() {
        let gatt = FakeGatt::default();
        gatt.notifications
            .lock()
            .push((GattCharacteristic::MouseReport, vec![0x01, 0x00]));
        gatt.notifications
            .lock()
            .push((GattCharacteristic::HidppShort, vec![0xFF, 0x00, 0x00, 0, 0, 0]));
        let transport = BleTransport::new(gatt);

        let hidpp = transport
            .read_report(SubLink::Hidpp, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(hidpp[0], SHORT_REPORT_ID);
        assert_eq!(hidpp.len(), 7);

        let mouse = transport
            .read_report(SubLink::Mouse, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(mouse, vec![MOUSE_REPORT_ID, 0x01, 0x00]);
        assert!(transport
            .read_report(SubLink::Keyboard, Duration::ZERO)
            .unwrap()
            .is_none());
    }
}
