//! HID transport abstraction.
//!
//! A transport owns one physical link and exposes it as up to three
//! sub-links: the HID++ control endpoint plus the mouse and keyboard report
//! endpoints. Writes always go to the HID++ endpoint; reads are per
//! sub-link so each can get its own reader thread.

use crate::error::{Result, TransportError};
use hidapi::HidDevice;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{trace, warn};

/// Largest input report we expect on any interface.
pub const MAX_REPORT_LEN: usize = 64;

/// Logical endpoint of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubLink {
    Hidpp,
    Mouse,
    Keyboard,
}

impl SubLink {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubLink::Hidpp => "hidpp",
            SubLink::Mouse => "mouse",
            SubLink::Keyboard => "keyboard",
        }
    }
}

/// Abstraction over a raw HID link.
pub trait HidTransport: Send + Sync {
    /// Write one complete report, report id included.
    fn write_report(&self, data: &[u8]) -> Result<()>;

    /// Read one report from `link`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn read_report(&self, link: SubLink, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Sub-links this transport can read from.
    fn sub_links(&self) -> Vec<SubLink>;
}

/// USB transport over hidapi.
///
/// The HID++ interface is opened twice so the reader thread never holds the
/// handle a writer needs.
pub struct UsbTransport {
    hidpp_writer: Mutex<HidDevice>,
    hidpp_reader: Mutex<HidDevice>,
    mouse: Option<Mutex<HidDevice>>,
    keyboard: Option<Mutex<HidDevice>>,
}

impl UsbTransport {
    pub fn new(
        hidpp_writer: HidDevice,
        hidpp_reader: HidDevice,
        mouse: Option<HidDevice>,
        keyboard: Option<HidDevice>,
    ) -> Self {
        Self {
            hidpp_writer: Mutex::new(hidpp_writer),
            hidpp_reader: Mutex::new(hidpp_reader),
            mouse: mouse.map(Mutex::new),
            keyboard: keyboard.map(Mutex::new),
        }
    }

    fn reader(&self, link: SubLink) -> Option<&Mutex<HidDevice>> {
        match link {
            SubLink::Hidpp => Some(&self.hidpp_reader),
            SubLink::Mouse => self.mouse.as_ref(),
            SubLink::Keyboard => self.keyboard.as_ref(),
        }
    }
}

/// A frame is only sent when the HID layer took all of it.
fn check_write(expected: usize, written: usize) -> Result<()> {
    if written < expected {
        warn!(expected = expected, written = written, "Short HID write");
        return Err(TransportError::ShortWrite { expected, written }.into());
    }
    Ok(())
}

impl HidTransport for UsbTransport {
    fn write_report(&self, data: &[u8]) -> Result<()> {
        let written = self.hidpp_writer.lock().write(data)?;
        check_write(data.len(), written)
    }

    fn read_report(&self, link: SubLink, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let Some(device) = self.reader(link) else {
            return Err(TransportError::Hid(format!("no {} interface", link.as_str())).into());
        };
        let mut buf = [0u8; MAX_REPORT_LEN];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let n = device.lock().read_timeout(&mut buf, millis)?;
        if n == 0 {
            return Ok(None);
        }
        trace!(
            link = link.as_str(),
            report_hex = format_args!("{:02X?}", &buf[..n]),
            "USB read"
        );
        Ok(Some(buf[..n].to_vec()))
    }

    fn sub_links(&self) -> Vec<SubLink> {
        let mut links = vec![SubLink::Hidpp];
        if self.mouse.is_some() {
            links.push(SubLink::Mouse);
        }
        if self.keyboard.is_some() {
            links.push(SubLink::Keyboard);
        }
        links
    }
}

/// A scriptable transport for tests.
///
/// Requests are matched against registered rules with the software-id
/// nibble masked, and responses echo the caller's nibble back, so rules do
/// not depend on which tag the channel picked.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::hidpp::{LONG_REPORT_ID, LONG_REPORT_LEN, SHORT_REPORT_ID, SHORT_REPORT_LEN};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

    struct Rule {
        request: Vec<u8>,
        responses: Vec<Vec<u8>>,
    }

    struct Hold {
        count: usize,
        held: Vec<Vec<u8>>,
    }

    /// Mock transport with rule-based responses and injectable reports.
    pub struct MockTransport {
        inbound_tx: flume::Sender<Vec<u8>>,
        inbound_rx: flume::Receiver<Vec<u8>>,
        rules: Mutex<Vec<Rule>>,
        responder: Mutex<Option<Responder>>,
        written: Mutex<Vec<Vec<u8>>>,
        hold: Mutex<Option<Hold>>,
        delay: Mutex<Option<Duration>>,
        silent: AtomicBool,
    }

    fn is_feature_report(data: &[u8]) -> bool {
        data.len() > 3 && data[2] < 0x80
    }

    fn masked(data: &[u8]) -> Vec<u8> {
        let mut key = data.to_vec();
        if is_feature_report(&key) {
            key[3] &= 0xF0;
        }
        key
    }

    fn echo_software_id(request: &[u8], mut response: Vec<u8>) -> Vec<u8> {
        if !is_feature_report(request) || response.len() < 5 {
            return response;
        }
        let sw = request[3] & 0x0F;
        if response[2] == 0xFF {
            response[4] = (response[4] & 0xF0) | sw;
        } else if response[2] < 0x80 {
            response[3] = (response[3] & 0xF0) | sw;
        }
        response
    }

    fn frame(report_id: u8, header: [u8; 3], params: &[u8]) -> Vec<u8> {
        let len = if report_id == SHORT_REPORT_ID {
            SHORT_REPORT_LEN
        } else {
            LONG_REPORT_LEN
        };
        let mut data = vec![report_id, header[0], header[1], header[2]];
        data.extend_from_slice(params);
        data.resize(len, 0);
        data
    }

    impl MockTransport {
        pub fn new() -> Self {
            let (inbound_tx, inbound_rx) = flume::unbounded();
            Self {
                inbound_tx,
                inbound_rx,
                rules: Mutex::new(Vec::new()),
                responder: Mutex::new(None),
                written: Mutex::new(Vec::new()),
                hold: Mutex::new(None),
                delay: Mutex::new(None),
                silent: AtomicBool::new(false),
            }
        }

        /// Register responses for a request.
        pub fn on_request(&self, request: Vec<u8>, responses: Vec<Vec<u8>>) {
            self.rules.lock().push(Rule {
                request: masked(&request),
                responses,
            });
        }

        /// Register a short HID++ response for a short request.
        pub fn on_short_request(
            &self,
            device_idx: u8,
            feature_idx: u8,
            function_sw: u8,
            req_params: &[u8],
            resp_params: &[u8],
        ) {
            let header = [device_idx, feature_idx, function_sw];
            self.on_request(
                frame(SHORT_REPORT_ID, header, req_params),
                vec![frame(SHORT_REPORT_ID, header, resp_params)],
            );
        }

        /// Register a long HID++ response; the request is short when its
        /// parameters fit.
        pub fn on_long_request(
            &self,
            device_idx: u8,
            feature_idx: u8,
            function_sw: u8,
            req_params: &[u8],
            resp_params: &[u8],
        ) {
            let header = [device_idx, feature_idx, function_sw];
            let req_id = if req_params.len() <= SHORT_REPORT_LEN - 4 {
                SHORT_REPORT_ID
            } else {
                LONG_REPORT_ID
            };
            self.on_request(
                frame(req_id, header, req_params),
                vec![frame(LONG_REPORT_ID, header, resp_params)],
            );
        }

        /// Compute responses with a closure when no rule matches.
        pub fn set_responder(&self, responder: impl Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static) {
            *self.responder.lock() = Some(Box::new(responder));
        }

        /// Push an unsolicited report to the reader.
        pub fn inject(&self, data: Vec<u8>) {
            let _ = self.inbound_tx.send(data);
        }

        /// Hold the next `count` responses and deliver them in reverse order.
        pub fn hold_and_reverse(&self, count: usize) {
            *self.hold.lock() = Some(Hold {
                count,
                held: Vec::new(),
            });
        }

        /// Deliver every response after `delay`.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock() = delay;
        }

        /// Swallow every write without answering.
        pub fn set_silent(&self, silent: bool) {
            self.silent.store(silent, Ordering::SeqCst);
        }

        /// Every report written so far.
        pub fn written(&self) -> Vec<Vec<u8>> {
            self.written.lock().clone()
        }

        fn responses_for(&self, data: &[u8]) -> Vec<Vec<u8>> {
            let key = masked(data);
            let from_rule = self
                .rules
                .lock()
                .iter()
                .find(|rule| rule.request == key)
                .map(|rule| rule.responses.clone());
            let responses = match from_rule {
                Some(responses) => responses,
                None => match self.responder.lock().as_ref() {
                    Some(responder) => responder(data),
                    None => Vec::new(),
                },
            };
            responses
                .into_iter()
                .map(|r| echo_software_id(data, r))
                .collect()
        }

        fn deliver(&self, responses: Vec<Vec<u8>>) {
            let delay = *self.delay.lock();
            match delay {
                Some(delay) => {
                    let tx = self.inbound_tx.clone();
                    thread::spawn(move || {
                        thread::sleep(delay);
                        for r in responses {
                            let _ = tx.send(r);
                        }
                    });
                }
                None => {
                    for r in responses {
                        let _ = self.inbound_tx.send(r);
                    }
                }
            }
        }
    }

    impl HidTransport for MockTransport {
        fn write_report(&self, data: &[u8]) -> Result<()> {
            self.written.lock().push(data.to_vec());
            if self.silent.load(Ordering::SeqCst) {
                return Ok(());
            }
            let responses = self.responses_for(data);

            let mut hold = self.hold.lock();
            if let Some(h) = hold.as_mut() {
                h.held.extend(responses);
                if h.held.len() >= h.count {
                    let mut held = std::mem::take(&mut h.held);
                    held.reverse();
                    *hold = None;
                    drop(hold);
                    self.deliver(held);
                }
                return Ok(());
            }
            drop(hold);
            self.deliver(responses);
            Ok(())
        }

        fn read_report(&self, link: SubLink, timeout: Duration) -> Result<Option<Vec<u8>>> {
            if link != SubLink::Hidpp {
                thread::sleep(timeout);
                return Ok(None);
            }
            match self.inbound_rx.recv_timeout(timeout) {
                Ok(data) => Ok(Some(data)),
                Err(_) => Ok(None),
            }
        }

        fn sub_links(&self) -> Vec<SubLink> {
            vec![SubLink::Hidpp]
        }
    }
}
