//! BLE Pro pairing through a receiver.
//!
//! [`PairingSession`] is a pure state machine: it consumes
//! [`PairingInput`]s and records every transition. [`pair_device`] drives a
//! session against a live receiver channel, stimulating the device through
//! a [`UserActionEmulator`] and retrying failed attempts.

use crate::channel::{Channel, ChannelId};
use crate::codec::{Message, Schema};
use crate::config::PairingConfig;
use crate::error::{CodecError, Error, PairingError, Result, TransportError};
use crate::manager::ChannelManager;
use crate::messages::hidpp10::AuthMethod;
use crate::messages::notifications::{
    DeviceConnection, DisplayPassKeyKey, PairingStatus, RequestDisplayPassKey, DEVICE_CONNECTION,
    DEVICE_DISCOVERY, DISPLAY_PASSKEY_KEY, PAIRING_STATUS, REQUEST_DISPLAY_PASSKEY,
};
use crate::protocol::{LinkStatus, LogitechProtocol, PairingStatusCode, PasskeyKeyCode, StatusErrorType};
use crate::queue::QueueName;
use crate::receiver::{self, format_address};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bits in the binary passkey shown for the two-button method.
pub const BINARY_PASSKEY_BITS: u8 = 20;

/// Maximum authentication entropy for either method.
pub const MAX_ENTROPY: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingState {
    Idle,
    Discovering,
    AddressKnown,
    PairingStarted,
    AwaitingPasskey,
    DigitStart,
    /// Passkey entry underway; `remaining` entropy bits still to enter.
    EnteringDigits { remaining: u8 },
    EnterComplete,
    Completing,
    AwaitingLink { slot: u8 },
    Done { slot: u8 },
    Cancelled,
    FailedTimeout,
    FailedOther,
}

impl PairingState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Discovering => "DISCOVERING",
            Self::AddressKnown => "ADDRESS_KNOWN",
            Self::PairingStarted => "PAIRING_STARTED",
            Self::AwaitingPasskey => "AWAITING_PASSKEY",
            Self::DigitStart => "DIGIT_START",
            Self::EnteringDigits { .. } => "ENTERING_DIGITS",
            Self::EnterComplete => "ENTER_COMPLETE",
            Self::Completing => "COMPLETING",
            Self::AwaitingLink { .. } => "AWAITING_LINK",
            Self::Done { .. } => "DONE",
            Self::Cancelled => "CANCELLED",
            Self::FailedTimeout => "FAILED_TIMEOUT",
            Self::FailedOther => "FAILED_OTHER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Cancelled | Self::FailedTimeout | Self::FailedOther
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::FailedTimeout | Self::FailedOther)
    }

    /// How long the driver waits for the next input in this state.
    pub fn stage_timeout(&self, config: &PairingConfig) -> Duration {
        match self {
            Self::Discovering
            | Self::AddressKnown
            | Self::PairingStarted
            | Self::AwaitingPasskey
            | Self::DigitStart => config.start_timeout(),
            Self::EnterComplete | Self::Completing => config.stop_timeout(),
            _ => config.pairing_timeout(),
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnteringDigits { remaining } => write!(f, "{}(remaining={remaining})", self.name()),
            Self::AwaitingLink { slot } | Self::Done { slot } => write!(f, "{}(slot={slot})", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Everything that can move a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingInput {
    StartDiscovery,
    /// A caller-supplied address; the BLE PID is checked on link-up if known.
    AddressGiven {
        address: [u8; 6],
        bluetooth_pid: Option<u16>,
    },
    Discovered {
        address: [u8; 6],
        protocol: LogitechProtocol,
        bluetooth_pid: u16,
    },
    /// Register ack of `PerformDeviceConnection(pairing)`.
    PairingRequested,
    /// The receiver answered the pairing request with an error.
    PairingRejected,
    Status(PairingStatus),
    Passkey(RequestDisplayPassKey),
    Key(DisplayPassKeyKey),
    Connection(DeviceConnection),
    Timeout,
}

impl PairingInput {
    /// Map a receiver notification to an input. Other classes give `None`.
    pub fn from_message(message: &Message) -> std::result::Result<Option<Self>, CodecError> {
        Ok(if message.is(&PAIRING_STATUS) {
            Some(Self::Status(PairingStatus::try_from(message)?))
        } else if message.is(&REQUEST_DISPLAY_PASSKEY) {
            Some(Self::Passkey(RequestDisplayPassKey::try_from(message)?))
        } else if message.is(&DISPLAY_PASSKEY_KEY) {
            Some(Self::Key(DisplayPassKeyKey::try_from(message)?))
        } else if message.is(&DEVICE_CONNECTION) {
            Some(Self::Connection(DeviceConnection::try_from(message)?))
        } else {
            None
        })
    }

    fn address(&self) -> Option<[u8; 6]> {
        match self {
            Self::Status(s) => Some(s.bluetooth_address),
            Self::Passkey(p) => Some(p.bluetooth_address),
            Self::Key(k) => Some(k.bluetooth_address),
            _ => None,
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: PairingState,
    pub to: PairingState,
    pub at: Instant,
}

/// Reject entropy values the authentication method cannot carry.
pub fn validate_entropy(method: AuthMethod, entropy: u8) -> std::result::Result<(), PairingError> {
    let valid = match method {
        AuthMethod::TwoButton => (1..=MAX_ENTROPY).contains(&entropy),
        AuthMethod::Passkey => (4..=MAX_ENTROPY).contains(&entropy) && entropy % 4 == 0,
    };
    if valid {
        Ok(())
    } else {
        Err(PairingError::InvalidEntropy {
            method: method.name(),
            entropy,
        })
    }
}

pub struct PairingSession {
    method: AuthMethod,
    entropy: u8,
    protocol: LogitechProtocol,
    max_wrong_messages: u32,
    state: PairingState,
    address: Option<[u8; 6]>,
    bluetooth_pid: Option<u16>,
    passkey: Option<String>,
    wrong_messages: u32,
    started_at: Instant,
    history: Vec<Transition>,
}

impl PairingSession {
    pub fn new(
        method: AuthMethod,
        entropy: u8,
        protocol: LogitechProtocol,
        max_wrong_messages: u32,
    ) -> std::result::Result<Self, PairingError> {
        validate_entropy(method, entropy)?;
        Ok(Self {
            method,
            entropy,
            protocol,
            max_wrong_messages,
            state: PairingState::Idle,
            address: None,
            bluetooth_pid: None,
            passkey: None,
            wrong_messages: 0,
            started_at: Instant::now(),
            history: Vec::new(),
        })
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn entropy(&self) -> u8 {
        self.entropy
    }

    pub fn address(&self) -> Option<[u8; 6]> {
        self.address
    }

    pub fn bluetooth_pid(&self) -> Option<u16> {
        self.bluetooth_pid
    }

    /// Passkey digits from `RequestDisplayPassKey`.
    pub fn passkey(&self) -> Option<&str> {
        self.passkey.as_deref()
    }

    pub fn wrong_messages(&self) -> u32 {
        self.wrong_messages
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Feed one input. Every input is accepted in every state; inputs that
    /// mean nothing in the current state leave it unchanged.
    pub fn step(&mut self, input: PairingInput) -> PairingState {
        if self.state.is_terminal() {
            return self.state;
        }
        if let (Some(expected), Some(got)) = (self.address, input.address()) {
            if got != [0; 6] && got != expected {
                debug!(
                    state = %self.state,
                    address = %format_address(&got),
                    "Ignoring notification for another device"
                );
                return self.state;
            }
        }
        let next = self.next_state(&input);
        if next != self.state {
            let transition = Transition {
                from: self.state,
                to: next,
                at: Instant::now(),
            };
            info!(
                from = %transition.from,
                to = %transition.to,
                elapsed_ms = transition.at.duration_since(self.started_at).as_millis() as u64,
                "Pairing transition"
            );
            self.history.push(transition);
            self.state = next;
        }
        self.state
    }

    fn next_state(&mut self, input: &PairingInput) -> PairingState {
        use PairingState::*;

        if let PairingInput::Status(status) = input {
            match (status.status, status.error_type) {
                (PairingStatusCode::Cancel, _) => return Cancelled,
                (PairingStatusCode::Stop, StatusErrorType::Timeout) => return FailedTimeout,
                (PairingStatusCode::Stop, StatusErrorType::NoError) => {}
                (PairingStatusCode::Stop, _) => return FailedOther,
                _ => {}
            }
        }
        if *input == PairingInput::Timeout {
            return match self.state {
                Idle | Discovering => Idle,
                AwaitingLink { .. } => FailedOther,
                _ => FailedTimeout,
            };
        }

        let bits = self.method.bits_per_action();
        match (self.state, input) {
            (Idle, PairingInput::StartDiscovery) => Discovering,
            (Idle, PairingInput::AddressGiven { address, bluetooth_pid }) => {
                self.address = Some(*address);
                self.bluetooth_pid = *bluetooth_pid;
                AddressKnown
            }
            (
                Discovering,
                PairingInput::Discovered {
                    address,
                    protocol,
                    bluetooth_pid,
                },
            ) if *protocol == self.protocol => {
                self.address = Some(*address);
                self.bluetooth_pid = Some(*bluetooth_pid);
                AddressKnown
            }
            (AddressKnown, PairingInput::PairingRequested) => PairingStarted,
            (AddressKnown, PairingInput::PairingRejected) => FailedOther,
            (PairingStarted, PairingInput::Status(s)) if s.status == PairingStatusCode::Start => {
                AwaitingPasskey
            }
            (AwaitingPasskey, PairingInput::Passkey(request)) => {
                self.passkey = Some(request.passkey.clone());
                DigitStart
            }
            (DigitStart, PairingInput::Key(key)) if key.key_code == PasskeyKeyCode::EntryStarted => {
                EnteringDigits {
                    remaining: self.entropy,
                }
            }
            (EnteringDigits { remaining }, PairingInput::Key(key)) => match key.key_code {
                PasskeyKeyCode::DigitEntered => match remaining.saturating_sub(bits) {
                    0 => EnterComplete,
                    left => EnteringDigits { remaining: left },
                },
                PasskeyKeyCode::DigitErased => EnteringDigits {
                    remaining: (remaining + bits).min(self.entropy),
                },
                PasskeyKeyCode::Cleared => EnteringDigits {
                    remaining: self.entropy,
                },
                PasskeyKeyCode::EntryCompleted => Completing,
                _ => self.state,
            },
            (EnterComplete, PairingInput::Key(key)) => match key.key_code {
                PasskeyKeyCode::EntryCompleted => Completing,
                PasskeyKeyCode::DigitErased => EnteringDigits {
                    remaining: bits.min(self.entropy),
                },
                PasskeyKeyCode::Cleared => EnteringDigits {
                    remaining: self.entropy,
                },
                _ => self.state,
            },
            (EnterComplete | Completing, PairingInput::Status(s)) if s.status == PairingStatusCode::Stop => {
                match s.pairing_slot {
                    0 => FailedOther,
                    slot => AwaitingLink { slot },
                }
            }
            (_, PairingInput::Status(s)) if s.status == PairingStatusCode::Stop => FailedOther,
            (AwaitingLink { slot }, PairingInput::Connection(connection)) => {
                let pid_matches = self
                    .bluetooth_pid
                    .map_or(true, |pid| pid == connection.bluetooth_pid);
                if connection.device_index == slot
                    && connection.link_status == LinkStatus::Established
                    && pid_matches
                {
                    Done { slot }
                } else {
                    self.wrong_messages += 1;
                    warn!(
                        expected_slot = slot,
                        device_index = connection.device_index,
                        link_status = ?connection.link_status,
                        bluetooth_pid = format_args!("0x{:04X}", connection.bluetooth_pid),
                        wrong_messages = self.wrong_messages,
                        "Unexpected connection event after pairing"
                    );
                    if self.wrong_messages > self.max_wrong_messages {
                        FailedOther
                    } else {
                        self.state
                    }
                }
            }
            (state, other) => {
                debug!(state = %state, input = ?other, "Input ignored");
                state
            }
        }
    }

    /// Terminal failure as an error; `None` for non-failed states.
    pub fn failure(&self) -> Option<PairingError> {
        let previous = self.history.last().map_or(self.state, |t| t.from);
        match self.state {
            PairingState::FailedTimeout => Some(PairingError::Timeout {
                state: previous.name(),
            }),
            PairingState::FailedOther => Some(PairingError::Failed(format!(
                "failed in state {}",
                previous.name()
            ))),
            PairingState::Cancelled => Some(PairingError::Cancelled),
            _ => None,
        }
    }
}

/// A single user stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    LeftButton,
    RightButton,
    BothButtons,
    Key(u8),
    Backspace,
    Enter,
}

/// Hardware that presses buttons and keys on the device under test.
pub trait UserActionEmulator: Send + Sync {
    fn left_button(&self) -> Result<()>;
    fn right_button(&self) -> Result<()>;
    /// Both buttons together: the two-button end-of-sequence.
    fn both_buttons(&self) -> Result<()>;
    fn key(&self, digit: u8) -> Result<()>;
    fn backspace(&self) -> Result<()>;
    fn enter(&self) -> Result<()>;

    fn perform(&self, action: UserAction) -> Result<()> {
        match action {
            UserAction::LeftButton => self.left_button(),
            UserAction::RightButton => self.right_button(),
            UserAction::BothButtons => self.both_buttons(),
            UserAction::Key(digit) => self.key(digit),
            UserAction::Backspace => self.backspace(),
            UserAction::Enter => self.enter(),
        }
    }
}

/// The stimuli that reproduce `passkey`, end-of-sequence included.
///
/// The two-button method walks the 20-bit binary passkey from its most
/// significant bit (`1` = right, `0` = left). The keyboard method types
/// every decimal digit. The device only notifies the first `entropy` bits
/// worth of them.
pub fn user_actions(method: AuthMethod, passkey: &str) -> Vec<UserAction> {
    let digits: Vec<u8> = passkey
        .bytes()
        .map(|b| if b.is_ascii_digit() { b - b'0' } else { 0 })
        .collect();
    let mut actions = match method {
        AuthMethod::TwoButton => {
            let value = digits.iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d));
            (0..BINARY_PASSKEY_BITS)
                .rev()
                .map(|bit| {
                    if (value >> bit) & 1 == 1 {
                        UserAction::RightButton
                    } else {
                        UserAction::LeftButton
                    }
                })
                .collect::<Vec<_>>()
        }
        AuthMethod::Passkey => digits.into_iter().map(UserAction::Key).collect(),
    };
    actions.push(match method {
        AuthMethod::TwoButton => UserAction::BothButtons,
        AuthMethod::Passkey => UserAction::Enter,
    });
    actions
}

/// What to pair and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    /// Target address; discovered when `None`.
    pub address: Option<[u8; 6]>,
    pub method: AuthMethod,
    pub entropy: u8,
    pub protocol: LogitechProtocol,
}

impl PairingRequest {
    pub fn new(address: Option<[u8; 6]>, method: AuthMethod, entropy: u8) -> Self {
        Self {
            address,
            method,
            entropy,
            protocol: LogitechProtocol::BlePro,
        }
    }
}

/// A successful pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub slot: u8,
    pub channel: ChannelId,
    pub bluetooth_address: [u8; 6],
    pub attempts: u32,
}

fn pairing_filter() -> [&'static Schema; 3] {
    [&*PAIRING_STATUS, &*REQUEST_DISPLAY_PASSKEY, &*DISPLAY_PASSKEY_KEY]
}

struct Driver<'a> {
    receiver: &'a Channel,
    emulator: &'a dyn UserActionEmulator,
    config: &'a PairingConfig,
}

impl Driver<'_> {
    fn run(&self, session: &mut PairingSession) -> Result<()> {
        loop {
            match session.state() {
                PairingState::Idle => return Ok(()),
                state if state.is_terminal() => return Ok(()),
                PairingState::Discovering => self.discover(session)?,
                PairingState::AddressKnown => self.request(session)?,
                PairingState::EnteringDigits { .. } => self.enter_passkey(session)?,
                state => self.advance(session, state.stage_timeout(self.config))?,
            }
        }
    }

    fn discover(&self, session: &mut PairingSession) -> Result<()> {
        let timeout = self.config.start_timeout();
        receiver::start_discovery(self.receiver, timeout.as_secs().min(u64::from(u8::MAX)) as u8)?;
        match receiver::wait_for_discovered(self.receiver, session.protocol, timeout) {
            Ok(device) => {
                if let Err(e) = receiver::cancel_discovery(self.receiver) {
                    warn!(channel = %self.receiver.identifier(), error = %e, "Cancel discovery failed");
                }
                session.step(PairingInput::Discovered {
                    address: device.bluetooth_address,
                    protocol: device.protocol,
                    bluetooth_pid: device.bluetooth_pid,
                });
                Ok(())
            }
            Err(e) if matches!(e.root(), Error::Transport(TransportError::NoDevice)) => {
                session.step(PairingInput::Timeout);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn request(&self, session: &mut PairingSession) -> Result<()> {
        let address = session.address().unwrap_or_default();
        info!(
            channel = %self.receiver.identifier(),
            address = %format_address(&address),
            method = session.method().name(),
            entropy = session.entropy(),
            "Requesting pairing"
        );
        let input = match receiver::request_pairing(self.receiver, address, session.method(), session.entropy()) {
            Ok(()) => PairingInput::PairingRequested,
            Err(e) if matches!(e.root(), Error::Protocol(_)) => {
                warn!(channel = %self.receiver.identifier(), error = %e, "Pairing request rejected");
                PairingInput::PairingRejected
            }
            Err(e) if e.is_timeout() => {
                warn!(channel = %self.receiver.identifier(), error = %e, "Pairing request not acknowledged");
                PairingInput::Timeout
            }
            Err(e) => return Err(e),
        };
        session.step(input);
        Ok(())
    }

    /// Emit the passkey stimuli. While entropy remains, each stimulus waits
    /// for its `digit_entered`; after that the device stays silent.
    fn enter_passkey(&self, session: &mut PairingSession) -> Result<()> {
        let actions = user_actions(session.method(), session.passkey().unwrap_or_default());
        let Some((end, digits)) = actions.split_last() else {
            return Ok(());
        };
        let entering = |s: &PairingSession| {
            matches!(
                s.state(),
                PairingState::EnteringDigits { .. } | PairingState::EnterComplete
            )
        };
        for action in digits {
            if !entering(session) {
                return Ok(());
            }
            self.emulator.perform(*action)?;
            thread::sleep(self.config.keystroke_interval());
            if matches!(session.state(), PairingState::EnteringDigits { .. }) {
                self.advance(session, self.config.pairing_timeout())?;
            } else {
                self.drain(session)?;
            }
        }
        if entering(session) {
            self.emulator.perform(*end)?;
        }
        Ok(())
    }

    /// Step until the state changes or `timeout` runs out.
    fn advance(&self, session: &mut PairingSession, timeout: Duration) -> Result<()> {
        let start = session.state();
        let deadline = Instant::now() + timeout;
        while session.state() == start {
            match self.next_input(start, deadline)? {
                Some(input) => {
                    session.step(input);
                }
                None => {
                    session.step(PairingInput::Timeout);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Apply whatever is already queued.
    fn drain(&self, session: &mut PairingSession) -> Result<()> {
        while let Some(input) = self.next_input(session.state(), Instant::now())? {
            session.step(input);
        }
        Ok(())
    }

    fn next_input(&self, state: PairingState, deadline: Instant) -> Result<Option<PairingInput>> {
        let awaiting_link = matches!(state, PairingState::AwaitingLink { .. });
        let filter = pairing_filter();
        loop {
            if awaiting_link {
                if let Some(message) = self.receiver.get_only(
                    QueueName::ReceiverConnectionEvent,
                    &[&DEVICE_CONNECTION],
                    Duration::ZERO,
                    false,
                    true,
                )? {
                    if let Some(input) = PairingInput::from_message(&message)? {
                        return Ok(Some(input));
                    }
                    continue;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = if awaiting_link {
                remaining.min(self.receiver.config().reader_poll())
            } else {
                remaining
            };
            if let Some(message) =
                self.receiver
                    .get_only(QueueName::ReceiverEvent, &filter, wait, false, true)?
            {
                if let Some(input) = PairingInput::from_message(&message)? {
                    return Ok(Some(input));
                }
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Cancel a failed attempt and wait for the receiver to confirm.
    fn abort(&self) {
        if let Err(e) = receiver::cancel_pairing(self.receiver) {
            warn!(channel = %self.receiver.identifier(), error = %e, "Cancel pairing failed");
            return;
        }
        let deadline = Instant::now() + self.config.cancel_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .receiver
                .get_only(QueueName::ReceiverEvent, &[&PAIRING_STATUS], remaining, false, true)
            {
                Ok(Some(message)) => {
                    if matches!(
                        PairingStatus::try_from(&message).map(|s| s.status),
                        Ok(PairingStatusCode::Cancel)
                    ) {
                        debug!(channel = %self.receiver.identifier(), "Pairing cancel confirmed");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(channel = %self.receiver.identifier(), "No cancel notification");
                    break;
                }
                Err(e) => {
                    warn!(channel = %self.receiver.identifier(), error = %e, "Waiting for cancel failed");
                    break;
                }
            }
        }
    }

    fn clean(&self) {
        let mut filter = pairing_filter().to_vec();
        filter.push(&*DEVICE_DISCOVERY);
        self.receiver.clean_messages(QueueName::ReceiverEvent, &filter);
        self.receiver
            .clean_messages(QueueName::ReceiverConnectionEvent, &[&DEVICE_CONNECTION]);
    }
}

/// Pair a BLE Pro device through the receiver `receiver_id`.
///
/// Failed attempts are cancelled and retried up to `retry_count` times; a
/// cancellation by the receiver ends the loop. On success the new slot gets
/// a channel, which must answer a root lookup before this returns.
pub fn pair_device(
    manager: &ChannelManager,
    receiver_id: ChannelId,
    request: &PairingRequest,
    emulator: &dyn UserActionEmulator,
) -> Result<PairedDevice> {
    let config = &manager.config().pairing;
    let receiver_channel = manager
        .channel(receiver_id)
        .ok_or_else(|| Error::DeviceNotFound(format!("channel {receiver_id}")))?;
    let context = |e: Error| e.with_context(receiver_channel.identifier(), None);
    validate_entropy(request.method, request.entropy).map_err(|e| context(e.into()))?;
    receiver_channel.open()?;

    let driver = Driver {
        receiver: &receiver_channel,
        emulator,
        config,
    };
    let mut address = request.address;
    let mut bluetooth_pid = None;
    let attempts = config.retry_count.max(1);
    let mut last_failure = PairingError::Failed("no attempt made".into());

    for attempt in 1..=attempts {
        driver.clean();
        let mut session = PairingSession::new(
            request.method,
            request.entropy,
            request.protocol,
            config.max_wrong_messages,
        )
        .map_err(|e| context(e.into()))?;
        match address {
            Some(address) => session.step(PairingInput::AddressGiven {
                address,
                bluetooth_pid,
            }),
            None => session.step(PairingInput::StartDiscovery),
        };
        driver.run(&mut session)?;
        address = session.address();
        bluetooth_pid = session.bluetooth_pid();

        match session.state() {
            PairingState::Done { slot } => {
                let channel = finish(manager, receiver_id, slot)?;
                info!(
                    channel = %receiver_channel.identifier(),
                    slot = slot,
                    attempt = attempt,
                    "Pairing complete"
                );
                return Ok(PairedDevice {
                    slot,
                    channel,
                    bluetooth_address: session.address().unwrap_or_default(),
                    attempts: attempt,
                });
            }
            PairingState::Cancelled => return Err(context(PairingError::Cancelled.into())),
            state if state.is_failed() => {
                let failure = session
                    .failure()
                    .unwrap_or_else(|| PairingError::Failed(state.name().into()));
                warn!(
                    channel = %receiver_channel.identifier(),
                    attempt = attempt,
                    attempts = attempts,
                    error = %failure,
                    "Pairing attempt failed"
                );
                driver.abort();
                last_failure = failure;
            }
            state => {
                return Err(context(PairingError::Failed(format!("stopped in state {state}")).into()));
            }
        }
    }
    Err(context(last_failure.into()))
}

/// Create (or reuse) the slot's channel and prove the link carries traffic.
fn finish(manager: &ChannelManager, receiver_id: ChannelId, slot: u8) -> Result<ChannelId> {
    let id = manager.add_through_receiver(receiver_id, slot)?;
    let channel: Arc<Channel> = manager
        .channel(id)
        .ok_or_else(|| Error::DeviceNotFound(format!("channel {id}")))?;
    channel.dispatcher().features().clear();
    channel.open()?;
    channel.ping()?;
    Ok(id)
}

/// Clear `slot` on the receiver and drop its channel.
pub fn unpair_slot(manager: &ChannelManager, receiver_id: ChannelId, slot: u8) -> Result<()> {
    let receiver_channel = manager
        .channel(receiver_id)
        .ok_or_else(|| Error::DeviceNotFound(format!("channel {receiver_id}")))?;
    receiver_channel.open()?;
    receiver::unpair(&receiver_channel, slot, manager.config().unpair_timeout())?;
    receiver_channel.dispatcher().forget_slot(slot);
    if let Some(port_index) = receiver_channel.identifier().port_index {
        manager.remove_channel(port_index, Some(slot));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceType;
    use proptest::prelude::*;

    const ADDRESS: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];

    fn status(code: PairingStatusCode, error: StatusErrorType, slot: u8) -> PairingInput {
        PairingInput::Status(PairingStatus {
            status: code,
            error_type: error,
            bluetooth_address: ADDRESS,
            pairing_slot: slot,
        })
    }

    fn key(code: PasskeyKeyCode) -> PairingInput {
        PairingInput::Key(DisplayPassKeyKey {
            key_code: code,
            bluetooth_address: ADDRESS,
        })
    }

    fn connection(slot: u8, link: LinkStatus, pid: u16) -> PairingInput {
        PairingInput::Connection(DeviceConnection {
            device_index: slot,
            protocol: LogitechProtocol::BlePro,
            link_status: link,
            encrypted: true,
            device_type: DeviceType::Mouse,
            bluetooth_pid: pid,
        })
    }

    fn session(method: AuthMethod, entropy: u8) -> PairingSession {
        PairingSession::new(method, entropy, LogitechProtocol::BlePro, 3).unwrap()
    }

    /// Walk a session up to `DIGIT_START`.
    fn to_digit_start(session: &mut PairingSession) {
        session.step(PairingInput::StartDiscovery);
        session.step(PairingInput::Discovered {
            address: ADDRESS,
            protocol: LogitechProtocol::BlePro,
            bluetooth_pid: 0xB023,
        });
        session.step(PairingInput::PairingRequested);
        session.step(status(PairingStatusCode::Start, StatusErrorType::NoError, 0));
        session.step(PairingInput::Passkey(RequestDisplayPassKey {
            bluetooth_address: ADDRESS,
            passkey: "123456".into(),
        }));
        assert_eq!(session.state(), PairingState::DigitStart);
    }

    #[test]
    fn entropy_ranges() {
        assert!(validate_entropy(AuthMethod::TwoButton, 1).is_ok());
        assert!(validate_entropy(AuthMethod::TwoButton, 20).is_ok());
        assert!(validate_entropy(AuthMethod::TwoButton, 0).is_err());
        assert!(validate_entropy(AuthMethod::TwoButton, 21).is_err());
        assert!(validate_entropy(AuthMethod::Passkey, 8).is_ok());
        assert!(validate_entropy(AuthMethod::Passkey, 6).is_err());
        assert_eq!(
            validate_entropy(AuthMethod::Passkey, 24),
            Err(PairingError::InvalidEntropy {
                method: "passkey",
                entropy: 24
            })
        );
    }

    #[test]
    fn two_button_happy_path() {
        let mut s = session(AuthMethod::TwoButton, 4);
        to_digit_start(&mut s);
        assert_eq!(s.passkey(), Some("123456"));
        s.step(key(PasskeyKeyCode::EntryStarted));
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 4 });
        for _ in 0..3 {
            s.step(key(PasskeyKeyCode::DigitEntered));
        }
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 1 });
        s.step(key(PasskeyKeyCode::DigitEntered));
        assert_eq!(s.state(), PairingState::EnterComplete);
        s.step(key(PasskeyKeyCode::EntryCompleted));
        s.step(status(PairingStatusCode::Stop, StatusErrorType::NoError, 2));
        assert_eq!(s.state(), PairingState::AwaitingLink { slot: 2 });
        s.step(connection(2, LinkStatus::Established, 0xB023));
        assert_eq!(s.state(), PairingState::Done { slot: 2 });
        let names: Vec<_> = s.history().iter().map(|t| t.to.name()).collect();
        assert_eq!(
            names,
            [
                "DISCOVERING",
                "ADDRESS_KNOWN",
                "PAIRING_STARTED",
                "AWAITING_PASSKEY",
                "DIGIT_START",
                "ENTERING_DIGITS",
                "ENTERING_DIGITS",
                "ENTERING_DIGITS",
                "ENTERING_DIGITS",
                "ENTER_COMPLETE",
                "COMPLETING",
                "AWAITING_LINK",
                "DONE",
            ]
        );
        assert!(s.history().windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn passkey_backspace_restores_four_bits() {
        let mut s = session(AuthMethod::Passkey, 8);
        to_digit_start(&mut s);
        s.step(key(PasskeyKeyCode::EntryStarted));
        s.step(key(PasskeyKeyCode::DigitEntered));
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 4 });
        s.step(key(PasskeyKeyCode::DigitErased));
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 8 });
        s.step(key(PasskeyKeyCode::DigitErased));
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 8 });
        s.step(key(PasskeyKeyCode::DigitEntered));
        s.step(key(PasskeyKeyCode::DigitEntered));
        assert_eq!(s.state(), PairingState::EnterComplete);
        s.step(key(PasskeyKeyCode::DigitErased));
        assert_eq!(s.state(), PairingState::EnteringDigits { remaining: 4 });
    }

    #[test]
    fn cancel_and_stop_errors_from_any_state() {
        let mut s = session(AuthMethod::TwoButton, 4);
        to_digit_start(&mut s);
        s.step(status(PairingStatusCode::Cancel, StatusErrorType::NoError, 0));
        assert_eq!(s.state(), PairingState::Cancelled);
        assert_eq!(s.failure(), Some(PairingError::Cancelled));

        let mut s = session(AuthMethod::TwoButton, 4);
        to_digit_start(&mut s);
        s.step(status(PairingStatusCode::Stop, StatusErrorType::Timeout, 0));
        assert_eq!(s.state(), PairingState::FailedTimeout);
        assert_eq!(
            s.failure(),
            Some(PairingError::Timeout {
                state: "DIGIT_START"
            })
        );

        let mut s = session(AuthMethod::TwoButton, 4);
        to_digit_start(&mut s);
        s.step(status(PairingStatusCode::Stop, StatusErrorType::Failed, 0));
        assert_eq!(s.state(), PairingState::FailedOther);
    }

    #[test]
    fn wrong_connections_are_tolerated_up_to_the_limit() {
        let mut s = PairingSession::new(AuthMethod::TwoButton, 1, LogitechProtocol::BlePro, 2).unwrap();
        to_digit_start(&mut s);
        s.step(key(PasskeyKeyCode::EntryStarted));
        s.step(key(PasskeyKeyCode::DigitEntered));
        s.step(key(PasskeyKeyCode::EntryCompleted));
        s.step(status(PairingStatusCode::Stop, StatusErrorType::NoError, 1));
        s.step(connection(3, LinkStatus::Established, 0xB023));
        s.step(connection(1, LinkStatus::Established, 0xB999));
        assert_eq!(s.state(), PairingState::AwaitingLink { slot: 1 });
        assert_eq!(s.wrong_messages(), 2);
        s.step(connection(1, LinkStatus::NotEstablished, 0xB023));
        assert_eq!(s.state(), PairingState::FailedOther);
    }

    #[test]
    fn timeouts_per_state() {
        let mut s = session(AuthMethod::TwoButton, 4);
        s.step(PairingInput::StartDiscovery);
        s.step(PairingInput::Timeout);
        assert_eq!(s.state(), PairingState::Idle);

        let mut s = session(AuthMethod::TwoButton, 4);
        to_digit_start(&mut s);
        s.step(PairingInput::Timeout);
        assert_eq!(s.state(), PairingState::FailedTimeout);

        // unacknowledged pairing request
        let mut s = session(AuthMethod::TwoButton, 4);
        s.step(PairingInput::AddressGiven {
            address: ADDRESS,
            bluetooth_pid: None,
        });
        s.step(PairingInput::Timeout);
        assert_eq!(s.state(), PairingState::FailedTimeout);
        assert_eq!(
            s.failure(),
            Some(PairingError::Timeout {
                state: "ADDRESS_KNOWN"
            })
        );
    }

    #[test]
    fn notifications_for_other_addresses_are_ignored() {
        let mut s = session(AuthMethod::TwoButton, 4);
        s.step(PairingInput::AddressGiven {
            address: ADDRESS,
            bluetooth_pid: None,
        });
        s.step(PairingInput::PairingRequested);
        s.step(PairingInput::Status(PairingStatus {
            status: PairingStatusCode::Cancel,
            error_type: StatusErrorType::NoError,
            bluetooth_address: [1, 2, 3, 4, 5, 6],
            pairing_slot: 0,
        }));
        assert_eq!(s.state(), PairingState::PairingStarted);
    }

    #[test]
    fn discovery_of_other_protocol_is_ignored() {
        let mut s = session(AuthMethod::TwoButton, 4);
        s.step(PairingInput::StartDiscovery);
        s.step(PairingInput::Discovered {
            address: ADDRESS,
            protocol: LogitechProtocol::UnifyingV2,
            bluetooth_pid: 0x4082,
        });
        assert_eq!(s.state(), PairingState::Discovering);
    }

    #[test]
    fn two_button_actions_follow_binary_passkey() {
        // 000026 = 0b0000_0000_0000_0001_1010
        let actions = user_actions(AuthMethod::TwoButton, "000026");
        assert_eq!(actions.len(), 21);
        assert!(actions[..15].iter().all(|a| *a == UserAction::LeftButton));
        assert_eq!(
            &actions[15..],
            &[
                UserAction::RightButton,
                UserAction::RightButton,
                UserAction::LeftButton,
                UserAction::RightButton,
                UserAction::LeftButton,
                UserAction::BothButtons,
            ]
        );
    }

    #[test]
    fn keyboard_actions_type_digits_then_enter() {
        let actions = user_actions(AuthMethod::Passkey, "907134");
        assert_eq!(
            actions,
            vec![
                UserAction::Key(9),
                UserAction::Key(0),
                UserAction::Key(7),
                UserAction::Key(1),
                UserAction::Key(3),
                UserAction::Key(4),
                UserAction::Enter,
            ]
        );
    }

    fn any_input() -> impl Strategy<Value = PairingInput> {
        let code = prop_oneof![
            Just(PairingStatusCode::Start),
            Just(PairingStatusCode::Stop),
            Just(PairingStatusCode::Cancel),
        ];
        let error = prop_oneof![
            Just(StatusErrorType::NoError),
            Just(StatusErrorType::Timeout),
            Just(StatusErrorType::Failed),
        ];
        prop_oneof![
            Just(PairingInput::StartDiscovery),
            Just(PairingInput::AddressGiven {
                address: ADDRESS,
                bluetooth_pid: None
            }),
            Just(PairingInput::PairingRequested),
            Just(PairingInput::PairingRejected),
            Just(PairingInput::Timeout),
            Just(PairingInput::Passkey(RequestDisplayPassKey {
                bluetooth_address: ADDRESS,
                passkey: "000001".into(),
            })),
            (code, error, 0u8..4).prop_map(|(c, e, slot)| status(c, e, slot)),
            (0u8..6).prop_map(|c| key(PasskeyKeyCode::from(c))),
            (0u8..4, any::<bool>()).prop_map(|(slot, up)| connection(
                slot,
                if up { LinkStatus::Established } else { LinkStatus::NotEstablished },
                0xB023
            )),
        ]
    }

    proptest! {
        #[test]
        fn every_input_sequence_is_handled(
            inputs in proptest::collection::vec(any_input(), 0..64),
            entropy in 1u8..=20,
        ) {
            let mut s = session(AuthMethod::TwoButton, entropy);
            let mut terminal_at = None;
            for (i, input) in inputs.into_iter().enumerate() {
                let before = s.state();
                let after = s.step(input);
                if before.is_terminal() {
                    prop_assert_eq!(before, after);
                }
                if after.is_terminal() && terminal_at.is_none() {
                    terminal_at = Some((i, after));
                }
                if let PairingState::EnteringDigits { remaining } = after {
                    prop_assert!(remaining >= 1 && remaining <= entropy);
                }
            }
            if let Some((_, state)) = terminal_at {
                prop_assert_eq!(s.state(), state);
            }
            prop_assert!(s.history().iter().all(|t| t.from != t.to));
        }

        #[test]
        fn two_button_notification_count_matches_entropy(entropy in 1u8..=20) {
            let mut s = session(AuthMethod::TwoButton, entropy);
            to_digit_start(&mut s);
            s.step(key(PasskeyKeyCode::EntryStarted));
            let mut notified = 0;
            while matches!(s.state(), PairingState::EnteringDigits { .. }) {
                s.step(key(PasskeyKeyCode::DigitEntered));
                notified += 1;
            }
            prop_assert_eq!(notified, entropy);
            prop_assert_eq!(s.state(), PairingState::EnterComplete);
        }

        #[test]
        fn passkey_notification_count_is_a_quarter(quarters in 1u8..=5) {
            let entropy = quarters * 4;
            let mut s = session(AuthMethod::Passkey, entropy);
            to_digit_start(&mut s);
            s.step(key(PasskeyKeyCode::EntryStarted));
            let mut notified = 0;
            while matches!(s.state(), PairingState::EnteringDigits { .. }) {
                s.step(key(PasskeyKeyCode::DigitEntered));
                notified += 1;
            }
            prop_assert_eq!(notified, quarters);
        }
    }
}
