//! Protocol enumerations shared by the codec, the receiver helpers and pairing.
//!
//! Values that arrive from the wire use a catch-all variant so unknown codes
//! survive decoding and show up verbatim in logs.

use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

/// HID++ 1.0 register error codes (sub-id 0x8F, byte 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Hidpp1ErrorCode {
    Success = 0x00,
    InvalidSubId = 0x01,
    InvalidAddress = 0x02,
    InvalidValue = 0x03,
    ConnectFail = 0x04,
    TooManyDevices = 0x05,
    AlreadyExists = 0x06,
    Busy = 0x07,
    UnknownDevice = 0x08,
    ResourceError = 0x09,
    RequestUnavailable = 0x0A,
    InvalidParamValue = 0x0B,
    WrongPinCode = 0x0C,
    #[num_enum(catch_all)]
    Other(u8),
}

/// HID++ 2.0 feature error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Hidpp2ErrorCode {
    NoError = 0x00,
    Unknown = 0x01,
    InvalidArgument = 0x02,
    OutOfRange = 0x03,
    HwError = 0x04,
    LogitechInternal = 0x05,
    InvalidFeatureIndex = 0x06,
    InvalidFunctionId = 0x07,
    Busy = 0x08,
    Unsupported = 0x09,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Radio protocol announced in `DeviceConnection` and discovery notifications.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum LogitechProtocol {
    Unknown = 0x00,
    Bluetooth = 0x01,
    Mhz27 = 0x02,
    QuadEquad = 0x03,
    EquadStep4Dj = 0x04,
    DfuLite = 0x05,
    EquadStep4Lite = 0x06,
    EquadStep4Gaming = 0x07,
    EquadStep4Gamepads = 0x08,
    Gotthard = 0x09,
    DaggerRom = 0x0A,
    UnifyingV2 = 0x0B,
    Ls1_0 = 0x0C,
    Ls1_1 = 0x0D,
    Ls2Llpm = 0x0E,
    Ls2Ca = 0x0F,
    BlePro = 0x10,
    Ls2CaCrc24 = 0x11,
    #[num_enum(catch_all)]
    Other(u8),
}

/// One-bit link status carried in `DeviceConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Established,
    NotEstablished,
}

impl LinkStatus {
    pub fn from_bit(bit: u64) -> Self {
        if bit == 0 {
            Self::Established
        } else {
            Self::NotEstablished
        }
    }

    pub fn bit(self) -> u64 {
        match self {
            Self::Established => 0,
            Self::NotEstablished => 1,
        }
    }
}

/// Device kind nibble from connection and discovery notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeviceType {
    Unknown = 0x00,
    Keyboard = 0x01,
    Mouse = 0x02,
    Numpad = 0x03,
    Presenter = 0x04,
    Remote = 0x07,
    Trackball = 0x08,
    Touchpad = 0x09,
    #[num_enum(catch_all)]
    Other(u8),
}

/// `DeviceDisconnection` type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DisconnectionType {
    Transient = 0x00,
    Permanent = 0x01,
    #[num_enum(catch_all)]
    Other(u8),
}

/// `PairingStatus.device_pairing_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PairingStatusCode {
    Start = 0x00,
    Stop = 0x01,
    Cancel = 0x02,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Error type shared by `PairingStatus` and `DiscoveryStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StatusErrorType {
    NoError = 0x00,
    Timeout = 0x01,
    Failed = 0x02,
    #[num_enum(catch_all)]
    Other(u8),
}

/// `DiscoveryStatus.device_discovery_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DiscoveryStatusCode {
    Start = 0x00,
    Stop = 0x01,
    #[num_enum(catch_all)]
    Other(u8),
}

/// `DisplayPassKeyKey.key_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PasskeyKeyCode {
    EntryStarted = 0x00,
    DigitEntered = 0x01,
    DigitErased = 0x02,
    Cleared = 0x03,
    EntryCompleted = 0x04,
    #[num_enum(catch_all)]
    Other(u8),
}

/// `PerformDeviceConnection.connect_devices`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectState {
    Pairing = 0x01,
    CancelPairing = 0x02,
    Unpairing = 0x03,
}

/// `PerformDeviceDiscovery.discovery_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive)]
#[repr(u8)]
pub enum DiscoveryOption {
    Start = 0x01,
    Cancel = 0x02,
}

/// Authentication capability bitmap advertised in discovery and stored in
/// the receiver bond chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BleProAuthentication {
    NoAuth = 0x00,
    KeyboardPasskey = 0x01,
    TwoButtonsPasskey = 0x02,
    #[num_enum(catch_all)]
    Other(u8),
}

/// Host OS the device believes it is bonded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OsDetectedType {
    Unknown = 0,
    Undetermined = 1,
    Osx = 2,
    Ios = 3,
    LogitechBlePro = 4,
    LogitechUndetermined = 5,
    Chrome = 6,
    Android = 7,
    Linux = 8,
    WebOs = 9,
    TizenTv = 10,
    #[num_enum(catch_all)]
    Other(u8),
}
