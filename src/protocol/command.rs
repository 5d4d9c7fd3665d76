//! Command identifiers.

use std::fmt;

/// Request command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Sync = 0x00,
    /// Response tag, never valid as a request.
    Response = 0x01,
    Restart = 0x02,
    GetHardwareId = 0x10,
    SetHardwareId = 0x11,
    GetFirmware = 0x12,
    GetSerialNumber = 0x13,
    SetSerialNumber = 0x14,
    GetTemperature = 0x20,
    GetTempThreshold = 0x21,
    SetTempThreshold = 0x22,
    SetIv = 0x2D,
    OpenPort = 0x2E,
    ClosePort = 0x2F,
    SeqSetState = 0x60,
    SeqGetTriggerConfig = 0x61,
    SeqSetTriggerConfig = 0x62,
    SeqGetMaxChannels = 0x63,
    SeqSetMaxChannels = 0x64,
    SeqGetRepeatCount = 0x65,
    SeqSetRepeatCount = 0x66,
    SeqGetSteps = 0x67,
    SeqSetSteps = 0x68,
    SeqGetDc = 0x69,
    SeqSetDc = 0x6A,
    SeqClearSteps = 0x6B,
    SeqSingleStep = 0x6C,
    SeqGetLedDurations = 0x6D,
    SeqSetLedDurations = 0x6E,
    SeqOverCurrent = 0x6F,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Sync),
            0x01 => Some(Self::Response),
            0x02 => Some(Self::Restart),
            0x10 => Some(Self::GetHardwareId),
            0x11 => Some(Self::SetHardwareId),
            0x12 => Some(Self::GetFirmware),
            0x13 => Some(Self::GetSerialNumber),
            0x14 => Some(Self::SetSerialNumber),
            0x20 => Some(Self::GetTemperature),
            0x21 => Some(Self::GetTempThreshold),
            0x22 => Some(Self::SetTempThreshold),
            0x2D => Some(Self::SetIv),
            0x2E => Some(Self::OpenPort),
            0x2F => Some(Self::ClosePort),
            0x60 => Some(Self::SeqSetState),
            0x61 => Some(Self::SeqGetTriggerConfig),
            0x62 => Some(Self::SeqSetTriggerConfig),
            0x63 => Some(Self::SeqGetMaxChannels),
            0x64 => Some(Self::SeqSetMaxChannels),
            0x65 => Some(Self::SeqGetRepeatCount),
            0x66 => Some(Self::SeqSetRepeatCount),
            0x67 => Some(Self::SeqGetSteps),
            0x68 => Some(Self::SeqSetSteps),
            0x69 => Some(Self::SeqGetDc),
            0x6A => Some(Self::SeqSetDc),
            0x6B => Some(Self::SeqClearSteps),
            0x6C => Some(Self::SeqSingleStep),
            0x6D => Some(Self::SeqGetLedDurations),
            0x6E => Some(Self::SeqSetLedDurations),
            0x6F => Some(Self::SeqOverCurrent),
            _ => None,
        }
    }

    /// Session-control commands reset the replay counter and are deciphered
    /// with the factory-default IV.
    pub fn is_session_control(self) -> bool {
        matches!(self, Self::SetIv | Self::OpenPort | Self::ClosePort)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({:#04x})", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip() {
        for v in 0u8..=0xFF {
            if let Some(cmd) = Command::from_u8(v) {
                assert_eq!(cmd as u8, v);
            }
        }
        assert_eq!(Command::from_u8(0x00), Some(Command::Sync));
        assert_eq!(Command::from_u8(0x6F), Some(Command::SeqOverCurrent));
        assert_eq!(Command::from_u8(0x70), None);
    }

    #[test]
    fn test_session_control_set() {
        assert!(Command::SetIv.is_session_control());
        assert!(Command::OpenPort.is_session_control());
        assert!(Command::ClosePort.is_session_control());
        assert!(!Command::Sync.is_session_control());
        assert!(!Command::SeqSetState.is_session_control());
    }
}
