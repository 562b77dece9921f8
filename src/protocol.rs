use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

/// GATT service exposed by the BMS.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// Status responses arrive as notifications on this characteristic.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
/// Command frames are written to this characteristic.
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe2_0000_1000_8000_00805f9b34fb);

pub const MIN_RESPONSE_LENGTH: usize = 104;
pub const MAX_CELLS: usize = 16;
pub const RESPONSE_MARKER: u8 = 0x65;

const RESPONSE_MARKER_OFFSET: usize = 2;
const COMMAND_LENGTH: usize = 8;
const CHECKSUM_BASE: u8 = 0x04;

/// Heat state bit signalling that discharging has been switched off.
pub const HEAT_STATE_DISCHARGE_DISABLED: u32 = 0x0000_0080;

pub const BATTERY_STATE_IDLE: u16 = 0x0000;
pub const BATTERY_STATE_CHARGING: u16 = 0x0001;
pub const BATTERY_STATE_DISCHARGING: u16 = 0x0002;
pub const BATTERY_STATE_CHARGE_DISABLED: u16 = 0x0004;

/// Protection bits, lowest bit first.
pub const PROTECTION_FLAGS: [(u32, &str); 9] = [
    (0x0000_0004, "Overcharge"),
    (0x0000_0020, "Overdischarge"),
    (0x0000_0040, "ChargeOvercurrent"),
    (0x0000_0080, "DischargeOvercurrent"),
    (0x0000_0100, "ChargeHighTemperature"),
    (0x0000_0200, "DischargeHighTemperature"),
    (0x0000_0400, "ChargeLowTemperature"),
    (0x0000_0800, "DischargeLowTemperature"),
    (0x0000_4000, "ShortCircuit"),
];

pub const FLAGS_OK: &str = "OK";

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}

fn read_u16(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_i16(buffer: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buffer[offset], buffer[offset + 1]])
}

fn read_u32(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

fn read_i32(buffer: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// The closed set of commands understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    QueryStatus = 0x13,
    ChargeOn = 0x0A,
    ChargeOff = 0x0B,
    DischargeOn = 0x0C,
    DischargeOff = 0x0D,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn charge(enable: bool) -> Self {
        if enable {
            Command::ChargeOn
        } else {
            Command::ChargeOff
        }
    }

    pub fn discharge(enable: bool) -> Self {
        if enable {
            Command::DischargeOn
        } else {
            Command::DischargeOff
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::QueryStatus => write!(f, "query status"),
            Command::ChargeOn => write!(f, "charge on"),
            Command::ChargeOff => write!(f, "charge off"),
            Command::DischargeOn => write!(f, "discharge on"),
            Command::DischargeOff => write!(f, "discharge off"),
        }
    }
}

/// An encoded 8 byte command: `[0x00, 0x00, 0x04, 0x01, CMD, 0x55, 0xAA, CHECKSUM]`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; COMMAND_LENGTH]);

impl CommandFrame {
    pub fn encode(command: Command) -> Self {
        let code = command.code();
        Self([
            0x00,
            0x00,
            0x04,
            0x01,
            code,
            0x55,
            0xAA,
            CHECKSUM_BASE.wrapping_add(code),
        ])
    }

    pub fn checksum(&self) -> u8 {
        self.0[COMMAND_LENGTH - 1]
    }
}

impl Deref for CommandFrame {
    type Target = [u8; COMMAND_LENGTH];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

pub fn encode(command: Command) -> CommandFrame {
    CommandFrame::encode(command)
}

/// Interpretation of the battery state register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryState {
    Idle,
    Charging,
    Discharging,
    ChargeDisabled,
    Unknown(u16),
}

impl From<u16> for BatteryState {
    fn from(code: u16) -> Self {
        match code {
            BATTERY_STATE_IDLE => BatteryState::Idle,
            BATTERY_STATE_CHARGING => BatteryState::Charging,
            BATTERY_STATE_DISCHARGING => BatteryState::Discharging,
            BATTERY_STATE_CHARGE_DISABLED => BatteryState::ChargeDisabled,
            other => BatteryState::Unknown(other),
        }
    }
}

/// One decoded status response. All values are raw register units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    pub total_voltage_mv: u32,
    pub cell_voltages_mv: [u16; MAX_CELLS],
    /// Negative while discharging.
    pub current_ma: i32,
    pub cell_temperature_c: i16,
    pub mosfet_temperature_c: i16,
    /// Ah/100
    pub remaining_capacity_cah: u16,
    /// Ah/100
    pub full_capacity_cah: u16,
    pub heat_state: u32,
    pub protection_flags: u32,
    pub failure_flags: u32,
    pub balancing_flags: u32,
    pub battery_state: u16,
    pub soc_percent: u16,
    pub soh_percent: u16,
    pub discharge_cycles: u32,
    pub total_discharge_mah: u32,
}

impl StatusFrame {
    /// Decodes a complete status response.
    ///
    /// The buffer must be at least [`MIN_RESPONSE_LENGTH`] bytes long and carry
    /// [`RESPONSE_MARKER`] at offset 2. Multi-byte values are little-endian.
    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, DecodeError> {
        validate_len(rx_buffer)?;
        validate_marker(rx_buffer)?;

        let mut cell_voltages_mv = [0u16; MAX_CELLS];
        for (n_cell, cell) in cell_voltages_mv.iter_mut().enumerate() {
            *cell = read_u16(rx_buffer, 16 + n_cell * 2);
            log::trace!("Cell #{} mv={}", n_cell + 1, cell);
        }

        Ok(Self {
            total_voltage_mv: read_u32(rx_buffer, 12),
            cell_voltages_mv,
            current_ma: read_i32(rx_buffer, 48),
            cell_temperature_c: read_i16(rx_buffer, 52),
            mosfet_temperature_c: read_i16(rx_buffer, 54),
            remaining_capacity_cah: read_u16(rx_buffer, 62),
            full_capacity_cah: read_u16(rx_buffer, 64),
            heat_state: read_u32(rx_buffer, 68),
            protection_flags: read_u32(rx_buffer, 76),
            failure_flags: read_u32(rx_buffer, 80),
            balancing_flags: read_u32(rx_buffer, 84),
            battery_state: read_u16(rx_buffer, 88),
            soc_percent: read_u16(rx_buffer, 90),
            soh_percent: read_u16(rx_buffer, 92),
            discharge_cycles: read_u32(rx_buffer, 96),
            total_discharge_mah: read_u32(rx_buffer, 100),
        })
    }

    pub fn battery_state(&self) -> BatteryState {
        BatteryState::from(self.battery_state)
    }

    pub fn discharge_disabled(&self) -> bool {
        self.heat_state & HEAT_STATE_DISCHARGE_DISABLED != 0
    }

    /// Balancing state of each of the first `n_cells` cells.
    pub fn balancing_cells(&self, n_cells: usize) -> Vec<bool> {
        (0..n_cells.min(32))
            .map(|n_cell| read_bit!(self.balancing_flags, n_cell))
            .collect()
    }
}

pub fn decode(rx_buffer: &[u8]) -> std::result::Result<StatusFrame, DecodeError> {
    StatusFrame::decode(rx_buffer)
}

fn validate_len(buffer: &[u8]) -> std::result::Result<(), DecodeError> {
    if buffer.len() < MIN_RESPONSE_LENGTH {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            MIN_RESPONSE_LENGTH,
            buffer.len()
        );
        return Err(DecodeError::TooShort { len: buffer.len() });
    }
    Ok(())
}

fn validate_marker(buffer: &[u8]) -> std::result::Result<(), DecodeError> {
    let marker = buffer[RESPONSE_MARKER_OFFSET];
    if marker != RESPONSE_MARKER {
        log::warn!(
            "Invalid marker - expected={:02X?} received={:02X?}",
            RESPONSE_MARKER,
            marker
        );
        return Err(DecodeError::WrongMarker { marker });
    }
    Ok(())
}

/// Translates a bitfield into labels using a `(mask, label)` table.
///
/// A zero bitfield yields `["OK"]`. Labels follow table order; bits missing
/// from the table are reported last as one `Unknown(0x........)` label.
pub fn decode_flags(bits: u32, table: &[(u32, &str)]) -> Vec<String> {
    if bits == 0 {
        return vec![FLAGS_OK.to_string()];
    }
    let mut labels = Vec::new();
    let mut known = 0u32;
    for (mask, label) in table {
        known |= mask;
        if bits & mask != 0 {
            labels.push(label.to_string());
        }
    }
    let unknown = bits & !known;
    if unknown != 0 {
        labels.push(format!("Unknown(0x{unknown:08X})"));
    }
    labels
}

pub fn decode_protection_flags(bits: u32) -> Vec<String> {
    decode_flags(bits, &PROTECTION_FLAGS)
}

/// The failure bitfield has no published bit assignment, so a non-zero
/// value is reported as one raw `Error: 0x........` label.
pub fn decode_failure_flags(bits: u32) -> Vec<String> {
    if bits == 0 {
        return vec![FLAGS_OK.to_string()];
    }
    vec![format!("Error: 0x{bits:08X}")]
}

/// Reassembles status responses that the BLE stack splits across notifications.
///
/// A notification carrying the marker at offset 2 opens a new response, later
/// ones are appended while a response is open. Short unmarked notifications
/// with nothing open are dropped.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buffer: Vec<u8>,
}

impl ResponseAssembler {
    /// Feeds one notification; returns the full response once enough bytes arrived.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if chunk.len() > RESPONSE_MARKER_OFFSET && chunk[RESPONSE_MARKER_OFFSET] == RESPONSE_MARKER
        {
            self.buffer.clear();
            self.buffer.extend_from_slice(chunk);
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(chunk);
        } else if chunk.len() >= MIN_RESPONSE_LENGTH {
            // full sized but unmarked, let decode reject it
            return Some(chunk.to_vec());
        } else {
            log::debug!("Ignoring non-status notification ({} bytes)", chunk.len());
            return None;
        }

        if self.buffer.len() >= MIN_RESPONSE_LENGTH {
            log::trace!("Complete response: {} bytes", self.buffer.len());
            Some(std::mem::take(&mut self.buffer))
        } else {
            log::trace!(
                "Buffered {}/{} bytes",
                self.buffer.len(),
                MIN_RESPONSE_LENGTH
            );
            None
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    impl StatusFrame {
        /// Lays the frame out at the wire offsets, for feeding fake transports.
        pub(crate) fn to_bytes(&self) -> Vec<u8> {
            let mut buffer = vec![0u8; MIN_RESPONSE_LENGTH];
            buffer[RESPONSE_MARKER_OFFSET] = RESPONSE_MARKER;
            buffer[12..16].copy_from_slice(&self.total_voltage_mv.to_le_bytes());
            for (n_cell, mv) in self.cell_voltages_mv.iter().enumerate() {
                let offset = 16 + n_cell * 2;
                buffer[offset..offset + 2].copy_from_slice(&mv.to_le_bytes());
            }
            buffer[48..52].copy_from_slice(&self.current_ma.to_le_bytes());
            buffer[52..54].copy_from_slice(&self.cell_temperature_c.to_le_bytes());
            buffer[54..56].copy_from_slice(&self.mosfet_temperature_c.to_le_bytes());
            buffer[62..64].copy_from_slice(&self.remaining_capacity_cah.to_le_bytes());
            buffer[64..66].copy_from_slice(&self.full_capacity_cah.to_le_bytes());
            buffer[68..72].copy_from_slice(&self.heat_state.to_le_bytes());
            buffer[76..80].copy_from_slice(&self.protection_flags.to_le_bytes());
            buffer[80..84].copy_from_slice(&self.failure_flags.to_le_bytes());
            buffer[84..88].copy_from_slice(&self.balancing_flags.to_le_bytes());
            buffer[88..90].copy_from_slice(&self.battery_state.to_le_bytes());
            buffer[90..92].copy_from_slice(&self.soc_percent.to_le_bytes());
            buffer[92..94].copy_from_slice(&self.soh_percent.to_le_bytes());
            buffer[96..100].copy_from_slice(&self.discharge_cycles.to_le_bytes());
            buffer[100..104].copy_from_slice(&self.total_discharge_mah.to_le_bytes());
            buffer
        }
    }

    /// A resting 4S pack at 80% SOC.
    pub(crate) fn resting_4s() -> StatusFrame {
        let mut cell_voltages_mv = [0u16; MAX_CELLS];
        cell_voltages_mv[..4].copy_from_slice(&[3300, 3310, 3290, 3305]);
        StatusFrame {
            total_voltage_mv: 13205,
            cell_voltages_mv,
            current_ma: 0,
            cell_temperature_c: 21,
            mosfet_temperature_c: 23,
            remaining_capacity_cah: 8000,
            full_capacity_cah: 10000,
            heat_state: 0,
            protection_flags: 0,
            failure_flags: 0,
            balancing_flags: 0,
            battery_state: BATTERY_STATE_IDLE,
            soc_percent: 80,
            soh_percent: 100,
            discharge_cycles: 12,
            total_discharge_mah: 1_234_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frames() {
        let expected: [(Command, [u8; 8]); 5] = [
            (Command::QueryStatus, [0x00, 0x00, 0x04, 0x01, 0x13, 0x55, 0xAA, 0x17]),
            (Command::ChargeOn, [0x00, 0x00, 0x04, 0x01, 0x0A, 0x55, 0xAA, 0x0E]),
            (Command::ChargeOff, [0x00, 0x00, 0x04, 0x01, 0x0B, 0x55, 0xAA, 0x0F]),
            (Command::DischargeOn, [0x00, 0x00, 0x04, 0x01, 0x0C, 0x55, 0xAA, 0x10]),
            (Command::DischargeOff, [0x00, 0x00, 0x04, 0x01, 0x0D, 0x55, 0xAA, 0x11]),
        ];
        for (command, bytes) in expected {
            let frame = encode(command);
            assert_eq!(*frame, bytes, "{command}");
            assert_eq!(frame.checksum(), 0x04u8.wrapping_add(command.code()));
        }
    }

    #[test]
    fn test_switch_commands() {
        assert_eq!(Command::charge(true), Command::ChargeOn);
        assert_eq!(Command::charge(false), Command::ChargeOff);
        assert_eq!(Command::discharge(true), Command::DischargeOn);
        assert_eq!(Command::discharge(false), Command::DischargeOff);
    }

    #[test]
    fn test_decode_too_short() {
        for len in [0, 1, 3, 50, MIN_RESPONSE_LENGTH - 1] {
            let mut buffer = vec![0xFF; len];
            if len > 2 {
                buffer[2] = RESPONSE_MARKER;
            }
            assert_eq!(decode(&buffer), Err(DecodeError::TooShort { len }));
        }
    }

    #[test]
    fn test_decode_wrong_marker() {
        let mut buffer = fixtures::resting_4s().to_bytes();
        buffer[2] = 0x64;
        assert_eq!(
            decode(&buffer),
            Err(DecodeError::WrongMarker { marker: 0x64 })
        );
        buffer.extend_from_slice(&[0u8; 20]);
        assert_eq!(
            decode(&buffer),
            Err(DecodeError::WrongMarker { marker: 0x64 })
        );
    }

    #[test]
    fn test_decode_known_offsets() {
        let mut buffer = vec![0u8; MIN_RESPONSE_LENGTH];
        buffer[2] = RESPONSE_MARKER;
        buffer[12..16].copy_from_slice(&[0x88, 0x13, 0x00, 0x00]);
        buffer[16..18].copy_from_slice(&[0xE4, 0x0C]); // 3300
        buffer[46..48].copy_from_slice(&[0xE5, 0x0C]); // 3301
        buffer[48..52].copy_from_slice(&(-2500i32).to_le_bytes());
        buffer[52..54].copy_from_slice(&(-5i16).to_le_bytes());
        buffer[54..56].copy_from_slice(&[0x1E, 0x00]);
        buffer[62..64].copy_from_slice(&[0x10, 0x27]);
        buffer[64..66].copy_from_slice(&[0x20, 0x4E]);
        buffer[68..72].copy_from_slice(&[0x80, 0x00, 0x00, 0x00]);
        buffer[76..80].copy_from_slice(&[0x44, 0x00, 0x00, 0x00]);
        buffer[80..84].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        buffer[84..88].copy_from_slice(&[0x03, 0x00, 0x00, 0x00]);
        buffer[88..90].copy_from_slice(&[0x02, 0x00]);
        buffer[90..92].copy_from_slice(&[0x4B, 0x00]);
        buffer[92..94].copy_from_slice(&[0x63, 0x00]);
        buffer[96..100].copy_from_slice(&[0x2C, 0x01, 0x00, 0x00]);
        buffer[100..104].copy_from_slice(&[0x40, 0x42, 0x0F, 0x00]);

        let frame = decode(&buffer).unwrap();
        assert_eq!(frame.total_voltage_mv, 5000);
        assert_eq!(frame.cell_voltages_mv[0], 3300);
        assert_eq!(frame.cell_voltages_mv[1], 0);
        assert_eq!(frame.cell_voltages_mv[15], 3301);
        assert_eq!(frame.current_ma, -2500);
        assert_eq!(frame.cell_temperature_c, -5);
        assert_eq!(frame.mosfet_temperature_c, 30);
        assert_eq!(frame.remaining_capacity_cah, 10000);
        assert_eq!(frame.full_capacity_cah, 20000);
        assert_eq!(frame.heat_state, 0x80);
        assert!(frame.discharge_disabled());
        assert_eq!(frame.protection_flags, 0x44);
        assert_eq!(frame.failure_flags, 0x0001_0000);
        assert_eq!(frame.balancing_flags, 0x03);
        assert_eq!(frame.battery_state(), BatteryState::Discharging);
        assert_eq!(frame.soc_percent, 75);
        assert_eq!(frame.soh_percent, 99);
        assert_eq!(frame.discharge_cycles, 300);
        assert_eq!(frame.total_discharge_mah, 1_000_000);
    }

    #[test]
    fn test_decode_matches_fixture() {
        let frame = fixtures::resting_4s();
        assert_eq!(decode(&frame.to_bytes()), Ok(frame));
    }

    #[test]
    fn test_protection_flags() {
        assert_eq!(
            decode_protection_flags(0x0000_0044),
            vec!["Overcharge", "ChargeOvercurrent"]
        );
        assert_eq!(decode_protection_flags(0), vec!["OK"]);
        assert_eq!(
            decode_protection_flags(0x0001_4000),
            vec!["ShortCircuit", "Unknown(0x00010000)"]
        );
    }

    #[test]
    fn test_failure_flags() {
        assert_eq!(decode_failure_flags(0), vec!["OK"]);
        assert_eq!(
            decode_failure_flags(0x0000_0011),
            vec!["Error: 0x00000011"]
        );
        assert_eq!(
            decode_failure_flags(0x8000_0000),
            vec!["Error: 0x80000000"]
        );
    }

    #[test]
    fn test_balancing_cells() {
        let mut frame = fixtures::resting_4s();
        frame.balancing_flags = 0b1010;
        assert_eq!(frame.balancing_cells(4), vec![false, true, false, true]);
    }

    #[test]
    fn test_battery_state_codes() {
        assert_eq!(BatteryState::from(0), BatteryState::Idle);
        assert_eq!(BatteryState::from(1), BatteryState::Charging);
        assert_eq!(BatteryState::from(4), BatteryState::ChargeDisabled);
        assert_eq!(BatteryState::from(9), BatteryState::Unknown(9));
    }

    #[test]
    fn test_assembler_fragmented() {
        let bytes = fixtures::resting_4s().to_bytes();
        let mut assembler = ResponseAssembler::default();
        assert_eq!(assembler.push(&bytes[..20]), None);
        assert_eq!(assembler.buffered(), 20);
        assert_eq!(assembler.push(&bytes[20..60]), None);
        assert_eq!(assembler.push(&bytes[60..]), Some(bytes.clone()));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_assembler_ignores_stray_notification() {
        let mut assembler = ResponseAssembler::default();
        assert_eq!(assembler.push(&[0x01, 0x02, 0x03, 0x04]), None);
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn test_assembler_passes_full_unmarked_notification() {
        let mut bytes = fixtures::resting_4s().to_bytes();
        bytes[2] = 0x00;
        let mut assembler = ResponseAssembler::default();
        let complete = assembler.push(&bytes).unwrap();
        assert_eq!(
            decode(&complete),
            Err(DecodeError::WrongMarker { marker: 0x00 })
        );
    }

    #[test]
    fn test_assembler_restarts_on_marker() {
        let bytes = fixtures::resting_4s().to_bytes();
        let mut assembler = ResponseAssembler::default();
        assert_eq!(assembler.push(&bytes[..30]), None);
        // a fresh response header discards the partial one
        assert_eq!(assembler.push(&bytes[..30]), None);
        assert_eq!(assembler.buffered(), 30);
        assert_eq!(assembler.push(&bytes[30..]), Some(bytes));
    }
}
