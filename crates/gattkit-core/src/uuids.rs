//! Well-known GATT UUIDs and conversions between the 16-bit and 128-bit forms

use uuid::Uuid;

/// Bluetooth base UUID `00000000-0000-1000-8000-00805F9B34FB`
pub const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

const SHORT_MASK: u128 = 0xFFFF_FFFF << 96;

/// Expands a SIG-assigned 16-bit UUID
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expands a SIG-assigned 32-bit UUID
pub const fn from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Returns the 16-bit alias of `uuid`, if it has one
pub fn as_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !SHORT_MASK != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// ATT wire form: 2 bytes for 16-bit aliases, 16 bytes otherwise, little endian
pub fn to_att_bytes(uuid: &Uuid) -> Vec<u8> {
    match as_u16(uuid) {
        Some(short) => short.to_le_bytes().to_vec(),
        None => uuid.as_u128().to_le_bytes().to_vec(),
    }
}

/// Parses the ATT wire form (2, 4 or 16 little-endian bytes)
pub fn from_att_bytes(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Some(from_u16(u16::from_le_bytes([bytes[0], bytes[1]]))),
        4 => Some(from_u32(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
        16 => {
            let mut raw = [0u8; 16];
            raw.copy_from_slice(bytes);
            Some(Uuid::from_u128(u128::from_le_bytes(raw)))
        }
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// Attribute Types
// ----------------------------------------------------------------------------

pub const PRIMARY_SERVICE: Uuid = from_u16(0x2800);
pub const SECONDARY_SERVICE: Uuid = from_u16(0x2801);
pub const INCLUDE: Uuid = from_u16(0x2802);
pub const CHARACTERISTIC: Uuid = from_u16(0x2803);

// ----------------------------------------------------------------------------
// Descriptors
// ----------------------------------------------------------------------------

pub const CHARACTERISTIC_EXTENDED_PROPERTIES: Uuid = from_u16(0x2900);
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = from_u16(0x2901);
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2902);
pub const SERVER_CHARACTERISTIC_CONFIGURATION: Uuid = from_u16(0x2903);
pub const CHARACTERISTIC_PRESENTATION_FORMAT: Uuid = from_u16(0x2904);
pub const CHARACTERISTIC_AGGREGATE_FORMAT: Uuid = from_u16(0x2905);

// ----------------------------------------------------------------------------
// Services and Characteristics
// ----------------------------------------------------------------------------

pub const GENERIC_ACCESS: Uuid = from_u16(0x1800);
pub const GENERIC_ATTRIBUTE: Uuid = from_u16(0x1801);
pub const DEVICE_INFORMATION: Uuid = from_u16(0x180A);
pub const BATTERY_SERVICE: Uuid = from_u16(0x180F);
pub const HEART_RATE: Uuid = from_u16(0x180D);

pub const DEVICE_NAME: Uuid = from_u16(0x2A00);
pub const APPEARANCE: Uuid = from_u16(0x2A01);
pub const SERVICE_CHANGED: Uuid = from_u16(0x2A05);
pub const BATTERY_LEVEL: Uuid = from_u16(0x2A19);
pub const MANUFACTURER_NAME_STRING: Uuid = from_u16(0x2A29);
pub const HEART_RATE_MEASUREMENT: Uuid = from_u16(0x2A37);

/// Attribute types that may never appear as descriptors
pub fn is_declaration(uuid: &Uuid) -> bool {
    *uuid == PRIMARY_SERVICE || *uuid == SECONDARY_SERVICE || *uuid == INCLUDE || *uuid == CHARACTERISTIC
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
