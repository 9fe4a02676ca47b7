//! Wire-exact types and codecs for the Ether Dream point-streaming protocol.
//!
//! The DAC announces itself with a 36-byte UDP broadcast and is driven over a
//! TCP control channel where every command is answered by a 22-byte response
//! carrying a 20-byte status block. All multi-byte integers on the wire are
//! little-endian.

use byteorder::{ByteOrder, LittleEndian};

/// The UDP port on which DACs broadcast their presence.
pub const BROADCAST_PORT: u16 = 7654;
/// The TCP port on which DACs accept a point stream.
pub const STREAM_PORT: u16 = 7765;

/// Size in bytes of a DAC broadcast packet.
pub const BROADCAST_BYTES: usize = 36;
/// Size in bytes of a DAC status block.
pub const STATUS_BYTES: usize = 20;
/// Size in bytes of a DAC command response.
pub const RESPONSE_BYTES: usize = 22;
/// Size in bytes of a single point on the wire.
pub const POINT_BYTES: usize = 18;
/// Size in bytes of the reply to a version query.
pub const VERSION_BYTES: usize = 32;

/// High bit of a point's `control` field: apply the queued point-rate change
/// when this point is consumed.
pub const CONTROL_RATE_CHANGE: u16 = 0x8000;

/// Command bytes accepted by the DAC.
pub mod command {
    /// Transition IDLE to PREPARED.
    pub const PREPARE: u8 = b'p';
    /// Start emitting points from the buffer.
    pub const BEGIN: u8 = b'b';
    /// Queue a point-rate change.
    pub const POINT_RATE: u8 = b'q';
    /// Write points into the buffer.
    pub const DATA: u8 = b'd';
    /// Query the firmware version string.
    pub const VERSION: u8 = b'v';
}

/// Response bytes returned by the DAC.
pub mod response {
    pub const ACK: u8 = b'a';
    pub const NAK_FULL: u8 = b'F';
    pub const NAK_INVALID: u8 = b'I';
    pub const NAK_STOP_CONDITION: u8 = b'!';
}

/// The playback engine states reported in a status block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Prepared,
    Playing,
    /// Any state byte outside the documented range.
    Invalid,
}

impl From<u8> for PlaybackState {
    fn from(byte: u8) -> Self {
        match byte {
            0 => PlaybackState::Idle,
            1 => PlaybackState::Prepared,
            2 => PlaybackState::Playing,
            _ => PlaybackState::Invalid,
        }
    }
}

/// The 20-byte status block embedded in every response and broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DacStatus {
    pub protocol: u8,
    pub light_engine_state: u8,
    pub playback_state: u8,
    pub source: u8,
    pub light_engine_flags: u16,
    pub playback_flags: u16,
    pub source_flags: u16,
    /// Points currently buffered in the DAC awaiting output.
    pub buffer_fullness: u16,
    /// The rate at which the DAC is consuming points, in points per second.
    pub point_rate: u32,
    /// Total points emitted since the playback session began.
    pub point_count: u32,
}

impl DacStatus {
    pub fn read_from(bytes: &[u8; STATUS_BYTES]) -> Self {
        DacStatus {
            protocol: bytes[0],
            light_engine_state: bytes[1],
            playback_state: bytes[2],
            source: bytes[3],
            light_engine_flags: LittleEndian::read_u16(&bytes[4..6]),
            playback_flags: LittleEndian::read_u16(&bytes[6..8]),
            source_flags: LittleEndian::read_u16(&bytes[8..10]),
            buffer_fullness: LittleEndian::read_u16(&bytes[10..12]),
            point_rate: LittleEndian::read_u32(&bytes[12..16]),
            point_count: LittleEndian::read_u32(&bytes[16..20]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8; STATUS_BYTES]) {
        bytes[0] = self.protocol;
        bytes[1] = self.light_engine_state;
        bytes[2] = self.playback_state;
        bytes[3] = self.source;
        LittleEndian::write_u16(&mut bytes[4..6], self.light_engine_flags);
        LittleEndian::write_u16(&mut bytes[6..8], self.playback_flags);
        LittleEndian::write_u16(&mut bytes[8..10], self.source_flags);
        LittleEndian::write_u16(&mut bytes[10..12], self.buffer_fullness);
        LittleEndian::write_u32(&mut bytes[12..16], self.point_rate);
        LittleEndian::write_u32(&mut bytes[16..20], self.point_count);
    }

    /// The playback engine state described by this status.
    pub fn playback(&self) -> PlaybackState {
        PlaybackState::from(self.playback_state)
    }
}

/// The 22-byte reply the DAC sends for every command, and once unsolicited on
/// connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DacResponse {
    /// One of the `response` codes.
    pub response: u8,
    /// Echo of the command byte being answered.
    pub command: u8,
    pub status: DacStatus,
}

impl DacResponse {
    pub fn read_from(bytes: &[u8; RESPONSE_BYTES]) -> Self {
        let mut status = [0u8; STATUS_BYTES];
        status.copy_from_slice(&bytes[2..]);
        DacResponse {
            response: bytes[0],
            command: bytes[1],
            status: DacStatus::read_from(&status),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8; RESPONSE_BYTES]) {
        bytes[0] = self.response;
        bytes[1] = self.command;
        let mut status = [0u8; STATUS_BYTES];
        self.status.write_to(&mut status);
        bytes[2..].copy_from_slice(&status);
    }
}

/// The 36-byte UDP packet DACs broadcast once per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DacBroadcast {
    pub mac_address: [u8; 6],
    pub hw_revision: u16,
    pub sw_revision: u16,
    /// Capacity of the on-device point buffer.
    pub buffer_capacity: u16,
    /// The maximum point rate allowed by the DAC.
    pub max_point_rate: u32,
    pub status: DacStatus,
}

impl DacBroadcast {
    pub fn read_from(bytes: &[u8; BROADCAST_BYTES]) -> Self {
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&bytes[0..6]);
        let mut status = [0u8; STATUS_BYTES];
        status.copy_from_slice(&bytes[16..36]);
        DacBroadcast {
            mac_address,
            hw_revision: LittleEndian::read_u16(&bytes[6..8]),
            sw_revision: LittleEndian::read_u16(&bytes[8..10]),
            buffer_capacity: LittleEndian::read_u16(&bytes[10..12]),
            max_point_rate: LittleEndian::read_u32(&bytes[12..16]),
            status: DacStatus::read_from(&status),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8; BROADCAST_BYTES]) {
        bytes[0..6].copy_from_slice(&self.mac_address);
        LittleEndian::write_u16(&mut bytes[6..8], self.hw_revision);
        LittleEndian::write_u16(&mut bytes[8..10], self.sw_revision);
        LittleEndian::write_u16(&mut bytes[10..12], self.buffer_capacity);
        LittleEndian::write_u32(&mut bytes[12..16], self.max_point_rate);
        let mut status = [0u8; STATUS_BYTES];
        self.status.write_to(&mut status);
        bytes[16..36].copy_from_slice(&status);
    }
}

/// A single point as laid out on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DacPoint {
    pub control: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
    pub u1: u16,
    pub u2: u16,
}

impl DacPoint {
    pub fn read_from(bytes: &[u8; POINT_BYTES]) -> Self {
        DacPoint {
            control: LittleEndian::read_u16(&bytes[0..2]),
            x: LittleEndian::read_i16(&bytes[2..4]),
            y: LittleEndian::read_i16(&bytes[4..6]),
            r: LittleEndian::read_u16(&bytes[6..8]),
            g: LittleEndian::read_u16(&bytes[8..10]),
            b: LittleEndian::read_u16(&bytes[10..12]),
            i: LittleEndian::read_u16(&bytes[12..14]),
            u1: LittleEndian::read_u16(&bytes[14..16]),
            u2: LittleEndian::read_u16(&bytes[16..18]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8; POINT_BYTES]) {
        LittleEndian::write_u16(&mut bytes[0..2], self.control);
        LittleEndian::write_i16(&mut bytes[2..4], self.x);
        LittleEndian::write_i16(&mut bytes[4..6], self.y);
        LittleEndian::write_u16(&mut bytes[6..8], self.r);
        LittleEndian::write_u16(&mut bytes[8..10], self.g);
        LittleEndian::write_u16(&mut bytes[10..12], self.b);
        LittleEndian::write_u16(&mut bytes[12..14], self.i);
        LittleEndian::write_u16(&mut bytes[14..16], self.u1);
        LittleEndian::write_u16(&mut bytes[16..18], self.u2);
    }
}

/// Encode a BEGIN command: `'b'`, u16 low-water mark, u32 point rate.
///
/// The low-water mark is unused by the DAC and always written as zero.
pub fn begin_bytes(point_rate: u32) -> [u8; 7] {
    let mut bytes = [0u8; 7];
    bytes[0] = command::BEGIN;
    LittleEndian::write_u16(&mut bytes[1..3], 0);
    LittleEndian::write_u32(&mut bytes[3..7], point_rate);
    bytes
}

/// Encode a QUEUE point-rate change: `'q'`, u32 point rate.
pub fn point_rate_bytes(point_rate: u32) -> [u8; 5] {
    let mut bytes = [0u8; 5];
    bytes[0] = command::POINT_RATE;
    LittleEndian::write_u32(&mut bytes[1..5], point_rate);
    bytes
}

/// Encode the header of a DATA command: `'d'`, u16 point count.
///
/// The `n_points * 18` bytes of point payload follow the header.
pub fn data_header_bytes(n_points: u16) -> [u8; 3] {
    let mut bytes = [0u8; 3];
    bytes[0] = command::DATA;
    LittleEndian::write_u16(&mut bytes[1..3], n_points);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_fixture() -> DacStatus {
        DacStatus {
            protocol: 0,
            light_engine_state: 1,
            playback_state: 2,
            source: 0,
            light_engine_flags: 0x0102,
            playback_flags: 0x0304,
            source_flags: 0x0506,
            buffer_fullness: 1799,
            point_rate: 48_000,
            point_count: 123_456,
        }
    }

    #[test]
    fn status_round_trip() {
        let status = status_fixture();
        let mut bytes = [0u8; STATUS_BYTES];
        status.write_to(&mut bytes);
        assert_eq!(DacStatus::read_from(&bytes), status);
    }

    #[test]
    fn response_round_trip() {
        let response = DacResponse {
            response: response::ACK,
            command: command::DATA,
            status: status_fixture(),
        };
        let mut bytes = [0u8; RESPONSE_BYTES];
        response.write_to(&mut bytes);
        assert_eq!(DacResponse::read_from(&bytes), response);
    }

    #[test]
    fn broadcast_round_trip() {
        let broadcast = DacBroadcast {
            mac_address: [0x00, 0x1a, 0x20, 0xab, 0xcd, 0xef],
            hw_revision: 1,
            sw_revision: 2,
            buffer_capacity: 1800,
            max_point_rate: 100_000,
            status: status_fixture(),
        };
        let mut bytes = [0u8; BROADCAST_BYTES];
        broadcast.write_to(&mut bytes);
        assert_eq!(DacBroadcast::read_from(&bytes), broadcast);
    }

    #[test]
    fn broadcast_field_offsets() {
        let mut bytes = [0u8; BROADCAST_BYTES];
        bytes[3..6].copy_from_slice(&[0xab, 0xcd, 0xef]);
        bytes[6..8].copy_from_slice(&[0x01, 0x00]);
        bytes[8..10].copy_from_slice(&[0x02, 0x00]);
        bytes[10..12].copy_from_slice(&[0x08, 0x07]);
        let broadcast = DacBroadcast::read_from(&bytes);
        assert_eq!(&broadcast.mac_address[3..], &[0xab, 0xcd, 0xef]);
        assert_eq!(broadcast.hw_revision, 1);
        assert_eq!(broadcast.sw_revision, 2);
        assert_eq!(broadcast.buffer_capacity, 1800);
    }

    #[test]
    fn point_round_trip() {
        let point = DacPoint {
            control: CONTROL_RATE_CHANGE,
            x: -32768,
            y: 32767,
            r: 65535,
            g: 0,
            b: 1,
            i: 0,
            u1: 0,
            u2: 0,
        };
        let mut bytes = [0u8; POINT_BYTES];
        point.write_to(&mut bytes);
        // The rate-change flag lands in the high byte of the control field.
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x80);
        assert_eq!(DacPoint::read_from(&bytes), point);
    }

    #[test]
    fn command_encodings() {
        assert_eq!(
            begin_bytes(48_000),
            [b'b', 0x00, 0x00, 0x80, 0xbb, 0x00, 0x00]
        );
        assert_eq!(point_rate_bytes(48_000), [b'q', 0x80, 0xbb, 0x00, 0x00]);
        assert_eq!(data_header_bytes(80), [b'd', 80, 0x00]);
    }
}
