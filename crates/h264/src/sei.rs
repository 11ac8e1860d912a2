//! SEI message iteration, specialised to user-data-unregistered payloads.
//!
//! Recordings carry two kinds of user-data SEI: application blobs that
//! belong to the frame, and the recorder's internal streaming-signalling
//! messages (v1/v2), identified by fixed UUIDs. Callers use
//! [`is_streaming_signalling`] to drop the latter before forwarding.

use rp_common::H264Error;

use crate::bits::strip_emulation_prevention;
use crate::nal::NalUnitType;

/// SEI payload type for user-data-unregistered messages.
pub const USER_DATA_UNREGISTERED: u32 = 5;

/// UUID of the streaming-signalling v1 user-data SEI.
pub const STREAMING_V1_UUID: [u8; 16] = [
    0x53, 0x79, 0x41, 0x9b, 0xa4, 0xcd, 0x42, 0x6b, 0x8c, 0x1e, 0x5f, 0x02, 0x77, 0x10, 0x3d, 0xd1,
];

/// UUID of the streaming-signalling v2 user-data SEI.
pub const STREAMING_V2_UUID: [u8; 16] = [
    0x9e, 0x20, 0x6f, 0xc4, 0x12, 0x78, 0x45, 0x0a, 0xb3, 0x6a, 0x8d, 0xe5, 0x41, 0x9c, 0x06, 0x4e,
];

/// Whether a user-data UUID is one of the internal streaming-signalling
/// messages (not application user data).
pub fn is_streaming_signalling(uuid: &[u8; 16]) -> bool {
    *uuid == STREAMING_V1_UUID || *uuid == STREAMING_V2_UUID
}

/// One user-data-unregistered SEI payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UserDataSei<'a> {
    pub uuid: [u8; 16],
    /// Payload bytes after the UUID.
    pub payload: &'a [u8],
}

/// Iterate the payloads of a SEI NAL unit (header byte included) and
/// invoke `on_user_data` for every user-data-unregistered payload, in
/// stream order. Other payload types are skipped.
pub fn parse_user_data_sei(
    nal: &[u8],
    mut on_user_data: impl FnMut(UserDataSei<'_>),
) -> Result<(), H264Error> {
    if nal.is_empty() {
        return Err(H264Error::InvalidSei("empty NAL unit".to_string()));
    }
    if NalUnitType::from(nal[0]) != NalUnitType::Sei {
        return Err(H264Error::InvalidSei(format!(
            "not a SEI NAL unit (header 0x{:02x})",
            nal[0]
        )));
    }

    let rbsp = strip_emulation_prevention(&nal[1..]);
    let mut pos = 0usize;

    // A SEI RBSP ends with the rbsp_trailing_bits byte (0x80).
    while rbsp.len() - pos > 1 {
        let payload_type = read_ff_coded(&rbsp, &mut pos)?;
        let payload_size = read_ff_coded(&rbsp, &mut pos)? as usize;
        if payload_size > rbsp.len() - pos {
            return Err(H264Error::InvalidSei(format!(
                "payload of {payload_size} bytes overruns SEI at offset {pos}"
            )));
        }

        if payload_type == USER_DATA_UNREGISTERED && payload_size >= 16 {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&rbsp[pos..pos + 16]);
            on_user_data(UserDataSei {
                uuid,
                payload: &rbsp[pos + 16..pos + payload_size],
            });
        }

        pos += payload_size;
    }

    Ok(())
}

/// Read a ff-coded value (each 0xFF byte adds 255 to the final byte).
fn read_ff_coded(rbsp: &[u8], pos: &mut usize) -> Result<u32, H264Error> {
    let mut value = 0u32;
    loop {
        let byte = *rbsp
            .get(*pos)
            .ok_or_else(|| H264Error::InvalidSei("truncated SEI header".to_string()))?;
        *pos += 1;
        value += byte as u32;
        if byte != 0xFF {
            return Ok(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sei_nal(payloads: &[(u32, &[u8])]) -> Vec<u8> {
        let mut nal = vec![0x06];
        for &(ptype, data) in payloads {
            let mut t = ptype;
            while t >= 255 {
                nal.push(0xFF);
                t -= 255;
            }
            nal.push(t as u8);
            let mut s = data.len();
            while s >= 255 {
                nal.push(0xFF);
                s -= 255;
            }
            nal.push(s as u8);
            nal.extend_from_slice(data);
        }
        nal.push(0x80); // rbsp_trailing_bits
        nal
    }

    fn user_data(uuid: [u8; 16], body: &[u8]) -> Vec<u8> {
        let mut data = uuid.to_vec();
        data.extend_from_slice(body);
        data
    }

    #[test]
    fn delivers_user_data_payloads() {
        let uuid = [0x42u8; 16];
        let nal = sei_nal(&[(USER_DATA_UNREGISTERED, &user_data(uuid, b"hello"))]);

        let mut seen = Vec::new();
        parse_user_data_sei(&nal, |ud| seen.push((ud.uuid, ud.payload.to_vec()))).unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, uuid);
        assert_eq!(seen[0].1, b"hello");
    }

    #[test]
    fn skips_other_payload_types() {
        let uuid = [0x01u8; 16];
        let nal = sei_nal(&[
            (1, &[0x00, 0x01, 0x02]), // pic_timing, ignored
            (USER_DATA_UNREGISTERED, &user_data(uuid, b"x")),
            (6, &[0x07]), // recovery_point, ignored
        ]);

        let mut count = 0;
        parse_user_data_sei(&nal, |_| count += 1).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn ff_coded_sizes() {
        // 300-byte payload exercises the 0xFF size continuation
        let uuid = [0x07u8; 16];
        let body = vec![0xA5u8; 284];
        let nal = sei_nal(&[(USER_DATA_UNREGISTERED, &user_data(uuid, &body))]);

        let mut seen_len = 0;
        parse_user_data_sei(&nal, |ud| seen_len = ud.payload.len()).unwrap();
        assert_eq!(seen_len, 284);
    }

    #[test]
    fn signalling_uuids_recognised() {
        assert!(is_streaming_signalling(&STREAMING_V1_UUID));
        assert!(is_streaming_signalling(&STREAMING_V2_UUID));
        assert!(!is_streaming_signalling(&[0u8; 16]));
    }

    #[test]
    fn multiple_user_data_in_stream_order() {
        let nal = sei_nal(&[
            (USER_DATA_UNREGISTERED, &user_data([1u8; 16], b"first")),
            (USER_DATA_UNREGISTERED, &user_data([2u8; 16], b"second")),
        ]);

        let mut uuids = Vec::new();
        parse_user_data_sei(&nal, |ud| uuids.push(ud.uuid[0])).unwrap();
        assert_eq!(uuids, vec![1, 2]);
    }

    #[test]
    fn overrun_payload_rejected() {
        // declared size 10 with only 2 bytes present
        let nal = vec![0x06, 0x05, 0x0A, 0x00, 0x00];
        assert!(parse_user_data_sei(&nal, |_| {}).is_err());
    }

    #[test]
    fn non_sei_nal_rejected() {
        assert!(parse_user_data_sei(&[0x65, 0x00], |_| {}).is_err());
        assert!(parse_user_data_sei(&[], |_| {}).is_err());
    }

    #[test]
    fn short_user_data_without_uuid_is_skipped() {
        let nal = sei_nal(&[(USER_DATA_UNREGISTERED, &[0x01, 0x02])]);
        let mut count = 0;
        parse_user_data_sei(&nal, |_| count += 1).unwrap();
        assert_eq!(count, 0);
    }
}
