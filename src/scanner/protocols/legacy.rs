use std::net::SocketAddrV4;

use super::{ParseResponseError, Protocol, Response};

/// The pre-1.7 server list ping. Servers answer with a kick packet (`0xFF`)
/// containing a UTF-16BE string.
///
/// The parsed response is that string re-encoded as UTF-8.
#[derive(Clone, Default)]
pub struct LegacyMinecraft;

impl Protocol for LegacyMinecraft {
    fn payload(&self, _address: SocketAddrV4) -> Vec<u8> {
        // server list ping, with the 1.4+ payload byte
        vec![0xFE, 0x01]
    }

    fn parse_response(&self, response: Response) -> Result<Vec<u8>, ParseResponseError> {
        let response = match response {
            Response::Data(r) => r,
            Response::Closed => return Err(ParseResponseError::Invalid),
        };

        let Some((&packet_id, rest)) = response.split_first() else {
            return Err(ParseResponseError::Incomplete { expected_length: 0 });
        };
        if packet_id != 0xFF {
            return Err(ParseResponseError::Invalid);
        }
        if rest.len() < 2 {
            return Err(ParseResponseError::Incomplete { expected_length: 0 });
        }
        // length in UTF-16 code units
        let length = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let string_bytes = &rest[2..];
        if string_bytes.len() < length * 2 {
            return Err(ParseResponseError::Incomplete {
                expected_length: (length * 2) as u32,
            });
        }

        let units = string_bytes[..length * 2]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect::<Vec<_>>();
        let string = String::from_utf16(&units).map_err(|_| ParseResponseError::Invalid)?;
        if string.is_empty() {
            return Err(ParseResponseError::Invalid);
        }

        Ok(string.into_bytes())
    }
}
