use std::net::SocketAddrV4;

use super::{ParseResponseError, Protocol, Response};

/// The longest status response we'll accept. The status JSON is a protocol
/// string, so it can't be longer than 32767 UTF-16 code units (which is at
/// most 3 bytes each in UTF-8), plus some room for the packet header.
const MAX_RESPONSE_LENGTH: i32 = 32767 * 3 + 16;

/// The modern (1.7+) server list ping.
#[derive(Clone)]
pub struct Minecraft {
    /// Sent as the server address in the handshake. If this is None then the
    /// target's IP is used.
    hostname: Option<String>,
    protocol_version: i32,
}

impl Minecraft {
    pub fn new(hostname: Option<String>, protocol_version: i32) -> Self {
        Self {
            hostname,
            protocol_version,
        }
    }
}

impl Protocol for Minecraft {
    fn payload(&self, address: SocketAddrV4) -> Vec<u8> {
        match &self.hostname {
            Some(hostname) => {
                build_latest_request(hostname, address.port(), self.protocol_version)
            }
            None => build_latest_request(
                &address.ip().to_string(),
                address.port(),
                self.protocol_version,
            ),
        }
    }

    fn parse_response(&self, response: Response) -> Result<Vec<u8>, ParseResponseError> {
        let response = match response {
            Response::Data(r) => r,
            Response::Closed => return Err(ParseResponseError::Invalid),
        };

        let mut stream = response;
        let packet_length = read_varint(&mut stream)?;
        let after_length = stream.len();
        let packet_id = read_varint(&mut stream)?;
        let response_length = read_varint(&mut stream)?;
        if packet_id != 0x00
            || !(0..=MAX_RESPONSE_LENGTH).contains(&response_length)
            || packet_length < response_length
        {
            return Err(ParseResponseError::Invalid);
        }
        // the packet length includes the packet id and the string length
        let header_length = (after_length - stream.len()) as i32;
        if packet_length != header_length + response_length {
            return Err(ParseResponseError::Invalid);
        }

        let status_buffer = stream;
        if status_buffer.len() < response_length as usize {
            return Err(ParseResponseError::Incomplete {
                expected_length: response_length as u32,
            });
        }
        let status_buffer = &status_buffer[..response_length as usize];

        let status_string =
            std::str::from_utf8(status_buffer).map_err(|_| ParseResponseError::Invalid)?;

        // make sure it starts with {
        if !status_string.starts_with('{') {
            return Err(ParseResponseError::Invalid);
        }

        Ok(status_buffer.to_vec())
    }
}

/// https://github.com/kiwiyou/craftping/blob/master/src/lib.rs#L73
pub fn build_latest_request(hostname: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    // buffer for the 1st packet's data part
    let mut buffer = vec![
        // 0 for handshake packet
        0x00,
    ];

    write_varint(&mut buffer, protocol_version); // protocol version

    // Some server implementations require hostname and port to be properly set (Notchian does not)
    write_varint(&mut buffer, hostname.len() as i32); // length of hostname as VarInt
    buffer.extend_from_slice(hostname.as_bytes());
    buffer.extend_from_slice(&[
        (port >> 8) as u8,
        (port & 0b1111_1111) as u8, // server port as unsigned short
        0x01,                       // next state: 1 (status) as VarInt
    ]);
    // buffer for the 1st and 2nd packet
    let mut full_buffer = vec![];
    write_varint(&mut full_buffer, buffer.len() as i32); // length of 1st packet id + data as VarInt
    full_buffer.append(&mut buffer);
    full_buffer.extend_from_slice(&[
        1,    // length of 2nd packet id + data as VarInt
        0x00, // 2nd packet id: 0 for request as VarInt
    ]);

    full_buffer
}

pub fn write_varint(writer: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        let byte = (value & 0b0111_1111) as u8;
        value >>= 7;
        if value == 0 {
            writer.push(byte);
            return;
        }
        writer.push(byte | 0b1000_0000);
    }
}

/// Read a VarInt from the start of the slice and advance it.
///
/// Running out of bytes means the packet is incomplete, while a VarInt longer
/// than 5 bytes means it's not a valid packet at all.
pub fn read_varint(reader: &mut &[u8]) -> Result<i32, ParseResponseError> {
    let mut ans: u32 = 0;
    for i in 0..5 {
        let Some((&byte, rest)) = reader.split_first() else {
            return Err(ParseResponseError::Incomplete { expected_length: 0 });
        };
        *reader = rest;
        ans |= ((byte & 0b0111_1111) as u32) << (7 * i);
        if byte & 0b1000_0000 == 0 {
            return Ok(ans as i32);
        }
    }
    Err(ParseResponseError::Invalid)
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    fn status_packet(json: &str) -> Vec<u8> {
        let mut data = vec![0x00];
        write_varint(&mut data, json.len() as i32);
        data.extend_from_slice(json.as_bytes());
        let mut packet = vec![];
        write_varint(&mut packet, data.len() as i32);
        packet.extend(data);
        packet
    }

    #[test]
    fn test_varint() {
        for (value, bytes) in [
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (25565, vec![0xdd, 0xc7, 0x01]),
            (2147483647, vec![0xff, 0xff, 0xff, 0xff, 0x07]),
            (-1, vec![0xff, 0xff, 0xff, 0xff, 0x0f]),
        ] {
            let mut buf = vec![];
            write_varint(&mut buf, value);
            assert_eq!(buf, bytes, "writing {value}");
            assert_eq!(read_varint(&mut buf.as_slice()), Ok(value), "reading {value}");
        }

        assert!(matches!(
            read_varint(&mut [0x80, 0x80].as_slice()),
            Err(ParseResponseError::Incomplete { .. })
        ));
        assert_eq!(
            read_varint(&mut [0xff, 0xff, 0xff, 0xff, 0xff, 0x01].as_slice()),
            Err(ParseResponseError::Invalid)
        );
    }

    #[test]
    fn test_build_request() {
        let request = build_latest_request("10.0.0.2", 25565, 47);
        assert_eq!(
            request,
            vec![
                // handshake: length, id, protocol 47, host, port, next state
                14, 0x00, 47, 8, b'1', b'0', b'.', b'0', b'.', b'0', b'.', b'2', 0x63, 0xdd, 0x01,
                // status request
                1, 0x00,
            ]
        );
    }

    #[test]
    fn test_payload_uses_target_ip() {
        let protocol = Minecraft::new(None, 47);
        let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 25565);
        assert_eq!(
            protocol.payload(target),
            build_latest_request("10.0.0.2", 25565, 47)
        );

        let protocol = Minecraft::new(Some("mc.example.com".to_string()), 767);
        assert_eq!(
            protocol.payload(target),
            build_latest_request("mc.example.com", 25565, 767)
        );
    }

    #[test]
    fn test_parse_complete_response() {
        let json = r#"{"description":"hi","players":{"max":20,"online":0},"version":{"name":"1.8.9","protocol":47}}"#;
        let packet = status_packet(json);
        let protocol = Minecraft::new(None, 47);
        assert_eq!(
            protocol.parse_response(Response::Data(&packet)),
            Ok(json.as_bytes().to_vec())
        );
    }

    #[test]
    fn test_parse_incomplete_response() {
        let json = r#"{"description":"a longer description than usual"}"#;
        let packet = status_packet(json);
        let protocol = Minecraft::new(None, 47);

        for cut in [1, 2, 3, packet.len() - 1] {
            assert!(
                matches!(
                    protocol.parse_response(Response::Data(&packet[..cut])),
                    Err(ParseResponseError::Incomplete { .. })
                ),
                "cut at {cut}"
            );
        }
        assert_eq!(
            protocol.parse_response(Response::Data(&[])),
            Err(ParseResponseError::Incomplete { expected_length: 0 })
        );
    }

    #[test]
    fn test_parse_invalid_response() {
        let protocol = Minecraft::new(None, 47);

        // http server
        assert_eq!(
            protocol.parse_response(Response::Data(b"HTTP/1.1 400 Bad Request\r\n\r\n")),
            Err(ParseResponseError::Invalid)
        );

        // wrong packet id
        let mut packet = status_packet("{}");
        packet[1] = 0x01;
        assert_eq!(
            protocol.parse_response(Response::Data(&packet)),
            Err(ParseResponseError::Invalid)
        );

        // not json
        assert_eq!(
            protocol.parse_response(Response::Data(&status_packet("hello"))),
            Err(ParseResponseError::Invalid)
        );

        // not utf-8
        let mut packet = status_packet("{\"description\":\"ab\"}");
        let len = packet.len();
        packet[len - 3] = 0xff;
        assert_eq!(
            protocol.parse_response(Response::Data(&packet)),
            Err(ParseResponseError::Invalid)
        );

        assert_eq!(
            protocol.parse_response(Response::Closed),
            Err(ParseResponseError::Invalid)
        );
    }
}
