mod legacy;
mod minecraft;

use std::net::SocketAddrV4;

pub use legacy::LegacyMinecraft;
pub use minecraft::{Minecraft, build_latest_request, read_varint, write_varint};

#[derive(Debug, PartialEq, Eq)]
pub enum ParseResponseError {
    Invalid,
    Incomplete { expected_length: u32 },
}

pub enum Response<'a> {
    Data(&'a [u8]),
    /// The server closed the connection. Whatever it sent before is passed
    /// again as `Data` first.
    Closed,
}

pub trait Protocol: Send + Sync + 'static {
    fn payload(&self, address: SocketAddrV4) -> Vec<u8>;
    fn parse_response(&self, response: Response) -> Result<Vec<u8>, ParseResponseError>;
}
