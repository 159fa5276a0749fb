//! Probing a single target: connect, send the status request, and read until
//! the response is complete.

use std::{fmt, io, net::SocketAddrV4, time::Duration};

use chrono::Utc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::trace;

use crate::{
    config::Config,
    processing::{
        FilterReason, ProcessableProtocol, ServerRecord, minecraft::opt_out::OptOutFilter,
    },
};

use super::protocols::{LegacyMinecraft, Minecraft, ParseResponseError, Protocol, Response};

/// We give up on a response that's grown past this without parsing.
const MAX_BUFFERED: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// The TCP connection couldn't be established (besides being refused).
    Connect(io::ErrorKind),
    /// The whole exchange didn't finish in time.
    Timeout,
    /// The server replied with something that isn't a status response, or
    /// closed the connection before finishing.
    Malformed,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Connect(kind) => write!(f, "couldn't connect: {kind}"),
            ProbeError::Timeout => write!(f, "timed out"),
            ProbeError::Malformed => write!(f, "malformed response"),
        }
    }
}

impl std::error::Error for ProbeError {}

/// What happened to a single target.
#[derive(Debug)]
pub enum ProbeOutcome {
    Found(Box<ServerRecord>),
    /// Nothing is listening on the port.
    NotFound,
    /// It's a server, but we're not keeping it.
    Filtered(FilterReason),
    Failed(ProbeError),
}

/// Run a full exchange with the target using the given protocol, returning
/// the framed response.
pub async fn probe<P: Protocol>(
    protocol: &P,
    target: SocketAddrV4,
    timeout: Duration,
) -> Result<Vec<u8>, ProbeError> {
    match tokio::time::timeout(timeout, exchange(protocol, target)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout),
    }
}

async fn exchange<P: Protocol>(protocol: &P, target: SocketAddrV4) -> Result<Vec<u8>, ProbeError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| ProbeError::Connect(e.kind()))?;
    stream
        .write_all(&protocol.payload(target))
        .await
        .map_err(|_| ProbeError::Malformed)?;

    let mut data = Vec::new();
    let mut buf = [0; 4096];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|_| ProbeError::Malformed)?;
        if n == 0 {
            return protocol
                .parse_response(Response::Closed)
                .map_err(|_| ProbeError::Malformed);
        }
        data.extend_from_slice(&buf[..n]);

        match protocol.parse_response(Response::Data(&data)) {
            Ok(response) => return Ok(response),
            Err(ParseResponseError::Invalid) => return Err(ProbeError::Malformed),
            Err(ParseResponseError::Incomplete { .. }) => {
                if data.len() > MAX_BUFFERED {
                    return Err(ProbeError::Malformed);
                }
            }
        }
    }
}

/// Everything a worker needs to turn a target into a [`ProbeOutcome`].
pub struct Prober {
    minecraft: Minecraft,
    legacy: Option<LegacyMinecraft>,
    opt_out: OptOutFilter,
    timeout: Duration,
}

impl Prober {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        Ok(Self {
            minecraft: Minecraft::new(config.target.addr.clone(), config.target.protocol_version),
            legacy: config
                .scanner
                .legacy_fallback
                .then(LegacyMinecraft::default),
            opt_out: OptOutFilter::new(&config.opt_out)?,
            timeout: config.ping_timeout(),
        })
    }

    pub async fn probe_target(&self, target: SocketAddrV4) -> ProbeOutcome {
        let parsed = match probe(&self.minecraft, target, self.timeout).await {
            Ok(data) => Minecraft::parse_status(&data),
            Err(ProbeError::Connect(io::ErrorKind::ConnectionRefused)) => {
                return ProbeOutcome::NotFound;
            }
            Err(ProbeError::Malformed) => match &self.legacy {
                Some(legacy) => match probe(legacy, target, self.timeout).await {
                    Ok(data) => LegacyMinecraft::parse_status(&data),
                    Err(err) => return ProbeOutcome::Failed(err),
                },
                None => return ProbeOutcome::Failed(ProbeError::Malformed),
            },
            Err(err) => return ProbeOutcome::Failed(err),
        };

        let response = match parsed {
            Ok(response) => response,
            Err(err) => {
                trace!("couldn't parse status from {target}: {err}");
                return ProbeOutcome::Failed(ProbeError::Malformed);
            }
        };

        if let Some(reason) = self.opt_out.check(&response) {
            return ProbeOutcome::Filtered(reason);
        }

        ProbeOutcome::Found(Box::new(ServerRecord::new(target, response, Utc::now())))
    }
}
