//! Minimal Source-engine A2S client: server info and player list over UDP.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use tracing::debug;

use super::{ServerInfo, Snapshot, SnapshotSource, SourceError};
use crate::reconcile::RawObservation;

const SIMPLE_HEADER: [u8; 4] = [0xFF; 4];
const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];
const NO_CHALLENGE: [u8; 4] = [0xFF; 4];

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const S2A_INFO: u8 = 0x49;
const S2A_PLAYER: u8 = 0x44;
const S2C_CHALLENGE: u8 = 0x41;

const INFO_QUERY: &[u8] = b"Source Engine Query\0";
const MAX_CHALLENGE_ROUNDS: usize = 3;
const RECV_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct A2sSource {
    address: String,
    timeout: Duration,
}

impl A2sSource {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn info(&self) -> Result<ServerInfo, SourceError> {
        let socket = self.connect()?;
        let body = exchange(&socket, S2A_INFO, |challenge| {
            let mut packet = request(A2S_INFO);
            packet.extend_from_slice(INFO_QUERY);
            if let Some(challenge) = challenge {
                packet.extend_from_slice(&challenge);
            }
            packet
        })?;
        parse_info(&body)
    }

    pub fn players(&self) -> Result<Vec<RawObservation>, SourceError> {
        let socket = self.connect()?;
        let body = exchange(&socket, S2A_PLAYER, |challenge| {
            let mut packet = request(A2S_PLAYER);
            packet.extend_from_slice(&challenge.unwrap_or(NO_CHALLENGE));
            packet
        })?;
        parse_players(&body)
    }

    fn connect(&self) -> Result<UdpSocket, SourceError> {
        let target = self.address.to_socket_addrs()?.next().ok_or_else(|| {
            SourceError::Protocol(format!("`{}` did not resolve to an address", self.address))
        })?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(Some(self.timeout))?;
        socket.set_write_timeout(Some(self.timeout))?;
        socket.connect(target)?;
        Ok(socket)
    }
}

impl SnapshotSource for A2sSource {
    fn fetch(&self) -> Result<Snapshot, SourceError> {
        let info = self.info()?;
        let players = self.players()?;
        debug!(
            server = %info.server_name,
            players = players.len(),
            "fetched server snapshot"
        );
        Ok(Snapshot {
            info: Some(info),
            players,
        })
    }
}

fn request(kind: u8) -> Vec<u8> {
    let mut packet = Vec::with_capacity(32);
    packet.extend_from_slice(&SIMPLE_HEADER);
    packet.push(kind);
    packet
}

/// Sends a request, answering challenge responses, until the expected reply
/// arrives. Returns the reply body after its type byte.
fn exchange(
    socket: &UdpSocket,
    expected: u8,
    build: impl Fn(Option<[u8; 4]>) -> Vec<u8>,
) -> Result<Vec<u8>, SourceError> {
    let mut challenge = None;
    let mut buf = [0u8; RECV_BUFFER];
    for _ in 0..MAX_CHALLENGE_ROUNDS {
        socket.send(&build(challenge))?;
        let len = socket.recv(&mut buf)?;
        let (kind, body) = split_reply(&buf[..len])?;
        match kind {
            S2C_CHALLENGE => {
                let mut reader = PacketReader::new(body);
                challenge = Some(reader.array4("challenge")?);
            }
            kind if kind == expected => return Ok(body.to_vec()),
            other => {
                return Err(SourceError::Protocol(format!(
                    "unexpected reply type 0x{other:02x}, wanted 0x{expected:02x}"
                )));
            }
        }
    }
    Err(SourceError::Protocol(
        "server kept answering with challenges".to_string(),
    ))
}

fn split_reply(packet: &[u8]) -> Result<(u8, &[u8]), SourceError> {
    if packet.starts_with(&SPLIT_HEADER) {
        return Err(SourceError::SplitResponse);
    }
    let Some(rest) = packet.strip_prefix(&SIMPLE_HEADER) else {
        return Err(SourceError::Protocol("missing packet header".to_string()));
    };
    match rest.split_first() {
        Some((&kind, body)) => Ok((kind, body)),
        None => Err(SourceError::Protocol("empty reply".to_string())),
    }
}

pub(crate) fn parse_info(body: &[u8]) -> Result<ServerInfo, SourceError> {
    let mut reader = PacketReader::new(body);
    let _protocol = reader.u8("protocol")?;
    let server_name = reader.cstring("name")?;
    let map = reader.cstring("map")?;
    let _folder = reader.cstring("folder")?;
    let _game = reader.cstring("game")?;
    let _app_id = reader.array2("app id")?;
    let player_count = reader.u8("players")?;
    let max_players = reader.u8("max players")?;
    Ok(ServerInfo {
        server_name,
        map,
        player_count: u32::from(player_count),
        max_players: u32::from(max_players),
    })
}

pub(crate) fn parse_players(body: &[u8]) -> Result<Vec<RawObservation>, SourceError> {
    let mut reader = PacketReader::new(body);
    let declared = reader.u8("player count")?;
    let mut players = Vec::with_capacity(usize::from(declared));
    // Some servers declare more entries than they send.
    while !reader.is_empty() && players.len() < usize::from(declared) {
        let _index = reader.u8("player index")?;
        let name = reader.cstring("player name")?;
        let score = i32::from_le_bytes(reader.array4("player score")?);
        let duration = f32::from_le_bytes(reader.array4("player duration")?);
        players.push(RawObservation {
            name: Some(name),
            elapsed_seconds: Some(f64::from(duration)),
            score: Some(i64::from(score)),
        });
    }
    Ok(players)
}

struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], SourceError> {
        if self.buf.len() < len {
            return Err(SourceError::Protocol(format!("truncated reply at {field}")));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, field: &str) -> Result<u8, SourceError> {
        Ok(self.take(1, field)?[0])
    }

    fn array2(&mut self, field: &str) -> Result<[u8; 2], SourceError> {
        let bytes = self.take(2, field)?;
        Ok([bytes[0], bytes[1]])
    }

    fn array4(&mut self, field: &str) -> Result<[u8; 4], SourceError> {
        let bytes = self.take(4, field)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn cstring(&mut self, field: &str) -> Result<String, SourceError> {
        let Some(end) = self.buf.iter().position(|&byte| byte == 0) else {
            return Err(SourceError::Protocol(format!("unterminated string at {field}")));
        };
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(text)
    }
}
