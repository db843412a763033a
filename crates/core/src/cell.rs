/// Fixed-size cell codec for the relay wire protocol
///
/// Every message between relays is exactly [`CELL_LEN`] bytes, zero-padded,
/// with all multi-byte integers big-endian. Encoding and decoding are pure;
/// no I/O happens here.

use veilnet_common::AgentId;

/// Every cell on the wire is exactly this long.
pub const CELL_LEN: usize = 512;

/// RELAY header: circuit id (2) + command (1) + stream id (2) +
/// reserved zero (2) + body length (2) + relay command (1).
pub const RELAY_HEADER_LEN: usize = 10;

/// Maximum payload carried by one RELAY cell.
pub const RELAY_PAYLOAD_MAX: usize = 498;

const OPEN_BODY_LEN: usize = 8;

/// Cell command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Create = 0x01,
    Created = 0x02,
    Relay = 0x03,
    Destroy = 0x04,
    Open = 0x05,
    Opened = 0x06,
    OpenFailed = 0x07,
    CreateFailed = 0x08,
}

impl Command {
    fn from_byte(byte: u8) -> Result<Self, CellError> {
        match byte {
            0x01 => Ok(Self::Create),
            0x02 => Ok(Self::Created),
            0x03 => Ok(Self::Relay),
            0x04 => Ok(Self::Destroy),
            0x05 => Ok(Self::Open),
            0x06 => Ok(Self::Opened),
            0x07 => Ok(Self::OpenFailed),
            0x08 => Ok(Self::CreateFailed),
            other => Err(CellError::UnknownCommand(other)),
        }
    }
}

/// Relay command byte inside a RELAY cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 0x01,
    Data = 0x02,
    End = 0x03,
    Connected = 0x04,
    Extend = 0x06,
    Extended = 0x07,
    BeginFailed = 0x0b,
    ExtendFailed = 0x0c,
}

impl RelayCommand {
    fn from_byte(byte: u8) -> Result<Self, CellError> {
        match byte {
            0x01 => Ok(Self::Begin),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::Connected),
            0x06 => Ok(Self::Extend),
            0x07 => Ok(Self::Extended),
            0x0b => Ok(Self::BeginFailed),
            0x0c => Ok(Self::ExtendFailed),
            other => Err(CellError::UnknownRelayCommand(other)),
        }
    }
}

/// The stream-bearing portion of a RELAY cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Stream id, scoped to one circuit at its terminal hop
    pub stream_id: u16,

    /// Relay command
    pub command: RelayCommand,

    /// Up to [`RELAY_PAYLOAD_MAX`] bytes of payload
    pub payload: Vec<u8>,
}

impl RelayCell {
    pub fn new(stream_id: u16, command: RelayCommand, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            command,
            payload,
        }
    }

    /// A payload-less relay cell (END, CONNECTED, EXTENDED, *_FAILED)
    pub fn control(stream_id: u16, command: RelayCommand) -> Self {
        Self::new(stream_id, command, Vec::new())
    }
}

/// Decoded command-specific cell body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellBody {
    /// Handshake request: opener's id plus the id the opener believes
    /// it is talking to
    Open { opener: AgentId, target: AgentId },
    Opened { opener: AgentId, target: AgentId },
    OpenFailed { opener: AgentId, target: AgentId },
    Create,
    Created,
    CreateFailed,
    Destroy,
    Relay(RelayCell),
}

impl CellBody {
    pub fn command(&self) -> Command {
        match self {
            Self::Open { .. } => Command::Open,
            Self::Opened { .. } => Command::Opened,
            Self::OpenFailed { .. } => Command::OpenFailed,
            Self::Create => Command::Create,
            Self::Created => Command::Created,
            Self::CreateFailed => Command::CreateFailed,
            Self::Destroy => Command::Destroy,
            Self::Relay(_) => Command::Relay,
        }
    }
}

/// One fixed-size protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit id, scoped to the connection the cell travels on.
    /// OPEN-family cells do not address a circuit and carry 0 here.
    pub circuit_id: u16,

    /// Command-specific body
    pub body: CellBody,
}

impl Cell {
    pub fn new(circuit_id: u16, body: CellBody) -> Self {
        Self { circuit_id, body }
    }

    pub fn open(opener: AgentId, target: AgentId) -> Self {
        Self::new(0, CellBody::Open { opener, target })
    }

    pub fn opened(opener: AgentId, target: AgentId) -> Self {
        Self::new(0, CellBody::Opened { opener, target })
    }

    pub fn open_failed(opener: AgentId, target: AgentId) -> Self {
        Self::new(0, CellBody::OpenFailed { opener, target })
    }

    pub fn relay(circuit_id: u16, relay: RelayCell) -> Self {
        Self::new(circuit_id, CellBody::Relay(relay))
    }

    /// Encode into the fixed wire representation.
    ///
    /// Fails only when a RELAY payload exceeds [`RELAY_PAYLOAD_MAX`];
    /// everything else is infallible by construction.
    pub fn encode(&self) -> Result<[u8; CELL_LEN], CellError> {
        let mut buf = [0u8; CELL_LEN];
        buf[0..2].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[2] = self.body.command() as u8;

        match &self.body {
            CellBody::Open { opener, target }
            | CellBody::Opened { opener, target }
            | CellBody::OpenFailed { opener, target } => {
                buf[3..7].copy_from_slice(&opener.to_be_bytes());
                buf[7..11].copy_from_slice(&target.to_be_bytes());
            }
            CellBody::Create | CellBody::Created | CellBody::CreateFailed | CellBody::Destroy => {}
            CellBody::Relay(relay) => {
                if relay.payload.len() > RELAY_PAYLOAD_MAX {
                    return Err(CellError::PayloadTooLong {
                        len: relay.payload.len(),
                    });
                }
                buf[3..5].copy_from_slice(&relay.stream_id.to_be_bytes());
                // bytes 5..7 stay zero: reserved integrity sentinel
                buf[7..9].copy_from_slice(&(relay.payload.len() as u16).to_be_bytes());
                buf[9] = relay.command as u8;
                buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + relay.payload.len()]
                    .copy_from_slice(&relay.payload);
            }
        }

        Ok(buf)
    }

    /// Decode a wire buffer. The buffer must be exactly [`CELL_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, CellError> {
        if buf.len() != CELL_LEN {
            return Err(CellError::Length { actual: buf.len() });
        }

        let circuit_id = u16::from_be_bytes([buf[0], buf[1]]);
        let body = match Command::from_byte(buf[2])? {
            Command::Open => {
                let (opener, target) = decode_open_body(buf);
                CellBody::Open { opener, target }
            }
            Command::Opened => {
                let (opener, target) = decode_open_body(buf);
                CellBody::Opened { opener, target }
            }
            Command::OpenFailed => {
                let (opener, target) = decode_open_body(buf);
                CellBody::OpenFailed { opener, target }
            }
            Command::Create => CellBody::Create,
            Command::Created => CellBody::Created,
            Command::CreateFailed => CellBody::CreateFailed,
            Command::Destroy => CellBody::Destroy,
            Command::Relay => {
                if buf[5] != 0 || buf[6] != 0 {
                    return Err(CellError::ReservedNonZero);
                }
                let stream_id = u16::from_be_bytes([buf[3], buf[4]]);
                let body_len = u16::from_be_bytes([buf[7], buf[8]]) as usize;
                if body_len > RELAY_PAYLOAD_MAX {
                    return Err(CellError::PayloadTooLong { len: body_len });
                }
                let command = RelayCommand::from_byte(buf[9])?;
                let payload = buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + body_len].to_vec();
                CellBody::Relay(RelayCell {
                    stream_id,
                    command,
                    payload,
                })
            }
        };

        Ok(Self { circuit_id, body })
    }
}

fn decode_open_body(buf: &[u8]) -> (AgentId, AgentId) {
    debug_assert!(buf.len() >= 3 + OPEN_BODY_LEN);
    let opener = AgentId::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]);
    let target = AgentId::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);
    (opener, target)
}

/// Build the `host:port\0` payload of a BEGIN cell.
pub fn begin_payload(host: &str, port: u16) -> Vec<u8> {
    let mut payload = format!("{}:{}", host, port).into_bytes();
    payload.push(0);
    payload
}

/// Build the `host:port\0agentId` payload of an EXTEND cell.
pub fn extend_payload(host: &str, port: u16, agent: AgentId) -> Vec<u8> {
    let mut payload = begin_payload(host, port);
    payload.extend_from_slice(&agent.to_be_bytes());
    payload
}

/// Parse the destination from a BEGIN payload. Bytes after the NUL
/// separator are ignored.
pub fn parse_begin_payload(payload: &[u8]) -> Result<(String, u16), CellError> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(CellError::MissingSeparator)?;
    let text = std::str::from_utf8(&payload[..nul]).map_err(|_| CellError::MalformedBody)?;
    let (host, port) = text.rsplit_once(':').ok_or(CellError::MalformedBody)?;
    if host.is_empty() {
        return Err(CellError::MalformedBody);
    }
    let port: u16 = port.parse().map_err(|_| CellError::MalformedBody)?;
    Ok((host.to_string(), port))
}

/// Parse the destination and target agent from an EXTEND payload. Exactly
/// four bytes of agent id must follow the NUL separator.
pub fn parse_extend_payload(payload: &[u8]) -> Result<(String, u16, AgentId), CellError> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(CellError::MissingSeparator)?;
    let (host, port) = parse_begin_payload(payload)?;
    let tail = &payload[nul + 1..];
    if tail.len() != 4 {
        return Err(CellError::MalformedBody);
    }
    let agent = AgentId::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
    Ok((host, port, agent))
}

/// Cell decode/encode errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CellError {
    #[error("cell length {actual}, expected {CELL_LEN}")]
    Length { actual: usize },

    #[error("unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown relay command byte 0x{0:02x}")]
    UnknownRelayCommand(u8),

    #[error("reserved relay field is non-zero")]
    ReservedNonZero,

    #[error("relay payload length {len} exceeds {RELAY_PAYLOAD_MAX}")]
    PayloadTooLong { len: usize },

    #[error("missing NUL separator in destination body")]
    MissingSeparator,

    #[error("malformed destination body")]
    MalformedBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cell: Cell) -> Cell {
        let wire = cell.encode().unwrap();
        assert_eq!(wire.len(), CELL_LEN);
        Cell::decode(&wire).unwrap()
    }

    #[test]
    fn test_open_family_roundtrip() {
        let opener = AgentId::new(12, 1);
        let target = AgentId::new(34, 2);

        for cell in [
            Cell::open(opener, target),
            Cell::opened(opener, target),
            Cell::open_failed(opener, target),
        ] {
            assert_eq!(roundtrip(cell.clone()), cell);
        }
    }

    #[test]
    fn test_circuit_command_roundtrip() {
        for body in [
            CellBody::Create,
            CellBody::Created,
            CellBody::CreateFailed,
            CellBody::Destroy,
        ] {
            let cell = Cell::new(42, body);
            assert_eq!(roundtrip(cell.clone()), cell);
        }
    }

    #[test]
    fn test_relay_roundtrip() {
        let relay = RelayCell::new(7, RelayCommand::Data, vec![1, 2, 3, 4, 5]);
        let cell = Cell::relay(9, relay);
        assert_eq!(roundtrip(cell.clone()), cell);
    }

    #[test]
    fn test_relay_max_payload() {
        let relay = RelayCell::new(1, RelayCommand::Data, vec![0xAA; RELAY_PAYLOAD_MAX]);
        let cell = Cell::relay(1, relay);
        assert_eq!(roundtrip(cell.clone()), cell);

        let too_big = RelayCell::new(1, RelayCommand::Data, vec![0xAA; RELAY_PAYLOAD_MAX + 1]);
        assert_eq!(
            Cell::relay(1, too_big).encode(),
            Err(CellError::PayloadTooLong {
                len: RELAY_PAYLOAD_MAX + 1
            })
        );
    }

    #[test]
    fn test_field_offsets() {
        let relay = RelayCell::new(0x0102, RelayCommand::Begin, b"x".to_vec());
        let wire = Cell::relay(0x0304, relay).encode().unwrap();

        assert_eq!(&wire[0..2], &[0x03, 0x04]); // circuit id
        assert_eq!(wire[2], 0x03); // RELAY
        assert_eq!(&wire[3..5], &[0x01, 0x02]); // stream id
        assert_eq!(&wire[5..7], &[0x00, 0x00]); // reserved
        assert_eq!(&wire[7..9], &[0x00, 0x01]); // body length
        assert_eq!(wire[9], 0x01); // BEGIN
        assert_eq!(wire[10], b'x');
        assert!(wire[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert_eq!(
            Cell::decode(&[0u8; 100]),
            Err(CellError::Length { actual: 100 })
        );
        assert_eq!(
            Cell::decode(&[0u8; CELL_LEN + 1]),
            Err(CellError::Length {
                actual: CELL_LEN + 1
            })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_commands() {
        let mut wire = [0u8; CELL_LEN];
        wire[2] = 0x7F;
        assert_eq!(Cell::decode(&wire), Err(CellError::UnknownCommand(0x7F)));

        let relay = RelayCell::control(1, RelayCommand::End);
        let mut wire = Cell::relay(1, relay).encode().unwrap();
        wire[9] = 0xEE;
        assert_eq!(
            Cell::decode(&wire),
            Err(CellError::UnknownRelayCommand(0xEE))
        );
    }

    #[test]
    fn test_decode_rejects_nonzero_reserved() {
        let relay = RelayCell::new(3, RelayCommand::Data, vec![9]);
        let mut wire = Cell::relay(3, relay).encode().unwrap();
        wire[6] = 1;
        assert_eq!(Cell::decode(&wire), Err(CellError::ReservedNonZero));
    }

    #[test]
    fn test_begin_payload_parse() {
        let payload = begin_payload("example.com", 80);
        assert_eq!(payload, b"example.com:80\0".to_vec());
        assert_eq!(
            parse_begin_payload(&payload).unwrap(),
            ("example.com".to_string(), 80)
        );

        // trailing bytes after NUL are tolerated
        let mut padded = payload.clone();
        padded.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            parse_begin_payload(&padded).unwrap(),
            ("example.com".to_string(), 80)
        );

        assert!(parse_begin_payload(b"no-separator:80").is_err());
        assert!(parse_begin_payload(b"noport\0").is_err());
        assert!(parse_begin_payload(b":80\0").is_err());
    }

    #[test]
    fn test_extend_payload_parse() {
        let agent = AgentId::new(77, 5);
        let payload = extend_payload("10.0.0.9", 9201, agent);
        assert_eq!(
            parse_extend_payload(&payload).unwrap(),
            ("10.0.0.9".to_string(), 9201, agent)
        );

        // agent id must be exactly four bytes
        assert!(parse_extend_payload(b"10.0.0.9:9201\0").is_err());
        assert!(parse_extend_payload(b"10.0.0.9:9201\0\x01\x02\x03").is_err());
    }

    #[test]
    fn test_ipv6_style_destination() {
        // rsplit keeps the last colon as the port separator
        assert_eq!(
            parse_begin_payload(b"fe80::1:443\0").unwrap(),
            ("fe80::1".to_string(), 443)
        );
    }
}
