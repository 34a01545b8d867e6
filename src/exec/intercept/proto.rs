//! Messages exchanged with an intercepted command.
//!
//! Every message is a `u32` length in host byte order followed by that many bytes of a protocol
//! buffers encoded `InterceptRequest` or `InterceptResponse`. Only the subset of the protocol
//! buffers wire format these messages need is implemented.
use std::{
    ffi::{OsStr, OsString},
    io::{self, Read, Write},
    os::unix::ffi::{OsStrExt, OsStringExt},
};

/// The largest message either side accepts.
pub(crate) const MESSAGE_SIZE_MAX: usize = 2 * 1024 * 1024;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptRequest {
    PolicyCheck(PolicyCheckRequest),
    Hello(ClientHello),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub pid: i32,
}

/// A command asks whether it may execute `command`. An empty `command` or `cwd` is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyCheckRequest {
    pub command: OsString,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
    pub cwd: OsString,
    pub intercept_fd: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptResponse {
    Hello(HelloResponse),
    Accept(PolicyAcceptMessage),
    Reject(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloResponse {
    pub token_lo: u64,
    pub token_hi: u64,
    pub port: i32,
    /// The supervisor only records sub-commands, it does not check them.
    pub log_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyAcceptMessage {
    pub run_command: OsString,
    pub run_argv: Vec<OsString>,
    pub run_envp: Vec<OsString>,
}

#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn raw_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.raw_varint(u64::from(field) << 3 | u64::from(wire_type));
    }

    fn int32(&mut self, field: u32, value: i32) {
        if value != 0 {
            self.key(field, WIRE_VARINT);
            // Negative values are sign extended to 64 bits.
            self.raw_varint(i64::from(value) as u64);
        }
    }

    fn bool(&mut self, field: u32, value: bool) {
        if value {
            self.key(field, WIRE_VARINT);
            self.raw_varint(1);
        }
    }

    fn fixed64(&mut self, field: u32, value: u64) {
        if value != 0 {
            self.key(field, WIRE_FIXED64);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn len_delimited(&mut self, field: u32, bytes: &[u8]) {
        self.key(field, WIRE_LEN);
        self.raw_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    fn string(&mut self, field: u32, value: &OsStr) {
        if !value.is_empty() {
            self.len_delimited(field, value.as_bytes());
        }
    }

    fn repeated(&mut self, field: u32, values: &[OsString]) {
        for value in values {
            self.len_delimited(field, value.as_bytes());
        }
    }

    fn message(&mut self, field: u32, fill: impl FnOnce(&mut Encoder)) {
        let mut inner = Encoder::default();
        fill(&mut inner);
        self.len_delimited(field, &inner.buf);
    }
}

enum Value<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32,
}

impl<'a> Value<'a> {
    fn int32(&self) -> io::Result<i32> {
        match *self {
            Value::Varint(value) => Ok(value as i32),
            _ => Err(malformed("expected a varint")),
        }
    }

    fn fixed64(&self) -> io::Result<u64> {
        match *self {
            Value::Fixed64(value) => Ok(value),
            _ => Err(malformed("expected a fixed64")),
        }
    }

    fn bytes(&self) -> io::Result<&'a [u8]> {
        match *self {
            Value::Bytes(bytes) => Ok(bytes),
            _ => Err(malformed("expected a length delimited field")),
        }
    }

    fn os_string(&self) -> io::Result<OsString> {
        self.bytes().map(|bytes| OsString::from_vec(bytes.to_vec()))
    }

    fn string(&self) -> io::Result<String> {
        self.bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

fn malformed(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed message: {what}"))
}

struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, len: usize) -> io::Result<&'a [u8]> {
        if len > self.buf.len() {
            return Err(malformed("truncated field"));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn raw_varint(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.take(1)?[0];
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(malformed("varint is too long"))
    }

    /// The next field number and its value.
    fn next_field(&mut self) -> io::Result<Option<(u32, Value<'a>)>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let key = self.raw_varint()?;
        let field = u32::try_from(key >> 3).map_err(|_| malformed("field number"))?;
        let value = match (key & 0x7) as u8 {
            WIRE_VARINT => Value::Varint(self.raw_varint()?),
            WIRE_FIXED64 => {
                let mut bytes = [0; 8];
                bytes.copy_from_slice(self.take(8)?);
                Value::Fixed64(u64::from_le_bytes(bytes))
            }
            WIRE_LEN => {
                let len = usize::try_from(self.raw_varint()?).map_err(|_| malformed("length"))?;
                Value::Bytes(self.take(len)?)
            }
            WIRE_FIXED32 => {
                self.take(4)?;
                Value::Fixed32
            }
            _ => return Err(malformed("unsupported wire type")),
        };

        Ok(Some((field, value)))
    }
}

impl InterceptRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::default();
        match self {
            InterceptRequest::PolicyCheck(req) => enc.message(1, |enc| {
                enc.string(1, &req.command);
                enc.repeated(2, &req.argv);
                enc.repeated(3, &req.envp);
                enc.string(4, &req.cwd);
                enc.int32(5, req.intercept_fd);
            }),
            InterceptRequest::Hello(hello) => enc.message(2, |enc| enc.int32(1, hello.pid)),
        }
        enc.buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut request = None;
        let mut dec = Decoder::new(buf);

        while let Some((field, value)) = dec.next_field()? {
            match field {
                1 => {
                    let mut req = PolicyCheckRequest::default();
                    let mut inner = Decoder::new(value.bytes()?);
                    while let Some((field, value)) = inner.next_field()? {
                        match field {
                            1 => req.command = value.os_string()?,
                            2 => req.argv.push(value.os_string()?),
                            3 => req.envp.push(value.os_string()?),
                            4 => req.cwd = value.os_string()?,
                            5 => req.intercept_fd = value.int32()?,
                            _ => {}
                        }
                    }
                    request = Some(InterceptRequest::PolicyCheck(req));
                }
                2 => {
                    let mut hello = ClientHello::default();
                    let mut inner = Decoder::new(value.bytes()?);
                    while let Some((field, value)) = inner.next_field()? {
                        if field == 1 {
                            hello.pid = value.int32()?;
                        }
                    }
                    request = Some(InterceptRequest::Hello(hello));
                }
                _ => {}
            }
        }

        request.ok_or_else(|| malformed("InterceptRequest without a type"))
    }
}

impl InterceptResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::default();
        match self {
            InterceptResponse::Hello(hello) => enc.message(1, |enc| {
                enc.fixed64(1, hello.token_lo);
                enc.fixed64(2, hello.token_hi);
                enc.int32(3, hello.port);
                enc.bool(4, hello.log_only);
            }),
            InterceptResponse::Accept(accept) => enc.message(2, |enc| {
                enc.string(1, &accept.run_command);
                enc.repeated(2, &accept.run_argv);
                enc.repeated(3, &accept.run_envp);
            }),
            InterceptResponse::Reject(message) => {
                enc.message(3, |enc| enc.string(1, OsStr::new(message)))
            }
            InterceptResponse::Error(message) => {
                enc.message(4, |enc| enc.string(1, OsStr::new(message)))
            }
        }
        enc.buf
    }

    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut response = None;
        let mut dec = Decoder::new(buf);

        while let Some((field, value)) = dec.next_field()? {
            let mut inner = match value {
                Value::Bytes(bytes) => Decoder::new(bytes),
                _ => continue,
            };

            match field {
                1 => {
                    let mut hello = HelloResponse::default();
                    while let Some((field, value)) = inner.next_field()? {
                        match field {
                            1 => hello.token_lo = value.fixed64()?,
                            2 => hello.token_hi = value.fixed64()?,
                            3 => hello.port = value.int32()?,
                            4 => hello.log_only = value.int32()? != 0,
                            _ => {}
                        }
                    }
                    response = Some(InterceptResponse::Hello(hello));
                }
                2 => {
                    let mut accept = PolicyAcceptMessage::default();
                    while let Some((field, value)) = inner.next_field()? {
                        match field {
                            1 => accept.run_command = value.os_string()?,
                            2 => accept.run_argv.push(value.os_string()?),
                            3 => accept.run_envp.push(value.os_string()?),
                            _ => {}
                        }
                    }
                    response = Some(InterceptResponse::Accept(accept));
                }
                3 | 4 => {
                    let mut message = String::new();
                    while let Some((field, value)) = inner.next_field()? {
                        if field == 1 {
                            message = value.string()?;
                        }
                    }
                    response = Some(if field == 3 {
                        InterceptResponse::Reject(message)
                    } else {
                        InterceptResponse::Error(message)
                    });
                }
                _ => {}
            }
        }

        response.ok_or_else(|| malformed("InterceptResponse without a type"))
    }
}

/// Prefix `message` with its length.
pub(crate) fn frame(message: &[u8]) -> io::Result<Vec<u8>> {
    if message.len() > MESSAGE_SIZE_MAX {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {}", message.len()),
        ));
    }

    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&(message.len() as u32).to_ne_bytes());
    framed.extend_from_slice(message);
    Ok(framed)
}

/// Write one length prefixed message, blocking until it is sent.
pub(crate) fn write_message<W: Write>(writer: &mut W, message: &[u8]) -> io::Result<()> {
    writer.write_all(&frame(message)?)
}

/// Read one length prefixed message, blocking until it has arrived.
pub(crate) fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut frame = FrameReader::default();
    loop {
        if let Some(message) = frame.read_from(reader)? {
            return Ok(message);
        }
    }
}

/// Collects a length prefixed message from a non-blocking source across several reads.
#[derive(Debug, Default)]
pub(crate) struct FrameReader {
    len_buf: [u8; 4],
    len_read: usize,
    body: Vec<u8>,
    body_len: Option<usize>,
}

impl FrameReader {
    /// Read what is available. Returns the message once it is complete.
    pub(crate) fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        let body_len = match self.body_len {
            Some(len) => len,
            None => {
                let read = match reader.read(&mut self.len_buf[self.len_read..]) {
                    Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                    Ok(read) => read,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(err) => return Err(err),
                };
                self.len_read += read;
                if self.len_read < self.len_buf.len() {
                    return Ok(None);
                }

                let len = u32::from_ne_bytes(self.len_buf) as usize;
                if len > MESSAGE_SIZE_MAX {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("client request too large: {len}"),
                    ));
                }
                self.body_len = Some(len);
                self.body = vec![0; len];
                self.len_read = 0;
                len
            }
        };

        let filled = self.len_read;
        if filled < body_len {
            let read = match reader.read(&mut self.body[filled..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err),
            };
            self.len_read += read;
            if self.len_read < body_len {
                return Ok(None);
            }
        }

        self.body_len = None;
        self.len_read = 0;
        Ok(Some(std::mem::take(&mut self.body)))
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, io};

    use pretty_assertions::assert_eq;

    use super::{
        frame, ClientHello, FrameReader, HelloResponse, InterceptRequest, InterceptResponse,
        PolicyAcceptMessage, PolicyCheckRequest, MESSAGE_SIZE_MAX,
    };

    fn os(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    #[test]
    fn policy_check_requests_survive_the_wire() {
        let requests = [
            PolicyCheckRequest {
                command: "/usr/bin/id".into(),
                argv: os(&["id", "-u"]),
                envp: os(&["PATH=/usr/bin", "HOME=/root"]),
                cwd: "/tmp".into(),
                intercept_fd: 64,
            },
            PolicyCheckRequest {
                argv: os(&["", ""]),
                ..Default::default()
            },
            PolicyCheckRequest {
                intercept_fd: -1,
                ..Default::default()
            },
        ];

        for req in requests {
            let req = InterceptRequest::PolicyCheck(req);
            assert_eq!(InterceptRequest::decode(&req.encode()).unwrap(), req);
        }

        let hello = InterceptRequest::Hello(ClientHello { pid: 1234 });
        assert_eq!(InterceptRequest::decode(&hello.encode()).unwrap(), hello);
    }

    #[test]
    fn responses_survive_the_wire() {
        let responses = [
            InterceptResponse::Hello(HelloResponse {
                token_lo: u64::MAX,
                token_hi: 7,
                port: 40000,
                log_only: true,
            }),
            InterceptResponse::Accept(PolicyAcceptMessage {
                run_command: "/bin/ls".into(),
                run_argv: os(&["/bin/ls", "-l"]),
                run_envp: vec![],
            }),
            InterceptResponse::Reject("command rejected by policy".into()),
            InterceptResponse::Error(String::new()),
        ];

        for resp in responses {
            assert_eq!(InterceptResponse::decode(&resp.encode()).unwrap(), resp);
        }
    }

    #[test]
    fn hello_bytes_match_the_protobuf_encoding() {
        let hello = InterceptRequest::Hello(ClientHello { pid: 300 });
        // field 2, length 3, field 1 varint 300
        assert_eq!(hello.encode(), vec![0x12, 0x03, 0x08, 0xac, 0x02]);
    }

    #[test]
    fn unknown_fields_are_skipped_and_garbage_rejected() {
        let mut bytes = vec![0x3d, 1, 2, 3, 4]; // field 7, fixed32
        bytes.extend(InterceptRequest::Hello(ClientHello { pid: 1 }).encode());
        assert_eq!(
            InterceptRequest::decode(&bytes).unwrap(),
            InterceptRequest::Hello(ClientHello { pid: 1 })
        );

        assert!(InterceptRequest::decode(&[]).is_err());
        assert!(InterceptRequest::decode(&[0x0a, 0x05, 0x00]).is_err());
        assert!(InterceptResponse::decode(&[0x0f]).is_err());
    }

    /// Hands out its data a few bytes at a time and then reports that it would block.
    struct Trickle {
        data: Vec<u8>,
        step: usize,
        blocked: bool,
    }

    impl io::Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.blocked = !self.blocked;
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let len = self.step.min(buf.len()).min(self.data.len());
            buf[..len].copy_from_slice(&self.data[..len]);
            self.data.drain(..len);
            Ok(len)
        }
    }

    #[test]
    fn frames_are_reassembled() {
        let message = InterceptRequest::Hello(ClientHello { pid: 99 }).encode();
        let mut source = Trickle {
            data: frame(&message).unwrap(),
            step: 3,
            blocked: false,
        };

        let mut reader = FrameReader::default();
        let received = loop {
            if let Some(received) = reader.read_from(&mut source).unwrap() {
                break received;
            }
        };
        assert_eq!(received, message);
    }

    #[test]
    fn size_limit_is_inclusive() {
        let mut at_limit = (MESSAGE_SIZE_MAX as u32).to_ne_bytes().to_vec();
        at_limit.resize(4 + MESSAGE_SIZE_MAX, 0);
        let message = FrameReader::default()
            .read_from(&mut at_limit.as_slice())
            .unwrap()
            .unwrap();
        assert_eq!(message.len(), MESSAGE_SIZE_MAX);

        let over_limit = (MESSAGE_SIZE_MAX as u32 + 1).to_ne_bytes();
        let err = FrameReader::default()
            .read_from(&mut over_limit.as_slice())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        assert!(frame(&vec![0; MESSAGE_SIZE_MAX + 1]).is_err());
    }
}
