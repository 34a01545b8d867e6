use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use crate::{
    exec::{
        event::{EventHandle, EventRegistry, PollEvent},
        io_util::was_interrupted,
        plugin::Plugins,
    },
    log::{dev_info, dev_warn, user_warn},
    system::getrandom,
};

use super::{
    check_request,
    proto::{frame, FrameReader, HelloResponse, InterceptRequest, InterceptResponse},
    InterceptEvent, InterceptHost, InterceptMode,
};

/// Identifies one connection of a [`DsoServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(in crate::exec) struct ConnectionId(usize);

/// Where a connection is in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// The first hello of the command, on the socket it inherited.
    RecvHelloInitial,
    /// The hello of a program that was just accepted, on the connection it was checked on.
    RecvHello,
    /// A fresh TCP connection that has to prove it knows the token.
    RecvSecret,
    RecvPolicyCheck,
    PolicyAccept,
    PolicyReject,
    PolicyError,
}

/// The random value a client must send first on every TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    lo: u64,
    hi: u64,
}

impl Token {
    const LEN: usize = 16;

    fn generate() -> io::Result<Self> {
        let mut bytes = [0u8; Self::LEN];
        loop {
            getrandom(&mut bytes)?;
            let token = Self::from_bytes(bytes);
            if token.lo != 0 || token.hi != 0 {
                return Ok(token);
            }
        }
    }

    fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        let [lo @ .., _, _, _, _, _, _, _, _] = bytes;
        let [_, _, _, _, _, _, _, _, hi @ ..] = bytes;
        Self {
            lo: u64::from_ne_bytes(lo),
            hi: u64::from_ne_bytes(hi),
        }
    }

    fn to_bytes(self) -> [u8; Self::LEN] {
        let mut bytes = [0; Self::LEN];
        bytes[..8].copy_from_slice(&self.lo.to_ne_bytes());
        bytes[8..].copy_from_slice(&self.hi.to_ne_bytes());
        bytes
    }
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.read(buf),
            Stream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(stream) => stream.write(buf),
            Stream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(stream) => stream.as_raw_fd(),
            Stream::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}

struct Connection {
    stream: Stream,
    handle: EventHandle,
    state: State,
    secret: [u8; Token::LEN],
    secret_len: usize,
    frame: FrameReader,
    /// The reply being sent, if any.
    reply: Option<(Vec<u8>, usize)>,
}

enum Next {
    Keep,
    Close,
}

/// Serves the library preloaded into the command.
pub(super) struct DsoServer {
    initial: Option<UnixStream>,
    token: Option<Token>,
    /// Set up by the first hello, polled once the reply to it is sent.
    pending_listener: Option<(TcpListener, u16)>,
    listener: Option<(TcpListener, u16, EventHandle)>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: usize,
}

impl DsoServer {
    /// `initial` is the supervisor end of the socket the command inherits.
    pub(super) fn new(initial: UnixStream) -> Self {
        Self {
            initial: Some(initial),
            token: None,
            pending_listener: None,
            listener: None,
            connections: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub(super) fn register<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        if let Some(initial) = self.initial.take() {
            self.add_connection(Stream::Unix(initial), State::RecvHelloInitial, registry);
        }
    }

    fn add_connection<H: InterceptHost>(
        &mut self,
        stream: Stream,
        state: State,
        registry: &mut EventRegistry<H>,
    ) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let handle = registry.register_event(&stream, PollEvent::Readable, move |_| {
            H::intercept_event(InterceptEvent::Connection(id))
        });

        self.connections.insert(
            id,
            Connection {
                stream,
                handle,
                state,
                secret: [0; Token::LEN],
                secret_len: 0,
                frame: FrameReader::default(),
                reply: None,
            },
        );
    }

    /// Accept every pending connection to the listener.
    pub(super) fn on_listener<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        loop {
            let Some((listener, _, _)) = &self.listener else {
                return;
            };

            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        dev_warn!("cannot make intercept connection non-blocking: {err}");
                        continue;
                    }
                    self.add_connection(Stream::Tcp(stream), State::RecvSecret, registry);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    user_warn!("accept: {err}");
                    return;
                }
            }
        }
    }

    pub(super) fn on_connection<H: InterceptHost>(
        &mut self,
        id: ConnectionId,
        mode: InterceptMode,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<H>,
    ) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };

        let next = if conn.reply.is_some() {
            self.write_reply(id, &mut conn, registry)
        } else {
            self.read_request(id, &mut conn, mode, plugins, registry)
        };

        match next {
            Next::Keep => {
                self.connections.insert(id, conn);
            }
            Next::Close => {
                dev_info!("closing intercept connection {id:?} in state {:?}", conn.state);
                registry.deregister_event(conn.handle);
            }
        }
    }

    fn read_request<H: InterceptHost>(
        &mut self,
        id: ConnectionId,
        conn: &mut Connection,
        mode: InterceptMode,
        plugins: &mut Plugins,
        registry: &mut EventRegistry<H>,
    ) -> Next {
        if conn.state == State::RecvSecret {
            return self.read_secret(conn);
        }

        let message = match conn.frame.read_from(&mut conn.stream) {
            Ok(Some(message)) => message,
            Ok(None) => return Next::Keep,
            Err(err) if was_interrupted(&err) => return Next::Keep,
            Err(err) => {
                if err.kind() != io::ErrorKind::UnexpectedEof {
                    dev_warn!("cannot read intercept request: {err}");
                }
                return Next::Close;
            }
        };

        let response = match InterceptRequest::decode(&message) {
            Ok(InterceptRequest::PolicyCheck(request)) => {
                if conn.state != State::RecvPolicyCheck {
                    dev_warn!("unexpected policy check in state {:?}", conn.state);
                    return Next::Close;
                }
                let response = check_request(mode, plugins, &request);
                conn.state = match response {
                    InterceptResponse::Accept(_) => State::PolicyAccept,
                    InterceptResponse::Reject(_) => State::PolicyReject,
                    _ => State::PolicyError,
                };
                response
            }
            Ok(InterceptRequest::Hello(hello)) => {
                dev_info!("hello from {} in state {:?}", hello.pid, conn.state);
                match conn.state {
                    State::RecvHelloInitial => {
                        if let Err(err) = self.prepare_listener() {
                            user_warn!("unable to set up intercept listener: {err}");
                            return Next::Close;
                        }
                    }
                    State::RecvHello => {}
                    state => {
                        dev_warn!("unexpected hello in state {state:?}");
                        return Next::Close;
                    }
                }
                self.hello_response(mode)
            }
            Err(err) => {
                dev_warn!("malformed intercept request: {err}");
                conn.state = State::PolicyError;
                InterceptResponse::Error(format!("malformed request: {err}"))
            }
        };

        match frame(&response.encode()) {
            Ok(reply) => conn.reply = Some((reply, 0)),
            Err(err) => {
                dev_warn!("cannot send intercept response: {err}");
                return Next::Close;
            }
        }

        Self::switch_event(id, conn, PollEvent::Writable, registry);
        Next::Keep
    }

    fn read_secret(&self, conn: &mut Connection) -> Next {
        let Some(token) = self.token else {
            return Next::Close;
        };

        match conn.stream.read(&mut conn.secret[conn.secret_len..]) {
            Ok(0) => return Next::Close,
            Ok(read) => conn.secret_len += read,
            Err(err) if was_interrupted(&err) => return Next::Keep,
            Err(err) => {
                dev_warn!("cannot read intercept token: {err}");
                return Next::Close;
            }
        }

        if conn.secret_len < Token::LEN {
            return Next::Keep;
        }

        if Token::from_bytes(conn.secret) != token {
            dev_warn!("intercept connection sent the wrong token");
            return Next::Close;
        }

        conn.state = State::RecvPolicyCheck;
        Next::Keep
    }

    fn write_reply<H: InterceptHost>(
        &mut self,
        id: ConnectionId,
        conn: &mut Connection,
        registry: &mut EventRegistry<H>,
    ) -> Next {
        let Some((reply, written)) = &mut conn.reply else {
            return Next::Keep;
        };

        match conn.stream.write(&reply[*written..]) {
            Ok(n) => *written += n,
            Err(err) if was_interrupted(&err) => return Next::Keep,
            Err(err) => {
                dev_warn!("cannot send intercept response: {err}");
                return Next::Close;
            }
        }

        if *written < reply.len() {
            return Next::Keep;
        }
        conn.reply = None;

        match conn.state {
            State::RecvHelloInitial => {
                // From now on the command reaches us through the listener.
                self.listen(registry);
                Next::Close
            }
            State::PolicyAccept => {
                // The accepted program says hello on this connection once it runs.
                conn.state = State::RecvHello;
                conn.frame = FrameReader::default();
                Self::switch_event(id, conn, PollEvent::Readable, registry);
                Next::Keep
            }
            _ => Next::Close,
        }
    }

    fn switch_event<H: InterceptHost>(
        id: ConnectionId,
        conn: &mut Connection,
        poll_event: PollEvent,
        registry: &mut EventRegistry<H>,
    ) {
        let handle = registry.register_event(&conn.stream, poll_event, move |_| {
            H::intercept_event(InterceptEvent::Connection(id))
        });
        registry.deregister_event(std::mem::replace(&mut conn.handle, handle));
    }

    fn prepare_listener(&mut self) -> io::Result<()> {
        if self.listener.is_some() || self.pending_listener.is_some() {
            return Ok(());
        }

        let token = Token::generate()?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        dev_info!("listening for intercepted commands on port {port}");

        self.token = Some(token);
        self.pending_listener = Some((listener, port));
        Ok(())
    }

    fn listen<H: InterceptHost>(&mut self, registry: &mut EventRegistry<H>) {
        if let Some((listener, port)) = self.pending_listener.take() {
            let handle = registry.register_event(&listener, PollEvent::Readable, |_| {
                H::intercept_event(InterceptEvent::Listener)
            });
            self.listener = Some((listener, port, handle));
        }
    }

    fn hello_response(&self, mode: InterceptMode) -> InterceptResponse {
        let token = self.token.unwrap_or(Token { lo: 0, hi: 0 });
        let port = self
            .listener
            .as_ref()
            .map(|(_, port, _)| *port)
            .or(self.pending_listener.as_ref().map(|(_, port)| *port))
            .unwrap_or(0);

        InterceptResponse::Hello(HelloResponse {
            token_lo: token.lo,
            token_hi: token.hi,
            port: i32::from(port),
            log_only: mode == InterceptMode::LogOnly,
        })
    }
}
