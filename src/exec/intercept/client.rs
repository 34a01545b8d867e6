use std::{
    ffi::{OsStr, OsString},
    fs::File,
    io::{self, Write},
    net::{Ipv4Addr, TcpStream},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

use crate::{
    log::dev_warn,
    system::{dup_at_least, getpid, is_fd_open},
};

use super::{
    proto::{
        read_message, write_message, ClientHello, InterceptRequest, InterceptResponse,
        PolicyCheckRequest,
    },
    set_env, INTERCEPT_FD_ENV, INTERCEPT_FD_MIN,
};

/// A program the supervisor allowed to be executed.
///
/// `channel` has to stay open until the program is executed: the program reports back to the
/// supervisor through it.
#[derive(Debug)]
pub struct ApprovedExec {
    pub command: OsString,
    pub argv: Vec<OsString>,
    /// Environment for the program, pointing `SUDO_INTERCEPT_FD` at `channel`.
    pub envp: Vec<OsString>,
    channel: OwnedFd,
}

impl ApprovedExec {
    pub fn channel(&self) -> BorrowedFd<'_> {
        self.channel.as_fd()
    }
}

/// The side of the intercept protocol that runs inside an intercepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptClient {
    token_lo: u64,
    token_hi: u64,
    port: u16,
    log_only: bool,
}

fn denied(message: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, message.to_string())
}

fn as_denial(err: io::Error) -> io::Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        err
    } else {
        dev_warn!("cannot talk to the intercept server: {err}");
        denied(err)
    }
}

impl InterceptClient {
    /// Introduce this process to the supervisor through the descriptor named in
    /// `SUDO_INTERCEPT_FD`.
    pub fn from_env() -> io::Result<Self> {
        let value = std::env::var_os(INTERCEPT_FD_ENV)
            .ok_or_else(|| denied(format!("{INTERCEPT_FD_ENV} is not set")))?;
        let fd = parse_fd(&value)?;

        // SAFETY: the supervisor handed this descriptor to us and nothing else uses it.
        #[allow(unsafe_code)]
        let channel = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::hello(channel)
    }

    /// Say hello over `channel` and learn how to reach the supervisor from now on.
    pub fn hello(channel: OwnedFd) -> io::Result<Self> {
        Self::try_hello(channel).map_err(as_denial)
    }

    fn try_hello(channel: OwnedFd) -> io::Result<Self> {
        let mut channel = File::from(channel);
        let hello = InterceptRequest::Hello(ClientHello {
            pid: getpid().get(),
        });

        let response = exchange(&mut channel, &hello)?;
        let InterceptResponse::Hello(hello) = response else {
            return Err(denied(format!("unexpected response to hello: {response:?}")));
        };

        let port = u16::try_from(hello.port)
            .ok()
            .filter(|&port| port != 0)
            .ok_or_else(|| denied(format!("invalid port {}", hello.port)))?;

        Ok(Self {
            token_lo: hello.token_lo,
            token_hi: hello.token_hi,
            port,
            log_only: hello.log_only,
        })
    }

    /// Whether sub-commands are only recorded. The supervisor answers anyway.
    pub fn log_only(&self) -> bool {
        self.log_only
    }

    /// Ask the supervisor whether `command` may be executed with `argv` and `envp` from `cwd`.
    ///
    /// Rejections and failures to talk to the supervisor alike come back as
    /// [`io::ErrorKind::PermissionDenied`].
    pub fn check_exec(
        &self,
        command: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        cwd: &OsStr,
    ) -> io::Result<ApprovedExec> {
        self.try_check_exec(command, argv, envp, cwd)
            .map_err(as_denial)
    }

    fn try_check_exec(
        &self,
        command: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        cwd: &OsStr,
    ) -> io::Result<ApprovedExec> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port))?;

        let mut token = [0u8; 16];
        token[..8].copy_from_slice(&self.token_lo.to_ne_bytes());
        token[8..].copy_from_slice(&self.token_hi.to_ne_bytes());
        stream.write_all(&token)?;

        let request = InterceptRequest::PolicyCheck(PolicyCheckRequest {
            command: command.to_owned(),
            argv: argv.to_vec(),
            envp: envp.to_vec(),
            cwd: cwd.to_owned(),
            intercept_fd: stream.as_raw_fd(),
        });

        match exchange(&mut stream, &request)? {
            InterceptResponse::Accept(accept) => {
                let channel = dup_at_least(&stream, INTERCEPT_FD_MIN)?;
                let mut envp = accept.run_envp;
                set_env(
                    &mut envp,
                    INTERCEPT_FD_ENV,
                    channel.as_raw_fd().to_string().as_ref(),
                );

                Ok(ApprovedExec {
                    command: accept.run_command,
                    argv: accept.run_argv,
                    envp,
                    channel,
                })
            }
            InterceptResponse::Reject(message) | InterceptResponse::Error(message) => {
                Err(denied(message))
            }
            InterceptResponse::Hello(_) => Err(denied("unexpected hello response")),
        }
    }
}

fn parse_fd(value: &OsStr) -> io::Result<RawFd> {
    let fd = value
        .to_str()
        .and_then(|value| value.parse::<RawFd>().ok())
        .ok_or_else(|| denied(format!("invalid {INTERCEPT_FD_ENV}")))?;

    if fd < INTERCEPT_FD_MIN || !is_fd_open(fd) {
        return Err(denied(format!("invalid {INTERCEPT_FD_ENV}: {fd}")));
    }

    Ok(fd)
}

fn exchange<S: io::Read + Write>(
    stream: &mut S,
    request: &InterceptRequest,
) -> io::Result<InterceptResponse> {
    write_message(stream, &request.encode())?;
    InterceptResponse::decode(&read_message(stream)?)
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::OsString,
        io::{self, Read, Write},
        net::TcpListener,
        os::{fd::OwnedFd, unix::net::UnixStream},
        thread,
    };

    use pretty_assertions::assert_eq;

    use crate::exec::intercept::proto::{
        read_message, write_message, HelloResponse, InterceptRequest, InterceptResponse,
        PolicyAcceptMessage,
    };

    use super::{parse_fd, InterceptClient};

    fn os(values: &[&str]) -> Vec<OsString> {
        values.iter().map(OsString::from).collect()
    }

    /// Answers one hello with `port` and then one policy check per entry of `replies`.
    fn fake_supervisor(replies: Vec<InterceptResponse>) -> (UnixStream, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        let thread = thread::spawn(move || {
            let hello = InterceptRequest::decode(&read_message(&mut ours).unwrap()).unwrap();
            assert!(matches!(hello, InterceptRequest::Hello(_)));
            let response = InterceptResponse::Hello(HelloResponse {
                token_lo: 7,
                token_hi: 9,
                port: port.into(),
                log_only: false,
            });
            write_message(&mut ours, &response.encode()).unwrap();

            for reply in replies {
                let (mut conn, _) = listener.accept().unwrap();
                let mut token = [0; 16];
                conn.read_exact(&mut token).unwrap();
                assert_eq!(&token[..8], &7u64.to_ne_bytes());
                assert_eq!(&token[8..], &9u64.to_ne_bytes());

                let request = InterceptRequest::decode(&read_message(&mut conn).unwrap()).unwrap();
                let InterceptRequest::PolicyCheck(request) = request else {
                    panic!("expected a policy check");
                };
                assert_eq!(request.command, "/bin/echo");
                write_message(&mut conn, &reply.encode()).unwrap();
                conn.flush().unwrap();
            }
        });

        (theirs, thread)
    }

    #[test]
    fn accepted_programs_get_a_channel() {
        let accept = InterceptResponse::Accept(PolicyAcceptMessage {
            run_command: "/bin/echo".into(),
            run_argv: os(&["/bin/echo", "hi"]),
            run_envp: os(&["SUDO_INTERCEPT_FD=3", "PATH=/bin"]),
        });
        let (channel, thread) =
            fake_supervisor(vec![accept, InterceptResponse::Reject("nope".into())]);

        let client = InterceptClient::hello(OwnedFd::from(channel)).unwrap();
        assert!(!client.log_only());

        let approved = client
            .check_exec("/bin/echo".as_ref(), &os(&["echo", "hi"]), &os(&["PATH=/bin"]), "/".as_ref())
            .unwrap();
        assert_eq!(approved.command, "/bin/echo");
        assert_eq!(approved.argv, os(&["/bin/echo", "hi"]));
        let fd = std::os::fd::AsRawFd::as_raw_fd(&approved.channel());
        assert!(fd >= 64);
        assert_eq!(
            approved.envp,
            os(&[&format!("SUDO_INTERCEPT_FD={fd}"), "PATH=/bin"])
        );

        let err = client
            .check_exec("/bin/echo".as_ref(), &os(&["echo"]), &os(&["PATH=/bin"]), "/".as_ref())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "nope");

        thread.join().unwrap();

        // Nobody is listening anymore.
        let err = client
            .check_exec("/bin/echo".as_ref(), &os(&["echo"]), &os(&["PATH=/bin"]), "/".as_ref())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn the_descriptor_must_be_high_and_open() {
        assert!(parse_fd("abc".as_ref()).is_err());
        assert!(parse_fd("2".as_ref()).is_err());
        assert!(parse_fd("1000000".as_ref()).is_err());

        let (a, _b) = UnixStream::pair().unwrap();
        let high = crate::system::dup_at_least(&a, 64).unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&high);
        assert_eq!(parse_fd(fd.to_string().as_ref()).unwrap(), fd);
    }

    #[test]
    fn a_broken_hello_is_a_denial() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        theirs.write_all(&[0xff; 3]).unwrap();
        drop(theirs);

        let err = InterceptClient::hello(OwnedFd::from(ours)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
