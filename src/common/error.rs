use std::{fmt, io, path::PathBuf};

use crate::log::user_error;

#[derive(Debug)]
pub enum Error {
    /// An I/O failure, optionally tied to the path it happened on.
    Io(Option<PathBuf>, io::Error),
    /// No pseudo-terminal could be set up for the command.
    Pty(io::Error),
    /// A plugin refused to cooperate.
    Plugin {
        plugin: &'static str,
        message: String,
    },
    InvalidCommand(PathBuf),
    Options(String),
}

impl Error {
    /// Tell the user about this error through the user log.
    pub fn report(&self) {
        user_error!("{self}");
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(location, e) => {
                if let Some(path) = location {
                    write!(f, "cannot execute '{}': {e}", path.display())
                } else {
                    write!(f, "IO error: {e}")
                }
            }
            Error::Pty(e) => write!(f, "unable to allocate pty: {e}"),
            Error::Plugin { plugin, message } => write!(f, "{plugin} plugin error: {message}"),
            Error::InvalidCommand(p) => write!(f, "'{}': invalid command", p.display()),
            Error::Options(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(_, e) | Error::Pty(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(None, err)
    }
}
