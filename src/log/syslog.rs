use std::{ffi::CString, fmt};

use super::{Level, Log};
use crate::system::syslog;

/// Longest message body handed to a single `syslog` call.
const MAX_MSG_LEN: usize = 960;

pub struct Syslog;

impl Log for Syslog {
    fn log(&self, level: Level, args: &fmt::Arguments<'_>) {
        let priority = match level {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        for chunk in split_message(&args.to_string(), MAX_MSG_LEN) {
            // Interior NUL bytes cannot be passed on, drop them.
            let chunk = CString::new(chunk.replace('\0', "")).unwrap_or_default();
            syslog(priority, libc::LOG_AUTH, &chunk);
        }
    }

    fn flush(&self) {
        // pass
    }
}

/// Cut a message into pieces of at most `max_len` bytes, preferably at whitespace, marking
/// where a piece was continued.
fn split_message(message: &str, max_len: usize) -> Vec<String> {
    if message.len() <= max_len {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = message;

    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }

        let mut end = max_len;
        // floor_char_boundary is currently unstable
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if let Some(space) = rest[..end].rfind(char::is_whitespace) {
            end = space + 1;
        }

        chunks.push(format!("{}[...]", &rest[..end]));
        rest = &rest[end..];
    }

    for chunk in chunks.iter_mut().skip(1) {
        chunk.insert_str(0, "[...] ");
    }

    chunks
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{split_message, Syslog};
    use crate::log::{Level, Log};

    #[test]
    fn can_write_to_syslog() {
        Syslog.log(Level::Info, &format_args!("Hello World!"));
    }

    #[test]
    fn short_messages_are_untouched() {
        assert_eq!(split_message("rm -rf /tmp/x", 960), vec!["rm -rf /tmp/x"]);
    }

    #[test]
    fn long_messages_are_cut_at_whitespace() {
        let chunks = split_message("aaaa bbbb cccc", 7);
        assert_eq!(chunks, vec!["aaaa [...]", "[...] bbbb [...]", "[...] cccc"]);
    }

    #[test]
    fn cuts_respect_char_boundaries() {
        let chunks = split_message("ééééé", 3);
        assert!(chunks.iter().all(|c| c.contains('é')));
        assert_eq!(chunks.len(), 5);
    }
}
