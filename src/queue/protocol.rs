//! Wire framing for the client ⇄ supervisor pipe (spec §4.3, §6).
//!
//! Commands are null-terminated ASCII/byte strings:
//!
//! | Command            | Direction           | Response              |
//! |---------------------|----------------------|------------------------|
//! | `EXEC <abs-path>\0` | client → supervisor | none                   |
//! | `FLUSH\0`           | client → supervisor | single byte `'1'`      |
//!
//! This module only deals with encoding/decoding the bytes; the supervisor
//! owns buffering the partial reads and the client owns writing them.

use std::ffi::OsStr;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

pub(crate) const EXEC_PREFIX: &[u8] = b"EXEC ";
pub(crate) const FLUSH_COMMAND: &[u8] = b"FLUSH";
/// One ack byte written by the supervisor in response to `FLUSH`.
pub(crate) const ACK_BYTE: u8 = b'1';

/// A command as understood by the supervisor.
pub(crate) enum Command {
    Exec(PathBuf),
    Flush,
    /// Recognized but meaningless bytes; logged and ignored (spec §4.3).
    Unknown,
}

/// Parse one null-terminated command (the trailing `\0` already stripped).
pub(crate) fn parse(body: &[u8]) -> Command {
    if let Some(path) = body.strip_prefix(EXEC_PREFIX) {
        #[cfg(unix)]
        let path = PathBuf::from(OsStr::from_bytes(path));
        #[cfg(not(unix))]
        let path = PathBuf::from(String::from_utf8_lossy(path).into_owned());
        Command::Exec(path)
    } else if body == FLUSH_COMMAND {
        Command::Flush
    } else {
        Command::Unknown
    }
}

/// Encode an `EXEC <path>\0` command.
pub(crate) fn encode_exec(path: &std::path::Path) -> Vec<u8> {
    let mut buf = Vec::with_capacity(EXEC_PREFIX.len() + path.as_os_str().len() + 1);
    buf.extend_from_slice(EXEC_PREFIX);
    #[cfg(unix)]
    buf.extend_from_slice(path.as_os_str().as_bytes());
    #[cfg(not(unix))]
    buf.extend_from_slice(path.to_string_lossy().as_bytes());
    buf.push(0);
    buf
}

/// Encode a `FLUSH\0` command.
pub(crate) fn encode_flush() -> Vec<u8> {
    let mut buf = Vec::with_capacity(FLUSH_COMMAND.len() + 1);
    buf.extend_from_slice(FLUSH_COMMAND);
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_exec() {
        let encoded = encode_exec(std::path::Path::new("/tmp/a b"));
        assert_eq!(encoded, b"EXEC /tmp/a b\0");
        let body = &encoded[..encoded.len() - 1];
        match parse(body) {
            Command::Exec(p) => assert_eq!(p, std::path::PathBuf::from("/tmp/a b")),
            _ => panic!("expected Exec"),
        }
    }

    #[test]
    fn round_trips_flush() {
        let encoded = encode_flush();
        assert_eq!(encoded, b"FLUSH\0");
        let body = &encoded[..encoded.len() - 1];
        assert!(matches!(parse(body), Command::Flush));
    }

    #[test]
    fn unknown_command_is_ignored_not_rejected() {
        assert!(matches!(parse(b"PING"), Command::Unknown));
    }
}
