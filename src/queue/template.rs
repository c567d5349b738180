//! Shell-quoting and `{}` substitution for `cmd_template` (spec §4.6).
//!
//! Operates on raw bytes rather than `str` so that paths which are not valid
//! UTF-8 (legal on most Unix filesystems) still round-trip exactly.

/// POSIX single-quote a byte string: wrap it in `'...'`, escaping any
/// embedded `'` as `'\''` (close the quote, emit an escaped quote, reopen
/// the quote). Deliberately hand-rolled rather than delegated to a
/// shell-escaping crate, so that the set of escaped characters is exactly
/// the one byte that matters inside single quotes.
pub(crate) fn shell_quote(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'\'');
    for &b in bytes {
        if b == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(b);
        }
    }
    out.push(b'\'');
    out
}

/// Replace every occurrence of the literal token `{}` in `template` with the
/// shell-quoted `path`.
pub(crate) fn expand(template: &str, path: &[u8]) -> Vec<u8> {
    let quoted = shell_quote(path);
    let template = template.as_bytes();
    let mut out = Vec::with_capacity(template.len());
    let mut i = 0;
    while i < template.len() {
        if template[i..].starts_with(b"{}") {
            out.extend_from_slice(&quoted);
            i += 2;
        } else {
            out.push(template[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_path() {
        assert_eq!(shell_quote(b"/tmp/a"), b"'/tmp/a'");
    }

    #[test]
    fn escapes_embedded_quote() {
        assert_eq!(shell_quote(b"/tmp/it's"), b"'/tmp/it'\\''s'");
    }

    #[test]
    fn substitutes_single_token() {
        let cmd = expand("touch {}", b"/tmp/a b");
        assert_eq!(cmd, b"touch '/tmp/a b'");
    }

    #[test]
    fn substitutes_multiple_tokens() {
        let cmd = expand("cp {} {}.bak", b"/tmp/x");
        assert_eq!(cmd, b"cp '/tmp/x' '/tmp/x'.bak");
    }

    #[test]
    fn leaves_template_without_token_untouched() {
        let cmd = expand("echo hi", b"/tmp/whatever; rm -rf /");
        assert_eq!(cmd, b"echo hi");
    }

    #[test]
    fn is_transparent_to_shell_metacharacters() {
        for path in [
            &b"/tmp/a b"[..],
            b"/tmp/$(rm -rf /)",
            b"/tmp/`whoami`",
            b"/tmp/a;b",
            b"/tmp/a&b",
            b"/tmp/a|b",
            b"/tmp/a\\b",
            b"/tmp/it's a test",
        ] {
            let cmd = expand("touch {}", path);
            // The quoted form must start and end with a single quote and the
            // inner payload, once unescaped, must equal the original path.
            assert!(cmd.starts_with(b"touch '"));
            let unescaped = unescape_single_quoted(&cmd[b"touch ".len()..]);
            assert_eq!(unescaped, *path);
        }
    }

    /// Test-only inverse of [`shell_quote`], used to assert round-tripping.
    fn unescape_single_quoted(quoted: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        let mut in_quotes = false;
        while i < quoted.len() {
            match quoted[i] {
                b'\'' if !in_quotes => {
                    in_quotes = true;
                    i += 1;
                }
                b'\'' if in_quotes => {
                    // Either end of string or the `\'` escape sequence.
                    if quoted[i..].starts_with(b"'\\''") {
                        out.push(b'\'');
                        i += 4;
                    } else {
                        in_quotes = false;
                        i += 1;
                    }
                }
                b => {
                    out.push(b);
                    i += 1;
                }
            }
        }
        out
    }
}
