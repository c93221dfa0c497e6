//! ANSI escape handling for console output.
//!
//! Consoles of network operating systems emit colour codes, cursor moves and
//! carriage returns. Captured text and transcripts are normalised by dropping
//! them; nothing here renders a terminal.

/// Strip escape sequences and control bytes, returning lossy UTF-8.
///
/// Removes CSI (`ESC [`), OSC (`ESC ]`, BEL or ST terminated), DCS (`ESC P`),
/// two/three byte escapes (`ESC (B`, `ESC =`), and the control bytes
/// NUL, BEL, SO, SI and CR. Newlines and tabs are kept.
pub fn strip_ansi(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b {
            i += 1;
            match bytes.get(i) {
                Some(b'[') => {
                    i += 1;
                    // parameters and intermediates until a final byte 0x40..=0x7e
                    while i < bytes.len() {
                        let c = bytes[i];
                        i += 1;
                        if (0x40..=0x7e).contains(&c) {
                            break;
                        }
                    }
                }
                Some(b']') | Some(b'P') => {
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] == 0x07 {
                            i += 1;
                            break;
                        }
                        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                Some(b'(') | Some(b')') => i += 2,
                Some(c) if c.is_ascii_alphabetic() || *c == b'=' || *c == b'>' => i += 1,
                _ => {}
            }
            continue;
        }
        if !matches!(b, 0x00 | 0x07 | 0x0e | 0x0f | b'\r') {
            out.push(b);
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_colour_and_carriage_returns() {
        let raw = b"\x1b[1;32mRP/0/RP0/CPU0:ios#\x1b[0m\r\n";
        assert_eq!(strip_ansi(raw), "RP/0/RP0/CPU0:ios#\n");
    }

    #[test]
    fn test_strips_osc_title() {
        let raw = b"\x1b]0;router\x07Username:";
        assert_eq!(strip_ansi(raw), "Username:");
    }

    #[test]
    fn test_strips_charset_selection() {
        assert_eq!(strip_ansi(b"\x1b(Bplain"), "plain");
    }

    #[test]
    fn test_truncated_escape_does_not_panic() {
        assert_eq!(strip_ansi(b"text\x1b["), "text");
        assert_eq!(strip_ansi(b"text\x1b"), "text");
    }
}
