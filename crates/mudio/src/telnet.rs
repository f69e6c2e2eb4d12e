//! Telnet IAC handling.
//!
//! Minimal by intent: the server never negotiates options, so every
//! `IAC DO <opt>` is answered with `IAC WONT <opt>` and every
//! `IAC WILL <opt>` with `IAC DONT <opt>`. Subnegotiation blocks
//! (`IAC SB ... IAC SE`) are swallowed whole.

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Data,
    Command,
    Option(u8),
    Subneg,
    SubnegIac,
}

/// Strips telnet control sequences from an inbound byte stream.
///
/// Feed raw socket chunks through [`NegotiationFilter::feed`]; clean
/// application bytes land in `data`, and any bytes that must go back to the
/// peer land in `replies`. Sequences split across chunks are handled.
#[derive(Debug, Default)]
pub struct NegotiationFilter {
    mode: Mode,
}

impl NegotiationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            self.mode = match self.mode {
                Mode::Data => {
                    if b == IAC {
                        Mode::Command
                    } else {
                        data.push(b);
                        Mode::Data
                    }
                }
                Mode::Command => match b {
                    // IAC IAC escapes a literal 0xff data byte.
                    IAC => {
                        data.push(IAC);
                        Mode::Data
                    }
                    DO | DONT | WILL | WONT => Mode::Option(b),
                    SB => Mode::Subneg,
                    // NOP, GA and friends are two bytes total.
                    _ => Mode::Data,
                },
                Mode::Option(cmd) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        _ => {}
                    }
                    Mode::Data
                }
                Mode::Subneg => {
                    if b == IAC {
                        Mode::SubnegIac
                    } else {
                        Mode::Subneg
                    }
                }
                Mode::SubnegIac => {
                    if b == SE {
                        Mode::Data
                    } else {
                        // IAC IAC inside SB is an escaped byte we discard
                        // along with the rest of the block.
                        Mode::Subneg
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> (Vec<u8>, Vec<u8>) {
        let mut f = NegotiationFilter::new();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        for c in chunks {
            f.feed(c, &mut data, &mut replies);
        }
        (data, replies)
    }

    #[test]
    fn plain_data_passes_through() {
        let (d, r) = run(&[b"kill gerkin\r\n"]);
        assert_eq!(d, b"kill gerkin\r\n");
        assert!(r.is_empty());
    }

    #[test]
    fn escaped_iac_is_literal() {
        let (d, r) = run(&[&[IAC, IAC, b'x']]);
        assert_eq!(d, vec![IAC, b'x']);
        assert!(r.is_empty());
    }

    #[test]
    fn do_and_will_are_refused() {
        let (d, r) = run(&[&[IAC, DO, 1, IAC, WILL, 3, b'q']]);
        assert_eq!(d, vec![b'q']);
        assert_eq!(r, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn negotiation_split_across_chunks() {
        let (d, r) = run(&[&[IAC], &[DO], &[24, b'z']]);
        assert_eq!(d, vec![b'z']);
        assert_eq!(r, vec![IAC, WONT, 24]);
    }

    #[test]
    fn subnegotiation_is_swallowed() {
        let (d, r) = run(&[&[b'a', IAC, SB, 24, b'x', IAC, IAC, b'y', IAC, SE, b'b']]);
        assert_eq!(d, vec![b'a', b'b']);
        assert!(r.is_empty());
    }
}
