use bytes::BytesMut;
use memchr::memchr;

use crate::MudIoError;

const DEFAULT_MAX_LINE: usize = 8 * 1024;

/// Accumulates cleaned stream bytes and yields one line at a time.
///
/// Lines are terminated by `\n`; a trailing `\r` is stripped, so both CRLF
/// and bare LF clients work. Empty lines are yielded as empty vectors.
#[derive(Debug)]
pub struct LineAssembler {
    buf: BytesMut,
    max_line: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_line: DEFAULT_MAX_LINE,
        }
    }

    pub fn max_line(mut self, max: usize) -> Self {
        self.max_line = max.max(1);
        self
    }

    /// Append cleaned bytes. Fails if the pending partial line has grown
    /// past the limit; the connection should be dropped in that case.
    pub fn push(&mut self, data: &[u8]) -> Result<(), MudIoError> {
        self.buf.extend_from_slice(data);
        if memchr(b'\n', &self.buf).is_none() && self.buf.len() > self.max_line {
            return Err(MudIoError::LineTooLong { max: self.max_line });
        }
        Ok(())
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let i = memchr(b'\n', &self.buf)?;
        let mut line = self.buf.split_to(i + 1);
        line.truncate(i);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_and_lf() {
        let mut a = LineAssembler::new();
        a.push(b"hello\r\nworld\n").unwrap();
        assert_eq!(a.next_line().unwrap(), b"hello");
        assert_eq!(a.next_line().unwrap(), b"world");
        assert!(a.next_line().is_none());
    }

    #[test]
    fn holds_partial_lines_across_pushes() {
        let mut a = LineAssembler::new();
        a.push(b"push bu").unwrap();
        assert!(a.next_line().is_none());
        a.push(b"tton\r\n").unwrap();
        assert_eq!(a.next_line().unwrap(), b"push button");
    }

    #[test]
    fn empty_line_is_yielded() {
        let mut a = LineAssembler::new();
        a.push(b"\r\n").unwrap();
        assert_eq!(a.next_line().unwrap(), b"");
    }

    #[test]
    fn oversize_line_is_rejected() {
        let mut a = LineAssembler::new().max_line(8);
        let err = a.push(b"aaaaaaaaaaaaaaaa").unwrap_err();
        assert!(matches!(err, MudIoError::LineTooLong { max: 8 }));
    }

    #[test]
    fn oversize_check_only_applies_to_unterminated_input() {
        let mut a = LineAssembler::new().max_line(8);
        a.push(b"abc\ndefg\n").unwrap();
        assert_eq!(a.next_line().unwrap(), b"abc");
        assert_eq!(a.next_line().unwrap(), b"defg");
    }
}
