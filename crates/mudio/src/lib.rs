//! `mudio`: byte-level plumbing for warshard client connections.
//!
//! Clients speak a plain line-oriented text protocol, usually through a
//! telnet client that sprinkles IAC sequences into the stream. This crate
//! provides the two state machines a connection reader needs:
//!
//! - [`telnet::NegotiationFilter`] strips IAC sequences and produces
//!   refuse-everything negotiation replies,
//! - [`line::LineAssembler`] splits the cleaned stream into lines.
//!
//! Both are sans-io: the reader half of a socket cannot write, so
//! negotiation replies are returned to the caller, which forwards them to
//! whatever owns the write half.

pub mod line;
pub mod telnet;

#[derive(Debug, Clone)]
pub enum MudIoError {
    /// A line exceeded the configured maximum without a terminator.
    LineTooLong { max: usize },
}

impl std::fmt::Display for MudIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MudIoError::LineTooLong { max } => {
                write!(f, "line exceeds {max} bytes without a newline")
            }
        }
    }
}

impl std::error::Error for MudIoError {}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use crate::line::LineAssembler;
    use crate::telnet::NegotiationFilter;

    #[tokio::test]
    async fn telnet_client_bytes_become_clean_lines() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            // IAC WILL 31 (NAWS), then a command split across writes.
            client.write_all(&[255, 251, 31]).await.unwrap();
            client.write_all(b"push bu").await.unwrap();
            client.write_all(b"tton\r\nwho\n").await.unwrap();
        });

        let mut filter = NegotiationFilter::new();
        let mut lines = LineAssembler::new();
        let mut got = Vec::new();
        let mut replies = Vec::new();
        let mut buf = [0u8; 64];
        while got.len() < 2 {
            let n = server.read(&mut buf).await.unwrap();
            let mut data = Vec::new();
            filter.feed(&buf[..n], &mut data, &mut replies);
            lines.push(&data).unwrap();
            while let Some(l) = lines.next_line() {
                got.push(l);
            }
        }

        assert_eq!(got[0], b"push button");
        assert_eq!(got[1], b"who");
        assert_eq!(replies, vec![255, 254, 31]); // IAC DONT NAWS
    }
}
