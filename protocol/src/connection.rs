use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::{Token, END_OF_MESSAGE};

/// a single token larger than this is not something we speak
const MAX_TOKEN_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Io error on connection: {0}")]
    Io(#[from] io::Error),
    #[error("Token longer then 64KiB")]
    TokenTooLong,
    #[error("Connection was closed")]
    ConnClosed,
}

/// Splits the byte stream on ascii whitespace. Encoding writes the item
/// followed by a single space, a whole message can be sent as one item.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCodec;

impl Decoder for TokenCodec {
    type Item = String;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Error> {
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => buf.advance(start),
            None => {
                buf.clear();
                return Ok(None);
            }
        }

        match buf.iter().position(u8::is_ascii_whitespace) {
            Some(end) => {
                let word = buf.split_to(end);
                buf.advance(1);
                Ok(Some(String::from_utf8_lossy(&word).into_owned()))
            }
            None if buf.len() > MAX_TOKEN_LEN => Err(Error::TokenTooLong),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Error> {
        if let Some(token) = self.decode(buf)? {
            return Ok(Some(token));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        // peer closed right after the last token without trailing whitespace
        let word = buf.split();
        Ok(Some(String::from_utf8_lossy(&word).into_owned()))
    }
}

impl<T: AsRef<str>> Encoder<T> for TokenCodec {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Error> {
        let item = item.as_ref();
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b' ');
        Ok(())
    }
}

pub type TokenReader = FramedRead<OwnedReadHalf, TokenCodec>;
pub type TokenWriter = FramedWrite<OwnedWriteHalf, TokenCodec>;

/// Both directions of a connection, the halves can be moved to different
/// tasks independently
pub struct Channel {
    pub reader: TokenReader,
    pub writer: TokenWriter,
}

impl Channel {
    pub fn wrap(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FramedRead::new(read, TokenCodec),
            writer: FramedWrite::new(write, TokenCodec),
        }
    }
}

/// Collects tokens up to the end of message marker. Returns `None` if the
/// peer closed the connection without sending anything. A peer closing in
/// the middle of a message gets what was sent so far.
pub async fn read_message(reader: &mut TokenReader) -> Result<Option<String>, Error> {
    let mut words = Vec::new();
    while let Some(word) = reader.next().await {
        let word = word?;
        if word == END_OF_MESSAGE {
            return Ok(Some(words.join(" ")));
        }
        words.push(word);
    }

    if words.is_empty() {
        Ok(None)
    } else {
        Ok(Some(words.join(" ")))
    }
}

/// Reads until `expected` arrives, skipping anything else
pub async fn wait_for(reader: &mut TokenReader, expected: Token) -> Result<(), Error> {
    while let Some(word) = reader.next().await {
        let word = word?;
        if word == expected.as_str() {
            return Ok(());
        }
        debug!("skipping {word:?} while waiting for {expected}");
    }
    Err(Error::ConnClosed)
}

/// Retry policy shared by every control channel connect
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// delay before each retry, one less then the number of attempts
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let max = self.max_delay.as_secs_f64();
        (0..self.attempts.saturating_sub(1)).map(move |retry| {
            let delay = self.initial.as_secs_f64() * self.multiplier.powi(retry as i32);
            Duration::from_secs_f64(delay.min(max))
        })
    }

    pub async fn connect(&self, addr: (&str, u16)) -> Result<TcpStream, Error> {
        let mut delays = self.delays();
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!("failed to connect to {}:{}, error: {e:?}", addr.0, addr.1);
                        sleep(delay).await;
                    }
                    None => return Err(e.into()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn decode_all(input: &str) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut codec = TokenCodec;
        let mut tokens = Vec::new();
        while let Some(token) = codec.decode(&mut buf).unwrap() {
            tokens.push(token);
        }
        if let Some(token) = codec.decode_eof(&mut buf).unwrap() {
            tokens.push(token);
        }
        tokens
    }

    #[test]
    fn splits_on_any_whitespace() {
        let tokens = decode_all("Connected \n\tMONITOR-THROUGHPUT(SESSIONS/SEC):3.5  DONE");
        assert_eq!(
            tokens,
            vec!["Connected", "MONITOR-THROUGHPUT(SESSIONS/SEC):3.5", "DONE"]
        );
    }

    #[test]
    fn partial_token_waits_for_more_input() {
        let mut buf = BytesMut::from("StartSimu");
        assert_eq!(TokenCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lation ");
        assert_eq!(
            TokenCodec.decode(&mut buf).unwrap().as_deref(),
            Some("StartSimulation")
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff {
            attempts: 5,
            initial: Duration::from_millis(100),
            multiplier: 3.0,
            max_delay: Duration::from_millis(500),
        };
        let delays: Vec<_> = backoff.delays().map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 300, 500, 500]);
    }

    #[tokio::test]
    async fn message_is_read_up_to_marker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut channel = Channel::wrap(stream);
            channel.writer.send("run -t -p x=1 #").await.unwrap();
            channel.writer.send(Token::StartSimulation).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut channel = Channel::wrap(stream);
        let message = read_message(&mut channel.reader).await.unwrap();
        assert_eq!(message.as_deref(), Some("run -t -p x=1"));
        wait_for(&mut channel.reader, Token::StartSimulation)
            .await
            .unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn unterminated_message_is_returned_on_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            stream.write_all(b"shutdown BGClient").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut channel = Channel::wrap(stream);
        let message = read_message(&mut channel.reader).await.unwrap();
        assert_eq!(message.as_deref(), Some("shutdown BGClient"));
        assert_eq!(read_message(&mut channel.reader).await.unwrap(), None);
    }
}
