//! The multiplexed user-port stream of a V5 brain.
//!
//! Output from the running program arrives as COBS frames delimited by
//! zero bytes. The first four decoded bytes name a topic (`sout`, `serr`,
//! `kdbg`, ...) and the rest is the payload. Input to the program is not
//! framed at all.

use std::collections::HashSet;
use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace, warn};

pub mod cobs;
pub mod terminal;

pub use terminal::{render, Shutdown, Terminal};

pub type Topic = [u8; 4];

pub const SOUT: Topic = *b"sout";
pub const SERR: Topic = *b"serr";
pub const KDBG: Topic = *b"kdbg";

/// Frame delimiter on the wire
const DELIMITER: u8 = 0x00;

const READ_CHUNK: usize = 512;

/// Longest frame kept while waiting for its delimiter
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream closed by the device")]
    Closed,
    #[error("stream I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("terminal task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One decoded frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: Topic,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn topic_name(&self) -> String {
        String::from_utf8_lossy(&self.topic).into_owned()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.topic_name(), String::from_utf8_lossy(&self.payload))
    }
}

/// Which topics a [`StreamReader`] hands out
#[derive(Clone, Debug, Default)]
pub struct Subscriptions {
    topics: HashSet<Topic>,
    promiscuous: bool,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: Topic) {
        self.topics.insert(topic);
    }

    /// Returns whether the topic was subscribed
    pub fn unsubscribe(&mut self, topic: &Topic) -> bool {
        self.topics.remove(topic)
    }

    /// Accept every topic regardless of subscriptions
    pub fn set_promiscuous(&mut self, promiscuous: bool) {
        self.promiscuous = promiscuous;
    }

    pub fn is_promiscuous(&self) -> bool {
        self.promiscuous
    }

    pub fn accepts(&self, topic: &Topic) -> bool {
        self.promiscuous || self.topics.contains(topic)
    }
}

/// Splits frames out of the incoming byte stream.
///
/// Bytes read but not yet part of a complete frame stay buffered, so
/// [`StreamReader::read`] can be dropped mid-await (in a `select!`) without
/// losing data.
pub struct StreamReader<R> {
    inner: R,
    subscriptions: Subscriptions,
    buffer: Vec<u8>,
    max_frame_len: usize,
    /// Set while skipping the rest of an oversized frame
    discarding: bool,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        StreamReader {
            inner,
            subscriptions: Subscriptions::new(),
            buffer: Vec::with_capacity(READ_CHUNK),
            max_frame_len: MAX_FRAME_LEN,
            discarding: false,
        }
    }

    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut Subscriptions {
        &mut self.subscriptions
    }

    pub fn subscribe(&mut self, topic: Topic) {
        self.subscriptions.subscribe(topic);
    }

    pub fn unsubscribe(&mut self, topic: &Topic) -> bool {
        self.subscriptions.unsubscribe(topic)
    }

    /// Waits for the next frame on a subscribed topic.
    ///
    /// Frames that fail to decode, are too short to carry a topic, grow
    /// past the frame limit, or belong to other topics are dropped. Returns
    /// [`StreamError::Closed`] once the device stops sending.
    pub async fn read(&mut self) -> Result<Message, StreamError> {
        loop {
            while let Some(frame) = self.take_frame() {
                if let Some(message) = self.accept(&frame) {
                    return Ok(message);
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(StreamError::Closed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
            self.limit_buffer();
        }
    }

    /// Drops a partial frame that outgrew the limit, up to its delimiter
    fn limit_buffer(&mut self) {
        if self.discarding {
            match self.buffer.iter().position(|b| *b == DELIMITER) {
                Some(end) => {
                    self.buffer.drain(..=end);
                    self.discarding = false;
                }
                None => self.buffer.clear(),
            }
        }

        if self.buffer.len() > self.max_frame_len && !self.buffer.contains(&DELIMITER) {
            warn!(bytes = self.buffer.len(), "dropping oversized frame");
            self.buffer.clear();
            self.discarding = true;
        }
    }

    /// Removes the next complete frame from the buffer, without its delimiter
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|b| *b == DELIMITER)?;
        let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
        frame.pop();
        Some(frame)
    }

    fn accept(&self, frame: &[u8]) -> Option<Message> {
        let decoded = match cobs::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, bytes = frame.len(), "dropping undecodable frame");
                return None;
            }
        };

        if decoded.len() < 4 {
            debug!(bytes = decoded.len(), "dropping frame without a topic");
            return None;
        }

        let (topic, payload) = decoded.split_at(4);
        let topic: Topic = [topic[0], topic[1], topic[2], topic[3]];
        if !self.subscriptions.accepts(&topic) {
            trace!(topic = %String::from_utf8_lossy(&topic), "ignoring unsubscribed topic");
            return None;
        }

        Some(Message {
            topic,
            payload: payload.to_vec(),
        })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Sends raw bytes to the running program
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), StreamError> {
        trace!(bytes = data.len(), "writing to user port");
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Splits a duplex channel into a frame reader and a passthrough writer
pub fn split<S>(stream: S) -> (StreamReader<ReadHalf<S>>, StreamWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (StreamReader::new(read), StreamWriter::new(write))
}

/// Puts halves from [`split`] back together
pub fn unsplit<S>(reader: StreamReader<ReadHalf<S>>, writer: StreamWriter<WriteHalf<S>>) -> S
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader.into_inner().unsplit(writer.into_inner())
}

/// Builds the wire form of a frame, delimiter included
pub fn encode_frame(topic: &Topic, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(topic.len() + payload.len());
    raw.extend_from_slice(topic);
    raw.extend_from_slice(payload);

    let mut frame = cobs::encode(&raw);
    frame.push(DELIMITER);
    frame
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn delivers_only_subscribed_topics() {
        let (mut device, host) = duplex(256);
        let mut reader = StreamReader::new(host);
        reader.subscribe(SOUT);

        device.write_all(&encode_frame(&SERR, b"bad")).await.unwrap();
        device.write_all(&encode_frame(&SOUT, b"one\n")).await.unwrap();
        device.write_all(&encode_frame(&SOUT, b"two\x00\n")).await.unwrap();
        drop(device);

        let first = reader.read().await.unwrap();
        assert_eq!(first.topic, SOUT);
        assert_eq!(first.payload, b"one\n");
        assert_eq!(reader.read().await.unwrap().payload, b"two\x00\n");
        assert!(matches!(reader.read().await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn skips_broken_and_short_frames() {
        let (mut device, host) = duplex(256);
        let mut reader = StreamReader::new(host);
        reader.subscribe(SOUT);

        device.write_all(&[0x05, 0x01, 0x02, 0x00]).await.unwrap();
        device.write_all(&[0x00]).await.unwrap();
        device.write_all(&cobs::encode(b"so")).await.unwrap();
        device.write_all(&[0x00]).await.unwrap();
        device.write_all(&encode_frame(&SOUT, b"ok")).await.unwrap();

        let message = reader.read().await.unwrap();
        assert_eq!(message.payload, b"ok");
    }

    #[tokio::test]
    async fn frames_split_across_reads() {
        let (mut device, host) = duplex(256);
        let mut reader = StreamReader::new(host);
        reader.subscriptions_mut().set_promiscuous(true);

        let frame = encode_frame(b"user", b"split payload");
        let (head, tail) = frame.split_at(5);
        device.write_all(head).await.unwrap();
        let pending = tokio::spawn(async move {
            let message = reader.read().await.unwrap();
            (reader, message)
        });
        tokio::task::yield_now().await;
        device.write_all(tail).await.unwrap();

        let (_, message) = pending.await.unwrap();
        assert_eq!(message.topic_name(), "user");
        assert_eq!(message.payload, b"split payload");
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped() {
        let (mut device, host) = duplex(256);
        let mut reader = StreamReader::new(host).max_frame_len(16);
        reader.subscribe(SOUT);

        device.write_all(&[0x11; 40]).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), reader.read()).await;
        assert!(waited.is_err());
        assert!(reader.buffer.is_empty());
        assert!(reader.discarding);

        // The rest of the long frame is skipped along with its delimiter
        device.write_all(&[0x11; 3]).await.unwrap();
        device.write_all(&[0x00]).await.unwrap();
        device.write_all(&encode_frame(&SOUT, b"ok")).await.unwrap();
        assert_eq!(reader.read().await.unwrap().payload, b"ok");
        assert!(!reader.discarding);
    }

    #[tokio::test]
    async fn split_halves_share_one_stream() {
        let (mut device, host) = duplex(256);
        let (mut reader, mut writer) = split(host);
        reader.subscribe(SOUT);

        writer.write(b"input").await.unwrap();
        let mut received = [0u8; 5];
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"input");

        device.write_all(&encode_frame(&SOUT, b"echo")).await.unwrap();
        assert_eq!(reader.read().await.unwrap().payload, b"echo");

        let mut host = unsplit(reader, writer);
        host.write_all(b"again").await.unwrap();
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"again");
    }

    #[test]
    fn subscription_rules() {
        let mut subs = Subscriptions::new();
        assert!(!subs.accepts(&SOUT));
        subs.subscribe(SOUT);
        assert!(subs.accepts(&SOUT));
        assert!(!subs.accepts(&KDBG));
        assert!(subs.unsubscribe(&SOUT));
        assert!(!subs.unsubscribe(&SOUT));
        subs.set_promiscuous(true);
        assert!(subs.accepts(&KDBG));
    }

    #[test]
    fn frames_end_with_single_delimiter() {
        let frame = encode_frame(&SOUT, b"a\x00b");
        assert_eq!(frame.last(), Some(&0));
        assert_eq!(frame.iter().filter(|b| **b == 0).count(), 1);
        assert_eq!(
            cobs::decode(&frame[..frame.len() - 1]).unwrap(),
            b"souta\x00b".to_vec()
        );
    }
}
