use crate::stream::{Level, Message};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Splits a byte stream into lines, replacing invalid UTF-8 instead of failing.
///
/// Lines longer than `max_length` are cut and emitted in pieces.
pub struct LossyLineCodec {
    max_length: usize,
}

impl LossyLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    fn take_line(src: &mut BytesMut, len: usize, skip: usize) -> String {
        let mut line = &src[..len];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        let out = String::from_utf8_lossy(line).into_owned();
        src.advance(len + skip);
        out
    }
}

impl Default for LossyLineCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let window = src.len().min(self.max_length);
        if let Some(pos) = src[..window].iter().position(|b| *b == b'\n') {
            return Ok(Some(Self::take_line(src, pos, 1)));
        }

        if src.len() >= self.max_length {
            let len = self.max_length;
            return Ok(Some(Self::take_line(src, len, 0)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = src.len();
        Ok(Some(Self::take_line(src, len, 0)))
    }
}

/// Forward every line read from `io` as a message of the given level until EOF.
///
/// The reader is drained even after the receiving side of `out` is gone so
/// the writer never blocks on a full pipe.
pub async fn forward_lines<R: AsyncRead + Unpin>(
    io: R,
    level: Level,
    out: mpsc::Sender<Message>,
) -> std::io::Result<()> {
    let mut frames = FramedRead::with_capacity(io, LossyLineCodec::default(), 1024);
    let mut forwarding = true;

    while let Some(frame) = frames.next().await {
        let line = frame?;
        if forwarding && out.send(Message::line(level, line)).await.is_err() {
            forwarding = false;
        }
    }

    Ok(())
}
