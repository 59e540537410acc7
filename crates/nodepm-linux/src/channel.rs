use nodepm_core::Channel;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

/// Parent side of the control pipe pair of a launched process.
///
/// Each direction is released once on `close`; a read or write still in
/// flight keeps its descriptor alive until it returns.
pub struct PipeChannel {
    reader: Mutex<Option<Arc<File>>>,
    writer: Mutex<Option<Arc<File>>>,
}

impl PipeChannel {
    pub fn new(reader: OwnedFd, writer: OwnedFd) -> Self {
        Self {
            reader: Mutex::new(Some(Arc::new(File::from(reader)))),
            writer: Mutex::new(Some(Arc::new(File::from(writer)))),
        }
    }

    fn end(slot: &Mutex<Option<Arc<File>>>) -> io::Result<Arc<File>> {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel is closed"))
    }
}

impl Channel for PipeChannel {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let file = Self::end(&self.reader)?;
        (&*file).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let file = Self::end(&self.writer)?;
        (&*file).write(buf)
    }

    fn close(&self) -> io::Result<()> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
            && self
                .writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    /// Returns the channel plus the far ends: (write into channel, read from channel)
    fn channel_pair() -> (PipeChannel, File, File) {
        let (inbound_read, inbound_write) = pipe().unwrap();
        let (outbound_read, outbound_write) = pipe().unwrap();
        let channel = PipeChannel::new(inbound_read, outbound_write);
        (channel, File::from(inbound_write), File::from(outbound_read))
    }

    #[test]
    fn test_duplex_roundtrip() {
        let (channel, mut feed, mut drain) = channel_pair();

        feed.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");

        assert_eq!(channel.write(b"pong").unwrap(), 4);
        drain.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_close_is_idempotent() {
        let (channel, mut feed, mut drain) = channel_pair();
        assert!(!channel.is_closed());

        channel.close().unwrap();
        assert!(channel.is_closed());
        channel.close().unwrap();
        assert!(channel.is_closed());

        // both directions observe the close exactly like a single close
        let mut buf = [0u8; 1];
        assert_eq!(drain.read(&mut buf).unwrap(), 0);
        assert_eq!(
            feed.write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );

        assert_eq!(
            channel.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            channel.write(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
