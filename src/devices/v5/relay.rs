//! User program output relayed by a radio-linked controller.
//!
//! A controller has no user port. While it sits on the download channel the
//! brain's user output can be pulled through the system port with the user
//! FIFO command, which [`WirelessRelay`] turns back into a byte stream.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::V5Device;
use crate::errors::{DecodeError, DeviceError};
use crate::io::ByteChannel;

/// Chunks of output waiting for the async reader
const RELAY_BACKLOG: usize = 16;

fn to_io(e: DeviceError) -> io::Error {
    match e {
        DeviceError::Decode(DecodeError::Transport(e)) => e,
        e => io::Error::new(ErrorKind::Other, e),
    }
}

/// A read-only byte channel over a V5's user FIFO.
///
/// Opening the relay moves a controller onto the download channel, where it
/// stays until the relay is closed or dropped. A brain is read as is.
pub struct WirelessRelay<C: ByteChannel> {
    device: V5Device<C>,
    saved_timeout: Option<Duration>,
    pending: VecDeque<u8>,
}

impl<C: ByteChannel> WirelessRelay<C> {
    pub fn open(mut device: V5Device<C>) -> Result<Self, DeviceError> {
        let saved_timeout = device.begin_download_session()?;
        info!(port = %device.channel_name(), "relaying user output");
        Ok(WirelessRelay {
            device,
            saved_timeout,
            pending: VecDeque::new(),
        })
    }

    pub fn device_mut(&mut self) -> &mut V5Device<C> {
        &mut self.device
    }

    /// Puts a controller back on the pit channel
    pub fn close(mut self) -> Result<(), DeviceError> {
        match self.saved_timeout.take() {
            Some(saved_timeout) => self.device.end_download_session(saved_timeout),
            None => Ok(()),
        }
    }

    /// Pulls whatever complete output the device has, empty if none
    fn poll_fifo(&mut self) -> Result<Vec<u8>, DeviceError> {
        let data = self.device.user_fifo_read()?;
        if !data.is_empty() {
            debug!(bytes = data.len(), "relayed user output");
        }
        Ok(data)
    }
}

impl<C: ByteChannel + 'static> WirelessRelay<C> {
    /// Moves the relay onto a blocking thread that feeds an async reader.
    ///
    /// The FIFO is polled every `poll_interval` while it is empty. The thread
    /// stops once the reader is dropped and hands the relay back; a failed
    /// poll ends the reader's stream and is returned instead.
    pub fn spawn_reader(mut self, poll_interval: Duration) -> (RelayReader, JoinHandle<Result<Self, DeviceError>>) {
        let (tx, rx) = mpsc::channel(RELAY_BACKLOG);
        let pump = tokio::task::spawn_blocking(move || -> Result<Self, DeviceError> {
            loop {
                if tx.is_closed() {
                    return Ok(self);
                }
                let data = self.poll_fifo()?;
                if data.is_empty() {
                    std::thread::sleep(poll_interval);
                } else if tx.blocking_send(data).is_err() {
                    return Ok(self);
                }
            }
        });

        let reader = RelayReader {
            rx,
            chunk: Vec::new(),
            offset: 0,
        };
        (reader, pump)
    }
}

impl<C: ByteChannel> Read for WirelessRelay<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            let data = self.poll_fifo().map_err(to_io)?;
            if data.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no user output waiting"));
            }
            self.pending.extend(data);
        }

        let n = buf.len().min(self.pending.len());
        for (slot, b) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl<C: ByteChannel> Write for WirelessRelay<C> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            ErrorKind::Unsupported,
            "writing to the user program is not supported over the relay",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: ByteChannel> ByteChannel for WirelessRelay<C> {
    fn name(&self) -> String {
        self.device.channel_name()
    }

    fn is_open(&self) -> bool {
        self.device.channel.is_open()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}

impl<C: ByteChannel> Drop for WirelessRelay<C> {
    fn drop(&mut self) {
        if let Some(saved_timeout) = self.saved_timeout.take() {
            if let Err(e) = self.device.end_download_session(saved_timeout) {
                warn!(error = %e, "could not restore pit channel");
            }
        }
    }
}

/// The async end of [`WirelessRelay::spawn_reader`]; EOF once the relay stops
pub struct RelayReader {
    rx: mpsc::Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl AsyncRead for RelayReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.offset >= this.chunk.len() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.chunk = chunk;
                    this.offset = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.remaining().min(this.chunk.len() - this.offset);
        buf.put_slice(&this.chunk[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}
