//! An interactive terminal on the user port.
//!
//! Two tasks run side by side: one renders incoming frames to an output
//! sink, the other forwards keystrokes to the program. Either can end the
//! session, and both are joined before the stream halves are handed back.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use super::{Message, StreamError, StreamReader, StreamWriter, KDBG, SERR, SOUT};

/// Asks the program to print its banner again
pub const BANNER_REQUEST: &[u8] = b"pRb";

/// Ends the session when typed
pub const END_OF_TEXT: u8 = 0x03;

const RED: &str = "\x1b[31m";
const GREEN_BACKGROUND: &str = "\x1b[42;1m";
const RESET: &str = "\x1b[0m";

/// Cloneable stop signal shared by the terminal tasks
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called by any clone
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a frame for display
pub fn render(message: &Message) -> String {
    let text = String::from_utf8_lossy(&message.payload);
    match message.topic {
        SOUT => text.into_owned(),
        SERR => format!("{RED}{text}{RESET}"),
        KDBG => format!("{GREEN_BACKGROUND}\n\nKERNEL DEBUG:\t{text}{RESET}\n"),
        _ => format!("{}{}", message.topic_name(), text),
    }
}

pub struct Terminal<R, W> {
    reader: StreamReader<R>,
    writer: StreamWriter<W>,
    request_banner: bool,
    echo: bool,
}

impl<R, W> Terminal<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Subscribes the reader to program output and errors
    pub fn new(mut reader: StreamReader<R>, writer: StreamWriter<W>) -> Self {
        reader.subscribe(SOUT);
        reader.subscribe(SERR);
        Terminal {
            reader,
            writer,
            request_banner: true,
            echo: false,
        }
    }

    pub fn request_banner(mut self, request: bool) -> Self {
        self.request_banner = request;
        self
    }

    /// Echo forwarded keystrokes to the output, for consoles in raw mode
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Runs until `shutdown` fires, `keys` ends or yields [`END_OF_TEXT`],
    /// or the device closes the stream.
    pub async fn run<K, O>(
        self,
        keys: K,
        output: O,
        shutdown: Shutdown,
    ) -> Result<(StreamReader<R>, StreamWriter<W>), StreamError>
    where
        K: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
    {
        let Terminal {
            reader,
            mut writer,
            request_banner,
            echo,
        } = self;

        if request_banner {
            writer.write(BANNER_REQUEST).await?;
        }

        info!("terminal started");
        let output = Arc::new(Mutex::new(output));
        let reading = tokio::spawn(read_loop(reader, output.clone(), shutdown.clone()));
        let writing = tokio::spawn(write_loop(writer, keys, echo.then_some(output), shutdown));

        let (reader, writer) = tokio::join!(reading, writing);
        info!("terminal stopped");
        Ok((reader?, writer?))
    }
}

async fn read_loop<R, O>(
    mut reader: StreamReader<R>,
    output: Arc<Mutex<O>>,
    mut shutdown: Shutdown,
) -> StreamReader<R>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            message = reader.read() => {
                let result = match message {
                    Ok(message) => {
                        let mut output = output.lock().await;
                        match output.write_all(render(&message).as_bytes()).await {
                            Ok(()) => output.flush().await.map_err(StreamError::from),
                            Err(e) => Err(e.into()),
                        }
                    }
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {}
                    Err(StreamError::Closed) => {
                        info!("device closed the stream");
                        shutdown.trigger();
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "terminal read failed");
                        shutdown.trigger();
                        break;
                    }
                }
            }
        }
    }
    reader
}

async fn write_loop<W, K, O>(
    mut writer: StreamWriter<W>,
    mut keys: K,
    echo: Option<Arc<Mutex<O>>>,
    mut shutdown: Shutdown,
) -> StreamWriter<W>
where
    W: AsyncWrite + Unpin,
    K: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 64];
    loop {
        let n = tokio::select! {
            _ = shutdown.wait() => break,
            n = keys.read(&mut buf) => n,
        };

        let typed = match n {
            Ok(0) => {
                debug!("input closed");
                shutdown.trigger();
                break;
            }
            Ok(n) => &buf[..n],
            Err(e) => {
                error!(error = %e, "reading keystrokes failed");
                shutdown.trigger();
                break;
            }
        };

        let (typed, stop) = match typed.iter().position(|b| *b == END_OF_TEXT) {
            Some(pos) => (&typed[..pos], true),
            None => (typed, false),
        };

        if !typed.is_empty() {
            if let Err(e) = writer.write(typed).await {
                error!(error = %e, "terminal write failed");
                shutdown.trigger();
                break;
            }
            if let Some(output) = &echo {
                let mut output = output.lock().await;
                // Echo is best effort
                let _ = output.write_all(typed).await;
                let _ = output.flush().await;
            }
        }

        if stop {
            debug!("end of text typed");
            shutdown.trigger();
            break;
        }
    }
    writer
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::stream::{encode_frame, split};

    #[test]
    fn rendering() {
        let message = |topic, payload: &[u8]| Message {
            topic,
            payload: payload.to_vec(),
        };
        assert_eq!(render(&message(SOUT, b"hi\n")), "hi\n");
        assert_eq!(render(&message(SERR, b"bad")), "\x1b[31mbad\x1b[0m");
        assert_eq!(
            render(&message(KDBG, b"fault")),
            "\x1b[42;1m\n\nKERNEL DEBUG:\tfault\x1b[0m\n"
        );
        assert_eq!(render(&message(*b"user", b"x")), "userx");
    }

    #[tokio::test]
    async fn shutdown_reaches_clones() {
        let shutdown = Shutdown::new();
        let mut waiter = shutdown.clone();
        assert!(!waiter.is_triggered());
        let handle = tokio::spawn(async move { waiter.wait().await });
        shutdown.trigger();
        handle.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn session_until_end_of_text() {
        let (device, host) = duplex(1024);
        let (mut keys, keys_rx) = duplex(64);
        let (output, mut screen) = duplex(1024);

        let (reader, writer) = split(host);
        let shutdown = Shutdown::new();
        let session = tokio::spawn(Terminal::new(reader, writer).run(keys_rx, output, shutdown.clone()));

        let (mut device_rx, mut device_tx) = tokio::io::split(device);
        let mut banner = [0u8; 3];
        device_rx.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, BANNER_REQUEST);

        device_tx.write_all(&encode_frame(&SOUT, b"hello ")).await.unwrap();
        device_tx.write_all(&encode_frame(&KDBG, b"hidden")).await.unwrap();
        device_tx.write_all(&encode_frame(&SERR, b"oops")).await.unwrap();
        let expected = "hello \x1b[31moops\x1b[0m";
        let mut shown = vec![0u8; expected.len()];
        screen.read_exact(&mut shown).await.unwrap();
        assert_eq!(shown, expected.as_bytes());

        keys.write_all(b"ab\x03cd").await.unwrap();
        let mut typed = [0u8; 2];
        device_rx.read_exact(&mut typed).await.unwrap();
        assert_eq!(&typed, b"ab");

        let result = tokio::time::timeout(Duration::from_secs(5), session).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn external_shutdown_stops_session() {
        let (_device, host) = duplex(64);
        let (_keys, keys_rx) = duplex(64);
        let (output, _screen) = duplex(64);

        let (reader, writer) = split(host);
        let shutdown = Shutdown::new();
        let session = tokio::spawn(
            Terminal::new(reader, writer)
                .request_banner(false)
                .run(keys_rx, output, shutdown.clone()),
        );

        shutdown.trigger();
        let result = tokio::time::timeout(Duration::from_secs(5), session).await.unwrap();
        let (reader, _writer) = result.unwrap().unwrap();
        assert!(reader.subscriptions().accepts(&SOUT));
    }
}
