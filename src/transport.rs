//! Delivery of administrative commands to a running server.
//!
//! Exactly one channel is used per supervisor: the process input stream when the server
//! runs attached to a console, or the administrative protocol otherwise. Commands sent
//! while the channel is not ready are queued and drained once it becomes ready.
use std::{
    io::{self, Write},
    sync::{
        Arc,
        mpsc::{self, Sender},
    },
    thread,
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Where an admin connection should reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    /// Address the server is bound to.
    pub bind: String,
    /// Game port of the server.
    pub port: u16,
    /// RCON password.
    pub password: String,
    /// Local address the client listens on.
    pub listen: String,
}

/// Notification raised by an admin connection.
#[derive(Debug)]
pub enum AdminEvent {
    /// The connection can deliver commands. Fired once.
    Ready,
    /// The connection failed.
    Error(TransportError),
}

/// Receiver of admin connection notifications.
pub type AdminSink = Arc<dyn Fn(AdminEvent) + Send + Sync>;

/// A live administrative-protocol connection.
pub trait AdminConnection: Send {
    /// Delivers one command.
    fn send(&mut self, command: &str) -> Result<(), TransportError>;

    /// Whether [`AdminEvent::Ready`] has fired.
    fn is_ready(&self) -> bool;

    /// Releases the connection.
    fn close(&mut self);
}

/// Factory for admin connections.
pub trait AdminConnector: Send + Sync {
    /// Opens a connection. Readiness and failures are reported through `events`, which
    /// may be invoked from any thread, including before this call returns.
    fn connect(
        &self,
        target: &AdminTarget,
        events: AdminSink,
    ) -> Result<Box<dyn AdminConnection>, TransportError>;
}

/// Which channel a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    /// The server's stdin.
    Stream,
    /// The administrative protocol.
    Admin,
}

/// Outcome of [`CommandTransport::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the channel.
    Sent,
    /// Held until the channel is ready.
    Queued,
}

enum Channel {
    Stream(Option<StreamWriter>),
    Admin(Option<Box<dyn AdminConnection>>),
}

/// Feeds the server's input stream from a dedicated thread.
///
/// Writes to a pipe the server never drains block indefinitely; they stall only the
/// writer thread, never the caller. Dropping the writer ends the thread once its current
/// write returns, which at the latest happens when the server exits.
struct StreamWriter {
    commands: Sender<String>,
}

impl StreamWriter {
    fn spawn(mut stream: Box<dyn Write + Send>) -> io::Result<Self> {
        let (commands, pending) = mpsc::channel::<String>();
        thread::Builder::new()
            .name("sampd-stdin".into())
            .spawn(move || {
                for command in pending {
                    if let Err(err) = write_line(&mut stream, &command) {
                        warn!("Failed to write command to server input: {err}");
                        return;
                    }
                }
                debug!("Server input stream detached");
            })?;
        Ok(Self { commands })
    }

    fn send(&self, command: &str) -> Result<(), TransportError> {
        self.commands
            .send(command.to_string())
            .map_err(|_| TransportError::NotConnected)
    }
}

fn write_line(stream: &mut dyn Write, command: &str) -> io::Result<()> {
    stream.write_all(command.as_bytes())?;
    if !command.ends_with('\n') {
        stream.write_all(b"\n")?;
    }
    stream.flush()
}

/// Queueing command sender bound to one channel.
pub struct CommandTransport {
    channel: Channel,
    queue: Vec<String>,
}

impl std::fmt::Debug for CommandTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTransport")
            .field("kind", &self.kind())
            .field("ready", &self.is_ready())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl CommandTransport {
    /// Creates a transport of the given kind with nothing attached.
    pub fn new(kind: TransportKind) -> Self {
        let channel = match kind {
            TransportKind::Stream => Channel::Stream(None),
            TransportKind::Admin => Channel::Admin(None),
        };
        Self {
            channel,
            queue: Vec::new(),
        }
    }

    /// The channel this transport uses.
    pub fn kind(&self) -> TransportKind {
        match self.channel {
            Channel::Stream(_) => TransportKind::Stream,
            Channel::Admin(_) => TransportKind::Admin,
        }
    }

    /// Whether commands are delivered immediately.
    pub fn is_ready(&self) -> bool {
        match &self.channel {
            Channel::Stream(stream) => stream.is_some(),
            Channel::Admin(conn) => conn.as_ref().is_some_and(|c| c.is_ready()),
        }
    }

    /// Commands waiting for the channel, oldest first.
    pub fn pending(&self) -> &[String] {
        &self.queue
    }

    /// Delivers `command` now if the channel is ready, otherwise queues it.
    pub fn send(&mut self, command: &str) -> Result<Delivery, TransportError> {
        if !self.is_ready() {
            debug!("Queueing command until the {} transport is ready", self.kind());
            self.queue.push(command.to_string());
            return Ok(Delivery::Queued);
        }

        self.deliver(command)?;
        Ok(Delivery::Sent)
    }

    /// Drains the queue most-recent-first. Returns how many commands were delivered.
    ///
    /// A command whose delivery fails is put back and the error returned.
    pub fn flush(&mut self) -> Result<usize, TransportError> {
        if !self.is_ready() {
            return Ok(0);
        }

        let mut delivered = 0;
        while let Some(command) = self.queue.pop() {
            if let Err(err) = self.deliver(&command) {
                self.queue.push(command);
                return Err(err);
            }
            delivered += 1;
        }

        if delivered > 0 {
            debug!("Flushed {delivered} queued command(s)");
        }
        Ok(delivered)
    }

    /// Attaches the server's input stream and drains the queue.
    ///
    /// Writes happen on a background thread, so delivery never blocks on the pipe. Once a
    /// write fails, later deliveries report [`TransportError::NotConnected`].
    pub fn attach_stream(
        &mut self,
        stream: Box<dyn Write + Send>,
    ) -> Result<usize, TransportError> {
        match &mut self.channel {
            Channel::Stream(slot) => *slot = Some(StreamWriter::spawn(stream)?),
            Channel::Admin(_) => {
                warn!("Ignoring input stream for an admin transport");
                return Ok(0);
            }
        }
        self.flush()
    }

    /// Installs an admin connection, closing any previous one, and drains the queue if
    /// it is already ready.
    pub fn attach_admin(
        &mut self,
        conn: Box<dyn AdminConnection>,
    ) -> Result<usize, TransportError> {
        match &mut self.channel {
            Channel::Admin(slot) => {
                if let Some(mut previous) = slot.replace(conn) {
                    previous.close();
                }
            }
            Channel::Stream(_) => {
                warn!("Ignoring admin connection for a stream transport");
                let mut conn = conn;
                conn.close();
                return Ok(0);
            }
        }
        self.flush()
    }

    /// Drops the input stream or closes the admin connection. Queued commands are kept.
    pub fn detach(&mut self) {
        match &mut self.channel {
            Channel::Stream(slot) => {
                slot.take();
            }
            Channel::Admin(slot) => {
                if let Some(mut conn) = slot.take() {
                    conn.close();
                }
            }
        }
    }

    fn deliver(&mut self, command: &str) -> Result<(), TransportError> {
        match &mut self.channel {
            Channel::Stream(Some(writer)) => writer.send(command),
            Channel::Admin(Some(conn)) => conn.send(command),
            _ => Err(TransportError::NotConnected),
        }
    }
}
