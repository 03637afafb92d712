//! Bluetooth transport seams.
//!
//! The core never talks to a platform Bluetooth API directly. A backend
//! implements [`BluetoothStack`] to open outbound sockets and listeners; the
//! OBEX sessions only see byte streams.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use uuid::Uuid;

use haraltd_types::BluetoothAddress;

use crate::error::{Error, Result};

/// A bidirectional byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub address: BluetoothAddress,
    pub service_uuid: Uuid,
}

/// What to listen for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerOptions {
    pub service_uuid: Uuid,
    /// RFCOMM channel to advertise on.
    pub channel: u8,
}

/// A connected stream to a remote device.
pub struct Socket {
    address: BluetoothAddress,
    stream: Box<dyn ByteStream>,
    connection_state: Option<watch::Receiver<bool>>,
}

impl Socket {
    /// Wrap a stream connected to `address`.
    pub fn new(address: BluetoothAddress, stream: impl ByteStream + 'static) -> Self {
        Self {
            address,
            stream: Box::new(stream),
            connection_state: None,
        }
    }

    /// Attach the remote device's connection-state notice. `false` means the
    /// device went away.
    #[must_use]
    pub fn with_connection_state(mut self, state: watch::Receiver<bool>) -> Self {
        self.connection_state = Some(state);
        self
    }

    /// The remote device.
    pub fn address(&self) -> BluetoothAddress {
        self.address
    }

    /// The byte stream.
    pub fn stream(&mut self) -> &mut (dyn ByteStream + 'static) {
        &mut *self.stream
    }

    /// Take the connection-state notice, if the backend provides one.
    pub fn take_connection_state(&mut self) -> Option<watch::Receiver<bool>> {
        self.connection_state.take()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("address", &self.address)
            .field("connection_state", &self.connection_state.is_some())
            .finish_non_exhaustive()
    }
}

/// An advertised service accepting inbound connections.
#[async_trait]
pub trait SocketListener: Send {
    /// Publish the service record so remote devices can find it.
    async fn start_advertising(&mut self) -> Result<()>;

    /// Wait for the next inbound connection.
    async fn accept(&mut self) -> Result<Socket>;
}

/// A platform Bluetooth backend.
#[async_trait]
pub trait BluetoothStack: Send + Sync {
    /// A short name for platform reports.
    fn name(&self) -> &str;

    /// Open a stream to a service on a remote device.
    async fn connect(&self, options: &SocketOptions) -> Result<Socket>;

    /// Create a listener for a local service.
    async fn listen(&self, options: &ListenerOptions) -> Result<Box<dyn SocketListener>>;

    /// Address of the local adapter.
    async fn adapter_address(&self) -> Result<BluetoothAddress>;
}

/// Backend used when no platform stack is available. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStack;

#[async_trait]
impl BluetoothStack for NoStack {
    fn name(&self) -> &str {
        "none"
    }

    async fn connect(&self, _options: &SocketOptions) -> Result<Socket> {
        Err(Error::AdapterNotFound)
    }

    async fn listen(&self, _options: &ListenerOptions) -> Result<Box<dyn SocketListener>> {
        Err(Error::AdapterNotFound)
    }

    async fn adapter_address(&self) -> Result<BluetoothAddress> {
        Err(Error::AdapterNotFound)
    }
}
