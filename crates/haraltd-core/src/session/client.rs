use tracing::debug;
use uuid::Uuid;

use haraltd_types::BluetoothAddress;

use crate::error::{Error, Result};
use crate::obex::{HeaderId, ObexHeader, ObexOpcode, ObexOperation, ObexPacket};
use crate::transport::{BluetoothStack, Socket, SocketOptions};

/// Maximum packet length assumed when a Connect reply does not say.
const MIN_PACKET_LEN: u16 = 255;

/// An OBEX client connection to a remote service.
#[derive(Debug)]
pub struct ObexClient {
    socket: Socket,
    connection_id: Option<u32>,
    max_packet_len: u16,
}

impl ObexClient {
    /// Open a socket to `service_uuid` on `address` and run the OBEX
    /// Connect exchange.
    pub async fn connect(
        stack: &dyn BluetoothStack,
        address: BluetoothAddress,
        service_uuid: Uuid,
        target: Option<&[u8]>,
    ) -> Result<Self> {
        let socket = stack
            .connect(&SocketOptions {
                address,
                service_uuid,
            })
            .await?;
        Self::handshake(socket, target).await
    }

    /// Run the Connect exchange on an open socket.
    pub async fn handshake(mut socket: Socket, target: Option<&[u8]>) -> Result<Self> {
        ObexPacket::connect(target)?
            .write_to(socket.stream())
            .await?;
        let reply = ObexPacket::read_from(socket.stream(), true).await?;
        if !reply.opcode.is(ObexOperation::Success) {
            return Err(Error::ConnectRejected {
                response: reply.opcode.to_string(),
            });
        }

        let connection_id = reply
            .header(HeaderId::CONNECTION_ID)
            .and_then(ObexHeader::as_u32);
        let max_packet_len = reply
            .connect
            .map_or(MIN_PACKET_LEN, |c| c.max_packet_len.max(MIN_PACKET_LEN));
        debug!(
            address = %socket.address(),
            ?connection_id,
            max_packet_len,
            "OBEX session connected"
        );
        Ok(Self {
            socket,
            connection_id,
            max_packet_len,
        })
    }

    /// The remote device.
    pub fn address(&self) -> BluetoothAddress {
        self.socket.address()
    }

    /// The connection id the server assigned, if any.
    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    /// The largest packet the server accepts.
    pub fn max_packet_len(&self) -> u16 {
        self.max_packet_len
    }

    /// A `ConnectionId` header for this connection, if one was assigned.
    pub fn connection_id_header(&self) -> Result<Option<ObexHeader>> {
        self.connection_id
            .map(|id| ObexHeader::from_u32(HeaderId::CONNECTION_ID, id))
            .transpose()
            .map_err(Error::from)
    }

    /// Send a request and read the response.
    pub async fn request(&mut self, packet: &ObexPacket) -> Result<ObexPacket> {
        packet.write_to(self.socket.stream()).await?;
        ObexPacket::read_from(self.socket.stream(), false).await
    }

    /// Abort the current operation.
    pub async fn abort(&mut self) -> Result<ObexPacket> {
        let mut packet = ObexPacket::new(ObexOpcode::final_of(ObexOperation::Abort));
        if let Some(header) = self.connection_id_header()? {
            packet.set_header(header);
        }
        self.request(&packet).await
    }

    /// End the OBEX session. The socket stays open until dropped.
    pub async fn disconnect(&mut self) -> Result<ObexPacket> {
        let mut packet = ObexPacket::new(ObexOpcode::final_of(ObexOperation::Disconnect));
        if let Some(header) = self.connection_id_header()? {
            packet.set_header(header);
        }
        self.request(&packet).await
    }
}
