use tracing::debug;

use haraltd_types::BluetoothAddress;

use crate::error::{Error, Result};
use crate::obex::{ObexOpcode, ObexOperation, ObexPacket};
use crate::transport::Socket;

/// The server side of one inbound OBEX connection.
#[derive(Debug)]
pub struct ObexServerConnection {
    socket: Socket,
}

impl ObexServerConnection {
    pub fn new(socket: Socket) -> Self {
        Self { socket }
    }

    /// The remote device.
    pub fn address(&self) -> BluetoothAddress {
        self.socket.address()
    }

    /// The underlying socket.
    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Wait for the peer's Connect request and accept it.
    ///
    /// The reply echoes the request with the opcode changed to `Success`.
    /// Any other first request is answered with `ServiceUnavailable` and
    /// fails.
    pub async fn accept_connect(&mut self) -> Result<ObexPacket> {
        let request = self.read_request().await?;
        if !request.opcode.is(ObexOperation::Connect) {
            self.respond(ObexOperation::ServiceUnavailable).await?;
            return Err(Error::ServerTransfer(format!(
                "Expected a Connect request, got {}",
                request.opcode
            )));
        }

        let mut reply = request.clone();
        reply.opcode = ObexOpcode::final_of(ObexOperation::Success);
        self.send(&reply).await?;
        debug!(address = %self.address(), "OBEX client connected");
        Ok(request)
    }

    /// Read the next request.
    pub async fn read_request(&mut self) -> Result<ObexPacket> {
        ObexPacket::read_request(self.socket.stream()).await
    }

    /// Send a final response with no headers.
    pub async fn respond(&mut self, op: ObexOperation) -> Result<()> {
        self.send(&ObexPacket::new(ObexOpcode::final_of(op))).await
    }

    /// Send a packet.
    pub async fn send(&mut self, packet: &ObexPacket) -> Result<()> {
        packet.write_to(self.socket.stream()).await
    }
}
