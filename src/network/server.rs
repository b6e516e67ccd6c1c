//! TCP server and connection handling
//!
//! Accepts inbound connections one at a time. Each connection carries exactly
//! one frame; it is decoded, dispatched and closed before the next connection
//! is accepted, so all gossip work on this node is serialized by the loop.

use crate::network::message::{CodecError, Frame, TYPE_WIDTH};
use crate::network::node::{Network, NetworkError};
use crate::network::transport::{Listener, Transport};
use bytes::BytesMut;
use futures::stream::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Fixed-width framing: type field first, then the body it selects
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl Encoder<Frame> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the type field to know the body width
        if src.len() < TYPE_WIDTH {
            return Ok(None);
        }

        let len = Frame::frame_len(src).map_err(invalid_data)?;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let data = src.split_to(len);
        Frame::decode(&data).map(Some).map_err(invalid_data)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let expected = Frame::frame_len(src).unwrap_or(TYPE_WIDTH);
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    CodecError::ShortRead {
                        expected,
                        actual: src.len(),
                    },
                ))
            }
        }
    }
}

fn invalid_data(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Recover the codec error wrapped by [`WireCodec`], if any
pub(crate) fn protocol_error(e: io::Error) -> NetworkError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<CodecError>()) {
        Some(codec) => NetworkError::Protocol(codec.clone()),
        None => NetworkError::Transport(e),
    }
}

/// Listening side of a node
pub struct Server<L: Listener> {
    listener: L,
    port: u16,
}

impl<L: Listener> Server<L> {
    /// Bind through `transport`. Failure here is fatal for the server.
    pub async fn bind<T>(transport: &T, node_id: &str, port: u16) -> Result<Self, NetworkError>
    where
        T: Transport<Listener = L>,
    {
        let listener = transport
            .bind(node_id, port)
            .await
            .map_err(|source| NetworkError::Bind { port, source })?;
        let port = listener.local_port();
        log::info!("Server running on port {}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept and fully handle connections until `shutdown` fires.
    pub async fn run<T: Transport>(
        mut self,
        network: Network<T>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        let port = self.port;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        log::debug!("Incoming connection from {}", remote);
                        if let Err(e) = handle_connection(&network, stream, &remote).await {
                            log::warn!("Dropped connection from {}: {}", remote, e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                        log::info!("Listener closed");
                        break;
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    log::info!("Server on port {} shutting down", port);
                    break;
                }
            }
        }
    }
}

/// Read one frame from `stream` and dispatch it.
///
/// Discovery frames go through the gossip engine and get their reply on the
/// same stream; regular messages go to the message handler with no reply.
pub async fn handle_connection<T, S>(
    network: &Network<T>,
    stream: S,
    remote: &str,
) -> Result<(), NetworkError>
where
    T: Transport,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, WireCodec);

    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(protocol_error(e)),
        None => {
            return Err(NetworkError::Protocol(CodecError::ShortRead {
                expected: TYPE_WIDTH,
                actual: 0,
            }))
        }
    };
    log::debug!("Received {} frame from {}", frame.type_name(), remote);

    match frame {
        Frame::Message(msg) => network.handler().handle(&msg),
        Frame::Discovery(msg) => {
            let tasks = network.plan_discovery(&msg).await;
            network.run_queue(tasks, Some(&mut framed)).await;
        }
    }

    Ok(())
}
