//! UDP channel endpoint
//!
//! Sends publication frames to the channel's destinations from one
//! non-blocking socket, and dispatches the status messages and NAKs that come
//! back on the same socket to the publication they address.

use parking_lot::RwLock;
use sluice_protocol::endpoint::ChannelEndpoint;
use sluice_protocol::frame::{FrameHeader, FrameType, NakFrame, StatusMessageFrame};
use sluice_protocol::publication::PublicationHandle;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Channel has no destinations")]
    NoDestinations,
}

/// Send side of a UDP channel
pub struct UdpChannelEndpoint {
    socket: UdpSocket,
    destinations: Vec<SocketAddr>,
    multicast_ttl: i32,
    publications: RwLock<HashMap<(i32, i32), PublicationHandle>>,
}

impl UdpChannelEndpoint {
    /// Bind a non-blocking socket at `local` sending to `destinations`.
    pub fn bind(local: SocketAddr, destinations: Vec<SocketAddr>) -> Result<Self, SocketError> {
        if destinations.is_empty() {
            return Err(SocketError::NoDestinations);
        }

        let domain = if local.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let socket: UdpSocket = socket.into();
        tracing::debug!(
            "Bound channel endpoint at {} for {:?}",
            socket.local_addr()?,
            destinations
        );

        Ok(UdpChannelEndpoint {
            socket,
            destinations,
            multicast_ttl: 0,
            publications: RwLock::new(HashMap::new()),
        })
    }

    /// Set the TTL for multicast destinations; advertised in setup frames.
    pub fn set_multicast_ttl(&mut self, ttl: u32) -> Result<(), SocketError> {
        if self.socket.local_addr()?.is_ipv4() {
            self.socket.set_multicast_ttl_v4(ttl)?;
        } else {
            SockRef::from(&self.socket).set_multicast_hops_v6(ttl)?;
        }
        self.multicast_ttl = ttl as i32;
        Ok(())
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.socket).set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.socket).set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        &self.destinations
    }

    /// Start dispatching control frames addressed to `publication`.
    pub fn register_publication(&self, publication: PublicationHandle) {
        let key = (publication.session_id(), publication.stream_id());
        tracing::debug!("Registered publication {}:{}", key.0, key.1);
        self.publications.write().insert(key, publication);
    }

    pub fn publication_count(&self) -> usize {
        self.publications.read().len()
    }

    /// Read every pending datagram and dispatch the control frames.
    ///
    /// Returns the number of frames delivered to publications.
    pub fn poll_control(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut delivered = 0;
        loop {
            match self.socket.recv_from(buf) {
                Ok((length, source)) => {
                    if self.on_control_frame(&buf[..length], source) {
                        delivered += 1;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(delivered),
                Err(e) => return Err(SocketError::Io(e)),
            }
        }
    }

    /// Dispatch one received frame. Returns true if a publication took it.
    pub fn on_control_frame(&self, frame: &[u8], source: SocketAddr) -> bool {
        let header = match FrameHeader::from_bytes(frame) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Malformed frame from {}: {}", source, e);
                return false;
            }
        };

        match header.frame_type() {
            Some(FrameType::StatusMessage) => match StatusMessageFrame::from_bytes(frame) {
                Ok(sm) => self.with_publication(sm.session_id, sm.stream_id, |publication| {
                    publication.on_status_message(
                        sm.consumption_term_id,
                        sm.consumption_term_offset,
                        sm.receiver_window_length,
                        source,
                    );
                    if sm.wants_setup() {
                        publication.trigger_send_setup_frame();
                    }
                }),
                Err(e) => {
                    tracing::debug!("Bad status message from {}: {}", source, e);
                    false
                }
            },
            Some(FrameType::Nak) => match NakFrame::from_bytes(frame) {
                Ok(nak) => self.with_publication(nak.session_id, nak.stream_id, |publication| {
                    publication.on_nak(nak.term_id, nak.term_offset, nak.length);
                }),
                Err(e) => {
                    tracing::debug!("Bad NAK from {}: {}", source, e);
                    false
                }
            },
            other => {
                tracing::trace!("Ignoring frame type {:?} from {}", other, source);
                false
            }
        }
    }

    fn with_publication<F>(&self, session_id: i32, stream_id: i32, f: F) -> bool
    where
        F: FnOnce(&PublicationHandle),
    {
        match self.publications.read().get(&(session_id, stream_id)) {
            Some(publication) => {
                f(publication);
                true
            }
            None => false,
        }
    }
}

impl ChannelEndpoint for UdpChannelEndpoint {
    fn send(&self, frame: &[u8]) -> usize {
        let mut min_sent = frame.len();
        for destination in &self.destinations {
            let sent = match self.socket.send_to(frame, destination) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => 0,
                Err(e) => {
                    tracing::warn!("Send to {} failed: {}", destination, e);
                    0
                }
            };
            min_sent = min_sent.min(sent);
        }
        min_sent
    }

    fn multicast_ttl(&self) -> i32 {
        self.multicast_ttl
    }

    fn remove_publication(&self, session_id: i32, stream_id: i32) {
        if self
            .publications
            .write()
            .remove(&(session_id, stream_id))
            .is_some()
        {
            tracing::debug!("Removed publication {}:{}", session_id, stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use sluice_protocol::clock::ManualClock;
    use sluice_protocol::config::PublicationConfig;
    use sluice_protocol::counters::{Position, SystemCounters};
    use sluice_protocol::flow_control::UnicastFlowControl;
    use sluice_protocol::frame::SEND_SETUP_FLAG;
    use sluice_protocol::publication::{NetworkPublication, PublicationParams, PublicationResources};
    use sluice_protocol::retransmit::DefaultRetransmitHandler;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn receiver_socket() -> UdpSocket {
        let socket = UdpSocket::bind(localhost()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        socket
    }

    fn publication(endpoint: Arc<UdpChannelEndpoint>) -> NetworkPublication {
        let config = PublicationConfig {
            term_length: 64 * 1024,
            ..Default::default()
        };
        let resources = PublicationResources {
            endpoint,
            flow_control: Box::new(UnicastFlowControl::new()),
            retransmit_handler: Box::new(DefaultRetransmitHandler::from_config(&config)),
            counters: Arc::new(SystemCounters::new()),
            epoch_clock: Arc::new(ManualClock::new(0)),
            publisher_limit: Position::new(1, 0),
            sender_position: Position::new(2, 0),
        };
        let params = PublicationParams {
            session_id: 5,
            stream_id: 6,
            initial_term_id: 0,
            config,
        };
        NetworkPublication::new(params, resources, 0).unwrap()
    }

    fn status_message(flags: u8, window: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        StatusMessageFrame {
            flags,
            session_id: 5,
            stream_id: 6,
            consumption_term_id: 0,
            consumption_term_offset: 0,
            receiver_window_length: window,
        }
        .to_bytes(&mut buf);
        buf
    }

    #[test]
    fn test_requires_destination() {
        assert!(matches!(
            UdpChannelEndpoint::bind(localhost(), vec![]),
            Err(SocketError::NoDestinations)
        ));
    }

    #[test]
    fn test_send_to_every_destination() {
        let first = receiver_socket();
        let second = receiver_socket();
        let endpoint = UdpChannelEndpoint::bind(
            localhost(),
            vec![first.local_addr().unwrap(), second.local_addr().unwrap()],
        )
        .unwrap();

        assert_eq!(endpoint.send(b"frame"), 5);

        let mut buf = [0u8; 64];
        for socket in [&first, &second] {
            let (n, from) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"frame");
            assert_eq!(from, endpoint.local_addr().unwrap());
        }
    }

    #[test]
    fn test_status_message_dispatch() {
        let receiver = receiver_socket();
        let endpoint = Arc::new(
            UdpChannelEndpoint::bind(localhost(), vec![receiver.local_addr().unwrap()]).unwrap(),
        );
        let publication = publication(endpoint.clone());
        let handle = publication.handle().clone();
        endpoint.register_publication(handle.clone());

        let source = receiver.local_addr().unwrap();
        assert!(endpoint.on_control_frame(&status_message(0, 4096), source));
        assert!(handle.has_status_message_been_received());
        assert_eq!(handle.sender_position_limit(), 4096);

        // Unknown stream
        let mut other = BytesMut::new();
        NakFrame {
            session_id: 5,
            stream_id: 7,
            term_id: 0,
            term_offset: 0,
            length: 64,
        }
        .to_bytes(&mut other);
        assert!(!endpoint.on_control_frame(&other, source));

        // Not a control frame
        assert!(!endpoint.on_control_frame(&[0u8; 4], source));
    }

    #[test]
    fn test_status_message_requesting_setup() {
        let receiver = receiver_socket();
        let endpoint = Arc::new(
            UdpChannelEndpoint::bind(localhost(), vec![receiver.local_addr().unwrap()]).unwrap(),
        );
        let mut publication = publication(endpoint.clone());
        endpoint.register_publication(publication.handle().clone());
        let source = receiver.local_addr().unwrap();

        endpoint.on_control_frame(&status_message(SEND_SETUP_FLAG, 4096), source);
        publication.send(0);

        let mut buf = [0u8; 128];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(FrameHeader::from_bytes(&buf[..n]).unwrap().frame_type(), Some(FrameType::Setup));
    }

    #[test]
    fn test_poll_control_over_socket() {
        let receiver = receiver_socket();
        let endpoint = Arc::new(
            UdpChannelEndpoint::bind(localhost(), vec![receiver.local_addr().unwrap()]).unwrap(),
        );
        let publication = publication(endpoint.clone());
        let handle = publication.handle().clone();
        endpoint.register_publication(handle.clone());

        receiver
            .send_to(&status_message(0, 8192), endpoint.local_addr().unwrap())
            .unwrap();

        let mut buf = vec![0u8; 1500];
        let mut delivered = 0;
        for _ in 0..100 {
            delivered += endpoint.poll_control(&mut buf).unwrap();
            if delivered > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(delivered, 1);
        assert_eq!(handle.sender_position_limit(), 8192);
    }

    #[test]
    fn test_remove_publication() {
        let receiver = receiver_socket();
        let endpoint = Arc::new(
            UdpChannelEndpoint::bind(localhost(), vec![receiver.local_addr().unwrap()]).unwrap(),
        );
        let publication = publication(endpoint.clone());
        let handle = publication.handle().clone();
        endpoint.register_publication(handle.clone());
        assert_eq!(endpoint.publication_count(), 1);

        handle.inc_ref();
        handle.dec_ref();
        assert_eq!(endpoint.publication_count(), 0);
        assert!(!endpoint.on_control_frame(&status_message(0, 4096), receiver.local_addr().unwrap()));
    }
}
