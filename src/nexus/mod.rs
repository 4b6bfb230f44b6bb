mod event;
pub(crate) mod wire;

use std::io::ErrorKind as IoErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::pin::Pin;
use std::sync::{atomic::*, Arc};
use std::{thread, time};

use ahash::RandomState;
use dashmap::DashMap;

pub(crate) use self::event::*;
use self::wire::*;
use crate::type_alias::*;

/// Session management part of [`Nexus`].
struct NexusSm {
    uri: SocketAddr,
    sm_evt_tx: DashMap<RpcId, SmEventTx, RandomState>,
    sm_should_stop: AtomicBool,
}

impl NexusSm {
    /// Listen on the given socket for management frames, validate them, and
    /// route them into the inbox of the targeted `Rpc`. Session state is
    /// never touched here: the owning endpoint drains its inbox on its own
    /// event-loop thread.
    fn listen(self: Arc<Self>, socket: UdpSocket) {
        const FRAME_SIZE_LIMIT: usize = 1 << 10;
        let mut buf = [0u8; FRAME_SIZE_LIMIT];
        while !self.sm_should_stop.load(Ordering::Relaxed) {
            let (amt, src) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    continue
                }
                Err(ref e) if e.kind() == IoErrorKind::ConnectionRefused => continue,
                Err(e) => panic!("failed to receive UDP packet: {}", e),
            };

            // UDP is unreliable, so malformed frames are simply dropped.
            let frame = match SmFrame::decode(&buf[..amt]) {
                Ok(frame) => frame,
                Err(e) => {
                    log::debug!("Nexus SM: ignoring malformed frame from {}: {}", src, e);
                    continue;
                }
            };

            let Ok(mut addrs) = frame.src_uri.to_socket_addrs() else {
                log::debug!(
                    "Nexus SM: ignoring frame with unresolvable URI {:?}",
                    frame.src_uri
                );
                continue;
            };
            let Some(src_uri) = addrs.next() else {
                continue;
            };

            let details = match frame.kind {
                SmPktKind::ConnectReq => SmEventDetails::ConnectRequest {
                    cli_sess_id: frame.src_sess_id,
                    ep_blob: frame.ep_blob,
                },
                // An empty endpoint blob marks a refusal.
                SmPktKind::ConnectResp if frame.ep_blob.is_empty() => {
                    SmEventDetails::ConnectRefuse {
                        cli_sess_id: frame.dst_sess_id,
                    }
                }
                SmPktKind::ConnectResp => SmEventDetails::ConnectAcknowledge {
                    cli_sess_id: frame.dst_sess_id,
                    svr_sess_id: frame.src_sess_id,
                    ep_blob: frame.ep_blob,
                },
                SmPktKind::DisconnectReq => SmEventDetails::DisconnectRequest {
                    cli_sess_id: frame.src_sess_id,
                    svr_sess_id: frame.dst_sess_id,
                },
                SmPktKind::DisconnectResp => SmEventDetails::DisconnectAcknowledge {
                    cli_sess_id: frame.dst_sess_id,
                },
            };

            let event = SmEvent {
                src_uri,
                src_rpc_id: frame.src_rpc_id,
                dst_rpc_id: frame.dst_rpc_id,
                details,
            };
            match self.sm_evt_tx.get(&event.dst_rpc_id) {
                Some(tx) => tx.send(event),
                None => log::debug!(
                    "Nexus SM: ignoring frame to non-existent RPC {}",
                    event.dst_rpc_id
                ),
            };
        }
    }
}

/// The process-wide session management registry.
///
/// A `Nexus` owns the management UDP socket of the process and a background
/// thread that routes session setup/teardown frames into per-endpoint
/// inboxes. Endpoints register themselves at creation and deregister at
/// drop; the registry itself holds no session state.
pub struct Nexus {
    sm: Arc<NexusSm>,
    sm_thread: Option<thread::JoinHandle<()>>,
}

impl Nexus {
    /// Create an event channel for the given RPC ID.
    ///
    /// # Panics
    ///
    /// Panic if the RPC ID is already used.
    pub(crate) fn register_event_channel(&self, rpc_id: RpcId) -> SmEventRx {
        let (tx, rx) = sm_event_channel();
        assert!(
            self.sm.sm_evt_tx.insert(rpc_id, tx).is_none(),
            "RPC ID {} is already used",
            rpc_id
        );
        rx
    }

    /// Destroy the event channel for the given RPC ID.
    pub(crate) fn destroy_event_channel(&self, rpc_id: RpcId) {
        self.sm.sm_evt_tx.remove(&rpc_id);
    }
}

impl Nexus {
    /// Create a new Nexus instance listening on the given management URI.
    ///
    /// # Panics
    ///
    /// - Panic if the given URI cannot be resolved or bound.
    pub fn new(uri: impl ToSocketAddrs) -> Pin<Arc<Self>> {
        let uri = uri.to_socket_addrs().unwrap().next().unwrap();
        let socket = UdpSocket::bind(uri).unwrap();

        const SOCKET_READ_TIMEOUT: time::Duration = time::Duration::from_millis(100);
        socket.set_read_timeout(Some(SOCKET_READ_TIMEOUT)).unwrap();

        // Make the session manager.
        let sm = Arc::new(NexusSm {
            uri,
            sm_evt_tx: DashMap::with_capacity_and_hasher(256, RandomState::new()),
            sm_should_stop: AtomicBool::new(false),
        });
        let sm_listener = {
            let sm = sm.clone();
            thread::spawn(move || sm.listen(socket))
        };
        Arc::pin(Self {
            sm,
            sm_thread: Some(sm_listener),
        })
    }

    /// Get the URI that this Nexus is listening on.
    #[inline]
    pub fn uri(&self) -> SocketAddr {
        self.sm.uri
    }
}

impl Drop for Nexus {
    fn drop(&mut self) {
        self.sm.sm_should_stop.store(true, Ordering::SeqCst);
        self.sm_thread.take().unwrap().join().unwrap();
    }
}
