use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::protocol::Connector;

/// Receives every inbound frame together with the identity of the peer
/// connection it arrived on.
pub trait FrameHandler: Send + Sync + 'static {
    fn handle_frame(&self, from: &Connector, frame: Vec<u8>);
}

/// The operations the node needs from the peer network.
pub trait PeerTransport: Send + Sync + 'static {
    /// Identity this node advertises to peers.
    fn local(&self) -> &Connector;

    fn send(&self, target: &Connector, frame: Vec<u8>) -> ChainResult<()>;

    fn broadcast(&self, frame: Vec<u8>);

    fn own_connections(&self) -> Vec<Connector>;

    fn neighbor(&self) -> Option<Connector>;

    /// Starts dialing `target` in the background. Known peers and the local
    /// connector are ignored.
    fn connect(&self, target: Connector);
}

/// Peer transport over TCP with length-delimited frames.
///
/// The dialing side opens every connection with a handshake frame holding its
/// own bincode encoded [`Connector`], so both ends key the connection by the
/// advertised identity rather than by the ephemeral socket address. A
/// wildcard ip in the handshake is replaced by the socket's peer ip, and an
/// identity that is already connected is refused.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    local: Connector,
    neighbor: Option<Connector>,
    max_frame_length: usize,
    listener: Mutex<Option<TcpListener>>,
    handler: RwLock<Option<Arc<dyn FrameHandler>>>,
    peers: RwLock<HashMap<Connector, PeerLink>>,
    next_link: AtomicU64,
}

struct PeerLink {
    id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl TcpTransport {
    /// Binds the listener. A `local` port of 0 is replaced by the port the
    /// listener actually got.
    pub async fn bind(
        listen: SocketAddr,
        mut local: Connector,
        neighbor: Option<Connector>,
        max_frame_length: usize,
    ) -> ChainResult<Self> {
        let listener = TcpListener::bind(listen).await?;
        if local.port == 0 {
            local.port = listener.local_addr()?.port();
        }
        info!(%listen, local = %local, max_frame_length, "peer transport listening");
        Ok(Self {
            inner: Arc::new(TransportInner {
                local,
                neighbor,
                max_frame_length,
                listener: Mutex::new(Some(listener)),
                handler: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                next_link: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> ChainResult<Option<SocketAddr>> {
        match self.inner.listener.lock().as_ref() {
            Some(listener) => Ok(Some(listener.local_addr()?)),
            None => Ok(None),
        }
    }

    /// Installs `handler` and starts accepting inbound connections.
    pub fn serve(&self, handler: Arc<dyn FrameHandler>) -> ChainResult<JoinHandle<()>> {
        *self.inner.handler.write() = Some(handler);
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| ChainError::Config("peer transport already serving".into()))?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = inner.accept(stream, addr).await {
                                debug!(%addr, ?err, "inbound handshake failed");
                            }
                        });
                    }
                    Err(err) => warn!(?err, "failed to accept peer connection"),
                }
            }
        }))
    }
}

impl TransportInner {
    fn framed(&self, stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(self.max_frame_length)
            .new_codec();
        Framed::new(stream, codec)
    }

    fn check_size(&self, frame: &[u8]) -> ChainResult<()> {
        if frame.len() > self.max_frame_length {
            return Err(ChainError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                self.max_frame_length
            )));
        }
        Ok(())
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> ChainResult<()> {
        let mut framed = self.framed(stream);
        let hello = framed
            .next()
            .await
            .ok_or_else(|| ChainError::Protocol("connection closed before handshake".into()))??;
        let mut remote: Connector = bincode::deserialize(&hello)?;
        let routable = remote
            .ip
            .parse::<IpAddr>()
            .map_or(false, |ip| !ip.is_unspecified());
        if !routable {
            debug!(claimed = %remote, %addr, "resolving unroutable peer identity");
            remote.ip = addr.ip().to_string();
        }
        self.register(remote, framed)
    }

    async fn dial(self: Arc<Self>, target: Connector) -> ChainResult<()> {
        let stream = TcpStream::connect((target.ip.as_str(), target.port)).await?;
        let mut framed = self.framed(stream);
        let hello = bincode::serialize(&self.local)?;
        framed.send(Bytes::from(hello)).await?;
        self.register(target, framed)
    }

    /// Adds the link unless `remote` is already connected, then starts its
    /// reader and writer tasks. Whichever side fails first removes the link.
    fn register(
        self: Arc<Self>,
        remote: Connector,
        framed: Framed<TcpStream, LengthDelimitedCodec>,
    ) -> ChainResult<()> {
        let (sender, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&remote) {
                return Err(ChainError::Protocol(format!(
                    "{remote} is already connected"
                )));
            }
            peers.insert(remote.clone(), PeerLink { id, sender });
        }
        info!(peer = %remote, "peer connected");
        let (mut sink, mut stream) = framed.split();

        let reader_inner = self.clone();
        let reader_peer = remote.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(frame) => {
                        let handler = reader_inner.handler.read().clone();
                        match handler {
                            Some(handler) => handler.handle_frame(&reader_peer, frame.to_vec()),
                            None => debug!(peer = %reader_peer, "no frame handler installed"),
                        }
                    }
                    Err(err) => {
                        debug!(peer = %reader_peer, ?err, "peer read failed");
                        break;
                    }
                }
            }
            reader_inner.unlink(&reader_peer, id);
        });

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(peer = %remote, ?err, "peer write failed, dropping link");
                    reader.abort();
                    self.unlink(&remote, id);
                    break;
                }
            }
        });
        Ok(())
    }

    /// Removes `remote` if it still maps to link `id`; a newer link to the
    /// same peer is left alone.
    fn unlink(&self, remote: &Connector, id: u64) {
        let mut peers = self.peers.write();
        if peers.get(remote).map_or(false, |link| link.id == id) {
            peers.remove(remote);
            info!(peer = %remote, "peer disconnected");
        }
    }
}

impl PeerTransport for TcpTransport {
    fn local(&self) -> &Connector {
        &self.inner.local
    }

    fn send(&self, target: &Connector, frame: Vec<u8>) -> ChainResult<()> {
        self.inner.check_size(&frame)?;
        let peers = self.inner.peers.read();
        let link = peers
            .get(target)
            .ok_or_else(|| ChainError::Protocol(format!("not connected to {target}")))?;
        link.sender
            .send(Bytes::from(frame))
            .map_err(|_| ChainError::Protocol(format!("connection to {target} closed")))
    }

    fn broadcast(&self, frame: Vec<u8>) {
        if let Err(err) = self.inner.check_size(&frame) {
            warn!(?err, "dropping broadcast");
            return;
        }
        let frame = Bytes::from(frame);
        for (peer, link) in self.inner.peers.read().iter() {
            if link.sender.send(frame.clone()).is_err() {
                debug!(%peer, "skipping closed connection");
            }
        }
    }

    fn own_connections(&self) -> Vec<Connector> {
        self.inner.peers.read().keys().cloned().collect()
    }

    fn neighbor(&self) -> Option<Connector> {
        self.inner.neighbor.clone()
    }

    fn connect(&self, target: Connector) {
        if target == self.inner.local || self.inner.peers.read().contains_key(&target) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.dial(target.clone()).await {
                warn!(peer = %target, ?err, "failed to connect to peer");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FRAME_LIMIT: usize = 64 * 1024;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<(Connector, Vec<u8>)>>,
    }

    impl FrameHandler for Collect {
        fn handle_frame(&self, from: &Connector, frame: Vec<u8>) {
            self.frames.lock().push((from.clone(), frame));
        }
    }

    async fn bound_as(local: Connector, max_frame_length: usize) -> (TcpTransport, Connector) {
        let transport = TcpTransport::bind(
            "127.0.0.1:0".parse().expect("addr"),
            local,
            None,
            max_frame_length,
        )
        .await
        .expect("bind");
        let connector = transport.local().clone();
        assert_ne!(connector.port, 0);
        (transport, connector)
    }

    async fn bound() -> (TcpTransport, Connector) {
        bound_as(Connector::new("127.0.0.1", 0), FRAME_LIMIT).await
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn frames_flow_both_ways_after_handshake() {
        let (alpha, alpha_id) = bound().await;
        let (beta, beta_id) = bound().await;
        let alpha_frames = Arc::new(Collect::default());
        let beta_frames = Arc::new(Collect::default());
        alpha.serve(alpha_frames.clone()).expect("serve alpha");
        beta.serve(beta_frames.clone()).expect("serve beta");

        alpha.connect(beta_id.clone());
        wait_until(|| !beta.own_connections().is_empty() && !alpha.own_connections().is_empty())
            .await;
        assert_eq!(beta.own_connections(), vec![alpha_id.clone()]);

        alpha.send(&beta_id, b"ping".to_vec()).expect("send");
        beta.broadcast(b"pong".to_vec());
        wait_until(|| {
            !beta_frames.frames.lock().is_empty() && !alpha_frames.frames.lock().is_empty()
        })
        .await;
        assert_eq!(
            beta_frames.frames.lock().clone(),
            vec![(alpha_id, b"ping".to_vec())]
        );
        assert_eq!(
            alpha_frames.frames.lock().clone(),
            vec![(beta_id, b"pong".to_vec())]
        );
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let (alpha, _) = bound().await;
        let err = alpha
            .send(&Connector::new("10.0.0.1", 1), b"x".to_vec())
            .expect_err("not connected");
        assert!(matches!(err, ChainError::Protocol(_)));
    }

    #[tokio::test]
    async fn wildcard_identities_are_resolved_and_duplicates_refused() {
        let (server, server_id) = bound().await;
        let server_frames = Arc::new(Collect::default());
        server.serve(server_frames.clone()).expect("serve");

        let (first, first_id) = bound_as(Connector::new("0.0.0.0", 0), FRAME_LIMIT).await;
        let (second, second_id) = bound_as(Connector::new("0.0.0.0", 0), FRAME_LIMIT).await;
        first.connect(server_id.clone());
        second.connect(server_id.clone());
        wait_until(|| server.own_connections().len() == 2).await;

        let mut expected = vec![
            Connector::new("127.0.0.1", first_id.port),
            Connector::new("127.0.0.1", second_id.port),
        ];
        expected.sort();
        let mut connected = server.own_connections();
        connected.sort();
        assert_eq!(connected, expected);

        let first_frames = Arc::new(Collect::default());
        first.serve(first_frames.clone()).expect("serve first");
        let (impostor, _) = bound_as(expected[0].clone(), FRAME_LIMIT).await;
        let impostor_frames = Arc::new(Collect::default());
        impostor.serve(impostor_frames.clone()).expect("serve impostor");
        impostor
            .inner
            .clone()
            .dial(server_id.clone())
            .await
            .expect("handshake sent");
        wait_until(|| impostor.own_connections().is_empty()).await;
        assert_eq!(server.own_connections().len(), 2);

        server.broadcast(b"hello".to_vec());
        wait_until(|| !first_frames.frames.lock().is_empty()).await;
        assert!(impostor_frames.frames.lock().is_empty());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (server, server_id) = bound_as(Connector::new("127.0.0.1", 0), 1_024).await;
        let server_frames = Arc::new(Collect::default());
        server.serve(server_frames.clone()).expect("serve");

        let (tight, _) = bound_as(Connector::new("127.0.0.1", 0), 1_024).await;
        tight.connect(server_id.clone());
        wait_until(|| tight.own_connections().contains(&server_id)).await;
        let err = tight
            .send(&server_id, vec![7; 4_096])
            .expect_err("over the limit");
        assert!(matches!(err, ChainError::Protocol(_)));
        tight.send(&server_id, vec![1; 16]).expect("small frame");
        wait_until(|| server_frames.frames.lock().len() == 1).await;
        assert_eq!(server_frames.frames.lock()[0].1, vec![1; 16]);

        let (loose, loose_id) = bound_as(Connector::new("127.0.0.1", 0), FRAME_LIMIT).await;
        loose.connect(server_id.clone());
        wait_until(|| server.own_connections().contains(&loose_id)).await;
        loose.send(&server_id, vec![7; 4_096]).expect("within sender limit");
        wait_until(|| !server.own_connections().contains(&loose_id)).await;
        wait_until(|| loose.own_connections().is_empty()).await;
        assert_eq!(server_frames.frames.lock().len(), 1);
    }
}
