#[macro_use]
mod peer_log;
mod codec;
mod error;
mod status;

pub use error::PeerError;

use std::{collections::VecDeque, fmt, net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield::BitField, conf::TorrentConf, download::PieceDownload,
    scheduler::Scheduler, BlockInfo, PieceIndex,
};
use codec::*;
use error::Result;
use status::{State, Status};

/// Requests for more than this many bytes are not served.
const MAX_REQUEST_LEN: u32 = 128 * 1024;

/// The side of the transfer a session takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// We connected to the peer to download pieces from it.
    Leech,
    /// The peer connected to us to download pieces from us. We never request
    /// blocks in this role.
    Seed,
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Leech => write!(fmt, "leech"),
            Self::Seed => write!(fmt, "seed"),
        }
    }
}

pub(crate) struct PeerSession {
    /// Whether we download from or upload to the peer.
    role: Role,
    /// The piece scheduler of the torrent, shared with all other sessions.
    scheduler: Arc<Scheduler>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Handed to the disk task so that it can send us the blocks we read for
    /// the peer.
    cmd_chan: Sender,
    /// The port on which peer session receives commands.
    cmd_port: Receiver,
    /// Session related information.
    status: Status,
    /// All pieces peer has, as advertised in its bitfield. Only set in the
    /// leech role.
    pieces: Option<BitField>,
    /// The piece we are currently downloading from the peer.
    download: Option<PieceDownload>,
    /// The messages waiting to be sent to the peer.
    outbox: Outbox,
    /// How long to wait for a message from the peer in one round of the
    /// session loop.
    read_timeout: Duration,
}

impl PeerSession {
    /// Creates a new session that connects to and downloads from the peer at
    /// the given address.
    pub fn outbound(
        scheduler: Arc<Scheduler>,
        addr: SocketAddr,
        conf: &TorrentConf,
    ) -> Self {
        Self::new(Role::Leech, scheduler, addr, conf)
    }

    /// Creates a new session that serves the peer that connected to us from
    /// the given address.
    pub fn inbound(
        scheduler: Arc<Scheduler>,
        addr: SocketAddr,
        conf: &TorrentConf,
    ) -> Self {
        Self::new(Role::Seed, scheduler, addr, conf)
    }

    fn new(
        role: Role,
        scheduler: Arc<Scheduler>,
        addr: SocketAddr,
        conf: &TorrentConf,
    ) -> Self {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Self {
            role,
            scheduler,
            addr,
            cmd_chan,
            cmd_port,
            status: Status::default(),
            pieces: None,
            download: None,
            outbox: Outbox::new(conf.outbound_queue_len),
            read_timeout: conf.read_timeout,
        }
    }

    /// Connects to the peer and runs the session until the connection is
    /// closed, the peer chokes us or the session is shut down.
    pub async fn start_outbound(&mut self) -> Result<()> {
        debug_assert_eq!(self.role, Role::Leech);
        peer_info!(self, "Connecting");
        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        peer_info!(self, "Connected");

        self.register().await;
        let result = self.run_outbound(socket).await;
        self.release().await;
        result
    }

    /// Runs the session on the socket of a peer that connected to us.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        debug_assert_eq!(self.role, Role::Seed);
        peer_info!(self, "Accepted connection");

        self.register().await;
        let result = self.run_inbound(socket).await;
        self.release().await;
        result
    }

    async fn register(&self) {
        self.scheduler
            .register_peer(self.addr, self.role, self.cmd_chan.clone())
            .await;
    }

    async fn run_outbound(&mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake = Handshake::new(
            self.scheduler.info_hash(),
            self.scheduler.client_id(),
        );
        peer_debug!(self, "Sending handshake");
        socket.send(handshake).await?;

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::NoHandshake),
        };
        // the peer we connected to is assumed to serve our torrent, so its
        // info hash is not checked
        peer_debug!(self, "Received handshake: {:?}", peer_handshake);

        let mut socket = switch_to_peer_codec(socket);
        self.status.state = State::Active;
        self.send_unchoke();
        let result = self.run(&mut socket).await;
        self.close(socket).await;
        result
    }

    async fn run_inbound(&mut self, socket: TcpStream) -> Result<()> {
        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(PeerError::NoHandshake),
        };
        peer_debug!(self, "Received handshake: {:?}", peer_handshake);
        if peer_handshake.info_hash != self.scheduler.info_hash() {
            peer_warn!(self, "Handshake has invalid info hash");
            return Err(PeerError::InvalidInfoHash);
        }

        let handshake = Handshake::new(
            self.scheduler.info_hash(),
            self.scheduler.client_id(),
        );
        peer_debug!(self, "Sending handshake");
        socket.send(handshake).await?;

        let mut socket = switch_to_peer_codec(socket);
        self.status.state = State::Active;
        let own_pieces = self.scheduler.own_pieces().await;
        self.enqueue(Message::Bitfield(own_pieces));
        self.send_unchoke();
        let result = self.run(&mut socket).await;
        self.close(socket).await;
        result
    }

    /// Runs the session after the handshakes are exchanged.
    ///
    /// Each round of the loop sends at most one queued message, then handles
    /// at most one message from the peer or one command, waiting for at most
    /// the read timeout, then makes requests if we're downloading.
    async fn run(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        while self.status.state != State::Closed {
            if let Some(msg) = self.outbox.pop() {
                peer_trace!(self, "Sending message {:?}", msg.id());
                socket.send(msg).await?;
            }

            // don't wait for the peer if we have messages to send
            let timeout = if self.outbox.is_empty() {
                self.read_timeout
            } else {
                Duration::ZERO
            };

            tokio::select! {
                msg = socket.next() => match msg {
                    Some(msg) => self.handle_msg(msg?).await?,
                    None => {
                        peer_info!(self, "Peer closed the connection");
                        self.status.state = State::Closed;
                    }
                },
                Some(cmd) = self.cmd_port.recv() => self.handle_cmd(cmd),
                _ = time::sleep(timeout) => {}
            }

            if self.role == Role::Leech && self.status.can_request() {
                self.make_requests().await;
            }
        }

        Ok(())
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<()> {
        peer_trace!(self, "Received message {:?}", msg.id());
        match msg {
            Message::Choke => {
                self.status.is_choked = true;
                if self.role == Role::Leech {
                    peer_info!(self, "Peer choked us, closing session");
                    self.status.state = State::Closed;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    peer_info!(self, "Peer unchoked us");
                    self.status.is_choked = false;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    peer_info!(self, "Peer is interested");
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    peer_info!(self, "Peer is not interested");
                    self.status.is_peer_interested = false;
                }
            }
            Message::Bitfield(bitfield) => {
                if self.role == Role::Leech {
                    peer_debug!(
                        self,
                        "Peer has {} piece(s)",
                        bitfield.available_indices().len()
                    );
                    self.pieces = Some(bitfield);
                    if !self.status.is_interested {
                        self.status.is_interested = true;
                        self.enqueue(Message::Interested);
                    }
                } else {
                    peer_debug!(self, "Ignoring bitfield of downloading peer");
                }
            }
            Message::Request {
                piece_index,
                offset,
                length,
            } => {
                let info = BlockInfo {
                    piece_index: piece_index as PieceIndex,
                    offset,
                    len: length,
                };
                self.handle_request(info)?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index as PieceIndex, offset, data);
            }
            Message::KeepAlive
            | Message::Have { .. }
            | Message::Cancel { .. }
            | Message::Port(_) => {
                peer_trace!(self, "Ignoring message");
            }
        }
        Ok(())
    }

    fn handle_cmd(&mut self, cmd: Command) {
        match cmd {
            Command::Shutdown => {
                peer_info!(self, "Shutting down session");
                self.status.state = State::Closed;
            }
            Command::PieceAvailable(index) => {
                self.enqueue(Message::Have {
                    piece_index: index as u32,
                });
            }
            Command::Block { info, data } => {
                peer_trace!(self, "Serving block {:?}", info);
                self.enqueue(Message::Block {
                    piece_index: info.piece_index as u32,
                    offset: info.offset,
                    data,
                });
            }
        }
    }

    /// Asks the disk task to read the requested block, which is sent back to
    /// this session once read.
    fn handle_request(&mut self, info: BlockInfo) -> Result<()> {
        if info.len == 0 || info.len > MAX_REQUEST_LEN {
            peer_warn!(self, "Dropping request of invalid length: {:?}", info);
            return Ok(());
        }
        peer_debug!(self, "Peer requested block {:?}", info);
        self.scheduler
            .disk()
            .read_block(info, self.cmd_chan.clone())
            .map_err(|_| PeerError::Channel)
    }

    fn handle_block(&mut self, index: PieceIndex, offset: u32, data: Vec<u8>) {
        if self.role == Role::Seed {
            peer_debug!(self, "Ignoring block sent by downloading peer");
            return;
        }
        match &mut self.download {
            Some(download) => {
                if !download.on_block_received(index, offset, data) {
                    peer_warn!(
                        self,
                        "Dropped block of piece {} at offset {}",
                        index,
                        offset
                    );
                }
            }
            None => {
                peer_warn!(self, "Received block without active download");
            }
        }
    }

    /// Drives the download: confirms the held piece once complete, acquires
    /// a new piece if none is held and requests as many of its blocks as the
    /// piece's request window allows.
    async fn make_requests(&mut self) {
        let pieces = match &self.pieces {
            Some(pieces) => pieces,
            None => return,
        };

        loop {
            if self.download.is_none() {
                match self.scheduler.assign_piece(pieces).await {
                    Some(download) => {
                        peer_debug!(
                            self,
                            "Assigned piece {}",
                            download.piece_index()
                        );
                        self.download = Some(download);
                    }
                    None => return,
                }
            }

            let is_complete = match &self.download {
                Some(download) => download.is_complete(),
                None => return,
            };
            if is_complete {
                if let Some(download) = self.download.take() {
                    let index = download.piece_index();
                    let confirmation =
                        self.scheduler.confirm_piece(download).await;
                    peer_info!(
                        self,
                        "Piece {} confirmed: {:?}",
                        index,
                        confirmation
                    );
                }
                continue;
            }

            if let Some(download) = &mut self.download {
                while let Some(block) = download.next_block_to_request() {
                    let msg = Message::Request {
                        piece_index: block.piece_index as u32,
                        offset: block.offset,
                        length: block.len,
                    };
                    if !self.outbox.push(msg) {
                        peer_warn!(
                            self,
                            "Outbound queue full, dropping request {:?}",
                            block
                        );
                        // requested again once the queue drains
                        download.cancel_request(&block);
                        break;
                    }
                }
            }
            return;
        }
    }

    fn send_unchoke(&mut self) {
        self.status.is_peer_choked = false;
        self.enqueue(Message::Unchoke);
    }

    fn enqueue(&mut self, msg: Message) {
        if let Some(msg) = self.outbox.push_or_return(msg) {
            peer_warn!(
                self,
                "Outbound queue full, dropping message {:?}",
                msg.id()
            );
        }
    }

    /// Closes the connection, best-effort.
    async fn close(&mut self, mut socket: Framed<TcpStream, PeerCodec>) {
        self.status.state = State::Closed;
        if let Err(e) = socket.close().await {
            peer_debug!(self, "Error closing connection: {}", e);
        }
    }

    /// Releases the piece held by the session and removes the session from
    /// the torrent.
    async fn release(&mut self) {
        self.status.state = State::Closed;
        if let Some(download) = self.download.take() {
            peer_debug!(self, "Releasing piece {}", download.piece_index());
            self.scheduler.cancel_piece(download.piece_index()).await;
        }
        self.scheduler.deregister_peer(&self.addr).await;
        peer_info!(self, "Session stopped");
    }
}

/// Switches to the peer message codec once the handshakes are exchanged.
///
/// The read and write buffers of the handshake codec are kept, as they may
/// already contain messages the peer sent right after its handshake.
fn switch_to_peer_codec(
    socket: Framed<TcpStream, HandshakeCodec>,
) -> Framed<TcpStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

/// The bounded queue of messages to be sent to the peer.
struct Outbox {
    queue: VecDeque<Message>,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
        }
    }

    /// Queues the message, or returns false if the queue is full, in which
    /// case the message is dropped.
    fn push(&mut self, msg: Message) -> bool {
        self.push_or_return(msg).is_none()
    }

    /// Queues the message, or hands it back if the queue is full.
    fn push_or_return(&mut self, msg: Message) -> Option<Message> {
        if self.queue.len() >= self.capacity {
            return Some(msg);
        }
        self.queue.push_back(msg);
        None
    }

    fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// The channel on which other parts of the engine can send a command to the
/// peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands peer session can receive.
#[derive(Clone, Debug)]
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// A piece was downloaded and verified, and is announced to the peer.
    PieceAvailable(PieceIndex),
    /// A block the peer requested was read from disk and is sent to the peer.
    Block { info: BlockInfo, data: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        disk::{self, CommandReceiver},
        piece_picker::{tests::make_torrent, PiecePicker},
    };

    const PIECE_LEN: u32 = 32000;
    const INFO_HASH: [u8; 20] = [7; 20];

    fn make_scheduler(
        piece_count: usize,
    ) -> (Arc<Scheduler>, CommandReceiver, Vec<u8>, PiecePicker) {
        let download_len = piece_count as u64 * PIECE_LEN as u64;
        let (data, hashes) = make_torrent(PIECE_LEN, download_len);
        let picker = PiecePicker::new(hashes.clone(), PIECE_LEN, download_len);
        let (disk, disk_port) = disk::mock();
        let scheduler = Scheduler::new(
            INFO_HASH,
            [1; 20],
            picker,
            disk,
            Duration::from_secs(10),
        );
        // a second picker over the same torrent that tests may modify before
        // building their own scheduler
        let spare = PiecePicker::new(hashes, PIECE_LEN, download_len);
        (Arc::new(scheduler), disk_port, data, spare)
    }

    fn conf() -> TorrentConf {
        let mut conf = TorrentConf::new(std::env::temp_dir());
        conf.read_timeout = Duration::from_millis(50);
        conf
    }

    async fn exchange_handshakes(
        socket: TcpStream,
        info_hash: [u8; 20],
        send_first: bool,
    ) -> (Framed<TcpStream, PeerCodec>, Handshake) {
        let mut socket = Framed::new(socket, HandshakeCodec);
        let handshake = Handshake::new(info_hash, [9; 20]);
        if send_first {
            socket.send(handshake).await.unwrap();
        }
        let peer_handshake = socket.next().await.unwrap().unwrap();
        if !send_first {
            socket.send(handshake).await.unwrap();
        }
        (switch_to_peer_codec(socket), peer_handshake)
    }

    // Runs a remote seed that has all pieces of the torrent and serves every
    // request until the connection is closed. Returns the messages it
    // received, apart from requests.
    async fn run_fake_seed(
        listener: TcpListener,
        data: Vec<u8>,
        piece_count: usize,
    ) -> Vec<Message> {
        let (socket, _) = listener.accept().await.unwrap();
        let (mut socket, handshake) =
            exchange_handshakes(socket, INFO_HASH, false).await;
        assert_eq!(handshake.info_hash, INFO_HASH);

        let all = BitField::from_pieces(piece_count, 0..piece_count);
        socket.send(Message::Bitfield(all)).await.unwrap();
        socket.send(Message::Unchoke).await.unwrap();

        let mut received = Vec::new();
        while let Some(Ok(msg)) = socket.next().await {
            if let Message::Request {
                piece_index,
                offset,
                length,
            } = msg
            {
                let start = piece_index as usize * PIECE_LEN as usize
                    + offset as usize;
                let block = data[start..start + length as usize].to_vec();
                socket
                    .send(Message::Block {
                        piece_index,
                        offset,
                        data: block,
                    })
                    .await
                    .unwrap();
            } else {
                received.push(msg);
            }
        }
        received
    }

    // A leech session downloads a two piece torrent from a seed: both pieces
    // are saved, the download is finalized and the session stops.
    #[tokio::test]
    async fn test_leech_downloads_all_pieces() {
        let (scheduler, mut disk_port, data, _) = make_scheduler(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed = tokio::spawn(run_fake_seed(listener, data.clone(), 2));

        let mut session =
            PeerSession::outbound(Arc::clone(&scheduler), addr, &conf());
        session.start_outbound().await.unwrap();

        assert!(scheduler.is_complete().await);
        assert!(scheduler.peers().await.is_empty());

        let mut written = BTreeSet::new();
        for _ in 0..2 {
            match disk_port.recv().await {
                Some(disk::Command::WritePiece { index, data: piece }) => {
                    let start = index * PIECE_LEN as usize;
                    assert_eq!(piece, &data[start..start + PIECE_LEN as usize]);
                    written.insert(index);
                }
                cmd => panic!("unexpected disk command: {:?}", cmd),
            }
        }
        assert_eq!(written, (0..2).collect());
        assert!(matches!(disk_port.recv().await, Some(disk::Command::Finalize)));

        let received = seed.await.unwrap();
        assert_eq!(received[0], Message::Unchoke);
        assert!(received.contains(&Message::Interested));
    }

    // A leech session closes as soon as the peer chokes it, releasing the
    // piece it was downloading.
    #[tokio::test]
    async fn test_leech_closes_on_choke() {
        let (scheduler, _disk_port, _, _) = make_scheduler(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut socket, _) =
                exchange_handshakes(socket, INFO_HASH, false).await;
            let all = BitField::from_pieces(2, 0..2);
            socket.send(Message::Bitfield(all)).await.unwrap();
            socket.send(Message::Unchoke).await.unwrap();
            // wait for the first request before choking
            loop {
                match socket.next().await {
                    Some(Ok(Message::Request { .. })) => break,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected: {:?}", other),
                }
            }
            socket.send(Message::Choke).await.unwrap();
            // drain until the session closes the connection
            while let Some(Ok(_)) = socket.next().await {}
        });

        let mut session =
            PeerSession::outbound(Arc::clone(&scheduler), addr, &conf());
        session.start_outbound().await.unwrap();
        seed.await.unwrap();

        assert!(!scheduler.is_complete().await);
        // the held piece was released
        assert!(scheduler.pieces().await.is_empty());
        assert!(scheduler.peers().await.is_empty());
    }

    // A seed session advertises the pieces we have and serves requested
    // blocks read from disk.
    #[tokio::test]
    async fn test_seed_serves_requests() {
        let (_, _, data, mut picker) = make_scheduler(2);
        picker.received_piece(0);
        let (disk, mut disk_port) = disk::mock();
        let scheduler = Arc::new(Scheduler::new(
            INFO_HASH,
            [1; 20],
            picker,
            disk,
            Duration::from_secs(10),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let socket = TcpStream::connect(addr).await.unwrap();
            let (mut socket, handshake) =
                exchange_handshakes(socket, INFO_HASH, true).await;
            assert_eq!(handshake.info_hash, INFO_HASH);
            assert_eq!(handshake.peer_id, [1; 20]);

            match socket.next().await {
                Some(Ok(Message::Bitfield(bitfield))) => {
                    assert!(bitfield.has_piece(0));
                    assert!(!bitfield.has_piece(1));
                }
                other => panic!("expected bitfield, got {:?}", other),
            }
            assert_eq!(socket.next().await.unwrap().unwrap(), Message::Unchoke);

            socket.send(Message::Interested).await.unwrap();
            socket
                .send(Message::Request {
                    piece_index: 0,
                    offset: 16000,
                    length: 16000,
                })
                .await
                .unwrap();
            let block = socket.next().await.unwrap().unwrap();
            // closing the connection ends the session
            drop(socket);
            block
        });

        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut session =
            PeerSession::inbound(Arc::clone(&scheduler), peer_addr, &conf());
        let session = tokio::spawn(async move {
            session.start_inbound(socket).await
        });

        // play the disk task
        match disk_port.recv().await {
            Some(disk::Command::ReadBlock { info, result_chan }) => {
                assert_eq!(info.piece_index, 0);
                assert_eq!(info.offset, 16000);
                assert_eq!(info.len, 16000);
                let data = data[16000..32000].to_vec();
                result_chan.send(Command::Block { info, data }).unwrap();
            }
            cmd => panic!("unexpected disk command: {:?}", cmd),
        }

        let block = client.await.unwrap();
        assert_eq!(
            block,
            Message::Block {
                piece_index: 0,
                offset: 16000,
                data: data[16000..32000].to_vec(),
            }
        );
        session.await.unwrap().unwrap();
        assert!(scheduler.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_seed_rejects_invalid_info_hash() {
        let (scheduler, _disk_port, _, _) = make_scheduler(2);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let socket = TcpStream::connect(addr).await.unwrap();
            let mut socket = Framed::new(socket, HandshakeCodec);
            socket.send(Handshake::new([0; 20], [9; 20])).await.unwrap();
            // the session closes without replying
            assert!(socket.next().await.is_none());
        });

        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut session =
            PeerSession::inbound(Arc::clone(&scheduler), peer_addr, &conf());
        let result = session.start_inbound(socket).await;
        assert!(matches!(result, Err(PeerError::InvalidInfoHash)));
        drop(session);
        client.await.unwrap();
        assert!(scheduler.peers().await.is_empty());
    }

    // Accepts a connection from a downloading peer and runs a seed session
    // for it. Returns the peer's socket, past the bitfield and unchoke the
    // session sends, along with the session task and its command channel.
    async fn accept_seed_session(
        scheduler: &Arc<Scheduler>,
    ) -> (
        Framed<TcpStream, PeerCodec>,
        tokio::task::JoinHandle<Result<()>>,
        Sender,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect =
            tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (socket, peer_addr) = listener.accept().await.unwrap();
        let mut session =
            PeerSession::inbound(Arc::clone(scheduler), peer_addr, &conf());
        let cmd_chan = session.cmd_chan.clone();
        let session = tokio::spawn(async move {
            session.start_inbound(socket).await
        });

        let socket = connect.await.unwrap();
        let (mut socket, _) = exchange_handshakes(socket, INFO_HASH, true).await;
        assert!(matches!(
            socket.next().await,
            Some(Ok(Message::Bitfield(_)))
        ));
        assert_eq!(socket.next().await.unwrap().unwrap(), Message::Unchoke);
        (socket, session, cmd_chan)
    }

    // A piece downloaded through another session is announced to the peer
    // with a have message.
    #[tokio::test]
    async fn test_piece_available_sends_have() {
        let (scheduler, _disk_port, _, _) = make_scheduler(2);
        let (mut socket, session, cmd_chan) =
            accept_seed_session(&scheduler).await;

        cmd_chan.send(Command::PieceAvailable(1)).unwrap();
        assert_eq!(
            socket.next().await.unwrap().unwrap(),
            Message::Have { piece_index: 1 }
        );

        cmd_chan.send(Command::Shutdown).unwrap();
        session.await.unwrap().unwrap();
    }

    // A seed session is not closed by a choke from the peer and keeps
    // serving its requests.
    #[tokio::test]
    async fn test_seed_stays_open_on_choke() {
        let (scheduler, mut disk_port, _, _) = make_scheduler(2);
        let (mut socket, session, cmd_chan) =
            accept_seed_session(&scheduler).await;

        socket.send(Message::Choke).await.unwrap();
        socket
            .send(Message::Request {
                piece_index: 0,
                offset: 0,
                length: 16000,
            })
            .await
            .unwrap();
        match disk_port.recv().await {
            Some(disk::Command::ReadBlock { info, .. }) => {
                assert_eq!(info.piece_index, 0);
                assert_eq!(info.offset, 0);
            }
            cmd => panic!("unexpected disk command: {:?}", cmd),
        }
        assert!(!session.is_finished());
        assert_eq!(scheduler.peers().await.len(), 1);

        cmd_chan.send(Command::Shutdown).unwrap();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_seed_records_choke() {
        let (scheduler, _disk_port, _, _) = make_scheduler(2);
        let addr = "127.0.0.1:6000".parse().unwrap();
        let mut session = PeerSession::inbound(scheduler, addr, &conf());
        session.status.state = State::Active;

        session.handle_msg(Message::Choke).await.unwrap();
        assert!(session.status.is_choked);
        assert_eq!(session.status.state, State::Active);
    }

    // A seed session told to shut down closes the connection and leaves the
    // torrent.
    #[tokio::test]
    async fn test_seed_shutdown() {
        let (scheduler, _disk_port, _, _) = make_scheduler(2);
        let (mut socket, session, cmd_chan) =
            accept_seed_session(&scheduler).await;
        assert_eq!(scheduler.peers().await.len(), 1);

        cmd_chan.send(Command::Shutdown).unwrap();
        session.await.unwrap().unwrap();
        assert!(socket.next().await.is_none());
        assert!(scheduler.peers().await.is_empty());
    }

    // A request that doesn't fit in the outbound queue is sent once the
    // queue drains rather than lost.
    #[tokio::test]
    async fn test_dropped_request_is_requested_again() {
        let (scheduler, _disk_port, _, _) = make_scheduler(1);
        let mut conf = conf();
        conf.outbound_queue_len = 1;
        let addr = "127.0.0.1:6000".parse().unwrap();
        let mut session = PeerSession::outbound(scheduler, addr, &conf);
        session.pieces = Some(BitField::from_pieces(1, 0..1));

        session.make_requests().await;
        assert_eq!(
            session.outbox.pop(),
            Some(Message::Request {
                piece_index: 0,
                offset: 0,
                length: 16000,
            })
        );
        assert!(session.outbox.is_empty());

        session.make_requests().await;
        assert_eq!(
            session.outbox.pop(),
            Some(Message::Request {
                piece_index: 0,
                offset: 16000,
                length: 16000,
            })
        );
        assert!(session.outbox.is_empty());
    }

    #[test]
    fn test_outbox_drops_on_overflow() {
        let mut outbox = Outbox::new(2);
        assert!(outbox.push(Message::Choke));
        assert!(outbox.push(Message::Unchoke));
        assert!(!outbox.push(Message::Interested));
        assert_eq!(outbox.pop(), Some(Message::Choke));
        assert_eq!(outbox.pop(), Some(Message::Unchoke));
        assert_eq!(outbox.pop(), None);
        assert!(outbox.is_empty());
    }
}
