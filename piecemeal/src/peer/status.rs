/// The status of a peer session: its connection state and the choke and
/// interest flags of both sides.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) struct Status {
    /// The current state of the session.
    pub state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    pub is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    pub is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    pub is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    pub is_peer_interested: bool,
}

impl Status {
    /// Returns whether we may send block requests to the peer.
    pub fn can_request(&self) -> bool {
        self.state == State::Active && !self.is_choked && self.is_interested
    }
}

impl Default for Status {
    /// Both sides of the connection start off as choked and not interested in
    /// the other.
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The TCP connection is being established (or accepted).
    Connecting,
    /// The TCP connection is established and the BitTorrent handshakes are
    /// being exchanged.
    Handshaking,
    /// The handshakes are exchanged and any other message may be sent.
    Active,
    /// The session has stopped, either because the connection was closed or
    /// because it was shut down.
    Closed,
}

impl Default for State {
    fn default() -> Self {
        Self::Connecting
    }
}
