//! This module defines the alerts the API user may receive from the torrent
//! engine.
//!
//! Communication of such alerts is performed via unbounded [tokio mpsc
//! channels](tokio::sync::mpsc). Thus, the application in which the engine is
//! integrated may be driven partially or entirely by piecemeal alerts.

use std::path::PathBuf;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::torrent::stats::Progress;

pub(crate) type AlertSender = UnboundedSender<Alert>;
/// The channel on which alerts from the engine can be received. See [`Alert`]
/// for the type of messages that can be received.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the engine may send the library user.
#[derive(Debug, Clone)]
pub enum Alert {
    /// The torrent sends an update of its download progress on every tick.
    Progress(Progress),
    /// Posted when the torrent has finished downloading and its file has been
    /// assembled at the given path.
    TorrentComplete(PathBuf),
    /// Posted when the torrent could not be finished, e.g. because the
    /// downloaded pieces could not be assembled.
    Error(String),
}
