mod error;
mod io;

pub(crate) use error::*;
pub use error::NewTorrentError;

use std::path::PathBuf;

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    conf::TorrentConf, error::Error, peer, storage_info::StorageInfo,
    BlockInfo, PieceIndex,
};
use io::{Disk, Storage};

/// The result of successfully setting up the torrent's storage.
pub(crate) struct Allocation {
    /// The handle of the disk task, resolved once the task shuts down.
    pub join_handle: task::JoinHandle<Result<()>>,
    /// The handle used for sending commands to the disk task.
    pub handle: DiskHandle,
    /// The port on which the torrent receives the results of writes and of
    /// finalizing the download.
    pub alert_port: AlertReceiver,
    /// The pieces that are already present and valid on disk. Only non-empty
    /// when seeding from an existing file.
    pub valid_pieces: Vec<PieceIndex>,
}

/// Sets up the torrent's storage and spawns a disk IO task for it.
///
/// When `source` is set, the torrent is seeded from that complete file: every
/// piece in it is hashed and those that match are returned in the
/// allocation. Otherwise a new download is set up in the download directory.
pub(crate) async fn spawn(
    info: StorageInfo,
    piece_hashes: Vec<u8>,
    conf: &TorrentConf,
    source: Option<PathBuf>,
) -> Result<Allocation, NewTorrentError> {
    log::info!("Spawning disk IO task");
    let cache_len = conf.read_cache_len;
    // hashing the source may take a while, so don't block the reactor
    let (storage, valid_pieces) = task::spawn_blocking(move || match source {
        Some(source) => {
            Storage::new_seed(info, piece_hashes, source, cache_len)
        }
        None => Storage::new_download(info, piece_hashes, cache_len)
            .map(|storage| (storage, Vec::new())),
    })
    .await
    .map_err(|e| {
        NewTorrentError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    })??;

    let (mut disk, cmd_chan, alert_port) =
        Disk::new(storage, conf.disk_worker_count);
    // spawn disk event loop on a new task
    let join_handle = task::spawn(async move { disk.start().await });
    log::info!("Spawned disk IO task");

    Ok(Allocation {
        join_handle,
        handle: DiskHandle(cmd_chan),
        alert_port,
        valid_pieces,
    })
}

/// Returns a disk handle whose commands are not executed but can be inspected
/// via the returned receiver.
#[cfg(test)]
pub(crate) fn mock() -> (DiskHandle, CommandReceiver) {
    let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
    (DiskHandle(cmd_chan), cmd_port)
}

/// The handle for the disk task, used to execute disk IO related tasks.
///
/// The handle may be copied an arbitrary number of times. It is an abstraction
/// over the means to communicate with the disk IO task. For now, mpsc channels
/// are used for issuing commands and receiving results, but this may well
/// change later on, hence hiding this behind this handle type.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Queues a verified piece for eventual writing to disk.
    ///
    /// The torrent is only alerted if the write fails.
    pub fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving piece {} to disk", index);
        self.0
            .send(Command::WritePiece { index, data })
            .map_err(Error::from)
    }

    /// Reads a block from disk and sends it to the given peer session once
    /// done.
    ///
    /// If the block cannot be read, nothing is sent.
    pub fn read_block(
        &self,
        info: BlockInfo,
        result_chan: peer::Sender,
    ) -> Result<()> {
        log::trace!("Reading block {:?} from disk", info);
        self.0
            .send(Command::ReadBlock { info, result_chan })
            .map_err(Error::from)
    }

    /// Waits for all pending writes and assembles the pieces into the final
    /// file.
    ///
    /// The result is advertised to the torrent as [`Alert::Finalized`].
    pub fn finalize(&self) -> Result<()> {
        log::trace!("Finalizing download");
        self.0.send(Command::Finalize).map_err(Error::from)
    }

    /// Shuts down the disk IO task.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

// The channel for sendng commands to the disk task.
type CommandSender = UnboundedSender<Command>;
// The channel the disk task uses to listen for commands.
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
#[derive(Debug)]
pub(crate) enum Command {
    /// Request to eventually write a verified piece to disk.
    WritePiece { index: PieceIndex, data: Vec<u8> },
    /// Request to eventually read a block and send it to a peer session.
    ReadBlock {
        info: BlockInfo,
        result_chan: peer::Sender,
    },
    /// Assemble the downloaded pieces into the final file.
    Finalize,
    /// Eventually shut down the disk task.
    Shutdown,
}

// The type of channel used to alert the torrent about disk events.
type AlertSender = UnboundedSender<Alert>;
/// The channel on which the torrent can listen for disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task may send the torrent.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A verified piece could not be saved to disk and needs to be downloaded
    /// again.
    WriteFailed { index: PieceIndex, error: WriteError },
    /// The result of assembling the download, with the path of the assembled
    /// file on success.
    Finalized(Result<PathBuf, WriteError>),
}
