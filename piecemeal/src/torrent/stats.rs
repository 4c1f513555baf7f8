/// A snapshot of the download progress of a torrent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Progress {
    /// The ratio of the pieces we have to all pieces, between 0 and 1.
    pub fraction: f64,
    /// The number of megabytes downloaded, derived from the file length and
    /// the completion fraction.
    pub downloaded_mb: f64,
    /// The number of connected peers.
    pub peer_count: usize,
}

impl Progress {
    pub fn new(fraction: f64, download_len: u64, peer_count: usize) -> Self {
        Self {
            fraction,
            downloaded_mb: download_len as f64 * fraction / 1_000_000.0,
            peer_count,
        }
    }

    /// Returns whether all pieces are downloaded.
    pub fn is_complete(&self) -> bool {
        self.fraction >= 1.0
    }
}
