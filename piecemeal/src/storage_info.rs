use std::path::{Path, PathBuf};

use crate::{metainfo::Metainfo, PieceIndex};

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the normal piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    pub download_dir: PathBuf,
    /// The name of the downloaded file, relative to the download directory.
    pub name: PathBuf,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: impl Into<PathBuf>) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.len;
        let piece_len = metainfo.piece_len;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count as u64 - 1);
        let last_piece_len = last_piece_len as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: download_dir.into(),
            name: PathBuf::from(&metainfo.name),
        }
    }

    /// Returns the length of the piece at the given index, or `None` if the
    /// index is out of bounds.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        if index + 1 == self.piece_count {
            Some(self.last_piece_len)
        } else if index < self.piece_count {
            Some(self.piece_len)
        } else {
            None
        }
    }

    /// Returns the byte offset of the piece within the file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the path of the assembled file.
    pub fn output_path(&self) -> PathBuf {
        self.download_dir.join(&self.name)
    }

    /// Returns the path of the hidden directory in which each verified piece
    /// is kept in its own file until the download is finalized.
    pub fn pieces_dir(&self) -> PathBuf {
        let mut dir_name = std::ffi::OsString::from(".");
        dir_name.push(self.name.as_os_str());
        dir_name.push(".pieces");
        self.download_dir.join(dir_name)
    }

    /// Returns the path of the file holding the piece at the given index.
    pub fn piece_path(&self, pieces_dir: &Path, index: PieceIndex) -> PathBuf {
        pieces_dir.join(index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_info(piece_len: u32, download_len: u64) -> StorageInfo {
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let metainfo = Metainfo {
            name: "file.bin".into(),
            info_hash: [0; 20],
            pieces: vec![0; piece_count * 20],
            piece_len,
            len: download_len,
            announce: None,
            announce_list: Vec::new(),
            comment: None,
            creation_date: None,
            created_by: None,
            encoding: None,
            private: false,
            md5sum: None,
        };
        StorageInfo::new(&metainfo, "/tmp/downloads")
    }

    #[test]
    fn test_piece_len() {
        let info = storage_info(32000, 70000);
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.last_piece_len, 6000);
        assert_eq!(info.piece_len(0), Some(32000));
        assert_eq!(info.piece_len(2), Some(6000));
        assert_eq!(info.piece_len(3), None);
        assert_eq!(info.piece_offset(2), 64000);

        // a download that is an exact multiple of the piece length
        let info = storage_info(100, 300);
        assert_eq!(info.last_piece_len, 100);
    }

    #[test]
    fn test_paths() {
        let info = storage_info(100, 300);
        assert_eq!(info.output_path(), PathBuf::from("/tmp/downloads/file.bin"));
        let pieces_dir = info.pieces_dir();
        assert_eq!(pieces_dir, PathBuf::from("/tmp/downloads/.file.bin.pieces"));
        assert_eq!(
            info.piece_path(&pieces_dir, 2),
            PathBuf::from("/tmp/downloads/.file.bin.pieces/2")
        );
    }
}
