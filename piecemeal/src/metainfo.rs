use std::path::{Component, Path};

use crate::{error::*, Sha1Hash};

/// The parsed and validated torrent metainfo file, containing necessary
/// arguments for starting a torrent.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the torrent, which is used as the name of the downloaded
    /// file.
    pub name: String,
    /// This hash is used to identify a torrent with trackers and peers.
    pub info_hash: Sha1Hash,
    /// The concatenation of the 20 byte SHA-1 hash of each piece in torrent.
    /// This is used to verify the data sent to us by peers.
    pub pieces: Vec<u8>,
    /// The nominal lenght of a piece, that is, the length of all but
    /// potentially the last piece, which may be smaller.
    pub piece_len: u32,
    /// The length of the downloaded file, in bytes.
    pub len: u64,
    /// The URL of the tracker.
    pub announce: Option<String>,
    /// Tiers of tracker URLs, if the torrent has more than one tracker.
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    /// The creation time of the torrent, in seconds since the UNIX epoch.
    pub creation_date: Option<i64>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    /// Whether peers may only be obtained from the trackers in the metainfo.
    pub private: bool,
    /// The hex encoded MD5 sum of the file, not used by BitTorrent itself.
    pub md5sum: Option<String>,
}

impl Metainfo {
    /// Parses from a byte buffer a new [`Metainfo`] instance, or aborts with an
    /// error.
    ///
    /// If the encoding itself is correct, the constructor may still fail if the
    /// metadata is not semantically correct (e.g. if the length of the `pieces`
    /// field is not a multiple of 20, or the torrent has multiple files).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        // parse metainfo, but correctly parsing is not enough, we need to
        // verify it afterwards
        let metainfo: raw::Metainfo = serde_bencode::from_bytes(buf)?;

        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a multiple of 20
        if metainfo.info.pieces.len() % 20 != 0 {
            log::warn!(
                "Metainfo pieces field length {} is not a multiple of 20",
                metainfo.info.pieces.len()
            );
            return Err(Error::InvalidPieces);
        }

        // the name becomes the file name in the download directory, so it
        // must not point elsewhere
        if !is_plain_file_name(&metainfo.info.name) {
            log::warn!("Metainfo has invalid name {:?}", metainfo.info.name);
            return Err(Error::InvalidMetainfo);
        }

        if metainfo.info.files.is_some() {
            log::warn!("Metainfo describes a multi-file torrent");
            return Err(Error::MultiFileUnsupported);
        }
        let len = match metainfo.info.len {
            Some(len) => len,
            None => {
                log::warn!("No `length` key present in metainfo");
                return Err(Error::InvalidMetainfo);
            }
        };

        if metainfo.info.piece_len == 0 || metainfo.info.pieces.is_empty() {
            log::warn!("Metainfo has no pieces");
            return Err(Error::InvalidMetainfo);
        }
        // the pieces must cover exactly the whole file
        let piece_count = metainfo.info.pieces.len() as u64 / 20;
        let expected_piece_count =
            (len + metainfo.info.piece_len as u64 - 1) / metainfo.info.piece_len as u64;
        if piece_count != expected_piece_count {
            log::warn!(
                "Metainfo has {} pieces but file length {} requires {}",
                piece_count,
                len,
                expected_piece_count
            );
            return Err(Error::InvalidPieces);
        }

        // create info hash as a last step
        let info_hash = metainfo.create_info_hash()?;

        let raw::Metainfo {
            info,
            announce,
            announce_list,
            comment,
            creation_date,
            created_by,
            encoding,
        } = metainfo;

        Ok(Self {
            name: info.name,
            info_hash,
            pieces: info.pieces,
            piece_len: info.piece_len,
            len,
            announce,
            announce_list: announce_list.unwrap_or_default(),
            comment,
            creation_date,
            created_by,
            encoding,
            private: info.private == Some(1),
            md5sum: info.md5sum,
        })
    }

    /// Returns the number of pieces in this torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected hash of the piece at the given index.
    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let pos = index * 20;
        self.pieces.get(pos..pos + 20)
    }

    /// Returns the tracker tiers of the torrent: the announce list if present,
    /// otherwise a single tier with the announce URL.
    pub fn trackers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            self.announce_list.clone()
        } else if let Some(announce) = &self.announce {
            vec![vec![announce.clone()]]
        } else {
            Vec::new()
        }
    }
}

/// Returns whether the name is a single path component that is neither the
/// current nor the parent directory.
fn is_plain_file_name(name: &str) -> bool {
    if name.contains(|c: char| c == '/' || c == '\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Contains the types that we directly deserialize into, but is not to be used
/// by the rest of the crate, as the validity of the parsed structure is not
/// ensured at this level. The semantic validation happens in the [`Metainfo`]
/// type, which is essentially a mapping of [`raw::Metainfo`], but with semantic
/// requirements encoded in the type system..
mod raw {
    use sha1::{Digest, Sha1};

    use super::{Result, Sha1Hash};

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Metainfo {
        pub info: Info,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub announce: Option<String>,
        #[serde(
            default,
            rename = "announce-list",
            skip_serializing_if = "Option::is_none"
        )]
        pub announce_list: Option<Vec<Vec<String>>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub comment: Option<String>,
        #[serde(
            default,
            rename = "creation date",
            skip_serializing_if = "Option::is_none"
        )]
        pub creation_date: Option<i64>,
        #[serde(
            default,
            rename = "created by",
            skip_serializing_if = "Option::is_none"
        )]
        pub created_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub encoding: Option<String>,
    }

    impl Metainfo {
        /// Creates a SHA-1 hash of the encoded `info` field's value.
        pub fn create_info_hash(&self) -> Result<Sha1Hash> {
            let info = serde_bencode::to_bytes(&self.info)?;
            let digest = Sha1::digest(&info);
            let mut info_hash = [0; 20];
            info_hash.copy_from_slice(&digest);
            Ok(info_hash)
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct Info {
        pub name: String,
        #[serde(with = "serde_bytes")]
        pub pieces: Vec<u8>,
        #[serde(rename = "piece length")]
        pub piece_len: u32,
        #[serde(
            default,
            rename = "length",
            skip_serializing_if = "Option::is_none"
        )]
        pub len: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub files: Option<Vec<File>>,
        /// These are not used for downloading but need to be kept in here so
        /// that we can encode back a valid info hash for hashing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub private: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub md5sum: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    pub struct File {
        pub path: Vec<String>,
        #[serde(rename = "length")]
        pub len: u64,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};

    use super::*;

    fn single_file_info(pieces: Vec<u8>, piece_len: u32, len: u64) -> raw::Info {
        raw::Info {
            name: "bunny.mp4".into(),
            pieces,
            piece_len,
            len: Some(len),
            files: None,
            private: None,
            md5sum: None,
        }
    }

    fn bare_metainfo(info: raw::Info) -> raw::Metainfo {
        raw::Metainfo {
            info,
            announce: None,
            announce_list: None,
            comment: None,
            creation_date: None,
            created_by: None,
            encoding: None,
        }
    }

    /// Encodes a single file torrent metainfo with the given contents and
    /// returns its bencoded form.
    pub(crate) fn make_metainfo_bytes(
        name: &str,
        piece_len: u32,
        data: &[u8],
        announce: Option<&str>,
    ) -> Vec<u8> {
        let pieces = data
            .chunks(piece_len as usize)
            .flat_map(|piece| Sha1::digest(piece).to_vec())
            .collect();
        let mut info = single_file_info(pieces, piece_len, data.len() as u64);
        info.name = name.into();
        let mut metainfo = bare_metainfo(info);
        metainfo.announce = announce.map(String::from);
        serde_bencode::to_bytes(&metainfo).unwrap()
    }

    #[test]
    fn test_parse_single_file() {
        let mut info = single_file_info(vec![7; 40], 32000, 64000);
        info.private = Some(1);
        info.md5sum = Some("d41d8cd98f00b204e9800998ecf8427e".into());
        let expected_info_hash = {
            let encoded = serde_bencode::to_bytes(&info).unwrap();
            let mut hash = [0; 20];
            hash.copy_from_slice(&Sha1::digest(&encoded));
            hash
        };
        let mut metainfo = bare_metainfo(info);
        metainfo.announce = Some("http://tracker.example.com/announce".into());
        metainfo.comment = Some("test torrent".into());
        metainfo.creation_date = Some(1_600_000_000);
        metainfo.created_by = Some("mktorrent".into());
        let buf = serde_bencode::to_bytes(&metainfo).unwrap();

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.name, "bunny.mp4");
        assert_eq!(metainfo.piece_len, 32000);
        assert_eq!(metainfo.len, 64000);
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(1), Some(&[7; 20][..]));
        assert_eq!(metainfo.piece_hash(2), None);
        assert_eq!(metainfo.info_hash, expected_info_hash);
        assert!(metainfo.private);
        assert_eq!(
            metainfo.md5sum.as_deref(),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );
        assert_eq!(metainfo.comment.as_deref(), Some("test torrent"));
        assert_eq!(metainfo.creation_date, Some(1_600_000_000));
        assert_eq!(metainfo.created_by.as_deref(), Some("mktorrent"));
        assert_eq!(metainfo.encoding, None);
        assert_eq!(
            metainfo.trackers(),
            vec![vec!["http://tracker.example.com/announce".to_string()]]
        );
    }

    #[test]
    fn test_announce_list_takes_precedence() {
        let info = single_file_info(vec![0; 20], 100, 50);
        let mut metainfo = bare_metainfo(info);
        metainfo.announce = Some("http://a/announce".into());
        metainfo.announce_list = Some(vec![
            vec!["http://a/announce".into(), "http://b/announce".into()],
            vec!["http://c/announce".into()],
        ]);
        let buf = serde_bencode::to_bytes(&metainfo).unwrap();

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.trackers().len(), 2);
        assert_eq!(metainfo.trackers()[0][1], "http://b/announce");
    }

    #[test]
    fn test_reject_invalid_pieces_len() {
        let info = single_file_info(vec![0; 30], 100, 150);
        let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidPieces)
        ));
    }

    #[test]
    fn test_reject_piece_count_mismatch() {
        // 3 pieces of 100 bytes are needed for 250 bytes
        let info = single_file_info(vec![0; 40], 100, 250);
        let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidPieces)
        ));
    }

    #[test]
    fn test_reject_multi_file() {
        let mut info = single_file_info(vec![0; 20], 100, 50);
        info.len = None;
        info.files = Some(vec![raw::File {
            path: vec!["dir".into(), "file".into()],
            len: 50,
        }]);
        let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::MultiFileUnsupported)
        ));
    }

    #[test]
    fn test_reject_missing_len() {
        let mut info = single_file_info(vec![0; 20], 100, 50);
        info.len = None;
        let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo)
        ));
    }

    #[test]
    fn test_reject_name_outside_download_dir() {
        for name in ["../escape.bin", "dir/file.bin", "..", ".", "", "a\\b"] {
            let mut info = single_file_info(vec![0; 20], 100, 50);
            info.name = name.into();
            let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
            assert!(
                matches!(Metainfo::from_bytes(&buf), Err(Error::InvalidMetainfo)),
                "name {:?} was accepted",
                name
            );
        }

        let mut info = single_file_info(vec![0; 20], 100, 50);
        info.name = "..hidden.bin".into();
        let buf = serde_bencode::to_bytes(&bare_metainfo(info)).unwrap();
        assert_eq!(Metainfo::from_bytes(&buf).unwrap().name, "..hidden.bin");
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            Metainfo::from_bytes(b"not bencode"),
            Err(Error::Bencode(_))
        ));
    }
}
