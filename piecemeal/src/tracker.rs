//! The HTTP tracker client, used once at startup to find peers when none are
//! given explicitly.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::de;

use crate::{error::BencodeError, PeerId, Sha1Hash};

pub use reqwest::Error as HttpError;
pub use url::ParseError as UrlError;

pub(crate) type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// The possible errors that may occur when contacting the tracker.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    /// Holds bencode serialization or deserialization related errors.
    Bencode(BencodeError),
    /// HTTP related errors when contacting the tracker.
    Http(HttpError),
    /// The tracker URL in the metainfo is not a valid URL.
    InvalidUrl(UrlError),
    /// The tracker rejected the announce with the given reason.
    Failure(String),
}

impl From<BencodeError> for TrackerError {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<HttpError> for TrackerError {
    fn from(e: HttpError) -> Self {
        Self::Http(e)
    }
}

impl From<UrlError> for TrackerError {
    fn from(e: UrlError) -> Self {
        Self::InvalidUrl(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Bencode(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::InvalidUrl(e) => write!(f, "invalid tracker url: {}", e),
            Self::Failure(reason) => write!(f, "announce failed: {}", reason),
        }
    }
}

impl std::error::Error for TrackerError {}

/// Parameters for announcing to a tracker.
#[derive(Clone, Debug)]
pub(crate) struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    /// The port we announce as the one we listen on.
    pub port: u16,
    /// Number of bytes uploaded so far.
    pub uploaded: u64,
    /// Number of bytes downloaded so far.
    pub downloaded: u64,
    /// Number of bytes left to download.
    pub left: u64,
    pub event: Option<Event>,
}

/// The announce event. We only ever announce once, when starting the
/// download.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Event {
    Started,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
        }
    }
}

/// The tracker announce response.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub(crate) struct Response {
    /// If set, no other fields in the response are valid: it contains
    /// a human-readable message as to why the announce was rejected.
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Similar to the failure reason, but the response is still processed.
    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,

    /// How long the tracker would like us to wait before announcing again.
    #[serde(default, deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    #[serde(default, rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(default, rename = "incomplete")]
    pub leecher_count: Option<usize>,

    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// An HTTP tracker of a torrent.
pub(crate) struct Tracker {
    client: Client,
    url: Url,
}

impl Tracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Parses the tracker URL from the metainfo.
    pub fn from_url_str(url: &str) -> Result<Self> {
        Ok(Self::new(url.parse()?))
    }

    /// Announces ourselves to the tracker and returns the peers it gave us.
    ///
    /// A response with a failure reason is returned as an error.
    pub async fn announce(&self, params: Announce) -> Result<Vec<SocketAddr>> {
        log::info!("Announcing to tracker {}", self);
        let resp = self.send_announce(&params).await?;
        if let Some(reason) = resp.failure_reason {
            log::warn!("Tracker {} rejected announce: {}", self, reason);
            return Err(TrackerError::Failure(reason));
        }
        if let Some(warning) = &resp.warning_message {
            log::warn!("Tracker {} warning: {}", self, warning);
        }
        log::info!(
            "Tracker {} returned {} peer(s) (seeds: {:?}, leeches: {:?}, \
            interval: {:?})",
            self,
            resp.peers.len(),
            resp.seeder_count,
            resp.leecher_count,
            resp.interval,
        );
        Ok(resp.peers)
    }

    async fn send_announce(&self, params: &Announce) -> Result<Response> {
        let mut query = vec![
            ("port", params.port.to_string()),
            ("uploaded", params.uploaded.to_string()),
            ("downloaded", params.downloaded.to_string()),
            ("left", params.left.to_string()),
            // each peer in a compact response is only 6 bytes, and many
            // trackers only send compact lists anyway
            ("compact", "1".to_string()),
        ];
        if let Some(event) = params.event {
            query.push(("event", event.as_str().to_string()));
        }

        // the info hash and peer id are raw bytes which reqwest's query
        // serializer can't encode, so they are percent encoded here and baked
        // into the url, which reqwest then leaves alone
        let url = format!(
            "{url}?info_hash={info_hash}&peer_id={peer_id}",
            url = self.url,
            info_hash = percent_encoding::percent_encode(
                &params.info_hash,
                URL_ENCODE_RESERVED
            ),
            peer_id = percent_encoding::percent_encode(
                &params.peer_id,
                URL_ENCODE_RESERVED
            ),
        );

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(serde_bencode::from_bytes(&resp)?)
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.url)
    }
}

/// Deserializes the peer list of a response, which is either a compact byte
/// string of 6 byte entries or a list of dicts. The peer ids of the latter
/// are discarded.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct Visitor;

    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or list of dicts representing peers")
        }

        /// Each compact entry is a 4 byte IPv4 address followed by a 2 byte
        /// port, both in network byte order.
        fn visit_bytes<E>(self, b: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            if b.len() % ENTRY_LEN != 0 {
                return Err(E::custom(
                    "peers compact string must be a multiple of 6",
                ));
            }
            Ok(b.chunks_exact(ENTRY_LEN)
                .map(|entry| {
                    let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
                    let port = u16::from_be_bytes([entry[4], entry[5]]);
                    SocketAddr::new(IpAddr::V4(ip), port)
                })
                .collect())
        }

        fn visit_seq<A>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Debug, Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                // hostnames are not resolved
                match ip.parse() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, port)),
                    Err(_) => log::debug!("Skipping peer with address {}", ip),
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let secs: Option<u64> = de::Deserialize::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

/// The unreserved characters of RFC 3986 are left as is, everything else is
/// percent encoded.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');
