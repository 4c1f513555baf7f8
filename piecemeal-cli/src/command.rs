//! The commands the operator may type on stdin while the torrent runs.

use std::{fmt::Write, net::SocketAddr, str::FromStr};

use piecemeal::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Command {
    Metadata,
    Trackers,
    Peers,
    Pieces,
    Free,
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "metadata" => Ok(Self::Metadata),
            "trackers" => Ok(Self::Trackers),
            "peers" => Ok(Self::Peers),
            "pieces" => Ok(Self::Pieces),
            "free" => Ok(Self::Free),
            _ => Err(()),
        }
    }
}

/// Executes the command on the line and prints its output.
pub async fn run(line: &str, metainfo: &Metainfo, engine: &EngineHandle) {
    log::debug!("Operator command: {:?}", line);
    let output = match line.parse() {
        Ok(Command::Metadata) => metadata(metainfo),
        Ok(Command::Trackers) => trackers(metainfo),
        Ok(Command::Peers) => peers(&engine.peers().await),
        Ok(Command::Pieces) => pieces(&engine.pieces().await),
        Ok(Command::Free) => {
            engine.free().await;
            "Released all pieces in progress.\n".to_string()
        }
        Err(()) => format!(
            "Got invalid command: {}\n\
            Please enter one of the following: metadata, trackers, peers, \
            pieces, free\n",
            line.trim()
        ),
    };
    // start below the progress line
    print!("\n{}", output);
}

fn metadata(metainfo: &Metainfo) -> String {
    let mut out = String::from("Torrent Metadata:\n");
    let mut field = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            let _ = writeln!(out, "\t{} = {}", key, value);
        }
    };
    field("announce", metainfo.announce.clone());
    if !metainfo.announce_list.is_empty() {
        field("announce_list", Some(format!("{:?}", metainfo.announce_list)));
    }
    field("creation date", metainfo.creation_date.map(|d| d.to_string()));
    field("comment", metainfo.comment.clone());
    field("created by", metainfo.created_by.clone());
    field("encoding", metainfo.encoding.clone());

    out.push_str("\tinfo =\n");
    let _ = writeln!(out, "\t\tpiece length = {}", metainfo.piece_len);
    let _ = writeln!(
        out,
        "\t\tpieces = {} total\n\t\t(Use command 'pieces' to view individual \
        piece hashes.)",
        metainfo.piece_count()
    );
    let _ = writeln!(out, "\t\tprivate = {}", metainfo.private);
    let _ = writeln!(out, "\t\tname = {}", metainfo.name);
    let _ = writeln!(out, "\t\tlength = {}", metainfo.len);
    if let Some(md5sum) = &metainfo.md5sum {
        let _ = writeln!(out, "\t\tmd5sum = {}", md5sum);
    }
    out
}

fn trackers(metainfo: &Metainfo) -> String {
    let mut out = String::from("Trackers:\n");
    if !metainfo.announce_list.is_empty() {
        for (i, tier) in metainfo.announce_list.iter().enumerate() {
            let _ = writeln!(out, "\tTier {}: {}", i + 1, tier.join(", "));
        }
    } else if let Some(announce) = &metainfo.announce {
        let _ = writeln!(out, "\t{}", announce);
    }
    out
}

fn peers(peers: &[(SocketAddr, Role)]) -> String {
    if peers.is_empty() {
        return "No current peers.\n".to_string();
    }
    let mut out = String::from("Current Peers:\n");
    for (addr, role) in peers {
        let _ = writeln!(out, "\t{} ({})", addr, role);
    }
    out
}

fn pieces(pieces: &[PieceInfo]) -> String {
    let mut out = String::new();
    for piece in pieces {
        let _ = writeln!(
            out,
            "Piece {} (Current State: {:?})\n\tHash: {}",
            piece.index,
            piece.state,
            hex::encode(piece.hash)
        );
    }
    out
}
