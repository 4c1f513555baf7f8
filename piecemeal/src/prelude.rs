//! This module exports types commonly used by applications as a convenience.

pub use crate::{
    alert::{Alert, AlertReceiver},
    conf::Conf,
    engine::{self, EngineHandle, Mode, PieceInfo, TorrentParams},
    error::Error,
    metainfo::Metainfo,
    PieceState, Progress, Role,
};
