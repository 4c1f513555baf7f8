pub mod stats;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task, time,
};

use crate::{
    alert::{Alert, AlertSender},
    conf::TorrentConf,
    disk,
    error::*,
    peer::PeerSession,
    scheduler::Scheduler,
};

/// How long a session may take to stop once it is told to shut down, after
/// which its task is aborted.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The channel on which the engine can send a command to the torrent task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands the torrent task can receive.
#[derive(Debug)]
pub(crate) enum Command {
    /// Shut down all sessions and the disk task, then stop the torrent.
    Shutdown,
}

/// The torrent task: spawns the peer sessions, accepts inbound connections,
/// reports progress, watches for stalls and reacts to disk events.
pub(crate) struct Torrent {
    scheduler: Arc<Scheduler>,
    conf: TorrentConf,
    /// The peers we download from. A session is started for each of them
    /// when the torrent starts.
    seeds: Vec<SocketAddr>,
    /// If set, peers that connect to us are served from this listener.
    listener: Option<TcpListener>,
    /// The running session tasks.
    sessions: Vec<task::JoinHandle<()>>,
    disk_join_handle: Option<task::JoinHandle<disk::Result<()>>>,
    disk_alert_port: disk::AlertReceiver,
    /// Alerts to the user of the engine are sent here.
    alert_chan: AlertSender,
    cmd_port: Receiver,
}

/// The parameters of a new torrent task.
pub(crate) struct Params {
    pub scheduler: Arc<Scheduler>,
    pub conf: TorrentConf,
    pub seeds: Vec<SocketAddr>,
    pub listener: Option<TcpListener>,
    pub disk_join_handle: task::JoinHandle<disk::Result<()>>,
    pub disk_alert_port: disk::AlertReceiver,
    pub alert_chan: AlertSender,
}

impl Torrent {
    pub fn new(params: Params) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                scheduler: params.scheduler,
                conf: params.conf,
                seeds: params.seeds,
                listener: params.listener,
                sessions: Vec::new(),
                disk_join_handle: Some(params.disk_join_handle),
                disk_alert_port: params.disk_alert_port,
                alert_chan: params.alert_chan,
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Starts the torrent and runs it until it is shut down.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent");
        for addr in self.seeds.clone() {
            self.spawn_outbound(addr);
        }
        let result = self.run().await;
        self.shutdown().await;
        result
    }

    async fn run(&mut self) -> Result<()> {
        let mut tick_timer = time::interval(self.conf.tick_interval);
        loop {
            tokio::select! {
                _ = tick_timer.tick() => self.tick().await?,
                conn = accept(&self.listener) => match conn {
                    Ok((socket, addr)) => self.spawn_inbound(socket, addr),
                    Err(e) => log::warn!("Error accepting connection: {}", e),
                },
                Some(alert) = self.disk_alert_port.recv() => {
                    self.handle_disk_alert(alert).await?;
                }
                cmd = self.cmd_port.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        log::info!("Shutting down torrent");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Reports progress and releases pieces if the download stalled.
    async fn tick(&mut self) -> Result<()> {
        self.sessions.retain(|handle| !handle.is_finished());

        let progress = self.scheduler.progress().await;
        log::debug!(
            "Progress: {:.1}%, {} peer(s)",
            progress.fraction * 100.0,
            progress.peer_count
        );
        self.alert_chan.send(Alert::Progress(progress))?;

        if !self.scheduler.is_complete().await {
            self.scheduler
                .stall_check(progress.fraction, Instant::now())
                .await;
        }
        Ok(())
    }

    async fn handle_disk_alert(&mut self, alert: disk::Alert) -> Result<()> {
        match alert {
            disk::Alert::WriteFailed { index, error } => {
                log::warn!("Failed to save piece {}: {}", index, error);
                self.scheduler.lost_piece(index).await;
            }
            disk::Alert::Finalized(Ok(path)) => {
                log::info!("Torrent complete, saved to {:?}", path);
                self.alert_chan.send(Alert::TorrentComplete(path))?;
            }
            disk::Alert::Finalized(Err(e)) => {
                log::error!("Failed to assemble download: {}", e);
                self.alert_chan.send(Alert::Error(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn spawn_outbound(&mut self, addr: SocketAddr) {
        let mut session =
            PeerSession::outbound(Arc::clone(&self.scheduler), addr, &self.conf);
        self.sessions.push(task::spawn(async move {
            if let Err(e) = session.start_outbound().await {
                log::warn!("Session with {} ended with error: {}", addr, e);
            }
        }));
    }

    fn spawn_inbound(&mut self, socket: TcpStream, addr: SocketAddr) {
        log::info!("Peer {} connected", addr);
        let mut session =
            PeerSession::inbound(Arc::clone(&self.scheduler), addr, &self.conf);
        self.sessions.push(task::spawn(async move {
            if let Err(e) = session.start_inbound(socket).await {
                log::warn!("Session with {} ended with error: {}", addr, e);
            }
        }));
    }

    /// Stops all sessions, then the disk task.
    async fn shutdown(&mut self) {
        self.scheduler.shutdown_all().await;
        for mut handle in self.sessions.drain(..) {
            // sessions that are still connecting can't be told to stop
            if time::timeout(SESSION_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        if let Err(e) = self.scheduler.disk().shutdown() {
            log::warn!("Disk task already stopped: {}", e);
        }
        if let Some(handle) = self.disk_join_handle.take() {
            match handle.await {
                Ok(Ok(())) => log::info!("Disk task stopped"),
                Ok(Err(e)) => log::error!("Disk task error: {}", e),
                Err(e) => log::error!("Disk task panicked: {}", e),
            }
        }
    }
}

/// Accepts the next connection on the listener, or never resolves if there is
/// no listener.
async fn accept(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => futures::future::pending().await,
    }
}
