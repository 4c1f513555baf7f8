use std::{fs, net::SocketAddr, path::PathBuf, str::FromStr};

use flexi_logger::FileSpec;
use piecemeal::prelude::*;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};

mod command;
mod progress;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(StructOpt, Debug)]
pub struct Args {
    /// Whether to 'seed' or 'download' the torrent.
    #[structopt(long, default_value = "download")]
    mode: ModeArg,

    /// The path of the folder where to download file.
    #[structopt(short, long)]
    download_dir: PathBuf,

    /// The path to the torrent metainfo file.
    #[structopt(short, long)]
    metainfo: PathBuf,

    /// A comma separated list of <ip>:<port> pairs of the seeds. If not
    /// given, the peers are requested from the torrent's trackers.
    #[structopt(short, long, use_delimiter = true)]
    seeds: Vec<SocketAddr>,

    /// The socket address on which to listen for new connections.
    #[structopt(short, long)]
    listen: Option<SocketAddr>,

    /// The complete file to seed from, required in seed mode.
    #[structopt(long)]
    source: Option<PathBuf>,

    /// The folder in which the log file is written.
    #[structopt(long, default_value = "/tmp/piecemeal")]
    log_dir: PathBuf,

    #[structopt(short, long)]
    quit_after_complete: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ModeArg {
    Download,
    Seed,
}

impl FromStr for ModeArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "seed" => Ok(Self::Seed),
            _ => Err(format!("invalid mode '{}', expected download or seed", s)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();

    // the progress line owns stdout, so logs go to a file
    let _logger = flexi_logger::Logger::try_with_env()?
        .log_to_file(FileSpec::default().directory(&args.log_dir))
        .start()?;

    let metainfo = fs::read(&args.metainfo)?;
    let metainfo = Metainfo::from_bytes(&metainfo)?;
    log::info!(
        "Read metainfo of {} (info hash {})",
        metainfo.name,
        hex::encode(metainfo.info_hash)
    );

    let mode = match args.mode {
        ModeArg::Download => Mode::Download {
            seeds: args.seeds.clone(),
        },
        ModeArg::Seed => match &args.source {
            Some(source) => Mode::Seed {
                source: source.clone(),
            },
            None => return Err("seed mode requires --source".into()),
        },
    };

    let conf = Conf::new(args.download_dir.clone());
    let (engine, mut alerts) = engine::start(
        conf,
        TorrentParams {
            metainfo: metainfo.clone(),
            mode,
            listen_addr: args.listen,
        },
    )
    .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = progress::Printer::default();
    loop {
        tokio::select! {
            alert = alerts.recv() => match alert {
                Some(Alert::Progress(stats)) => printer.print(&stats),
                Some(Alert::TorrentComplete(path)) => {
                    println!("\nDownload complete: {}", path.display());
                    if args.quit_after_complete {
                        break;
                    }
                }
                Some(Alert::Error(e)) => eprintln!("\nError: {}", e),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => command::run(&line, &metainfo, &engine).await,
                // stdin closed
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await?;

    Ok(())
}
