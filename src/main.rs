use std::convert::Infallible;
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pretty_bytes::converter::convert;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sat_tftp::tftp::{Endpoint, RetrieverSession, SenderSession, SessionConfig, TransferSummary};

/// Moves one file between a satellite and a ground station, one acknowledged
/// block at a time.
#[derive(Parser, Debug)]
#[command(version)]
struct Opts {
    #[command(subcommand)]
    subcmd: SubCommand,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Serve a file to the first retriever that asks for it (satellite).
    Send(SendArgs),
    /// Request a file and write it to disk (ground station).
    Retrieve(RetrieveArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    /// `ip:port` to bind a UDP socket, or a Unix datagram socket path.
    #[arg(short, long, default_value = "temp/server-socket")]
    bind: Address,
    /// File to serve.
    #[arg(short, long)]
    file: PathBuf,
}

#[derive(Args, Debug)]
struct RetrieveArgs {
    /// `ip:port` to bind a UDP socket, or a Unix datagram socket path.
    #[arg(short, long, default_value = "temp/client-socket")]
    bind: Address,
    /// Where the sender listens, same kind of address as `--bind`.
    #[arg(short, long, default_value = "temp/server-socket")]
    peer: Address,
    /// Where to write the retrieved file.
    #[arg(short, long)]
    output: PathBuf,
    /// Name sent in the request; defaults to the output file name.
    #[arg(long)]
    filename: Option<String>,
    #[arg(long, default_value = "octet")]
    mode: String,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Milliseconds to wait for each ACK or DATA packet.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Milliseconds the sender waits for the request; waits forever if unset.
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,
    /// Re-sends of the last packet allowed per block.
    #[arg(long, global = true, default_value_t = 0)]
    retries: u32,
}

impl SessionArgs {
    fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_request_timeout(self.request_timeout_ms.map(Duration::from_millis))
            .with_retries(self.retries);
        if let Some(ms) = self.timeout_ms {
            config = config.with_timeout(Some(Duration::from_millis(ms)));
        }
        config
    }
}

#[derive(Debug, Clone)]
enum Address {
    Udp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for Address {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Infallible> {
        Ok(match s.parse::<SocketAddr>() {
            Ok(addr) => Address::Udp(addr),
            Err(_) => Address::Unix(PathBuf::from(s)),
        })
    }
}

/// A bound Unix socket file, unlinked when dropped.
struct SocketFile {
    path: PathBuf,
}

impl SocketFile {
    fn bind(path: &Path) -> Result<(UnixDatagram, SocketFile)> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing stale socket {}", path.display()))
            }
        }
        let socket =
            UnixDatagram::bind(path).with_context(|| format!("binding {}", path.display()))?;
        Ok((
            socket,
            SocketFile {
                path: path.to_path_buf(),
            },
        ))
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn bind_udp(addr: &SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr).with_context(|| format!("binding {}", addr))
}

fn report<A: Debug>(verb: &str, summary: &TransferSummary<A>) {
    info!(
        peer = ?summary.peer,
        blocks = summary.blocks,
        "{} [{}]",
        verb,
        convert(summary.bytes as f64)
    );
}

fn serve<E: Endpoint>(endpoint: E, content: &[u8], config: SessionConfig) -> Result<()> {
    let mut session = SenderSession::new(endpoint, content, config);
    let summary = session.run()?;
    report("Sent", &summary);
    Ok(())
}

fn send(args: SendArgs, config: SessionConfig) -> Result<()> {
    let content = fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    info!(
        file = %args.file.display(),
        "serving [{}] on {:?}",
        convert(content.len() as f64),
        args.bind
    );

    match &args.bind {
        Address::Udp(addr) => serve(bind_udp(addr)?, &content, config),
        Address::Unix(path) => {
            let (socket, _file) = SocketFile::bind(path)?;
            serve(socket, &content, config)
        }
    }
}

fn fetch<E: Endpoint>(
    endpoint: E,
    peer: E::Addr,
    output: &Path,
    filename: &str,
    mode: &str,
    config: SessionConfig,
) -> Result<()> {
    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut session = RetrieverSession::new(endpoint, peer, BufWriter::new(file), config);
    let summary = session.retrieve(filename, mode)?;
    let mut sink = session.into_sink();
    sink.flush().context("flushing output")?;
    report("Received", &summary);
    Ok(())
}

fn retrieve(args: RetrieveArgs, config: SessionConfig) -> Result<()> {
    let filename = match &args.filename {
        Some(name) => name.clone(),
        None => match args.output.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => bail!("no file name in {}, pass --filename", args.output.display()),
        },
    };
    info!(
        filename = %filename,
        output = %args.output.display(),
        "requesting from {:?}",
        args.peer
    );

    // The output file is only created once the socket is bound.
    match (&args.bind, &args.peer) {
        (Address::Udp(bind), Address::Udp(peer)) => {
            let socket = bind_udp(bind)?;
            fetch(socket, *peer, &args.output, &filename, &args.mode, config)
        }
        (Address::Unix(bind), Address::Unix(peer)) => {
            let (socket, _file) = SocketFile::bind(bind)?;
            fetch(socket, peer.clone(), &args.output, &filename, &args.mode, config)
        }
        _ => bail!("--bind and --peer must both be UDP addresses or both socket paths"),
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();
    let config = opts.session.config();
    match opts.subcmd {
        SubCommand::Send(args) => send(args, config),
        SubCommand::Retrieve(args) => retrieve(args, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_kind_follows_syntax() {
        assert!(matches!("127.0.0.1:69".parse::<Address>().unwrap(), Address::Udp(_)));
        match "temp/server-socket".parse::<Address>().unwrap() {
            Address::Unix(path) => assert_eq!(path, PathBuf::from("temp/server-socket")),
            other => panic!("Expected a socket path, got {:?}", other),
        }
    }

    #[test]
    fn mixed_addresses_leave_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("image.bmp");
        fs::write(&output, b"previous").unwrap();

        let args = RetrieveArgs {
            bind: "127.0.0.1:0".parse().unwrap(),
            peer: Address::Unix(dir.path().join("server-socket")),
            output: output.clone(),
            filename: None,
            mode: "octet".to_string(),
        };
        assert!(retrieve(args, SessionConfig::default()).is_err());
        assert_eq!(fs::read(&output).unwrap(), b"previous");
    }

    #[test]
    fn socket_file_is_replaced_and_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp").join("client-socket");
        {
            let (_stale, _file) = SocketFile::bind(&path).unwrap();
        }
        assert!(!path.exists());

        fs::write(&path, b"").unwrap();
        let (_socket, file) = SocketFile::bind(&path).unwrap();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
