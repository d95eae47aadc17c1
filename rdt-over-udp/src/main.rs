//! Entry point for `rdt-over-udp`.
//!
//! `demo` runs a sender/receiver pair of the chosen protocol in-process over
//! loopback and prints both sides' statistics.  `server` and `client` run
//! the connection protocol across two processes.  All protocol work is
//! delegated to the library; `main.rs` owns only process setup (logging,
//! argument parsing, reporting).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::oneshot;

use rdt_over_udp::arq_endpoint::{ArqReceiver, ArqSender};
use rdt_over_udp::arq_sender::{ArqError, Variant};
use rdt_over_udp::config::{ArqConfig, ConnConfig, GbnConfig, RtoConfig};
use rdt_over_udp::connection::{Connection, Endpoint};
use rdt_over_udp::gbn_endpoint::{GbnSession, GbnSink};
use rdt_over_udp::simulator::{Channel, ChannelConfig, Simulator};
use rdt_over_udp::socket::Socket;
use rdt_over_udp::stats::{Metrics, StatsSnapshot};

/// Reliable data transfer over an unreliable UDP channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a sender and a receiver in this process over loopback.
    Demo {
        #[arg(short, long, value_enum, default_value_t = Protocol::Rdt30)]
        protocol: Protocol,
        /// Number of messages to transfer.
        #[arg(short = 'n', long, default_value_t = 10)]
        messages: usize,
        /// Go-Back-N window size.
        #[arg(short, long, default_value_t = 5)]
        window: usize,
        /// Retransmission timeout (initial RTO for `tcp`), in milliseconds.
        #[arg(short, long, default_value_t = 2000)]
        timeout_ms: u64,
        #[command(flatten)]
        channel: ChannelArgs,
    },
    /// Accept one connection and read until the peer closes.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Write the received bytes here.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        channel: ChannelArgs,
    },
    /// Connect to a server, send a file (or generated bytes) and close.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// File to send; without it `--bytes` generated bytes are sent.
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 10_240)]
        bytes: usize,
        #[command(flatten)]
        channel: ChannelArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    /// Stop-and-wait without sequence numbers.
    Rdt20,
    /// Stop-and-wait with an alternating bit.
    Rdt21,
    /// Alternating bit plus retransmission timer.
    Rdt30,
    /// Go-Back-N sliding window.
    Gbn,
    /// Simplified TCP connection.
    Tcp,
}

/// Faults applied to every outgoing datagram.
#[derive(Args)]
struct ChannelArgs {
    /// Probability of dropping a datagram.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Probability of corrupting a datagram.
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,
    /// Minimum delivery delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_min_ms: u64,
    /// Maximum delivery delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_max_ms: u64,
    /// Seed for a reproducible channel.
    #[arg(long)]
    seed: Option<u64>,
}

impl ChannelArgs {
    fn build(&self) -> anyhow::Result<Arc<dyn Channel>> {
        let config = ChannelConfig {
            loss_rate: self.loss,
            corrupt_rate: self.corrupt,
            delay_range: (
                Duration::from_millis(self.delay_min_ms),
                Duration::from_millis(self.delay_max_ms),
            ),
            seed: self.seed,
        };
        Ok(Arc::new(Simulator::new(config)?))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Demo {
            protocol,
            messages,
            window,
            timeout_ms,
            channel,
        } => {
            let payloads: Vec<Vec<u8>> = (0..messages)
                .map(|i| format!("message {i}").into_bytes())
                .collect();
            let timeout = Duration::from_millis(timeout_ms);
            let channel = channel.build()?;
            match protocol {
                Protocol::Rdt20 => demo_arq(Variant::NoSequence, &payloads, timeout, channel).await,
                Protocol::Rdt21 => {
                    demo_arq(Variant::AlternatingBit, &payloads, timeout, channel).await
                }
                Protocol::Rdt30 => demo_arq(Variant::Timed, &payloads, timeout, channel).await,
                Protocol::Gbn => demo_gbn(window, &payloads, timeout, channel).await,
                Protocol::Tcp => demo_tcp(&payloads, timeout, channel).await,
            }
        }
        Mode::Server {
            bind,
            output,
            channel,
        } => {
            log::info!("Starting server on {bind}");
            let endpoint = Endpoint::bind_with(bind, ConnConfig::default(), channel.build()?)
                .await?
                .with_metrics(Metrics::new("server"));
            let conn = endpoint.listen().accept().await?;
            log::info!("Accepted connection from {:?}", conn.peer_addr());
            let data = read_to_eof(&conn).await?;
            conn.close().await?;
            println!("received {} bytes", data.len());
            if let Some(path) = output {
                std::fs::write(&path, &data)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            println!("{}", conn.stats());
            Ok(())
        }
        Mode::Client {
            server,
            bind,
            file,
            bytes,
            channel,
        } => {
            log::info!("Starting client, connecting to {server}");
            let data = match file {
                Some(path) => {
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?
                }
                None => (0..bytes).map(|i| (i % 251) as u8).collect(),
            };
            let conn = Endpoint::bind_with(bind, ConnConfig::default(), channel.build()?)
                .await?
                .with_metrics(Metrics::new("client"))
                .connect(server)
                .await?;
            conn.send(&data).await?;
            conn.close().await?;
            println!("sent {} bytes", data.len());
            println!("{}", conn.stats());
            Ok(())
        }
    }
}

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn report(payloads: &[Vec<u8>], delivered: &[Vec<u8>], sender: StatsSnapshot, receiver: StatsSnapshot) {
    let intact = delivered == payloads;
    println!(
        "delivered {} of {} messages ({})",
        delivered.len(),
        payloads.len(),
        if intact { "intact, in order" } else { "MISMATCH" }
    );
    println!("{sender}");
    println!("{receiver}");
}

async fn demo_arq(
    variant: Variant,
    payloads: &[Vec<u8>],
    timeout: Duration,
    channel: Arc<dyn Channel>,
) -> anyhow::Result<()> {
    let config = ArqConfig {
        variant,
        retransmit_timeout: timeout,
        ..ArqConfig::default()
    };
    let rx_socket = Socket::bind_with(loopback(), Arc::clone(&channel)).await?;
    let tx_socket = Socket::bind_with(loopback(), channel).await?;
    let mut receiver = ArqReceiver::new(rx_socket, &config, Metrics::new("receiver"))?;
    let mut sender = ArqSender::new(
        tx_socket,
        receiver.local_addr(),
        config,
        Metrics::new(format!("{variant} sender")),
    )?;

    let (stop, mut stopped) = oneshot::channel::<()>();
    let receiving = tokio::spawn(async move {
        let mut delivered = Vec::new();
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                got = receiver.recv(Duration::from_secs(1)) => {
                    if let Some(payload) = got? {
                        delivered.push(payload);
                    }
                }
            }
        }
        Ok::<_, ArqError>((delivered, receiver.stats()))
    });

    for payload in payloads {
        sender.send(payload).await?;
    }
    let _ = stop.send(());
    let (delivered, receiver_stats) = receiving.await??;
    report(payloads, &delivered, sender.stats(), receiver_stats);
    Ok(())
}

async fn demo_gbn(
    window_size: usize,
    payloads: &[Vec<u8>],
    timeout: Duration,
    channel: Arc<dyn Channel>,
) -> anyhow::Result<()> {
    let rx_socket = Socket::bind_with(loopback(), Arc::clone(&channel)).await?;
    let tx_socket = Socket::bind_with(loopback(), channel).await?;
    let mut sink = GbnSink::new(rx_socket, Metrics::new("gbn receiver"));
    let session = GbnSession::start(
        tx_socket,
        sink.local_addr(),
        GbnConfig {
            window_size,
            timeout,
        },
        Metrics::new("gbn sender"),
    )?;

    let expected = payloads.len();
    let receiving = tokio::spawn(async move {
        let mut delivered = Vec::new();
        while delivered.len() < expected {
            match sink.recv(Duration::from_secs(30)).await? {
                Some(payload) => delivered.push(payload),
                None => break,
            }
        }
        Ok::<_, anyhow::Error>((delivered, sink.stats()))
    });

    for payload in payloads {
        session.send_retrying(payload, Duration::from_millis(5)).await?;
    }
    if !session.flush(Duration::from_secs(60)).await? {
        log::warn!("[gbn sender] window did not drain");
    }
    let sender_stats = session.close().await?;
    let (delivered, receiver_stats) = receiving.await??;
    report(payloads, &delivered, sender_stats, receiver_stats);
    Ok(())
}

async fn demo_tcp(
    payloads: &[Vec<u8>],
    timeout: Duration,
    channel: Arc<dyn Channel>,
) -> anyhow::Result<()> {
    let config = ConnConfig {
        rto: RtoConfig {
            initial: timeout,
            ..RtoConfig::default()
        },
        ..ConnConfig::default()
    };
    let server = Endpoint::bind_with(loopback(), config.clone(), Arc::clone(&channel))
        .await?
        .with_metrics(Metrics::new("server"));
    let addr = server.local_addr();
    let listener = server.listen();
    let serving = tokio::spawn(async move {
        let conn = listener.accept().await?;
        let data = read_to_eof(&conn).await?;
        conn.close().await?;
        Ok::<_, anyhow::Error>((data, conn.stats()))
    });

    let client = Endpoint::bind_with(loopback(), config, channel)
        .await?
        .with_metrics(Metrics::new("client"))
        .connect(addr)
        .await?;
    let stream: Vec<u8> = payloads.concat();
    client.send(&stream).await?;
    client.close().await?;

    let (received, server_stats) = serving.await??;
    if received != stream {
        bail!("stream mismatch: sent {} bytes, received {}", stream.len(), received.len());
    }
    println!("transferred {} bytes intact", stream.len());
    println!("{}", client.stats());
    println!("{server_stats}");
    Ok(())
}

/// Read until the peer's FIN.  Gives up after a minute of silence.
async fn read_to_eof(conn: &Connection) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut idle = Duration::ZERO;
    while !conn.at_eof() {
        let chunk = conn.recv(64 * 1024).await?;
        if chunk.is_empty() {
            idle += ConnConfig::default().recv_timeout;
            if idle >= Duration::from_secs(60) {
                bail!("peer went silent after {} bytes", data.len());
            }
            continue;
        }
        idle = Duration::ZERO;
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}
