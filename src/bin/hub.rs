//! Minimal receiving hub for running the simulator locally.
//!
//! Accepts connections, splits the inbound stream into frames, prints a one
//! line summary per frame and answers each with a framed acknowledgment.

use bedsim::{encode_frame, FrameDecoder};
use clap::{App, Arg};
use colored::*;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "9899";
const READ_BUFFER_SIZE: usize = 8192;
const ACK_BODY: &[u8] = b"MSA|AA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Pretty,
    Json,
    Quiet,
}

#[derive(Debug, Serialize)]
struct FrameSummary<'a> {
    peer: String,
    frame: u64,
    bytes: usize,
    message_type: &'a str,
    sending_facility: &'a str,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("bedsim-hub")
        .version("0.1.0")
        .about("Receiving hub that accepts framed bedside monitor traffic")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Address to listen on")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be a number between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["pretty", "json", "quiet"])
                .default_value("pretty"),
        )
        .arg(
            Arg::with_name("no-ack")
                .long("no-ack")
                .help("Do not acknowledge received frames"),
        )
        .get_matches();

    let format = match matches.value_of("format") {
        Some("json") => OutputFormat::Json,
        Some("quiet") => OutputFormat::Quiet,
        _ => OutputFormat::Pretty,
    };
    let send_acks = !matches.is_present("no-ack");
    let address = format!(
        "{}:{}",
        matches.value_of("host").unwrap_or(DEFAULT_HOST),
        matches.value_of("port").unwrap_or(DEFAULT_PORT)
    );

    let listener = TcpListener::bind(&address).await?;
    info!("hub listening on {}", address);

    let total_frames = Arc::new(AtomicU64::new(0));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(frames = total_frames.load(Ordering::Relaxed), "hub stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("monitor connected: {}", peer);
                    let total_frames = Arc::clone(&total_frames);
                    tokio::spawn(async move {
                        if let Err(e) = handle_monitor(stream, peer, format, send_acks, total_frames).await {
                            warn!("monitor {} error: {}", peer, e);
                        }
                        info!("monitor {} disconnected", peer);
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            },
        }
    }
}

async fn handle_monitor(
    mut stream: TcpStream,
    peer: SocketAddr,
    format: OutputFormat,
    send_acks: bool,
    total_frames: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let ack = encode_frame(ACK_BODY);

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        for body in decoder.push(&buf[..n]) {
            let frame = total_frames.fetch_add(1, Ordering::Relaxed) + 1;
            print_frame(&body, peer, frame, format)?;
            if send_acks {
                stream.write_all(&ack).await?;
            }
        }
    }
}

fn print_frame(
    body: &[u8],
    peer: SocketAddr,
    frame: u64,
    format: OutputFormat,
) -> Result<(), serde_json::Error> {
    let text = String::from_utf8_lossy(body);
    let header = text.split('\r').next().unwrap_or_default();
    let fields: Vec<&str> = header.split('|').collect();
    let summary = FrameSummary {
        peer: peer.to_string(),
        frame,
        bytes: body.len(),
        // MSH-9 and MSH-4; the field separator itself is MSH-1
        message_type: fields.get(8).copied().unwrap_or("?"),
        sending_facility: fields.get(3).copied().unwrap_or("?"),
    };

    match format {
        OutputFormat::Quiet => {}
        OutputFormat::Json => println!("{}", serde_json::to_string(&summary)?),
        OutputFormat::Pretty => {
            let kind = if text.contains("MDC_EVT_ALARM") {
                summary.message_type.red().bold()
            } else {
                summary.message_type.green()
            };
            println!(
                "{} {} {} {} {}",
                format!("#{}", summary.frame).dimmed(),
                summary.peer.cyan(),
                kind,
                summary.sending_facility.yellow(),
                format!("{} bytes", summary.bytes).dimmed()
            );
        }
    }

    Ok(())
}
