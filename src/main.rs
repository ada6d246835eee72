use std::io::Read as _;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;
use vorbis_bus::task::{DecodeTask, EncodeTask};

mod config;
mod wav;

use config::{Args, Mode};

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("vorbis_bus", log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    log::info!("ovenc {} on {}", env!("CARGO_PKG_VERSION"), vorbis_bus::version_string());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupted, closing the stream");
            cancel_clone.cancel();
        }
    });

    match args.mode {
        Mode::Encode => encode(&args, cancel).await,
        Mode::Decode => decode(&args, cancel).await,
    }
}

async fn encode(args: &Args, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = args.encoder_config()?;
    let input = if args.raw {
        std::io::Cursor::new(Vec::new()).chain(std::io::stdin())
    } else {
        let (found, input) = wav::skip_header(std::io::stdin()).context("reading wav header")?;
        if !found {
            log::warn!("no wav data chunk found, encoding the whole input as raw pcm");
        }
        input
    };

    let task = EncodeTask::with_cancel(cancel);
    let (mut pages, handle) = task.start(config, input, args.block_frames)?;
    let mut out = tokio::io::stdout();
    while let Some(page) = pages.next().await {
        out.write_all(page.header()).await?;
        out.write_all(page.body()).await?;
    }
    out.flush().await?;

    let report = handle.await??;
    print_report(args, &report)
}

async fn decode(args: &Args, cancel: CancellationToken) -> anyhow::Result<()> {
    let task = DecodeTask::with_cancel(cancel);
    let (mut blocks, handle) = task.start(std::io::stdin())?;
    let mut out = tokio::io::stdout();
    let mut pcm = Vec::new();
    while let Some(block) = blocks.next().await {
        pcm.clear();
        block.write_interleaved_i16_le(&mut pcm);
        out.write_all(&pcm).await?;
    }
    out.flush().await?;

    let report = handle.await??;
    if report.holes > 0 || report.dropped_packets > 0 {
        log::warn!(
            "{} holes, {} dropped packets in input",
            report.holes,
            report.dropped_packets
        );
    }
    print_report(args, &report)
}

fn print_report<T: Serialize + std::fmt::Debug>(args: &Args, report: &T) -> anyhow::Result<()> {
    if args.report {
        eprintln!("{}", serde_json::to_string_pretty(report)?);
    } else {
        log::info!("{:?}", report);
    }
    Ok(())
}
