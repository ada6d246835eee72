use std::io::Read;
use std::pin::Pin;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    block::{PcmReader, SampleBlock},
    config::EncoderConfig,
    error::{Error, Result},
    mux::ContainerPage,
    pipeline::{DecodePipeline, DecodeReport, EncodePipeline, EncodeReport, PageSink},
};

/// Pages or blocks in flight between a blocking worker and its consumer.
/// The channel is bounded, so a slow consumer stalls the worker instead of
/// losing data.
const QUEUE_BOUND: usize = 64;
const READ_CHUNK: usize = 4096;

pub type PageStream = Pin<Box<dyn Stream<Item = ContainerPage> + Send + Sync>>;
pub type BlockStream = Pin<Box<dyn Stream<Item = SampleBlock> + Send + Sync>>;

struct ChannelSink {
    tx: mpsc::Sender<ContainerPage>,
}

impl PageSink for ChannelSink {
    fn write_page(&mut self, page: &ContainerPage) -> Result<()> {
        self.tx.blocking_send(page.clone()).map_err(|_| closed())
    }
}

fn closed() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "stream consumer went away",
    ))
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::fault(format!("worker task failed: {}", e))
}

/// Encodes one PCM source on a blocking worker.
///
/// Stopping finishes the stream at the next block boundary, so the pages
/// already produced still form a complete stream.
pub struct EncodeTask {
    cancel: CancellationToken,
}

impl Default for EncodeTask {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Start encoding `source` as interleaved 16-bit PCM in blocks of
    /// `block_frames`. Pages arrive on the stream; the handle yields the report.
    pub fn start<R: Read + Send + 'static>(
        &self,
        config: EncoderConfig,
        source: R,
        block_frames: usize,
    ) -> Result<(PageStream, JoinHandle<Result<EncodeReport>>)> {
        let mut pipeline = EncodePipeline::new(config.clone())?;
        let mut reader = PcmReader::new(source, config.channels, block_frames)?;
        let (tx, rx) = mpsc::channel(QUEUE_BOUND);
        let cancel = self.cancel.clone();
        let serial = pipeline.serial();

        let handle = tokio::task::spawn_blocking(move || -> Result<EncodeReport> {
            let mut sink = ChannelSink { tx };
            pipeline.write_headers(&mut sink)?;
            loop {
                if cancel.is_cancelled() {
                    log::info!("encode {:#010x} cancelled, closing stream", serial);
                    pipeline.finish(&mut sink)?;
                    break;
                }
                if pipeline.step(&reader.next_block()?, &mut sink)? {
                    break;
                }
            }
            log::info!("encode task {:#010x} finished", serial);
            Ok(pipeline.report().clone())
        });
        Ok((Box::pin(ReceiverStream::new(rx)), handle))
    }

    /// Drive a whole encode, collecting every page.
    pub async fn encode_all<R: Read + Send + 'static>(
        config: EncoderConfig,
        source: R,
        block_frames: usize,
    ) -> Result<(Vec<ContainerPage>, EncodeReport)> {
        use futures::StreamExt;

        let task = Self::new();
        let (stream, handle) = task.start(config, source, block_frames)?;
        let pages: Vec<ContainerPage> = stream.collect().await;
        let report = handle.await.map_err(join_error)??;
        Ok((pages, report))
    }
}

/// Decodes one Ogg Vorbis byte source on a blocking worker.
pub struct DecodeTask {
    cancel: CancellationToken,
}

impl Default for DecodeTask {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeTask {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn start<R: Read + Send + 'static>(
        &self,
        mut source: R,
    ) -> Result<(BlockStream, JoinHandle<Result<DecodeReport>>)> {
        let mut pipeline = DecodePipeline::new()?;
        let (tx, rx) = mpsc::channel(QUEUE_BOUND);
        let cancel = self.cancel.clone();

        let handle = tokio::task::spawn_blocking(move || -> Result<DecodeReport> {
            let mut chunk = vec![0u8; READ_CHUNK];
            'read: while !pipeline.is_finished() {
                if cancel.is_cancelled() {
                    log::info!("decode cancelled");
                    break;
                }
                let n = match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                pipeline.push_bytes(&chunk[..n])?;
                while let Some(block) = pipeline.next_block()? {
                    if tx.blocking_send(block).is_err() {
                        log::debug!("block consumer went away");
                        break 'read;
                    }
                }
            }
            let report = pipeline.report();
            log::info!(
                "decode task finished: {} frames, {} holes",
                report.frames_out,
                report.holes
            );
            Ok(report)
        });
        Ok((Box::pin(ReceiverStream::new(rx)), handle))
    }

    /// Drive a whole decode, collecting every block.
    pub async fn decode_all<R: Read + Send + 'static>(
        source: R,
    ) -> Result<(Vec<SampleBlock>, DecodeReport)> {
        use futures::StreamExt;

        let task = Self::new();
        let (stream, handle) = task.start(source)?;
        let blocks: Vec<SampleBlock> = stream.collect().await;
        let report = handle.await.map_err(join_error)??;
        Ok((blocks, report))
    }
}
