//! Encode and decode paths, stage by stage.
//!
//! ```text
//! encode: PcmReader -> SampleBlock -> Session -> PacketBuffer -> OggMux -> ContainerPage -> PageSink
//! decode: bytes -> OggDemux -> PacketBuffer -> VorbisSynthesizer -> SampleBlock -> PCM
//! ```
//!
//! Both run strictly in order on the calling thread. Cancelling means not
//! calling the next step; see [`crate::task`] for the async wrappers.

use std::io::{Read, Write};

use serde::Serialize;

use crate::{
    block::{PcmReader, SampleBlock},
    codec::{Analyzer, Synthesizer, blocks},
    config::EncoderConfig,
    decoder::{StreamInfo, VorbisSynthesizer},
    demux::OggDemux,
    encoder::VorbisAnalyzer,
    error::{Error, Result},
    mux::{ContainerPage, OggMux, StreamMux},
    packet::PacketBuffer,
    session::{Session, SessionState},
};

const READ_CHUNK: usize = 4096;

/// Destination of finished pages, written in emission order.
pub trait PageSink {
    fn write_page(&mut self, page: &ContainerPage) -> Result<()>;
}

impl<W: Write> PageSink for W {
    fn write_page(&mut self, page: &ContainerPage) -> Result<()> {
        page.write_to(self)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EncodeReport {
    pub frames_in: u64,
    pub packets: u64,
    pub pages: u64,
    pub bytes: u64,
    pub final_granule: i64,
}

pub struct EncodePipeline<A: Analyzer = VorbisAnalyzer> {
    session: Session<A>,
    mux: OggMux,
    report: EncodeReport,
    headers_written: bool,
    ended: bool,
}

impl EncodePipeline {
    /// Configure a session and a mux with a random serial.
    pub fn new(config: EncoderConfig) -> Result<Self> {
        Self::from_parts(Session::open(config)?, OggMux::new()?)
    }
}

impl<A: Analyzer> EncodePipeline<A> {
    pub fn from_parts(session: Session<A>, mux: OggMux) -> Result<Self> {
        if session.state() != SessionState::Configured {
            return Err(Error::sequence(format!(
                "pipeline needs a configured session, got {}",
                session.state()
            )));
        }
        Ok(Self {
            session,
            mux,
            report: EncodeReport::default(),
            headers_written: false,
            ended: false,
        })
    }

    pub fn session(&self) -> &Session<A> {
        &self.session
    }

    pub fn serial(&self) -> i32 {
        self.mux.serial()
    }

    pub fn report(&self) -> &EncodeReport {
        &self.report
    }

    /// The end-of-stream page has been written.
    pub fn is_finished(&self) -> bool {
        self.ended
    }

    /// Emit the three headers and force them onto their own pages.
    pub fn write_headers<S: PageSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        if self.headers_written {
            return Err(Error::sequence("headers already written"));
        }
        let headers = self.session.emit_headers()?;
        for packet in headers.into_array() {
            self.report.packets += 1;
            self.mux.admit(packet)?;
        }
        for page in self.mux.force_flush() {
            let page = page?;
            Self::deliver(&mut self.report, sink, &page)?;
        }
        self.headers_written = true;
        log::info!(
            "headers flushed on {} pages, serial {:#010x}",
            self.report.pages,
            self.mux.serial()
        );
        Ok(())
    }

    /// Push one block through the chain. An empty block ends the stream.
    /// Returns `true` once the end-of-stream page has been written.
    pub fn step<S: PageSink + ?Sized>(&mut self, block: &SampleBlock, sink: &mut S) -> Result<bool> {
        if self.ended {
            return Err(Error::sequence("stream already ended"));
        }
        if !self.headers_written {
            return Err(Error::sequence("block submitted before header pages"));
        }
        self.report.frames_in += block.frame_count() as u64;

        'packets: for packet in self.session.submit_block(block)? {
            let packet = packet?;
            self.report.packets += 1;
            self.report.final_granule = packet.granule_position();
            self.mux.admit(packet)?;
            for page in self.mux.drain_ready() {
                let page = page?;
                Self::deliver(&mut self.report, sink, &page)?;
                if page.is_stream_end() {
                    self.ended = true;
                    break 'packets;
                }
            }
        }

        if !self.ended && self.session.state() == SessionState::Closed {
            for page in self.mux.force_flush() {
                let page = page?;
                Self::deliver(&mut self.report, sink, &page)?;
                if page.is_stream_end() {
                    self.ended = true;
                    break;
                }
            }
            if !self.ended {
                return Err(Error::fault("session closed without an end-of-stream page"));
            }
        }
        if self.ended {
            // Terminal packet written, release the transform.
            self.session.close();
        }
        Ok(self.ended)
    }

    pub fn finish<S: PageSink + ?Sized>(&mut self, sink: &mut S) -> Result<()> {
        self.step(&SampleBlock::end_of_input(), sink)?;
        Ok(())
    }

    /// Encode everything `reader` yields, headers included.
    pub fn run<R: Read, S: PageSink + ?Sized>(
        &mut self,
        reader: &mut PcmReader<R>,
        sink: &mut S,
    ) -> Result<EncodeReport> {
        if !self.headers_written {
            self.write_headers(sink)?;
        }
        while !self.step(&reader.next_block()?, sink)? {}
        log::info!("encode finished: {:?}", self.report);
        Ok(self.report.clone())
    }

    fn deliver<S: PageSink + ?Sized>(
        report: &mut EncodeReport,
        sink: &mut S,
        page: &ContainerPage,
    ) -> Result<()> {
        sink.write_page(page)?;
        report.pages += 1;
        report.bytes += page.len() as u64;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DecodeReport {
    pub frames_out: u64,
    pub packets: u64,
    pub holes: u64,
    pub dropped_packets: u64,
    pub foreign_pages: u64,
    pub resyncs: u64,
    pub info: Option<StreamInfo>,
    pub vendor: String,
    pub comments: Vec<String>,
    pub final_granule: i64,
    pub duration_secs: Option<f64>,
}

pub struct DecodePipeline {
    demux: OggDemux,
    synth: VorbisSynthesizer,
    report: DecodeReport,
}

impl DecodePipeline {
    pub fn new() -> Result<Self> {
        Ok(Self {
            demux: OggDemux::new()?,
            synth: VorbisSynthesizer::new(),
            report: DecodeReport::default(),
        })
    }

    pub fn synthesizer(&mut self) -> &mut VorbisSynthesizer {
        &mut self.synth
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.demux.push_bytes(data)
    }

    pub fn push_page(&mut self, page: &ContainerPage) -> Result<()> {
        self.demux.push_page(page)
    }

    /// The end-of-stream page was decoded and every block handed out.
    pub fn is_finished(&self) -> bool {
        self.demux.is_finished()
    }

    /// Next decoded block, or `None` until more bytes are pushed.
    ///
    /// Recoverable errors are counted and skipped: holes as `holes`,
    /// undecodable packets as `dropped_packets`. Everything else propagates.
    pub fn next_block(&mut self) -> Result<Option<SampleBlock>> {
        loop {
            if let Some(block) = blocks(&mut self.synth).next().transpose()? {
                self.report.frames_out += block.frame_count() as u64;
                return Ok(Some(block));
            }
            match self.demux.next_packet() {
                Ok(Some(packet)) => self.feed(packet)?,
                Ok(None) => return Ok(None),
                Err(e) if e.is_recoverable() => self.skip(&e),
                Err(e) => return Err(e),
            }
        }
    }

    fn feed(&mut self, packet: PacketBuffer) -> Result<()> {
        self.report.packets += 1;
        if !self.synth.is_ready() {
            return self.synth.send_header(&packet);
        }
        if packet.granule_position() >= 0 {
            self.report.final_granule = packet.granule_position();
        }
        match self.synth.send_packet(&packet) {
            Err(e) if e.is_recoverable() => {
                self.skip(&e);
                Ok(())
            }
            other => other,
        }
    }

    fn skip(&mut self, error: &Error) {
        if matches!(error, Error::StreamHole) {
            self.report.holes += 1;
        } else {
            self.report.dropped_packets += 1;
            log::warn!("dropping packet: {}", error);
        }
    }

    /// Decode `source` to interleaved 16-bit little-endian PCM on `out`.
    pub fn run<R: Read, W: Write + ?Sized>(
        &mut self,
        source: &mut R,
        out: &mut W,
    ) -> Result<DecodeReport> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut pcm = Vec::new();
        while !self.is_finished() {
            let n = match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.push_bytes(&chunk[..n])?;
            while let Some(block) = self.next_block()? {
                pcm.clear();
                block.write_interleaved_i16_le(&mut pcm);
                out.write_all(&pcm)?;
            }
        }
        if !self.is_finished() {
            log::warn!("input ended before the end-of-stream page");
        }
        out.flush()?;
        let report = self.report();
        log::info!(
            "decode finished: {} frames, {} holes, {} dropped",
            report.frames_out,
            report.holes,
            report.dropped_packets
        );
        Ok(report)
    }

    /// Counters so far, with the stream details known at this point.
    pub fn report(&mut self) -> DecodeReport {
        let mut report = self.report.clone();
        report.foreign_pages = self.demux.foreign_pages();
        report.resyncs = self.demux.resyncs();
        report.info = self.synth.stream_info();
        if self.synth.is_ready() {
            report.vendor = self.synth.vendor();
            report.comments = self.synth.comments();
            report.duration_secs = self.synth.granule_time(report.final_granule);
        }
        report
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
