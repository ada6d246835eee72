//! Codec adaptation over the native Vorbis transform.
//!
//! ```text
//!              send_block                receive_packet
//! SampleBlock ───────────► Analyzer ───────────────────► PacketBuffer*
//!
//!              send_packet               receive_block
//! PacketBuffer ──────────► Synthesizer ─────────────────► SampleBlock*
//! ```
//!
//! Neither direction is 1:1. The transform buffers internally and may yield
//! zero or several outputs per input, so callers drain with [`Drain`] until it
//! is exhausted.

use std::os::raw::c_int;

use crate::{
    block::SampleBlock,
    config::EncoderConfig,
    error::{Error, Result},
    packet::{HeaderPackets, PacketBuffer},
};

pub(crate) mod native;

pub trait Analyzer: Sized {
    /// Configure the transform. Infeasible settings fail with `Error::Config`.
    fn open(config: &EncoderConfig) -> Result<Self>;

    fn channels(&self) -> usize;

    /// Identification, comment and setup headers, in that order.
    fn header_packets(&mut self) -> Result<HeaderPackets>;

    fn send_block(&mut self, block: &SampleBlock) -> Result<()>;

    /// Tell the transform no more samples follow, so it can flush and mark
    /// the final packet.
    fn send_eof(&mut self) -> Result<()>;

    /// Next finished packet, or `None` until more input arrives.
    fn receive_packet(&mut self) -> Result<Option<PacketBuffer>>;
}

pub trait Synthesizer {
    /// Feed one of the three header packets.
    fn send_header(&mut self, packet: &PacketBuffer) -> Result<()>;

    /// All headers seen; audio packets are accepted from now on.
    fn is_ready(&self) -> bool;

    fn send_packet(&mut self, packet: &PacketBuffer) -> Result<()>;

    /// Next decoded block, or `None` until another packet arrives.
    fn receive_block(&mut self) -> Result<Option<SampleBlock>>;
}

/// Lazy sequence over a `receive_*` style source, exhausted at the first `None`.
pub struct Drain<'a, S, T> {
    source: &'a mut S,
    pull: fn(&mut S) -> Result<Option<T>>,
    done: bool,
}

impl<'a, S, T> Drain<'a, S, T> {
    pub fn new(source: &'a mut S, pull: fn(&mut S) -> Result<Option<T>>) -> Self {
        Self {
            source,
            pull,
            done: false,
        }
    }
}

impl<S, T> Iterator for Drain<'_, S, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match (self.pull)(&mut *self.source) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Drain every packet the analyzer has ready.
pub fn packets<A: Analyzer>(analyzer: &mut A) -> Drain<'_, A, PacketBuffer> {
    Drain::new(analyzer, A::receive_packet)
}

/// Drain every block the synthesizer has ready.
pub fn blocks<S: Synthesizer>(synthesizer: &mut S) -> Drain<'_, S, SampleBlock> {
    Drain::new(synthesizer, S::receive_block)
}

// libvorbis return codes
pub const OV_FALSE: c_int = -1;
pub const OV_EOF: c_int = -2;
pub const OV_HOLE: c_int = -3;
pub const OV_EREAD: c_int = -128;
pub const OV_EFAULT: c_int = -129;
pub const OV_EIMPL: c_int = -130;
pub const OV_EINVAL: c_int = -131;
pub const OV_ENOTVORBIS: c_int = -132;
pub const OV_EBADHEADER: c_int = -133;
pub const OV_EVERSION: c_int = -134;
pub const OV_ENOTAUDIO: c_int = -135;
pub const OV_EBADPACKET: c_int = -136;
pub const OV_EBADLINK: c_int = -137;
pub const OV_ENOSEEK: c_int = -138;

pub(crate) const OV_ECTL_RATEMANAGE2_SET: c_int = 0x15;

pub fn code_name(code: c_int) -> &'static str {
    match code {
        0 => "OK",
        OV_FALSE => "OV_FALSE",
        OV_EOF => "OV_EOF",
        OV_HOLE => "OV_HOLE",
        OV_EREAD => "OV_EREAD",
        OV_EFAULT => "OV_EFAULT",
        OV_EIMPL => "OV_EIMPL",
        OV_EINVAL => "OV_EINVAL",
        OV_ENOTVORBIS => "OV_ENOTVORBIS",
        OV_EBADHEADER => "OV_EBADHEADER",
        OV_EVERSION => "OV_EVERSION",
        OV_ENOTAUDIO => "OV_ENOTAUDIO",
        OV_EBADPACKET => "OV_EBADPACKET",
        OV_EBADLINK => "OV_EBADLINK",
        OV_ENOSEEK => "OV_ENOSEEK",
        _ => "unknown",
    }
}

/// Setup calls: unsupported or invalid settings are configuration errors.
pub(crate) fn check_setup(code: c_int, what: &str) -> Result<()> {
    match code {
        0 => Ok(()),
        OV_EIMPL | OV_EINVAL => Err(Error::config(format!(
            "{}: {} ({})",
            what,
            code_name(code),
            code
        ))),
        _ => Err(fault(code, what)),
    }
}

pub(crate) fn check(code: c_int, what: &str) -> Result<c_int> {
    if code < 0 {
        Err(fault(code, what))
    } else {
        Ok(code)
    }
}

pub(crate) fn fault(code: c_int, what: &str) -> Error {
    Error::fault(format!("{}: {} ({})", what, code_name(code), code))
}
