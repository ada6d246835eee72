use std::fmt;

use crate::{
    block::SampleBlock,
    codec::{Analyzer, Drain},
    config::EncoderConfig,
    encoder::VorbisAnalyzer,
    error::{Error, Result},
    packet::{HeaderPackets, PacketBuffer},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Configured,
    HeadersEmitted,
    Streaming,
    Finalizing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One logical encode stream.
///
/// ```text
/// Uninitialized -configure-> Configured -emit_headers-> HeadersEmitted
///     -submit_block-> Streaming -finish-> Finalizing -drain-> Closed
/// ```
///
/// Out-of-order calls fail with `Error::Sequence` and leave the state as it
/// was. A transform fault closes the session.
pub struct Session<A: Analyzer = VorbisAnalyzer> {
    state: SessionState,
    analyzer: Option<A>,
    config: Option<EncoderConfig>,
    next_sequence: i64,
    last_granule: i64,
    audio_packets: u64,
    // Finalizing holds back one packet so the last one can be flagged.
    held: Option<PacketBuffer>,
}

impl<A: Analyzer> Default for Session<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Analyzer> Session<A> {
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            analyzer: None,
            config: None,
            next_sequence: 0,
            last_granule: 0,
            audio_packets: 0,
            held: None,
        }
    }

    /// Shorthand for `new` followed by `configure`.
    pub fn open(config: EncoderConfig) -> Result<Self> {
        let mut session = Self::new();
        session.configure(config)?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&EncoderConfig> {
        self.config.as_ref()
    }

    /// Channel count of the configured transform.
    pub fn channels(&self) -> Option<usize> {
        self.analyzer.as_ref().map(A::channels)
    }

    pub fn analyzer(&self) -> Option<&A> {
        self.analyzer.as_ref()
    }

    pub fn analyzer_mut(&mut self) -> Option<&mut A> {
        self.analyzer.as_mut()
    }

    /// Granule position of the latest packet handed out.
    pub fn last_granule(&self) -> i64 {
        self.last_granule
    }

    pub fn audio_packets(&self) -> u64 {
        self.audio_packets
    }

    fn expect_state(&self, allowed: &[SessionState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::sequence(format!("{} not allowed in state {}", op, self.state)))
        }
    }

    /// Open the transform. Infeasible settings fail with `Error::Config`
    /// before any data is accepted.
    pub fn configure(&mut self, config: EncoderConfig) -> Result<()> {
        self.expect_state(&[SessionState::Uninitialized], "configure")?;
        let analyzer = A::open(&config)?;
        log::info!(
            "session configured: {} ch, {} Hz",
            config.channels,
            config.sample_rate
        );
        self.analyzer = Some(analyzer);
        self.config = Some(config);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// The identification, comment and setup headers, in that order. Only
    /// the first is flagged stream-start.
    pub fn emit_headers(&mut self) -> Result<HeaderPackets> {
        self.expect_state(&[SessionState::Configured], "emit_headers")?;
        let headers = self.with_analyzer(|a| a.header_packets())?;
        self.next_sequence = 3;
        self.state = SessionState::HeadersEmitted;
        Ok(headers)
    }

    /// Feed one block and drain the packets it completes. An empty block
    /// ends the input; the drain then runs to the end-of-stream packet.
    pub fn submit_block(&mut self, block: &SampleBlock) -> Result<Drain<'_, Self, PacketBuffer>> {
        self.expect_state(
            &[SessionState::HeadersEmitted, SessionState::Streaming],
            "submit_block",
        )?;
        if block.is_end_of_input() {
            self.with_analyzer(|a| a.send_eof())?;
            log::debug!("end of input after {} audio packets", self.audio_packets);
            self.state = SessionState::Finalizing;
        } else {
            let expected = self.channels().unwrap_or_default();
            if block.channel_count() != expected {
                return Err(Error::invalid_input(format!(
                    "block has {} channels, session has {}",
                    block.channel_count(),
                    expected
                )));
            }
            self.with_analyzer(|a| a.send_block(block))?;
            self.state = SessionState::Streaming;
        }
        Ok(self.packets())
    }

    /// End the input. Same as submitting an empty block.
    pub fn finish(&mut self) -> Result<Drain<'_, Self, PacketBuffer>> {
        self.submit_block(&SampleBlock::end_of_input())
    }

    /// Packets ready right now.
    pub fn packets(&mut self) -> Drain<'_, Self, PacketBuffer> {
        Drain::new(self, Self::next_packet)
    }

    pub fn next_packet(&mut self) -> Result<Option<PacketBuffer>> {
        match self.state {
            SessionState::HeadersEmitted | SessionState::Streaming => {
                match self.with_analyzer(|a| a.receive_packet())? {
                    Some(mut packet) => {
                        if packet.is_stream_end() {
                            log::warn!("transform flagged end of stream before end of input");
                            packet.set_stream_end(false);
                        }
                        self.stamp(packet).map(Some)
                    }
                    None => Ok(None),
                }
            }
            SessionState::Finalizing => self.next_final_packet(),
            SessionState::Closed => Ok(None),
            SessionState::Uninitialized | SessionState::Configured => Err(Error::sequence(
                format!("no audio packets in state {}", self.state),
            )),
        }
    }

    fn next_final_packet(&mut self) -> Result<Option<PacketBuffer>> {
        while let Some(mut packet) = self.with_analyzer(|a| a.receive_packet())? {
            packet.set_stream_end(false);
            let packet = self.stamp(packet)?;
            if let Some(previous) = self.held.replace(packet) {
                return Ok(Some(previous));
            }
        }

        let mut last = match self.held.take() {
            Some(packet) => packet,
            None => {
                log::debug!("transform left no final packet, emitting an empty one");
                self.stamp(PacketBuffer::empty().with_granule_position(self.last_granule))?
            }
        };
        last.set_stream_end(true);
        self.held = None;
        self.state = SessionState::Closed;
        log::info!(
            "session closed: {} audio packets, final granule {}",
            self.audio_packets,
            self.last_granule
        );
        Ok(Some(last))
    }

    fn stamp(&mut self, mut packet: PacketBuffer) -> Result<PacketBuffer> {
        if packet.is_stream_start() {
            log::warn!("clearing stream-start flag on audio packet");
            packet.set_stream_start(false);
        }
        if packet.granule_position() < self.last_granule {
            return self.fail(Error::fault(format!(
                "granule position went back from {} to {}",
                self.last_granule,
                packet.granule_position()
            )));
        }
        self.last_granule = packet.granule_position();
        packet.set_sequence_number(self.next_sequence);
        self.next_sequence += 1;
        self.audio_packets += 1;
        Ok(packet)
    }

    fn with_analyzer<T>(&mut self, f: impl FnOnce(&mut A) -> Result<T>) -> Result<T> {
        let Some(analyzer) = self.analyzer.as_mut() else {
            return Err(Error::sequence(format!("no transform in state {}", self.state)));
        };
        match f(analyzer) {
            Err(e @ Error::TransformFault(_)) => self.fail(e),
            other => other,
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        log::warn!("session discarded after fault: {}", error);
        self.close();
        Err(error)
    }

    /// Release the transform. Any state may close; a closed session only
    /// answers with `Error::Sequence` or empty drains.
    ///
    /// Handing out the end-of-stream packet closes the session but keeps the
    /// transform alive until this is called, which the encode pipeline does
    /// once that packet's page is written.
    pub fn close(&mut self) {
        self.held = None;
        self.analyzer = None;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    fn collect(drain: Drain<'_, Session, PacketBuffer>) -> anyhow::Result<Vec<PacketBuffer>> {
        Ok(drain.collect::<Result<Vec<_>>>()?)
    }

    #[test]
    fn test_state_progression() -> anyhow::Result<()> {
        let mut session: Session = Session::new();
        assert_eq!(session.state(), SessionState::Uninitialized);
        session.configure(EncoderConfig::quality(2, 44100, 0.1))?;
        assert_eq!(session.state(), SessionState::Configured);

        let headers = session.emit_headers()?.into_array();
        assert_eq!(session.state(), SessionState::HeadersEmitted);
        assert_eq!(headers.iter().filter(|p| p.is_stream_start()).count(), 1);

        let mut packets = Vec::new();
        for _ in 0..4 {
            packets.extend(collect(session.submit_block(&SampleBlock::silence(2, 1024))?)?);
        }
        assert_eq!(session.state(), SessionState::Streaming);
        packets.extend(collect(session.finish()?)?);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.analyzer().is_some());
        assert_eq!(session.channels(), Some(2));
        assert_eq!(session.next_packet()?, None);
        session.close();
        assert!(session.analyzer().is_none());

        assert!(packets.last().unwrap().is_stream_end());
        assert_eq!(packets.iter().filter(|p| p.is_stream_end()).count(), 1);
        assert!(packets.iter().all(|p| !p.is_stream_start()));
        let sequence: Vec<i64> = packets.iter().map(|p| p.sequence_number()).collect();
        assert_eq!(sequence, (3..3 + packets.len() as i64).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_submit_before_headers_keeps_state() -> anyhow::Result<()> {
        let mut session: Session = Session::open(EncoderConfig::quality(2, 44100, 0.1))?;
        let result = session.submit_block(&SampleBlock::silence(2, 1024));
        assert!(matches!(result, Err(Error::Sequence(_))));
        assert_eq!(session.state(), SessionState::Configured);

        // still usable
        session.emit_headers()?;
        assert!(matches!(session.emit_headers(), Err(Error::Sequence(_))));
        assert_eq!(session.state(), SessionState::HeadersEmitted);
        Ok(())
    }

    #[test]
    fn test_submit_after_finish_is_sequence_error() -> anyhow::Result<()> {
        let mut session: Session = Session::open(EncoderConfig::quality(1, 8000, 0.0))?;
        session.emit_headers()?;
        collect(session.finish()?)?;
        let result = session.submit_block(&SampleBlock::silence(1, 16));
        assert!(matches!(result, Err(Error::Sequence(_))));
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn test_config_error_leaves_uninitialized() {
        let mut session: Session = Session::new();
        let result = session.configure(EncoderConfig::quality(2, 44100, 3.0));
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_channel_mismatch() -> anyhow::Result<()> {
        let mut session: Session = Session::open(EncoderConfig::quality(2, 44100, 0.1))?;
        session.emit_headers()?;
        let result = session.submit_block(&SampleBlock::silence(1, 1024));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(session.state(), SessionState::HeadersEmitted);
        Ok(())
    }

    /// Replays canned packets, never flagging the end of stream itself.
    struct Scripted {
        pending: VecDeque<PacketBuffer>,
        on_eof: Vec<PacketBuffer>,
        fault_on_block: bool,
    }

    impl Analyzer for Scripted {
        fn open(config: &EncoderConfig) -> Result<Self> {
            config.validate()?;
            Ok(Self {
                pending: VecDeque::new(),
                on_eof: Vec::new(),
                fault_on_block: false,
            })
        }

        fn channels(&self) -> usize {
            1
        }

        fn header_packets(&mut self) -> Result<HeaderPackets> {
            Ok(HeaderPackets::new(
                PacketBuffer::new(vec![1u8]),
                PacketBuffer::new(vec![3u8]),
                PacketBuffer::new(vec![5u8]),
            ))
        }

        fn send_block(&mut self, block: &SampleBlock) -> Result<()> {
            if self.fault_on_block {
                return Err(Error::fault("scripted fault"));
            }
            let granule = block.frame_count() as i64;
            self.pending.push_back(
                PacketBuffer::new(vec![0u8; 4])
                    .with_granule_position(granule)
                    .with_stream_start(true),
            );
            Ok(())
        }

        fn send_eof(&mut self) -> Result<()> {
            self.pending.extend(self.on_eof.drain(..));
            Ok(())
        }

        fn receive_packet(&mut self) -> Result<Option<PacketBuffer>> {
            Ok(self.pending.pop_front())
        }
    }

    fn scripted() -> anyhow::Result<Session<Scripted>> {
        let mut session = Session::<Scripted>::open(EncoderConfig::quality(1, 8000, 0.1))?;
        session.emit_headers()?;
        Ok(session)
    }

    #[test]
    fn test_last_packet_gets_end_flag() -> anyhow::Result<()> {
        let mut session = scripted()?;
        session.analyzer_mut().unwrap().on_eof = vec![
            PacketBuffer::new(vec![1u8]).with_granule_position(600),
            PacketBuffer::new(vec![2u8]).with_granule_position(700),
        ];
        let mid: Vec<_> = session
            .submit_block(&SampleBlock::silence(1, 500))?
            .collect::<Result<_>>()?;
        assert_eq!(mid.len(), 1);
        assert!(!mid[0].is_stream_start());

        let tail: Vec<_> = session.finish()?.collect::<Result<_>>()?;
        assert_eq!(tail.len(), 2);
        assert!(!tail[0].is_stream_end());
        assert!(tail[1].is_stream_end());
        assert_eq!(tail[1].payload().as_ref(), &[2u8]);
        assert_eq!(tail[1].sequence_number(), 5);
        Ok(())
    }

    #[test]
    fn test_empty_terminal_packet() -> anyhow::Result<()> {
        let mut session = scripted()?;
        let tail: Vec<_> = session.finish()?.collect::<Result<_>>()?;
        assert_eq!(tail.len(), 1);
        assert!(tail[0].is_empty());
        assert!(tail[0].is_stream_end());
        assert_eq!(tail[0].granule_position(), 0);
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn test_granule_regression_is_fault() -> anyhow::Result<()> {
        let mut session = scripted()?;
        session.analyzer_mut().unwrap().on_eof =
            vec![PacketBuffer::new(vec![1u8]).with_granule_position(10)];
        let _ = session.submit_block(&SampleBlock::silence(1, 500))?.count();
        let result: Result<Vec<_>> = session.finish()?.collect();
        assert!(matches!(result, Err(Error::TransformFault(_))));
        assert_eq!(session.state(), SessionState::Closed);
        Ok(())
    }

    #[test]
    fn test_fault_closes_session() -> anyhow::Result<()> {
        let mut session = scripted()?;
        session.analyzer_mut().unwrap().fault_on_block = true;
        let result = session.submit_block(&SampleBlock::silence(1, 10));
        assert!(matches!(result, Err(Error::TransformFault(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.analyzer().is_none());
        Ok(())
    }
}
