//! Streaming decoder for the archive container format.
//!
//! A container byte range holds one or more concatenated, independently
//! gzip-compressed members, each inflating to exactly one record
//! (header block + payload). The decoder is an incremental state
//! machine over pushed bytes:
//!
//! `AwaitMember -> (inflate, parse headers, take payload) ->
//! AwaitMember`, diverting to `Resyncing` on malformed input and
//! finishing in `Done` when the input ends at a member boundary.
//!
//! Archive files are large, append-only, and occasionally carry
//! truncated tail records or accumulated corruption, so one corrupt
//! member never aborts decoding: the failed region is reported as a
//! single skipped-record error and the decoder scans forward to the
//! next member magic.

mod record;

use std::io::Read;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use warchive_core::Error;
use warchive_core::records::ContainerRecord;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Magic plus the deflate method byte, used when scanning for a
/// plausible member start during resync.
const MEMBER_START: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Decoder position in the container stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Expecting the next member's magic bytes (or clean end of input).
    AwaitMember,
    /// Scanning forward for the next member start after a malformed
    /// region.
    Resyncing,
    /// Input exhausted at a member boundary.
    Done,
}

/// One decoder output.
#[derive(Debug)]
pub enum DecodeEvent {
    Record(ContainerRecord),
    /// A single skipped record; decoding continues after it.
    Malformed { offset: u64, reason: String },
}

/// Outcome of one `next_step` call.
#[derive(Debug)]
pub enum DecodeStep {
    Event(DecodeEvent),
    /// More input is required before the next event can be produced.
    NeedInput,
    /// The stream is fully decoded.
    Finished,
}

enum InflateError {
    /// The member extends past the currently buffered input.
    Truncated,
    Corrupt(String),
}

impl std::fmt::Display for InflateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InflateError::Truncated => write!(f, "truncated gzip member"),
            InflateError::Corrupt(reason) => write!(f, "corrupt gzip member: {reason}"),
        }
    }
}

/// Incremental container decoder.
///
/// Push raw bytes with [`push`](Decoder::push), then drain events with
/// [`next_step`](Decoder::next_step). For a fetch stream, use
/// [`decode_stream`] instead.
pub struct Decoder {
    buf: BytesMut,
    /// Absolute stream offset of `buf[0]`, for error context.
    offset: u64,
    state: DecoderState,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), offset: 0, state: DecoderState::AwaitMember }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Produce the next event, or report that more input is needed.
    ///
    /// `input_done` tells the decoder the input stream is exhausted,
    /// so a member that is still incomplete is corruption rather than
    /// data yet to arrive.
    pub fn next_step(&mut self, input_done: bool) -> DecodeStep {
        loop {
            match self.state {
                DecoderState::Done => return DecodeStep::Finished,
                DecoderState::AwaitMember => {
                    if self.buf.is_empty() {
                        if input_done {
                            self.state = DecoderState::Done;
                            return DecodeStep::Finished;
                        }
                        return DecodeStep::NeedInput;
                    }
                    if self.buf.len() < GZIP_MAGIC.len() && !input_done {
                        return DecodeStep::NeedInput;
                    }
                    if !self.buf.starts_with(&GZIP_MAGIC) {
                        let offset = self.offset;
                        self.state = DecoderState::Resyncing;
                        return DecodeStep::Event(DecodeEvent::Malformed {
                            offset,
                            reason: "expected gzip member magic".to_string(),
                        });
                    }

                    match inflate_member(&self.buf) {
                        Ok((raw, used)) => {
                            let member_offset = self.offset;
                            self.advance(used);
                            match record::parse_record(&raw) {
                                Ok(rec) => return DecodeStep::Event(DecodeEvent::Record(rec)),
                                Err(reason) => {
                                    return DecodeStep::Event(DecodeEvent::Malformed {
                                        offset: member_offset,
                                        reason,
                                    });
                                }
                            }
                        }
                        Err(InflateError::Truncated) if !input_done => return DecodeStep::NeedInput,
                        Err(err) => {
                            let offset = self.offset;
                            self.advance(GZIP_MAGIC.len().min(self.buf.len()));
                            self.state = DecoderState::Resyncing;
                            return DecodeStep::Event(DecodeEvent::Malformed {
                                offset,
                                reason: err.to_string(),
                            });
                        }
                    }
                }
                DecoderState::Resyncing => {
                    if let Some(pos) = find_member_start(&self.buf) {
                        self.advance(pos);
                        self.state = DecoderState::AwaitMember;
                        continue;
                    }
                    if input_done {
                        self.advance(self.buf.len());
                        self.state = DecoderState::Done;
                        return DecodeStep::Finished;
                    }
                    // keep a short tail in case the magic spans chunks
                    let keep = (MEMBER_START.len() - 1).min(self.buf.len());
                    let drop = self.buf.len() - keep;
                    self.advance(drop);
                    return DecodeStep::NeedInput;
                }
            }
        }
    }

    fn advance(&mut self, n: usize) {
        self.offset += n as u64;
        let _ = self.buf.split_to(n);
    }
}

/// Inflate exactly one gzip member from the front of `buf`.
///
/// Returns the inflated bytes and how many compressed bytes the member
/// occupied.
fn inflate_member(buf: &[u8]) -> Result<(Vec<u8>, usize), InflateError> {
    let mut decoder = flate2::bufread::GzDecoder::new(buf);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => {
            let remaining = decoder.into_inner().len();
            Ok((out, buf.len() - remaining))
        }
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(InflateError::Truncated),
        Err(e) => Err(InflateError::Corrupt(e.to_string())),
    }
}

fn find_member_start(buf: &[u8]) -> Option<usize> {
    buf.windows(MEMBER_START.len()).position(|window| window == MEMBER_START)
}

/// Decode a fully buffered container byte range.
///
/// Returns the successfully decoded records and one error per skipped
/// region.
pub fn decode_bytes(data: &[u8]) -> (Vec<ContainerRecord>, Vec<Error>) {
    let mut decoder = Decoder::new();
    decoder.push(data);

    let mut records = Vec::new();
    let mut errors = Vec::new();
    loop {
        match decoder.next_step(true) {
            DecodeStep::Event(DecodeEvent::Record(rec)) => records.push(rec),
            DecodeStep::Event(DecodeEvent::Malformed { offset, reason }) => {
                errors.push(Error::MalformedRecord { offset, reason });
            }
            DecodeStep::Finished | DecodeStep::NeedInput => break,
        }
    }
    (records, errors)
}

/// Drive a [`Decoder`] from a fetch stream, yielding records as soon
/// as their member is fully buffered.
///
/// Malformed members surface as `Err(Error::MalformedRecord)` items
/// and the stream continues; a transport error ends the stream after
/// being yielded.
pub fn decode_stream<S>(input: S) -> impl Stream<Item = Result<ContainerRecord, Error>>
where
    S: Stream<Item = Result<Bytes, Error>>,
{
    struct Drive<S> {
        decoder: Decoder,
        input: std::pin::Pin<Box<S>>,
        input_done: bool,
        finished: bool,
    }

    let state = Drive { decoder: Decoder::new(), input: Box::pin(input), input_done: false, finished: false };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            match st.decoder.next_step(st.input_done) {
                DecodeStep::Event(DecodeEvent::Record(rec)) => return Some((Ok(rec), st)),
                DecodeStep::Event(DecodeEvent::Malformed { offset, reason }) => {
                    tracing::warn!(offset, reason = %reason, "skipping malformed container record");
                    return Some((Err(Error::MalformedRecord { offset, reason }), st));
                }
                DecodeStep::Finished => return None,
                DecodeStep::NeedInput => match st.input.next().await {
                    Some(Ok(chunk)) => st.decoder.push(&chunk),
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                    None => st.input_done = true,
                },
            }
        }
    })
}
