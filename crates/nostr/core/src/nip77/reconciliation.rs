use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace};

use super::codec::WireBuffer;
use super::error::{Nip77Error, Result};
use super::model::{
    Bound, EventId, PROTOCOL_VERSION_1, Range, RangePayload, TimestampDelta, check_version,
};
use super::storage::{BUCKET_COUNT, ID_LIST_THRESHOLD, NegentropyStorage};

/// Smallest accepted non-zero frame size limit
pub const FRAME_SIZE_LIMIT_MINIMUM: u64 = 4096;

/// Bytes kept free under the frame size limit for the closing range
const FRAME_SIZE_SAFETY_MARGIN: u64 = 200;

/// Result of processing one incoming message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutput {
    /// Message to send back, or `None` once the initiator has nothing left to ask
    pub next_message: Option<Vec<u8>>,
    /// Ids we hold that the peer lacks
    pub have: Vec<EventId>,
    /// Ids the peer holds that we lack
    pub need: Vec<EventId>,
}

/// Outgoing message under construction.
///
/// Ranges are staged in a scratch buffer first so the frame size limit can be
/// checked before they are committed.
struct MessageWriter {
    output: Vec<u8>,
    delta: TimestampDelta,
}

impl MessageWriter {
    fn new() -> Self {
        Self {
            output: vec![PROTOCOL_VERSION_1],
            delta: TimestampDelta::new(),
        }
    }

    fn stage(&mut self, range: &Range, scratch: &mut Vec<u8>) {
        range.encode_into(scratch, &mut self.delta);
    }

    fn commit(&mut self, scratch: &mut Vec<u8>) {
        self.output.append(scratch);
    }

    fn len(&self) -> usize {
        self.output.len()
    }

    fn has_ranges(&self) -> bool {
        self.output.len() > 1
    }
}

/// Negentropy reconciliation engine for one session.
///
/// One side calls [`Negentropy::initiate`] and becomes the initiator; the
/// other answers every incoming message with [`Negentropy::reconcile`]. Only
/// the initiator reports `have`/`need`.
#[derive(Debug, Clone)]
pub struct Negentropy {
    storage: NegentropyStorage,
    frame_size_limit: u64,
    is_initiator: bool,
}

impl Negentropy {
    /// Create an engine over sealed storage.
    ///
    /// `frame_size_limit` of 0 disables the limit; otherwise it must be at
    /// least [`FRAME_SIZE_LIMIT_MINIMUM`].
    pub fn new(storage: NegentropyStorage, frame_size_limit: u64) -> Result<Self> {
        if frame_size_limit != 0 && frame_size_limit < FRAME_SIZE_LIMIT_MINIMUM {
            return Err(Nip77Error::FrameSizeLimitTooSmall(frame_size_limit));
        }
        Ok(Self {
            storage,
            frame_size_limit,
            is_initiator: false,
        })
    }

    pub fn storage(&self) -> &NegentropyStorage {
        &self.storage
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Build the opening message and take the initiator role.
    ///
    /// The whole key space goes out as one range: an id list when the set is
    /// small, otherwise a single fingerprint.
    pub fn initiate(&mut self) -> Result<Vec<u8>> {
        if self.is_initiator {
            return Err(Nip77Error::AlreadyInitiated);
        }
        self.is_initiator = true;

        let len = self.storage.len();
        let upper = Bound::infinity();
        let range = if len < ID_LIST_THRESHOLD {
            Range::id_list(upper, self.ids(0, len)?)
        } else {
            Range::fingerprint(upper, self.storage.fingerprint(0, len)?)
        };

        let mut writer = MessageWriter::new();
        let mut scratch = Vec::new();
        writer.stage(&range, &mut scratch);
        writer.commit(&mut scratch);

        debug!(records = len, bytes = writer.len(), "negentropy initiated");
        Ok(writer.output)
    }

    /// Process one incoming message and produce the reply.
    ///
    /// The initiator fails on a foreign protocol version. The responder
    /// answers it with a bare V1 version byte so the peer can downgrade.
    pub fn reconcile(&mut self, query: &[u8]) -> Result<ReconcileOutput> {
        let version = *query
            .first()
            .ok_or(Nip77Error::InvalidProtocolVersion(0))?;
        match check_version(version) {
            Ok(()) => {}
            Err(Nip77Error::UnsupportedProtocolVersion(_)) if !self.is_initiator => {
                debug!(version, "peer speaks another negentropy version");
                return Ok(ReconcileOutput {
                    next_message: Some(vec![PROTOCOL_VERSION_1]),
                    ..ReconcileOutput::default()
                });
            }
            Err(error) => return Err(error),
        }

        let mut buf = WireBuffer::from(&query[1..]);
        let mut delta = TimestampDelta::new();
        let mut pending = VecDeque::new();
        while !buf.is_empty() {
            pending.push_back(Range::decode_from(&mut buf, &mut delta)?);
        }

        let mut output = ReconcileOutput::default();
        let message = self.process_ranges(pending, &mut output)?;

        trace!(
            initiator = self.is_initiator,
            have = output.have.len(),
            need = output.need.len(),
            reply_bytes = message.as_ref().map_or(0, Vec::len),
            "negentropy round processed"
        );
        output.next_message = message;
        Ok(output)
    }

    fn process_ranges(
        &self,
        mut pending: VecDeque<Range>,
        output: &mut ReconcileOutput,
    ) -> Result<Option<Vec<u8>>> {
        let storage_len = self.storage.len();
        let mut writer = MessageWriter::new();
        let mut scratch = Vec::new();

        let mut prev_bound = Bound::zero();
        let mut prev_index = 0;
        // Storage index where the committed output currently ends.
        let mut committed_index = 0;
        let mut skip = false;

        while let Some(range) = pending.pop_front() {
            if range.upper_bound < prev_bound {
                return Err(Nip77Error::InvalidRange(
                    "bounds out of order in incoming message".to_string(),
                ));
            }

            let lower = prev_index;
            let mut upper =
                self.storage
                    .find_lower_bound(prev_index, storage_len, &range.upper_bound);

            match range.payload {
                RangePayload::Skip => skip = true,

                RangePayload::Fingerprint(theirs) => {
                    if self.storage.fingerprint(lower, upper)? == theirs {
                        skip = true;
                    } else {
                        flush_skip(&mut skip, &prev_bound, &mut writer, &mut scratch);
                        self.split_range(
                            lower,
                            upper,
                            &range.upper_bound,
                            &mut writer,
                            &mut scratch,
                        )?;
                    }
                }

                RangePayload::IdList(their_ids) if self.is_initiator => {
                    skip = true;
                    self.diff_ids(lower, upper, &their_ids, output)?;
                }

                RangePayload::IdList(_) => {
                    flush_skip(&mut skip, &prev_bound, &mut writer, &mut scratch);

                    let mut response_ids = Vec::new();
                    let mut end_bound = range.upper_bound.clone();
                    for (offset, record) in self.storage.slice(lower, upper)?.iter().enumerate() {
                        let id_bytes = response_ids.len() * 32;
                        if self.exceeds_frame_limit(writer.len() + scratch.len() + id_bytes) {
                            // Cut the list here; the closing fingerprint covers the rest.
                            end_bound = Bound::from_record(record);
                            upper = lower + offset;
                            break;
                        }
                        response_ids.push(record.id);
                    }

                    writer.stage(&Range::id_list(end_bound, response_ids), &mut scratch);
                    writer.commit(&mut scratch);
                    committed_index = upper;
                }
            }

            if self.exceeds_frame_limit(writer.len() + scratch.len()) {
                let remaining = self.storage.fingerprint(committed_index, storage_len)?;
                scratch.clear();
                writer.stage(
                    &Range::fingerprint(Bound::infinity(), remaining),
                    &mut scratch,
                );
                writer.commit(&mut scratch);
                debug!(
                    limit = self.frame_size_limit,
                    deferred = pending.len(),
                    "negentropy frame size limit reached"
                );
                break;
            }

            if !scratch.is_empty() {
                writer.commit(&mut scratch);
                committed_index = upper;
            }
            prev_index = upper;
            prev_bound = range.upper_bound;
        }

        if self.is_initiator && !writer.has_ranges() {
            return Ok(None);
        }
        Ok(Some(writer.output))
    }

    /// Emit `[lower, upper)` as an id list or as fingerprinted buckets.
    fn split_range(
        &self,
        lower: usize,
        upper: usize,
        upper_bound: &Bound,
        writer: &mut MessageWriter,
        scratch: &mut Vec<u8>,
    ) -> Result<()> {
        if upper - lower < ID_LIST_THRESHOLD {
            let range = Range::id_list(upper_bound.clone(), self.ids(lower, upper)?);
            writer.stage(&range, scratch);
            return Ok(());
        }

        let mut begin = lower;
        for (end, bound) in self
            .storage
            .split_points(lower, upper, BUCKET_COUNT, upper_bound)?
        {
            let fingerprint = self.storage.fingerprint(begin, end)?;
            writer.stage(&Range::fingerprint(bound, fingerprint), scratch);
            begin = end;
        }
        Ok(())
    }

    fn diff_ids(
        &self,
        lower: usize,
        upper: usize,
        their_ids: &[EventId],
        output: &mut ReconcileOutput,
    ) -> Result<()> {
        let ours = self.storage.slice(lower, upper)?;
        let theirs: HashSet<&EventId> = their_ids.iter().collect();
        let our_set: HashSet<&EventId> = ours.iter().map(|record| &record.id).collect();

        output.have.extend(
            ours.iter()
                .map(|record| record.id)
                .filter(|id| !theirs.contains(id)),
        );
        output
            .need
            .extend(their_ids.iter().filter(|id| !our_set.contains(id)).copied());
        Ok(())
    }

    fn ids(&self, begin: usize, end: usize) -> Result<Vec<EventId>> {
        Ok(self
            .storage
            .slice(begin, end)?
            .iter()
            .map(|record| record.id)
            .collect())
    }

    fn exceeds_frame_limit(&self, len: usize) -> bool {
        self.frame_size_limit != 0
            && len as u64 > self.frame_size_limit - FRAME_SIZE_SAFETY_MARGIN
    }
}

/// Write the deferred Skip ending at `prev_bound`, if one is pending.
fn flush_skip(
    skip: &mut bool,
    prev_bound: &Bound,
    writer: &mut MessageWriter,
    scratch: &mut Vec<u8>,
) {
    if std::mem::take(skip) {
        writer.stage(&Range::skip(prev_bound.clone()), scratch);
    }
}
