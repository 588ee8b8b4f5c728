pub mod nip01;
pub mod nip77;

pub use nip01::{Event, ID_HEX_LEN};
pub use nip77::{
    Accumulator, BUCKET_COUNT, Bound, EventId, FRAME_SIZE_LIMIT_MINIMUM, Fingerprint,
    ID_LIST_THRESHOLD, NegClose, NegErr, NegMsg, NegOpen, Negentropy, NegentropyMessage,
    NegentropyStorage, Nip77Error, PROTOCOL_VERSION_1, Range, RangeMode, RangePayload,
    ReconcileOutput, Record, TIMESTAMP_INFINITY, WireBuffer, calculate_fingerprint,
    compare_bound, decode_varint, empty_fingerprint, encode_varint, sort_records,
};
