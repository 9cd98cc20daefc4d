#[allow(clippy::all)]
pub mod data {
    include!(concat!(env!("OUT_DIR"), "/perfcollect.data.rs"));
}

pub mod framing;

pub use data::{
    blob::Payload, Blob, DataHeader, HwcSampData, IoEvent, IoTraceData, LinkedObject,
    LinkedObjectGroup, MemEvent, MemTraceData, MpiEvent, MpiTraceData, PcSampData, PthreadsEvent,
    PthreadsTraceData, UsertimeData,
};
pub use framing::{
    decode_blobs, encode_blob, BlobDecodeError, BlobPayload, PayloadKind, FRAMING_OVERHEAD,
};
