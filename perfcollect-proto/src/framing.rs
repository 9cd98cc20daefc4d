//! Length-delimited blob framing.
//!
//! Collectors never build the owned [`Blob`] message. They encode the header
//! and a borrowed view of their buffers straight into a byte sink, producing
//! bytes that decode as a regular `Blob`.

use prost::bytes::BufMut;
use prost::encoding::{encode_key, encode_varint, encoded_len_varint, key_len, message, WireType};
use prost::Message;
use thiserror::Error;

use crate::data::{Blob, DataHeader};

const HEADER_TAG: u32 = 1;

/// Bytes a framed blob adds around its header and payload bodies: the blob
/// length, and a key and length for each of the two.
pub const FRAMING_OVERHEAD: usize = 3 * 10 + 2;

/// Field number of each payload variant inside `Blob`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadKind {
    PcSamp = 2,
    HwcSamp = 3,
    Usertime = 4,
    Io = 5,
    Mem = 6,
    Mpi = 7,
    Pthreads = 8,
    LinkedObjects = 9,
}

impl PayloadKind {
    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// A payload that can be written as the body of one of the `Blob` payload
/// variants without materializing the owned message.
pub trait BlobPayload {
    fn kind(&self) -> PayloadKind;
    /// Length of the message body, without key and length prefix.
    fn encoded_len(&self) -> usize;
    fn encode_raw(&self, buf: &mut impl BufMut);
}

#[derive(Debug, Error)]
pub enum BlobDecodeError {
    #[error("truncated or malformed blob at offset {offset}: {source}")]
    Malformed {
        offset: usize,
        source: prost::DecodeError,
    },
    #[error("blob at offset {0} has no header")]
    MissingHeader(usize),
}

/// Length of one framed blob, including its leading length varint.
pub fn framed_len(header: &DataHeader, payload: &impl BlobPayload) -> usize {
    let body = body_len(header, payload);
    encoded_len_varint(body as u64) + body
}

fn body_len(header: &DataHeader, payload: &impl BlobPayload) -> usize {
    let payload_len = payload.encoded_len();
    message::encoded_len(HEADER_TAG, header)
        + key_len(payload.kind().tag())
        + encoded_len_varint(payload_len as u64)
        + payload_len
}

/// Appends one length-delimited `Blob` to `buf`.
pub fn encode_blob(header: &DataHeader, payload: &impl BlobPayload, buf: &mut impl BufMut) {
    encode_varint(body_len(header, payload) as u64, buf);
    message::encode(HEADER_TAG, header, buf);
    encode_key(payload.kind().tag(), WireType::LengthDelimited, buf);
    encode_varint(payload.encoded_len() as u64, buf);
    payload.encode_raw(buf);
}

/// Decodes every blob in a data file.
pub fn decode_blobs(bytes: &[u8]) -> Result<Vec<Blob>, BlobDecodeError> {
    let mut blobs = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let offset = bytes.len() - rest.len();
        let blob = Blob::decode_length_delimited(&mut rest)
            .map_err(|source| BlobDecodeError::Malformed { offset, source })?;
        if blob.header.is_none() {
            return Err(BlobDecodeError::MissingHeader(offset));
        }
        blobs.push(blob);
    }
    Ok(blobs)
}

/// Length of a packed repeated varint field, including key and length.
pub fn packed_len<I>(tag: u32, values: I) -> usize
where
    I: IntoIterator<Item = u64>,
{
    let body: usize = values.into_iter().map(encoded_len_varint).sum();
    if body == 0 {
        return 0;
    }
    key_len(tag) + encoded_len_varint(body as u64) + body
}

/// Writes a packed repeated varint field from any sequence of integers.
/// Empty sequences are omitted, matching proto3 defaults.
pub fn encode_packed<I>(tag: u32, values: I, buf: &mut impl BufMut)
where
    I: IntoIterator<Item = u64> + Clone,
{
    let body: usize = values.clone().into_iter().map(encoded_len_varint).sum();
    if body == 0 {
        return;
    }
    encode_key(tag, WireType::LengthDelimited, buf);
    encode_varint(body as u64, buf);
    for value in values {
        encode_varint(value, buf);
    }
}
