//! Frames exchanged between a [`RemoteStore`](crate::RemoteStore) and a
//! [`StoreServer`](crate::StoreServer).
//!
//! Every frame travels length delimited. A request is `BS(type)` followed by the request body,
//! a response is a tag byte followed by the response body.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use vt_interfaces::types::{varint, HashCode};

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub const T_ADD: u64 = 0;
pub const T_GET: u64 = 1;
pub const T_CONTAINS: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Store the data, answered with [`Response::Hash`].
    Add(Bytes),
    /// Fetch the data, answered with [`Response::Data`] or [`Response::NotFound`].
    Get(HashCode),
    /// Answered with [`Response::Contains`].
    Contains(HashCode),
}

impl From<Request> for Bytes {
    fn from(value: Request) -> Self {
        let mut buf = Vec::new();
        match value {
            Request::Add(data) => {
                varint::put_uint(&mut buf, T_ADD);
                buf.extend_from_slice(&data);
            },
            Request::Get(hash) => {
                varint::put_uint(&mut buf, T_GET);
                hash.encode_into(&mut buf);
            },
            Request::Contains(hash) => {
                varint::put_uint(&mut buf, T_CONTAINS);
                hash.encode_into(&mut buf);
            },
        }
        buf.into()
    }
}

impl TryFrom<Bytes> for Request {
    type Error = anyhow::Error;

    fn try_from(mut value: Bytes) -> Result<Self> {
        let (rq_type, offset) = varint::get_uint(&value, 0)?;
        value.advance(offset);
        match rq_type {
            T_ADD => Ok(Request::Add(value)),
            T_GET => Ok(Request::Get(HashCode::decode_exact(&value)?)),
            T_CONTAINS => Ok(Request::Contains(HashCode::decode_exact(&value)?)),
            other => Err(anyhow!("Unknown request type {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Hash(HashCode),
    Data(Bytes),
    NotFound,
    Contains(bool),
    /// The request failed on the server, with the reason.
    Error(String),
}

impl From<Response> for Bytes {
    fn from(value: Response) -> Self {
        let mut b = BytesMut::new();
        match value {
            Response::Hash(hash) => {
                b.put_u8(0x00);
                b.put_slice(&hash.encode());
            },
            Response::Data(data) => {
                b.put_u8(0x01);
                b.put_slice(&data);
            },
            Response::NotFound => {
                b.put_u8(0x02);
            },
            Response::Contains(found) => {
                b.put_u8(0x03);
                b.put_u8(found as u8);
            },
            Response::Error(reason) => {
                b.put_u8(0x04);
                b.put_slice(reason.as_bytes());
            },
        }
        b.freeze()
    }
}

impl TryFrom<Bytes> for Response {
    type Error = anyhow::Error;

    fn try_from(mut value: Bytes) -> Result<Self> {
        if value.is_empty() {
            bail!("Empty response frame");
        }
        match value.get_u8() {
            0x00 => Ok(Response::Hash(HashCode::decode_exact(&value)?)),
            0x01 => Ok(Response::Data(value)),
            0x02 if value.is_empty() => Ok(Response::NotFound),
            0x03 if value.len() == 1 => match value[0] {
                0 => Ok(Response::Contains(false)),
                1 => Ok(Response::Contains(true)),
                other => Err(anyhow!("Invalid boolean {other}")),
            },
            0x04 => Ok(Response::Error(String::from_utf8_lossy(&value).into_owned())),
            tag => Err(anyhow!("Malformed response with tag {tag}")),
        }
    }
}
