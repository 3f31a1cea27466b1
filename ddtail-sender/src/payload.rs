// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch wire encoding: a length-prefixed, lz4-frame-compressed payload of
//! records with their tag set.

use crate::SendError;
use bytes::Bytes;
use ddtail_pipeline::Batch;
use lz4_flex::frame::FrameEncoder;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Identity attached to every outgoing payload.
#[derive(Debug, Clone, Default)]
pub struct SenderMeta {
    pub host: String,
    pub user_id: Option<String>,
    pub user_defined_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WireRecord {
    /// Unix seconds.
    pub time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precise_us: Option<i64>,
    /// Per-record tags; carries the `path:` of the originating file, which
    /// varies record to record within a batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WirePayload {
    pub sequence: u64,
    pub tags: Vec<String>,
    pub records: Vec<WireRecord>,
}

/// A batch ready for the transport: headers' worth of metadata plus the
/// encoded body.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub destination: String,
    pub sequence: u64,
    pub record_count: usize,
    /// Serialized size before compression.
    pub raw_bytes: usize,
    /// `u32` big-endian uncompressed length, then the (possibly compressed)
    /// payload.
    pub body: Bytes,
    pub compressed: bool,
}

/// Serialize and compress one sealed batch.
pub fn encode_batch(
    batch: &Batch,
    meta: &SenderMeta,
    region: &str,
    compress: bool,
) -> Result<EncodedBatch, SendError> {
    let mut tags = vec![
        format!("source:{}", batch.partition),
        format!("host:{}", meta.host),
    ];
    // The source's configured send-tag set rides on every payload.
    for (key, value) in &batch.tags {
        tags.push(format!("{key}:{value}"));
    }
    if !region.is_empty() {
        tags.push(format!("region:{region}"));
    }
    if let Some(user_id) = &meta.user_id {
        tags.push(format!("user_id:{user_id}"));
    }
    if let Some(user_defined_id) = &meta.user_defined_id {
        tags.push(format!("user_defined_id:{user_defined_id}"));
    }
    if let Some(range) = &batch.range {
        tags.push(format!(
            "range:{}:{}-{}",
            String::from_utf8_lossy(&range.primary_key),
            range.begin,
            range.end
        ));
    }

    let payload = WirePayload {
        sequence: batch.sequence,
        tags,
        records: batch
            .records
            .iter()
            .map(|r| WireRecord {
                time: r.time.timestamp(),
                precise_us: r.precise_us,
                tags: r
                    .path
                    .as_deref()
                    .map(|path| vec![format!("path:{path}")])
                    .unwrap_or_default(),
                fields: r.fields.clone(),
            })
            .collect(),
    };
    let serialized = serde_json::to_vec(&payload)?;
    let raw_bytes = serialized.len();

    let mut body = Vec::with_capacity(raw_bytes / 4 + 4);
    body.extend_from_slice(&(raw_bytes as u32).to_be_bytes());
    let compressed = if compress {
        let mut encoder = FrameEncoder::new(&mut body);
        // Writing into a Vec cannot fail.
        let write_ok =
            encoder.write_all(&serialized).is_ok() && encoder.finish().is_ok();
        write_ok
    } else {
        false
    };
    if !compressed {
        body.truncate(4);
        body.extend_from_slice(&serialized);
    }

    Ok(EncodedBatch {
        destination: batch.destination.clone(),
        sequence: batch.sequence,
        record_count: batch.records.len(),
        raw_bytes,
        body: Bytes::from(body),
        compressed,
    })
}

/// Decode helper for tests and the loopback transport.
pub fn decode_body(body: &[u8], compressed: bool) -> Result<WirePayload, SendError> {
    let raw_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let payload = &body[4..];
    let serialized: Vec<u8> = if compressed {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(payload);
        let mut out = Vec::with_capacity(raw_len);
        std::io::Read::read_to_end(&mut decoder, &mut out)
            .map_err(|e| SendError::Endpoint(format!("lz4 decode: {e}")))?;
        out
    } else {
        payload.to_vec()
    };
    Ok(serde_json::from_slice(&serialized)?)
}
