//! Decoder for collectd's binary network protocol.
//!
//! A packet is a sequence of parts, each starting with a big-endian `u16`
//! type and a `u16` length that includes the four header bytes. String and
//! number parts update the current identifier, time and interval; every
//! values part produces one sample from that state.
//!
//! Structural errors reject the whole packet. Problems confined to one value
//! list or one value (a missing interval, an `absolute` value) drop only that
//! sample or value.

use std::time::Duration;

use collectd_common::{Identifier, Sample, SampleError, Value, default_ds_names};
use thiserror::Error;

use super::typesdb::TypesDb;

pub const PART_HOST: u16 = 0x0000;
pub const PART_TIME: u16 = 0x0001;
pub const PART_PLUGIN: u16 = 0x0002;
pub const PART_PLUGIN_INSTANCE: u16 = 0x0003;
pub const PART_TYPE: u16 = 0x0004;
pub const PART_TYPE_INSTANCE: u16 = 0x0005;
pub const PART_VALUES: u16 = 0x0006;
pub const PART_INTERVAL: u16 = 0x0007;
pub const PART_TIME_HR: u16 = 0x0008;
pub const PART_INTERVAL_HR: u16 = 0x0009;
pub const PART_MESSAGE: u16 = 0x0100;
pub const PART_SEVERITY: u16 = 0x0101;
pub const PART_SIGNATURE: u16 = 0x0200;
pub const PART_ENCRYPTION: u16 = 0x0210;

pub const TYPE_COUNTER: u8 = 0;
pub const TYPE_GAUGE: u8 = 1;
pub const TYPE_DERIVE: u8 = 2;
pub const TYPE_ABSOLUTE: u8 = 3;

const HEADER_LEN: usize = 4;
const NUMERIC_PART_LEN: usize = HEADER_LEN + 8;

/// Packet-level decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated part header at offset {offset}")]
    TruncatedHeader { offset: usize },

    #[error("part 0x{part_type:04x} at offset {offset} has invalid length {length}")]
    InvalidLength {
        part_type: u16,
        offset: usize,
        length: usize,
    },

    #[error("part 0x{part_type:04x} at offset {offset} is not a NUL-terminated UTF-8 string")]
    InvalidString { part_type: u16, offset: usize },

    #[error("encrypted packets are not supported")]
    Encrypted,

    #[error("packet contains no parts")]
    Empty,
}

/// Everything usable decoded from one packet.
#[derive(Debug, Clone, Default)]
pub struct DecodedPacket {
    pub samples: Vec<Sample>,
    /// Value lists that could not form a valid sample.
    pub rejected: Vec<SampleError>,
    /// Values dropped because their type is not modelled.
    pub skipped_values: usize,
}

/// Mutable identifier/time state carried across the parts of a packet.
#[derive(Debug, Default)]
struct State {
    identifier: Identifier,
    timestamp_ms: i64,
    interval: Duration,
}

/// Decode one packet.
pub fn parse_packet(data: &[u8], typesdb: Option<&TypesDb>) -> Result<DecodedPacket, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut state = State::default();
    let mut packet = DecodedPacket::default();
    let mut offset = 0;

    while offset < data.len() {
        if data.len() - offset < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader { offset });
        }

        let part_type = read_u16(&data[offset..]);
        let length = read_u16(&data[offset + 2..]) as usize;

        if length < HEADER_LEN || length > data.len() - offset {
            return Err(DecodeError::InvalidLength {
                part_type,
                offset,
                length,
            });
        }

        let body = &data[offset + HEADER_LEN..offset + length];

        match part_type {
            PART_HOST => state.identifier.host = read_string(part_type, offset, body)?,
            PART_PLUGIN => state.identifier.plugin = read_string(part_type, offset, body)?,
            PART_PLUGIN_INSTANCE => {
                state.identifier.plugin_instance = read_string(part_type, offset, body)?
            }
            PART_TYPE => state.identifier.type_name = read_string(part_type, offset, body)?,
            PART_TYPE_INSTANCE => {
                state.identifier.type_instance = read_string(part_type, offset, body)?
            }
            PART_TIME => {
                let secs = read_number(part_type, offset, length, body)?;
                state.timestamp_ms = secs.saturating_mul(1000) as i64;
            }
            PART_TIME_HR => {
                let raw = read_number(part_type, offset, length, body)?;
                state.timestamp_ms = ((raw as u128 * 1000) >> 30) as i64;
            }
            PART_INTERVAL => {
                state.interval = Duration::from_secs(read_number(part_type, offset, length, body)?);
            }
            PART_INTERVAL_HR => {
                let raw = read_number(part_type, offset, length, body)?;
                state.interval = Duration::from_nanos(((raw as u128 * 1_000_000_000) >> 30) as u64);
            }
            PART_SEVERITY => {
                read_number(part_type, offset, length, body)?;
            }
            PART_VALUES => {
                let (count, values) = read_values(offset, length, body)?;
                packet.skipped_values += count - values.len();
                match build_sample(&state, count, values, typesdb) {
                    Ok(sample) => packet.samples.push(sample),
                    Err(e) => packet.rejected.push(e),
                }
            }
            PART_ENCRYPTION => return Err(DecodeError::Encrypted),
            // Notifications, signatures and unknown parts carry no samples.
            PART_MESSAGE | PART_SIGNATURE => {}
            _ => {}
        }

        offset += length;
    }

    Ok(packet)
}

/// Build a sample from the values kept out of `count`, naming them by position.
fn build_sample(
    state: &State,
    count: usize,
    values: Vec<(usize, Value)>,
    typesdb: Option<&TypesDb>,
) -> Result<Sample, SampleError> {
    let all_names = ds_names(&state.identifier.type_name, count, typesdb);

    let names = values.iter().map(|(i, _)| all_names[*i].clone()).collect();
    let values = values.into_iter().map(|(_, v)| v).collect();

    Sample::from_parts(
        state.identifier.clone(),
        state.timestamp_ms,
        state.interval,
        values,
        Some(names),
    )
}

/// Names for `count` values of `type_name`, from types.db when it agrees on the count.
fn ds_names(type_name: &str, count: usize, typesdb: Option<&TypesDb>) -> Vec<String> {
    match typesdb.and_then(|db| db.names(type_name)) {
        Some(names) if names.len() == count => names,
        Some(names) => {
            tracing::debug!(
                type_name,
                defined = names.len(),
                received = count,
                "types.db data-source count mismatch, using default names"
            );
            default_ds_names(count)
        }
        None => default_ds_names(count),
    }
}

/// Decode a values part into `(index, value)` pairs, dropping unmodelled types.
///
/// Returns the declared value count alongside the kept values.
fn read_values(
    offset: usize,
    length: usize,
    body: &[u8],
) -> Result<(usize, Vec<(usize, Value)>), DecodeError> {
    let invalid = || DecodeError::InvalidLength {
        part_type: PART_VALUES,
        offset,
        length,
    };

    if body.len() < 2 {
        return Err(invalid());
    }
    let count = read_u16(body) as usize;
    if count == 0 || body.len() != 2 + count * 9 {
        return Err(invalid());
    }

    let types = &body[2..2 + count];
    let raw_values = &body[2 + count..];

    let mut values = Vec::with_capacity(count);

    for (index, (type_code, raw)) in types.iter().zip(raw_values.chunks_exact(8)).enumerate() {
        let bytes: [u8; 8] = raw.try_into().map_err(|_| invalid())?;
        let value = match *type_code {
            TYPE_COUNTER => Value::Counter(u64::from_be_bytes(bytes)),
            TYPE_GAUGE => Value::Gauge(f64::from_le_bytes(bytes)),
            TYPE_DERIVE => Value::Derive(i64::from_be_bytes(bytes)),
            other => {
                tracing::debug!(
                    index,
                    type_code = other,
                    absolute = other == TYPE_ABSOLUTE,
                    "Skipping value of unsupported type"
                );
                continue;
            }
        };
        values.push((index, value));
    }

    Ok((count, values))
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn read_string(part_type: u16, offset: usize, body: &[u8]) -> Result<String, DecodeError> {
    let invalid = || DecodeError::InvalidString { part_type, offset };

    let (last, text) = body.split_last().ok_or_else(invalid)?;
    if *last != 0 {
        return Err(invalid());
    }
    std::str::from_utf8(text)
        .map(str::to_string)
        .map_err(|_| invalid())
}

fn read_number(
    part_type: u16,
    offset: usize,
    length: usize,
    body: &[u8],
) -> Result<u64, DecodeError> {
    let invalid = || DecodeError::InvalidLength {
        part_type,
        offset,
        length,
    };
    if length != NUMERIC_PART_LEN {
        return Err(invalid());
    }
    let bytes: [u8; 8] = body.try_into().map_err(|_| invalid())?;
    Ok(u64::from_be_bytes(bytes))
}
