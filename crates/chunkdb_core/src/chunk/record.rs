//! Entity record encoding inside chunk files.

use crate::range::Range;
use crate::types::{Entity, Key};

/// Fixed header: record_len (4) + key_start (8) + key_end (8) + id_len (4) = 24
const HEADER_SIZE: usize = 24;
/// CRC size.
const CRC_SIZE: usize = 4;

/// Computes the CRC32 (IEEE) checksum used by chunk records.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Returns the encoded size of an entity record.
#[must_use]
pub fn encoded_size(entity: &Entity) -> usize {
    HEADER_SIZE + entity.key.id().len() + entity.value.len() + CRC_SIZE
}

/// Appends the encoded record for `entity` to `buf`.
pub fn encode_into(entity: &Entity, buf: &mut Vec<u8>) {
    let start = buf.len();
    let record_len = encoded_size(entity);
    let span = entity.key.span();
    let id = entity.key.id();

    buf.reserve(record_len);
    buf.extend_from_slice(&(record_len as u32).to_le_bytes());
    buf.extend_from_slice(&span.start().to_le_bytes());
    buf.extend_from_slice(&span.end().to_le_bytes());
    buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&entity.value);

    // CRC32 over everything in this record before it
    let crc = compute_crc32(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Decodes one record from the front of `data`.
///
/// Returns the entity and the number of bytes consumed. Errors are plain
/// descriptions; the caller attaches the file path.
pub fn decode(data: &[u8]) -> Result<(Entity, usize), String> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(format!("truncated record header ({} bytes)", data.len()));
    }

    let record_len = read_u32(data, 0) as usize;
    if record_len < HEADER_SIZE + CRC_SIZE {
        return Err(format!("invalid record length {record_len}"));
    }
    if data.len() < record_len {
        return Err(format!(
            "truncated record: need {record_len} bytes, have {}",
            data.len()
        ));
    }

    let crc_offset = record_len - CRC_SIZE;
    let stored_crc = read_u32(data, crc_offset);
    let computed_crc = compute_crc32(&data[..crc_offset]);
    if stored_crc != computed_crc {
        return Err(format!(
            "checksum mismatch: expected {stored_crc:08x}, got {computed_crc:08x}"
        ));
    }

    let key_start = read_i64(data, 4);
    let key_end = read_i64(data, 12);
    let id_len = read_u32(data, 20) as usize;
    if HEADER_SIZE + id_len > crc_offset {
        return Err(format!("id length {id_len} exceeds record"));
    }
    let span = Range::try_new(key_start, key_end)
        .ok_or_else(|| format!("inverted key span {key_start}..{key_end}"))?;

    let id = data[HEADER_SIZE..HEADER_SIZE + id_len].to_vec();
    let value = data[HEADER_SIZE + id_len..crc_offset].to_vec();

    Ok((Entity::new(Key::interval(span, id), value), record_len))
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_i64(data: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(g: i64, id: &[u8], value: &[u8]) -> Entity {
        Entity::new(Key::point(g, id.to_vec()), value.to_vec())
    }

    #[test]
    fn encode_decode_point_key() {
        let e = entity(-42, b"sensor-1", b"payload");
        let mut buf = Vec::new();
        encode_into(&e, &mut buf);

        assert_eq!(buf.len(), encoded_size(&e));
        let (decoded, used) = decode(&buf).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn encode_decode_interval_key_with_empty_value() {
        let e = Entity::new(Key::interval(Range::new(10, 5000), b"frame".to_vec()), Vec::new());
        let mut buf = Vec::new();
        encode_into(&e, &mut buf);

        let (decoded, _) = decode(&buf).unwrap();
        assert_eq!(decoded.key.span(), Range::new(10, 5000));
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn corrupted_byte_fails_checksum() {
        let mut buf = Vec::new();
        encode_into(&entity(1, b"k", b"value"), &mut buf);
        let last_value_byte = buf.len() - CRC_SIZE - 1;
        buf[last_value_byte] ^= 0xFF;

        let err = decode(&buf).unwrap_err();
        assert!(err.contains("checksum mismatch"));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut buf = Vec::new();
        encode_into(&entity(1, b"k", b"value"), &mut buf);
        buf.truncate(buf.len() - 3);

        assert!(decode(&buf).unwrap_err().contains("truncated"));
    }
}
