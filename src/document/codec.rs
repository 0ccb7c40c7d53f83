use super::oid::ObjectId;
use super::value::{Document, Value};
use crate::errors::DbError;

// Wire form, little-endian throughout: u32 field count, then per field
// { u8 tag, u16 name length, name bytes, payload }. Strings, binaries
// and arrays carry a u32 length/count; embedded documents recurse.

/// Encodes a document to its binary wire form.
#[must_use]
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, doc);
    buf
}

/// Decodes a document from its binary wire form.
/// # Errors
/// Returns `Corruption` on truncated or malformed input.
pub fn decode_document(bytes: &[u8]) -> Result<Document, DbError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let doc = read_document(&mut reader)?;
    if reader.pos != bytes.len() {
        return Err(DbError::Corruption(format!(
            "trailing {} bytes after document",
            bytes.len() - reader.pos
        )));
    }
    Ok(doc)
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    buf.extend_from_slice(&(doc.len() as u32).to_le_bytes());
    for (name, value) in doc.iter() {
        buf.push(value.tag());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        write_value(buf, value);
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => buf.push(u8::from(*b)),
        Value::Int32(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Int64(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Double(f) => buf.extend_from_slice(&f.to_le_bytes()),
        Value::String(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
            buf.extend_from_slice(b);
        }
        Value::ObjectId(id) => buf.extend_from_slice(id.bytes()),
        Value::Timestamp(t) => buf.extend_from_slice(&t.to_le_bytes()),
        Value::Document(d) => write_document(buf, d),
        Value::Array(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                buf.push(item.tag());
                write_value(buf, item);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::Corruption("truncated document".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DbError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DbError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DbError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, DbError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn f64(&mut self) -> Result<f64, DbError> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

fn read_document(r: &mut Reader<'_>) -> Result<Document, DbError> {
    let count = r.u32()? as usize;
    let mut doc = Document::new();
    for _ in 0..count {
        let tag = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = std::str::from_utf8(r.take(name_len)?)
            .map_err(|_| DbError::Corruption("field name is not UTF-8".into()))?
            .to_string();
        let value = read_value(r, tag)?;
        doc.set(name, value);
    }
    Ok(doc)
}

fn read_value(r: &mut Reader<'_>, tag: u8) -> Result<Value, DbError> {
    Ok(match tag {
        0 => Value::Null,
        1 => Value::Bool(r.u8()? != 0),
        2 => Value::Int32(r.i32()?),
        3 => Value::Int64(r.i64()?),
        4 => Value::Double(r.f64()?),
        5 => {
            let len = r.u32()? as usize;
            let s = std::str::from_utf8(r.take(len)?)
                .map_err(|_| DbError::Corruption("string value is not UTF-8".into()))?;
            Value::String(s.to_string())
        }
        6 => {
            let len = r.u32()? as usize;
            Value::Binary(r.take(len)?.to_vec())
        }
        7 => {
            let raw = r.take(12)?;
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(raw);
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        8 => Value::Timestamp(r.i64()?),
        9 => Value::Document(read_document(r)?),
        10 => {
            let count = r.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let item_tag = r.u8()?;
                items.push(read_value(r, item_tag)?);
            }
            Value::Array(items)
        }
        other => return Err(DbError::Corruption(format!("unknown value tag {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let address = crate::doc! {
            "street" => Value::String("Storgata 1".into()),
            "zip" => Value::Int32(150),
        };
        crate::doc! {
            "_id" => Value::ObjectId(ObjectId::new()),
            "name" => Value::String("User 0".into()),
            "age" => Value::Int64(20),
            "score" => Value::Double(0.75),
            "active" => Value::Bool(true),
            "blob" => Value::Binary(vec![0, 1, 2, 255]),
            "joined" => Value::Timestamp(1_700_000_000_000),
            "address" => Value::Document(address),
            "tags" => Value::Array(vec![Value::String("a".into()), Value::Null, Value::Int32(7)]),
            "nothing" => Value::Null,
        }
    }

    #[test]
    fn round_trip_preserves_fields_types_and_order() {
        let doc = sample();
        let decoded = decode_document(&encode_document(&doc)).unwrap();
        assert_eq!(decoded, doc);
        assert_eq!(decoded.keys(), doc.keys());
    }

    #[test]
    fn truncated_input_is_corruption() {
        let bytes = encode_document(&sample());
        let err = decode_document(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DbError::Corruption(_)));
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut bytes = encode_document(&crate::doc! { "x" => Value::Null });
        bytes[4] = 99; // first field tag
        assert!(matches!(decode_document(&bytes), Err(DbError::Corruption(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_document(&crate::doc! { "x" => Value::Int32(1) });
        bytes.push(0);
        assert!(matches!(decode_document(&bytes), Err(DbError::Corruption(_))));
    }
}
