//! Low-level ISO-BMFF box building and parsing helpers.

use crate::errors::{RecorderError, Result};

pub(crate) const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

pub(crate) fn build_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let length = (8 + payload.len()) as u32;
    let mut buffer = Vec::with_capacity(payload.len() + 8);
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(typ);
    buffer.extend_from_slice(payload);
    buffer
}

pub(crate) fn build_full_box(typ: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 4);
    body.extend_from_slice(&((u32::from(version) << 24) | (flags & 0x00ff_ffff)).to_be_bytes());
    body.extend_from_slice(payload);
    build_box(typ, &body)
}

pub(crate) fn build_container(typ: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = children.concat();
    build_box(typ, &payload)
}

pub(crate) fn build_ftyp_box() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(&0x200_u32.to_be_bytes());
    payload.extend_from_slice(b"isomiso2mp41");
    build_box(b"ftyp", &payload)
}

/// Packed ISO 639-2/T code for "und".
pub(crate) fn undetermined_language() -> [u8; 2] {
    let packed: u16 =
        ((b'u' - 0x60) as u16) << 10 | ((b'n' - 0x60) as u16) << 5 | (b'd' - 0x60) as u16;
    packed.to_be_bytes()
}

/// Header of one box as found in a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxHeader {
    pub typ: [u8; 4],
    pub header_len: u64,
    /// Total size including the header; `None` means "extends to end of file"
    pub size: Option<u64>,
}

impl BoxHeader {
    /// Parse a header from the start of `data` (at least 8 bytes, 16 for large sizes).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let size32 = reader.u32()?;
        let typ = reader.fourcc()?;
        let (header_len, size) = match size32 {
            0 => (8, None),
            1 => (16, Some(reader.u64()?)),
            n => (8, Some(u64::from(n))),
        };
        if let Some(size) = size {
            if size < header_len {
                return Err(truncated(&typ));
            }
        }
        Ok(Self {
            typ,
            header_len,
            size,
        })
    }

    pub fn type_str(&self) -> String {
        String::from_utf8_lossy(&self.typ).into_owned()
    }
}

fn truncated(typ: &[u8; 4]) -> RecorderError {
    RecorderError::StreamIOFailure(format!(
        "Malformed or truncated '{}' box",
        String::from_utf8_lossy(typ)
    ))
}

/// Iterate the child boxes packed in `data`, yielding `(type, payload)`.
pub(crate) fn children<'a>(
    data: &'a [u8],
) -> impl Iterator<Item = Result<([u8; 4], &'a [u8])>> + 'a {
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.len() < 8 {
            return None;
        }
        let header = match BoxHeader::parse(rest) {
            Ok(h) => h,
            Err(e) => {
                rest = &[];
                return Some(Err(e));
            }
        };
        let total = header.size.unwrap_or(rest.len() as u64);
        if total > rest.len() as u64 {
            let err = truncated(&header.typ);
            rest = &[];
            return Some(Err(err));
        }
        let payload = &rest[header.header_len as usize..total as usize];
        rest = &rest[total as usize..];
        Some(Ok((header.typ, payload)))
    })
}

/// First child of the given type, if any.
pub(crate) fn find_child<'a>(data: &'a [u8], typ: &[u8; 4]) -> Result<Option<&'a [u8]>> {
    for child in children(data) {
        let (child_typ, payload) = child?;
        if &child_typ == typ {
            return Ok(Some(payload));
        }
    }
    Ok(None)
}

pub(crate) fn require_child<'a>(data: &'a [u8], typ: &[u8; 4], parent: &str) -> Result<&'a [u8]> {
    find_child(data, typ)?.ok_or_else(|| {
        RecorderError::StreamIOFailure(format!(
            "'{}' box missing from '{}'",
            String::from_utf8_lossy(typ),
            parent
        ))
    })
}

/// Big-endian cursor over a box payload.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(RecorderError::StreamIOFailure(format!(
                "Unexpected end of box data: wanted {} bytes, {} left",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    pub fn fourcc(&mut self) -> Result<[u8; 4]> {
        let b = self.bytes(4)?;
        Ok([b[0], b[1], b[2], b[3]])
    }

    /// Entry count of a table whose entries are `entry_size` bytes each,
    /// checked against what is left of the box.
    pub fn table_len(&mut self, entry_size: usize, table: &str) -> Result<usize> {
        let count = self.u32()? as usize;
        match count.checked_mul(entry_size) {
            Some(bytes) if bytes <= self.remaining() => Ok(count),
            _ => Err(RecorderError::StreamIOFailure(format!(
                "{} table claims {} entries but only {} bytes remain",
                table,
                count,
                self.remaining()
            ))),
        }
    }

    /// Version byte and 24-bit flags of a full box.
    pub fn full_box_header(&mut self) -> Result<(u8, u32)> {
        let word = self.u32()?;
        Ok(((word >> 24) as u8, word & 0x00ff_ffff))
    }

    /// A field that is 64-bit in version 1 boxes and 32-bit otherwise.
    pub fn versioned_u64(&mut self, version: u8) -> Result<u64> {
        if version == 1 {
            self.u64()
        } else {
            self.u32().map(u64::from)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_box_header() {
        let b = build_box(b"free", &[1, 2, 3]);
        assert_eq!(&b[0..4], &11u32.to_be_bytes());
        assert_eq!(&b[4..8], b"free");
        let header = BoxHeader::parse(&b).unwrap();
        assert_eq!(header.size, Some(11));
        assert_eq!(header.header_len, 8);
    }

    #[test]
    fn test_large_size_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&24u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 8]);
        let header = BoxHeader::parse(&data).unwrap();
        assert_eq!(header.header_len, 16);
        assert_eq!(header.size, Some(24));
        assert_eq!(header.type_str(), "mdat");
    }

    #[test]
    fn test_children_and_find() {
        let data = [build_box(b"aaaa", &[1]), build_box(b"bbbb", &[2, 3])].concat();
        let types: Vec<[u8; 4]> = children(&data).map(|c| c.unwrap().0).collect();
        assert_eq!(types, vec![*b"aaaa", *b"bbbb"]);
        assert_eq!(find_child(&data, b"bbbb").unwrap(), Some(&[2u8, 3][..]));
        assert!(require_child(&data, b"cccc", "test").is_err());
    }

    #[test]
    fn test_truncated_child_is_error() {
        let mut data = build_box(b"aaaa", &[1, 2, 3, 4]);
        data.truncate(10);
        assert!(children(&data).next().unwrap().is_err());
    }

    #[test]
    fn test_full_box_and_reader() {
        let b = build_full_box(b"mdhd", 1, 0x3, &42u64.to_be_bytes());
        let mut reader = ByteReader::new(&b[8..]);
        assert_eq!(reader.full_box_header().unwrap(), (1, 3));
        assert_eq!(reader.versioned_u64(1).unwrap(), 42);
        assert!(reader.u8().is_err());
    }

    #[test]
    fn test_language_code() {
        assert_eq!(undetermined_language(), [0x55, 0xc4]);
    }
}
