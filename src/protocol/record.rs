//! Extensible record codec
//!
//! Wire layout of a record:
//! ┌───────────────────────────┬─────────┬─────────┬─────┐
//! │ str bitmap (4-bit tags)   │ value 0 │ value 1 │ ... │
//! └───────────────────────────┴─────────┴─────────┴─────┘
//!
//! Tag of field `i` sits in bitmap byte `i >> 1`, low nibble first. Tag 0
//! ends the record. Fields are only ever appended, so a reader that looks
//! fields up by index keeps working when a newer writer adds more of them.

use super::encoder::{DecodeError, Decoder, Encoder};

pub const MAX_DEPTH: usize = 100;
/// First extended type number available to typed chunks.
pub const EXTENDED_FIRST_TYPE: u64 = 16;
const VECTOR_OFFSET: u8 = 6;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    End = 0,
    Uint = 1,
    Sint = 2,
    Float = 3,
    String = 4,
    TypedChunk = 5,
    Struct = 6,
    UintVec = 7,
    SintVec = 8,
    FloatVec = 9,
    StringVec = 10,
    TypedChunkVec = 11,
    StructVec = 12,
}

impl FieldType {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::End),
            1 => Some(Self::Uint),
            2 => Some(Self::Sint),
            3 => Some(Self::Float),
            4 => Some(Self::String),
            5 => Some(Self::TypedChunk),
            6 => Some(Self::Struct),
            7 => Some(Self::UintVec),
            8 => Some(Self::SintVec),
            9 => Some(Self::FloatVec),
            10 => Some(Self::StringVec),
            11 => Some(Self::TypedChunkVec),
            12 => Some(Self::StructVec),
            _ => None,
        }
    }

    pub fn is_vector(self) -> bool {
        self as u8 > VECTOR_OFFSET
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Uint(u64),
    Sint(i64),
    Float(f64),
    Str(Vec<u8>),
    TypedChunk { kind: u64, data: Vec<u8> },
    Record(Record),
    UintVec(Vec<u64>),
    SintVec(Vec<i64>),
    FloatVec(Vec<f64>),
    StrVec(Vec<Vec<u8>>),
    /// The extended type is written once for the whole vector.
    TypedChunkVec { kind: u64, items: Vec<Vec<u8>> },
    RecordVec(Vec<Record>),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Uint(_) => FieldType::Uint,
            Field::Sint(_) => FieldType::Sint,
            Field::Float(_) => FieldType::Float,
            Field::Str(_) => FieldType::String,
            Field::TypedChunk { .. } => FieldType::TypedChunk,
            Field::Record(_) => FieldType::Struct,
            Field::UintVec(_) => FieldType::UintVec,
            Field::SintVec(_) => FieldType::SintVec,
            Field::FloatVec(_) => FieldType::FloatVec,
            Field::StrVec(_) => FieldType::StringVec,
            Field::TypedChunkVec { .. } => FieldType::TypedChunkVec,
            Field::RecordVec(_) => FieldType::StructVec,
        }
    }

    fn encode_value(&self, enc: &mut Encoder) {
        match self {
            Field::Uint(v) => {
                enc.put_uint(*v);
            }
            Field::Sint(v) => {
                enc.put_sint(*v);
            }
            Field::Float(v) => {
                enc.put_float(*v);
            }
            Field::Str(s) => {
                enc.put_str(s);
            }
            Field::TypedChunk { kind, data } => {
                enc.put_uint(*kind).put_str(data);
            }
            Field::Record(r) => r.encode(enc),
            Field::UintVec(v) => {
                enc.put_uint(v.len() as u64);
                v.iter().for_each(|x| {
                    enc.put_uint(*x);
                });
            }
            Field::SintVec(v) => {
                enc.put_uint(v.len() as u64);
                v.iter().for_each(|x| {
                    enc.put_sint(*x);
                });
            }
            Field::FloatVec(v) => {
                enc.put_uint(v.len() as u64);
                v.iter().for_each(|x| {
                    enc.put_float(*x);
                });
            }
            Field::StrVec(v) => {
                enc.put_uint(v.len() as u64);
                v.iter().for_each(|x| {
                    enc.put_str(x);
                });
            }
            Field::TypedChunkVec { kind, items } => {
                enc.put_uint(*kind).put_uint(items.len() as u64);
                items.iter().for_each(|x| {
                    enc.put_str(x);
                });
            }
            Field::RecordVec(v) => {
                enc.put_uint(v.len() as u64);
                v.iter().for_each(|r| r.encode(enc));
            }
        }
    }
}

/// Ordered, append-only list of typed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<Field>,
    partial: bool,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn with(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Unsigned field at `index`; absent or differently typed reads as None.
    pub fn uint(&self, index: usize) -> Option<u64> {
        match self.fields.get(index) {
            Some(Field::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn record(&self, index: usize) -> Option<&Record> {
        match self.fields.get(index) {
            Some(Field::Record(r)) => Some(r),
            _ => None,
        }
    }

    /// True when decoding stopped at a tag this codec does not know. The
    /// fields before it are intact; anything after the record in the same
    /// buffer cannot be located.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn encode(&self, enc: &mut Encoder) {
        let n = self.fields.len();
        let mut bitmap = vec![0u8; (n + 2) / 2];
        for (i, field) in self.fields.iter().enumerate() {
            bitmap[i >> 1] |= (field.field_type() as u8) << (4 * (i & 1));
        }
        enc.put_str(&bitmap);
        for field in &self.fields {
            field.encode_value(enc);
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        decode_record(dec, 0)
    }
}

fn decode_record(dec: &mut Decoder<'_>, depth: usize) -> Result<Record, DecodeError> {
    if depth >= MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }
    let bitmap = dec.bytes()?;
    let mut record = Record::new();
    for i in 0..bitmap.len() * 2 {
        let tag = (bitmap[i >> 1] >> (4 * (i & 1))) & 0xf;
        match FieldType::from_u8(tag) {
            Some(FieldType::End) => return Ok(record),
            Some(t) => {
                let field = decode_value(dec, t, depth + 1)?;
                record.fields.push(field);
            }
            None => {
                record.partial = true;
                return Ok(record);
            }
        }
    }
    Err(DecodeError::Unterminated)
}

/// Element count of a vector, capped by what the buffer could hold.
fn count(dec: &mut Decoder<'_>) -> Result<(u64, usize), DecodeError> {
    let n = dec.uint()?;
    if n > dec.remaining() as u64 {
        return Err(DecodeError::BadLength(n));
    }
    Ok((n, n as usize))
}

fn decode_value(dec: &mut Decoder<'_>, t: FieldType, depth: usize) -> Result<Field, DecodeError> {
    let field = match t {
        FieldType::End => return Err(DecodeError::Invalid("end tag has no value")),
        FieldType::Uint => Field::Uint(dec.uint()?),
        FieldType::Sint => Field::Sint(dec.sint()?),
        FieldType::Float => Field::Float(dec.float()?),
        FieldType::String => Field::Str(dec.bytes()?.to_vec()),
        FieldType::TypedChunk => {
            let kind = dec.uint()?;
            Field::TypedChunk {
                kind,
                data: dec.bytes()?.to_vec(),
            }
        }
        FieldType::Struct => Field::Record(decode_record(dec, depth)?),
        FieldType::UintVec => {
            let (n, cap) = count(dec)?;
            let mut v = Vec::with_capacity(cap);
            for _ in 0..n {
                v.push(dec.uint()?);
            }
            Field::UintVec(v)
        }
        FieldType::SintVec => {
            let (n, cap) = count(dec)?;
            let mut v = Vec::with_capacity(cap);
            for _ in 0..n {
                v.push(dec.sint()?);
            }
            Field::SintVec(v)
        }
        FieldType::FloatVec => {
            let (n, cap) = count(dec)?;
            let mut v = Vec::with_capacity(cap);
            for _ in 0..n {
                v.push(dec.float()?);
            }
            Field::FloatVec(v)
        }
        FieldType::StringVec => {
            let (n, cap) = count(dec)?;
            let mut v = Vec::with_capacity(cap);
            for _ in 0..n {
                v.push(dec.bytes()?.to_vec());
            }
            Field::StrVec(v)
        }
        FieldType::TypedChunkVec => {
            let kind = dec.uint()?;
            let (n, cap) = count(dec)?;
            let mut items = Vec::with_capacity(cap);
            for _ in 0..n {
                items.push(dec.bytes()?.to_vec());
            }
            Field::TypedChunkVec { kind, items }
        }
        FieldType::StructVec => {
            let (n, cap) = count(dec)?;
            let mut v = Vec::with_capacity(cap);
            for _ in 0..n {
                v.push(decode_record(dec, depth)?);
            }
            Field::RecordVec(v)
        }
    };
    Ok(field)
}
