//! 列类型与值
//!
//! [`DataType`] 是列类型能力的唯一入口：负责把一列值按本地二进制格式
//! 写入字节流、从字节流读回，以及在 `columns.txt` 中的文本表示。
//!
//! 本地二进制格式：
//! - 定长数值：小端
//! - String：LEB128 变长长度 + 原始字节
//! - Date：u16 天数
//! - Array：单值序列化时为 `长度 + 元素`；列存储时拆成独立的长度流与元素流
//!   （由 writer / reader 负责拆分）

use std::io::{BufRead, Read, Write};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::{MergeTreeError, Result};

/// 单个 String 值的长度上限
pub const MAX_STRING_SIZE: u64 = 1 << 30;

/// 列类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Int8, Int16, Int32, Int64,
    UInt8, UInt16, UInt32, UInt64,
    Float32, Float64,
    /// 变长字节串
    String,
    /// 自 1970-01-01 起的天数
    Date,
    Array(Box<DataType>),
}

impl DataType {
    /// 固定字节宽度；变长类型返回 None
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Int8  | Self::UInt8                => Some(1),
            Self::Int16 | Self::UInt16 | Self::Date  => Some(2),
            Self::Int32 | Self::UInt32 | Self::Float32 => Some(4),
            Self::Int64 | Self::UInt64 | Self::Float64 => Some(8),
            Self::String | Self::Array(_)            => None,
        }
    }

    pub fn is_array(&self) -> bool { matches!(self, Self::Array(_)) }

    pub fn nested_type(&self) -> Option<&DataType> {
        match self { Self::Array(t) => Some(t), _ => None }
    }

    /// 类型的默认值（缺失列补齐时使用）
    pub fn default_value(&self) -> Value {
        match self {
            Self::Int8     => Value::Int8(0),
            Self::Int16    => Value::Int16(0),
            Self::Int32    => Value::Int32(0),
            Self::Int64    => Value::Int64(0),
            Self::UInt8    => Value::UInt8(0),
            Self::UInt16   => Value::UInt16(0),
            Self::UInt32   => Value::UInt32(0),
            Self::UInt64   => Value::UInt64(0),
            Self::Float32  => Value::Float32(0.0),
            Self::Float64  => Value::Float64(0.0),
            Self::String   => Value::Bytes(Vec::new()),
            Self::Date     => Value::Date(0),
            Self::Array(_) => Value::Array(Vec::new()),
        }
    }

    /// 值是否属于该类型
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int8, Value::Int8(_))
            | (Self::Int16, Value::Int16(_))
            | (Self::Int32, Value::Int32(_))
            | (Self::Int64, Value::Int64(_))
            | (Self::UInt8, Value::UInt8(_))
            | (Self::UInt16, Value::UInt16(_))
            | (Self::UInt32, Value::UInt32(_))
            | (Self::UInt64, Value::UInt64(_))
            | (Self::Float32, Value::Float32(_))
            | (Self::Float64, Value::Float64(_))
            | (Self::String, Value::Bytes(_))
            | (Self::Date, Value::Date(_)) => true,
            (Self::Array(nested), Value::Array(items)) => items.iter().all(|v| nested.accepts(v)),
            _ => false,
        }
    }

    // ── 单值序列化 ────────────────────────────────────────────────────────────

    pub fn serialize_binary<W: Write>(&self, value: &Value, out: &mut W) -> Result<()> {
        match (self, value) {
            (Self::Int8, Value::Int8(x))       => out.write_i8(*x)?,
            (Self::Int16, Value::Int16(x))     => out.write_i16::<LittleEndian>(*x)?,
            (Self::Int32, Value::Int32(x))     => out.write_i32::<LittleEndian>(*x)?,
            (Self::Int64, Value::Int64(x))     => out.write_i64::<LittleEndian>(*x)?,
            (Self::UInt8, Value::UInt8(x))     => out.write_u8(*x)?,
            (Self::UInt16, Value::UInt16(x))   => out.write_u16::<LittleEndian>(*x)?,
            (Self::UInt32, Value::UInt32(x))   => out.write_u32::<LittleEndian>(*x)?,
            (Self::UInt64, Value::UInt64(x))   => out.write_u64::<LittleEndian>(*x)?,
            (Self::Float32, Value::Float32(x)) => out.write_f32::<LittleEndian>(*x)?,
            (Self::Float64, Value::Float64(x)) => out.write_f64::<LittleEndian>(*x)?,
            (Self::Date, Value::Date(x))       => out.write_u16::<LittleEndian>(*x)?,
            (Self::String, Value::Bytes(b))    => {
                write_var_uint(b.len() as u64, out)?;
                out.write_all(b)?;
            }
            (Self::Array(nested), Value::Array(items)) => {
                write_var_uint(items.len() as u64, out)?;
                for item in items {
                    nested.serialize_binary(item, out)?;
                }
            }
            _ => {
                return Err(MergeTreeError::Encoding(
                    format!("value {value} does not match type {self}"),
                ))
            }
        }
        Ok(())
    }

    pub fn deserialize_binary<R: Read>(&self, r: &mut R) -> Result<Value> {
        let v = match self {
            Self::Int8    => Value::Int8(r.read_i8()?),
            Self::Int16   => Value::Int16(r.read_i16::<LittleEndian>()?),
            Self::Int32   => Value::Int32(r.read_i32::<LittleEndian>()?),
            Self::Int64   => Value::Int64(r.read_i64::<LittleEndian>()?),
            Self::UInt8   => Value::UInt8(r.read_u8()?),
            Self::UInt16  => Value::UInt16(r.read_u16::<LittleEndian>()?),
            Self::UInt32  => Value::UInt32(r.read_u32::<LittleEndian>()?),
            Self::UInt64  => Value::UInt64(r.read_u64::<LittleEndian>()?),
            Self::Float32 => Value::Float32(r.read_f32::<LittleEndian>()?),
            Self::Float64 => Value::Float64(r.read_f64::<LittleEndian>()?),
            Self::Date    => Value::Date(r.read_u16::<LittleEndian>()?),
            Self::String  => {
                let len = read_var_uint(r)?;
                if len > MAX_STRING_SIZE {
                    return Err(MergeTreeError::format("String", format!("string size {len} is too large")));
                }
                let mut buf = Vec::with_capacity((len as usize).min(4096));
                r.by_ref().take(len).read_to_end(&mut buf)?;
                if buf.len() as u64 != len {
                    return Err(MergeTreeError::format(
                        "String",
                        format!("string truncated: {} of {len} bytes", buf.len()),
                    ));
                }
                Value::Bytes(buf)
            }
            Self::Array(nested) => {
                let len = read_var_uint(r)? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(nested.deserialize_binary(r)?);
                }
                Value::Array(items)
            }
        };
        Ok(v)
    }

    // ── 批量序列化（列流） ────────────────────────────────────────────────────

    pub fn serialize_bulk<W: Write>(&self, values: &[Value], out: &mut W) -> Result<()> {
        for v in values {
            self.serialize_binary(v, out)?;
        }
        Ok(())
    }

    /// 读取至多 `limit` 个值；流结束时提前返回（最后一个 granule 可能不满）
    pub fn deserialize_bulk<R: BufRead>(&self, r: &mut R, limit: usize) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(limit.min(65_536));
        while out.len() < limit {
            if r.fill_buf()?.is_empty() {
                break;
            }
            out.push(self.deserialize_binary(r)?);
        }
        Ok(out)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int8     => write!(f, "Int8"),
            Self::Int16    => write!(f, "Int16"),
            Self::Int32    => write!(f, "Int32"),
            Self::Int64    => write!(f, "Int64"),
            Self::UInt8    => write!(f, "UInt8"),
            Self::UInt16   => write!(f, "UInt16"),
            Self::UInt32   => write!(f, "UInt32"),
            Self::UInt64   => write!(f, "UInt64"),
            Self::Float32  => write!(f, "Float32"),
            Self::Float64  => write!(f, "Float64"),
            Self::String   => write!(f, "String"),
            Self::Date     => write!(f, "Date"),
            Self::Array(t) => write!(f, "Array({t})"),
        }
    }
}

impl FromStr for DataType {
    type Err = MergeTreeError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix("Array(").and_then(|r| r.strip_suffix(')')) {
            return Ok(Self::Array(Box::new(inner.parse()?)));
        }
        let t = match s {
            "Int8"    => Self::Int8,
            "Int16"   => Self::Int16,
            "Int32"   => Self::Int32,
            "Int64"   => Self::Int64,
            "UInt8"   => Self::UInt8,
            "UInt16"  => Self::UInt16,
            "UInt32"  => Self::UInt32,
            "UInt64"  => Self::UInt64,
            "Float32" => Self::Float32,
            "Float64" => Self::Float64,
            "String"  => Self::String,
            "Date"    => Self::Date,
            other     => return Err(MergeTreeError::format("data type", other)),
        };
        Ok(t)
    }
}

// ── 值 ────────────────────────────────────────────────────────────────────────

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    Date(u16),
    Array(Vec<Value>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)   => Some(*v as i64),
            Self::Int16(v)  => Some(*v as i64),
            Self::Int32(v)  => Some(*v as i64),
            Self::Int64(v)  => Some(*v),
            Self::UInt8(v)  => Some(*v as i64),
            Self::UInt16(v) => Some(*v as i64),
            Self::UInt32(v) => Some(*v as i64),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            Self::Date(v)   => Some(*v as i64),
            _ => None,
        }
    }
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b), _ => None }
    }
    pub fn as_array(&self) -> Option<&[Value]> {
        match self { Self::Array(a) => Some(a), _ => None }
    }
    /// 过滤条件的真值：非零数值为真
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Float32(v) => *v != 0.0,
            Self::Float64(v) => *v != 0.0,
            Self::Bytes(b)   => !b.is_empty(),
            Self::Array(a)   => !a.is_empty(),
            other            => other.as_i64().map(|v| v != 0).unwrap_or(true),
        }
    }
    /// 索引哈希用的稳定字节表示
    pub fn hash_key(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b)   => b.clone(),
            Self::Float32(v) => v.to_bits().to_le_bytes().to_vec(),
            Self::Float64(v) => v.to_bits().to_le_bytes().to_vec(),
            Self::Array(a)   => a.iter().flat_map(|v| v.hash_key()).collect(),
            other            => other.as_i64().unwrap_or(i64::MAX).to_le_bytes().to_vec(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Bytes(s.as_bytes().to_vec()) }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::UInt8(v)   => write!(f, "{v}"),
            Self::UInt16(v)  => write!(f, "{v}"),
            Self::UInt32(v)  => write!(f, "{v}"),
            Self::UInt64(v)  => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bytes(b)   => write!(f, "'{}'", String::from_utf8_lossy(b)),
            Self::Date(v)    => write!(f, "Date({v})"),
            Self::Array(a)   => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 { write!(f, ",")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

// ── LEB128 ────────────────────────────────────────────────────────────────────

pub fn write_var_uint<W: Write>(mut x: u64, out: &mut W) -> Result<()> {
    loop {
        let byte = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            out.write_u8(byte)?;
            return Ok(());
        }
        out.write_u8(byte | 0x80)?;
    }
}

pub fn read_var_uint<R: Read>(r: &mut R) -> Result<u64> {
    let mut x: u64 = 0;
    for i in 0..10 {
        let byte = r.read_u8()?;
        x |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(x);
        }
    }
    Err(MergeTreeError::Encoding("varint is too long".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn type_names_parse_back() {
        for name in ["Int8", "UInt64", "Float32", "String", "Date", "Array(Array(UInt16))"] {
            let t: DataType = name.parse().unwrap();
            assert_eq!(t.to_string(), name);
        }
        assert!("Decimal(10,2)".parse::<DataType>().is_err());
    }

    #[test]
    fn bulk_read_stops_at_end_of_stream() {
        let mut buf = Vec::new();
        let values = vec![Value::from("a"), Value::from(""), Value::from("xyz")];
        DataType::String.serialize_bulk(&values, &mut buf).unwrap();

        let mut cur = Cursor::new(buf);
        let read = DataType::String.deserialize_bulk(&mut cur, 10).unwrap();
        assert_eq!(read, values);
    }

    #[test]
    fn mismatched_value_is_rejected() {
        let mut buf = Vec::new();
        let err = DataType::Int32.serialize_binary(&Value::Int64(1), &mut buf).unwrap_err();
        assert!(matches!(err, MergeTreeError::Encoding(_)));
    }

    #[test]
    fn corrupt_string_length_is_a_format_error() {
        let mut huge = Vec::new();
        write_var_uint(u64::MAX >> 1, &mut huge).unwrap();
        huge.extend_from_slice(b"abc");
        let err = DataType::String.deserialize_binary(&mut huge.as_slice()).unwrap_err();
        assert!(matches!(err, MergeTreeError::Format { .. }), "{err}");

        let mut short = Vec::new();
        write_var_uint(10, &mut short).unwrap();
        short.extend_from_slice(b"abc");
        let err = DataType::String.deserialize_binary(&mut short.as_slice()).unwrap_err();
        assert!(matches!(err, MergeTreeError::Format { .. }), "{err}");
    }

    #[test]
    fn truncated_value_is_an_error() {
        let mut cur = Cursor::new(vec![1u8, 2, 3]);
        assert!(DataType::Int64.deserialize_bulk(&mut cur, 1).is_err());
    }

    #[test]
    fn varint_large_values() {
        let mut buf = Vec::new();
        write_var_uint(u64::MAX, &mut buf).unwrap();
        assert_eq!(buf.len(), 10);
        assert_eq!(read_var_uint(&mut Cursor::new(buf)).unwrap(), u64::MAX);
    }
}
