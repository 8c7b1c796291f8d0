//! Key/value codecs selectable by the `key_type`/`value_type` strings
//! persisted in the B+Tree state blob.
//!
//! This crate supports only `"bytes"`, `"struct:FMT"`, and `"json"`; an
//! opaque host-language "pickle" codec is deliberately not supported. A
//! persisted `"pickle:*"` type string is refused with
//! [`Error::UnsupportedCodec`] rather than emulated.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::serialize::{read_bytes_list, write_bytes_list};

/// A codec capable of framing a *list* of `T` to/from a byte stream, and
/// naming itself with the type string that gets persisted alongside it.
/// Takes `&mut dyn Read`/`&mut dyn Write` rather than generic
/// parameters so a [`crate::mapping::provider::StoreProvider`] can hold
/// one behind a `Box<dyn Codec<T>>` chosen at open time.
pub trait Codec<T> {
    /// The string recorded as `key_type`/`value_type` in the state blob.
    fn type_name(&self) -> String;
    fn write_list(&self, out: &mut dyn Write, items: &[T]) -> Result<()>;
    fn read_list(&self, input: &mut dyn Read) -> Result<Vec<T>>;
}

/// `"bytes"`: a length-prefixed list of byte strings, the same framing
/// used for node payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn type_name(&self) -> String {
        "bytes".to_string()
    }

    fn write_list(&self, out: &mut dyn Write, items: &[Vec<u8>]) -> Result<()> {
        write_bytes_list(out, items.iter().map(|v| v.as_slice()))
    }

    fn read_list(&self, input: &mut dyn Read) -> Result<Vec<Vec<u8>>> {
        read_bytes_list(input)
    }
}

/// `"json"`: the whole list serialized as one UTF-8 JSON document, prefixed
/// by a big-endian `u64` byte length.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn type_name(&self) -> String {
        "json".to_string()
    }

    fn write_list(&self, out: &mut dyn Write, items: &[T]) -> Result<()> {
        let data = serde_json::to_vec(items)?;
        out.write_all(&(data.len() as u64).to_be_bytes())?;
        out.write_all(&data)?;
        Ok(())
    }

    fn read_list(&self, input: &mut dyn Read) -> Result<Vec<T>> {
        let mut len_buf = [0u8; 8];
        input.read_exact(&mut len_buf)?;
        let len = u64::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

/// A type with a fixed-width big-endian on-disk representation, usable
/// with [`StructCodec`]. `"struct:FMT"` names a closed family of
/// fixed-size records; this crate implements it for the primitive numeric
/// types rather than a full struct-format mini-language (see `DESIGN.md`).
pub trait FixedWidth: Sized + Copy {
    /// The `FMT` token recorded in `"struct:FMT"`.
    const FMT: &'static str;
    const SIZE: usize;
    fn write_be(&self, out: &mut [u8]);
    fn read_be(buf: &[u8]) -> Self;
}

macro_rules! impl_fixed_width_int {
    ($ty:ty, $fmt:literal) => {
        impl FixedWidth for $ty {
            const FMT: &'static str = $fmt;
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn write_be(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_be_bytes());
            }

            fn read_be(buf: &[u8]) -> Self {
                let mut b = [0u8; std::mem::size_of::<$ty>()];
                b.copy_from_slice(buf);
                <$ty>::from_be_bytes(b)
            }
        }
    };
}

impl_fixed_width_int!(u8, "u8");
impl_fixed_width_int!(u16, "u16");
impl_fixed_width_int!(u32, "u32");
impl_fixed_width_int!(u64, "u64");
impl_fixed_width_int!(i8, "i8");
impl_fixed_width_int!(i16, "i16");
impl_fixed_width_int!(i32, "i32");
impl_fixed_width_int!(i64, "i64");

impl FixedWidth for f32 {
    const FMT: &'static str = "f32";
    const SIZE: usize = 4;

    fn write_be(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn read_be(buf: &[u8]) -> Self {
        let mut b = [0u8; 4];
        b.copy_from_slice(buf);
        f32::from_be_bytes(b)
    }
}

impl FixedWidth for f64 {
    const FMT: &'static str = "f64";
    const SIZE: usize = 8;

    fn write_be(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn read_be(buf: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(buf);
        f64::from_be_bytes(b)
    }
}

/// `"struct:FMT"`: a count-prefixed list of fixed-width big-endian records.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructCodec<T> {
    _marker: std::marker::PhantomData<T>,
}

impl<T> StructCodec<T> {
    pub fn new() -> Self {
        StructCodec { _marker: std::marker::PhantomData }
    }
}

impl<T: FixedWidth> Codec<T> for StructCodec<T> {
    fn type_name(&self) -> String {
        format!("struct:{}", T::FMT)
    }

    fn write_list(&self, out: &mut dyn Write, items: &[T]) -> Result<()> {
        out.write_all(&(items.len() as u64).to_be_bytes())?;
        let mut buf = vec![0u8; T::SIZE];
        for item in items {
            item.write_be(&mut buf);
            out.write_all(&buf)?;
        }
        Ok(())
    }

    fn read_list(&self, input: &mut dyn Read) -> Result<Vec<T>> {
        let mut count_buf = [0u8; 8];
        input.read_exact(&mut count_buf)?;
        let count = u64::from_be_bytes(count_buf) as usize;
        let mut buf = vec![0u8; T::SIZE];
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            input.read_exact(&mut buf)?;
            items.push(T::read_be(&buf));
        }
        Ok(items)
    }
}

/// Parse a persisted `key_type`/`value_type` string far enough to validate
/// it against the codec this `Mapping` was opened with. `"pickle:*"` is
/// recognized-but-rejected; anything else unparseable is `InvalidType`.
pub fn check_type_name(persisted: &str, expected: &str) -> Result<()> {
    if persisted.starts_with("pickle") {
        return Err(Error::UnsupportedCodec(persisted.to_string()));
    }
    let recognized = persisted == "bytes"
        || persisted == "json"
        || persisted.starts_with("struct:");
    if !recognized {
        return Err(Error::InvalidType(persisted.to_string()));
    }
    if persisted != expected {
        return Err(Error::InvalidType(format!(
            "tree was persisted with codec {persisted:?}, but opened with {expected:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bytes_codec_round_trips() {
        let codec = BytesCodec;
        let items: Vec<Vec<u8>> = vec![b"a".to_vec(), b"bb".to_vec(), Vec::new()];
        let mut buf = Vec::new();
        codec.write_list(&mut buf, &items).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(codec.read_list(&mut cur).unwrap(), items);
    }

    #[test]
    fn json_codec_round_trips_strings() {
        let codec = JsonCodec;
        let items = vec!["10".to_string(), "1024".to_string(), "".to_string()];
        let mut buf = Vec::new();
        Codec::<String>::write_list(&codec, &mut buf, &items).unwrap();
        let mut cur = Cursor::new(buf);
        let read: Vec<String> = Codec::<String>::read_list(&codec, &mut cur).unwrap();
        assert_eq!(read, items);
    }

    #[test]
    fn struct_codec_round_trips_u64() {
        let codec: StructCodec<u64> = StructCodec::new();
        let items = vec![0u64, 1, u64::MAX, 12345];
        let mut buf = Vec::new();
        codec.write_list(&mut buf, &items).unwrap();
        assert_eq!(codec.type_name(), "struct:u64");
        let mut cur = Cursor::new(buf);
        assert_eq!(codec.read_list(&mut cur).unwrap(), items);
    }

    #[test]
    fn pickle_type_is_rejected() {
        assert!(matches!(
            check_type_name("pickle:4", "bytes"),
            Err(Error::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn unknown_type_is_invalid() {
        assert!(matches!(
            check_type_name("xml", "bytes"),
            Err(Error::InvalidType(_))
        ));
    }
}
