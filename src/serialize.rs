//! Length-prefixed framing primitives shared by the named-cell directory,
//! the allocator's free-list blob, and the B+Tree node/codec layers.
//!
//! All multi-byte integers are big-endian, per the external wire format.

use std::io::{Read, Write};

use crate::error::Result;

/// Write a `u64` length-prefixed byte string: `u64 BE len || bytes`.
pub fn write_bytes<W: Write>(out: &mut W, data: &[u8]) -> Result<()> {
    out.write_all(&(data.len() as u64).to_be_bytes())?;
    out.write_all(data)?;
    Ok(())
}

/// Read a `u64` length-prefixed byte string written by [`write_bytes`].
pub fn read_bytes<R: Read>(input: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    input.read_exact(&mut len_buf)?;
    let len = u64::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write a list of byte strings: `u64 BE count || (u32 BE size || bytes)*count`.
pub fn write_bytes_list<W: Write, I, B>(out: &mut W, items: I) -> Result<()>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let items: Vec<B> = items.into_iter().collect();
    out.write_all(&(items.len() as u64).to_be_bytes())?;
    for item in &items {
        let bytes = item.as_ref();
        out.write_all(&(bytes.len() as u32).to_be_bytes())?;
        out.write_all(bytes)?;
    }
    Ok(())
}

/// Read a list of byte strings written by [`write_bytes_list`].
pub fn read_bytes_list<R: Read>(input: &mut R) -> Result<Vec<Vec<u8>>> {
    let mut count_buf = [0u8; 8];
    input.read_exact(&mut count_buf)?;
    let count = u64::from_be_bytes(count_buf) as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let mut size_buf = [0u8; 4];
        input.read_exact(&mut size_buf)?;
        let size = u32::from_be_bytes(size_buf) as usize;
        let mut buf = vec![0u8; size];
        input.read_exact(&mut buf)?;
        items.push(buf);
    }
    Ok(items)
}

/// Write a list of fixed-size big-endian `u64`s: `u64 BE count || (u64 BE)*count`.
pub fn write_u64_list<W: Write>(out: &mut W, items: &[u64]) -> Result<()> {
    out.write_all(&(items.len() as u64).to_be_bytes())?;
    for item in items {
        out.write_all(&item.to_be_bytes())?;
    }
    Ok(())
}

/// Read a list of `u64`s written by [`write_u64_list`].
pub fn read_u64_list<R: Read>(input: &mut R) -> Result<Vec<u64>> {
    let mut count_buf = [0u8; 8];
    input.read_exact(&mut count_buf)?;
    let count = u64::from_be_bytes(count_buf) as usize;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let mut buf = [0u8; 8];
        input.read_exact(&mut buf)?;
        items.push(u64::from_be_bytes(buf));
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, b"hello world").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_bytes(&mut cur).unwrap(), b"hello world");
    }

    #[test]
    fn bytes_list_round_trip() {
        let items: Vec<&[u8]> = vec![b"a", b"bb", b"", b"dddd"];
        let mut buf = Vec::new();
        write_bytes_list(&mut buf, items.clone()).unwrap();
        let mut cur = Cursor::new(buf);
        let read = read_bytes_list(&mut cur).unwrap();
        assert_eq!(read, items.iter().map(|b| b.to_vec()).collect::<Vec<_>>());
    }

    #[test]
    fn u64_list_round_trip() {
        let items = vec![1u64, 2, 3, u64::MAX, 0];
        let mut buf = Vec::new();
        write_u64_list(&mut buf, &items).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_u64_list(&mut cur).unwrap(), items);
    }

    #[test]
    fn empty_list_round_trip() {
        let mut buf = Vec::new();
        write_u64_list(&mut buf, &[]).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_u64_list(&mut cur).unwrap(), Vec::<u64>::new());
    }
}
