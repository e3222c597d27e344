//! Fixed-width integer access to fragment files
//!
//! Each helper returns `Ok(None)` when the file does not have exactly the
//! expected width, so callers can turn a size mismatch into a validity verdict
//! while real I/O failures still propagate.

use crate::core::fragment::Fragment;
use crate::error::Result;
use byteorder::ByteOrder;

pub use byteorder::{BigEndian, LittleEndian};

/// Read the whole fragment if it is exactly `width` bytes long
pub fn read_exact(fragment: &Fragment, width: usize) -> Result<Option<Vec<u8>>> {
    let bytes = fragment.read()?;
    Ok((bytes.len() == width).then_some(bytes))
}

pub fn read_u8(fragment: &Fragment) -> Result<Option<u8>> {
    Ok(read_exact(fragment, 1)?.map(|b| b[0]))
}

pub fn read_u16<B: ByteOrder>(fragment: &Fragment) -> Result<Option<u16>> {
    Ok(read_exact(fragment, 2)?.map(|b| B::read_u16(&b)))
}

pub fn read_i16<B: ByteOrder>(fragment: &Fragment) -> Result<Option<i16>> {
    Ok(read_exact(fragment, 2)?.map(|b| B::read_i16(&b)))
}

pub fn read_u32<B: ByteOrder>(fragment: &Fragment) -> Result<Option<u32>> {
    Ok(read_exact(fragment, 4)?.map(|b| B::read_u32(&b)))
}

pub fn read_i32<B: ByteOrder>(fragment: &Fragment) -> Result<Option<i32>> {
    Ok(read_exact(fragment, 4)?.map(|b| B::read_i32(&b)))
}

pub fn read_u64<B: ByteOrder>(fragment: &Fragment) -> Result<Option<u64>> {
    Ok(read_exact(fragment, 8)?.map(|b| B::read_u64(&b)))
}

pub fn write_u32<B: ByteOrder>(fragment: &Fragment, value: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    B::write_u32(&mut buf, value);
    fragment.write(&buf)?;
    Ok(())
}

pub fn write_u64<B: ByteOrder>(fragment: &Fragment, value: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    B::write_u64(&mut buf, value);
    fragment.write(&buf)?;
    Ok(())
}

/// Total size of `fragments`
pub fn total_size(fragments: &[Fragment]) -> Result<u64> {
    let mut total = 0u64;
    for fragment in fragments {
        total += fragment.size()?;
    }
    Ok(total)
}

/// Bytes as printable text, with non-ASCII shown as escapes
pub fn ascii_lossy(bytes: &[u8]) -> String {
    bytes.iter().flat_map(|b| std::ascii::escape_default(*b)).map(char::from).collect()
}
