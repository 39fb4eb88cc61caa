use anyhow::{Context, Result};

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    let byte = *data.get(*offset).context("class file out of bounds")?;
    *offset += 1;
    Ok(byte)
}

pub(crate) fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16> {
    let bytes = read_bytes(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_bytes<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *offset;
    let end = start.checked_add(len).context("class file length overflow")?;
    let slice = data.get(start..end).context("class file out of bounds")?;
    *offset = end;
    Ok(slice)
}

pub(crate) fn skip_bytes(data: &[u8], offset: &mut usize, len: usize) -> Result<()> {
    read_bytes(data, offset, len)?;
    Ok(())
}

pub(crate) fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Narrow a length or count to the u16 the class file format stores.
pub(crate) fn to_u16(value: usize, what: &str) -> Result<u16> {
    u16::try_from(value).with_context(|| format!("{what} exceeds 65535 ({value})"))
}

pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{what} exceeds u32 range ({value})"))
}
