//! Modified UTF-8 as stored in `CONSTANT_Utf8` entries (JVMS 4.4.7).
//!
//! Differs from standard UTF-8 in two ways: U+0000 is written as the two bytes
//! `C0 80`, and supplementary characters are written as a surrogate pair, each
//! half encoded as three bytes.

use anyhow::{Context, Result};

pub(crate) fn encode(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) as u8 & 0x1f));
                out.push(0x80 | (unit as u8 & 0x3f));
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) as u8 & 0x0f));
                out.push(0x80 | ((unit >> 6) as u8 & 0x3f));
                out.push(0x80 | (unit as u8 & 0x3f));
            }
        }
    }
    out
}

pub(crate) fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let first = bytes[index];
        let unit = if first & 0x80 == 0 {
            if first == 0 {
                anyhow::bail!("raw NUL byte in modified UTF-8");
            }
            index += 1;
            first as u16
        } else if first & 0xe0 == 0xc0 {
            let second = continuation(bytes, index + 1)?;
            index += 2;
            ((first as u16 & 0x1f) << 6) | second
        } else if first & 0xf0 == 0xe0 {
            let second = continuation(bytes, index + 1)?;
            let third = continuation(bytes, index + 2)?;
            index += 3;
            ((first as u16 & 0x0f) << 12) | (second << 6) | third
        } else {
            anyhow::bail!("invalid modified UTF-8 lead byte 0x{first:02x}");
        };
        units.push(unit);
    }
    String::from_utf16(&units).context("unpaired surrogate in modified UTF-8")
}

fn continuation(bytes: &[u8], index: usize) -> Result<u16> {
    let byte = *bytes
        .get(index)
        .context("truncated modified UTF-8 sequence")?;
    if byte & 0xc0 != 0x80 {
        anyhow::bail!("invalid modified UTF-8 continuation byte 0x{byte:02x}");
    }
    Ok(byte as u16 & 0x3f)
}
