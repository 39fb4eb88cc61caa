//! Relocation of type annotations attached to a `Code` attribute
//! (JVMS 4.7.20). Only the offset-bearing targets change; the layout and
//! every other byte are preserved.

use anyhow::Result;

use crate::classfile::code::OffsetMap;
use crate::classfile::reader::{read_u8, read_u16, skip_bytes};

pub(crate) fn relocate(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut out = info.to_vec();
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)?;
    for _ in 0..count {
        relocate_target(info, &mut out, &mut offset, map)?;
        let path_length = read_u8(info, &mut offset)?;
        skip_bytes(info, &mut offset, path_length as usize * 2)?;
        skip_annotation(info, &mut offset)?;
    }
    if offset != info.len() {
        anyhow::bail!("{} trailing bytes in type annotations", info.len() - offset);
    }
    Ok(out)
}

fn relocate_target(
    info: &[u8],
    out: &mut [u8],
    offset: &mut usize,
    map: &OffsetMap,
) -> Result<()> {
    let target_type = read_u8(info, offset)?;
    match target_type {
        0x00 | 0x01 | 0x16 => skip_bytes(info, offset, 1)?,
        0x10 | 0x17 | 0x42 => skip_bytes(info, offset, 2)?,
        0x11 | 0x12 => skip_bytes(info, offset, 2)?,
        0x13..=0x15 => {}
        // localvar_target
        0x40 | 0x41 => {
            let table_length = read_u16(info, offset)?;
            for _ in 0..table_length {
                let position = *offset;
                let start_pc = read_u16(info, offset)?;
                let length = read_u16(info, offset)?;
                skip_bytes(info, offset, 2)?;
                let (new_start, new_length) = map.map_range(start_pc, length)?;
                patch_u16(out, position, new_start);
                patch_u16(out, position + 2, new_length);
            }
        }
        // offset_target
        0x43..=0x46 => relocate_offset(info, out, offset, map)?,
        // type_argument_target
        0x47..=0x4b => {
            relocate_offset(info, out, offset, map)?;
            skip_bytes(info, offset, 1)?;
        }
        _ => anyhow::bail!("invalid type annotation target type 0x{target_type:02x}"),
    }
    Ok(())
}

fn relocate_offset(info: &[u8], out: &mut [u8], offset: &mut usize, map: &OffsetMap) -> Result<()> {
    let position = *offset;
    let old = read_u16(info, offset)?;
    patch_u16(out, position, map.map_u16(old)?);
    Ok(())
}

fn patch_u16(out: &mut [u8], position: usize, value: u16) {
    out[position..position + 2].copy_from_slice(&value.to_be_bytes());
}

fn skip_annotation(info: &[u8], offset: &mut usize) -> Result<()> {
    skip_bytes(info, offset, 2)?;
    let pairs = read_u16(info, offset)?;
    for _ in 0..pairs {
        skip_bytes(info, offset, 2)?;
        skip_element_value(info, offset)?;
    }
    Ok(())
}

fn skip_element_value(info: &[u8], offset: &mut usize) -> Result<()> {
    let tag = read_u8(info, offset)?;
    match tag {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            skip_bytes(info, offset, 2)?
        }
        b'e' => skip_bytes(info, offset, 4)?,
        b'@' => skip_annotation(info, offset)?,
        b'[' => {
            let count = read_u16(info, offset)?;
            for _ in 0..count {
                skip_element_value(info, offset)?;
            }
        }
        _ => anyhow::bail!("invalid element value tag 0x{tag:02x}"),
    }
    Ok(())
}
