//! `StackMapTable` decoding and relocation (JVMS 4.7.4).
//!
//! Frames are stored as deltas from the previous frame, so moving code changes
//! every delta after the first insertion point and can push a compact
//! `same_frame` past the 63-byte delta it can express.

use anyhow::{Context, Result};

use crate::classfile::code::OffsetMap;
use crate::classfile::reader::{put_u8, put_u16, read_u8, read_u16, to_u16};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u16),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum FrameKind {
    Same { extended: bool },
    SameLocals1StackItem { stack: VerificationType, extended: bool },
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Frame {
    pub(crate) offset_delta: u16,
    pub(crate) kind: FrameKind,
}

pub(crate) fn parse(info: &[u8]) -> Result<Vec<Frame>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)?;
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let frame_type = read_u8(info, &mut offset)?;
        let frame = match frame_type {
            0..=63 => Frame {
                offset_delta: frame_type as u16,
                kind: FrameKind::Same { extended: false },
            },
            64..=127 => Frame {
                offset_delta: (frame_type - 64) as u16,
                kind: FrameKind::SameLocals1StackItem {
                    stack: read_type(info, &mut offset)?,
                    extended: false,
                },
            },
            247 => {
                let offset_delta = read_u16(info, &mut offset)?;
                Frame {
                    offset_delta,
                    kind: FrameKind::SameLocals1StackItem {
                        stack: read_type(info, &mut offset)?,
                        extended: true,
                    },
                }
            }
            248..=250 => Frame {
                offset_delta: read_u16(info, &mut offset)?,
                kind: FrameKind::Chop(251 - frame_type),
            },
            251 => Frame {
                offset_delta: read_u16(info, &mut offset)?,
                kind: FrameKind::Same { extended: true },
            },
            252..=254 => {
                let offset_delta = read_u16(info, &mut offset)?;
                let locals = read_types(info, &mut offset, (frame_type - 251) as u16)?;
                Frame {
                    offset_delta,
                    kind: FrameKind::Append(locals),
                }
            }
            255 => {
                let offset_delta = read_u16(info, &mut offset)?;
                let local_count = read_u16(info, &mut offset)?;
                let locals = read_types(info, &mut offset, local_count)?;
                let stack_count = read_u16(info, &mut offset)?;
                let stack = read_types(info, &mut offset, stack_count)?;
                Frame {
                    offset_delta,
                    kind: FrameKind::Full { locals, stack },
                }
            }
            _ => anyhow::bail!("reserved stack map frame type {frame_type}"),
        };
        frames.push(frame);
    }
    if offset != info.len() {
        anyhow::bail!("{} trailing bytes in StackMapTable", info.len() - offset);
    }
    Ok(frames)
}

pub(crate) fn write(frames: &[Frame]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    put_u16(&mut out, to_u16(frames.len(), "stack map frame count")?);
    for frame in frames {
        let delta = frame.offset_delta;
        match &frame.kind {
            FrameKind::Same { extended } => {
                if !extended && delta <= 63 {
                    put_u8(&mut out, delta as u8);
                } else {
                    put_u8(&mut out, 251);
                    put_u16(&mut out, delta);
                }
            }
            FrameKind::SameLocals1StackItem { stack, extended } => {
                if !extended && delta <= 63 {
                    put_u8(&mut out, 64 + delta as u8);
                } else {
                    put_u8(&mut out, 247);
                    put_u16(&mut out, delta);
                }
                write_type(&mut out, *stack);
            }
            FrameKind::Chop(count) => {
                put_u8(&mut out, 251 - count);
                put_u16(&mut out, delta);
            }
            FrameKind::Append(locals) => {
                put_u8(&mut out, 251 + locals.len() as u8);
                put_u16(&mut out, delta);
                for local in locals {
                    write_type(&mut out, *local);
                }
            }
            FrameKind::Full { locals, stack } => {
                put_u8(&mut out, 255);
                put_u16(&mut out, delta);
                put_u16(&mut out, to_u16(locals.len(), "frame local count")?);
                for local in locals {
                    write_type(&mut out, *local);
                }
                put_u16(&mut out, to_u16(stack.len(), "frame stack count")?);
                for item in stack {
                    write_type(&mut out, *item);
                }
            }
        }
    }
    Ok(out)
}

/// Move every frame, and every `Uninitialized` offset inside it, through `map`.
pub(crate) fn relocate(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut frames = parse(info)?;
    let mut previous_old: Option<u32> = None;
    let mut previous_new: Option<u32> = None;
    for (index, frame) in frames.iter_mut().enumerate() {
        let old = match previous_old {
            None => frame.offset_delta as u32,
            Some(previous) => previous + frame.offset_delta as u32 + 1,
        };
        let new = map
            .map(old)
            .with_context(|| format!("relocate frame {index} at offset {old}"))?;
        let delta = match previous_new {
            None => new,
            Some(previous) => new
                .checked_sub(previous + 1)
                .context("stack map frames out of order after relocation")?,
        };
        frame.offset_delta = to_u16(delta as usize, "frame offset delta")?;
        relocate_types(&mut frame.kind, map)?;
        previous_old = Some(old);
        previous_new = Some(new);
    }
    write(&frames)
}

/// A frame at an absolute offset with its locals spelled out in full.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ResolvedFrame {
    pub(crate) offset: u32,
    /// One entry per value; `Long` and `Double` cover two slots.
    pub(crate) locals: Vec<VerificationType>,
    pub(crate) stack: Vec<VerificationType>,
}

/// Apply the delta encoding starting from the method's entry locals.
pub(crate) fn resolve(
    frames: &[Frame],
    initial_locals: &[VerificationType],
) -> Result<Vec<ResolvedFrame>> {
    let mut locals = initial_locals.to_vec();
    let mut previous: Option<u32> = None;
    let mut resolved = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let offset = match previous {
            None => frame.offset_delta as u32,
            Some(previous) => previous + frame.offset_delta as u32 + 1,
        };
        let stack = match &frame.kind {
            FrameKind::Same { .. } => Vec::new(),
            FrameKind::SameLocals1StackItem { stack, .. } => vec![*stack],
            FrameKind::Chop(count) => {
                let kept = locals
                    .len()
                    .checked_sub(*count as usize)
                    .with_context(|| format!("frame {index} chops more locals than exist"))?;
                locals.truncate(kept);
                Vec::new()
            }
            FrameKind::Append(added) => {
                locals.extend_from_slice(added);
                Vec::new()
            }
            FrameKind::Full {
                locals: full,
                stack,
            } => {
                locals = full.clone();
                stack.clone()
            }
        };
        resolved.push(ResolvedFrame {
            offset,
            locals: locals.clone(),
            stack,
        });
        previous = Some(offset);
    }
    Ok(resolved)
}

/// Add full frames at offsets that had none. An added frame changes the
/// predecessor of the frame after it, so that frame is rewritten in full too.
/// Where an added frame meets an existing one, the existing frame stays.
pub(crate) fn insert_frames(
    info: &[u8],
    initial_locals: &[VerificationType],
    mut added: Vec<ResolvedFrame>,
) -> Result<Vec<u8>> {
    let frames = parse(info)?;
    let resolved = resolve(&frames, initial_locals)?;
    added.sort_by_key(|frame| frame.offset);

    let mut merged: Vec<(u32, FrameKind)> = Vec::with_capacity(frames.len() + added.len());
    let mut pending = added.into_iter().peekable();
    for (frame, full) in frames.into_iter().zip(resolved) {
        let mut follows_insertion = false;
        while let Some(extra) = pending.next_if(|extra| extra.offset <= full.offset) {
            if extra.offset < full.offset {
                merged.push((extra.offset, full_kind(extra.locals, extra.stack)));
                follows_insertion = true;
            }
        }
        let kind = if follows_insertion {
            full_kind(full.locals, full.stack)
        } else {
            frame.kind
        };
        merged.push((full.offset, kind));
    }
    merged.extend(pending.map(|extra| (extra.offset, full_kind(extra.locals, extra.stack))));

    let mut out = Vec::with_capacity(merged.len());
    let mut previous: Option<u32> = None;
    for (offset, kind) in merged {
        let delta = match previous {
            None => offset,
            Some(previous) => offset - previous - 1,
        };
        out.push(Frame {
            offset_delta: to_u16(delta as usize, "frame offset delta")?,
            kind,
        });
        previous = Some(offset);
    }
    write(&out)
}

fn full_kind(locals: Vec<VerificationType>, stack: Vec<VerificationType>) -> FrameKind {
    FrameKind::Full { locals, stack }
}

fn relocate_types(kind: &mut FrameKind, map: &OffsetMap) -> Result<()> {
    let types: Vec<&mut VerificationType> = match kind {
        FrameKind::Same { .. } | FrameKind::Chop(_) => Vec::new(),
        FrameKind::SameLocals1StackItem { stack, .. } => vec![stack],
        FrameKind::Append(locals) => locals.iter_mut().collect(),
        FrameKind::Full { locals, stack } => locals.iter_mut().chain(stack.iter_mut()).collect(),
    };
    for ty in types {
        if let VerificationType::Uninitialized(offset) = ty {
            *offset = map
                .map_u16(*offset)
                .context("relocate uninitialized type")?;
        }
    }
    Ok(())
}

fn read_types(info: &[u8], offset: &mut usize, count: u16) -> Result<Vec<VerificationType>> {
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_type(info, offset)?);
    }
    Ok(types)
}

fn read_type(info: &[u8], offset: &mut usize) -> Result<VerificationType> {
    let tag = read_u8(info, offset)?;
    let ty = match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(read_u16(info, offset)?),
        8 => VerificationType::Uninitialized(read_u16(info, offset)?),
        _ => anyhow::bail!("invalid verification type tag {tag}"),
    };
    Ok(ty)
}

fn write_type(out: &mut Vec<u8>, ty: VerificationType) {
    match ty {
        VerificationType::Top => put_u8(out, 0),
        VerificationType::Integer => put_u8(out, 1),
        VerificationType::Float => put_u8(out, 2),
        VerificationType::Double => put_u8(out, 3),
        VerificationType::Long => put_u8(out, 4),
        VerificationType::Null => put_u8(out, 5),
        VerificationType::UninitializedThis => put_u8(out, 6),
        VerificationType::Object(index) => {
            put_u8(out, 7);
            put_u16(out, index);
        }
        VerificationType::Uninitialized(offset) => {
            put_u8(out, 8);
            put_u16(out, offset);
        }
    }
}
