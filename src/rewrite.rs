use anyhow::{Context, Result};
use tracing::debug;

use crate::bytecode::{decode, padding};
use crate::classfile::code::{CodeAttribute, LineNumber, OffsetMap};
use crate::classfile::reader::{put_u16, put_u32};
use crate::classfile::{ClassFile, ConstantPool, Member};
use crate::frames::{MethodShape, add_branch_frames};
use crate::ir::{CallSite, Instruction, InstructionKind};
use crate::location::{EXTRA_STACK, SourcePosition, UNKNOWN_LINE, synthesize};
use crate::opcodes;
use crate::registry::{Overload, TargetRegistry};
use crate::signature::MethodKey;

/// Outcome of rewriting one class file.
#[derive(Clone, Debug)]
pub(crate) enum Rewrite {
    /// No call site matched; the input bytes stay authoritative.
    Unchanged,
    Changed {
        bytes: Vec<u8>,
        call_sites: Vec<RewrittenCall>,
    },
}

/// One call site that now passes a location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RewrittenCall {
    pub(crate) class_name: String,
    pub(crate) position: SourcePosition,
    pub(crate) target: MethodKey,
    pub(crate) rewritten_descriptor: String,
    pub(crate) fallback: bool,
}

/// Replacement planned for one invoke instruction.
struct Patch {
    prefix: Vec<u8>,
    method_index: u16,
}

/// How a branch instruction is encoded in the relaid code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BranchForm {
    /// The instruction's own opcode and displacement width.
    Original,
    /// `goto_w` or `jsr_w` in place of `goto` or `jsr`.
    Wide,
    /// The inverted condition skipping a `goto_w` to the original target.
    Inverted,
}

/// Relaid code of one method.
struct Layout {
    code: Vec<u8>,
    map: OffsetMap,
    /// Indices of conditional branches encoded as [`BranchForm::Inverted`].
    inverted: Vec<usize>,
}

/// Rewrite every registered call site in a class file.
pub(crate) fn rewrite_class(data: &[u8], registry: &TargetRegistry) -> Result<Rewrite> {
    let mut class = ClassFile::parse(data).context("parse class file")?;
    let class_name = class.class_name()?;
    let source_file = class.source_file()?.unwrap_or_default();

    let mut methods = std::mem::take(&mut class.methods);
    let mut call_sites = Vec::new();
    for method in &mut methods {
        let name = method.name(&class.constant_pool)?;
        let descriptor = method.descriptor(&class.constant_pool)?;
        let context = MethodContext {
            class_name: &class_name,
            source_file: &source_file,
            method_name: &name,
            descriptor: &descriptor,
            is_static: method.access_flags & ACC_STATIC != 0,
        };
        rewrite_method(
            method,
            &context,
            registry,
            &mut class.constant_pool,
            &mut call_sites,
        )
        .with_context(|| format!("rewrite {class_name}.{name}{descriptor}"))?;
    }
    class.methods = methods;

    if call_sites.is_empty() {
        return Ok(Rewrite::Unchanged);
    }
    let bytes = class.to_bytes().context("write class file")?;
    Ok(Rewrite::Changed { bytes, call_sites })
}

const ACC_STATIC: u16 = 0x0008;

struct MethodContext<'a> {
    class_name: &'a str,
    source_file: &'a str,
    method_name: &'a str,
    descriptor: &'a str,
    is_static: bool,
}

fn rewrite_method(
    method: &mut Member,
    context: &MethodContext<'_>,
    registry: &TargetRegistry,
    constant_pool: &mut ConstantPool,
    call_sites: &mut Vec<RewrittenCall>,
) -> Result<()> {
    let mut code_slot = None;
    for (index, attribute) in method.attributes.iter().enumerate() {
        if constant_pool.utf8(attribute.name_index)? == "Code" {
            code_slot = Some(index);
            break;
        }
    }
    let Some(code_slot) = code_slot else {
        return Ok(());
    };

    let mut code = CodeAttribute::parse(&method.attributes[code_slot].info)
        .context("parse Code attribute")?;
    let lines = code.line_numbers(constant_pool)?;
    let instructions = decode(&code.code, constant_pool).context("decode bytecode")?;

    let patches = plan_patches(
        &instructions,
        &lines,
        context,
        registry,
        constant_pool,
        call_sites,
    )?;
    if patches.iter().all(Option::is_none) {
        return Ok(());
    }

    let layout = relayout(&code.code, &instructions, &patches)?;
    if !layout.inverted.is_empty() {
        let shape = MethodShape {
            class_name: context.class_name,
            name: context.method_name,
            descriptor: context.descriptor,
            is_static: context.is_static,
        };
        add_branch_frames(
            &mut code,
            &instructions,
            &layout.inverted,
            &shape,
            constant_pool,
        )
        .context("add frames for widened branches")?;
    }
    code.code = layout.code;
    code.relocate(constant_pool, &layout.map)?;
    code.max_stack = code
        .max_stack
        .checked_add(EXTRA_STACK)
        .context("max stack exceeds 65535")?;
    method.attributes[code_slot].info = code.to_bytes()?;
    Ok(())
}

/// Walk the instructions in order, tracking the current source line, and
/// plan a patch for every invoke the registry knows.
fn plan_patches(
    instructions: &[Instruction],
    lines: &[LineNumber],
    context: &MethodContext<'_>,
    registry: &TargetRegistry,
    constant_pool: &mut ConstantPool,
    call_sites: &mut Vec<RewrittenCall>,
) -> Result<Vec<Option<Patch>>> {
    let mut patches = Vec::with_capacity(instructions.len());
    let mut next_line = 0;
    let mut line = UNKNOWN_LINE;
    for instruction in instructions {
        while let Some(entry) = lines.get(next_line) {
            if u32::from(entry.start_pc) > instruction.offset {
                break;
            }
            line = entry.line;
            next_line += 1;
        }

        let patch = match &instruction.kind {
            InstructionKind::Invoke(call) => match registry.lookup(&call.key()) {
                Some(overload) => {
                    let position = SourcePosition {
                        file: context.source_file.to_string(),
                        method: context.method_name.to_string(),
                        line,
                    };
                    let patch = patch_call(call, &overload, &position, registry, constant_pool)
                        .with_context(|| {
                            format!("rewrite call to {} at offset {}", call.key(), call.offset)
                        })?;
                    debug!(
                        class = context.class_name,
                        method = context.method_name,
                        line,
                        target = %call.key(),
                        fallback = overload.fallback,
                        "rewriting call site"
                    );
                    call_sites.push(RewrittenCall {
                        class_name: context.class_name.to_string(),
                        position,
                        target: call.key(),
                        rewritten_descriptor: overload.key.descriptor,
                        fallback: overload.fallback,
                    });
                    Some(patch)
                }
                None => None,
            },
            InstructionKind::Branch { .. }
            | InstructionKind::TableSwitch { .. }
            | InstructionKind::LookupSwitch { .. }
            | InstructionKind::Other => None,
        };
        patches.push(patch);
    }
    Ok(patches)
}

fn patch_call(
    call: &CallSite,
    overload: &Overload,
    position: &SourcePosition,
    registry: &TargetRegistry,
    constant_pool: &mut ConstantPool,
) -> Result<Patch> {
    let prefix = synthesize(registry.location_type(), position, constant_pool)?;
    // The owner is always the call site's own class entry: exact matches share
    // it and fallback matches keep it by definition.
    let method_index = constant_pool.add_method_ref(
        call.class_index,
        &overload.key.name,
        &overload.key.descriptor,
        overload.key.is_interface,
    )?;
    Ok(Patch {
        prefix,
        method_index,
    })
}

/// Lay the method out again with every patch applied. Branches whose
/// displacement no longer fits 16 bits are widened, and the layout is
/// recomputed until no further branch needs it.
fn relayout(
    code: &[u8],
    instructions: &[Instruction],
    patches: &[Option<Patch>],
) -> Result<Layout> {
    let mut forms = vec![BranchForm::Original; instructions.len()];
    let (map, starts, length) = loop {
        let (map, starts, length) = place(code.len(), instructions, patches, &forms);
        let mut widened = false;
        for (index, instruction) in instructions.iter().enumerate() {
            let InstructionKind::Branch { target } = instruction.kind else {
                continue;
            };
            if forms[index] != BranchForm::Original
                || matches!(instruction.opcode, opcodes::GOTO_W | opcodes::JSR_W)
            {
                continue;
            }
            if i16::try_from(displacement(&map, target, starts[index])?).is_err() {
                forms[index] = match instruction.opcode {
                    opcodes::GOTO | opcodes::JSR => BranchForm::Wide,
                    _ => BranchForm::Inverted,
                };
                widened = true;
            }
        }
        if !widened {
            break (map, starts, length);
        }
    };
    if length > u16::MAX as usize {
        anyhow::bail!("rewritten code length {length} exceeds 65535");
    }

    let mut out = Vec::with_capacity(length);
    for (index, (instruction, patch)) in instructions.iter().zip(patches).enumerate() {
        if let Some(patch) = patch {
            out.extend_from_slice(&patch.prefix);
        }
        debug_assert_eq!(out.len(), starts[index]);
        encode(code, instruction, patch.as_ref(), forms[index], starts[index], &map, &mut out)
            .with_context(|| format!("re-encode instruction at offset {}", instruction.offset))?;
    }
    let inverted: Vec<usize> = forms
        .iter()
        .enumerate()
        .filter(|(_, form)| **form == BranchForm::Inverted)
        .map(|(index, _)| index)
        .collect();
    if !inverted.is_empty() {
        debug!(branches = inverted.len(), "inverted conditional branches around goto_w");
    }
    Ok(Layout {
        code: out,
        map,
        inverted,
    })
}

/// Compute where every instruction starts under the given branch forms.
/// Returns the offset map, the start of each instruction after its prefix,
/// and the total code length.
fn place(
    code_len: usize,
    instructions: &[Instruction],
    patches: &[Option<Patch>],
    forms: &[BranchForm],
) -> (OffsetMap, Vec<usize>, usize) {
    let mut map = OffsetMap::new(code_len);
    let mut starts = Vec::with_capacity(instructions.len());
    let mut next = 0usize;
    for ((instruction, patch), form) in instructions.iter().zip(patches).zip(forms) {
        map.insert(instruction.offset, next as u32);
        let prefix_len = patch.as_ref().map_or(0, |patch| patch.prefix.len());
        let start = next + prefix_len;
        starts.push(start);
        next = start + emitted_length(instruction, *form, start);
    }
    map.insert(code_len as u32, next as u32);
    (map, starts, next)
}

fn emitted_length(instruction: &Instruction, form: BranchForm, start: usize) -> usize {
    let original_padding = padding(instruction.offset as usize);
    match (&instruction.kind, form) {
        (InstructionKind::TableSwitch { .. } | InstructionKind::LookupSwitch { .. }, _) => {
            instruction.length as usize - original_padding + padding(start)
        }
        (_, BranchForm::Original) => instruction.length as usize,
        (_, BranchForm::Wide) => 5,
        // if<!cond> +8; goto_w
        (_, BranchForm::Inverted) => 8,
    }
}

fn encode(
    code: &[u8],
    instruction: &Instruction,
    patch: Option<&Patch>,
    form: BranchForm,
    start: usize,
    map: &OffsetMap,
    out: &mut Vec<u8>,
) -> Result<()> {
    let original =
        &code[instruction.offset as usize..(instruction.offset + instruction.length) as usize];
    match (&instruction.kind, patch) {
        (InstructionKind::Invoke(_), Some(patch)) => {
            out.push(instruction.opcode);
            put_u16(out, patch.method_index);
            if instruction.opcode == opcodes::INVOKEINTERFACE {
                // count operand includes the appended reference
                out.push(original[3].checked_add(1).context("invokeinterface count overflow")?);
                out.push(0);
            }
        }
        (InstructionKind::Branch { target }, _) => {
            let displacement = displacement(map, *target, start)?;
            match form {
                BranchForm::Original
                    if matches!(instruction.opcode, opcodes::GOTO_W | opcodes::JSR_W) =>
                {
                    out.push(instruction.opcode);
                    put_u32(out, displacement as u32);
                }
                BranchForm::Original => {
                    let short = i16::try_from(displacement).with_context(|| {
                        format!("branch displacement {displacement} does not fit 16 bits")
                    })?;
                    out.push(instruction.opcode);
                    put_u16(out, short as u16);
                }
                BranchForm::Wide => {
                    out.push(if instruction.opcode == opcodes::GOTO {
                        opcodes::GOTO_W
                    } else {
                        opcodes::JSR_W
                    });
                    put_u32(out, displacement as u32);
                }
                BranchForm::Inverted => {
                    out.push(inverted_condition(instruction.opcode)?);
                    put_u16(out, 8);
                    out.push(opcodes::GOTO_W);
                    // goto_w sits three bytes after the conditional
                    put_u32(out, (displacement - 3) as u32);
                }
            }
        }
        (
            InstructionKind::TableSwitch {
                default,
                low,
                high,
                targets,
            },
            _,
        ) => {
            out.push(instruction.opcode);
            out.resize(out.len() + padding(start), 0);
            put_u32(out, displacement(map, *default, start)? as u32);
            put_u32(out, *low as u32);
            put_u32(out, *high as u32);
            for target in targets {
                put_u32(out, displacement(map, *target, start)? as u32);
            }
        }
        (InstructionKind::LookupSwitch { default, pairs }, _) => {
            out.push(instruction.opcode);
            out.resize(out.len() + padding(start), 0);
            put_u32(out, displacement(map, *default, start)? as u32);
            put_u32(out, pairs.len() as u32);
            for (key, target) in pairs {
                put_u32(out, *key as u32);
                put_u32(out, displacement(map, *target, start)? as u32);
            }
        }
        (InstructionKind::Invoke(_), None) | (InstructionKind::Other, _) => {
            out.extend_from_slice(original);
        }
    }
    Ok(())
}

/// Opcode branching on the opposite condition.
fn inverted_condition(opcode: u8) -> Result<u8> {
    match opcode {
        // Conditions come in pairs: ifeq/ifne, iflt/ifge, ... if_acmpeq/if_acmpne.
        opcodes::IFEQ..=opcodes::IF_ACMPNE if (opcode - opcodes::IFEQ) % 2 == 0 => Ok(opcode + 1),
        opcodes::IFEQ..=opcodes::IF_ACMPNE => Ok(opcode - 1),
        opcodes::IFNULL => Ok(opcodes::IFNONNULL),
        opcodes::IFNONNULL => Ok(opcodes::IFNULL),
        _ => anyhow::bail!("opcode 0x{opcode:02x} is not a conditional branch"),
    }
}

fn displacement(map: &OffsetMap, target: u32, start: usize) -> Result<i32> {
    let new_target = map.map(target).context("relocate branch target")?;
    Ok(new_target as i32 - start as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::code::ExceptionEntry;
    use crate::classfile::stack_map::{self, Frame, FrameKind, VerificationType};
    use crate::ir::CallKind;
    use crate::location::LocationType;
    use crate::opcodes::*;
    use crate::testing::{ClassBuilder, MethodBody, invoke, method_code};

    const TASK_RUNNER: &str = "org/chromium/base/task/TaskRunner";
    const POST_DELAYED: &str = "(Ljava/lang/Runnable;J)V";
    const POST_DELAYED_WITH_LOCATION: &str =
        "(Ljava/lang/Runnable;JLorg/chromium/base/Location;)V";

    fn registry() -> TargetRegistry {
        TargetRegistry::chromium().expect("registry")
    }

    fn changed(rewrite: Rewrite) -> (Vec<u8>, Vec<RewrittenCall>) {
        match rewrite {
            Rewrite::Changed { bytes, call_sites } => (bytes, call_sites),
            Rewrite::Unchanged => panic!("expected a rewrite"),
        }
    }

    /// `runner.postDelayedTask(null, 0L)` in `bar`, at the given line.
    fn post_delayed_class(line: Option<u16>) -> (Vec<u8>, u16) {
        let mut builder = ClassBuilder::new("org/example/Foo", Some("Foo.java"));
        let target = builder.method_ref(TASK_RUNNER, "postDelayedTask", POST_DELAYED, true);
        let mut code = vec![ALOAD_1, ACONST_NULL, LCONST_0];
        code.extend(invoke(INVOKEINTERFACE, target, 4));
        code.push(RETURN);
        let lines = line.map(|line| vec![(0, line)]).unwrap_or_default();
        builder.method("bar", "(Lorg/chromium/base/task/TaskRunner;)V", code, lines);
        (builder.build(), target)
    }

    #[test]
    fn rewrites_interface_post_with_location_of_call_site() {
        let (input, original_ref) = post_delayed_class(Some(42));

        let (bytes, call_sites) = changed(rewrite_class(&input, &registry()).expect("rewrite"));

        let class = ClassFile::parse(&bytes).expect("parse output");
        let pool = &class.constant_pool;
        let code = method_code(&bytes, "bar");
        let out = &code.code;

        // Original arguments keep their order ahead of the location.
        assert_eq!(&out[0..3], &[ALOAD_1, ACONST_NULL, LCONST_0]);
        assert_eq!(out[3], LDC);
        assert_eq!(string_constant(pool, out[4] as u16), "Foo.java");
        assert_eq!(out[5], LDC);
        assert_eq!(string_constant(pool, out[6] as u16), "bar");
        assert_eq!(&out[7..9], &[BIPUSH, 42]);
        assert_eq!(out[9], INVOKESTATIC);
        let factory = pool
            .method_ref(u16::from_be_bytes([out[10], out[11]]))
            .expect("factory");
        assert_eq!(factory.owner, "org/chromium/base/Location");
        assert_eq!(factory.name, "from");

        assert_eq!(out[12], INVOKEINTERFACE);
        let target_index = u16::from_be_bytes([out[13], out[14]]);
        assert_ne!(target_index, original_ref);
        let target = pool.method_ref(target_index).expect("target");
        assert_eq!(target.owner, TASK_RUNNER);
        assert_eq!(target.name, "postDelayedTask");
        assert_eq!(target.descriptor, POST_DELAYED_WITH_LOCATION);
        assert!(target.is_interface);
        assert_eq!(&out[15..17], &[5, 0]);
        assert_eq!(out[17], RETURN);
        assert_eq!(out.len(), 18);

        assert_eq!(code.max_stack, 4 + EXTRA_STACK);
        assert_eq!(
            code.line_numbers(pool).expect("lines"),
            vec![LineNumber {
                start_pc: 0,
                line: 42
            }]
        );

        assert_eq!(call_sites.len(), 1);
        assert_eq!(call_sites[0].class_name, "org/example/Foo");
        assert_eq!(
            call_sites[0].position,
            SourcePosition {
                file: "Foo.java".to_string(),
                method: "bar".to_string(),
                line: 42,
            }
        );
        assert_eq!(call_sites[0].rewritten_descriptor, POST_DELAYED_WITH_LOCATION);
        assert!(!call_sites[0].fallback);
    }

    #[test]
    fn output_is_readable_by_jclassfile() {
        let (input, _) = post_delayed_class(Some(42));
        let (bytes, _) = changed(rewrite_class(&input, &registry()).expect("rewrite"));

        let parsed = jclassfile::class_file::parse(&bytes).expect("jclassfile parse");
        let pool = parsed.constant_pool();
        let descriptors: Vec<String> = pool
            .iter()
            .filter_map(|entry| match entry {
                jclassfile::constant_pool::ConstantPool::Utf8 { value } => Some(value.clone()),
                _ => None,
            })
            .collect();
        assert!(descriptors.iter().any(|value| value == POST_DELAYED_WITH_LOCATION));
        assert_eq!(parsed.methods().len(), 1);
    }

    #[test]
    fn class_without_targets_is_unchanged() {
        let mut builder = ClassBuilder::new("org/example/Plain", Some("Plain.java"));
        let start = builder.method_ref("java/lang/Thread", "start", "()V", false);
        let mut code = vec![ALOAD_1];
        code.extend(invoke(INVOKEVIRTUAL, start, 0));
        code.push(RETURN);
        builder.method("run", "(Ljava/lang/Thread;)V", code, vec![(0, 3)]);

        let rewrite = rewrite_class(&builder.build(), &registry()).expect("rewrite");
        assert!(matches!(rewrite, Rewrite::Unchanged));
    }

    #[test]
    fn missing_line_information_uses_unknown_line() {
        let (input, _) = post_delayed_class(None);
        let (bytes, call_sites) = changed(rewrite_class(&input, &registry()).expect("rewrite"));

        let code = method_code(&bytes, "bar");
        assert_eq!(code.code[7], ICONST_0);
        assert_eq!(call_sites[0].position.line, UNKNOWN_LINE);
    }

    #[test]
    fn missing_source_file_uses_empty_name() {
        let mut builder = ClassBuilder::new("org/example/Anonymous", None);
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        let mut code = vec![ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.push(RETURN);
        builder.method("run", "()V", code, vec![(0, 9)]);

        let (_, call_sites) =
            changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        assert_eq!(call_sites[0].position.file, "");
        assert_eq!(call_sites[0].position.line, 9);
    }

    #[test]
    fn fallback_keeps_subclass_owner() {
        let mut builder = ClassBuilder::new("org/example/Launcher", Some("Launcher.java"));
        let execute = builder.method_ref(
            "org/example/MyTask",
            "executeOnExecutor",
            "(Lorg/chromium/base/task/LocationAwareExecutor;)Lorg/chromium/base/task/AsyncTask;",
            false,
        );
        let mut code = vec![ALOAD_0, ACONST_NULL];
        code.extend(invoke(INVOKEVIRTUAL, execute, 0));
        code.extend([POP, RETURN]);
        builder.method("launch", "()V", code, vec![(0, 12)]);

        let (bytes, call_sites) =
            changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));

        let class = ClassFile::parse(&bytes).expect("parse");
        let code = method_code(&bytes, "launch");
        let invoke_at = code.code.len() - 5;
        assert_eq!(code.code[invoke_at], INVOKEVIRTUAL);
        let target = class
            .constant_pool
            .method_ref(u16::from_be_bytes([code.code[invoke_at + 1], code.code[invoke_at + 2]]))
            .expect("target");
        assert_eq!(target.owner, "org/example/MyTask");
        assert_eq!(
            target.descriptor,
            "(Lorg/chromium/base/task/LocationAwareExecutor;Lorg/chromium/base/Location;)Lorg/chromium/base/task/AsyncTask;"
        );
        assert!(call_sites[0].fallback);
        assert_eq!(call_sites[0].target.owner, "org/example/MyTask");
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let (input, _) = post_delayed_class(Some(42));
        let (bytes, _) = changed(rewrite_class(&input, &registry()).expect("first pass"));

        let again = rewrite_class(&bytes, &registry()).expect("second pass");
        assert!(matches!(again, Rewrite::Unchanged));
    }

    #[test]
    fn identical_input_gives_identical_output() {
        let (input, _) = post_delayed_class(Some(42));
        let (first, _) = changed(rewrite_class(&input, &registry()).expect("first"));
        let (second, _) = changed(rewrite_class(&input, &registry()).expect("second"));
        assert_eq!(first, second);
    }

    #[test]
    fn non_target_instructions_are_copied_verbatim() {
        let mut builder = ClassBuilder::new("org/example/Mixed", Some("Mixed.java"));
        let start = builder.method_ref("java/lang/Thread", "start", "()V", false);
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "runOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        let mut code = vec![ALOAD_1];
        code.extend(invoke(INVOKEVIRTUAL, start, 0));
        code.push(ACONST_NULL);
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.push(ALOAD_1);
        code.extend(invoke(INVOKEVIRTUAL, start, 0));
        code.push(RETURN);
        builder.method("run", "(Ljava/lang/Thread;)V", code.clone(), vec![(0, 1), (4, 2)]);

        let (bytes, call_sites) =
            changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let out = method_code(&bytes, "run").code;

        assert_eq!(&out[..5], &code[..5]);
        let inserted = out.len() - code.len();
        assert_eq!(&out[5 + inserted + 3..], &code[8..]);
        assert_eq!(out[5 + inserted], INVOKESTATIC);
        assert_eq!(call_sites.len(), 1);
        assert_eq!(call_sites[0].position.line, 2);
    }

    #[test]
    fn branches_handlers_and_frames_follow_inserted_code() {
        let mut builder = ClassBuilder::new("org/example/Branchy", Some("Branchy.java"));
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        //  0: aload_1
        //  1: ifnull 9
        //  4: aload_1
        //  5: invokestatic postOnUiThread
        //  8: return
        //  9: goto 4
        // 12: return
        let mut code = vec![ALOAD_1, IFNULL, 0x00, 0x08, ALOAD_1];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.extend([RETURN, GOTO, 0xff, 0xfb, RETURN]);
        let frames = stack_map::write(&[
            Frame {
                offset_delta: 4,
                kind: FrameKind::Same { extended: false },
            },
            Frame {
                offset_delta: 4,
                kind: FrameKind::Same { extended: false },
            },
        ])
        .expect("frames");
        let mut body = MethodBody::new(code).lines(&[(0, 10), (4, 11), (9, 12)]);
        body.exception_table = vec![ExceptionEntry {
            start_pc: 4,
            end_pc: 8,
            handler_pc: 12,
            catch_type: 0,
        }];
        body.attributes.push(("StackMapTable", frames));
        let local_name = builder.pool().add_utf8("task").expect("name");
        let local_type = builder.pool().add_utf8("Ljava/lang/Runnable;").expect("type");
        let mut lvt = Vec::new();
        put_u16(&mut lvt, 1);
        for value in [0u16, 13, local_name, local_type, 1] {
            put_u16(&mut lvt, value);
        }
        body.attributes.push(("LocalVariableTable", lvt));
        builder.method_with("post", "(Ljava/lang/Runnable;)V", body);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let class = ClassFile::parse(&bytes).expect("parse");
        let code = method_code(&bytes, "post");
        let out = &code.code;
        // ldc, ldc, bipush 11, invokestatic = 9 bytes inserted at 5
        let inserted = 9;

        assert_eq!(&out[1..4], &[IFNULL, 0x00, 0x08 + inserted as u8]);
        let goto_at = 9 + inserted;
        assert_eq!(out[goto_at], GOTO);
        assert_eq!(
            i16::from_be_bytes([out[goto_at + 1], out[goto_at + 2]]),
            4 - goto_at as i16
        );
        assert_eq!(
            code.exception_table,
            vec![ExceptionEntry {
                start_pc: 4,
                end_pc: 8 + inserted as u16,
                handler_pc: 12 + inserted as u16,
                catch_type: 0,
            }]
        );
        assert_eq!(
            code.line_numbers(&class.constant_pool).expect("lines"),
            vec![
                LineNumber { start_pc: 0, line: 10 },
                LineNumber { start_pc: 4, line: 11 },
                LineNumber {
                    start_pc: 9 + inserted as u16,
                    line: 12
                },
            ]
        );

        let stack_map = crate::classfile::find_attribute(
            &class.constant_pool,
            &code.attributes,
            "StackMapTable",
        )
        .expect("attributes")
        .expect("StackMapTable");
        let frames = stack_map::parse(&stack_map.info).expect("frames");
        assert_eq!(frames[0].offset_delta, 4);
        assert_eq!(frames[1].offset_delta, 4 + inserted as u16);

        let lvt = crate::classfile::find_attribute(
            &class.constant_pool,
            &code.attributes,
            "LocalVariableTable",
        )
        .expect("attributes")
        .expect("LocalVariableTable");
        assert_eq!(&lvt.info[2..6], &[0, 0, 0, 13 + inserted as u8]);
    }

    #[test]
    fn branch_to_the_call_lands_on_the_location_sequence() {
        let mut builder = ClassBuilder::new("org/example/Join", Some("Join.java"));
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        //  0: aload_1
        //  1: ifnonnull 8
        //  4: aconst_null
        //  5: goto 9
        //  8: aload_1
        //  9: invokestatic postOnUiThread
        // 12: return
        let mut code = vec![ALOAD_1, IFNONNULL, 0x00, 0x07, ACONST_NULL, GOTO, 0x00, 0x04, ALOAD_1];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.push(RETURN);
        let runnable = builder.pool().add_class("java/lang/Runnable").expect("class");
        let frames = stack_map::write(&[
            Frame {
                offset_delta: 8,
                kind: FrameKind::Same { extended: false },
            },
            Frame {
                offset_delta: 0,
                kind: FrameKind::SameLocals1StackItem {
                    stack: VerificationType::Object(runnable),
                    extended: false,
                },
            },
        ])
        .expect("frames");
        let mut body = MethodBody::new(code).lines(&[(0, 5)]);
        body.attributes.push(("StackMapTable", frames));
        builder.method_with("post", "(Ljava/lang/Runnable;)V", body);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let code = method_code(&bytes, "post");
        let out = &code.code;

        // goto still targets offset 9, now the first ldc of the location.
        assert_eq!(&out[5..8], &[GOTO, 0x00, 0x04]);
        assert_eq!(out[9], LDC);
        let class = ClassFile::parse(&bytes).expect("parse");
        let stack_map = crate::classfile::find_attribute(
            &class.constant_pool,
            &code.attributes,
            "StackMapTable",
        )
        .expect("attributes")
        .expect("StackMapTable");
        let frames = stack_map::parse(&stack_map.info).expect("frames");
        assert_eq!(frames[0].offset_delta, 8);
        assert_eq!(frames[1].offset_delta, 0);
    }

    #[test]
    fn switch_padding_is_recomputed_after_insertion() {
        let mut builder = ClassBuilder::new("org/example/Switchy", Some("Switchy.java"));
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        //  0: aconst_null
        //  1: invokestatic postOnUiThread
        //  4: iload_1
        //  5: tableswitch pad 2, default -> 24, [0..0] -> 24
        // 24: return
        let mut code = vec![ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.extend([ILOAD_1, TABLESWITCH, 0, 0]);
        for value in [19i32, 0, 0, 19] {
            code.extend(value.to_be_bytes());
        }
        code.push(RETURN);
        assert_eq!(code.len(), 25);
        builder.method("choose", "(I)V", code, vec![(0, 100)]);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let out = method_code(&bytes, "choose").code;

        // ldc, ldc, bipush 100, invokestatic = 9 bytes inserted at 1
        let switch_at = 5 + 9;
        assert_eq!(out[switch_at], TABLESWITCH);
        let pad = padding(switch_at);
        assert_eq!(pad, 1);
        let operands = switch_at + 1 + pad;
        let return_at = operands + 16;
        assert_eq!(out[return_at], RETURN);
        let default = i32::from_be_bytes(out[operands..operands + 4].try_into().expect("4 bytes"));
        assert_eq!(default as usize, return_at - switch_at);
        assert_eq!(out.len(), return_at + 1);
    }

    fn stack_map_frames(bytes: &[u8], method: &str) -> Vec<Frame> {
        let class = ClassFile::parse(bytes).expect("parse");
        let code = method_code(bytes, method);
        let stack_map = crate::classfile::find_attribute(
            &class.constant_pool,
            &code.attributes,
            "StackMapTable",
        )
        .expect("attributes")
        .expect("StackMapTable");
        stack_map::parse(&stack_map.info).expect("frames")
    }

    #[test]
    fn goto_pushed_out_of_range_becomes_goto_w() {
        let mut builder = ClassBuilder::new("org/example/Far", Some("Far.java"));
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        //     0: goto 32764
        //     3: aconst_null
        //     4: invokestatic postOnUiThread
        //     7: nop ...
        // 32764: return
        let mut code = vec![GOTO, 0x7f, 0xfc, ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.resize(32764, NOP);
        code.push(RETURN);
        let frames = stack_map::write(&[
            Frame {
                offset_delta: 3,
                kind: FrameKind::Same { extended: false },
            },
            Frame {
                offset_delta: 32760,
                kind: FrameKind::Same { extended: true },
            },
        ])
        .expect("frames");
        let mut body = MethodBody::new(code).lines(&[(0, 1)]);
        body.attributes.push(("StackMapTable", frames));
        builder.method_with("far", "()V", body);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let out = method_code(&bytes, "far").code;

        // ldc, ldc, iconst_1, invokestatic = 8 bytes, plus 2 for goto_w
        let return_at = 32764 + 2 + 8;
        assert_eq!(out[0], GOTO_W);
        assert_eq!(
            i32::from_be_bytes(out[1..5].try_into().expect("4 bytes")),
            return_at as i32
        );
        assert_eq!(out[5], ACONST_NULL);
        assert_eq!(out[6], LDC);
        assert_eq!(out[return_at], RETURN);
        assert_eq!(out.len(), return_at + 1);

        let frames = stack_map_frames(&bytes, "far");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].offset_delta, 5);
        assert_eq!(frames[1].offset_delta, (return_at - 5 - 1) as u16);
        assert_eq!(frames[1].kind, FrameKind::Same { extended: true });
    }

    #[test]
    fn conditional_pushed_out_of_range_jumps_over_goto_w() {
        let mut builder = ClassBuilder::new("org/example/Far", Some("Far.java"));
        let this_class = builder.pool().add_class("org/example/Far").expect("class");
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        //     0: aconst_null
        //     1: astore_2
        //     2: iload_1
        //     3: ifeq 32764
        //     6: aconst_null
        //     7: invokestatic postOnUiThread
        //    10: nop ...
        // 32764: return
        let mut code = vec![ACONST_NULL, ASTORE_2, ILOAD_1, IFEQ, 0x7f, 0xf9, ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.resize(32764, NOP);
        code.push(RETURN);
        let frames = stack_map::write(&[Frame {
            offset_delta: 32764,
            kind: FrameKind::Same { extended: true },
        }])
        .expect("frames");
        let mut body = MethodBody::new(code).lines(&[(0, 1)]);
        body.attributes.push(("StackMapTable", frames));
        builder.method_with("far", "(I)V", body);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let out = method_code(&bytes, "far").code;

        //  3: ifne 11
        //  6: goto_w return
        // 11: aconst_null
        // 12: location sequence, 8 bytes
        let return_at = 32764 + 5 + 8;
        assert_eq!(&out[..3], &[ACONST_NULL, ASTORE_2, ILOAD_1]);
        assert_eq!(&out[3..6], &[IFNE, 0x00, 0x08]);
        assert_eq!(out[6], GOTO_W);
        assert_eq!(
            i32::from_be_bytes(out[7..11].try_into().expect("4 bytes")),
            (return_at - 6) as i32
        );
        assert_eq!(out[11], ACONST_NULL);
        assert_eq!(out[12], LDC);
        assert_eq!(out[20], INVOKESTATIC);
        assert_eq!(out[return_at], RETURN);
        assert_eq!(out.len(), return_at + 1);

        // The fall-through of the inverted branch gets its own frame, and the
        // frame after it no longer depends on its predecessor.
        let frames = stack_map_frames(&bytes, "far");
        assert_eq!(
            frames,
            vec![
                Frame {
                    offset_delta: 11,
                    kind: FrameKind::Full {
                        locals: vec![
                            VerificationType::Object(this_class),
                            VerificationType::Integer,
                            VerificationType::Null,
                        ],
                        stack: Vec::new(),
                    },
                },
                Frame {
                    offset_delta: (return_at - 11 - 1) as u16,
                    kind: FrameKind::Full {
                        locals: vec![
                            VerificationType::Object(this_class),
                            VerificationType::Integer
                        ],
                        stack: Vec::new(),
                    },
                },
            ]
        );
    }

    #[test]
    fn conditions_invert_pairwise() {
        assert_eq!(inverted_condition(IFEQ).expect("ifeq"), IFNE);
        assert_eq!(inverted_condition(IFNE).expect("ifne"), IFEQ);
        assert_eq!(inverted_condition(IF_ACMPNE).expect("if_acmpne"), IF_ACMPNE - 1);
        assert_eq!(inverted_condition(IFNULL).expect("ifnull"), IFNONNULL);
        assert!(inverted_condition(GOTO).is_err());
    }

    #[test]
    fn large_pools_use_wide_constant_loads() {
        let mut builder = ClassBuilder::new("org/example/Big", Some("Big.java"));
        for index in 0..300 {
            builder
                .pool()
                .add_utf8(&format!("filler{index}"))
                .expect("filler");
        }
        let post = builder.method_ref(
            "org/chromium/base/ThreadUtils",
            "postOnUiThread",
            "(Ljava/lang/Runnable;)V",
            false,
        );
        let mut code = vec![ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, post, 0));
        code.push(RETURN);
        builder.method("run", "()V", code, vec![(0, 1)]);

        let (bytes, _) = changed(rewrite_class(&builder.build(), &registry()).expect("rewrite"));
        let out = method_code(&bytes, "run").code;
        assert_eq!(out[1], LDC_W);
        assert_eq!(out[4], LDC_W);
    }

    #[test]
    fn synthetic_registry_drives_rewrites() {
        let registry = TargetRegistry::builder(LocationType {
            class_name: "com/example/Where".to_string(),
            factory_name: "at".to_string(),
        })
        .target(
            CallKind::Static,
            "com/example/Jobs",
            "submit",
            "(Ljava/lang/Runnable;)V",
            false,
        )
        .build()
        .expect("registry");

        let mut builder = ClassBuilder::new("com/example/Client", Some("Client.kt"));
        let submit =
            builder.method_ref("com/example/Jobs", "submit", "(Ljava/lang/Runnable;)V", false);
        let mut code = vec![ACONST_NULL];
        code.extend(invoke(INVOKESTATIC, submit, 0));
        code.push(RETURN);
        builder.method("go", "()V", code, vec![(0, 300)]);

        let (bytes, call_sites) =
            changed(rewrite_class(&builder.build(), &registry).expect("rewrite"));
        let class = ClassFile::parse(&bytes).expect("parse");
        let out = method_code(&bytes, "go").code;

        assert_eq!(&out[5..8], &[SIPUSH, 0x01, 0x2c]);
        let factory = class
            .constant_pool
            .method_ref(u16::from_be_bytes([out[9], out[10]]))
            .expect("factory");
        assert_eq!(factory.owner, "com/example/Where");
        assert_eq!(factory.name, "at");
        assert_eq!(call_sites[0].position.file, "Client.kt");
    }

    #[test]
    fn malformed_class_is_an_error() {
        assert!(rewrite_class(b"\xca\xfe\xba\xbe\x00", &registry()).is_err());

        let (mut input, _) = post_delayed_class(Some(1));
        input.truncate(input.len() - 3);
        assert!(rewrite_class(&input, &registry()).is_err());
    }

    fn string_constant(pool: &ConstantPool, index: u16) -> String {
        match pool.get(index).expect("constant") {
            crate::classfile::constant_pool::Constant::String { string_index } => {
                pool.utf8(*string_index).expect("utf8")
            }
            other => panic!("expected string constant, got {other:?}"),
        }
    }
}
