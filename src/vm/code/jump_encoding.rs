//! Assign addresses to every instruction and pick the width of every jump
//!
//! This module is responsible for turning symbolic code (where jumps refer to labels and calls
//! refer to methods) into addressed code (where jumps carry relative byte offsets). Jump offsets
//! are relative to the address of the jumping instruction itself. Every jump-like opcode comes in
//! two forms: a narrow one with a signed 8-bit offset, and a wide one with a signed 32-bit
//! offset. We want the narrow form whenever the offset fits.
//!
//! ### Termination
//!
//! The catch is that the width of a jump affects the addresses of everything after it, so
//! choosing widths is a fixed point computation. We start with every jump narrow and repeatedly
//! widen the narrow jumps whose offset does not fit. This always finishes because widths only
//! ever grow:
//!
//!   - widening a jump only makes the distance between any two instructions larger (or leaves
//!     it unchanged), so a jump whose offset did not fit in a narrow encoding will never fit
//!     again and never needs to be shrunk back
//!
//!   - every pass that does not reach the fixed point widens at least one jump, and there are
//!     only so many jumps
//!
//! So there are at most `jumps + 1` passes. That bound is checked anyway, but only as a safety
//! net against a broken instruction set descriptor: exceeding it is a fatal internal error.
//!
//! ### Unlinking
//!
//! Addressed code can be turned back into symbolic code (with a fresh label at every jump
//! target). Since linking always starts from narrow jumps, linking unlinked code produces exactly
//! the same bytes again.

use super::{Label, LabelTable, MethodCode, MethodId, Program, Target};
use crate::util::{Offset, OffsetVec, Width};
use crate::vm::binary_format::Serialize;
use crate::vm::debug_info::SequencePoint;
use crate::vm::{
    Error, FlowKind, Instruction, InstructionSet, JumpWidth, MethodFlags, Operand,
};
use std::collections::HashMap;

/// Method code after linking
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkedMethod {
    pub name: String,
    pub params: u8,
    pub locals: u8,
    pub flags: MethodFlags,

    /// Instructions, at their final addresses in the script
    pub instructions: OffsetVec<Instruction<i32>>,

    /// Ordered by address
    pub sequence_points: Vec<SequencePoint>,
}

impl LinkedMethod {
    /// Address of the first instruction
    pub fn start(&self) -> Offset {
        self.instructions.initial_offset()
    }

    /// Address just past the last instruction
    pub fn end(&self) -> Offset {
        self.instructions.offset_len()
    }

    pub fn returns_value(&self) -> bool {
        self.flags.contains(MethodFlags::RETURNS_VALUE)
    }

    /// Index of the instruction at the destination of a relative jump from `address`
    pub fn target_index(&self, address: Offset, relative: i32) -> Result<usize, Error> {
        let target = address.0 as isize + relative as isize;
        let invalid = Error::InvalidJumpTarget {
            from: address,
            target,
        };
        match usize::try_from(target) {
            Ok(target) => self.instructions.get_offset(Offset(target)).index().ok_or(invalid),
            Err(_) => Err(invalid),
        }
    }
}

/// Every method of a compilation unit, after linking (methods are laid out in order)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkedProgram {
    pub methods: Vec<LinkedMethod>,
}

impl LinkedProgram {
    /// Encoded bytes of all the methods
    pub fn script(&self) -> Result<Vec<u8>, Error> {
        let len = self.methods.last().map_or(0, |method| method.end().0);
        let mut bytes = Vec::with_capacity(len);
        for method in &self.methods {
            for (_, _, insn) in &method.instructions {
                insn.serialize(&mut bytes)?;
            }
        }
        Ok(bytes)
    }

    /// Method whose code contains the address
    pub fn method_containing(&self, address: Offset) -> Option<(MethodId, &LinkedMethod)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, method)| method.start() <= address && address < method.end())
            .map(|(idx, method)| (MethodId(idx), method))
    }
}

/// Encoded width of an instruction if its jump width were `width`
fn encoded_width<T>(insn: &Instruction<T>, width: Option<JumpWidth>) -> usize {
    match (&insn.operand, width) {
        (Operand::Jump(_, _), Some(width)) => 1 + width.bytes(),
        (Operand::Try { .. }, Some(width)) => 1 + 2 * width.bytes(),
        _ => insn.width(),
    }
}

/// Link all of the methods of a program
///
/// Methods are laid out in order, starting at address 0.
pub fn link(program: &Program, isa: &dyn InstructionSet) -> Result<LinkedProgram, Error> {
    // Global instruction index of the first instruction of every method
    let mut method_starts: Vec<usize> = Vec::with_capacity(program.methods.len());
    let mut total = 0;
    for method in &program.methods {
        method_starts.push(total);
        total += method.instructions.len();
    }

    // Resolve every target to a global instruction index
    let mut flat: Vec<Instruction<usize>> = Vec::with_capacity(total);
    for (method_idx, method) in program.methods.iter().enumerate() {
        let base = method_starts[method_idx];
        for insn in &method.instructions {
            insn.check(isa)?;
            flat.push(insn.map_targets(|target| match target {
                Target::Label(label) => resolve_label(method, *label).map(|idx| base + idx),
                Target::Method(id) => match program.methods.get(id.0) {
                    Some(callee) if !callee.instructions.is_empty() => Ok(method_starts[id.0]),
                    _ => Err(Error::UnknownMethod(*id)),
                },
            })?);
        }
    }

    // Pick jump widths
    let mut widths: Vec<Option<JumpWidth>> = flat
        .iter()
        .map(|insn| insn.jump_width().map(|_| JumpWidth::Narrow))
        .collect();
    let max_iterations = widths.iter().flatten().count() + 1;
    let mut iterations = 0;
    let addresses = loop {
        iterations += 1;
        if iterations > max_iterations {
            return Err(Error::EncodingDidNotConverge {
                iterations: max_iterations,
            });
        }

        let addresses = compute_addresses(&flat, &widths);
        let mut widened = 0;
        for (idx, insn) in flat.iter().enumerate() {
            if widths[idx] == Some(JumpWidth::Narrow) {
                let fits = insn.targets().all(|target| {
                    JumpWidth::Narrow.fits(addresses[*target] as isize - addresses[idx] as isize)
                });
                if !fits {
                    widths[idx] = Some(JumpWidth::Wide);
                    widened += 1;
                }
            }
        }
        if widened == 0 {
            break addresses;
        }
        log::trace!("pass {}: widened {} jumps", iterations, widened);
    };

    // Produce the final instructions
    let mut methods = Vec::with_capacity(program.methods.len());
    for (method_idx, method) in program.methods.iter().enumerate() {
        let base = method_starts[method_idx];
        let mut instructions = OffsetVec::new_starting_at(Offset(addresses[base]));
        for local_idx in 0..method.instructions.len() {
            let idx = base + local_idx;
            let address = addresses[idx];
            let insn = &flat[idx];
            let mut linked = insn.map_targets(|target| {
                let offset = addresses[*target] as isize - address as isize;
                i32::try_from(offset).map_err(|_| Error::JumpOffsetOverflow {
                    address: Offset(address),
                    offset,
                })
            })?;
            if let Some(width) = widths[idx] {
                linked.opcode = isa.with_width(linked.opcode, width)?;
                set_width(&mut linked.operand, width);
            }
            instructions.push(linked);
        }

        let sequence_points = method
            .sequence_points
            .iter()
            .filter(|(local_idx, _)| *local_idx < method.instructions.len())
            .map(|(local_idx, span)| SequencePoint {
                address: Offset(addresses[base + local_idx]),
                span: *span,
            })
            .collect();

        methods.push(LinkedMethod {
            name: method.name.clone(),
            params: method.params,
            locals: method.locals,
            flags: method.flags,
            instructions,
            sequence_points,
        });
    }

    log::debug!(
        "linked {} methods into {} bytes ({} passes)",
        methods.len(),
        addresses[total],
        iterations
    );
    Ok(LinkedProgram { methods })
}

fn resolve_label(method: &MethodCode, label: Label) -> Result<usize, Error> {
    match method.labels.position(label) {
        None => Err(Error::UnplacedLabel {
            method: method.name.clone(),
            label,
        }),
        Some(position) if position >= method.instructions.len() => Err(Error::LabelPastEnd {
            method: method.name.clone(),
            label,
        }),
        Some(position) => Ok(position),
    }
}

/// Address of every instruction, plus the end address
fn compute_addresses(flat: &[Instruction<usize>], widths: &[Option<JumpWidth>]) -> Vec<usize> {
    let mut addresses = Vec::with_capacity(flat.len() + 1);
    let mut address = 0;
    for (insn, width) in flat.iter().zip(widths) {
        addresses.push(address);
        address += encoded_width(insn, *width);
    }
    addresses.push(address);
    addresses
}

fn set_width<T>(operand: &mut Operand<T>, new_width: JumpWidth) {
    match operand {
        Operand::Jump(_, width) | Operand::Try { width, .. } => *width = new_width,
        _ => (),
    }
}

/// Turn linked code back into symbolic code
///
/// Calls (and addresses) that land on the first instruction of a method become method targets.
/// Every other target must be inside the same method, and gets a label. Jumps are turned back
/// into their narrow form.
pub fn unlink(linked: &LinkedProgram, isa: &dyn InstructionSet) -> Result<Program, Error> {
    let method_entries: HashMap<Offset, MethodId> = linked
        .methods
        .iter()
        .enumerate()
        .filter(|(_, method)| !method.instructions.is_empty())
        .map(|(idx, method)| (method.start(), MethodId(idx)))
        .collect();

    let mut methods = Vec::with_capacity(linked.methods.len());
    for method in &linked.methods {
        let mut labels = LabelTable::new();
        let mut label_at: HashMap<usize, Label> = HashMap::new();
        label_at.insert(0, Label::ENTRY);

        let mut instructions = Vec::with_capacity(method.instructions.len());
        for (address, idx, insn) in &method.instructions {
            let flow = isa.lookup(insn.opcode)?.flow;
            let prefers_method = flow == FlowKind::Call || matches!(insn.operand, Operand::Address(_));
            let mut symbolic = insn.map_targets(|relative| {
                let absolute = address.0 as isize + *relative as isize;
                if prefers_method {
                    if let Some(id) = usize::try_from(absolute)
                        .ok()
                        .and_then(|absolute| method_entries.get(&Offset(absolute)))
                    {
                        return Ok(Target::Method(*id));
                    }
                }
                let target_idx = method.target_index(address, *relative)?;
                let label = *label_at
                    .entry(target_idx)
                    .or_insert_with(|| labels.create());
                labels.reference(label, idx)?;
                Ok::<Target, Error>(Target::Label(label))
            })?;
            if symbolic.jump_width().is_some() {
                symbolic.opcode = isa.with_width(symbolic.opcode, JumpWidth::Narrow)?;
                set_width(&mut symbolic.operand, JumpWidth::Narrow);
            }
            instructions.push(symbolic);
        }

        let mut targets: Vec<(usize, Label)> = label_at.into_iter().collect();
        targets.sort();
        for (position, label) in targets {
            if label != Label::ENTRY {
                labels.place(label, position)?;
            }
        }

        let sequence_points = method
            .sequence_points
            .iter()
            .filter_map(|point| {
                method
                    .instructions
                    .get_offset(point.address)
                    .index()
                    .map(|idx| (idx, point.span))
            })
            .collect();

        methods.push(MethodCode {
            name: method.name.clone(),
            instructions,
            labels,
            sequence_points,
            params: method.params,
            locals: method.locals,
            flags: method.flags,
        });
    }
    Ok(Program { methods })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::code::CodeBuffer;
    use crate::vm::{OpCode, StandardInstructionSet};

    fn ret() -> Instruction<Target> {
        Instruction::simple(OpCode::RET)
    }

    /// Bare method around the given instructions
    fn method(name: &str, insns: Vec<Instruction<Target>>, labels: LabelTable) -> MethodCode {
        MethodCode {
            name: String::from(name),
            instructions: insns,
            labels,
            sequence_points: vec![],
            params: 0,
            locals: 0,
            flags: MethodFlags::empty(),
        }
    }

    fn nops(count: usize) -> impl Iterator<Item = Instruction<Target>> {
        (0..count).map(|_| Instruction::simple(OpCode::NOP))
    }

    fn relinks_identically(program: &Program) -> LinkedProgram {
        let isa = StandardInstructionSet;
        let linked = link(program, &isa).unwrap();
        let relinked = link(&unlink(&linked, &isa).unwrap(), &isa).unwrap();
        assert_eq!(linked.script().unwrap(), relinked.script().unwrap());
        linked
    }

    /// Check that every jump lands where its label was placed
    fn assert_targets_match(program: &Program, linked: &LinkedProgram) {
        for (method, linked_method) in program.methods.iter().zip(&linked.methods) {
            for ((address, idx, insn), symbolic) in
                linked_method.instructions.iter().zip(&method.instructions)
            {
                for (relative, target) in insn.targets().zip(symbolic.targets()) {
                    if let Target::Label(label) = target {
                        assert_eq!(
                            linked_method.target_index(address, *relative).unwrap(),
                            method.labels.position(*label).unwrap(),
                            "jump at index {} of {}",
                            idx,
                            method.name
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn no_jumps() {
        let program = Program {
            methods: vec![method(
                "main",
                vec![Instruction::simple(OpCode::PUSH1), ret()],
                LabelTable::new(),
            )],
        };
        let linked = relinks_identically(&program);
        assert_eq!(linked.script().unwrap(), vec![0x11, 0x40]);
    }

    #[test]
    fn short_jumps_stay_narrow() {
        let mut labels = LabelTable::new();
        let end = labels.create();
        labels.reference(end, 0).unwrap();
        labels.reference(Label::ENTRY, 11).unwrap();
        labels.place(end, 12).unwrap();
        let insns = std::iter::once(Instruction::jump(OpCode::JMPIF, Target::Label(end)))
            .chain(nops(10))
            .chain(std::iter::once(Instruction::jump(
                OpCode::JMP,
                Target::Label(Label::ENTRY),
            )))
            .chain(std::iter::once(ret()))
            .collect();
        let program = Program {
            methods: vec![method("main", insns, labels)],
        };
        let linked = relinks_identically(&program);
        let script = linked.script().unwrap();
        assert_eq!(&script[..2], &[0x24, 14]);
        assert_eq!(&script[12..14], &[0x22, (-12i8) as u8]);
        assert_targets_match(&program, &linked);
    }

    #[test]
    fn long_jumps_widen() {
        let mut labels = LabelTable::new();
        let end = labels.create();
        labels.reference(end, 0).unwrap();
        labels.reference(Label::ENTRY, 201).unwrap();
        labels.place(end, 202).unwrap();
        let insns = std::iter::once(Instruction::jump(OpCode::JMPIFNOT, Target::Label(end)))
            .chain(nops(200))
            .chain(std::iter::once(Instruction::jump(
                OpCode::JMP,
                Target::Label(Label::ENTRY),
            )))
            .chain(std::iter::once(ret()))
            .collect();
        let program = Program {
            methods: vec![method("main", insns, labels)],
        };
        let linked = relinks_identically(&program);
        let insns = &linked.methods[0].instructions;
        assert_eq!(
            insns.get_index(0).unwrap().1,
            &Instruction {
                opcode: OpCode::JMPIFNOT_L,
                operand: Operand::Jump(210, JumpWidth::Wide),
            }
        );
        assert_eq!(
            insns.get_index(201).unwrap(),
            (
                Offset(205),
                &Instruction {
                    opcode: OpCode::JMP_L,
                    operand: Operand::Jump(-205, JumpWidth::Wide),
                }
            )
        );
        assert_targets_match(&program, &linked);
    }

    // Widening one jump pushes a barely-narrow jump over the edge
    #[test]
    fn cascading_widening() {
        let mut labels = LabelTable::new();
        let near = labels.create();
        let far = labels.create();
        labels.reference(near, 0).unwrap();
        labels.reference(far, 1).unwrap();
        labels.place(near, 125).unwrap();
        labels.place(far, 326).unwrap();
        let insns = vec![
            Instruction::jump(OpCode::JMP, Target::Label(near)),
            Instruction::jump(OpCode::JMP, Target::Label(far)),
        ]
        .into_iter()
        .chain(nops(324))
        .chain(std::iter::once(ret()))
        .collect();
        let program = Program {
            methods: vec![method("main", insns, labels)],
        };

        // Before widening, `near` is exactly 127 bytes away
        let linked = relinks_identically(&program);
        let insns = &linked.methods[0].instructions;
        assert_eq!(
            insns.get_index(0).unwrap().1.operand,
            Operand::Jump(133, JumpWidth::Wide)
        );
        assert_eq!(insns.get_index(1).unwrap().1.opcode, OpCode::JMP_L);
        assert_targets_match(&program, &linked);
    }

    #[test]
    fn calls_between_methods() {
        let isa = StandardInstructionSet;
        let mut caller = CodeBuffer::new(&isa);
        caller
            .push_dynamic(
                Instruction::jump(OpCode::CALL, Target::Method(MethodId(1))),
                0,
                1,
            )
            .unwrap();
        caller.push_dynamic(ret(), 1, 0).unwrap();
        let caller = caller
            .finish(String::from("caller"), 0, 0, MethodFlags::RETURNS_VALUE)
            .unwrap();

        let mut callee = CodeBuffer::new(&isa);
        callee.push(Instruction::simple(OpCode::PUSH5)).unwrap();
        callee.push_dynamic(ret(), 1, 0).unwrap();
        let callee = callee
            .finish(String::from("callee"), 0, 0, MethodFlags::RETURNS_VALUE)
            .unwrap();

        let program = Program {
            methods: vec![caller, callee],
        };
        let linked = relinks_identically(&program);
        assert_eq!(linked.methods[1].start(), Offset(3));
        assert_eq!(linked.script().unwrap(), vec![0x34, 3, 0x40, 0x15, 0x40]);
        assert_eq!(
            linked.method_containing(Offset(4)).map(|(id, _)| id),
            Some(MethodId(1))
        );
    }

    #[test]
    fn try_handlers_widen_together() {
        let mut labels = LabelTable::new();
        let catch = labels.create();
        let end = labels.create();
        labels.reference(catch, 0).unwrap();
        labels.reference(end, 1).unwrap();
        labels.reference(end, 132).unwrap();
        labels.place(catch, 2).unwrap();
        labels.place(end, 133).unwrap();
        let insns = vec![
            Instruction::try_region(Some(Target::Label(catch)), None),
            Instruction::jump(OpCode::ENDTRY, Target::Label(end)),
            Instruction::simple(OpCode::DROP),
        ]
        .into_iter()
        .chain(nops(129))
        .chain(vec![
            Instruction::jump(OpCode::ENDTRY, Target::Label(end)),
            ret(),
        ])
        .collect();
        let program = Program {
            methods: vec![method("main", insns, labels)],
        };
        let linked = relinks_identically(&program);
        let insns = &linked.methods[0].instructions;
        assert_eq!(
            insns.get_index(0).unwrap().1,
            &Instruction {
                opcode: OpCode::TRY,
                operand: Operand::Try {
                    catch: Some(8),
                    finally: None,
                    width: JumpWidth::Narrow,
                },
            }
        );
        assert_eq!(insns.get_index(1).unwrap().1.opcode, OpCode::ENDTRY_L);
        assert_targets_match(&program, &linked);
    }

    #[test]
    fn unplaced_and_misplaced_labels() {
        let isa = StandardInstructionSet;

        let mut labels = LabelTable::new();
        let nowhere = labels.create();
        labels.reference(nowhere, 0).unwrap();
        let program = Program {
            methods: vec![method(
                "main",
                vec![Instruction::jump(OpCode::JMP, Target::Label(nowhere))],
                labels,
            )],
        };
        assert!(matches!(
            link(&program, &isa),
            Err(Error::UnplacedLabel { label, .. }) if label == nowhere
        ));

        let mut labels = LabelTable::new();
        let past_end = labels.create();
        labels.reference(past_end, 0).unwrap();
        labels.place(past_end, 1).unwrap();
        let program = Program {
            methods: vec![method(
                "main",
                vec![Instruction::jump(OpCode::JMP, Target::Label(past_end))],
                labels,
            )],
        };
        assert!(matches!(
            link(&program, &isa),
            Err(Error::LabelPastEnd { label, .. }) if label == past_end
        ));

        let program = Program {
            methods: vec![method(
                "main",
                vec![Instruction::jump(OpCode::CALL, Target::Method(MethodId(4)))],
                LabelTable::new(),
            )],
        };
        assert!(matches!(
            link(&program, &isa),
            Err(Error::UnknownMethod(MethodId(4)))
        ));
    }
}
