use super::{Label, LabelTable, MethodCode, Target};
use crate::vm::debug_info::SourceSpan;
use crate::vm::{Error, Instruction, InstructionSet, MethodFlags, OpCode, Operand, StackEffect};
use std::collections::HashMap;

/// Growable instruction sequence for one method, with some bookkeeping on the side
///
/// ### Tracking stack depth
///
/// Every instruction pushed goes through the instruction set descriptor: its operand is checked
/// against the opcode's encoding, and its stack effect is applied to the current depth (which
/// can never go negative). Jumps record the depth they expect at their target label, and placing
/// the label checks the depth matches. Handlers are special: a `TRY` expects its `catch` label to
/// be entered with the exception pushed on top of the stack, and its `finally` label at the same
/// depth as the `TRY` itself.
///
/// ### Tracking reachability
///
/// After an instruction that never falls through (a return, an unconditional jump, ...) the
/// code that follows is unreachable until a label that has already been jumped to is placed.
/// Unreachable code is still emitted (the block graph and optimizer take care of it), but the
/// method emitter uses reachability to avoid emitting pointless jumps and to detect when control
/// falls off the end of a method.
pub struct CodeBuffer<'i> {
    isa: &'i dyn InstructionSet,

    instructions: Vec<Instruction<Target>>,
    labels: LabelTable,

    /// Stack depth on entry to a label (known from a jump to it or from placing it)
    label_depths: HashMap<Label, usize>,

    sequence_points: Vec<(usize, SourceSpan)>,

    depth: usize,
    max_depth: usize,
    reachable: bool,
}

impl<'i> CodeBuffer<'i> {
    /// New empty buffer, with the entry label placed at the start
    pub fn new(isa: &'i dyn InstructionSet) -> Self {
        let mut label_depths = HashMap::new();
        label_depths.insert(Label::ENTRY, 0);
        CodeBuffer {
            isa,
            instructions: vec![],
            labels: LabelTable::new(),
            label_depths,
            sequence_points: vec![],
            depth: 0,
            max_depth: 0,
            reachable: true,
        }
    }

    pub fn isa(&self) -> &'i dyn InstructionSet {
        self.isa
    }

    /// Number of instructions so far (aka. position of the next instruction)
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Current evaluation stack depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Can control reach the next instruction pushed?
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn instruction(&self, site: usize) -> Option<&Instruction<Target>> {
        self.instructions.get(site)
    }

    /// Generate a fresh label
    pub fn fresh_label(&mut self) -> Label {
        self.labels.create()
    }

    /// Push an instruction whose stack effect is fixed by the instruction set
    ///
    /// Returns the position of the instruction.
    pub fn push(&mut self, insn: Instruction<Target>) -> Result<usize, Error> {
        match insn.check(self.isa)?.stack {
            StackEffect::Fixed { pops, pushes } => {
                self.push_with_effect(insn, pops as usize, pushes as usize)
            }
            StackEffect::Dynamic => Err(Error::UnspecifiedStackEffect(insn.opcode)),
        }
    }

    /// Push an instruction with an explicit stack effect (eg. a call, whose effect depends on
    /// the callee)
    pub fn push_dynamic(
        &mut self,
        insn: Instruction<Target>,
        pops: usize,
        pushes: usize,
    ) -> Result<usize, Error> {
        self.push_with_effect(insn, pops, pushes)
    }

    fn push_with_effect(
        &mut self,
        insn: Instruction<Target>,
        pops: usize,
        pushes: usize,
    ) -> Result<usize, Error> {
        let info = insn.check(self.isa)?;
        if pops > self.depth {
            return Err(Error::StackUnderflow {
                opcode: insn.opcode,
                depth: self.depth,
                pops,
            });
        }
        self.depth -= pops;

        let site = self.instructions.len();
        match &insn.operand {
            Operand::Jump(Target::Label(label), _) => {
                self.labels.reference(*label, site)?;
                self.expect_depth(*label, self.depth)?;
            }
            Operand::Try { catch, finally, .. } => {
                if let Some(Target::Label(catch)) = catch {
                    self.labels.reference(*catch, site)?;
                    self.expect_depth(*catch, self.depth + 1)?;
                }
                if let Some(Target::Label(finally)) = finally {
                    self.labels.reference(*finally, site)?;
                    self.expect_depth(*finally, self.depth)?;
                }
            }
            Operand::Address(Target::Label(label)) => self.labels.reference(*label, site)?,
            _ => (),
        }

        self.depth += pushes;
        self.max_depth = self.max_depth.max(self.depth);
        if !info.flow.falls_through() {
            self.reachable = false;
        }
        self.instructions.push(insn);
        Ok(site)
    }

    /// Record (or check) the stack depth on entry to a label
    ///
    /// Mismatches in unreachable code are ignored: the depth there is not meaningful.
    fn expect_depth(&mut self, label: Label, depth: usize) -> Result<(), Error> {
        match self.label_depths.get(&label) {
            Some(expected) if *expected != depth && self.reachable => {
                Err(Error::IncompatibleStackDepth {
                    label,
                    expected: *expected,
                    found: depth,
                })
            }
            Some(_) => Ok(()),
            None => {
                self.label_depths.insert(label, depth);
                Ok(())
            }
        }
    }

    /// Place a label at the current position
    ///
    /// If code is currently unreachable, the label makes it reachable again only if it has
    /// already been jumped to.
    pub fn place_label(&mut self, label: Label) -> Result<(), Error> {
        self.labels.place(label, self.instructions.len())?;
        match self.label_depths.get(&label) {
            Some(expected) => {
                if self.reachable && *expected != self.depth {
                    return Err(Error::IncompatibleStackDepth {
                        label,
                        expected: *expected,
                        found: self.depth,
                    });
                }
                self.depth = *expected;
            }
            None => {
                if !self.reachable {
                    self.depth = 0;
                }
                self.label_depths.insert(label, self.depth);
            }
        }
        if !self.labels.references(label).is_empty() {
            self.reachable = true;
        }
        Ok(())
    }

    /// Place a label that may be jumped to later from anywhere (eg. a user-written label), so
    /// the code after it is always considered reachable
    pub fn place_entry_label(&mut self, label: Label) -> Result<(), Error> {
        self.place_label(label)?;
        self.reachable = true;
        Ok(())
    }

    /// Replace the jump at `site` with a jump of a different kind to a different label
    ///
    /// The stack depth expected at the new label is the one that was expected at the old one.
    pub fn retarget(&mut self, site: usize, opcode: OpCode, label: Label) -> Result<(), Error> {
        let old_target = match self.instructions.get(site).map(|insn| &insn.operand) {
            Some(Operand::Jump(Target::Label(old), _)) => *old,
            Some(_) | None => {
                return Err(Error::MalformedOperand {
                    opcode,
                    reason: "only label jumps can be retargeted",
                })
            }
        };
        let new_insn = Instruction::jump(opcode, Target::Label(label));
        new_insn.check(self.isa)?;

        self.labels.unreference(old_target, site)?;
        self.labels.reference(label, site)?;
        if let Some(depth) = self.label_depths.get(&old_target).copied() {
            if let Some(expected) = self.label_depths.get(&label) {
                if *expected != depth {
                    return Err(Error::IncompatibleStackDepth {
                        label,
                        expected: *expected,
                        found: depth,
                    });
                }
            } else {
                self.label_depths.insert(label, depth);
            }
        }
        self.instructions[site] = new_insn;
        Ok(())
    }

    /// Overwrite the immediate bytes of an already pushed instruction
    pub fn patch_operand(&mut self, site: usize, bytes: Vec<u8>) -> Result<(), Error> {
        let insn = match self.instructions.get(site) {
            Some(insn) => Instruction::with_bytes(insn.opcode, bytes),
            None => {
                return Err(Error::MalformedOperand {
                    opcode: OpCode::NOP,
                    reason: "no instruction to patch",
                })
            }
        };
        insn.check(self.isa)?;
        self.instructions[site] = insn;
        Ok(())
    }

    /// Mark the start of a new statement at the current position
    pub fn add_sequence_point(&mut self, span: SourceSpan) {
        let position = self.instructions.len();
        match self.sequence_points.last_mut() {
            // An earlier statement emitted nothing: the new one takes over its position
            Some((last_position, last_span)) if *last_position == position => *last_span = span,
            _ => self.sequence_points.push((position, span)),
        }
    }

    /// Turn the buffer into method code
    ///
    /// Fails if some label is referenced but never placed.
    pub fn finish(
        self,
        name: String,
        params: u8,
        locals: u8,
        flags: MethodFlags,
    ) -> Result<MethodCode, Error> {
        if let Some(label) = self.labels.unplaced().next() {
            return Err(Error::UnplacedLabel {
                method: name,
                label,
            });
        }
        let len = self.instructions.len();
        let sequence_points = self
            .sequence_points
            .into_iter()
            .filter(|(position, _)| *position < len)
            .collect();
        Ok(MethodCode {
            name,
            instructions: self.instructions,
            labels: self.labels,
            sequence_points,
            params,
            locals,
            flags,
        })
    }
}
