use super::{Label, LabelTable};
use crate::vm::debug_info::SourceSpan;
use crate::vm::{Instruction, MethodFlags};
use std::fmt;

/// Index of a method in its program
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MethodId(pub usize);

/// What an unlinked jump, call, or address refers to
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Target {
    /// Label in the same method
    Label(Label),

    /// Entry point of a method
    Method(MethodId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Label(label) => write!(f, "{}", label),
            Target::Method(MethodId(idx)) => write!(f, "method#{}", idx),
        }
    }
}

/// Code of one method, before linking
///
/// Label [`Label::ENTRY`] is placed at position 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodCode {
    pub name: String,
    pub instructions: Vec<Instruction<Target>>,
    pub labels: LabelTable,

    /// Instruction index at which each sequence point starts, in order
    pub sequence_points: Vec<(usize, SourceSpan)>,

    pub params: u8,
    pub locals: u8,
    pub flags: MethodFlags,
}

impl MethodCode {
    pub fn returns_value(&self) -> bool {
        self.flags.contains(MethodFlags::RETURNS_VALUE)
    }

    /// Remove every instruction whose entry in `keep` is `false`
    ///
    /// Labels placed on removed instructions move to the next kept instruction. Reference sites
    /// are renumbered (and dropped for removed instructions), as are sequence points.
    pub fn retain(&mut self, keep: &[bool]) {
        // `kept_before[i]` is the new position of the first kept instruction at or after `i`
        let mut kept_before = Vec::with_capacity(self.instructions.len() + 1);
        let mut count = 0;
        for idx in 0..self.instructions.len() {
            kept_before.push(count);
            if keep.get(idx).copied().unwrap_or(true) {
                count += 1;
            }
        }
        kept_before.push(count);

        let is_kept = |idx: usize| keep.get(idx).copied().unwrap_or(true);
        let position = |idx: usize| kept_before[idx.min(kept_before.len() - 1)];

        self.labels
            .remap(position, |site| Some(position(site)).filter(|_| is_kept(site)));
        // A point whose first instruction is removed moves to the next kept one, unless the
        // whole statement is gone
        let len = self.instructions.len();
        let points = std::mem::take(&mut self.sequence_points);
        let ends = points
            .iter()
            .skip(1)
            .map(|(idx, _)| *idx)
            .chain(std::iter::once(len));
        self.sequence_points = points
            .iter()
            .zip(ends)
            .filter(|((idx, _), end)| position(*idx) < position(*end))
            .map(|((idx, span), _)| (position(*idx), *span))
            .collect();

        let mut idx = 0;
        self.instructions.retain(|_| {
            let kept = is_kept(idx);
            idx += 1;
            kept
        });
    }
}

/// Every method of a compilation unit, before linking
///
/// A method's `MethodId` is its index in `methods`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Program {
    pub methods: Vec<MethodCode>,
}
