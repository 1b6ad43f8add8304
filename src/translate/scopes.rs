use super::{Error, StructuralKind};
use crate::ir::SourceSpan;
use crate::vm::code::Label;
use std::collections::{HashMap, HashSet};

/// Where in a `try` statement code is currently being emitted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Method body (outside of any `try` statement)
    Default,
    InTry,
    InCatch,
    InFinally,
}

impl FrameState {
    fn can_become(self, to: FrameState) -> bool {
        matches!(
            (self, to),
            (FrameState::InTry, FrameState::InCatch)
                | (FrameState::InTry, FrameState::InFinally)
                | (FrameState::InCatch, FrameState::InFinally)
        )
    }
}

/// Where a non-local transfer of control (`break`, `continue`, `return`, `goto`) is headed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// Label owned by the frame at this index in the stack of active frames
    Known { label: Label, frame: usize },

    /// User label (which may not have been declared yet)
    Goto(String),
}

/// How the emitter should emit a transfer
///
/// Either way, the emitter pushes `JMP label`. A pending jump must then be registered with
/// [`ScopeTracker::add_pending`] so that it can be rewritten once the enclosing `try` statement
/// is complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferPlan {
    Direct(Label),
    Pending(Label),
}

/// Placeholder jump whose final form depends on frames that are still open
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingGoto {
    /// Position of the placeholder `JMP`
    pub site: usize,
    pub dest: Destination,
    pub span: Option<SourceSpan>,

    /// Block of its frame the jump was made from
    from: FrameState,
}

/// Transfer that leaves a `try` statement
///
/// Every site must become `ENDTRY stub` and the stub (placed after the statement) continues the
/// transfer from the enclosing frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stub {
    pub dest: Destination,
    pub sites: Vec<usize>,

    /// Span of the first transfer to this destination
    pub span: Option<SourceSpan>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct FrameId(usize);

#[derive(Debug)]
struct Frame {
    id: FrameId,
    state: FrameState,

    /// Loops and switches opened (and not yet closed) directly in this frame
    break_targets: usize,

    /// Loops opened (and not yet closed) directly in this frame
    continue_targets: usize,

    /// Slot holding the exception being handled, when in a `catch`
    exception_slot: Option<u32>,

    pending: Vec<PendingGoto>,
}

impl Frame {
    fn new(id: FrameId, state: FrameState) -> Frame {
        Frame {
            id,
            state,
            break_targets: 0,
            continue_targets: 0,
            exception_slot: None,
            pending: vec![],
        }
    }
}

#[derive(Debug)]
struct Breakable {
    break_label: Label,

    /// Only loops have one
    continue_label: Option<Label>,
}

#[derive(Debug)]
struct UserLabel {
    label: Label,

    /// Frame and block (`try`, `catch` or `finally`) the label was placed in
    declared_in: Option<(FrameId, FrameState)>,
}

/// Bookkeeping for exception scopes and non-local transfers of control in one method
///
/// The tracker holds a stack of frames: the bottom one is the method body and every `try`
/// statement being emitted pushes another. A transfer that stays inside its frame is a plain
/// jump. A transfer that leaves the frame must go through `ENDTRY` so that the VM runs the
/// `finally` block (and pops the exception handler). Since the emitter does not always know
/// when it emits a jump whether it leaves the frame (a `goto` to a label not declared yet), such
/// jumps are emitted as placeholders and resolved when the frame is popped.
#[derive(Debug)]
pub struct ScopeTracker {
    method: String,
    frames: Vec<Frame>,
    breakables: Vec<Breakable>,
    user_labels: HashMap<String, UserLabel>,

    /// Frames that have been popped (labels in them can no longer be jumped to)
    closed: HashSet<FrameId>,

    next_frame: usize,
}

impl ScopeTracker {
    pub fn new(method: impl Into<String>) -> ScopeTracker {
        ScopeTracker {
            method: method.into(),
            frames: vec![Frame::new(FrameId(0), FrameState::Default)],
            breakables: vec![],
            user_labels: HashMap::new(),
            closed: HashSet::new(),
            next_frame: 1,
        }
    }

    fn structural(&self, kind: StructuralKind, span: Option<SourceSpan>) -> Error {
        Error::Structural {
            method: self.method.clone(),
            span,
            kind,
        }
    }

    fn current(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Index of the innermost frame (0 outside of any `try` statement)
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn state(&self) -> FrameState {
        self.current().state
    }

    /// Enter the protected region of a new `try` statement
    pub fn push_try(&mut self) {
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.push(Frame::new(id, FrameState::InTry));
    }

    /// Move the innermost frame to its `catch` or `finally` block
    pub fn transition(&mut self, to: FrameState) -> Result<(), Error> {
        let from = self.state();
        if !from.can_become(to) {
            return Err(Error::ScopeState {
                method: self.method.clone(),
                from,
                to,
            });
        }
        let frame = self.current_mut();
        frame.state = to;
        frame.exception_slot = None;
        Ok(())
    }

    /// Enter a `catch` block, with the exception stored in `slot` (if it is stored at all)
    pub fn enter_catch(&mut self, slot: Option<u32>) -> Result<(), Error> {
        self.transition(FrameState::InCatch)?;
        self.current_mut().exception_slot = slot;
        Ok(())
    }

    /// Slot holding the exception a `rethrow` should throw
    ///
    /// This is the exception of the innermost enclosing `catch`, as long as no `finally` block
    /// lies in between.
    pub fn caught_exception(&self) -> Option<u32> {
        for frame in self.frames.iter().rev() {
            match frame.state {
                FrameState::InCatch => return frame.exception_slot,
                FrameState::InTry => continue,
                FrameState::InFinally | FrameState::Default => return None,
            }
        }
        None
    }

    /// Leave the `try` statement of the innermost frame
    ///
    /// Returns the stubs needed for transfers leaving the statement, in the order the first
    /// transfer to each destination was emitted.
    pub fn pop_try(&mut self) -> Result<Vec<Stub>, Error> {
        let not_in_try = || Error::NoOpenTry {
            method: self.method.clone(),
        };
        if self.frames.len() <= 1 {
            return Err(not_in_try());
        }
        let frame = self.frames.pop().ok_or_else(not_in_try)?;
        self.closed.insert(frame.id);

        let mut stubs: Vec<Stub> = vec![];
        for pending in frame.pending {
            if let Destination::Goto(name) = &pending.dest {
                match self.declared_in(name) {
                    Some((id, block)) if id == frame.id => {
                        if block == pending.from {
                            continue;
                        }
                        let kind = cross_block(name, pending.from);
                        return Err(self.structural(kind, pending.span));
                    }
                    Some((id, _)) if self.closed.contains(&id) => {
                        let kind = StructuralKind::GotoIntoProtectedRegion(name.clone());
                        return Err(self.structural(kind, pending.span));
                    }
                    _ => (),
                }
            }
            if pending.from == FrameState::InFinally {
                return Err(self.structural(StructuralKind::LeaveFinally, pending.span));
            }
            match stubs.iter_mut().find(|stub| stub.dest == pending.dest) {
                Some(stub) => stub.sites.push(pending.site),
                None => stubs.push(Stub {
                    dest: pending.dest,
                    sites: vec![pending.site],
                    span: pending.span,
                }),
            }
        }
        Ok(stubs)
    }

    /// Open a loop in the innermost frame
    pub fn open_loop(&mut self, break_label: Label, continue_label: Label) {
        let frame = self.current_mut();
        frame.break_targets += 1;
        frame.continue_targets += 1;
        self.breakables.push(Breakable {
            break_label,
            continue_label: Some(continue_label),
        });
    }

    /// Open a switch in the innermost frame
    pub fn open_switch(&mut self, break_label: Label) {
        self.current_mut().break_targets += 1;
        self.breakables.push(Breakable {
            break_label,
            continue_label: None,
        });
    }

    /// Close the innermost loop or switch
    pub fn close_breakable(&mut self) {
        if let Some(closed) = self.breakables.pop() {
            let frame = self.current_mut();
            frame.break_targets -= 1;
            if closed.continue_label.is_some() {
                frame.continue_targets -= 1;
            }
        }
    }

    /// Destination of a bare `break`
    pub fn break_target(&self) -> Option<Destination> {
        let frame = self.frames.iter().rposition(|frame| frame.break_targets > 0)?;
        let breakable = self.breakables.last()?;
        Some(Destination::Known {
            label: breakable.break_label,
            frame,
        })
    }

    /// Destination of a bare `continue`
    pub fn continue_target(&self) -> Option<Destination> {
        let frame = self
            .frames
            .iter()
            .rposition(|frame| frame.continue_targets > 0)?;
        let label = self
            .breakables
            .iter()
            .rev()
            .find_map(|breakable| breakable.continue_label)?;
        Some(Destination::Known { label, frame })
    }

    fn declared_in(&self, name: &str) -> Option<(FrameId, FrameState)> {
        self.user_labels.get(name).and_then(|label| label.declared_in)
    }

    /// Label used for a user label (created on first mention)
    pub fn user_label(&mut self, name: &str, fresh: impl FnOnce() -> Label) -> Label {
        match self.user_labels.get(name) {
            Some(user_label) => user_label.label,
            None => {
                let label = fresh();
                self.user_labels.insert(
                    name.to_owned(),
                    UserLabel {
                        label,
                        declared_in: None,
                    },
                );
                label
            }
        }
    }

    /// Declare a user label in the innermost frame
    ///
    /// Label names are unique in a method.
    pub fn declare_label(
        &mut self,
        name: &str,
        span: Option<SourceSpan>,
        fresh: impl FnOnce() -> Label,
    ) -> Result<Label, Error> {
        let label = self.user_label(name, fresh);
        let frame = (self.current().id, self.state());
        match self.user_labels.get_mut(name) {
            Some(UserLabel {
                declared_in: declared_in @ None,
                ..
            }) => *declared_in = Some(frame),
            _ => {
                let kind = StructuralKind::DuplicateLabel(name.to_owned());
                return Err(self.structural(kind, span));
            }
        }
        Ok(label)
    }

    /// Decide how to emit a transfer from the innermost frame
    pub fn plan_transfer(
        &mut self,
        dest: &Destination,
        span: Option<SourceSpan>,
        fresh: impl FnOnce() -> Label,
    ) -> Result<TransferPlan, Error> {
        let current = self.depth();
        let (label, frame) = match dest {
            Destination::Known { label, frame } => (*label, Some(*frame)),
            Destination::Goto(name) => {
                let label = self.user_label(name, fresh);
                match self.declared_in(name) {
                    Some((id, _)) if self.closed.contains(&id) => {
                        let kind = StructuralKind::GotoIntoProtectedRegion(name.clone());
                        return Err(self.structural(kind, span));
                    }
                    Some((id, block)) if id == self.current().id && block != self.state() => {
                        let kind = cross_block(name, self.state());
                        return Err(self.structural(kind, span));
                    }
                    Some((id, _)) => (label, self.frames.iter().position(|frame| frame.id == id)),
                    None => (label, None),
                }
            }
        };

        match frame {
            Some(frame) if frame == current => Ok(TransferPlan::Direct(label)),
            Some(_) if self.state() == FrameState::InFinally => {
                Err(self.structural(StructuralKind::LeaveFinally, span))
            }
            _ => Ok(TransferPlan::Pending(label)),
        }
    }

    /// Register the placeholder jump emitted for a pending transfer
    pub fn add_pending(&mut self, site: usize, dest: Destination, span: Option<SourceSpan>) {
        let from = self.state();
        self.current_mut().pending.push(PendingGoto {
            site,
            dest,
            span,
            from,
        });
    }

    /// Check the `goto`s left pending in the method body once the whole method is emitted
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.frames.len() != 1 {
            return Err(Error::ScopeState {
                method: self.method.clone(),
                from: self.state(),
                to: FrameState::Default,
            });
        }
        let pending = std::mem::take(&mut self.frames[0].pending);
        for goto in pending {
            if let Destination::Goto(name) = &goto.dest {
                match self.declared_in(name) {
                    Some((FrameId(0), _)) => (),
                    Some(_) => {
                        let kind = StructuralKind::GotoIntoProtectedRegion(name.clone());
                        return Err(self.structural(kind, goto.span));
                    }
                    None => {
                        let kind = StructuralKind::UndefinedLabel(name.clone());
                        return Err(self.structural(kind, goto.span));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Error for a `goto` between the `try`, `catch` and `finally` blocks of one statement
fn cross_block(label: &str, from: FrameState) -> StructuralKind {
    if from == FrameState::InFinally {
        StructuralKind::LeaveFinally
    } else {
        StructuralKind::GotoIntoProtectedRegion(label.to_owned())
    }
}
