use super::{
    lookup_intrinsic, CompilationContext, Destination, Error, FrameState, ScopeTracker, Step,
    StructuralKind, TransferPlan, Unrepresentable,
};
use crate::ir::{
    BinaryOp, Callee, CatchClause, Expr, Literal, MethodDecl, Slot, SourceSpan, Stmt, StmtKind,
    SwitchSection, UnaryOp,
};
use crate::vm::code::{CodeBuffer, Label, MethodCode, Target};
use crate::vm::{self, Instruction, MethodFlags, OpCode};

/// Most argument or local slots a method can have
const MAX_SLOTS: u32 = 255;

/// Context for emitting the code of one method
///
/// The emitter walks the statement tree once. Control flow is lowered onto fresh labels as it
/// goes, and transfers that leave a `try` statement are first emitted as placeholder jumps which
/// become `ENDTRY`s to stub blocks when the statement is closed (see [`ScopeTracker`]).
pub struct MethodEmitter<'a> {
    context: &'a CompilationContext<'a>,
    method: &'a MethodDecl,
    code: CodeBuffer<'a>,
    scopes: ScopeTracker,

    /// Local slots so far: the declared ones, followed by temporaries
    locals: u32,

    /// Shared exit for returns which have to leave a `try` first
    return_label: Label,

    /// Temporary holding the return value on the way to `return_label`
    return_slot: Option<u32>,

    /// Span of the innermost statement that has one (for error reporting)
    span: Option<SourceSpan>,
}

impl<'a> MethodEmitter<'a> {
    /// Emit the code of a method
    pub fn emit(
        context: &'a CompilationContext<'a>,
        method: &'a MethodDecl,
    ) -> Result<MethodCode, Error> {
        let mut code = CodeBuffer::new(context.isa);
        let return_label = code.fresh_label();
        let emitter = MethodEmitter {
            context,
            method,
            code,
            scopes: ScopeTracker::new(method.name.clone()),
            locals: method.locals,
            return_label,
            return_slot: None,
            span: None,
        };
        emitter.emit_method()
    }

    fn emit_method(mut self) -> Result<MethodCode, Error> {
        let method = self.method;
        if method.params > MAX_SLOTS {
            return Err(self.unrepresentable(Unrepresentable::SlotCount(method.params)));
        }
        if method.locals > MAX_SLOTS {
            return Err(self.unrepresentable(Unrepresentable::SlotCount(method.locals)));
        }

        // Slot counts are only known at the end (temporaries), so this gets patched
        let prologue = self.push(Instruction::with_bytes(OpCode::INITSLOT, vec![0, 0]))?;
        self.emit_block(&method.body)?;
        self.span = None;

        if self.code.is_reachable() {
            if method.returns_value {
                return Err(self.structural(StructuralKind::MissingReturn));
            }
            self.push_dynamic(Instruction::simple(OpCode::RET), 0, 0)?;
        }
        if !self.code.labels().references(self.return_label).is_empty() {
            self.place(self.return_label)?;
            match self.return_slot {
                Some(slot) => {
                    self.load(Slot::Local(slot))?;
                    self.push_dynamic(Instruction::simple(OpCode::RET), 1, 0)?;
                }
                None => {
                    self.push_dynamic(Instruction::simple(OpCode::RET), 0, 0)?;
                }
            }
        }
        self.scopes.finish()?;

        let params = u8::try_from(method.params)
            .map_err(|_| self.unrepresentable(Unrepresentable::SlotCount(method.params)))?;
        let locals = u8::try_from(self.locals)
            .map_err(|_| self.unrepresentable(Unrepresentable::SlotCount(self.locals)))?;
        let has_slots = params != 0 || locals != 0;
        if has_slots {
            self.code
                .patch_operand(prologue, vec![locals, params])
                .map_err(|err| self.vm_error(err))?;
        }

        let mut flags = method.flags & (MethodFlags::PUBLIC | MethodFlags::SAFE);
        if method.returns_value {
            flags |= MethodFlags::RETURNS_VALUE;
        }
        let name = method.name.clone();
        let mut code = self
            .code
            .finish(name, params, locals, flags)
            .map_err(|error| Error::Internal {
                method: Some(method.name.clone()),
                error,
            })?;
        if !has_slots {
            let mut keep = vec![true; code.instructions.len()];
            keep[prologue] = false;
            code.retain(&keep);
        }

        log::trace!(
            "emitted `{}`: {} instructions, {} locals",
            code.name,
            code.instructions.len(),
            code.locals
        );
        Ok(code)
    }

    // Error helpers

    fn structural(&self, kind: StructuralKind) -> Error {
        Error::Structural {
            method: self.method.name.clone(),
            span: self.span,
            kind,
        }
    }

    fn unrepresentable(&self, reason: Unrepresentable) -> Error {
        Error::Unrepresentable {
            method: self.method.name.clone(),
            span: self.span,
            reason,
        }
    }

    fn vm_error(&self, error: vm::Error) -> Error {
        match error {
            vm::Error::StackUnderflow { .. } => {
                self.unrepresentable(Unrepresentable::StackUnderflow)
            }
            vm::Error::IncompatibleStackDepth { .. } => {
                self.unrepresentable(Unrepresentable::StackMismatch)
            }
            error => Error::Internal {
                method: Some(self.method.name.clone()),
                error,
            },
        }
    }

    // Thin wrappers around the code buffer

    fn push(&mut self, insn: Instruction<Target>) -> Result<usize, Error> {
        self.code.push(insn).map_err(|err| self.vm_error(err))
    }

    fn push_dynamic(
        &mut self,
        insn: Instruction<Target>,
        pops: usize,
        pushes: usize,
    ) -> Result<usize, Error> {
        self.code
            .push_dynamic(insn, pops, pushes)
            .map_err(|err| self.vm_error(err))
    }

    fn op(&mut self, opcode: OpCode) -> Result<(), Error> {
        self.push(Instruction::simple(opcode)).map(|_| ())
    }

    fn jump(&mut self, opcode: OpCode, label: Label) -> Result<usize, Error> {
        self.push(Instruction::jump(opcode, Target::Label(label)))
    }

    fn place(&mut self, label: Label) -> Result<(), Error> {
        self.code
            .place_label(label)
            .map_err(|err| self.vm_error(err))
    }

    fn fresh(&mut self) -> Label {
        self.code.fresh_label()
    }

    /// Allocate a new local slot past the declared ones
    fn alloc_temp(&mut self) -> Result<u32, Error> {
        let slot = self.locals;
        self.locals += 1;
        if self.locals > MAX_SLOTS {
            return Err(self.unrepresentable(Unrepresentable::SlotCount(self.locals)));
        }
        Ok(slot)
    }

    fn return_slot(&mut self) -> Result<u32, Error> {
        match self.return_slot {
            Some(slot) => Ok(slot),
            None => {
                let slot = self.alloc_temp()?;
                self.return_slot = Some(slot);
                Ok(slot)
            }
        }
    }

    // Statements

    fn emit_block(&mut self, stmts: &[Stmt]) -> Result<(), Error> {
        for stmt in stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<(), Error> {
        let outer_span = self.span;
        if let Some(span) = stmt.span {
            self.code.add_sequence_point(span);
            self.span = Some(span);
        }

        match &stmt.kind {
            StmtKind::Expr(expr) => {
                let depth = self.code.depth();
                self.emit_expr(expr)?;
                while self.code.depth() > depth {
                    self.op(OpCode::DROP)?;
                }
            }

            StmtKind::Assign(slot, value) => {
                self.emit_expr(value)?;
                self.store(*slot)?;
            }

            StmtKind::Block(body) => self.emit_block(body)?,

            StmtKind::If {
                cond,
                then,
                otherwise,
            } => self.emit_if(cond, then, otherwise)?,

            StmtKind::While { cond, body } => {
                let head = self.fresh();
                let exit = self.fresh();
                self.place(head)?;
                if !is_always_true(cond) {
                    self.emit_condition(cond, false, exit)?;
                }
                self.emit_loop_body(body, exit, head)?;
                if self.code.is_reachable() {
                    self.jump(OpCode::JMP, head)?;
                }
                self.place(exit)?;
            }

            StmtKind::DoWhile { body, cond } => {
                let top = self.fresh();
                let cont = self.fresh();
                let exit = self.fresh();
                self.place(top)?;
                self.emit_loop_body(body, exit, cont)?;
                self.place(cont)?;
                if is_always_true(cond) {
                    if self.code.is_reachable() {
                        self.jump(OpCode::JMP, top)?;
                    }
                } else {
                    self.emit_condition(cond, true, top)?;
                }
                self.place(exit)?;
            }

            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let head = self.fresh();
                let cont = self.fresh();
                let exit = self.fresh();
                self.emit_block(init)?;
                self.place(head)?;
                if let Some(cond) = cond.as_ref().filter(|cond| !is_always_true(cond)) {
                    self.emit_condition(cond, false, exit)?;
                }
                self.emit_loop_body(body, exit, cont)?;
                self.place(cont)?;
                self.emit_block(step)?;
                if self.code.is_reachable() {
                    self.jump(OpCode::JMP, head)?;
                }
                self.place(exit)?;
            }

            StmtKind::Switch {
                scrutinee,
                sections,
            } => self.emit_switch(scrutinee, sections)?,

            StmtKind::Try {
                body,
                catch,
                finally,
            } => self.emit_try(body, catch.as_ref(), finally.as_deref())?,

            StmtKind::Return(value) => self.emit_return(value.as_ref())?,

            StmtKind::Break => {
                let dest = self
                    .scopes
                    .break_target()
                    .ok_or_else(|| self.structural(StructuralKind::BreakOutsideLoop))?;
                self.emit_transfer(dest)?;
            }

            StmtKind::Continue => {
                let dest = self
                    .scopes
                    .continue_target()
                    .ok_or_else(|| self.structural(StructuralKind::ContinueOutsideLoop))?;
                self.emit_transfer(dest)?;
            }

            StmtKind::Throw(value) => {
                self.emit_expr(value)?;
                self.op(OpCode::THROW)?;
            }

            StmtKind::Rethrow => {
                let slot = self
                    .scopes
                    .caught_exception()
                    .ok_or_else(|| self.structural(StructuralKind::RethrowOutsideCatch))?;
                self.load(Slot::Local(slot))?;
                self.op(OpCode::THROW)?;
            }

            StmtKind::Label(name) => {
                let code = &mut self.code;
                let label = self
                    .scopes
                    .declare_label(name, self.span, || code.fresh_label())?;
                self.code
                    .place_entry_label(label)
                    .map_err(|err| self.vm_error(err))?;
            }

            StmtKind::Goto(name) => self.emit_transfer(Destination::Goto(name.clone()))?,
        }

        self.span = outer_span;
        Ok(())
    }

    fn emit_if(&mut self, cond: &Expr, then: &[Stmt], otherwise: &[Stmt]) -> Result<(), Error> {
        let else_label = self.fresh();
        self.emit_condition(cond, false, else_label)?;
        self.emit_block(then)?;
        if otherwise.is_empty() {
            self.place(else_label)?;
        } else {
            let end = self.fresh();
            if self.code.is_reachable() {
                self.jump(OpCode::JMP, end)?;
            }
            self.place(else_label)?;
            self.emit_block(otherwise)?;
            self.place(end)?;
        }
        Ok(())
    }

    fn emit_loop_body(
        &mut self,
        body: &[Stmt],
        break_label: Label,
        continue_label: Label,
    ) -> Result<(), Error> {
        self.scopes.open_loop(break_label, continue_label);
        self.emit_block(body)?;
        self.scopes.close_breakable();
        Ok(())
    }

    /// Compare the scrutinee against each case value in turn, then jump to the `default`
    /// section (or past the switch)
    fn emit_switch(&mut self, scrutinee: &Expr, sections: &[SwitchSection]) -> Result<(), Error> {
        self.emit_expr(scrutinee)?;
        let value = self.alloc_temp()?;
        self.store(Slot::Local(value))?;

        let exit = self.fresh();
        let labels: Vec<Label> = sections.iter().map(|_| self.code.fresh_label()).collect();
        let mut default = None;
        for (section, label) in sections.iter().zip(&labels) {
            for case in &section.values {
                self.load(Slot::Local(value))?;
                self.push_literal(case)?;
                self.op(OpCode::EQUAL)?;
                self.jump(OpCode::JMPIF, *label)?;
            }
            if section.default {
                default = Some(*label);
            }
        }
        self.jump(OpCode::JMP, default.unwrap_or(exit))?;

        self.scopes.open_switch(exit);
        for (section, label) in sections.iter().zip(&labels) {
            self.place(*label)?;
            self.emit_block(&section.body)?;
            if self.code.is_reachable() {
                self.jump(OpCode::JMP, exit)?;
            }
        }
        self.scopes.close_breakable();
        self.place(exit)
    }

    fn emit_try(
        &mut self,
        body: &[Stmt],
        catch: Option<&CatchClause>,
        finally: Option<&[Stmt]>,
    ) -> Result<(), Error> {
        if catch.is_none() && finally.is_none() {
            return self.emit_block(body);
        }

        let catch_label = catch.map(|_| self.code.fresh_label());
        let finally_label = finally.map(|_| self.code.fresh_label());
        let end = self.fresh();

        self.push(Instruction::try_region(
            catch_label.map(Target::Label),
            finally_label.map(Target::Label),
        ))?;
        self.scopes.push_try();
        self.emit_block(body)?;
        if self.code.is_reachable() {
            self.jump(OpCode::ENDTRY, end)?;
        }

        if let (Some(clause), Some(label)) = (catch, catch_label) {
            let slot = match clause.slot {
                Some(slot) => Some(slot),
                None if contains_rethrow(&clause.body) => Some(self.alloc_temp()?),
                None => None,
            };
            self.scopes.enter_catch(slot)?;
            self.place(label)?;
            match slot {
                Some(slot) => self.store(Slot::Local(slot))?,
                None => self.op(OpCode::DROP)?,
            }
            self.emit_block(&clause.body)?;
            if self.code.is_reachable() {
                self.jump(OpCode::ENDTRY, end)?;
            }
        }

        if let (Some(finally), Some(label)) = (finally, finally_label) {
            self.scopes.transition(FrameState::InFinally)?;
            self.place(label)?;
            self.emit_block(finally)?;
            if self.code.is_reachable() {
                self.op(OpCode::ENDFINALLY)?;
            }
        }

        // Every placeholder jump out of the statement becomes an `ENDTRY` to a stub that
        // performs the transfer from the enclosing frame
        let stubs = self.scopes.pop_try()?;
        let mut stub_labels = Vec::with_capacity(stubs.len());
        for stub in &stubs {
            let label = self.fresh();
            for site in &stub.sites {
                self.code
                    .retarget(*site, OpCode::ENDTRY, label)
                    .map_err(|err| self.vm_error(err))?;
            }
            stub_labels.push(label);
        }
        for (stub, label) in stubs.into_iter().zip(stub_labels) {
            self.place(label)?;
            let outer_span = std::mem::replace(&mut self.span, stub.span);
            self.emit_transfer(stub.dest)?;
            self.span = outer_span;
        }

        self.place(end)
    }

    fn emit_return(&mut self, value: Option<&Expr>) -> Result<(), Error> {
        match (value, self.method.returns_value) {
            (Some(_), false) => return Err(self.structural(StructuralKind::UnexpectedReturnValue)),
            (None, true) => return Err(self.structural(StructuralKind::MissingReturnValue)),
            _ => (),
        }

        if self.scopes.depth() == 0 {
            let returned = match value {
                Some(value) => {
                    self.emit_expr(value)?;
                    1
                }
                None => 0,
            };
            self.push_dynamic(Instruction::simple(OpCode::RET), returned, 0)?;
        } else {
            if let Some(value) = value {
                self.emit_expr(value)?;
                let slot = self.return_slot()?;
                self.store(Slot::Local(slot))?;
            }
            let dest = Destination::Known {
                label: self.return_label,
                frame: 0,
            };
            self.emit_transfer(dest)?;
        }
        Ok(())
    }

    /// Jump to a destination, which may be outside the current `try` statement
    fn emit_transfer(&mut self, dest: Destination) -> Result<(), Error> {
        let code = &mut self.code;
        let plan = self
            .scopes
            .plan_transfer(&dest, self.span, || code.fresh_label())?;
        match plan {
            TransferPlan::Direct(label) => {
                self.jump(OpCode::JMP, label)?;
            }
            TransferPlan::Pending(label) => {
                let site = self.jump(OpCode::JMP, label)?;
                self.scopes.add_pending(site, dest, self.span);
            }
        }
        Ok(())
    }

    // Expressions

    /// Emit an expression, leaving exactly its value on the stack
    fn emit_expr(&mut self, expr: &Expr) -> Result<(), Error> {
        match expr {
            Expr::Literal(literal) => self.push_literal(literal),
            Expr::Load(slot) => self.load(*slot),

            Expr::Unary(op, operand) => {
                self.emit_expr(operand)?;
                self.op(match op {
                    UnaryOp::Negate => OpCode::NEGATE,
                    UnaryOp::Not => OpCode::NOT,
                    UnaryOp::Invert => OpCode::INVERT,
                })
            }

            Expr::Binary(op, lhs, rhs) => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.op(binary_opcode(*op))
            }

            // `a && b` is `a ? b : false` and `a || b` is `a ? true : b`
            Expr::And(lhs, rhs) => self.emit_short_circuit(lhs, rhs, false),
            Expr::Or(lhs, rhs) => self.emit_short_circuit(lhs, rhs, true),

            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let else_label = self.fresh();
                let end = self.fresh();
                self.emit_condition(cond, false, else_label)?;
                self.emit_expr(then)?;
                self.jump(OpCode::JMP, end)?;
                self.place(else_label)?;
                self.emit_expr(otherwise)?;
                self.place(end)
            }

            Expr::Call {
                callee: Callee::Method(name),
                args,
            } => self.emit_call(name, args),

            Expr::Call {
                callee: Callee::Intrinsic(name),
                args,
            } => self.emit_intrinsic(name, args),
        }
    }

    fn emit_short_circuit(&mut self, lhs: &Expr, rhs: &Expr, is_or: bool) -> Result<(), Error> {
        let short = self.fresh();
        let end = self.fresh();
        self.emit_condition(lhs, is_or, short)?;
        self.emit_expr(rhs)?;
        self.jump(OpCode::JMP, end)?;
        self.place(short)?;
        self.op(if is_or { OpCode::PUSHT } else { OpCode::PUSHF })?;
        self.place(end)
    }

    /// Jump to `target` if the condition evaluates to `jump_if`, and fall through otherwise
    ///
    /// Negations are absorbed into the jump, and so are numeric comparisons if comparison
    /// fusion is on.
    fn emit_condition(&mut self, cond: &Expr, jump_if: bool, target: Label) -> Result<(), Error> {
        match cond {
            Expr::Unary(UnaryOp::Not, inner) => return self.emit_condition(inner, !jump_if, target),
            Expr::Binary(op, lhs, rhs) if self.context.settings.fuse_comparisons => {
                if let Some(opcode) = fused_jump(*op, jump_if) {
                    self.emit_expr(lhs)?;
                    self.emit_expr(rhs)?;
                    self.jump(opcode, target)?;
                    return Ok(());
                }
            }
            _ => (),
        }

        self.emit_expr(cond)?;
        let opcode = if jump_if {
            OpCode::JMPIF
        } else {
            OpCode::JMPIFNOT
        };
        self.jump(opcode, target)?;
        Ok(())
    }

    fn emit_call(&mut self, name: &str, args: &[Expr]) -> Result<(), Error> {
        let context = self.context;
        let signature = context
            .methods
            .get(name)
            .ok_or_else(|| self.unrepresentable(Unrepresentable::UnknownMethod(name.to_owned())))?;
        if args.len() != signature.params {
            return Err(self.unrepresentable(Unrepresentable::ArgumentCount {
                callee: name.to_owned(),
                expected: signature.params,
                found: args.len(),
            }));
        }

        // The first argument ends up on top of the stack
        for arg in args.iter().rev() {
            self.emit_expr(arg)?;
        }
        let call = Instruction::jump(OpCode::CALL, Target::Method(signature.id));
        self.push_dynamic(call, args.len(), signature.returns_value as usize)?;
        Ok(())
    }

    fn emit_intrinsic(&mut self, name: &str, args: &[Expr]) -> Result<(), Error> {
        let intrinsic = lookup_intrinsic(self.context.intrinsics, name).ok_or_else(|| {
            self.unrepresentable(Unrepresentable::UnknownIntrinsic(name.to_owned()))
        })?;
        if args.len() != intrinsic.params {
            return Err(self.unrepresentable(Unrepresentable::ArgumentCount {
                callee: name.to_owned(),
                expected: intrinsic.params,
                found: args.len(),
            }));
        }

        let depth = self.code.depth();
        if intrinsic.reverse_args {
            for arg in args.iter().rev() {
                self.emit_expr(arg)?;
            }
        } else {
            for arg in args {
                self.emit_expr(arg)?;
            }
        }

        for step in intrinsic.template {
            match step {
                Step::Op(opcode) => self.op(*opcode)?,
                Step::OpWithOperand(opcode, bytes) => {
                    self.push(Instruction::with_bytes(*opcode, bytes.to_vec()))?;
                }
                Step::Syscall { id, .. } => {
                    let syscall = Instruction::with_bytes(OpCode::SYSCALL, id.to_le_bytes().to_vec());
                    self.push_dynamic(syscall, intrinsic.params, intrinsic.returns_value as usize)?;
                }
            }
        }

        if self.code.depth() != depth + intrinsic.returns_value as usize {
            return Err(self.unrepresentable(Unrepresentable::StackMismatch));
        }
        Ok(())
    }

    fn push_literal(&mut self, literal: &Literal) -> Result<(), Error> {
        match literal {
            Literal::Integer(bytes) => self.push_integer(bytes),
            Literal::Bool(true) => self.op(OpCode::PUSHT),
            Literal::Bool(false) => self.op(OpCode::PUSHF),
            Literal::Bytes(bytes) => {
                let insn = Instruction::push_data(bytes).map_err(|err| self.vm_error(err))?;
                self.push(insn).map(|_| ())
            }
            Literal::Null => self.op(OpCode::PUSHNULL),
        }
    }

    /// Push an integer with the shortest encoding available
    fn push_integer(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let mut bytes = minimal_integer(bytes);
        let negative = bytes.last().map_or(false, |byte| byte & 0x80 != 0);
        let fill = if negative { 0xFF } else { 0x00 };

        if bytes.len() <= 8 {
            let mut buffer = [fill; 8];
            buffer[..bytes.len()].copy_from_slice(&bytes);
            if let Some(opcode) = OpCode::push_small_int(i64::from_le_bytes(buffer)) {
                return self.op(opcode);
            }
        }

        let (opcode, width) = match bytes.len() {
            0..=1 => (OpCode::PUSHINT8, 1),
            2 => (OpCode::PUSHINT16, 2),
            3..=4 => (OpCode::PUSHINT32, 4),
            5..=8 => (OpCode::PUSHINT64, 8),
            9..=16 => (OpCode::PUSHINT128, 16),
            17..=32 => (OpCode::PUSHINT256, 32),
            len => return Err(self.unrepresentable(Unrepresentable::IntegerTooWide(len))),
        };
        bytes.resize(width, fill);
        self.push(Instruction::with_bytes(opcode, bytes)).map(|_| ())
    }

    // Slots

    fn load(&mut self, slot: Slot) -> Result<(), Error> {
        let insn = self.slot_access(slot, true)?;
        self.push(insn).map(|_| ())
    }

    fn store(&mut self, slot: Slot) -> Result<(), Error> {
        let insn = self.slot_access(slot, false)?;
        self.push(insn).map(|_| ())
    }

    fn slot_access(&self, slot: Slot, load: bool) -> Result<Instruction<Target>, Error> {
        let (compact, general, index) = match (slot, load) {
            (Slot::Arg(idx), true) => (OpCode::LDARG0, OpCode::LDARG, idx),
            (Slot::Arg(idx), false) => (OpCode::STARG0, OpCode::STARG, idx),
            (Slot::Local(idx), true) => (OpCode::LDLOC0, OpCode::LDLOC, idx),
            (Slot::Local(idx), false) => (OpCode::STLOC0, OpCode::STLOC, idx),
            (Slot::Static(idx), true) => (OpCode::LDSFLD0, OpCode::LDSFLD, idx),
            (Slot::Static(idx), false) => (OpCode::STSFLD0, OpCode::STSFLD, idx),
        };
        let index = u8::try_from(index)
            .map_err(|_| self.unrepresentable(Unrepresentable::SlotIndex(index)))?;
        Ok(match compact.indexed(index) {
            Some(opcode) => Instruction::simple(opcode),
            None => Instruction::with_bytes(general, vec![index]),
        })
    }
}

fn is_always_true(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal(Literal::Bool(true)))
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::ADD,
        BinaryOp::Sub => OpCode::SUB,
        BinaryOp::Mul => OpCode::MUL,
        BinaryOp::Div => OpCode::DIV,
        BinaryOp::Mod => OpCode::MOD,
        BinaryOp::Shl => OpCode::SHL,
        BinaryOp::Shr => OpCode::SHR,
        BinaryOp::BitAnd => OpCode::AND,
        BinaryOp::BitOr => OpCode::OR,
        BinaryOp::BitXor => OpCode::XOR,
        BinaryOp::Equal => OpCode::EQUAL,
        BinaryOp::NotEqual => OpCode::NOTEQUAL,
        BinaryOp::NumEqual => OpCode::NUMEQUAL,
        BinaryOp::NumNotEqual => OpCode::NUMNOTEQUAL,
        BinaryOp::Lt => OpCode::LT,
        BinaryOp::Le => OpCode::LE,
        BinaryOp::Gt => OpCode::GT,
        BinaryOp::Ge => OpCode::GE,
        BinaryOp::Concat => OpCode::CAT,
    }
}

/// Compare-and-jump that jumps when the comparison evaluates to `jump_if`
fn fused_jump(op: BinaryOp, jump_if: bool) -> Option<OpCode> {
    let opcode = match (op, jump_if) {
        (BinaryOp::Lt, true) | (BinaryOp::Ge, false) => OpCode::JMPLT,
        (BinaryOp::Le, true) | (BinaryOp::Gt, false) => OpCode::JMPLE,
        (BinaryOp::Gt, true) | (BinaryOp::Le, false) => OpCode::JMPGT,
        (BinaryOp::Ge, true) | (BinaryOp::Lt, false) => OpCode::JMPGE,
        (BinaryOp::NumEqual, true) | (BinaryOp::NumNotEqual, false) => OpCode::JMPEQ,
        (BinaryOp::NumNotEqual, true) | (BinaryOp::NumEqual, false) => OpCode::JMPNE,
        _ => return None,
    };
    Some(opcode)
}

/// Drop redundant sign extension bytes from a little-endian two's complement integer
///
/// The result is never empty (zero is `[0]`).
fn minimal_integer(bytes: &[u8]) -> Vec<u8> {
    let mut bytes = bytes.to_vec();
    if bytes.is_empty() {
        bytes.push(0);
    }
    while let [.., next, last] = bytes[..] {
        let redundant = (last == 0x00 && next & 0x80 == 0) || (last == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        bytes.pop();
    }
    bytes
}

/// Could a `rethrow` in these statements refer to the innermost enclosing `catch`?
fn contains_rethrow(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Rethrow => true,
        StmtKind::Block(body)
        | StmtKind::While { body, .. }
        | StmtKind::DoWhile { body, .. } => contains_rethrow(body),
        StmtKind::If {
            then, otherwise, ..
        } => contains_rethrow(then) || contains_rethrow(otherwise),
        StmtKind::For {
            init, step, body, ..
        } => contains_rethrow(init) || contains_rethrow(step) || contains_rethrow(body),
        StmtKind::Switch { sections, .. } => sections
            .iter()
            .any(|section| contains_rethrow(&section.body)),
        // A nested `catch` has its own exception and a `finally` block has none
        StmtKind::Try { body, .. } => contains_rethrow(body),
        _ => false,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{CompilationUnit, MethodDecl};
    use crate::translate::{CompilationContext, Settings};
    use crate::vm::{Operand, StandardInstructionSet};

    fn emit_unit(settings: &Settings, methods: Vec<MethodDecl>) -> Vec<Result<MethodCode, Error>> {
        let isa = StandardInstructionSet;
        let unit = CompilationUnit {
            name: String::from("test"),
            methods,
        };
        let context = CompilationContext::new(settings, &isa, &unit);
        unit.methods
            .iter()
            .map(|method| MethodEmitter::emit(&context, method))
            .collect()
    }

    fn emit_one(method: MethodDecl) -> Result<MethodCode, Error> {
        let settings = Settings::default();
        emit_unit(&settings, vec![method]).remove(0)
    }

    fn opcodes(code: &MethodCode) -> Vec<OpCode> {
        code.instructions.iter().map(|insn| insn.opcode).collect()
    }

    fn structural_kind(result: Result<MethodCode, Error>) -> StructuralKind {
        match result {
            Err(Error::Structural { kind, .. }) => kind,
            other => panic!("expected a structural error, got {:?}", other),
        }
    }

    fn unrepresentable_reason(result: Result<MethodCode, Error>) -> Unrepresentable {
        match result {
            Err(Error::Unrepresentable { reason, .. }) => reason,
            other => panic!("expected an unrepresentable error, got {:?}", other),
        }
    }

    #[test]
    fn empty_void_method() {
        let code = emit_one(MethodDecl::new("main", vec![])).unwrap();
        assert_eq!(opcodes(&code), vec![OpCode::RET]);
        assert_eq!((code.params, code.locals), (0, 0));
        assert!(!code.returns_value());
    }

    #[test]
    fn slots_are_declared_in_the_prologue() {
        let method = MethodDecl::new(
            "add",
            vec![Stmt::ret(Some(Expr::binary(
                BinaryOp::Add,
                Expr::arg(0),
                Expr::arg(1),
            )))],
        )
        .with_params(2)
        .returning();
        let code = emit_one(method).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::INITSLOT,
                OpCode::LDARG0,
                OpCode::LDARG1,
                OpCode::ADD,
                OpCode::RET
            ]
        );
        assert_eq!(code.instructions[0].operand, Operand::Bytes(vec![0, 2]));
        assert!(code.returns_value());
    }

    #[test]
    fn integer_literals_use_the_shortest_encoding() {
        let body = [-1, 16, 17, -129, 1 << 20, i64::MIN]
            .iter()
            .map(|value| Stmt::expr(Expr::int(*value)))
            .collect();
        let code = emit_one(MethodDecl::new("ints", body)).unwrap();
        let pushes: Vec<_> = code
            .instructions
            .iter()
            .filter(|insn| insn.opcode != OpCode::DROP && insn.opcode != OpCode::RET)
            .cloned()
            .collect();
        assert_eq!(
            pushes,
            vec![
                Instruction::simple(OpCode::PUSHM1),
                Instruction::simple(OpCode::PUSH16),
                Instruction::with_bytes(OpCode::PUSHINT8, vec![17]),
                Instruction::with_bytes(OpCode::PUSHINT16, vec![0x7F, 0xFF]),
                Instruction::with_bytes(OpCode::PUSHINT32, vec![0, 0, 0x10, 0]),
                Instruction::with_bytes(OpCode::PUSHINT64, i64::MIN.to_le_bytes().to_vec()),
            ]
        );

        let huge = Stmt::expr(Expr::Literal(Literal::Integer(vec![1; 33])));
        assert_eq!(
            unrepresentable_reason(emit_one(MethodDecl::new("huge", vec![huge]))),
            Unrepresentable::IntegerTooWide(33)
        );
    }

    #[test]
    fn minimal_integers() {
        assert_eq!(minimal_integer(&[]), vec![0]);
        assert_eq!(minimal_integer(&[0xFF, 0xFF, 0xFF]), vec![0xFF]);
        assert_eq!(minimal_integer(&[0x80, 0x00]), vec![0x80, 0x00]);
        assert_eq!(minimal_integer(&[0x80, 0xFF, 0xFF]), vec![0x80]);
    }

    #[test]
    fn comparisons_fuse_into_the_jump() {
        let body = vec![Stmt::if_else(
            Expr::binary(BinaryOp::Lt, Expr::arg(0), Expr::int(10)),
            vec![Stmt::expr(Expr::intrinsic(
                "Runtime.Abort",
                vec![],
            ))],
            vec![],
        )];
        let method = MethodDecl::new("check", body).with_params(1);

        let fused = emit_one(method.clone()).unwrap();
        assert_eq!(
            opcodes(&fused),
            vec![
                OpCode::INITSLOT,
                OpCode::LDARG0,
                OpCode::PUSH10,
                OpCode::JMPGE,
                OpCode::ABORT,
                OpCode::RET
            ]
        );

        let mut settings = Settings::default();
        settings.fuse_comparisons = false;
        let unfused = emit_unit(&settings, vec![method]).remove(0).unwrap();
        assert_eq!(
            opcodes(&unfused)[1..5],
            [OpCode::LDARG0, OpCode::PUSH10, OpCode::LT, OpCode::JMPIFNOT]
        );
    }

    #[test]
    fn negated_conditions_flip_the_jump() {
        let cond = Expr::unary(UnaryOp::Not, Expr::arg(0));
        let body = vec![Stmt::while_loop(cond, vec![])];
        let code = emit_one(MethodDecl::new("spin", body).with_params(1)).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::INITSLOT,
                OpCode::LDARG0,
                OpCode::JMPIF,
                OpCode::JMP,
                OpCode::RET
            ]
        );
    }

    #[test]
    fn short_circuit_keeps_the_stack_balanced() {
        let value = Expr::And(
            Box::new(Expr::arg(0)),
            Box::new(Expr::Or(Box::new(Expr::arg(1)), Box::new(Expr::arg(2)))),
        );
        let method = MethodDecl::new("both", vec![Stmt::ret(Some(value))])
            .with_params(3)
            .returning();
        let code = emit_one(method).unwrap();
        assert_eq!(code.instructions.last().unwrap().opcode, OpCode::RET);
        assert!(opcodes(&code).contains(&OpCode::PUSHF));
        assert!(opcodes(&code).contains(&OpCode::PUSHT));
    }

    #[test]
    fn expression_statements_drop_their_value() {
        let body = vec![
            Stmt::expr(Expr::call("value", vec![])),
            Stmt::expr(Expr::call("nothing", vec![Expr::int(1)])),
        ];
        let results = emit_unit(
            &Settings::default(),
            vec![
                MethodDecl::new("main", body),
                MethodDecl::new("value", vec![Stmt::ret(Some(Expr::int(1)))]).returning(),
                MethodDecl::new("nothing", vec![]).with_params(1),
            ],
        );
        let code = results.into_iter().next().unwrap().unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::CALL,
                OpCode::DROP,
                OpCode::PUSH1,
                OpCode::CALL,
                OpCode::RET
            ]
        );
        assert_eq!(
            code.instructions[0].operand,
            Operand::Jump(Target::Method(crate::vm::code::MethodId(1)), vm::JumpWidth::Narrow)
        );
    }

    #[test]
    fn calls_are_checked() {
        let unknown = MethodDecl::new("main", vec![Stmt::expr(Expr::call("nope", vec![]))]);
        assert_eq!(
            unrepresentable_reason(emit_one(unknown)),
            Unrepresentable::UnknownMethod(String::from("nope"))
        );

        let bad_arity = MethodDecl::new(
            "main",
            vec![Stmt::expr(Expr::intrinsic("Math.Max", vec![Expr::int(1)]))],
        );
        assert_eq!(
            unrepresentable_reason(emit_one(bad_arity)),
            Unrepresentable::ArgumentCount {
                callee: String::from("Math.Max"),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn system_calls_take_arguments_in_reverse() {
        let body = vec![Stmt::expr(Expr::intrinsic(
            "System.Runtime.Notify",
            vec![Expr::string("event"), Expr::int(3)],
        ))];
        let code = emit_one(MethodDecl::new("main", body)).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::PUSH3,
                OpCode::PUSHDATA1,
                OpCode::SYSCALL,
                OpCode::RET
            ]
        );
        let id = crate::translate::syscall_id("System.Runtime.Notify");
        assert_eq!(
            code.instructions[2].operand,
            Operand::Bytes(id.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn structural_errors() {
        let cases = vec![
            (vec![Stmt::new(StmtKind::Break)], StructuralKind::BreakOutsideLoop),
            (vec![Stmt::new(StmtKind::Continue)], StructuralKind::ContinueOutsideLoop),
            (vec![Stmt::new(StmtKind::Rethrow)], StructuralKind::RethrowOutsideCatch),
            (
                vec![Stmt::ret(Some(Expr::int(1)))],
                StructuralKind::UnexpectedReturnValue,
            ),
            (
                vec![Stmt::goto("nowhere")],
                StructuralKind::UndefinedLabel(String::from("nowhere")),
            ),
            (
                vec![Stmt::label("twice"), Stmt::label("twice")],
                StructuralKind::DuplicateLabel(String::from("twice")),
            ),
            (
                vec![Stmt::try_finally(vec![], vec![Stmt::ret(None)])],
                StructuralKind::LeaveFinally,
            ),
            (
                vec![
                    Stmt::goto("inside"),
                    Stmt::try_finally(vec![Stmt::label("inside")], vec![]),
                ],
                StructuralKind::GotoIntoProtectedRegion(String::from("inside")),
            ),
        ];
        for (body, expected) in cases {
            assert_eq!(structural_kind(emit_one(MethodDecl::new("bad", body))), expected);
        }

        let falls_off = MethodDecl::new("value", vec![]).returning();
        assert_eq!(structural_kind(emit_one(falls_off)), StructuralKind::MissingReturn);
    }

    #[test]
    fn gotos_cannot_cross_between_try_catch_and_finally() {
        let log = || Stmt::expr(Expr::intrinsic("System.Runtime.Log", vec![Expr::string("x")]));
        let cases = vec![
            (
                Stmt::try_finally(vec![Stmt::label("again"), log()], vec![Stmt::goto("again")]),
                StructuralKind::LeaveFinally,
            ),
            (
                Stmt::try_finally(vec![Stmt::goto("cleanup")], vec![Stmt::label("cleanup"), log()]),
                StructuralKind::GotoIntoProtectedRegion(String::from("cleanup")),
            ),
            (
                Stmt::try_catch(vec![Stmt::label("again"), log()], None, vec![Stmt::goto("again")]),
                StructuralKind::GotoIntoProtectedRegion(String::from("again")),
            ),
        ];
        for (stmt, expected) in cases {
            let method = MethodDecl::new("bad", vec![stmt]);
            assert_eq!(structural_kind(emit_one(method)), expected);
        }

        // A label in the same block is fine
        let body = vec![Stmt::try_catch(
            vec![log()],
            None,
            vec![Stmt::goto("handled"), Stmt::label("handled"), log()],
        )];
        emit_one(MethodDecl::new("good", body)).unwrap();
    }

    #[test]
    fn rethrow_inside_a_nested_try() {
        let log = || Stmt::expr(Expr::intrinsic("System.Runtime.Log", vec![Expr::string("x")]));
        let body = vec![Stmt::try_catch(
            vec![log()],
            None,
            vec![Stmt::try_finally(vec![Stmt::new(StmtKind::Rethrow)], vec![log()])],
        )];
        let code = emit_one(MethodDecl::new("nested", body)).unwrap();
        assert_eq!(code.locals, 1);
        assert!(opcodes(&code).contains(&OpCode::THROW));

        // A finally block has no exception to rethrow
        let body = vec![Stmt::try_catch(
            vec![log()],
            None,
            vec![Stmt::try_finally(vec![], vec![Stmt::new(StmtKind::Rethrow)])],
        )];
        assert_eq!(
            structural_kind(emit_one(MethodDecl::new("bad", body))),
            StructuralKind::RethrowOutsideCatch
        );
    }

    #[test]
    fn errors_carry_the_statement_span() {
        let span = SourceSpan::new(0, 3, 5, 3, 11);
        let body = vec![Stmt::block(vec![Stmt::new(StmtKind::Break).at(span)])];
        match emit_one(MethodDecl::new("bad", body)) {
            Err(Error::Structural { span: found, .. }) => assert_eq!(found, Some(span)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn return_from_a_try_goes_through_a_stub() {
        let body = vec![Stmt::try_finally(
            vec![Stmt::ret(Some(Expr::int(7)))],
            vec![Stmt::expr(Expr::intrinsic("System.Runtime.Log", vec![Expr::string("bye")]))],
        )];
        let code = emit_one(MethodDecl::new("leave", body).returning()).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::INITSLOT,
                OpCode::TRY,
                OpCode::PUSH7,
                OpCode::STLOC0,
                OpCode::ENDTRY, // to the stub
                OpCode::PUSHDATA1,
                OpCode::SYSCALL,
                OpCode::ENDFINALLY,
                OpCode::JMP, // stub, to the shared return
                OpCode::LDLOC0,
                OpCode::RET,
            ]
        );
        assert_eq!(code.locals, 1);
        assert_eq!(code.labels.position(match &code.instructions[4].operand {
            Operand::Jump(Target::Label(label), _) => *label,
            other => panic!("unexpected {:?}", other),
        }), Some(8));
    }

    #[test]
    fn catch_without_slot_drops_the_exception() {
        let body = vec![Stmt::try_catch(
            vec![Stmt::new(StmtKind::Throw(Expr::int(1)))],
            None,
            vec![],
        )];
        let code = emit_one(MethodDecl::new("swallow", body)).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![
                OpCode::TRY,
                OpCode::PUSH1,
                OpCode::THROW,
                OpCode::DROP,
                OpCode::ENDTRY,
                OpCode::RET
            ]
        );
    }

    #[test]
    fn rethrow_gets_a_temporary() {
        let body = vec![Stmt::try_catch(
            vec![],
            None,
            vec![Stmt::new(StmtKind::Rethrow)],
        )];
        let code = emit_one(MethodDecl::new("again", body).with_locals(2)).unwrap();
        assert_eq!(code.locals, 3);
        assert!(opcodes(&code).contains(&OpCode::STLOC2));
        assert!(opcodes(&code).contains(&OpCode::LDLOC2));
    }

    #[test]
    fn too_many_slots() {
        let method = MethodDecl::new("big", vec![]).with_locals(256);
        assert_eq!(
            unrepresentable_reason(emit_one(method)),
            Unrepresentable::SlotCount(256)
        );

        let body = vec![Stmt::assign(Slot::Static(300), Expr::int(0))];
        assert_eq!(
            unrepresentable_reason(emit_one(MethodDecl::new("far", body))),
            Unrepresentable::SlotIndex(300)
        );
    }

    #[test]
    fn backward_goto() {
        let body = vec![
            Stmt::label("top"),
            Stmt::expr(Expr::intrinsic("System.Runtime.Log", vec![Expr::string("x")])),
            Stmt::goto("top"),
        ];
        let code = emit_one(MethodDecl::new("forever", body)).unwrap();
        assert_eq!(
            opcodes(&code),
            vec![OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::JMP]
        );
    }
}
