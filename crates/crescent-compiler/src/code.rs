/// Bytecode emitter.
///
/// `FuncState` holds the per-function compilation state: the prototype being
/// built, the symbolic operand-stack depth, and the jump patch lists. The
/// parser drives it directly; no intermediate representation exists.
///
/// Patch lists are intrusive: the S operand of an emitted jump either holds
/// its final offset or threads to the previous unresolved jump of the same
/// list, with a self-offset (`NO_JUMP`) terminating the chain.
use crate::compiler::expr::{BinOp, ExpDesc, UnOp};
use crate::compiler::CompileError;
use crate::opcode::{Instruction, OpCode, MAXARG_S, MAXARG_U, MULT_RET, NO_JUMP};
use crate::proto::Proto;
use crescent_core::string::StringId;

/// Hard limit on the runtime operand stack modeled at compile time.
pub const MAXSTACK: i32 = 256;

/// How far back `number_constant` searches for a duplicate before giving up
/// and appending. Numeric pools are short; a bounded scan keeps this linear.
const LOOKBACK_NUMS: usize = 20;

/// An active loop: the pending `break` jumps and the stack height to restore
/// when leaving the loop.
#[derive(Clone, Copy, Debug)]
pub struct BreakLabel {
    pub breaklist: i32,
    pub stacklevel: i32,
}

/// Compilation state for one function.
pub struct FuncState {
    /// Prototype under construction.
    pub proto: Proto,
    /// Line of the last consumed token; stamps `line_info` on emission.
    pub lastline: u32,
    /// pc of the last jump target. Peephole fusions never look across it,
    /// and neither does `last_is_open`.
    lasttarget: i32,
    /// Patch list of pending jumps to the next instruction to be emitted.
    jpc: i32,
    /// Symbolic height of the runtime operand stack.
    pub stacklevel: i32,
    /// Registered locals as indices into `proto.locvars`; the first
    /// `nactloc` are active (visible to name resolution).
    pub actloc: Vec<usize>,
    pub nactloc: usize,
    /// Captured upvalues, each a Local or Global reference in the enclosing
    /// function. Deduplicated by `indexupvalue`.
    pub upvalues: Vec<ExpDesc>,
    /// Break frames of the loops currently open, innermost last.
    pub breaks: Vec<BreakLabel>,
}

impl FuncState {
    pub fn new(source: StringId, line: u32) -> Self {
        FuncState {
            proto: Proto::new(source),
            lastline: line,
            lasttarget: 0,
            jpc: NO_JUMP,
            stacklevel: 0,
            actloc: Vec::new(),
            nactloc: 0,
            upvalues: Vec::new(),
            breaks: Vec::new(),
        }
    }

    /// Next instruction index.
    pub fn pc(&self) -> usize {
        self.proto.code.len()
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: msg.into(),
            line: self.lastline,
        }
    }

    // ---- Symbolic stack ----

    pub fn deltastack(&mut self, delta: i32) -> Result<(), CompileError> {
        self.stacklevel += delta;
        debug_assert!(self.stacklevel >= 0, "symbolic stack underflow");
        if self.stacklevel > self.proto.maxstacksize {
            if self.stacklevel > MAXSTACK {
                return Err(self.err("function or expression too complex"));
            }
            self.proto.maxstacksize = self.stacklevel;
        }
        Ok(())
    }

    /// Stack effect of an instruction, given the current symbolic level.
    fn stack_delta(&self, i: Instruction) -> i32 {
        use OpCode::*;
        match i.opcode() {
            PushNil => i.arg_u() as i32,
            Pop => -(i.arg_u() as i32),
            PushInt | PushString | PushNum | PushNegNum | PushUpvalue | GetLocal | GetGlobal
            | CreateTable | PushSelf | PushNilJmp => 1,
            SetLocal | SetGlobal | GetTable | Add | Sub | Mult | Div | Pow => -1,
            GetDotted | GetIndexed | AddI | Minus | Not | Jmp | ForPrep => 0,
            SetTable => -(i.arg_b() as i32),
            // SetList/SetMap drop everything above the table slot.
            SetList => (i.arg_b() as i32 + 1) - self.stacklevel,
            SetMap => (i.arg_u() as i32 + 1) - self.stacklevel,
            Concat => 1 - i.arg_u() as i32,
            JmpNe | JmpEq | JmpLt | JmpLe | JmpGt | JmpGe => -2,
            JmpT | JmpF | JmpOnT | JmpOnF => -1,
            // A call removes the function and its arguments; results are
            // accounted separately by `setcallreturns`.
            Call => i.arg_a() as i32 - self.stacklevel,
            // A return removes every temporary above the active locals.
            Return => i.arg_u() as i32 - self.stacklevel,
            ForLoop => -3,
            LForPrep => 3,
            LForLoop => -4,
            Closure => 1 - i.arg_b() as i32,
            // Only produced by the Return-after-open-Call fusion.
            TailCall => 0,
        }
    }

    // ---- Emission ----

    /// Emit one instruction: apply its stack effect, discharge pending
    /// jumps-to-here, then either fuse it into the previous instruction or
    /// append it. Returns the index of the instruction that now carries the
    /// effect (the fused one when a peephole applied).
    pub fn code(&mut self, i: Instruction) -> Result<usize, CompileError> {
        let delta = self.stack_delta(i);
        self.deltastack(delta)?;
        self.discharge_jpc()?;
        if !self.peephole(i) {
            self.proto.code.push(i);
            self.proto.line_info.push(self.lastline);
        }
        Ok(self.pc() - 1)
    }

    pub fn code_op(&mut self, op: OpCode) -> Result<usize, CompileError> {
        self.code(Instruction::op(op))
    }

    pub fn code_u(&mut self, op: OpCode, u: u32) -> Result<usize, CompileError> {
        self.code(Instruction::u(op, u))
    }

    pub fn code_s(&mut self, op: OpCode, s: i32) -> Result<usize, CompileError> {
        self.code(Instruction::s(op, s))
    }

    pub fn code_ab(&mut self, op: OpCode, a: u32, b: u32) -> Result<usize, CompileError> {
        self.code(Instruction::ab(op, a, b))
    }

    /// Try to fuse `i` with the previous instruction. Never crosses a jump
    /// target: a fused instruction would change the meaning of the label.
    fn peephole(&mut self, i: Instruction) -> bool {
        use OpCode::*;
        if self.pc() as i32 <= self.lasttarget {
            return false;
        }
        let prev_pc = match self.pc().checked_sub(1) {
            Some(p) => p,
            None => return false,
        };
        let prev = self.proto.code[prev_pc];
        let fused = match (i.opcode(), prev.opcode()) {
            (Minus, PushInt) => {
                let mut p = prev;
                p.set_s(-prev.arg_s());
                Some(p)
            }
            (Minus, PushNum) => {
                let mut p = prev;
                p.set_opcode(PushNegNum);
                Some(p)
            }
            (Minus, PushNegNum) => {
                let mut p = prev;
                p.set_opcode(PushNum);
                Some(p)
            }
            (Add, PushInt) => {
                let mut p = prev;
                p.set_opcode(AddI);
                Some(p)
            }
            (Sub, PushInt) => Some(Instruction::s(AddI, -prev.arg_s())),
            (GetTable, PushString) => {
                let mut p = prev;
                p.set_opcode(GetDotted);
                Some(p)
            }
            (GetTable, GetLocal) => {
                let mut p = prev;
                p.set_opcode(GetIndexed);
                Some(p)
            }
            (Concat, Concat) => Some(Instruction::u(Concat, prev.arg_u() + 1)),
            (PushNil, PushNil) => Some(Instruction::u(PushNil, prev.arg_u() + i.arg_u())),
            (Pop, Pop) => Some(Instruction::u(Pop, prev.arg_u() + i.arg_u())),
            (Return, Call) if prev.arg_b() == MULT_RET => {
                Some(Instruction::ab(TailCall, prev.arg_a(), i.arg_u()))
            }
            // `x ~= nil` / `x == nil` need no pushed nil at all.
            (JmpNe, PushNil) if prev.arg_u() == 1 => Some(Instruction::s(JmpT, i.arg_s())),
            (JmpEq, PushNil) if prev.arg_u() == 1 => Some(Instruction::s(JmpF, i.arg_s())),
            // A test of `not x` is an inverted test of x. The value kept by
            // an on-jump is lost here, but it is always the constant result
            // of `not`, and `tostack` re-materializes constants for plain
            // jumps in a patch list.
            (JmpT | JmpOnT, Not) => Some(Instruction::s(JmpF, i.arg_s())),
            (JmpF | JmpOnF, Not) => Some(Instruction::s(JmpT, i.arg_s())),
            _ => None,
        };
        match fused {
            Some(p) => {
                self.proto.code[prev_pc] = p;
                true
            }
            None => false,
        }
    }

    // ---- Jump patch machinery ----

    /// Mark the current position as a jump target and return it.
    pub fn getlabel(&mut self) -> usize {
        self.lasttarget = self.pc() as i32;
        self.pc()
    }

    /// Emit an unconditional jump. Pending jumps to this position are
    /// absorbed into the new jump's own patch list.
    pub fn jump(&mut self) -> Result<i32, CompileError> {
        let on_hold = self.jpc;
        self.jpc = NO_JUMP;
        let mut j = self.code(Instruction::s(OpCode::Jmp, NO_JUMP))? as i32;
        self.concat(&mut j, on_hold)?;
        Ok(j)
    }

    /// Emit a conditional jump, returning its position as a patch-list head.
    fn condjump(&mut self, op: OpCode) -> Result<i32, CompileError> {
        Ok(self.code(Instruction::s(op, NO_JUMP))? as i32)
    }

    /// Write the destination of the jump at `pc`.
    fn fixjump(&mut self, pc: usize, dest: i32) -> Result<(), CompileError> {
        if dest == NO_JUMP {
            self.proto.code[pc].set_s(NO_JUMP);
            return Ok(());
        }
        // Offsets are relative to the instruction after the jump.
        let offset = dest - (pc as i32 + 1);
        if offset.abs() > MAXARG_S {
            return Err(self.err("control structure too long"));
        }
        self.proto.code[pc].set_s(offset);
        Ok(())
    }

    /// Next element of the patch list through `pc`, or NO_JUMP at the end.
    fn getjump(&self, pc: usize) -> i32 {
        let offset = self.proto.code[pc].arg_s();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc as i32 + 1 + offset
        }
    }

    /// Append list `l2` onto list `l1`.
    pub fn concat(&mut self, l1: &mut i32, l2: i32) -> Result<(), CompileError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.getjump(list as usize);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fixjump(list as usize, l2)
    }

    /// Patch every jump of `list` to `target`; jumps whose opcode is
    /// `special` go to `special_target` instead (they keep their tested
    /// value on the stack, so they must skip any materialization code).
    /// Plain patches downgrade value-keeping jumps so no stray value
    /// survives at the target.
    fn patch_list_aux(
        &mut self,
        mut list: i32,
        target: i32,
        special: Option<OpCode>,
        special_target: i32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let pc = list as usize;
            let next = self.getjump(pc);
            let op = self.proto.code[pc].opcode();
            if special == Some(op) {
                self.fixjump(pc, special_target)?;
            } else {
                self.fixjump(pc, target)?;
                match op {
                    OpCode::JmpOnT => self.proto.code[pc].set_opcode(OpCode::JmpT),
                    OpCode::JmpOnF => self.proto.code[pc].set_opcode(OpCode::JmpF),
                    _ => {}
                }
            }
            list = next;
        }
        Ok(())
    }

    /// Patch `list` to jump to `target`. A target at the current pc is kept
    /// on hold (`jpc`) and resolved when the next instruction is emitted.
    pub fn patchlist(&mut self, list: i32, target: usize) -> Result<(), CompileError> {
        if list == NO_JUMP {
            return Ok(());
        }
        if target == self.pc() {
            self.patchtohere(list)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target as i32, None, 0)
        }
    }

    /// Patch `list` to whatever instruction is emitted next.
    pub fn patchtohere(&mut self, list: i32) -> Result<(), CompileError> {
        self.getlabel();
        let mut jpc = self.jpc;
        self.concat(&mut jpc, list)?;
        self.jpc = jpc;
        Ok(())
    }

    fn discharge_jpc(&mut self) -> Result<(), CompileError> {
        if self.jpc != NO_JUMP {
            let list = self.jpc;
            self.jpc = NO_JUMP;
            let here = self.pc() as i32;
            self.patch_list_aux(list, here, None, 0)?;
            self.lasttarget = here;
        }
        Ok(())
    }

    /// Set the destination of a ForPrep/LForPrep emitted at `pc`.
    pub fn fixfor(&mut self, pc: usize, dest: usize) -> Result<(), CompileError> {
        self.fixjump(pc, dest as i32)
    }

    /// True if any jump in `list` lacks its tested value when taken.
    fn need_value(&self, mut list: i32, hasvalue: OpCode) -> bool {
        while list != NO_JUMP {
            if self.proto.code[list as usize].opcode() != hasvalue {
                return true;
            }
            list = self.getjump(list as usize);
        }
        false
    }

    /// Unpatched jump instruction right behind the emission point?
    fn last_is_jump(&self) -> bool {
        self.pc() > 0 && self.proto.code[self.pc() - 1].opcode().is_jump()
    }

    fn invertjump(&mut self, pc: usize) {
        use OpCode::*;
        let i = &mut self.proto.code[pc];
        let inverted = match i.opcode() {
            JmpNe => JmpEq,
            JmpEq => JmpNe,
            JmpLt => JmpGe,
            JmpGe => JmpLt,
            JmpLe => JmpGt,
            JmpGt => JmpLe,
            JmpT => JmpF,
            JmpF => JmpT,
            JmpOnT => JmpOnF,
            JmpOnF => JmpOnT,
            other => unreachable!("cannot invert {}", other.name()),
        };
        i.set_opcode(inverted);
    }

    // ---- Constants and simple pushes ----

    /// Push a number, as an inline integer when it fits.
    pub fn number(&mut self, n: f64) -> Result<(), CompileError> {
        if n.trunc() == n && n.abs() <= MAXARG_S as f64 {
            self.code_s(OpCode::PushInt, n as i32)?;
        } else {
            let k = self.number_constant(n)?;
            self.code_u(OpCode::PushNum, k as u32)?;
        }
        Ok(())
    }

    /// Index of `n` in the numeric pool, reusing a recent duplicate.
    fn number_constant(&mut self, n: f64) -> Result<usize, CompileError> {
        let knum = &self.proto.knum;
        let lim = knum.len().saturating_sub(LOOKBACK_NUMS);
        for (i, &k) in knum.iter().enumerate().skip(lim).rev() {
            if k == n {
                return Ok(i);
            }
        }
        if self.proto.knum.len() >= MAXARG_U as usize {
            return Err(self.err("constant table overflow"));
        }
        self.proto.knum.push(n);
        Ok(self.proto.knum.len() - 1)
    }

    /// Push string constant `k`.
    pub fn kstr(&mut self, k: usize) -> Result<(), CompileError> {
        self.code_u(OpCode::PushString, k as u32)?;
        Ok(())
    }

    /// Push or pop to correct the stack by `n` (positive pops).
    pub fn adjuststack(&mut self, n: i32) -> Result<(), CompileError> {
        if n > 0 {
            self.code_u(OpCode::Pop, n as u32)?;
        } else if n < 0 {
            self.code_u(OpCode::PushNil, (-n) as u32)?;
        }
        Ok(())
    }

    // ---- Open calls ----

    /// True when the last emitted instruction is a call still open to
    /// deliver any number of results.
    pub fn last_is_open(&self) -> bool {
        if self.pc() as i32 <= self.lasttarget || self.pc() == 0 {
            return false;
        }
        let i = self.proto.code[self.pc() - 1];
        i.opcode() == OpCode::Call && i.arg_b() == MULT_RET
    }

    /// Fix the number of results of an open call.
    pub fn setcallreturns(&mut self, nresults: u32) -> Result<(), CompileError> {
        if self.last_is_open() {
            let pc = self.pc() - 1;
            self.proto.code[pc].set_b(nresults);
            self.deltastack(nresults as i32)?;
        }
        Ok(())
    }

    // ---- Expression discharge ----

    /// Emit the read of a variable reference, turning `v` into an expression
    /// with empty patch lists. Returns false if `v` already was one.
    fn discharge(&mut self, v: &mut ExpDesc) -> Result<bool, CompileError> {
        match *v {
            ExpDesc::Local(i) => {
                self.code_u(OpCode::GetLocal, i as u32)?;
            }
            ExpDesc::Global(k) => {
                self.code_u(OpCode::GetGlobal, k)?;
            }
            ExpDesc::Indexed => {
                self.code_op(OpCode::GetTable)?;
            }
            ExpDesc::Expr { .. } => return Ok(false),
        }
        *v = ExpDesc::expr();
        Ok(true)
    }

    /// Discharge `v` and close an open call down to one value. Patch lists
    /// stay live.
    fn discharge1(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        self.discharge(v)?;
        if let ExpDesc::Expr {
            t: NO_JUMP,
            f: NO_JUMP,
        } = *v
        {
            self.setcallreturns(1)?;
        }
        Ok(())
    }

    /// Materialize `v` on the stack. With `onlyone`, an open call is fixed
    /// to a single result; otherwise the last call stays open.
    ///
    /// An expression with pending true/false jumps (or ending in a bare
    /// comparison) needs its value built: value-keeping jumps go straight to
    /// the end, the others land on a nil/1 pair.
    pub fn tostack(&mut self, v: &mut ExpDesc, onlyone: bool) -> Result<(), CompileError> {
        if self.discharge(v)? {
            return Ok(());
        }
        let ExpDesc::Expr { t, f } = *v else {
            unreachable!("discharge left a variable reference");
        };
        let prev_jump = self.last_is_jump();
        if !prev_jump && t == NO_JUMP && f == NO_JUMP {
            if onlyone {
                self.setcallreturns(1)?;
            }
            return Ok(());
        }
        let mut t = t;
        let mut p_nil = NO_JUMP;
        let mut p_1 = NO_JUMP;
        if prev_jump || self.need_value(f, OpCode::JmpOnF) || self.need_value(t, OpCode::JmpOnT) {
            let mut skip = NO_JUMP;
            if prev_jump {
                // A bare comparison: the taken jump is the true case.
                let last = self.pc() as i32 - 1;
                self.concat(&mut t, last)?;
            } else {
                // A value is already on the stack; jump over the pair.
                skip = self.jump()?;
            }
            p_nil = self.code_op(OpCode::PushNilJmp)? as i32;
            p_1 = self.code_s(OpCode::PushInt, 1)? as i32;
            // Any single run executes at most one of the two pushes, and the
            // stack-on-entry differs between the two branches above.
            self.deltastack(if prev_jump { -1 } else { -2 })?;
            if skip != NO_JUMP {
                let label = self.getlabel();
                self.patchlist(skip, label)?;
            }
        }
        let end = self.getlabel() as i32;
        self.patch_list_aux(f, p_nil, Some(OpCode::JmpOnF), end)?;
        self.patch_list_aux(t, p_1, Some(OpCode::JmpOnT), end)?;
        *v = ExpDesc::expr();
        Ok(())
    }

    /// Emit the store matching a variable reference. The value to store is
    /// on top of the stack; for an indexed target the table/key pair sits
    /// right below it.
    pub fn storevar(&mut self, v: &ExpDesc) -> Result<(), CompileError> {
        match *v {
            ExpDesc::Local(i) => {
                self.code_u(OpCode::SetLocal, i as u32)?;
            }
            ExpDesc::Global(k) => {
                self.code_u(OpCode::SetGlobal, k)?;
            }
            ExpDesc::Indexed => {
                // Table, key and value are the top three entries.
                self.code_ab(OpCode::SetTable, 3, 3)?;
            }
            ExpDesc::Expr { .. } => unreachable!("store target must be a variable"),
        }
        Ok(())
    }

    // ---- Conditions ----

    /// Emit a jump taken when `v` is false, appending it to `v`'s false
    /// list; the true list is patched to the code that follows. With
    /// `keepvalue`, the taken jump keeps the tested value on the stack.
    pub fn goiftrue(&mut self, v: &mut ExpDesc, keepvalue: bool) -> Result<(), CompileError> {
        self.discharge1(v)?;
        let ExpDesc::Expr { t, f } = v else {
            unreachable!("discharge1 left a variable reference");
        };
        let (mut t, mut f) = (*t, *f);
        if self.last_is_jump() {
            // A comparison jumps when it holds; make it jump when it fails.
            self.invertjump(self.pc() - 1);
        } else {
            let op = if keepvalue {
                OpCode::JmpOnF
            } else {
                OpCode::JmpF
            };
            self.condjump(op)?;
        }
        let last = self.pc() as i32 - 1;
        self.concat(&mut f, last)?;
        let label = self.getlabel();
        self.patchlist(t, label)?;
        t = NO_JUMP;
        *v = ExpDesc::Expr { t, f };
        Ok(())
    }

    /// Mirror image of `goiftrue`: jump when `v` is true.
    fn goiffalse(&mut self, v: &mut ExpDesc, keepvalue: bool) -> Result<(), CompileError> {
        self.discharge1(v)?;
        let ExpDesc::Expr { t, f } = v else {
            unreachable!("discharge1 left a variable reference");
        };
        let (mut t, mut f) = (*t, *f);
        if !self.last_is_jump() {
            let op = if keepvalue {
                OpCode::JmpOnT
            } else {
                OpCode::JmpT
            };
            self.condjump(op)?;
        }
        let last = self.pc() as i32 - 1;
        self.concat(&mut t, last)?;
        let label = self.getlabel();
        self.patchlist(f, label)?;
        f = NO_JUMP;
        *v = ExpDesc::Expr { t, f };
        Ok(())
    }

    // ---- Operator hooks ----

    /// Apply a unary operator to the parsed operand.
    pub fn prefix(&mut self, op: UnOp, v: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            UnOp::Minus => {
                self.tostack(v, true)?;
                self.code_op(OpCode::Minus)?;
            }
            UnOp::Not => {
                self.discharge1(v)?;
                if self.last_is_jump() {
                    self.invertjump(self.pc() - 1);
                } else {
                    self.code_op(OpCode::Not)?;
                }
                if let ExpDesc::Expr { t, f } = v {
                    std::mem::swap(t, f);
                }
            }
        }
        Ok(())
    }

    /// Prepare the left operand before the right one is parsed.
    pub fn infix(&mut self, op: BinOp, v: &mut ExpDesc) -> Result<(), CompileError> {
        match op {
            BinOp::And => self.goiftrue(v, true),
            BinOp::Or => self.goiffalse(v, true),
            _ => self.tostack(v, true),
        }
    }

    /// Combine both operands once the right one is parsed.
    pub fn posfix(
        &mut self,
        op: BinOp,
        v1: &mut ExpDesc,
        v2: &mut ExpDesc,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert!(
                    matches!(v1, ExpDesc::Expr { t: NO_JUMP, .. }),
                    "true list must be closed"
                );
                self.discharge1(v2)?;
                if let (ExpDesc::Expr { t: t1, f: f1 }, ExpDesc::Expr { t: t2, f: f2 }) = (v1, v2) {
                    *t1 = *t2;
                    self.concat(f1, *f2)?;
                }
            }
            BinOp::Or => {
                debug_assert!(
                    matches!(v1, ExpDesc::Expr { f: NO_JUMP, .. }),
                    "false list must be closed"
                );
                self.discharge1(v2)?;
                if let (ExpDesc::Expr { t: t1, f: f1 }, ExpDesc::Expr { t: t2, f: f2 }) = (v1, v2) {
                    *f1 = *f2;
                    self.concat(t1, *t2)?;
                }
            }
            _ => {
                self.tostack(v2, true)?;
                use OpCode::*;
                match op {
                    BinOp::Add => self.code_op(Add)?,
                    BinOp::Sub => self.code_op(Sub)?,
                    BinOp::Mult => self.code_op(Mult)?,
                    BinOp::Div => self.code_op(Div)?,
                    BinOp::Pow => self.code_op(Pow)?,
                    BinOp::Concat => self.code_u(Concat, 2)?,
                    BinOp::Eq => self.condjump(JmpEq)? as usize,
                    BinOp::Ne => self.condjump(JmpNe)? as usize,
                    BinOp::Lt => self.condjump(JmpLt)? as usize,
                    BinOp::Le => self.condjump(JmpLe)? as usize,
                    BinOp::Gt => self.condjump(JmpGt)? as usize,
                    BinOp::Ge => self.condjump(JmpGe)? as usize,
                    BinOp::And | BinOp::Or => unreachable!(),
                };
            }
        }
        Ok(())
    }

    // ---- Loops ----

    pub fn enterbreak(&mut self) {
        self.breaks.push(BreakLabel {
            breaklist: NO_JUMP,
            stacklevel: self.stacklevel,
        });
    }

    pub fn leavebreak(&mut self) -> Result<(), CompileError> {
        let bl = self.breaks.pop().expect("unbalanced break frames");
        debug_assert_eq!(bl.stacklevel, self.stacklevel);
        let label = self.getlabel();
        self.patchlist(bl.breaklist, label)
    }

    // ---- Function close ----

    /// Verify that no reachable jump still carries the NO_JUMP sentinel.
    /// Called when a function is closed; a leftover sentinel means a patch
    /// list escaped.
    pub fn check_jumps_patched(&self) {
        if cfg!(debug_assertions) {
            for (pc, i) in self.proto.code.iter().enumerate() {
                if i.opcode().is_jump() {
                    debug_assert!(
                        i.arg_s() != NO_JUMP,
                        "unpatched {} at pc {pc}",
                        i.opcode().name()
                    );
                }
            }
        }
    }
}
