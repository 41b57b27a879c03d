/// Name resolution and lexical scope management.
///
/// Locals live in two stages: `new_localvar` registers a name (it gets a
/// locvar record and a slot above the active ones), and `adjustlocalvars`
/// makes registered names active, stamping their `startpc`. The gap is what
/// lets `local x = x` resolve the right-hand `x` to the previous variable.
use super::{Compiler, CompileError, MAXLOCALS, MAXUPVALUES};
use crate::compiler::expr::ExpDesc;
use crate::opcode::OpCode;
use crescent_core::string::StringId;

impl<'a> Compiler<'a> {
    /// Register a local variable `n` slots above the active ones.
    pub(super) fn new_localvar(&mut self, name: StringId, n: usize) -> Result<(), CompileError> {
        self.check_limit(
            self.fs().nactloc + n + 1,
            MAXLOCALS,
            "local variables",
        )?;
        let fs = self.fs_mut();
        let index = fs.proto.locvars.len();
        fs.proto.locvars.push(crate::proto::LocVar {
            name,
            startpc: 0,
            endpc: 0,
        });
        debug_assert_eq!(fs.actloc.len(), fs.nactloc + n);
        fs.actloc.push(index);
        Ok(())
    }

    /// Register a compiler-generated local such as `(limit)` or `arg`.
    pub(super) fn new_localvar_str(&mut self, name: &str, n: usize) -> Result<(), CompileError> {
        let id = self.lexer.strings.intern(name.as_bytes());
        self.new_localvar(id, n)
    }

    /// Make the last `nvars` registered locals active. Their scope starts at
    /// the current instruction.
    pub(super) fn adjustlocalvars(&mut self, nvars: usize) {
        let fs = self.fs_mut();
        let pc = fs.pc() as u32;
        for _ in 0..nvars {
            let index = fs.actloc[fs.nactloc];
            fs.proto.locvars[index].startpc = pc;
            fs.nactloc += 1;
        }
    }

    /// Close the scope of the innermost `nvars` active locals.
    pub(super) fn removelocalvars(&mut self, nvars: usize) {
        let fs = self.fs_mut();
        let pc = fs.pc() as u32;
        for _ in 0..nvars {
            fs.nactloc -= 1;
            let index = fs.actloc[fs.nactloc];
            fs.proto.locvars[index].endpc = pc;
        }
        let nactloc = fs.nactloc;
        fs.actloc.truncate(nactloc);
    }

    /// Find `name` among active locals, walking the function chain outward.
    /// Returns the distance in function levels (0 = current) and the slot,
    /// or level -1 when the name is not a local anywhere.
    pub(super) fn search_local(&self, name: StringId) -> (i32, usize) {
        for (level, fs) in self.func_stack.iter().rev().enumerate() {
            // Innermost registration wins shadowing.
            for i in (0..fs.nactloc).rev() {
                if fs.proto.locvars[fs.actloc[i]].name == name {
                    return (level as i32, i);
                }
            }
        }
        (-1, 0)
    }

    /// Resolve a bare name to a local of the current function or a global.
    /// A local of any enclosing function is an error: those can only be
    /// reached through the `%name` upvalue form.
    pub(super) fn singlevar(&mut self, name: StringId) -> Result<ExpDesc, CompileError> {
        match self.search_local(name) {
            (0, i) => Ok(ExpDesc::Local(i)),
            (-1, _) => {
                let k = self.string_constant(name)?;
                Ok(ExpDesc::Global(k))
            }
            _ => Err(self.error_near("cannot access a variable in outer function", name)),
        }
    }

    /// Reuse or append an upvalue descriptor for the current function.
    fn indexupvalue(&mut self, v: ExpDesc) -> Result<usize, CompileError> {
        for (i, u) in self.fs().upvalues.iter().enumerate() {
            if *u == v {
                return Ok(i);
            }
        }
        self.check_limit(self.fs().upvalues.len() + 1, MAXUPVALUES, "upvalues")?;
        self.fs_mut().upvalues.push(v);
        Ok(self.fs().upvalues.len() - 1)
    }

    /// Compile a `%name` reference: capture a value from the immediately
    /// enclosing function. The capture source must be a local of that
    /// function or a global.
    pub(super) fn pushupvalue(&mut self, name: StringId) -> Result<(), CompileError> {
        let (level, slot) = self.search_local(name);
        let v = if level == -1 {
            if self.func_stack.len() == 1 {
                return Err(self.error_near("cannot access an upvalue at top level", name));
            }
            let enclosing = self.func_stack.len() - 2;
            // The enclosing function pushes the value at closure creation,
            // so the name constant belongs in its pool.
            ExpDesc::Global(self.string_constant_in(enclosing, name)?)
        } else if level == 1 {
            ExpDesc::Local(slot)
        } else {
            return Err(self.error_near(
                "upvalue must be global or local to immediately outer function",
                name,
            ));
        };
        let index = self.indexupvalue(v)?;
        self.fs_mut().code_u(OpCode::PushUpvalue, index as u32)?;
        Ok(())
    }

    /// A lexical block: locals declared inside it die (and are popped) at
    /// its end.
    pub(super) fn block(&mut self) -> Result<(), CompileError> {
        let nactloc = self.fs().nactloc;
        self.chunk()?;
        let nvars = self.fs().nactloc - nactloc;
        self.fs_mut().adjuststack(nvars as i32)?;
        self.removelocalvars(nvars);
        Ok(())
    }
}
