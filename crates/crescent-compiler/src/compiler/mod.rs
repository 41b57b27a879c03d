/// Single-pass compiler: recursive-descent parser driving the bytecode
/// emitter directly, with no intermediate tree.
pub mod expr;
pub mod scope;

use crate::code::FuncState;
use crate::lexer::{LexError, Lexer};
use crate::opcode::{OpCode, MAXARG_A, MAXARG_U, MULT_RET, NO_JUMP};
use crate::proto::Proto;
use crate::token::{SpannedToken, Token};
use crescent_core::string::{StringId, StringInterner};
use expr::{BinOp, ExpDesc, UnOp, UNARY_PRIORITY};
use std::fmt;

pub(crate) const MAXLOCALS: usize = 200;
pub(crate) const MAXUPVALUES: usize = 32;
const MAXPARAMS: usize = 100;
const MAXVARSLH: usize = 100;
const LFIELDS_PER_FLUSH: usize = 64;
const RFIELDS_PER_FLUSH: usize = 32;
/// Bound on grammar recursion, so a pathological chunk cannot blow the
/// compiler's own stack.
const MAX_NEST_DEPTH: u32 = 200;

/// Compiler error.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Kind of one constructor part; the two parts of `{ ... ; ... }` must
/// differ in kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PartKind {
    List,
    Record,
    EmptySemi,
    EmptyBrace,
}

/// The compiler: token cursor, lookahead buffer, and the stack of function
/// states (main chunk at the bottom, innermost function on top).
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    /// Current token.
    t: SpannedToken,
    /// One-token lookahead. Filled at exactly two grammar points: after a
    /// NAME inside a constructor, and after `function` as a statement.
    ahead: Option<SpannedToken>,
    /// Line of the last consumed token.
    lastline: u32,
    func_stack: Vec<FuncState>,
    nest_depth: u32,
}

impl<'a> Compiler<'a> {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    // ---- Token cursor ----

    /// Consume the current token, adopting the lookahead when one is buffered.
    fn next(&mut self) -> Result<(), CompileError> {
        self.lastline = self.t.line;
        self.fs_mut().lastline = self.t.line;
        self.t = match self.ahead.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        Ok(())
    }

    /// Populate the lookahead slot. Requires it to be empty.
    fn lookahead(&mut self) -> Result<&Token, CompileError> {
        debug_assert!(self.ahead.is_none(), "double lookahead");
        let tok = self.lexer.next_token()?;
        self.ahead = Some(tok);
        Ok(&self.ahead.as_ref().unwrap().token)
    }

    /// Source text of the current token, for "near" diagnostics.
    fn token_text(&self) -> String {
        match &self.t.token {
            Token::Name(id) | Token::String(id) => {
                String::from_utf8_lossy(self.lexer.strings.get_bytes(*id)).into_owned()
            }
            other => other.to_string(),
        }
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: format!("{} near '{}'", msg.into(), self.token_text()),
            line: self.t.line,
        }
    }

    fn error_near(&self, msg: &str, name: StringId) -> CompileError {
        let text = String::from_utf8_lossy(self.lexer.strings.get_bytes(name)).into_owned();
        CompileError {
            message: format!("{msg} near '{text}'"),
            line: self.t.line,
        }
    }

    fn error_expected(&self, token: &Token) -> CompileError {
        self.error(format!("'{token}' expected"))
    }

    fn check_limit(
        &self,
        value: usize,
        limit: usize,
        what: &str,
    ) -> Result<(), CompileError> {
        if value > limit {
            return Err(CompileError {
                message: format!("too many {what} (limit={limit})"),
                line: self.t.line,
            });
        }
        Ok(())
    }

    /// Fail unless the current token is `token`; consume it.
    fn check(&mut self, token: Token) -> Result<(), CompileError> {
        if self.t.token != token {
            return Err(self.error_expected(&token));
        }
        self.next()
    }

    /// Consume the current token if it is `token`.
    fn optional(&mut self, token: Token) -> Result<bool, CompileError> {
        if self.t.token == token {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Expect `what`, naming the still-open `who` from `line` when the pair
    /// spans multiple lines.
    fn check_match(&mut self, what: Token, who: Token, line: u32) -> Result<(), CompileError> {
        if self.t.token != what {
            if self.t.line == line {
                return Err(self.error_expected(&what));
            }
            return Err(self.error(format!(
                "'{what}' expected (to close '{who}' at line {line})"
            )));
        }
        self.next()
    }

    fn str_checkname(&mut self) -> Result<StringId, CompileError> {
        match self.t.token {
            Token::Name(id) => {
                self.next()?;
                Ok(id)
            }
            _ => Err(self.error("<name> expected")),
        }
    }

    /// Name in the current function's string constant pool.
    fn checkname(&mut self) -> Result<u32, CompileError> {
        let name = self.str_checkname()?;
        self.string_constant(name)
    }

    // ---- Constant interning ----

    /// Index of `s` in the string pool of the function at `level` of the
    /// stack. The interner hint makes the common repeated-name case O(1);
    /// it is validated against the pool, so a hint left by another function
    /// is just a miss.
    fn string_constant_in(&mut self, level: usize, s: StringId) -> Result<u32, CompileError> {
        let hint = self.lexer.strings.const_hint(s);
        let pool = &self.func_stack[level].proto.kstr;
        if hint < pool.len() && pool[hint] == s {
            return Ok(hint as u32);
        }
        self.check_limit(pool.len() + 1, MAXARG_U as usize, "constants")?;
        let pool = &mut self.func_stack[level].proto.kstr;
        pool.push(s);
        let index = pool.len() - 1;
        self.lexer.strings.set_const_hint(s, index);
        Ok(index as u32)
    }

    fn string_constant(&mut self, s: StringId) -> Result<u32, CompileError> {
        self.string_constant_in(self.func_stack.len() - 1, s)
    }

    /// Push a string literal.
    fn code_string(&mut self, s: StringId) -> Result<(), CompileError> {
        let k = self.string_constant(s)?;
        self.fs_mut().kstr(k as usize)
    }

    // ---- Recursion guard ----

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.nest_depth += 1;
        if self.nest_depth > MAX_NEST_DEPTH {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.nest_depth -= 1;
    }

    // ---- Expressions ----

    fn unop_of(token: &Token) -> Option<UnOp> {
        match token {
            Token::Not => Some(UnOp::Not),
            Token::Minus => Some(UnOp::Minus),
            _ => None,
        }
    }

    fn binop_of(token: &Token) -> Option<BinOp> {
        match token {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mult),
            Token::Slash => Some(BinOp::Div),
            Token::Caret => Some(BinOp::Pow),
            Token::Concat => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::Ne),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::Le),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::Ge),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        }
    }

    /// primaryexp -> NUMBER | STRING | nil | constructor | function body
    ///             | '(' expr ')' | NAME | '%' NAME
    fn primaryexp(&mut self) -> Result<ExpDesc, CompileError> {
        match self.t.token.clone() {
            Token::Number(n) => {
                self.next()?;
                self.fs_mut().number(n)?;
                Ok(ExpDesc::expr())
            }
            Token::String(id) => {
                self.code_string(id)?;
                self.next()?;
                Ok(ExpDesc::expr())
            }
            Token::Nil => {
                self.fs_mut().adjuststack(-1)?;
                self.next()?;
                Ok(ExpDesc::expr())
            }
            Token::LBrace => {
                self.constructor()?;
                Ok(ExpDesc::expr())
            }
            Token::Function => {
                self.next()?;
                let line = self.t.line;
                self.body(false, line)?;
                Ok(ExpDesc::expr())
            }
            Token::LParen => {
                self.next()?;
                let v = self.expr()?;
                self.check(Token::RParen)?;
                Ok(v)
            }
            Token::Name(_) => {
                let name = self.str_checkname()?;
                self.singlevar(name)
            }
            Token::Percent => {
                self.next()?;
                let name = self.str_checkname()?;
                self.pushupvalue(name)?;
                Ok(ExpDesc::expr())
            }
            _ => Err(self.error("unexpected symbol")),
        }
    }

    /// simpleexp -> primaryexp { '.' NAME | '[' exp ']' | ':' NAME funcargs
    ///            | funcargs }
    fn simpleexp(&mut self) -> Result<ExpDesc, CompileError> {
        let mut v = self.primaryexp()?;
        loop {
            match self.t.token {
                Token::Dot => {
                    self.next()?;
                    self.fs_mut().tostack(&mut v, true)?;
                    let k = self.checkname()?;
                    self.fs_mut().kstr(k as usize)?;
                    v = ExpDesc::Indexed;
                }
                Token::LBracket => {
                    self.next()?;
                    self.fs_mut().tostack(&mut v, true)?;
                    self.exp1()?;
                    self.check(Token::RBracket)?;
                    v = ExpDesc::Indexed;
                }
                Token::Colon => {
                    self.next()?;
                    self.fs_mut().tostack(&mut v, true)?;
                    let k = self.checkname()?;
                    self.fs_mut().code_u(OpCode::PushSelf, k)?;
                    self.funcargs(true)?;
                    v = ExpDesc::expr();
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    self.fs_mut().tostack(&mut v, true)?;
                    self.funcargs(false)?;
                    v = ExpDesc::expr();
                }
                _ => return Ok(v),
            }
        }
    }

    /// subexpr -> (simpleexp | unop subexpr) { binop subexpr }
    /// consuming binary operators while their left priority is above
    /// `limit`; the first operator that is not is handed back unconsumed.
    fn subexpr(&mut self, limit: u8) -> Result<(ExpDesc, Option<BinOp>), CompileError> {
        self.enter_level()?;
        let mut v = if let Some(uop) = Self::unop_of(&self.t.token) {
            self.next()?;
            let (mut v, _) = self.subexpr(UNARY_PRIORITY)?;
            self.fs_mut().prefix(uop, &mut v)?;
            v
        } else {
            self.simpleexp()?
        };
        let mut op = Self::binop_of(&self.t.token);
        while let Some(o) = op {
            if o.priority().0 <= limit {
                break;
            }
            self.next()?;
            self.fs_mut().infix(o, &mut v)?;
            let (mut v2, nextop) = self.subexpr(o.priority().1)?;
            self.fs_mut().posfix(o, &mut v, &mut v2)?;
            op = nextop;
        }
        self.leave_level();
        Ok((v, op))
    }

    fn expr(&mut self) -> Result<ExpDesc, CompileError> {
        Ok(self.subexpr(0)?.0)
    }

    /// A single-valued expression, materialized on the stack.
    fn exp1(&mut self) -> Result<(), CompileError> {
        let mut v = self.expr()?;
        self.fs_mut().tostack(&mut v, true)
    }

    /// explist1 -> expr { ',' expr }. All but the last expression yield one
    /// value; the last stays open.
    fn explist1(&mut self) -> Result<usize, CompileError> {
        let mut n = 1;
        let mut v = self.expr()?;
        while self.t.token == Token::Comma {
            self.next()?;
            self.fs_mut().tostack(&mut v, true)?;
            v = self.expr()?;
            n += 1;
        }
        self.fs_mut().tostack(&mut v, false)?;
        Ok(n)
    }

    /// funcargs -> '(' [explist1] ')' | constructor | STRING
    /// The function (and `self` for method calls) is already on the stack.
    fn funcargs(&mut self, is_method: bool) -> Result<(), CompileError> {
        let slf = if is_method { 1 } else { 0 };
        let slevel = self.fs().stacklevel - slf - 1;
        match self.t.token.clone() {
            Token::LParen => {
                let line = self.t.line;
                self.next()?;
                if self.t.token != Token::RParen {
                    self.explist1()?;
                }
                self.check_match(Token::RParen, Token::LParen, line)?;
            }
            Token::LBrace => {
                self.constructor()?;
            }
            Token::String(id) => {
                self.code_string(id)?;
                self.next()?;
            }
            _ => return Err(self.error("function arguments expected")),
        }
        self.fs_mut().code_ab(OpCode::Call, slevel as u32, MULT_RET)?;
        Ok(())
    }

    // ---- Constructors ----

    /// recfield -> (NAME | '[' exp1 ']') '=' exp1
    fn recfield(&mut self) -> Result<(), CompileError> {
        match self.t.token {
            Token::Name(_) => {
                let k = self.checkname()?;
                self.fs_mut().kstr(k as usize)?;
            }
            Token::LBracket => {
                self.next()?;
                self.exp1()?;
                self.check(Token::RBracket)?;
            }
            _ => return Err(self.error("<name> or '[' expected")),
        }
        self.check(Token::Assign)?;
        self.exp1()
    }

    /// recfields -> recfield { ',' recfield } [','], flushed into the table
    /// every RFIELDS_PER_FLUSH pairs.
    fn recfields(&mut self) -> Result<usize, CompileError> {
        let table = (self.fs().stacklevel - 1) as u32;
        let mut n = 1;
        self.recfield()?;
        while self.t.token == Token::Comma {
            self.next()?;
            if matches!(self.t.token, Token::Semi | Token::RBrace) {
                break;
            }
            if n % RFIELDS_PER_FLUSH == 0 {
                self.fs_mut().code_u(OpCode::SetMap, table)?;
            }
            self.recfield()?;
            n += 1;
        }
        self.fs_mut().code_u(OpCode::SetMap, table)?;
        Ok(n)
    }

    /// listfields -> exp1 { ',' exp1 } [','], flushed in batches; the last
    /// expression stays open so a trailing call can fill many slots.
    fn listfields(&mut self) -> Result<usize, CompileError> {
        let table = (self.fs().stacklevel - 1) as u32;
        let mut n = 1;
        let mut v = self.expr()?;
        while self.t.token == Token::Comma {
            self.next()?;
            if matches!(self.t.token, Token::Semi | Token::RBrace) {
                break;
            }
            self.fs_mut().tostack(&mut v, true)?;
            self.check_limit(
                n / LFIELDS_PER_FLUSH,
                MAXARG_A as usize,
                "'item groups' in a list initializer",
            )?;
            if n % LFIELDS_PER_FLUSH == 0 {
                let batch = ((n - 1) / LFIELDS_PER_FLUSH) as u32;
                self.fs_mut().code_ab(OpCode::SetList, batch, table)?;
            }
            v = self.expr()?;
            n += 1;
        }
        self.fs_mut().tostack(&mut v, false)?;
        let batch = ((n - 1) / LFIELDS_PER_FLUSH) as u32;
        self.fs_mut().code_ab(OpCode::SetList, batch, table)?;
        Ok(n)
    }

    /// One part of a constructor: list fields, record fields, or empty.
    fn constructor_part(&mut self) -> Result<(usize, PartKind), CompileError> {
        match self.t.token {
            Token::Semi => Ok((0, PartKind::EmptySemi)),
            Token::RBrace => Ok((0, PartKind::EmptyBrace)),
            Token::Name(_) => {
                // NAME '=' starts record fields; a bare NAME is the first
                // list element. The single point of lookahead in expressions.
                if *self.lookahead()? == Token::Assign {
                    Ok((self.recfields()?, PartKind::Record))
                } else {
                    Ok((self.listfields()?, PartKind::List))
                }
            }
            Token::LBracket => Ok((self.recfields()?, PartKind::Record)),
            _ => Ok((self.listfields()?, PartKind::List)),
        }
    }

    /// constructor -> '{' part [';' part] '}'
    fn constructor(&mut self) -> Result<(), CompileError> {
        let line = self.t.line;
        let pc = self.fs_mut().code_u(OpCode::CreateTable, 0)?;
        self.check(Token::LBrace)?;
        let (n, kind) = self.constructor_part()?;
        let mut nelems = n;
        if self.optional(Token::Semi)? {
            let (n2, kind2) = self.constructor_part()?;
            if kind == kind2 {
                return Err(self.error("invalid constructor syntax"));
            }
            nelems += n2;
        }
        self.check_match(Token::RBrace, Token::LBrace, line)?;
        self.check_limit(nelems, MAXARG_U as usize, "elements in a table constructor")?;
        // Pre-size the table with the final element count.
        self.fs_mut().proto.get_mut(pc).set_u(nelems as u32);
        Ok(())
    }

    // ---- Statements ----

    fn block_follow(token: &Token) -> bool {
        matches!(
            token,
            Token::Else | Token::ElseIf | Token::End | Token::Until | Token::Eos
        )
    }

    /// cond -> expr, turned into a false-jump chain.
    fn cond(&mut self) -> Result<ExpDesc, CompileError> {
        let mut v = self.expr()?;
        self.fs_mut().goiftrue(&mut v, false)?;
        Ok(v)
    }

    fn false_list(v: &ExpDesc) -> i32 {
        match v {
            ExpDesc::Expr { f, .. } => *f,
            _ => NO_JUMP,
        }
    }

    /// whilestat -> WHILE cond DO block END
    fn whilestat(&mut self, line: u32) -> Result<(), CompileError> {
        let while_init = self.fs_mut().getlabel();
        self.fs_mut().enterbreak();
        self.next()?;
        let v = self.cond()?;
        self.check(Token::Do)?;
        self.block()?;
        let back = self.fs_mut().jump()?;
        self.fs_mut().patchlist(back, while_init)?;
        let label = self.fs_mut().getlabel();
        self.fs_mut().patchlist(Self::false_list(&v), label)?;
        self.check_match(Token::End, Token::While, line)?;
        self.fs_mut().leavebreak()
    }

    /// repeatstat -> REPEAT block UNTIL cond
    fn repeatstat(&mut self, line: u32) -> Result<(), CompileError> {
        let repeat_init = self.fs_mut().getlabel();
        self.fs_mut().enterbreak();
        self.next()?;
        self.block()?;
        self.check_match(Token::Until, Token::Repeat, line)?;
        let v = self.cond()?;
        self.fs_mut().patchlist(Self::false_list(&v), repeat_init)?;
        self.fs_mut().leavebreak()
    }

    /// forbody -> DO block END, bracketed by the prepare/loop opcode pair.
    fn forbody(
        &mut self,
        nvar: usize,
        prepfor: OpCode,
        loopfor: OpCode,
    ) -> Result<(), CompileError> {
        let prep = self.fs_mut().code_s(prepfor, NO_JUMP)?;
        let blockinit = self.fs_mut().getlabel();
        self.check(Token::Do)?;
        self.adjustlocalvars(nvar); // scope for control variables
        self.block()?;
        let loopc = self.fs_mut().code_s(loopfor, NO_JUMP)?;
        self.fs_mut().patchlist(loopc as i32, blockinit)?;
        let label = self.fs_mut().getlabel();
        self.fs_mut().fixfor(prep, label)?;
        self.removelocalvars(nvar);
        Ok(())
    }

    /// fornum -> NAME = exp1 ',' exp1 [',' exp1] forbody
    fn fornum(&mut self, varname: StringId) -> Result<(), CompileError> {
        self.check(Token::Assign)?;
        self.exp1()?; // initial value
        self.check(Token::Comma)?;
        self.exp1()?; // limit
        if self.optional(Token::Comma)? {
            self.exp1()?; // optional step
        } else {
            self.fs_mut().code_s(OpCode::PushInt, 1)?; // default step
        }
        self.new_localvar(varname, 0)?;
        self.new_localvar_str("(limit)", 1)?;
        self.new_localvar_str("(step)", 2)?;
        self.forbody(3, OpCode::ForPrep, OpCode::ForLoop)
    }

    /// forlist -> NAME ',' NAME 'in' exp1 forbody
    fn forlist(&mut self, indexname: StringId) -> Result<(), CompileError> {
        self.check(Token::Comma)?;
        let valname = self.str_checkname()?;
        // `in` is matched by content so it stays usable as a name elsewhere.
        let is_in = matches!(self.t.token, Token::Name(id)
            if self.lexer.strings.get_bytes(id) == b"in");
        if !is_in {
            return Err(self.error("'in' expected"));
        }
        self.next()?;
        self.exp1()?; // table
        self.new_localvar_str("(table)", 0)?;
        self.new_localvar_str("(index)", 1)?;
        self.new_localvar(indexname, 2)?;
        self.new_localvar(valname, 3)?;
        self.forbody(4, OpCode::LForPrep, OpCode::LForLoop)
    }

    /// forstat -> fornum | forlist
    fn forstat(&mut self, line: u32) -> Result<(), CompileError> {
        self.fs_mut().enterbreak();
        self.next()?;
        let varname = self.str_checkname()?;
        match self.t.token {
            Token::Assign => self.fornum(varname)?,
            Token::Comma => self.forlist(varname)?,
            _ => return Err(self.error("'=' or ',' expected")),
        }
        self.check_match(Token::End, Token::For, line)?;
        self.fs_mut().leavebreak()
    }

    /// test_then_block -> (IF | ELSEIF) cond THEN block
    fn test_then_block(&mut self) -> Result<ExpDesc, CompileError> {
        self.next()?;
        let v = self.cond()?;
        self.check(Token::Then)?;
        self.block()?;
        Ok(v)
    }

    /// ifstat -> IF cond THEN block {ELSEIF cond THEN block} [ELSE block] END
    fn ifstat(&mut self, line: u32) -> Result<(), CompileError> {
        let mut escapelist = NO_JUMP;
        let mut v = self.test_then_block()?;
        while self.t.token == Token::ElseIf {
            let j = self.fs_mut().jump()?;
            self.fs_mut().concat(&mut escapelist, j)?;
            let label = self.fs_mut().getlabel();
            self.fs_mut().patchlist(Self::false_list(&v), label)?;
            v = self.test_then_block()?;
        }
        if self.t.token == Token::Else {
            let j = self.fs_mut().jump()?;
            self.fs_mut().concat(&mut escapelist, j)?;
            let label = self.fs_mut().getlabel();
            self.fs_mut().patchlist(Self::false_list(&v), label)?;
            self.next()?;
            self.block()?;
        } else {
            let f = Self::false_list(&v);
            self.fs_mut().concat(&mut escapelist, f)?;
        }
        let label = self.fs_mut().getlabel();
        self.fs_mut().patchlist(escapelist, label)?;
        self.check_match(Token::End, Token::If, line)
    }

    /// localstat -> LOCAL NAME {',' NAME} ['=' explist1]
    /// Names are registered before the initializers run and only become
    /// active afterwards, so an initializer never sees its own variable.
    fn localstat(&mut self) -> Result<(), CompileError> {
        let mut nvars = 0;
        loop {
            self.next()?; // skip LOCAL or ','
            let name = self.str_checkname()?;
            self.new_localvar(name, nvars)?;
            nvars += 1;
            if self.t.token != Token::Comma {
                break;
            }
        }
        let nexps = if self.optional(Token::Assign)? {
            self.explist1()?
        } else {
            0
        };
        self.adjust_mult_assign(nvars, nexps)?;
        self.adjustlocalvars(nvars);
        Ok(())
    }

    /// Reconcile `nvars` targets with `nexps` produced values.
    fn adjust_mult_assign(&mut self, nvars: usize, nexps: usize) -> Result<(), CompileError> {
        let mut diff = nexps as i32 - nvars as i32;
        if nexps > 0 && self.fs().last_is_open() {
            diff -= 1; // do not count the open call itself
            if diff <= 0 {
                // The call provides the missing values.
                self.fs_mut().setcallreturns((-diff) as u32)?;
                diff = 0;
            } else {
                // More values than targets: the call provides none.
                self.fs_mut().setcallreturns(0)?;
            }
        }
        self.fs_mut().adjuststack(diff)
    }

    /// assignment -> ',' simpleexp assignment | '=' explist1
    /// Collected right-recursively; stores run in reverse target order.
    /// Returns how many consumed stack entries remain to be dropped.
    fn assignment(&mut self, v: &ExpDesc, nvars: usize) -> Result<i32, CompileError> {
        let mut left = 0;
        self.check_limit(nvars, MAXVARSLH, "variables in a multiple assignment")?;
        if self.t.token == Token::Comma {
            self.next()?;
            let nv = self.simpleexp()?;
            if !nv.is_var() {
                return Err(self.error("syntax error"));
            }
            left = self.assignment(&nv, nvars + 1)?;
        } else {
            self.check(Token::Assign)?;
            let nexps = self.explist1()?;
            self.adjust_mult_assign(nvars, nexps)?;
        }
        if let ExpDesc::Indexed = v {
            // The table/key pair sits under the values still on the stack.
            let depth = (left + nvars as i32 + 2) as u32;
            self.fs_mut().code_ab(OpCode::SetTable, depth, 1)?;
            left += 2;
        } else {
            self.fs_mut().storevar(v)?;
        }
        Ok(left)
    }

    /// exprstat -> call | assignment
    fn exprstat(&mut self) -> Result<(), CompileError> {
        let v = self.simpleexp()?;
        if v.is_var() {
            let left = self.assignment(&v, 1)?;
            self.fs_mut().adjuststack(left)?;
        } else {
            // Only a call may stand as an expression statement.
            if !self.fs().last_is_open() {
                return Err(self.error("syntax error"));
            }
            self.fs_mut().setcallreturns(0)?;
        }
        Ok(())
    }

    /// retstat -> RETURN [explist1]
    fn retstat(&mut self) -> Result<(), CompileError> {
        self.next()?;
        if !Self::block_follow(&self.t.token) && self.t.token != Token::Semi {
            self.explist1()?;
        }
        let nactloc = self.fs().nactloc as u32;
        self.fs_mut().code_u(OpCode::Return, nactloc)?;
        Ok(())
    }

    /// breakstat -> BREAK
    fn breakstat(&mut self) -> Result<(), CompileError> {
        let Some(bl) = self.fs().breaks.last().copied() else {
            return Err(self.error("no loop to break"));
        };
        let currentlevel = self.fs().stacklevel;
        self.next()?;
        self.fs_mut().adjuststack(currentlevel - bl.stacklevel)?;
        let j = self.fs_mut().jump()?;
        let fs = self.fs_mut();
        let frame = fs.breaks.len() - 1;
        let mut list = fs.breaks[frame].breaklist;
        fs.concat(&mut list, j)?;
        fs.breaks[frame].breaklist = list;
        // Compilation continues as if the break had not happened; the code
        // below is unreachable but keeps the symbolic stack consistent.
        self.fs_mut()
            .adjuststack(bl.stacklevel - currentlevel)?;
        Ok(())
    }

    /// funcname -> NAME {'.' NAME} [':' NAME]
    fn funcname(&mut self) -> Result<(ExpDesc, bool), CompileError> {
        let name = self.str_checkname()?;
        let mut v = self.singlevar(name)?;
        while self.t.token == Token::Dot {
            self.next()?;
            self.fs_mut().tostack(&mut v, true)?;
            let k = self.checkname()?;
            self.fs_mut().kstr(k as usize)?;
            v = ExpDesc::Indexed;
        }
        let mut needself = false;
        if self.t.token == Token::Colon {
            needself = true;
            self.next()?;
            self.fs_mut().tostack(&mut v, true)?;
            let k = self.checkname()?;
            self.fs_mut().kstr(k as usize)?;
            v = ExpDesc::Indexed;
        }
        Ok((v, needself))
    }

    /// funcstat -> FUNCTION funcname body
    fn funcstat(&mut self, line: u32) -> Result<(), CompileError> {
        self.next()?;
        let (v, needself) = self.funcname()?;
        self.body(needself, line)?;
        self.fs_mut().storevar(&v)
    }

    /// One statement; true when it must be the last of its block.
    fn statement(&mut self) -> Result<bool, CompileError> {
        self.enter_level()?;
        let line = self.t.line;
        let islast = match self.t.token {
            Token::If => {
                self.ifstat(line)?;
                false
            }
            Token::While => {
                self.whilestat(line)?;
                false
            }
            Token::Do => {
                self.next()?;
                self.block()?;
                self.check_match(Token::End, Token::Do, line)?;
                false
            }
            Token::For => {
                self.forstat(line)?;
                false
            }
            Token::Repeat => {
                self.repeatstat(line)?;
                false
            }
            Token::Function => {
                // `function (` opens an anonymous function expression, which
                // can only be part of an expression statement.
                if *self.lookahead()? == Token::LParen {
                    self.exprstat()?;
                } else {
                    self.funcstat(line)?;
                }
                false
            }
            Token::Local => {
                self.localstat()?;
                false
            }
            Token::Return => {
                self.retstat()?;
                true
            }
            Token::Break => {
                self.breakstat()?;
                true
            }
            _ => {
                self.exprstat()?;
                false
            }
        };
        self.leave_level();
        Ok(islast)
    }

    // ---- Function bodies ----

    /// parlist -> [ (NAME | '...') {',' (NAME | '...')} ]
    fn parlist(&mut self) -> Result<(), CompileError> {
        let mut nparams = 0;
        let mut dots = false;
        if self.t.token != Token::RParen {
            loop {
                match self.t.token {
                    Token::Dots => {
                        self.next()?;
                        dots = true;
                    }
                    Token::Name(_) => {
                        let name = self.str_checkname()?;
                        self.new_localvar(name, nparams)?;
                        nparams += 1;
                    }
                    _ => return Err(self.error("<name> or '...' expected")),
                }
                if dots || !self.optional(Token::Comma)? {
                    break;
                }
            }
        }
        self.code_params(nparams, dots)
    }

    /// Activate the parameters; a vararg function gets the extra `arg`
    /// local. The caller has already pushed the parameters, so the symbolic
    /// stack starts at their count.
    fn code_params(&mut self, nparams: usize, dots: bool) -> Result<(), CompileError> {
        self.adjustlocalvars(nparams);
        self.check_limit(self.fs().nactloc, MAXPARAMS, "parameters")?;
        let nactloc = self.fs().nactloc;
        let fs = self.fs_mut();
        fs.proto.num_params = nactloc as u8; // `self` may already be there
        fs.proto.is_vararg = dots;
        if dots {
            self.new_localvar_str("arg", 0)?;
            self.adjustlocalvars(1);
        }
        let nactloc = self.fs().nactloc as i32;
        self.fs_mut().deltastack(nactloc)
    }

    /// body -> '(' parlist ')' chunk END
    fn body(&mut self, needself: bool, line: u32) -> Result<(), CompileError> {
        self.open_func();
        self.fs_mut().proto.line_defined = line;
        self.check(Token::LParen)?;
        if needself {
            self.new_localvar_str("self", 0)?;
            self.adjustlocalvars(1);
        }
        self.parlist()?;
        self.check(Token::RParen)?;
        self.chunk()?;
        self.check_match(Token::End, Token::Function, line)?;
        let closed = self.close_func()?;
        self.pushclosure(closed)
    }

    fn open_func(&mut self) {
        let source = self.fs().proto.source;
        self.func_stack.push(FuncState::new(source, self.lastline));
    }

    /// Seal the innermost function: final return, scope cleanup, line-info
    /// sentinel.
    fn close_func(&mut self) -> Result<FuncState, CompileError> {
        let nactloc = self.fs().nactloc;
        self.fs_mut().code_u(OpCode::Return, nactloc as u32)?;
        self.fs_mut().getlabel(); // close the pending-jump list
        self.removelocalvars(nactloc);
        let mut fs = self.func_stack.pop().unwrap();
        debug_assert!(fs.breaks.is_empty());
        fs.proto.line_info.push(u32::MAX); // end flag
        fs.proto.nupvalues = fs.upvalues.len();
        fs.check_jumps_patched();
        Ok(fs)
    }

    /// In the enclosing function: push the captured values, adopt the
    /// prototype, and emit the closure instruction.
    fn pushclosure(&mut self, func: FuncState) -> Result<(), CompileError> {
        let nup = func.upvalues.len();
        for upval in &func.upvalues {
            let mut v = *upval;
            self.fs_mut().tostack(&mut v, true)?;
        }
        self.check_limit(
            self.fs().proto.kproto.len() + 1,
            MAXARG_A as usize,
            "nested prototypes",
        )?;
        let fs = self.fs_mut();
        fs.proto.kproto.push(func.proto);
        let index = (fs.proto.kproto.len() - 1) as u32;
        fs.code_ab(OpCode::Closure, index, nup as u32)?;
        Ok(())
    }

    /// chunk -> { stat [';'] }
    pub(crate) fn chunk(&mut self) -> Result<(), CompileError> {
        let mut islast = false;
        while !islast && !Self::block_follow(&self.t.token) {
            islast = self.statement()?;
            self.optional(Token::Semi)?;
            debug_assert_eq!(
                self.fs().stacklevel,
                self.fs().nactloc as i32,
                "stack unbalanced at statement boundary"
            );
        }
        Ok(())
    }
}

/// Compile a source chunk into its main prototype. The prototype and the
/// interner that owns every string it references are returned together.
pub fn compile(source: &[u8], name: &str) -> Result<(Proto, StringInterner), CompileError> {
    let mut lexer = Lexer::new(source);
    let source_id = lexer.strings.intern_or_create(name.as_bytes());
    let mut compiler = Compiler {
        lexer,
        t: SpannedToken {
            token: Token::Eos,
            line: 1,
        },
        ahead: None,
        lastline: 1,
        func_stack: vec![FuncState::new(source_id, 1)],
        nest_depth: 0,
    };
    compiler.next()?; // read first token
    compiler.chunk()?;
    if compiler.t.token != Token::Eos {
        return Err(compiler.error("'<eof>' expected"));
    }
    let fs = compiler.close_func()?;
    debug_assert!(compiler.func_stack.is_empty());
    debug_assert_eq!(fs.proto.nupvalues, 0);
    debug_assert_eq!(fs.proto.num_params, 0);
    Ok((fs.proto, compiler.lexer.strings))
}
