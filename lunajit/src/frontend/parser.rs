use super::lexer::{Keyword, Spanned, Token, tokenize};
use crate::{
    Error,
    ir::{
        ArithOp, Builder, CmpOp, ConstIndex, FunctionId, JOIN_DEPTH_MAX,
        JoinCommit, JoinKind, Opcode, Operand, Target, UnaryOp, Unit, ValueId,
    },
    runtime::State,
    value::{Value, format_number},
};

/// Maximum nesting of statements and expressions
const NESTING_MAX: usize = 200;

/// Binding power of unary operators
const UNARY_PRIORITY: u8 = 8;

/// A parsed expression that may not have been evaluated yet
///
/// Names and index expressions stay unevaluated so that they can be used as
/// assignment targets.
#[derive(Clone, Debug)]
enum Expr {
    Operand(Operand),
    Name(String),
    Index(ValueId, Operand),
    Call(ValueId),
}

#[derive(Copy, Clone, Debug)]
enum BinOp {
    Arith(ArithOp),
    Cmp(CmpOp),
    And,
    Or,
}

impl BinOp {
    /// Returns the operator for a token, with its left and right priorities
    fn from_token(t: &Token) -> Option<(Self, u8, u8)> {
        use BinOp::*;
        Some(match t {
            Token::Plus => (Arith(ArithOp::Add), 6, 6),
            Token::Minus => (Arith(ArithOp::Sub), 6, 6),
            Token::Star => (Arith(ArithOp::Mul), 7, 7),
            Token::Slash => (Arith(ArithOp::Div), 7, 7),
            Token::Percent => (Arith(ArithOp::Mod), 7, 7),
            Token::Caret => (Arith(ArithOp::Pow), 10, 9),
            Token::DotDot => (Arith(ArithOp::Concat), 5, 4),
            Token::Eq => (Cmp(CmpOp::Eq), 3, 3),
            Token::Ne => (Cmp(CmpOp::Ne), 3, 3),
            Token::Lt => (Cmp(CmpOp::Lt), 3, 3),
            Token::Le => (Cmp(CmpOp::Le), 3, 3),
            Token::Gt => (Cmp(CmpOp::Gt), 3, 3),
            Token::Ge => (Cmp(CmpOp::Ge), 3, 3),
            Token::Keyword(Keyword::And) => (And, 2, 2),
            Token::Keyword(Keyword::Or) => (Or, 1, 1),
            _ => return None,
        })
    }
}

/// Per-function parser state
#[derive(Debug, Default)]
struct FuncState {
    /// Visible locals, innermost last, with their current SSA values
    locals: Vec<(String, ValueId)>,
    /// Pending `break` jumps for each enclosing loop
    loops: Vec<Vec<usize>>,
}

struct Parser<'a> {
    tokens: Vec<Spanned>,
    pos: usize,
    b: Builder,
    state: &'a mut State,

    fs: FuncState,
    /// States of the enclosing functions
    outer: Vec<FuncState>,

    depth: usize,
}

fn describe(t: &Token) -> String {
    let s = match t {
        Token::Name(n) => return n.clone(),
        Token::Number(v) => return format_number(*v),
        Token::Str(s) => return s.clone(),
        Token::Keyword(k) => <&str>::from(k),
        Token::Plus => "+",
        Token::Minus => "-",
        Token::Star => "*",
        Token::Slash => "/",
        Token::Percent => "%",
        Token::Caret => "^",
        Token::Hash => "#",
        Token::Eq => "==",
        Token::Ne => "~=",
        Token::Lt => "<",
        Token::Le => "<=",
        Token::Gt => ">",
        Token::Ge => ">=",
        Token::Assign => "=",
        Token::LParen => "(",
        Token::RParen => ")",
        Token::LBrace => "{",
        Token::RBrace => "}",
        Token::LBracket => "[",
        Token::RBracket => "]",
        Token::Semi => ";",
        Token::Colon => ":",
        Token::Comma => ",",
        Token::Dot => ".",
        Token::DotDot => "..",
        Token::DotDotDot => "...",
        Token::Eof => "<eof>",
    };
    s.to_owned()
}

impl Parser<'_> {
    ////////////////////////////////////////////////////////////////////////////
    // Token helpers

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn peek_at(&self, n: usize) -> &Token {
        let i = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[i].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, t: &Token) -> bool {
        self.peek() == t
    }

    fn accept(&mut self, t: &Token) -> bool {
        let found = self.check(t);
        if found {
            self.advance();
        }
        found
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, Error> {
        Err(Error::Parse {
            line: self.line(),
            message: message.into(),
        })
    }

    fn expect(&mut self, t: &Token) -> Result<(), Error> {
        if self.accept(t) {
            Ok(())
        } else {
            self.error(format!(
                "'{}' expected near '{}'",
                describe(t),
                describe(self.peek())
            ))
        }
    }

    fn expect_name(&mut self) -> Result<String, Error> {
        match self.peek().clone() {
            Token::Name(n) => {
                self.advance();
                Ok(n)
            }
            t => self.error(format!("name expected near '{}'", describe(&t))),
        }
    }

    fn enter(&mut self) -> Result<(), Error> {
        self.depth += 1;
        if self.depth > NESTING_MAX {
            return self.error("chunk has too many syntax levels");
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn block_end(&self) -> bool {
        matches!(
            self.peek(),
            Token::Eof
                | Token::Keyword(
                    Keyword::End
                        | Keyword::Else
                        | Keyword::Elseif
                        | Keyword::Until
                )
        )
    }

    ////////////////////////////////////////////////////////////////////////////
    // Variables and values

    fn lookup(&self, name: &str) -> Option<ValueId> {
        self.fs
            .locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    fn declare(&mut self, name: String, v: ValueId) {
        self.fs.locals.push((name, v));
    }

    /// Rebinds every local currently holding `from` to `to`
    fn rebind(&mut self, from: ValueId, to: ValueId) {
        for (_, v) in &mut self.fs.locals {
            if *v == from {
                *v = to;
            }
        }
    }

    fn apply(&mut self, c: &JoinCommit) {
        for m in &c.merges {
            self.rebind(m.current, m.merged);
        }
    }

    fn begin_join(&mut self, kind: JoinKind) -> Result<(), Error> {
        if self.b.join_depth() >= JOIN_DEPTH_MAX {
            return self.error("control structure too deeply nested");
        }
        self.b.begin_join(kind);
        Ok(())
    }

    fn constant(&mut self, v: Value) -> Operand {
        self.b.intern(v).into()
    }

    fn string(&mut self, s: &str) -> ConstIndex {
        let v = self.state.intern(s);
        self.b.intern(v)
    }

    /// Materializes an operand as an SSA value
    fn to_value(&mut self, op: Operand) -> ValueId {
        match op {
            Operand::Value(v) => v,
            op => self.b.emit_value(Opcode::Copy, op, Operand::None),
        }
    }

    /// Evaluates an expression, emitting any loads it needs
    fn discharge(&mut self, e: Expr) -> Operand {
        match e {
            Expr::Operand(op) => op,
            Expr::Name(name) => match self.lookup(&name) {
                Some(v) => v.into(),
                None => {
                    let k = self.string(&name);
                    self.b
                        .emit_value(Opcode::GetGlobal, k.into(), Operand::None)
                        .into()
                }
            },
            Expr::Index(t, k) => {
                let v = self.b.emit_value(Opcode::GetField, t.into(), k);
                v.into()
            }
            Expr::Call(v) => v.into(),
        }
    }

    fn assign(&mut self, target: Expr, value: Operand) -> Result<(), Error> {
        match target {
            Expr::Name(name) => match self.lookup(&name) {
                Some(old) => {
                    let new =
                        self.b.emit_value(Opcode::Copy, value, Operand::None);
                    self.b.insert_phi(new, old);
                    if let Some(slot) =
                        self.fs.locals.iter_mut().rev().find(|(n, _)| *n == name)
                    {
                        slot.1 = new;
                    }
                }
                None => {
                    let k = self.string(&name);
                    self.b.emit(
                        Opcode::SetGlobal,
                        k.into(),
                        value,
                        Target::None,
                    );
                }
            },
            Expr::Index(t, k) => {
                self.b.emit(Opcode::SetField, k, value, Target::Value(t));
            }
            Expr::Operand(..) | Expr::Call(..) => {
                return self.error("cannot assign to this expression");
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Statements

    fn block(&mut self) -> Result<(), Error> {
        let mark = self.fs.locals.len();
        self.statements()?;
        self.fs.locals.truncate(mark);
        Ok(())
    }

    fn statements(&mut self) -> Result<(), Error> {
        while !self.block_end() {
            if self.check(&Token::Keyword(Keyword::Return)) {
                self.return_stat()?;
                if !self.block_end() {
                    return self.error(format!(
                        "'end' expected near '{}'",
                        describe(self.peek())
                    ));
                }
                break;
            }
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), Error> {
        self.enter()?;
        match self.peek() {
            Token::Semi => {
                self.advance();
            }
            Token::Keyword(Keyword::If) => self.if_stat()?,
            Token::Keyword(Keyword::While) => self.while_stat()?,
            Token::Keyword(Keyword::Repeat) => self.repeat_stat()?,
            Token::Keyword(Keyword::For) => self.for_stat()?,
            Token::Keyword(Keyword::Function) => self.function_stat()?,
            Token::Keyword(Keyword::Break) => self.break_stat()?,
            Token::Keyword(Keyword::Do) => {
                self.advance();
                self.block()?;
                self.expect(&Token::Keyword(Keyword::End))?;
            }
            Token::Keyword(Keyword::Local) => {
                self.advance();
                if self.accept(&Token::Keyword(Keyword::Function)) {
                    self.local_function()?;
                } else {
                    self.local_stat()?;
                }
            }
            _ => self.expr_stat()?,
        }
        self.leave();
        Ok(())
    }

    fn return_stat(&mut self) -> Result<(), Error> {
        self.advance();
        let value = if self.block_end() || self.check(&Token::Semi) {
            Operand::None
        } else {
            self.expr()?
        };
        self.b.emit(Opcode::Ret, value, Operand::None, Target::None);
        self.accept(&Token::Semi);
        Ok(())
    }

    fn break_stat(&mut self) -> Result<(), Error> {
        self.advance();
        if self.fs.loops.is_empty() {
            return self.error("break outside a loop");
        }
        let j = self.b.emit_jump(Opcode::Jump, Operand::None, Operand::None);
        if let Some(breaks) = self.fs.loops.last_mut() {
            breaks.push(j);
        }
        Ok(())
    }

    /// Patches a loop's exit branches once the loop has been committed
    fn close_loop(&mut self, exits: &[usize], c: &JoinCommit) {
        let breaks = self.fs.loops.pop().unwrap_or_default();
        let here = self.b.position();
        for &j in exits.iter().chain(&breaks) {
            self.b.patch_jump(j + c.shift, here);
        }
        self.b.emit(
            Opcode::LoopEnd,
            Operand::None,
            Operand::None,
            Target::None,
        );
    }

    /// Parses `if` or `elseif` through the closing `end`
    fn if_stat(&mut self) -> Result<(), Error> {
        self.advance();
        let cond = self.expr()?;
        self.expect(&Token::Keyword(Keyword::Then))?;

        self.begin_join(JoinKind::Conditional)?;
        let skip = self.b.emit_jump(Opcode::JumpIfFalse, cond, Operand::None);
        self.block()?;

        if matches!(
            self.peek(),
            Token::Keyword(Keyword::Else | Keyword::Elseif)
        ) {
            let done = self.b.emit_jump(Opcode::Jump, Operand::None, Operand::None);
            for (then, pre) in self.b.switch_arm() {
                self.rebind(then, pre);
            }
            let here = self.b.position();
            self.b.patch_jump(skip, here);

            if self.check(&Token::Keyword(Keyword::Elseif)) {
                // Each further arm is a conditional nested in this one's else
                self.if_stat()?;
            } else {
                self.advance();
                self.block()?;
                self.expect(&Token::Keyword(Keyword::End))?;
            }
            let here = self.b.position();
            self.b.patch_jump(done, here);
        } else {
            self.expect(&Token::Keyword(Keyword::End))?;
            let here = self.b.position();
            self.b.patch_jump(skip, here);
        }

        let c = self.b.commit_join();
        self.apply(&c);
        Ok(())
    }

    fn while_stat(&mut self) -> Result<(), Error> {
        self.advance();
        self.b.emit(
            Opcode::LoopBegin,
            Operand::None,
            Operand::None,
            Target::None,
        );
        self.begin_join(JoinKind::Loop)?;
        let head = self.b.position();
        let cond = self.expr()?;
        self.expect(&Token::Keyword(Keyword::Do))?;
        let exit = self.b.emit_jump(Opcode::JumpIfFalse, cond, Operand::None);

        self.fs.loops.push(vec![]);
        self.block()?;
        self.expect(&Token::Keyword(Keyword::End))?;
        let back = self.b.emit_jump(Opcode::Jump, Operand::None, Operand::None);
        self.b.patch_jump(back, head);

        let c = self.b.commit_join();
        self.apply(&c);
        self.close_loop(&[exit], &c);
        Ok(())
    }

    fn repeat_stat(&mut self) -> Result<(), Error> {
        self.advance();
        self.b.emit(
            Opcode::LoopBegin,
            Operand::None,
            Operand::None,
            Target::None,
        );
        self.begin_join(JoinKind::Repeat)?;
        let head = self.b.position();
        self.fs.loops.push(vec![]);

        // The condition can see the body's locals
        let mark = self.fs.locals.len();
        self.statements()?;
        self.expect(&Token::Keyword(Keyword::Until))?;
        let cond = self.expr()?;
        self.fs.locals.truncate(mark);

        let back = self.b.emit_jump(Opcode::JumpIfFalse, cond, Operand::None);
        self.b.patch_jump(back, head);

        let c = self.b.commit_join();
        self.apply(&c);
        self.close_loop(&[], &c);
        Ok(())
    }

    /// Numeric `for`, which requires a constant step
    fn for_stat(&mut self) -> Result<(), Error> {
        self.advance();
        let name = self.expect_name()?;
        if !self.check(&Token::Assign) {
            return self.error("only numeric 'for' loops are supported");
        }
        self.advance();
        let start = self.expr()?;
        self.expect(&Token::Comma)?;
        let limit = self.expr()?;
        let step = if self.accept(&Token::Comma) {
            let line = self.line();
            let step = self.expr()?;
            let value = match step {
                Operand::Constant(c) => self.b.pool().get(c).as_number(),
                _ => None,
            };
            match value {
                Some(v) if v != 0.0 => v,
                _ => {
                    return Err(Error::Parse {
                        line,
                        message: "'for' step must be a nonzero number"
                            .to_owned(),
                    });
                }
            }
        } else {
            1.0
        };
        self.expect(&Token::Keyword(Keyword::Do))?;

        // Hidden loop state; the limit is evaluated exactly once
        let counter = self.b.emit_value(Opcode::Copy, start, Operand::None);
        let limit = match limit {
            Operand::Constant(..) => limit,
            op => self.b.emit_value(Opcode::Copy, op, Operand::None).into(),
        };
        let cmp = if step < 0.0 { CmpOp::Ge } else { CmpOp::Le };
        let step = self.constant(Value::number(step));

        self.b.emit(
            Opcode::LoopBegin,
            Operand::None,
            Operand::None,
            Target::None,
        );
        self.begin_join(JoinKind::Loop)?;
        let head = self.b.position();
        let test = self
            .b
            .emit_value(Opcode::Compare(cmp), counter.into(), limit);
        let exit = self
            .b
            .emit_jump(Opcode::JumpIfFalse, test.into(), Operand::None);

        self.fs.loops.push(vec![]);
        let mark = self.fs.locals.len();
        let var = self.b.emit_value(Opcode::Copy, counter.into(), Operand::None);
        self.declare(name, var);
        self.block()?;
        self.fs.locals.truncate(mark);
        self.expect(&Token::Keyword(Keyword::End))?;

        let next = self.b.emit_value(
            Opcode::Arith(ArithOp::Add),
            counter.into(),
            step,
        );
        self.b.insert_phi(next, counter);
        let back = self.b.emit_jump(Opcode::Jump, Operand::None, Operand::None);
        self.b.patch_jump(back, head);

        let c = self.b.commit_join();
        self.apply(&c);
        self.close_loop(&[exit], &c);
        Ok(())
    }

    fn function_stat(&mut self) -> Result<(), Error> {
        self.advance();
        let mut target = Expr::Name(self.expect_name()?);
        let mut method = false;
        loop {
            let is_method = self.check(&Token::Colon);
            if !is_method && !self.check(&Token::Dot) {
                break;
            }
            self.advance();
            let key = self.expect_name()?;
            let t = self.discharge(target);
            let t = self.to_value(t);
            target = Expr::Index(t, self.string(&key).into());
            if is_method {
                method = true;
                break;
            }
        }
        let f = self.function_body(method)?;
        self.assign(target, f.into())
    }

    fn local_function(&mut self) -> Result<(), Error> {
        let name = self.expect_name()?;
        let f = self.function_body(false)?;
        let v = self.b.emit_value(Opcode::Copy, f.into(), Operand::None);
        self.declare(name, v);
        Ok(())
    }

    fn local_stat(&mut self) -> Result<(), Error> {
        let name = self.expect_name()?;
        if self.check(&Token::Comma) {
            return self.error("multiple assignment is not supported");
        }
        let value = if self.accept(&Token::Assign) {
            self.expr()?
        } else {
            self.constant(Value::NIL)
        };
        // Always a fresh value, so that no two locals share an id
        let v = self.b.emit_value(Opcode::Copy, value, Operand::None);
        self.declare(name, v);
        Ok(())
    }

    fn expr_stat(&mut self) -> Result<(), Error> {
        let e = self.suffixed()?;
        match self.peek() {
            Token::Assign => {
                self.advance();
                let v = self.expr()?;
                self.assign(e, v)
            }
            Token::Comma => self.error("multiple assignment is not supported"),
            _ => match e {
                Expr::Call(..) => Ok(()),
                _ => self.error(format!(
                    "syntax error near '{}'",
                    describe(self.peek())
                )),
            },
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Functions

    /// Parses a parameter list and body, returning the closure value
    fn function_body(&mut self, method: bool) -> Result<ValueId, Error> {
        self.expect(&Token::LParen)?;
        let mut params = vec![];
        if method {
            params.push("self".to_owned());
        }
        if !self.accept(&Token::RParen) {
            loop {
                if self.check(&Token::DotDotDot) {
                    return self.error("varargs are not supported");
                }
                params.push(self.expect_name()?);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RParen)?;
        }
        let Ok(n) = u8::try_from(params.len()) else {
            return self.error("too many parameters");
        };

        let begin = self.b.emit_jump(
            Opcode::FunctionBegin(n),
            Operand::None,
            Operand::None,
        );
        let outer = std::mem::take(&mut self.fs);
        self.outer.push(outer);
        for (i, p) in params.into_iter().enumerate() {
            let v = self
                .b
                .emit_value(Opcode::Param(i as u8), Operand::None, Operand::None);
            self.declare(p, v);
        }
        self.statements()?;
        self.expect(&Token::Keyword(Keyword::End))?;
        self.fs = self.outer.pop().unwrap_or_default();

        let end =
            self.b
                .emit_jump(Opcode::FunctionEnd, Operand::None, Operand::None);
        self.b.patch_jump(begin, end);
        self.b.patch_jump(end, begin);
        Ok(self.b.emit_value(
            Opcode::Closure(FunctionId(begin)),
            Operand::None,
            Operand::None,
        ))
    }

    fn call(&mut self, f: Operand, args: Vec<Operand>) -> Result<ValueId, Error> {
        let Ok(n) = u8::try_from(args.len()) else {
            return self.error("too many arguments");
        };
        for a in args {
            self.b.emit(Opcode::Arg, a, Operand::None, Target::None);
        }
        Ok(self.b.emit_value(Opcode::Call(n), f, Operand::None))
    }

    /// Parses call arguments: `(...)`, a string literal, or a table
    fn args(&mut self) -> Result<Vec<Operand>, Error> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(vec![self.string(&s).into()])
            }
            Token::LBrace => Ok(vec![self.table()?]),
            Token::LParen => {
                self.advance();
                let mut out = vec![];
                if !self.accept(&Token::RParen) {
                    loop {
                        out.push(self.expr()?);
                        if !self.accept(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RParen)?;
                }
                Ok(out)
            }
            t => self.error(format!(
                "function arguments expected near '{}'",
                describe(&t)
            )),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Expressions

    fn expr(&mut self) -> Result<Operand, Error> {
        self.subexpr(0)
    }

    /// Precedence climbing over binary operators with priority above `limit`
    fn subexpr(&mut self, limit: u8) -> Result<Operand, Error> {
        self.enter()?;
        let unary = match self.peek() {
            Token::Minus => Some(UnaryOp::Neg),
            Token::Keyword(Keyword::Not) => Some(UnaryOp::Not),
            Token::Hash => Some(UnaryOp::Len),
            _ => None,
        };
        let mut lhs = match unary {
            Some(op) => {
                self.advance();
                let a = self.subexpr(UNARY_PRIORITY)?;
                self.unary(op, a)
            }
            None => self.simple()?,
        };

        while let Some((op, left, right)) = BinOp::from_token(self.peek()) {
            if left <= limit {
                break;
            }
            self.advance();
            lhs = match op {
                BinOp::And | BinOp::Or => self.short_circuit(op, lhs, right)?,
                BinOp::Arith(a) => {
                    let rhs = self.subexpr(right)?;
                    self.b.emit_value(Opcode::Arith(a), lhs, rhs).into()
                }
                BinOp::Cmp(c) => {
                    let rhs = self.subexpr(right)?;
                    self.b.emit_value(Opcode::Compare(c), lhs, rhs).into()
                }
            };
        }
        self.leave();
        Ok(lhs)
    }

    fn unary(&mut self, op: UnaryOp, a: Operand) -> Operand {
        // Negative literals are constants
        if let (UnaryOp::Neg, Operand::Constant(c)) = (op, a) {
            if let Some(v) = self.b.pool().get(c).as_number() {
                return self.constant(Value::number(-v));
            }
        }
        self.b.emit_value(Opcode::Unary(op), a, Operand::None).into()
    }

    /// `a and b` / `a or b`, as a conditional merge of two temporaries
    fn short_circuit(
        &mut self,
        op: BinOp,
        lhs: Operand,
        right: u8,
    ) -> Result<Operand, Error> {
        let first = self.b.emit_value(Opcode::Copy, lhs, Operand::None);
        self.begin_join(JoinKind::Conditional)?;
        let branch = match op {
            BinOp::And => Opcode::JumpIfFalse,
            _ => Opcode::JumpIfTrue,
        };
        let skip = self.b.emit_jump(branch, first.into(), Operand::None);
        let rhs = self.subexpr(right)?;
        let second = self.b.emit_value(Opcode::Copy, rhs, Operand::None);
        self.b.insert_phi(second, first);
        let here = self.b.position();
        self.b.patch_jump(skip, here);

        let c = self.b.commit_join();
        Ok(c.merges.first().map_or(first, |m| m.merged).into())
    }

    fn simple(&mut self) -> Result<Operand, Error> {
        let op = match self.peek().clone() {
            Token::Number(v) => self.constant(Value::number(v)),
            Token::Str(s) => self.string(&s).into(),
            Token::Keyword(Keyword::Nil) => self.constant(Value::NIL),
            Token::Keyword(Keyword::True) => self.constant(Value::TRUE),
            Token::Keyword(Keyword::False) => self.constant(Value::FALSE),
            Token::DotDotDot => return self.error("varargs are not supported"),
            Token::Keyword(Keyword::Function) => {
                self.advance();
                return Ok(self.function_body(false)?.into());
            }
            Token::LBrace => return self.table(),
            _ => {
                let e = self.suffixed()?;
                return Ok(self.discharge(e));
            }
        };
        self.advance();
        Ok(op)
    }

    /// Table constructor
    fn table(&mut self) -> Result<Operand, Error> {
        self.expect(&Token::LBrace)?;
        let t = self
            .b
            .emit_value(Opcode::NewTable, Operand::None, Operand::None);
        let mut n = 1.0;
        while !self.accept(&Token::RBrace) {
            let keyed = *self.peek_at(1) == Token::Assign;
            let (k, v) = match self.peek().clone() {
                Token::LBracket => {
                    self.advance();
                    let k = self.expr()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    (k, self.expr()?)
                }
                Token::Name(name) if keyed => {
                    self.advance();
                    self.advance();
                    (self.string(&name).into(), self.expr()?)
                }
                _ => {
                    let v = self.expr()?;
                    let k = self.constant(Value::number(n));
                    n += 1.0;
                    (k, v)
                }
            };
            self.b.emit(Opcode::SetField, k, v, Target::Value(t));
            if !self.accept(&Token::Comma) && !self.accept(&Token::Semi) {
                self.expect(&Token::RBrace)?;
                break;
            }
        }
        Ok(t.into())
    }

    /// Primary expression followed by field accesses and calls
    fn suffixed(&mut self) -> Result<Expr, Error> {
        let mut e = match self.peek().clone() {
            Token::Name(n) => {
                self.advance();
                Expr::Name(n)
            }
            Token::LParen => {
                self.advance();
                let v = self.expr()?;
                self.expect(&Token::RParen)?;
                Expr::Operand(v)
            }
            t => {
                return self
                    .error(format!("unexpected symbol near '{}'", describe(&t)));
            }
        };
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let key = self.expect_name()?;
                    let t = self.discharge(e);
                    let t = self.to_value(t);
                    e = Expr::Index(t, self.string(&key).into());
                }
                Token::LBracket => {
                    self.advance();
                    let t = self.discharge(e);
                    let t = self.to_value(t);
                    let k = self.expr()?;
                    self.expect(&Token::RBracket)?;
                    e = Expr::Index(t, k);
                }
                Token::Colon => {
                    self.advance();
                    let key = self.expect_name()?;
                    let obj = self.discharge(e);
                    let obj = self.to_value(obj);
                    let k = self.string(&key);
                    let f =
                        self.b.emit_value(Opcode::GetField, obj.into(), k.into());
                    let mut args = vec![obj.into()];
                    args.extend(self.args()?);
                    e = Expr::Call(self.call(f.into(), args)?);
                }
                Token::LParen | Token::Str(..) | Token::LBrace => {
                    let f = self.discharge(e);
                    let args = self.args()?;
                    e = Expr::Call(self.call(f, args)?);
                }
                _ => return Ok(e),
            }
        }
    }
}

/// Parses source text into a compile unit
///
/// String literals are interned in `state`, so the resulting unit must be
/// compiled and run against the same state.
pub fn parse(src: &str, state: &mut State) -> Result<Unit, Error> {
    let tokens = tokenize(src)?;
    let mut p = Parser {
        tokens,
        pos: 0,
        b: Builder::new(),
        state,
        fs: FuncState::default(),
        outer: vec![],
        depth: 0,
    };
    p.statements()?;
    if !p.check(&Token::Eof) {
        return p.error(format!("'<eof>' expected near '{}'", describe(p.peek())));
    }
    let unit = p.b.finish();
    log::debug!(
        "parsed {} instructions, {} values, {} constants",
        unit.log.len(),
        unit.value_count,
        unit.pool.len()
    );
    Ok(unit)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::Insn;

    fn parse_ok(src: &str) -> Unit {
        let mut state = State::new();
        parse(src, &mut state).unwrap_or_else(|e| panic!("{src}: {e}"))
    }

    fn count(unit: &Unit, f: impl Fn(&Insn) -> bool) -> usize {
        unit.log.iter().filter(|i| f(i)).count()
    }

    /// Checks that every non-phi read comes after the value's definition
    fn assert_defs_precede_reads(unit: &Unit) {
        let mut def = vec![None; unit.value_count];
        for (i, insn) in unit.log.iter().enumerate() {
            if let Some(d) = insn.def() {
                assert!(def[d.index()].is_none(), "v{} defined twice", d.index());
                def[d.index()] = Some(i);
            }
        }
        for (i, insn) in unit.log.iter().enumerate() {
            for r in insn.reads() {
                let d = def[r.index()]
                    .unwrap_or_else(|| panic!("v{} is never defined", r.index()));
                assert!(d < i, "v{} read at {i} before its def at {d}", r.index());
            }
        }
    }

    #[test]
    fn if_else_single_phi() {
        let unit = parse_ok(
            "local x = 0
             if c then x = 1 else x = 2 end
             return x",
        );
        assert_eq!(count(&unit, |i| i.op == Opcode::Phi), 1);
        let phi = unit.log.iter().position(|i| i.op == Opcode::Phi).unwrap();
        let merged = unit.log[phi].target;
        // The phi's result is what gets returned
        let ret = unit.log.iter().rposition(|i| i.op == Opcode::Ret).unwrap();
        assert!(ret > phi);
        assert_eq!(Target::Value(unit.log[ret].a.value().unwrap()), merged);
    }

    #[test]
    fn definitions_precede_reads() {
        for src in [
            "local a = 1 while a ~= 10 do a = a + 1 end return a",
            "local s = 0 for i = 1, 10 do s = s + i end return s",
            "local s = 0 for i = 10, 1, -2 do if i > 3 then s = s + i else s = s - 1 end end return s",
            "local i = 0 repeat local j = i i = j + 1 until i >= 5 return i",
            "local x = 1 local y = x and 2 or 3 return y",
            "local t = {1, 2, k = 3, [4] = 5} t.x = t[1] return #t",
            "function f(a, b) local c = a while c < b do c = c * 2 end return c end return f(1, 9)",
            "local n = 0 while true do n = n + 1 if n > 5 then break end end return n",
            "local a = 0 while a < 3 do local b = 0 while b < 3 do b = b + 1 a = a + 1 end end return a",
        ] {
            assert_defs_precede_reads(&parse_ok(src));
        }
    }

    #[test]
    fn loop_phi_feeds_condition() {
        let unit = parse_ok("local a = 1 while a ~= 10 do a = a + 1 end return a");
        let phi = unit.log.iter().position(|i| i.op == Opcode::Phi).unwrap();
        assert_eq!(unit.log[phi - 1].op, Opcode::LoopBegin);
        let merged = unit.log[phi].target.value().unwrap();
        let cmp = &unit.log[phi + 1];
        assert_eq!(cmp.op, Opcode::Compare(CmpOp::Ne));
        assert_eq!(cmp.a, merged.into());
        // The exit lands on the loop end marker
        let exit = &unit.log[phi + 2];
        let end = exit.target.label().unwrap();
        assert_eq!(unit.log[end].op, Opcode::LoopEnd);
    }

    #[test]
    fn globals_and_tables() {
        let unit = parse_ok("t = {} t.x = 5 return t.x");
        assert_eq!(count(&unit, |i| i.op == Opcode::NewTable), 1);
        assert_eq!(count(&unit, |i| i.op == Opcode::SetField), 1);
        assert_eq!(count(&unit, |i| i.op == Opcode::GetField), 1);
        assert_eq!(count(&unit, |i| i.op == Opcode::SetGlobal), 1);
        assert_eq!(count(&unit, |i| i.op == Opcode::Phi), 0);
    }

    #[test]
    fn functions_do_not_capture() {
        let unit = parse_ok("local x = 1 function f() return x end");
        let fs = unit.functions();
        assert_eq!(fs.len(), 1);
        let body = &unit.log[fs[0].begin..fs[0].end];
        // Inside the function, `x` is a global
        assert_eq!(
            body.iter().filter(|i| i.op == Opcode::GetGlobal).count(),
            1
        );
        assert_eq!(
            unit.log[fs[0].end + 1].op,
            Opcode::Closure(FunctionId(fs[0].begin))
        );
    }

    #[test]
    fn method_calls() {
        let unit = parse_ok("local o = {} function o:get() return self end return o:get()");
        let fs = unit.functions();
        assert_eq!(fs[0].params, 1);
        assert_eq!(count(&unit, |i| i.op == Opcode::Call(1)), 1);
    }

    #[test]
    fn call_arguments_are_contiguous() {
        let unit = parse_ok("print(1, f(2), 3)");
        let call = unit
            .log
            .iter()
            .rposition(|i| i.op == Opcode::Call(3))
            .unwrap();
        for insn in &unit.log[call - 3..call] {
            assert_eq!(insn.op, Opcode::Arg);
        }
    }

    #[test]
    fn errors() {
        let mut state = State::new();
        let cases = [
            ("x = ", 1),
            ("break", 1),
            ("local a, b = 1, 2", 1),
            ("for i = 1, 2, x do end", 1),
            ("for i = 1, 2, 0 do end", 1),
            ("for k in pairs(t) do end", 1),
            ("x = 1\ny = = 2", 2),
            ("return 1 x = 2", 1),
            ("f() = 1", 1),
            ("function f(...) end", 1),
            ("if x then", 1),
        ];
        for (src, line) in cases {
            match parse(src, &mut state) {
                Err(Error::Parse { line: l, .. }) => assert_eq!(l, line, "{src}"),
                other => panic!("{src}: expected a parse error, got {other:?}"),
            }
        }
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let mut state = State::new();
        let depth = JOIN_DEPTH_MAX + 1;
        let src = "if x then ".repeat(depth) + &"end ".repeat(depth);
        assert!(matches!(parse(&src, &mut state), Err(Error::Parse { .. })));

        let src = "x = ".to_owned() + &"(".repeat(300) + "1" + &")".repeat(300);
        assert!(matches!(parse(&src, &mut state), Err(Error::Parse { .. })));

        // Just under the limit is fine
        let depth = JOIN_DEPTH_MAX - 1;
        let src = "if x then ".repeat(depth) + &"end ".repeat(depth);
        assert!(parse(&src, &mut state).is_ok());
    }
}
