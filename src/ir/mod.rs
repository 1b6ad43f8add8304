//! Resolved method bodies, as handed over by the front end
//!
//! By the time code reaches this form, every name has been resolved: variables are slots,
//! calls name either a method of the same unit or an intrinsic, and literals are already
//! evaluated. Nothing here is validated though: structural problems (a `break` outside a loop,
//! a `goto` to an undefined label, ...) are only discovered when the method is emitted.

pub use crate::vm::debug_info::SourceSpan;
use crate::vm::MethodFlags;

/// Everything that ends up in one module
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompilationUnit {
    pub name: String,
    pub methods: Vec<MethodDecl>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDecl {
    /// Must be unique in the unit
    pub name: String,

    /// Number of argument slots
    pub params: u32,

    /// Number of local slots declared by the front end (the emitter may add temporaries)
    pub locals: u32,

    /// Only `PUBLIC` and `SAFE` are taken from here
    pub flags: MethodFlags,

    pub returns_value: bool,
    pub body: Vec<Stmt>,
}

impl MethodDecl {
    /// Public method with no slots that does not return anything
    pub fn new(name: impl Into<String>, body: Vec<Stmt>) -> MethodDecl {
        MethodDecl {
            name: name.into(),
            params: 0,
            locals: 0,
            flags: MethodFlags::PUBLIC,
            returns_value: false,
            body,
        }
    }

    pub fn with_params(mut self, params: u32) -> MethodDecl {
        self.params = params;
        self
    }

    pub fn with_locals(mut self, locals: u32) -> MethodDecl {
        self.locals = locals;
        self
    }

    pub fn returning(mut self) -> MethodDecl {
        self.returns_value = true;
        self
    }
}

/// Variable slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Arg(u32),
    Local(u32),
    Static(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stmt {
    pub kind: StmtKind,

    /// Statements with a span get a sequence point
    pub span: Option<SourceSpan>,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Stmt {
        Stmt { kind, span: None }
    }

    pub fn at(mut self, span: SourceSpan) -> Stmt {
        self.span = Some(span);
        self
    }

    pub fn expr(expr: Expr) -> Stmt {
        Stmt::new(StmtKind::Expr(expr))
    }

    pub fn assign(slot: Slot, value: Expr) -> Stmt {
        Stmt::new(StmtKind::Assign(slot, value))
    }

    pub fn block(body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::Block(body))
    }

    pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::If {
            cond,
            then,
            otherwise,
        })
    }

    pub fn while_loop(cond: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::While { cond, body })
    }

    pub fn try_finally(body: Vec<Stmt>, finally: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::Try {
            body,
            catch: None,
            finally: Some(finally),
        })
    }

    pub fn try_catch(body: Vec<Stmt>, slot: Option<u32>, handler: Vec<Stmt>) -> Stmt {
        Stmt::new(StmtKind::Try {
            body,
            catch: Some(CatchClause {
                slot,
                body: handler,
            }),
            finally: None,
        })
    }

    pub fn ret(value: Option<Expr>) -> Stmt {
        Stmt::new(StmtKind::Return(value))
    }

    pub fn label(name: impl Into<String>) -> Stmt {
        Stmt::new(StmtKind::Label(name.into()))
    }

    pub fn goto(name: impl Into<String>) -> Stmt {
        Stmt::new(StmtKind::Goto(name.into()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StmtKind {
    /// Evaluate and discard
    Expr(Expr),

    Assign(Slot, Expr),

    Block(Vec<Stmt>),

    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },

    While {
        cond: Expr,
        body: Vec<Stmt>,
    },

    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },

    /// A missing condition loops forever
    For {
        init: Vec<Stmt>,
        cond: Option<Expr>,
        step: Vec<Stmt>,
        body: Vec<Stmt>,
    },

    /// Sections are tested in order and never fall into one another
    Switch {
        scrutinee: Expr,
        sections: Vec<SwitchSection>,
    },

    Try {
        body: Vec<Stmt>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },

    Return(Option<Expr>),

    /// Leave the innermost loop or switch
    Break,

    /// Go to the next iteration of the innermost loop
    Continue,

    Throw(Expr),

    /// Throw the exception currently being handled again
    Rethrow,

    Label(String),
    Goto(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchSection {
    /// Values matched by this section
    pub values: Vec<Literal>,

    /// Is this (also) the `default` section?
    pub default: bool,

    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchClause {
    /// Local slot the exception is stored in (it is discarded if there is none)
    pub slot: Option<u32>,

    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Literal {
    /// Little-endian two's complement (any length, redundant sign bytes are fine)
    Integer(Vec<u8>),

    Bool(bool),
    Bytes(Vec<u8>),
    Null,
}

impl Literal {
    pub fn int(value: i64) -> Literal {
        Literal::Integer(value.to_le_bytes().to_vec())
    }

    pub fn string(value: &str) -> Literal {
        Literal::Bytes(value.as_bytes().to_vec())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,

    /// Boolean negation
    Not,

    /// Bitwise complement
    Invert,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,

    /// Structural equality (any type)
    Equal,
    NotEqual,

    /// Numeric comparisons
    NumEqual,
    NumNotEqual,
    Lt,
    Le,
    Gt,
    Ge,

    /// Byte string concatenation
    Concat,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    /// Method of the same unit, by name
    Method(String),

    /// Entry of the intrinsic table, by name
    Intrinsic(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Literal(Literal),
    Load(Slot),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),

    /// Short-circuiting `&&`
    And(Box<Expr>, Box<Expr>),

    /// Short-circuiting `||`
    Or(Box<Expr>, Box<Expr>),

    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },

    Call {
        callee: Callee,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::Literal(Literal::int(value))
    }

    pub fn bool(value: bool) -> Expr {
        Expr::Literal(Literal::Bool(value))
    }

    pub fn string(value: &str) -> Expr {
        Expr::Literal(Literal::string(value))
    }

    pub fn arg(index: u32) -> Expr {
        Expr::Load(Slot::Arg(index))
    }

    pub fn local(index: u32) -> Expr {
        Expr::Load(Slot::Local(index))
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary(op, Box::new(operand))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn call(method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Callee::Method(method.into()),
            args,
        }
    }

    pub fn intrinsic(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Callee::Intrinsic(name.into()),
            args,
        }
    }
}
