// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::number::Number;

use core::{cmp, fmt, ops::Deref};
use std::rc::Rc;

/// Shared, pointer-identity AST node handle.
///
/// Equality and ordering are by node identity, not structure, so nodes can
/// key schedules and per-query caches cheaply.
pub struct NodeRef<T> {
    r: Rc<T>,
}

impl<T> Clone for NodeRef<T> {
    fn clone(&self) -> Self {
        Self { r: self.r.clone() }
    }
}

impl<T: fmt::Debug> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.r.as_ref().fmt(f)
    }
}

impl<T> cmp::PartialEq for NodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::as_ptr(&self.r).eq(&Rc::as_ptr(&other.r))
    }
}

impl<T> cmp::Eq for NodeRef<T> {}

impl<T> cmp::Ord for NodeRef<T> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Rc::as_ptr(&self.r).cmp(&Rc::as_ptr(&other.r))
    }
}

impl<T> cmp::PartialOrd for NodeRef<T> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Deref for NodeRef<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.r
    }
}

impl<T> AsRef<T> for NodeRef<T> {
    fn as_ref(&self) -> &T {
        self.deref()
    }
}

impl<T> NodeRef<T> {
    pub fn new(t: T) -> Self {
        Self { r: Rc::new(t) }
    }
}

pub type Ref<T> = NodeRef<T>;

/// Source position reported in compile errors. The concrete lexer lives in
/// the front-end; modules assembled programmatically carry `Span::unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub module: Rc<str>,
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(module: &str, line: u32, col: u32) -> Span {
        Span {
            module: module.into(),
            line,
            col,
        }
    }

    pub fn unknown() -> Span {
        Span {
            module: "".into(),
            line: 0,
            col: 0,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::unknown()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BoolOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AssignOp {
    Eq,
    ColEq,
}

#[derive(Debug)]
pub enum Expr {
    Null {
        span: Span,
    },

    Bool {
        span: Span,
        value: bool,
    },

    Number {
        span: Span,
        value: Number,
    },

    String {
        span: Span,
        value: Rc<str>,
    },

    Var {
        span: Span,
        name: Rc<str>,
    },

    // array
    Array {
        span: Span,
        items: Vec<ExprRef>,
    },

    // set
    Set {
        span: Span,
        items: Vec<ExprRef>,
    },

    Object {
        span: Span,
        fields: Vec<(ExprRef, ExprRef)>,
    },

    // Comprehensions
    ArrayCompr {
        span: Span,
        term: ExprRef,
        query: Ref<Query>,
    },

    SetCompr {
        span: Span,
        term: ExprRef,
        query: Ref<Query>,
    },

    ObjectCompr {
        span: Span,
        key: ExprRef,
        value: ExprRef,
        query: Ref<Query>,
    },

    Call {
        span: Span,
        fcn: ExprRef,
        params: Vec<ExprRef>,
    },

    // ref
    RefDot {
        span: Span,
        refr: ExprRef,
        field: Rc<str>,
    },

    RefBrack {
        span: Span,
        refr: ExprRef,
        index: ExprRef,
    },

    // Infix expressions
    ArithExpr {
        span: Span,
        op: ArithOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },

    BoolExpr {
        span: Span,
        op: BoolOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },

    AssignExpr {
        span: Span,
        op: AssignOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },

    Membership {
        span: Span,
        key: Option<ExprRef>,
        value: ExprRef,
        collection: ExprRef,
    },
}

impl Expr {
    pub const fn span(&self) -> &Span {
        match *self {
            Self::Null { ref span, .. }
            | Self::Bool { ref span, .. }
            | Self::Number { ref span, .. }
            | Self::String { ref span, .. }
            | Self::Var { ref span, .. }
            | Self::Array { ref span, .. }
            | Self::Set { ref span, .. }
            | Self::Object { ref span, .. }
            | Self::ArrayCompr { ref span, .. }
            | Self::SetCompr { ref span, .. }
            | Self::ObjectCompr { ref span, .. }
            | Self::Call { ref span, .. }
            | Self::RefDot { ref span, .. }
            | Self::RefBrack { ref span, .. }
            | Self::ArithExpr { ref span, .. }
            | Self::BoolExpr { ref span, .. }
            | Self::AssignExpr { ref span, .. }
            | Self::Membership { ref span, .. } => span,
        }
    }

    pub fn is_ground_scalar(&self) -> bool {
        matches!(
            self,
            Self::Null { .. } | Self::Bool { .. } | Self::Number { .. } | Self::String { .. }
        )
    }
}

#[derive(Debug)]
pub enum Literal {
    SomeVars {
        span: Span,
        vars: Vec<Rc<str>>,
    },
    SomeIn {
        span: Span,
        key: Option<ExprRef>,
        value: ExprRef,
        collection: ExprRef,
    },
    Expr {
        span: Span,
        expr: ExprRef,
    },
    NotExpr {
        span: Span,
        expr: ExprRef,
    },
    Every {
        span: Span,
        key: Option<Rc<str>>,
        value: Rc<str>,
        domain: ExprRef,
        query: Ref<Query>,
    },
}

#[derive(Debug)]
pub struct LiteralStmt {
    pub span: Span,
    pub literal: Literal,
}

#[derive(Debug)]
pub struct Query {
    pub span: Span,
    pub stmts: Vec<LiteralStmt>,
}

#[derive(Debug)]
pub struct RuleAssign {
    pub span: Span,
    pub op: AssignOp,
    pub value: ExprRef,
}

#[derive(Debug)]
pub struct RuleBody {
    pub span: Span,
    pub assign: Option<RuleAssign>,
    pub query: Ref<Query>,
}

#[derive(Debug)]
pub enum RuleHead {
    Complete {
        span: Span,
        refr: ExprRef,
        assign: Option<RuleAssign>,
    },
    Set {
        span: Span,
        refr: ExprRef,
        key: Option<ExprRef>,
    },
    Func {
        span: Span,
        refr: ExprRef,
        args: Vec<ExprRef>,
        assign: Option<RuleAssign>,
    },
}

impl RuleHead {
    pub const fn refr(&self) -> &ExprRef {
        match self {
            Self::Complete { refr, .. } | Self::Set { refr, .. } | Self::Func { refr, .. } => refr,
        }
    }
}

#[derive(Debug)]
pub enum Rule {
    Spec {
        span: Span,
        head: RuleHead,
        bodies: Vec<RuleBody>,
    },
    Default {
        span: Span,
        refr: ExprRef,
        value: ExprRef,
    },
}

impl Rule {
    pub const fn span(&self) -> &Span {
        match *self {
            Self::Spec { ref span, .. } | Self::Default { ref span, .. } => span,
        }
    }
}

#[derive(Debug)]
pub struct Package {
    pub span: Span,
    pub path: Vec<Rc<str>>,
}

#[derive(Debug)]
pub struct Import {
    pub span: Span,
    pub path: Vec<Rc<str>>,
    pub alias: Option<Rc<str>>,
}

#[derive(Debug)]
pub struct Module {
    pub package: Package,
    pub imports: Vec<Import>,
    pub policy: Vec<Ref<Rule>>,
}

pub type ExprRef = Ref<Expr>;

// Constructors used by front-ends and tests to assemble modules without a
// concrete parser. The AST shape above is the hand-off contract.
impl Expr {
    pub fn null() -> ExprRef {
        Ref::new(Expr::Null { span: Span::unknown() })
    }

    pub fn boolean(value: bool) -> ExprRef {
        Ref::new(Expr::Bool {
            span: Span::unknown(),
            value,
        })
    }

    pub fn number(value: impl Into<Number>) -> ExprRef {
        Ref::new(Expr::Number {
            span: Span::unknown(),
            value: value.into(),
        })
    }

    pub fn string(value: &str) -> ExprRef {
        Ref::new(Expr::String {
            span: Span::unknown(),
            value: value.into(),
        })
    }

    pub fn var(name: &str) -> ExprRef {
        Ref::new(Expr::Var {
            span: Span::unknown(),
            name: name.into(),
        })
    }

    pub fn array(items: Vec<ExprRef>) -> ExprRef {
        Ref::new(Expr::Array {
            span: Span::unknown(),
            items,
        })
    }

    pub fn set(items: Vec<ExprRef>) -> ExprRef {
        Ref::new(Expr::Set {
            span: Span::unknown(),
            items,
        })
    }

    pub fn object(fields: Vec<(ExprRef, ExprRef)>) -> ExprRef {
        Ref::new(Expr::Object {
            span: Span::unknown(),
            fields,
        })
    }

    pub fn ref_dot(refr: ExprRef, field: &str) -> ExprRef {
        Ref::new(Expr::RefDot {
            span: Span::unknown(),
            refr,
            field: field.into(),
        })
    }

    pub fn ref_brack(refr: ExprRef, index: ExprRef) -> ExprRef {
        Ref::new(Expr::RefBrack {
            span: Span::unknown(),
            refr,
            index,
        })
    }

    /// Build a dotted reference like `input.user.role` from its textual form.
    pub fn ref_path(dotted: &str) -> ExprRef {
        let mut parts = dotted.split('.');
        let mut expr = Self::var(parts.next().unwrap_or_default());
        for field in parts {
            expr = Self::ref_dot(expr, field);
        }
        expr
    }

    pub fn call(fcn: &str, params: Vec<ExprRef>) -> ExprRef {
        Ref::new(Expr::Call {
            span: Span::unknown(),
            fcn: Self::ref_path(fcn),
            params,
        })
    }

    pub fn array_compr(term: ExprRef, query: Ref<Query>) -> ExprRef {
        Ref::new(Expr::ArrayCompr {
            span: Span::unknown(),
            term,
            query,
        })
    }

    pub fn set_compr(term: ExprRef, query: Ref<Query>) -> ExprRef {
        Ref::new(Expr::SetCompr {
            span: Span::unknown(),
            term,
            query,
        })
    }

    pub fn object_compr(key: ExprRef, value: ExprRef, query: Ref<Query>) -> ExprRef {
        Ref::new(Expr::ObjectCompr {
            span: Span::unknown(),
            key,
            value,
            query,
        })
    }

    pub fn arith(op: ArithOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Ref::new(Expr::ArithExpr {
            span: Span::unknown(),
            op,
            lhs,
            rhs,
        })
    }

    pub fn compare(op: BoolOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Ref::new(Expr::BoolExpr {
            span: Span::unknown(),
            op,
            lhs,
            rhs,
        })
    }

    pub fn eq(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::compare(BoolOp::Eq, lhs, rhs)
    }

    pub fn unify(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Ref::new(Expr::AssignExpr {
            span: Span::unknown(),
            op: AssignOp::Eq,
            lhs,
            rhs,
        })
    }

    pub fn assign(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Ref::new(Expr::AssignExpr {
            span: Span::unknown(),
            op: AssignOp::ColEq,
            lhs,
            rhs,
        })
    }

    pub fn membership(key: Option<ExprRef>, value: ExprRef, collection: ExprRef) -> ExprRef {
        Ref::new(Expr::Membership {
            span: Span::unknown(),
            key,
            value,
            collection,
        })
    }
}

impl Query {
    pub fn from_stmts(stmts: Vec<LiteralStmt>) -> Ref<Query> {
        Ref::new(Query {
            span: Span::unknown(),
            stmts,
        })
    }

    /// A query whose statements are plain expression literals.
    pub fn from_exprs(exprs: Vec<ExprRef>) -> Ref<Query> {
        Self::from_stmts(exprs.into_iter().map(LiteralStmt::expr).collect())
    }
}

impl LiteralStmt {
    pub fn expr(expr: ExprRef) -> LiteralStmt {
        LiteralStmt {
            span: Span::unknown(),
            literal: Literal::Expr {
                span: Span::unknown(),
                expr,
            },
        }
    }

    pub fn not_expr(expr: ExprRef) -> LiteralStmt {
        LiteralStmt {
            span: Span::unknown(),
            literal: Literal::NotExpr {
                span: Span::unknown(),
                expr,
            },
        }
    }

    pub fn some_vars(vars: &[&str]) -> LiteralStmt {
        LiteralStmt {
            span: Span::unknown(),
            literal: Literal::SomeVars {
                span: Span::unknown(),
                vars: vars.iter().map(|v| Rc::from(*v)).collect(),
            },
        }
    }

    pub fn some_in(key: Option<ExprRef>, value: ExprRef, collection: ExprRef) -> LiteralStmt {
        LiteralStmt {
            span: Span::unknown(),
            literal: Literal::SomeIn {
                span: Span::unknown(),
                key,
                value,
                collection,
            },
        }
    }

    pub fn every(
        key: Option<&str>,
        value: &str,
        domain: ExprRef,
        query: Ref<Query>,
    ) -> LiteralStmt {
        LiteralStmt {
            span: Span::unknown(),
            literal: Literal::Every {
                span: Span::unknown(),
                key: key.map(Rc::from),
                value: value.into(),
                domain,
                query,
            },
        }
    }
}

impl Rule {
    /// A complete rule `name := <value> if <body>`. A `None` value is
    /// normalized to `true` by the compiler's rewrite pass.
    pub fn complete(name: &str, value: Option<ExprRef>, body: Ref<Query>) -> Ref<Rule> {
        Ref::new(Rule::Spec {
            span: Span::unknown(),
            head: RuleHead::Complete {
                span: Span::unknown(),
                refr: Expr::var(name),
                assign: value.map(|value| RuleAssign {
                    span: Span::unknown(),
                    op: AssignOp::ColEq,
                    value,
                }),
            },
            bodies: vec![RuleBody {
                span: Span::unknown(),
                assign: None,
                query: body,
            }],
        })
    }

    /// A partial set rule `name contains <key> if <body>`.
    pub fn partial_set(name: &str, key: ExprRef, body: Ref<Query>) -> Ref<Rule> {
        Ref::new(Rule::Spec {
            span: Span::unknown(),
            head: RuleHead::Set {
                span: Span::unknown(),
                refr: Expr::var(name),
                key: Some(key),
            },
            bodies: vec![RuleBody {
                span: Span::unknown(),
                assign: None,
                query: body,
            }],
        })
    }

    /// A partial object rule `name[<key>] := <value> if <body>`.
    pub fn partial_object(name: &str, key: ExprRef, value: ExprRef, body: Ref<Query>) -> Ref<Rule> {
        Ref::new(Rule::Spec {
            span: Span::unknown(),
            head: RuleHead::Complete {
                span: Span::unknown(),
                refr: Expr::ref_brack(Expr::var(name), key),
                assign: Some(RuleAssign {
                    span: Span::unknown(),
                    op: AssignOp::ColEq,
                    value,
                }),
            },
            bodies: vec![RuleBody {
                span: Span::unknown(),
                assign: None,
                query: body,
            }],
        })
    }

    /// A function rule `name(args) := <value> if <body>`.
    pub fn function(
        name: &str,
        args: Vec<ExprRef>,
        value: Option<ExprRef>,
        body: Ref<Query>,
    ) -> Ref<Rule> {
        Ref::new(Rule::Spec {
            span: Span::unknown(),
            head: RuleHead::Func {
                span: Span::unknown(),
                refr: Expr::var(name),
                args,
                assign: value.map(|value| RuleAssign {
                    span: Span::unknown(),
                    op: AssignOp::ColEq,
                    value,
                }),
            },
            bodies: vec![RuleBody {
                span: Span::unknown(),
                assign: None,
                query: body,
            }],
        })
    }

    /// A default rule `default name := <value>`.
    pub fn default(name: &str, value: ExprRef) -> Ref<Rule> {
        Ref::new(Rule::Default {
            span: Span::unknown(),
            refr: Expr::var(name),
            value,
        })
    }
}

impl Module {
    pub fn new(package: &str, policy: Vec<Ref<Rule>>) -> Ref<Module> {
        Ref::new(Module {
            package: Package {
                span: Span::unknown(),
                path: package.split('.').map(Rc::from).collect(),
            },
            imports: vec![],
            policy,
        })
    }

    pub fn with_imports(
        package: &str,
        imports: Vec<Import>,
        policy: Vec<Ref<Rule>>,
    ) -> Ref<Module> {
        Ref::new(Module {
            package: Package {
                span: Span::unknown(),
                path: package.split('.').map(Rc::from).collect(),
            },
            imports,
            policy,
        })
    }
}

impl Import {
    pub fn new(dotted: &str, alias: Option<&str>) -> Import {
        Import {
            span: Span::unknown(),
            path: dotted.split('.').map(Rc::from).collect(),
            alias: alias.map(Rc::from),
        }
    }
}
