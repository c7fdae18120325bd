mod binder;

pub use binder::{signature, BindAllUnique, BindToHandle, SymbolBinder, MAX_OPERANDS};

use crate::{
    invalid_input, type_mismatch, unknown_operation, ConfigError, ConstPtr, ContextOf, Hardware,
    LaunchError, NumericType, Value,
};

/// 计算的数学形态，与元素类型无关。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum OperationKind {
    ScalarAxpy,
    VectorAxpy,
    Reduction,
    MatrixAxpy,
    RowWiseReduction,
    ColWiseReduction,
    MatrixProductNN,
    MatrixProductNT,
    MatrixProductTN,
    MatrixProductTT,
}

impl OperationKind {
    pub const ALL: [Self; 10] = [
        Self::ScalarAxpy,
        Self::VectorAxpy,
        Self::Reduction,
        Self::MatrixAxpy,
        Self::RowWiseReduction,
        Self::ColWiseReduction,
        Self::MatrixProductNN,
        Self::MatrixProductNT,
        Self::MatrixProductTN,
        Self::MatrixProductTT,
    ];

    /// 模型文件中的算子名。
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "vaxpy" => Ok(Self::VectorAxpy),
            "dot" => Ok(Self::Reduction),
            "maxpy" => Ok(Self::MatrixAxpy),
            "gemvN" => Ok(Self::RowWiseReduction),
            "gemvT" => Ok(Self::ColWiseReduction),
            "gemmNN" => Ok(Self::MatrixProductNN),
            "gemmNT" => Ok(Self::MatrixProductNT),
            "gemmTN" => Ok(Self::MatrixProductTN),
            "gemmTT" => Ok(Self::MatrixProductTT),
            _ => Err(unknown_operation(format!("\"{name}\" is not a known operation"))),
        }
    }

    /// 标量 AXPY 不会被持久化。
    pub const fn name(self) -> Option<&'static str> {
        match self {
            Self::ScalarAxpy => None,
            Self::VectorAxpy => Some("vaxpy"),
            Self::Reduction => Some("dot"),
            Self::MatrixAxpy => Some("maxpy"),
            Self::RowWiseReduction => Some("gemvN"),
            Self::ColWiseReduction => Some("gemvT"),
            Self::MatrixProductNN => Some("gemmNN"),
            Self::MatrixProductNT => Some("gemmNT"),
            Self::MatrixProductTN => Some("gemmTN"),
            Self::MatrixProductTT => Some("gemmTT"),
        }
    }
}

/// 设备操作数的视图。
///
/// 基址、形态、偏移和步长都相同的两个叶子是同一个操作数，共享符号和内核参数。
/// 同一缓冲区上的不同视图是不同的操作数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Handle {
    pub base: usize,
    pub token: char,
    pub offset: usize,
    pub step: usize,
}

/// 表达式树的叶子，即操作数。
///
/// 设备上的操作数以基址作为缓冲区标识。矩阵按行优先存储，`ld` 以元素计。
pub enum Leaf<H: Hardware> {
    Value(Value),
    Scalar {
        dt: NumericType,
        base: ConstPtr<H>,
    },
    Vector {
        dt: NumericType,
        base: ConstPtr<H>,
        len: usize,
        offset: usize,
        stride: usize,
    },
    Matrix {
        dt: NumericType,
        base: ConstPtr<H>,
        rows: usize,
        cols: usize,
        offset: usize,
        ld: usize,
    },
}

impl<H: Hardware> Leaf<H> {
    #[inline]
    pub fn value(v: Value) -> Self {
        Self::Value(v)
    }

    #[inline]
    pub fn scalar(dt: NumericType, base: ConstPtr<H>) -> Self {
        Self::Scalar { dt, base }
    }

    #[inline]
    pub fn vector(dt: NumericType, base: ConstPtr<H>, len: usize) -> Self {
        Self::Vector {
            dt,
            base,
            len,
            offset: 0,
            stride: 1,
        }
    }

    #[inline]
    pub fn matrix(dt: NumericType, base: ConstPtr<H>, rows: usize, cols: usize) -> Self {
        Self::Matrix {
            dt,
            base,
            rows,
            cols,
            offset: 0,
            ld: cols,
        }
    }

    pub fn dtype(&self) -> NumericType {
        match self {
            Self::Value(v) => v.dtype(),
            Self::Scalar { dt, .. } | Self::Vector { dt, .. } | Self::Matrix { dt, .. } => *dt,
        }
    }

    /// 操作数视图的标识，主机标量没有标识。
    pub fn handle(&self) -> Option<Handle> {
        let (base, offset, step) = match self {
            Self::Value(_) => return None,
            Self::Scalar { base, .. } => (*base as usize, 0, 0),
            Self::Vector {
                base,
                offset,
                stride,
                ..
            } => (*base as usize, *offset, *stride),
            Self::Matrix {
                base, offset, ld, ..
            } => (*base as usize, *offset, *ld),
        };
        Some(Handle {
            base,
            token: self.token(),
            offset,
            step,
        })
    }

    pub(crate) const fn token(&self) -> char {
        match self {
            Self::Value(_) => 'h',
            Self::Scalar { .. } => 's',
            Self::Vector { .. } => 'v',
            Self::Matrix { .. } => 'm',
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl UnaryOp {
    pub(crate) const fn token(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Exp => "exp",
            Self::Log => "log",
        }
    }
}

impl BinaryOp {
    pub(crate) const fn token(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Max => "max",
            Self::Min => "min",
        }
    }
}

impl ReduceOp {
    pub(crate) const fn token(self) -> &'static str {
        match self {
            Self::Sum => "R+",
            Self::Max => "Rmax",
            Self::Min => "Rmin",
        }
    }
}

/// 表达式树节点。
pub enum Node<H: Hardware> {
    Leaf(Leaf<H>),
    Unary(UnaryOp, Box<Self>),
    Binary(BinaryOp, Box<Self>, Box<Self>),
    Trans(Box<Self>),
    Reduce(ReduceOp, Box<Self>),
    Product(Box<Self>, Box<Self>),
}

impl<H: Hardware> From<Leaf<H>> for Node<H> {
    #[inline]
    fn from(leaf: Leaf<H>) -> Self {
        Self::Leaf(leaf)
    }
}

impl<H: Hardware> Node<H> {
    #[inline]
    pub fn unary(op: UnaryOp, x: impl Into<Self>) -> Self {
        Self::Unary(op, Box::new(x.into()))
    }

    #[inline]
    pub fn binary(op: BinaryOp, a: impl Into<Self>, b: impl Into<Self>) -> Self {
        Self::Binary(op, Box::new(a.into()), Box::new(b.into()))
    }

    #[inline]
    pub fn trans(x: impl Into<Self>) -> Self {
        Self::Trans(Box::new(x.into()))
    }

    #[inline]
    pub fn reduce(op: ReduceOp, x: impl Into<Self>) -> Self {
        Self::Reduce(op, Box::new(x.into()))
    }

    #[inline]
    pub fn product(a: impl Into<Self>, b: impl Into<Self>) -> Self {
        Self::Product(Box::new(a.into()), Box::new(b.into()))
    }

    /// 先序遍历所有节点。
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        match self {
            Self::Leaf(_) => {}
            Self::Unary(_, x) | Self::Trans(x) | Self::Reduce(_, x) => x.visit(f),
            Self::Binary(_, a, b) | Self::Product(a, b) => {
                a.visit(f);
                b.visit(f)
            }
        }
    }

    /// 先序排列的叶子。
    pub fn leaves(&self) -> Vec<&Leaf<H>> {
        let mut ans = Vec::new();
        self.visit(&mut |node| {
            if let Self::Leaf(leaf) = node {
                ans.push(leaf)
            }
        });
        ans
    }

    pub(crate) fn first_vector(&self) -> Option<&Leaf<H>> {
        self.leaves()
            .into_iter()
            .find(|leaf| matches!(leaf, Leaf::Vector { .. }))
    }

    pub(crate) fn first_matrix(&self) -> Option<&Leaf<H>> {
        self.leaves()
            .into_iter()
            .find(|leaf| matches!(leaf, Leaf::Matrix { .. }))
    }

    #[inline]
    fn is_trans(&self) -> bool {
        matches!(self, Self::Trans(_))
    }
}

/// 赋值表达式 `lhs = rhs`。
pub struct Expression<H: Hardware> {
    pub lhs: Leaf<H>,
    pub rhs: Node<H>,
}

impl<H: Hardware> Expression<H> {
    #[inline]
    pub fn new(lhs: Leaf<H>, rhs: impl Into<Node<H>>) -> Self {
        Self {
            lhs,
            rhs: rhs.into(),
        }
    }

    /// 按左值形态和右值结构判断算子类型。
    pub fn kind(&self) -> Result<OperationKind, LaunchError> {
        use OperationKind as K;
        match (&self.lhs, &self.rhs) {
            (Leaf::Scalar { .. }, Node::Reduce(..)) => Ok(K::Reduction),
            (_, Node::Reduce(..)) => Err(invalid_input("reduction must assign to a device scalar")),
            (Leaf::Vector { .. }, Node::Product(a, _)) => Ok(if a.is_trans() {
                K::ColWiseReduction
            } else {
                K::RowWiseReduction
            }),
            (Leaf::Matrix { .. }, Node::Product(a, b)) => Ok(match (a.is_trans(), b.is_trans()) {
                (false, false) => K::MatrixProductNN,
                (false, true) => K::MatrixProductNT,
                (true, false) => K::MatrixProductTN,
                (true, true) => K::MatrixProductTT,
            }),
            (_, Node::Product(..)) => Err(invalid_input("product must assign to a vector or matrix")),
            (Leaf::Matrix { .. }, _) => Ok(K::MatrixAxpy),
            (Leaf::Vector { .. }, _) => Ok(K::VectorAxpy),
            (Leaf::Scalar { .. }, _) => Ok(K::ScalarAxpy),
            (Leaf::Value(_), _) => Err(invalid_input("cannot assign to a host value")),
        }
    }

    /// 先序排列的叶子，左值在最前。
    pub fn leaves(&self) -> Vec<&Leaf<H>> {
        let mut ans = vec![&self.lhs];
        ans.extend(self.rhs.leaves());
        ans
    }
}

/// 表达式之间相互独立，或者后面的表达式依赖前面的结果。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Order {
    Independent,
    Sequential,
}

/// 一次提交的一组表达式。
pub struct ExpressionBatch<H: Hardware> {
    context: ContextOf<H>,
    order: Order,
    expressions: Vec<Expression<H>>,
}

impl<H: Hardware> ExpressionBatch<H> {
    #[inline]
    pub fn new(context: ContextOf<H>, order: Order, expressions: Vec<Expression<H>>) -> Self {
        Self {
            context,
            order,
            expressions,
        }
    }

    #[inline]
    pub fn single(context: ContextOf<H>, expression: Expression<H>) -> Self {
        Self::new(context, Order::Independent, vec![expression])
    }

    #[inline]
    pub fn context(&self) -> &ContextOf<H> {
        &self.context
    }

    #[inline]
    pub fn order(&self) -> Order {
        self.order
    }

    #[inline]
    pub fn expressions(&self) -> &[Expression<H>] {
        &self.expressions
    }

    pub fn first(&self) -> Result<&Expression<H>, LaunchError> {
        self.expressions
            .first()
            .ok_or_else(|| invalid_input("empty expression batch"))
    }

    /// 批中所有表达式必须属于同一种算子。
    pub fn kind(&self) -> Result<OperationKind, LaunchError> {
        let kind = self.first()?.kind()?;
        for e in &self.expressions[1..] {
            let other = e.kind()?;
            if other != kind {
                return Err(invalid_input(format!(
                    "{kind:?} and {other:?} in the same batch"
                )));
            }
        }
        Ok(kind)
    }

    /// 批中所有操作数必须具有同一种元素类型。
    pub fn dtype(&self) -> Result<NumericType, LaunchError> {
        let dt = self.first()?.lhs.dtype();
        for leaf in self.expressions.iter().flat_map(Expression::leaves) {
            if leaf.dtype() != dt {
                return Err(type_mismatch(format!("{} and {dt} in the same batch", leaf.dtype())));
            }
        }
        Ok(dt)
    }
}
