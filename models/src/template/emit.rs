use crate::{
    expression::{BindToHandle, SymbolBinder},
    invalid_input, type_mismatch, BinaryOp, Hardware, KernelArg, Leaf, LaunchError, Node,
    NumericType, ReduceOp, UnaryOp,
};
use std::fmt::Write;

/// 元素访问的下标。
#[derive(Clone, Copy, Debug)]
pub(crate) enum Index<'s> {
    Vector(&'s str),
    Matrix(&'s str, &'s str),
}

/// 把表达式中的操作数绑定成内核参数。
///
/// 符号在整个批内按缓冲区统一，参数表则按内核分别记录。
/// 生成代码和发射内核走同一遍绑定，两边的参数顺序因此一致。
pub(crate) struct Operands<'a, H: Hardware> {
    dt: NumericType,
    binder: BindToHandle,
    params: Vec<(usize, &'a Leaf<H>)>,
}

impl<'a, H: Hardware> Operands<'a, H> {
    pub fn new(dt: NumericType) -> Self {
        Self {
            dt,
            binder: Default::default(),
            params: Vec::new(),
        }
    }

    /// 开始一个新内核的参数表，已分配的符号保留。
    pub fn restart(&mut self) {
        self.params.clear()
    }

    pub fn bind(&mut self, leaf: &'a Leaf<H>) -> usize {
        let (sym, _) = self.binder.bind(leaf.handle());
        if self.params.iter().all(|(s, _)| *s != sym) {
            self.params.push((sym, leaf))
        }
        sym
    }

    /// 操作数在给定下标处的元素。
    pub fn access(&mut self, leaf: &'a Leaf<H>, index: Index) -> Result<String, LaunchError> {
        let sym = self.bind(leaf);
        match (leaf, index) {
            (Leaf::Value(_), _) => Ok(format!("h{sym}")),
            (Leaf::Scalar { .. }, _) => Ok(format!("s{sym}[0]")),
            (Leaf::Vector { .. }, Index::Vector(i)) => {
                Ok(format!("v{sym}[v{sym}_off + ({i}) * v{sym}_inc]"))
            }
            (Leaf::Matrix { .. }, Index::Matrix(r, c)) => {
                Ok(format!("m{sym}[m{sym}_off + ({r}) * m{sym}_ld + ({c})]"))
            }
            (Leaf::Vector { .. }, Index::Matrix(..)) => {
                Err(invalid_input("vector operand in a matrix expression"))
            }
            (Leaf::Matrix { .. }, Index::Vector(_)) => {
                Err(invalid_input("matrix operand in a vector expression"))
            }
        }
    }

    /// 逐元素表达式在给定下标处的值。
    pub fn expr(&mut self, node: &'a Node<H>, index: Index) -> Result<String, LaunchError> {
        match node {
            Node::Leaf(leaf) => self.access(leaf, index),
            Node::Unary(op, x) => {
                let x = self.expr(x, index)?;
                let float = self.dt.is_float();
                match op {
                    UnaryOp::Neg => Ok(format!("(-{x})")),
                    UnaryOp::Abs if float => Ok(format!("fabs({x})")),
                    UnaryOp::Abs => Ok(format!("abs({x})")),
                    UnaryOp::Sqrt | UnaryOp::Exp | UnaryOp::Log if !float => Err(type_mismatch(
                        format!("{} requires a floating point type", op.token()),
                    )),
                    UnaryOp::Sqrt => Ok(format!("sqrt({x})")),
                    UnaryOp::Exp => Ok(format!("exp({x})")),
                    UnaryOp::Log => Ok(format!("log({x})")),
                }
            }
            Node::Binary(op, a, b) => {
                let a = self.expr(a, index)?;
                let b = self.expr(b, index)?;
                Ok(match op {
                    BinaryOp::Add => format!("({a} + {b})"),
                    BinaryOp::Sub => format!("({a} - {b})"),
                    BinaryOp::Mul => format!("({a} * {b})"),
                    BinaryOp::Div => format!("({a} / {b})"),
                    BinaryOp::Max => format!("max({a}, {b})"),
                    BinaryOp::Min => format!("min({a}, {b})"),
                })
            }
            Node::Trans(x) => match index {
                Index::Matrix(r, c) => self.expr(x, Index::Matrix(c, r)),
                Index::Vector(_) => Err(invalid_input("transposition in a vector expression")),
            },
            Node::Reduce(..) | Node::Product(..) => {
                Err(invalid_input("nested reduction or product is not elementwise"))
            }
        }
    }

    /// 当前内核的参数声明，每项前带逗号，接在固定参数之后。
    pub fn params(&self) -> String {
        let ty = self.dt.cl_name();
        let mut ans = String::new();
        for (sym, leaf) in &self.params {
            let _ = match leaf {
                Leaf::Value(v) => write!(ans, ", {} h{sym}", v.dtype().cl_name()),
                Leaf::Scalar { .. } => write!(ans, ", __global {ty} *s{sym}"),
                Leaf::Vector { .. } => {
                    write!(ans, ", __global {ty} *v{sym}, uint v{sym}_off, uint v{sym}_inc")
                }
                Leaf::Matrix { .. } => {
                    write!(ans, ", __global {ty} *m{sym}, uint m{sym}_off, uint m{sym}_ld")
                }
            };
        }
        ans
    }

    /// 当前内核的实参，顺序与 [`Self::params`] 一致。
    pub fn args(&self) -> Result<Vec<KernelArg<H>>, LaunchError> {
        let mut ans = Vec::with_capacity(self.params.len() * 3);
        for (_, leaf) in &self.params {
            match *leaf {
                Leaf::Value(v) => ans.push(KernelArg::Value(*v)),
                Leaf::Scalar { base, .. } => ans.push(KernelArg::Mem(*base)),
                Leaf::Vector {
                    base,
                    offset,
                    stride,
                    ..
                } => ans.extend([
                    KernelArg::Mem(*base),
                    KernelArg::Uint(uint(*offset)?),
                    KernelArg::Uint(uint(*stride)?),
                ]),
                Leaf::Matrix {
                    base, offset, ld, ..
                } => ans.extend([
                    KernelArg::Mem(*base),
                    KernelArg::Uint(uint(*offset)?),
                    KernelArg::Uint(uint(*ld)?),
                ]),
            }
        }
        Ok(ans)
    }
}

#[inline]
pub(crate) fn uint(n: usize) -> Result<u32, LaunchError> {
    u32::try_from(n).map_err(|_| invalid_input(format!("{n} exceeds the 32-bit index range")))
}

/// 归约的单位元，以 OpenCL C 表达。
pub(crate) fn identity(op: ReduceOp, dt: NumericType) -> &'static str {
    use NumericType as T;
    match (op, dt) {
        (ReduceOp::Sum, _) => "0",
        (ReduceOp::Max, T::F32 | T::F64) => "-INFINITY",
        (ReduceOp::Min, T::F32 | T::F64) => "INFINITY",
        (ReduceOp::Max, T::U8 | T::U16 | T::U32 | T::U64) => "0",
        (ReduceOp::Max, T::I8) => "CHAR_MIN",
        (ReduceOp::Max, T::I16) => "SHRT_MIN",
        (ReduceOp::Max, T::I32) => "INT_MIN",
        (ReduceOp::Max, T::I64) => "LONG_MIN",
        (ReduceOp::Min, T::I8) => "CHAR_MAX",
        (ReduceOp::Min, T::U8) => "UCHAR_MAX",
        (ReduceOp::Min, T::I16) => "SHRT_MAX",
        (ReduceOp::Min, T::U16) => "USHRT_MAX",
        (ReduceOp::Min, T::I32) => "INT_MAX",
        (ReduceOp::Min, T::U32) => "UINT_MAX",
        (ReduceOp::Min, T::I64) => "LONG_MAX",
        (ReduceOp::Min, T::U64) => "ULONG_MAX",
    }
}

/// 归约的二元算符，写成函数式宏的定义体。
pub(crate) const fn combine(op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::Sum => "((a) + (b))",
        ReduceOp::Max => "max((a), (b))",
        ReduceOp::Min => "min((a), (b))",
    }
}

#[cfg(test)]
mod test {
    use super::{Index, Operands};
    use crate::{
        expression::test::{mat, sca, val, vec},
        recorder::Recorder,
        BinaryOp, KernelArg, LaunchErrorKind, Leaf, Node,
        NumericType::{F32, I32},
        UnaryOp, Value,
    };

    #[test]
    fn test_expr() {
        let x = vec(0x10, 8);
        let node: Node<Recorder> = Node::binary(
            BinaryOp::Add,
            Node::binary(BinaryOp::Mul, val(3.), vec(0x20, 8)),
            Node::unary(UnaryOp::Abs, vec(0x20, 8)),
        );
        let mut ops = Operands::<Recorder>::new(F32);
        let lhs = ops.access(&x, Index::Vector("i")).unwrap();
        let rhs = ops.expr(&node, Index::Vector("i")).unwrap();
        assert_eq!(lhs, "v0[v0_off + (i) * v0_inc]");
        assert_eq!(
            rhs,
            "((h1 * v2[v2_off + (i) * v2_inc]) + fabs(v2[v2_off + (i) * v2_inc]))"
        );
        assert_eq!(
            ops.params(),
            ", __global float *v0, uint v0_off, uint v0_inc\
             , float h1\
             , __global float *v2, uint v2_off, uint v2_inc"
        );
        let args = ops.args().unwrap();
        assert_eq!(args.len(), 7);
        assert!(matches!(args[3], KernelArg::Value(Value::F32(v)) if v == 3.));
    }

    #[test]
    fn test_trans() {
        let a: Node<Recorder> = Node::trans(mat(0x10, 4, 8));
        let mut ops = Operands::<Recorder>::new(F32);
        assert_eq!(
            ops.expr(&a, Index::Matrix("r", "c")).unwrap(),
            "m0[m0_off + (c) * m0_ld + (r)]"
        );
        let e = ops.expr(&a, Index::Vector("i")).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::InvalidInput);
    }

    #[test]
    fn test_restart_keeps_symbols() {
        let x = vec(0x10, 8);
        let s = sca(0x20);
        let mut ops = Operands::<Recorder>::new(F32);
        ops.access(&x, Index::Vector("i")).unwrap();
        ops.restart();
        assert_eq!(ops.access(&s, Index::Vector("i")).unwrap(), "s1[0]");
        assert_eq!(ops.access(&x, Index::Vector("i")).unwrap(), "v0[v0_off + (i) * v0_inc]");
        assert_eq!(
            ops.params(),
            ", __global float *s1, __global float *v0, uint v0_off, uint v0_inc"
        );
    }

    #[test]
    fn test_float_only() {
        let x = Leaf::<Recorder>::vector(I32, crate::expression::test::ptr(0x10), 8);
        let node: Node<Recorder> = Node::unary(UnaryOp::Sqrt, x);
        let mut ops = Operands::<Recorder>::new(I32);
        let e = ops.expr(&node, Index::Vector("i")).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::TypeMismatch);
    }
}
