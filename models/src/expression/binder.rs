use super::{ExpressionBatch, Handle, Leaf, Node, Order};
use crate::{too_many_operands, Hardware, LaunchError};
use std::{collections::HashMap, fmt::Write};

/// 一个结构签名中允许出现的不同操作数的上限。
pub const MAX_OPERANDS: usize = 256;

/// 为操作数分配符号。
pub trait SymbolBinder {
    /// 返回操作数的符号，以及这个符号是否是新分配的。
    fn bind(&mut self, handle: Option<Handle>) -> (usize, bool);
    /// 已分配的符号数。
    fn len(&self) -> usize;
}

/// 同一操作数视图的所有出现共享一个符号。
#[derive(Default, Debug)]
pub struct BindToHandle {
    table: HashMap<Handle, usize>,
    next: usize,
}

impl SymbolBinder for BindToHandle {
    fn bind(&mut self, handle: Option<Handle>) -> (usize, bool) {
        let next = self.next;
        let sym = match handle {
            Some(handle) => *self.table.entry(handle).or_insert(next),
            None => next,
        };
        if sym == next {
            self.next += 1;
            (sym, true)
        } else {
            (sym, false)
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.next
    }
}

/// 每次出现都分配新符号。
#[derive(Default, Debug)]
pub struct BindAllUnique {
    next: usize,
}

impl SymbolBinder for BindAllUnique {
    fn bind(&mut self, _handle: Option<Handle>) -> (usize, bool) {
        self.next += 1;
        (self.next - 1, true)
    }

    #[inline]
    fn len(&self) -> usize {
        self.next
    }
}

/// 计算表达式批的结构签名。
///
/// 首字符表示表达式之间是否独立，之后按先序逐个表达式写出算符和操作数记号。
/// 签名相同的两个批一定可以共用同一组编译好的程序。
pub fn signature<H: Hardware>(
    batch: &ExpressionBatch<H>,
    binder: &mut impl SymbolBinder,
) -> Result<String, LaunchError> {
    let mut ans = String::from(match batch.order() {
        Order::Independent => "i",
        Order::Sequential => "s",
    });
    for e in batch.expressions() {
        ans.push('=');
        write_leaf(&mut ans, &e.lhs, binder)?;
        write_node(&mut ans, &e.rhs, binder)?;
        ans.push(';');
    }
    Ok(ans)
}

fn write_node<H: Hardware>(
    buf: &mut String,
    node: &Node<H>,
    binder: &mut impl SymbolBinder,
) -> Result<(), LaunchError> {
    match node {
        Node::Leaf(leaf) => write_leaf(buf, leaf, binder),
        Node::Unary(op, x) => {
            buf.push_str(op.token());
            write_node(buf, x, binder)
        }
        Node::Binary(op, a, b) => {
            buf.push_str(op.token());
            write_node(buf, a, binder)?;
            write_node(buf, b, binder)
        }
        Node::Trans(x) => {
            buf.push('T');
            write_node(buf, x, binder)
        }
        Node::Reduce(op, x) => {
            buf.push_str(op.token());
            write_node(buf, x, binder)
        }
        Node::Product(a, b) => {
            buf.push('@');
            write_node(buf, a, binder)?;
            write_node(buf, b, binder)
        }
    }
}

fn write_leaf<H: Hardware>(
    buf: &mut String,
    leaf: &Leaf<H>,
    binder: &mut impl SymbolBinder,
) -> Result<(), LaunchError> {
    let (sym, _) = binder.bind(leaf.handle());
    if binder.len() > MAX_OPERANDS {
        return Err(too_many_operands(format!(
            "more than {MAX_OPERANDS} distinct operands"
        )));
    }
    let _ = write!(buf, "({}{}.{sym})", leaf.token(), leaf.dtype());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{signature, BindAllUnique, BindToHandle, Handle, SymbolBinder, MAX_OPERANDS};
    use crate::{
        expression::test::{axpy, ptr, vec},
        recorder::{RecordContext, Recorder},
        BinaryOp, Expression, ExpressionBatch, LaunchErrorKind, Leaf, Node, NumericType, Order,
    };

    fn sig(batch: &ExpressionBatch<Recorder>) -> String {
        signature(batch, &mut BindToHandle::default()).unwrap()
    }

    fn at(base: usize) -> Option<Handle> {
        vec(base, 8).handle()
    }

    #[test]
    fn test_bind_to_handle() {
        let mut binder = BindToHandle::default();
        assert_eq!(binder.bind(at(0x10)), (0, true));
        assert_eq!(binder.bind(at(0x20)), (1, true));
        assert_eq!(binder.bind(at(0x10)), (0, false));
        assert_eq!(binder.bind(None), (2, true));
        assert_eq!(binder.bind(None), (3, true));
        assert_eq!(binder.len(), 4);
    }

    #[test]
    fn test_bind_all_unique() {
        let mut binder = BindAllUnique::default();
        assert_eq!(binder.bind(at(0x10)), (0, true));
        assert_eq!(binder.bind(at(0x10)), (1, true));
        assert_eq!(binder.len(), 2);
    }

    #[test]
    fn test_views_of_one_buffer() {
        let ctx = RecordContext::new();
        let half = |offset| Leaf::<Recorder>::Vector {
            dt: NumericType::F32,
            base: ptr(0x20),
            len: 64,
            offset,
            stride: 1,
        };
        let halves = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Add, half(0), half(64))),
        );
        let doubled = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Add, half(0), half(0))),
        );
        assert_eq!(sig(&halves), "i=(vf32.0)+(vf32.1)(vf32.2);");
        assert_eq!(sig(&doubled), "i=(vf32.0)+(vf32.1)(vf32.1);");

        // 与两个不同缓冲区的结构相同
        let distinct = ExpressionBatch::single(
            ctx,
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Add, vec(0x20, 64), vec(0x30, 64))),
        );
        assert_eq!(sig(&halves), sig(&distinct));
    }

    #[test]
    fn test_signature_stability() {
        let ctx = RecordContext::new();
        let a = ExpressionBatch::single(ctx.clone(), axpy(0x100, 0x200, 0x300, 64));
        let b = ExpressionBatch::single(ctx.clone(), axpy(0x100, 0x200, 0x300, 64));
        assert_eq!(sig(&a), sig(&b));
        assert_eq!(sig(&a), "i=(vf32.0)+*(hf32.1)(vf32.2)(vf32.3);");

        // 换成另一组缓冲区，别名关系不变
        let c = ExpressionBatch::single(ctx.clone(), axpy(0x1000, 0x2000, 0x3000, 4096));
        assert_eq!(sig(&a), sig(&c));

        // x 与 y 是同一个缓冲区
        let d = ExpressionBatch::single(ctx.clone(), axpy(0x100, 0x200, 0x200, 64));
        assert_ne!(sig(&a), sig(&d));

        // 树结构不同
        let e = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x100, 64), Node::binary(BinaryOp::Sub, vec(0x200, 64), vec(0x300, 64))),
        );
        assert_ne!(sig(&a), sig(&e));

        let f = ExpressionBatch::new(ctx, Order::Sequential, vec![axpy(0x100, 0x200, 0x300, 64)]);
        assert_ne!(sig(&a), sig(&f));
        assert!(sig(&f).starts_with('s'));
    }

    #[test]
    fn test_signature_across_expressions() {
        let ctx = RecordContext::new();
        let shared = ExpressionBatch::new(
            ctx.clone(),
            Order::Independent,
            vec![axpy(1, 2, 3, 8), axpy(4, 2, 3, 8)],
        );
        let distinct = ExpressionBatch::new(
            ctx,
            Order::Independent,
            vec![axpy(1, 2, 3, 8), axpy(4, 5, 6, 8)],
        );
        assert_ne!(sig(&shared), sig(&distinct));
        assert!(sig(&shared).ends_with("=(vf32.4)+*(hf32.5)(vf32.2)(vf32.3);"));
    }

    #[test]
    fn test_too_many_operands() {
        let ctx = RecordContext::new();
        let mut node = Node::from(vec(1, 8));
        for i in 0..MAX_OPERANDS {
            node = Node::binary(BinaryOp::Add, node, vec(2 + i, 8));
        }
        let batch = ExpressionBatch::single(ctx, Expression::new(vec(0, 8), node));
        let e = signature(&batch, &mut BindToHandle::default()).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::TooManyOperands);
    }
}
