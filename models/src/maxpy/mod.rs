//! 矩阵的逐元素赋值，允许操作数以转置形式出现。

use crate::{
    args_mismatch,
    model::Programs,
    template::{
        check_matrices, groups, uint, FetchPolicy, Index, Operands, Template, FALLBACK, PRIMARY,
    },
    utils::{positive, simd_width},
    invalid_input, CodeGen, ConfigError, DeviceInfo, ExpressionBatch, Hardware, KernelArg, Leaf,
    LaunchError, QueueOf,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Maxpy {
    simd: usize,
    local_size: [usize; 2],
    num_groups: [usize; 2],
    fetch: FetchPolicy,
}

impl Maxpy {
    pub const fn new(
        simd: usize,
        local_size: [usize; 2],
        num_groups: [usize; 2],
        fetch: FetchPolicy,
    ) -> Self {
        Self {
            simd,
            local_size,
            num_groups,
            fetch,
        }
    }

    /// `[simd, ls0, ls1, ng0, ng1, fetch]`
    pub fn from_profile(args: &[i64]) -> Result<Self, ConfigError> {
        let &[simd, ls0, ls1, ng0, ng1, fetch] = args else {
            return Err(args_mismatch(format!("maxpy takes 6 arguments, got {args:?}")));
        };
        Ok(Self::new(
            simd_width(simd)?,
            [positive("ls0", ls0)?, positive("ls1", ls1)?],
            [positive("ng0", ng0)?, positive("ng1", ng1)?],
            FetchPolicy::from_index(fetch)?,
        ))
    }

    fn bind<'a, H: Hardware>(
        &self,
        batch: &'a ExpressionBatch<H>,
    ) -> Result<([usize; 2], String, Operands<'a, H>), LaunchError> {
        let shape = shape(&batch.first()?.lhs)?;
        let mut ops = Operands::new(batch.dtype()?);
        let mut body = String::new();
        for e in batch.expressions() {
            if self::shape(&e.lhs)? != shape {
                return Err(invalid_input("matrices of different shapes in one batch"));
            }
            check_matrices(&e.rhs, shape[0], shape[1])?;
            let index = Index::Matrix("r", "c");
            let lhs = ops.access(&e.lhs, index)?;
            let rhs = ops.expr(&e.rhs, index)?;
            body.push_str(&format!("{lhs} = {rhs}; "))
        }
        Ok((shape, body, ops))
    }

    fn groups(&self, [rows, cols]: [usize; 2]) -> [usize; 2] {
        let [ls0, ls1] = self.local_size;
        let [ng0, ng1] = self.num_groups;
        [groups(rows, ls0, ng0), groups(cols, ls1 * self.simd, ng1)]
    }
}

fn shape<H: Hardware>(lhs: &Leaf<H>) -> Result<[usize; 2], LaunchError> {
    match lhs {
        Leaf::Matrix { rows, cols, .. } => Ok([*rows, *cols]),
        _ => Err(invalid_input("maxpy assigns to a matrix")),
    }
}

impl<H: Hardware> Template<H> for Maxpy {
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        Ok(shape(&batch.first()?.lhs)?.to_vec())
    }

    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        _device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError> {
        let (_, body, ops) = self.bind(batch)?;
        let params = ops.params();
        let [ls0, ls1] = self.local_size;
        let src = |fallback| {
            let gen = CodeGen::new(include_str!("maxpy.cl"))
                .define("KERNEL", format!("maxpy_{label}"))
                .define("LS0", ls0)
                .define("LS1", ls1)
                .define("SIMD", self.simd);
            self.fetch
                .lanes(gen)
                .define("PARAMS", &params)
                .define("ASSIGN(r,c)", &body)
                .define_if(fallback, "FALLBACK")
                .to_string()
        };
        Ok(vec![src(false), src(true)])
    }

    fn enqueue(
        &self,
        queue: &QueueOf<H>,
        programs: &Programs<H>,
        label: usize,
        batch: &ExpressionBatch<H>,
    ) -> Result<(), LaunchError> {
        let (shape, _, ops) = self.bind(batch)?;
        let [rows, cols] = shape;
        let [ls0, ls1] = self.local_size;
        let [g0, g1] = self.groups(shape);
        let unit = if self.fetch.aligned(cols, self.simd, g1 * ls1) {
            PRIMARY
        } else {
            FALLBACK
        };
        let mut args = vec![KernelArg::Uint(uint(rows)?), KernelArg::Uint(uint(cols)?)];
        args.extend(ops.args()?);
        H::launch(
            queue,
            programs.unit(unit)?,
            &format!("maxpy_{label}"),
            &args,
            &[g0 * ls0, g1 * ls1],
            &[ls0, ls1],
        )
    }
}

#[cfg(test)]
mod test {
    use super::Maxpy;
    use crate::{
        expression::test::{mat, val, vec},
        recorder::RecordContext,
        BinaryOp, ConfigErrorKind, Expression, ExpressionBatch, FetchPolicy, LaunchErrorKind,
        Model, Node, UnaryOp,
    };

    #[test]
    fn test_profile() {
        let m = Maxpy::from_profile(&[1, 8, 8, 8, 8, 1]).unwrap();
        assert_eq!(m, Maxpy::new(1, [8, 8], [8, 8], FetchPolicy::GlobalStrided));
        let e = Maxpy::from_profile(&[1, 8, 8, 8, 1]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::ArgsMismatch);
        let e = Maxpy::from_profile(&[1, 8, -8, 8, 8, 1]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::InvalidParameter);
    }

    #[test]
    fn test_transposed_operand() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        // c = a + 0.5 * b^T
        let batch = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(
                mat(0x10, 100, 64),
                Node::binary(
                    BinaryOp::Add,
                    mat(0x20, 100, 64),
                    Node::binary(BinaryOp::Mul, val(0.5), Node::trans(mat(0x30, 64, 100))),
                ),
            ),
        );
        let mut model = Model::from_template(Maxpy::new(1, [8, 8], [8, 8], FetchPolicy::GlobalStrided));
        model.execute(&queue, &batch, false, false).unwrap();

        let launches = queue.launches();
        assert_eq!(launches[0].kernel, "maxpy_0");
        assert_eq!(launches[0].global, [64, 64]);
        assert_eq!(launches[0].local, [8, 8]);
        assert!(!launches[0].program.ends_with("_fb"));
        assert!(ctx.builds()[0]
            .source
            .contains("(h2 * m3[m3_off + (c) * m3_ld + (r)])"));
    }

    #[test]
    fn test_shape_mismatch() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::single(
            ctx,
            Expression::new(mat(0x10, 4, 8), Node::unary(UnaryOp::Neg, mat(0x20, 8, 4))),
        );
        let mut model = Model::from_template(Maxpy::new(1, [8, 8], [8, 8], FetchPolicy::GlobalStrided));
        let e = model.execute(&queue, &batch, false, false).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ShapeMismatch);

        let batch = ExpressionBatch::single(
            queue.context().clone(),
            Expression::new(mat(0x10, 4, 8), Node::unary(UnaryOp::Neg, vec(0x20, 8))),
        );
        let e = model.execute(&queue, &batch, false, false).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::InvalidInput);
    }
}
