//! 向量和标量的逐元素赋值，批中所有表达式融合到一个内核。

use crate::{
    args_mismatch,
    model::Programs,
    template::{
        check_vectors, groups, uint, FetchPolicy, Index, Operands, Template, FALLBACK, PRIMARY,
    },
    utils::{positive, simd_width},
    invalid_input, CodeGen, ConfigError, DeviceInfo, ExpressionBatch, Hardware, KernelArg, Leaf,
    LaunchError, QueueOf,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Vaxpy {
    simd: usize,
    local_size: usize,
    num_groups: usize,
    fetch: FetchPolicy,
}

impl Vaxpy {
    pub const fn new(simd: usize, local_size: usize, num_groups: usize, fetch: FetchPolicy) -> Self {
        Self {
            simd,
            local_size,
            num_groups,
            fetch,
        }
    }

    /// `[simd, local_size, num_groups, fetch]`
    pub fn from_profile(args: &[i64]) -> Result<Self, ConfigError> {
        let &[simd, ls, ng, fetch] = args else {
            return Err(args_mismatch(format!("vaxpy takes 4 arguments, got {args:?}")));
        };
        Ok(Self::new(
            simd_width(simd)?,
            positive("local size", ls)?,
            positive("number of groups", ng)?,
            FetchPolicy::from_index(fetch)?,
        ))
    }

    fn bind<'a, H: Hardware>(
        &self,
        batch: &'a ExpressionBatch<H>,
    ) -> Result<(usize, String, Operands<'a, H>), LaunchError> {
        let n = length(&batch.first()?.lhs)?;
        let mut ops = Operands::new(batch.dtype()?);
        let mut body = String::new();
        for e in batch.expressions() {
            if length(&e.lhs)? != n {
                return Err(invalid_input("vectors of different lengths in one batch"));
            }
            check_vectors(&e.rhs, n)?;
            let lhs = ops.access(&e.lhs, Index::Vector("i"))?;
            let rhs = ops.expr(&e.rhs, Index::Vector("i"))?;
            body.push_str(&format!("{lhs} = {rhs}; "))
        }
        Ok((n, body, ops))
    }
}

fn length<H: Hardware>(lhs: &Leaf<H>) -> Result<usize, LaunchError> {
    match lhs {
        Leaf::Vector { len, .. } => Ok(*len),
        Leaf::Scalar { .. } => Ok(1),
        _ => Err(invalid_input("vaxpy assigns to a vector or a device scalar")),
    }
}

impl<H: Hardware> Template<H> for Vaxpy {
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        Ok(vec![length(&batch.first()?.lhs)?])
    }

    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        _device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError> {
        let (_, body, ops) = self.bind(batch)?;
        let params = ops.params();
        let src = |fallback| {
            let gen = CodeGen::new(include_str!("vaxpy.cl"))
                .define("KERNEL", format!("vaxpy_{label}"))
                .define("LS", self.local_size)
                .define("SIMD", self.simd);
            self.fetch
                .lanes(gen)
                .define("PARAMS", &params)
                .define("ASSIGN(i)", &body)
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
        let (n, _, ops) = self.bind(batch)?;
        let ng = groups(n, self.local_size * self.simd, self.num_groups);
        let unit = if self.fetch.aligned(n, self.simd, ng * self.local_size) {
            PRIMARY
        } else {
            FALLBACK
        };
        let mut args = vec![KernelArg::Uint(uint(n)?)];
        args.extend(ops.args()?);
        H::launch(
            queue,
            programs.unit(unit)?,
            &format!("vaxpy_{label}"),
            &args,
            &[ng * self.local_size],
            &[self.local_size],
        )
    }
}

#[cfg(test)]
mod test {
    use super::Vaxpy;
    use crate::{
        expression::test::{axpy, ptr, sca, val, vec},
        recorder::{RecordContext, Recorder},
        BinaryOp, ConfigErrorKind, Expression, ExpressionBatch, FetchPolicy, LaunchErrorKind, Leaf,
        Model, Node, NumericType, Order,
    };

    #[test]
    fn test_profile() {
        let v = Vaxpy::from_profile(&[4, 64, 128, 2]).unwrap();
        assert_eq!(v, Vaxpy::new(4, 64, 128, FetchPolicy::GlobalContiguous));

        let e = Vaxpy::from_profile(&[4, 64, 128]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::ArgsMismatch);
        let e = Vaxpy::from_profile(&[3, 64, 128, 2]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::InvalidParameter);
        let e = Vaxpy::from_profile(&[4, 0, 128, 2]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::InvalidParameter);
        let e = Vaxpy::from_profile(&[4, 64, 128, 5]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::InvalidFetch);
    }

    #[test]
    fn test_fused_batch() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::new(
            ctx.clone(),
            Order::Sequential,
            vec![axpy(0x10, 0x20, 0x30, 1000), axpy(0x40, 0x10, 0x30, 1000)],
        );
        let mut model = Model::from_template(Vaxpy::new(1, 64, 4, FetchPolicy::GlobalStrided));
        assert_eq!(model.execute(&queue, &batch, false, false).unwrap(), 0);

        let launches = queue.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].kernel, "vaxpy_0");
        assert_eq!(launches[0].global, [256]);
        assert_eq!(launches[0].local, [64]);
        // n 之后是 4 个向量和 2 个主机标量
        assert_eq!(launches[0].args, 1 + 4 * 3 + 2);
        // 1000 不是 256 的整数倍
        assert!(launches[0].program.ends_with("_fb"));

        let source = &ctx.builds()[0].source;
        assert!(source.contains("#define ASSIGN(i) v0[v0_off + (i) * v0_inc] = "));
        assert!(source.contains("v4[v4_off + (i) * v4_inc] = ((h5 * v0[v0_off + (i) * v0_inc])"));
    }

    #[test]
    fn test_aligned_unit() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::single(ctx.clone(), axpy(0x10, 0x20, 0x30, 1024));
        let mut model = Model::from_template(Vaxpy::new(4, 64, 128, FetchPolicy::GlobalContiguous));
        model.execute(&queue, &batch, false, false).unwrap();

        let launches = queue.launches();
        assert!(!launches[0].program.ends_with("_fb"));
        // 1024 个元素每组 256 个，只需要 4 组
        assert_eq!(launches[0].global, [256]);
    }

    #[test]
    fn test_scalar_axpy() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(sca(0x10), Node::binary(BinaryOp::Max, sca(0x20), val(0.))),
        );
        let mut model = Model::from_template(Vaxpy::new(1, 64, 128, FetchPolicy::GlobalStrided));
        model.execute(&queue, &batch, false, false).unwrap();
        assert_eq!(queue.launches()[0].global, [64]);
        assert!(ctx.builds()[0].source.contains("s0[0] = max(s1[0], h2);"));
    }

    #[test]
    fn test_length_mismatch() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::single(
            ctx,
            Expression::new(vec(0x10, 8), Node::binary(BinaryOp::Add, vec(0x20, 8), vec(0x30, 9))),
        );
        let mut model = Model::from_template(Vaxpy::new(1, 64, 128, FetchPolicy::GlobalStrided));
        let e = model.execute(&queue, &batch, false, false).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_views_of_one_buffer() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let half = |offset| Leaf::<Recorder>::Vector {
            dt: NumericType::F32,
            base: ptr(0x20),
            len: 64,
            offset,
            stride: 1,
        };
        // z = x[0..64] + x[64..128]
        let halves = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Add, half(0), half(64))),
        );
        let mut model = Model::from_template(Vaxpy::new(1, 64, 128, FetchPolicy::GlobalStrided));
        model.execute(&queue, &halves, false, false).unwrap();
        assert_eq!(queue.launches()[0].args, 1 + 3 * 3);
        assert!(ctx.builds()[0].source.contains(
            "#define ASSIGN(i) v0[v0_off + (i) * v0_inc] = \
             (v1[v1_off + (i) * v1_inc] + v2[v2_off + (i) * v2_inc]);"
        ));

        // z = x[0..64] + x[0..64] 是另一组程序
        let doubled = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Add, half(0), half(0))),
        );
        model.execute(&queue, &doubled, false, false).unwrap();
        assert_eq!(model.cache().len(), 2);
        assert_eq!(queue.launches()[1].args, 1 + 2 * 3);

        // 同一基址上的标量和向量各自声明参数
        let mixed = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::binary(BinaryOp::Mul, sca(0x20), half(0))),
        );
        model.execute(&queue, &mixed, false, false).unwrap();
        assert_eq!(queue.launches()[2].args, 1 + 3 + 1 + 3);
        let source = &ctx.builds()[2].source;
        assert!(source.contains(", __global float *s1, __global float *v2, uint v2_off, uint v2_inc"));
    }
}
