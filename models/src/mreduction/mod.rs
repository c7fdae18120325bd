//! 矩阵按行或按列与向量归约，即 `y = A x` 和 `y = A^T x`。
//!
//! 两种形态共用一个内核，转置由表达式本身携带，内核只看到逻辑上的行和列。

use crate::{
    args_mismatch,
    model::Programs,
    template::{
        check_matrices, check_vectors, groups, logical_shape, uint, FetchPolicy, Index, Operands,
        Template, FALLBACK, PRIMARY,
    },
    utils::{positive, power_of_two, simd_width},
    invalid_input, shape_mismatch, CodeGen, ConfigError, DeviceInfo, Expression, ExpressionBatch,
    Hardware, KernelArg, Leaf, LaunchError, Node, OperationKind, QueueOf,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MReduction {
    transposed: bool,
    simd: usize,
    local_size: [usize; 2],
    num_groups: usize,
    fetch: FetchPolicy,
}

struct Bound<H: Hardware> {
    shape: [usize; 2],
    element: String,
    assign: String,
    params: String,
    args: Vec<KernelArg<H>>,
}

impl MReduction {
    /// 按行归约，`y = A x`。
    pub const fn rows(simd: usize, local_size: [usize; 2], num_groups: usize, fetch: FetchPolicy) -> Self {
        Self {
            transposed: false,
            simd,
            local_size,
            num_groups,
            fetch,
        }
    }

    /// 按列归约，`y = A^T x`。
    pub const fn cols(simd: usize, local_size: [usize; 2], num_groups: usize, fetch: FetchPolicy) -> Self {
        Self {
            transposed: true,
            ..Self::rows(simd, local_size, num_groups, fetch)
        }
    }

    /// `[simd, ls0, ls1, ng0, fetch]`
    pub fn from_profile(transposed: bool, args: &[i64]) -> Result<Self, ConfigError> {
        let &[simd, ls0, ls1, ng0, fetch] = args else {
            return Err(args_mismatch(format!("gemv takes 5 arguments, got {args:?}")));
        };
        let simd = simd_width(simd)?;
        let local_size = [positive("ls0", ls0)?, power_of_two("ls1", ls1)?];
        let num_groups = positive("ng0", ng0)?;
        let fetch = FetchPolicy::from_index(fetch)?;
        Ok(if transposed {
            Self::cols(simd, local_size, num_groups, fetch)
        } else {
            Self::rows(simd, local_size, num_groups, fetch)
        })
    }

    #[inline]
    fn kind(&self) -> OperationKind {
        if self.transposed {
            OperationKind::ColWiseReduction
        } else {
            OperationKind::RowWiseReduction
        }
    }

    fn bind<H: Hardware>(&self, batch: &ExpressionBatch<H>) -> Result<Vec<Bound<H>>, LaunchError> {
        let mut ops = Operands::new(batch.dtype()?);
        let mut ans = Vec::with_capacity(batch.expressions().len());
        for e in batch.expressions() {
            if e.kind()? != self.kind() {
                return Err(invalid_input(format!("{:?} expected", self.kind())));
            }
            let (y, a, x) = split(e)?;
            let (rows, cols) = logical_shape(a)?;
            check_matrices(a, rows, cols)?;
            check_vectors(x, cols)?;
            match y {
                Leaf::Vector { len, .. } if *len == rows => {}
                _ => return Err(shape_mismatch(format!("result of {rows} elements expected"))),
            }

            ops.restart();
            let assign = ops.access(y, Index::Vector("r"))?;
            let a = ops.expr(a, Index::Matrix("r", "c"))?;
            let x = ops.expr(x, Index::Vector("c"))?;
            ans.push(Bound {
                shape: [rows, cols],
                element: format!("{a} * {x}"),
                assign,
                params: ops.params(),
                args: ops.args()?,
            })
        }
        Ok(ans)
    }
}

fn split<H: Hardware>(e: &Expression<H>) -> Result<(&Leaf<H>, &Node<H>, &Node<H>), LaunchError> {
    match &e.rhs {
        Node::Product(a, x) => Ok((&e.lhs, &**a, &**x)),
        _ => Err(invalid_input("gemv expects `vector = matrix @ vector`")),
    }
}

impl<H: Hardware> Template<H> for MReduction {
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        let (_, a, _) = split(batch.first()?)?;
        match a.first_matrix() {
            Some(Leaf::Matrix { rows, cols, .. }) => Ok(vec![*rows, *cols]),
            _ => Err(invalid_input("gemv without a matrix operand")),
        }
    }

    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        _device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError> {
        let dt = batch.dtype()?;
        let [ls0, ls1] = self.local_size;
        let mut ans = vec![String::new(); 2];
        for (i, b) in self.bind(batch)?.iter().enumerate() {
            for (unit, fallback) in [(PRIMARY, false), (FALLBACK, true)] {
                let gen = CodeGen::new(include_str!("mreduction.cl"))
                    .define("KERNEL", format!("gemv_{label}_{i}"))
                    .define("T", dt.cl_name())
                    .define("LS0", ls0)
                    .define("LS1", ls1)
                    .define("SIMD", self.simd);
                let src = self
                    .fetch
                    .lanes(gen)
                    .define("PARAMS", &b.params)
                    .define("ELEMENT(r,c)", &b.element)
                    .define("ASSIGN(r,x)", format!("{} = (x);", b.assign))
                    .define_if(fallback, "FALLBACK")
                    .to_string();
                ans[unit].push_str(&src)
            }
        }
        Ok(ans)
    }

    fn enqueue(
        &self,
        queue: &QueueOf<H>,
        programs: &Programs<H>,
        label: usize,
        batch: &ExpressionBatch<H>,
    ) -> Result<(), LaunchError> {
        let [ls0, ls1] = self.local_size;
        for (i, b) in self.bind(batch)?.into_iter().enumerate() {
            let [rows, cols] = b.shape;
            let g0 = groups(rows, ls0, self.num_groups);
            let unit = if rows % ls0 == 0 && self.fetch.aligned(cols, self.simd, ls1) {
                PRIMARY
            } else {
                FALLBACK
            };
            let mut args = vec![KernelArg::Uint(uint(rows)?), KernelArg::Uint(uint(cols)?)];
            args.extend(b.args);
            H::launch(
                queue,
                programs.unit(unit)?,
                &format!("gemv_{label}_{i}"),
                &args,
                &[g0 * ls0, ls1],
                &[ls0, ls1],
            )?
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::MReduction;
    use crate::{
        expression::test::{mat, vec},
        recorder::RecordContext,
        ConfigErrorKind, Expression, ExpressionBatch, FetchPolicy, LaunchErrorKind, Model, Node,
        Template,
    };

    #[test]
    fn test_profile() {
        let m = MReduction::from_profile(true, &[1, 8, 8, 16, 1]).unwrap();
        assert_eq!(m, MReduction::cols(1, [8, 8], 16, FetchPolicy::GlobalStrided));
        let e = MReduction::from_profile(false, &[1, 8, 6, 16, 1]).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::InvalidParameter);
    }

    #[test]
    fn test_rows() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let batch = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(vec(0x10, 64), Node::product(mat(0x20, 64, 100), vec(0x30, 100))),
        );
        let gemv = MReduction::rows(1, [8, 8], 16, FetchPolicy::GlobalStrided);
        assert_eq!(gemv.input_sizes(&batch).unwrap(), [64, 100]);

        let mut model = Model::from_template(gemv);
        model.execute(&queue, &batch, false, false).unwrap();
        let launches = queue.launches();
        assert_eq!(launches[0].kernel, "gemv_0_0");
        assert_eq!(launches[0].global, [64, 8]);
        // 100 列不是 8 的整数倍
        assert!(launches[0].program.ends_with("_fb"));
        assert!(ctx.builds()[0].source.contains(
            "#define ELEMENT(r,c) m1[m1_off + (r) * m1_ld + (c)] * v2[v2_off + (c) * v2_inc]"
        ));
    }

    #[test]
    fn test_cols() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        // 存储为 64x128 的矩阵，结果有 128 个元素
        let batch = ExpressionBatch::single(
            ctx.clone(),
            Expression::new(
                vec(0x10, 128),
                Node::product(Node::trans(mat(0x20, 64, 128)), vec(0x30, 64)),
            ),
        );
        let gemv = MReduction::cols(1, [8, 8], 16, FetchPolicy::GlobalStrided);
        assert_eq!(gemv.input_sizes(&batch).unwrap(), [64, 128]);

        let mut model = Model::from_template(gemv);
        model.execute(&queue, &batch, false, false).unwrap();
        let launches = queue.launches();
        assert_eq!(launches[0].global, [128, 8]);
        assert!(!launches[0].program.ends_with("_fb"));
        assert!(ctx.builds()[0].source.contains("m1[m1_off + (c) * m1_ld + (r)]"));

        // 按行的模板不接受转置的矩阵
        let mut rows = Model::from_template(MReduction::rows(1, [8, 8], 16, FetchPolicy::GlobalStrided));
        let e = rows.execute(&queue, &batch, false, false).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::InvalidInput);
    }
}
