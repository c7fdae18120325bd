//! 向量归约到设备标量。
//!
//! 第一阶段每个线程组归约出一个部分结果，写进队列上分配的临时存储；
//! 第二阶段用一个线程组归约全部部分结果并赋值。
//! 第二阶段与规模无关，放在单独的程序单元里。

use crate::{
    args_mismatch,
    model::Programs,
    template::{
        check_vectors, combine, groups, identity, uint, FetchPolicy, Index, Operands, Template,
        FALLBACK, PRIMARY,
    },
    utils::{positive, power_of_two, simd_width},
    invalid_input, CodeGen, ConfigError, DeviceInfo, Expression, ExpressionBatch, Hardware,
    KernelArg, Leaf, LaunchError, Node, NumericType, QueueOf, ReduceOp,
};

const FINALIZE: usize = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reduction {
    simd: usize,
    local_size: usize,
    num_groups: usize,
    fetch: FetchPolicy,
}

struct Bound<H: Hardware> {
    n: usize,
    op: ReduceOp,
    element: String,
    assign: String,
    partial: (String, Vec<KernelArg<H>>),
    finalize: (String, Vec<KernelArg<H>>),
}

impl Reduction {
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
            return Err(args_mismatch(format!("dot takes 4 arguments, got {args:?}")));
        };
        Ok(Self::new(
            simd_width(simd)?,
            power_of_two("local size", ls)?,
            positive("number of groups", ng)?,
            FetchPolicy::from_index(fetch)?,
        ))
    }

    fn bind<H: Hardware>(
        &self,
        batch: &ExpressionBatch<H>,
    ) -> Result<(NumericType, Vec<Bound<H>>), LaunchError> {
        let dt = batch.dtype()?;
        let mut ops = Operands::new(dt);
        let mut ans = Vec::with_capacity(batch.expressions().len());
        for e in batch.expressions() {
            let (op, x) = split(e)?;
            let n = length(x)?;
            check_vectors(x, n)?;

            ops.restart();
            let element = ops.expr(x, Index::Vector("i"))?;
            let partial = (ops.params(), ops.args()?);

            ops.restart();
            let assign = ops.access(&e.lhs, Index::Vector("0"))?;
            let finalize = (ops.params(), ops.args()?);

            ans.push(Bound {
                n,
                op: *op,
                element,
                assign,
                partial,
                finalize,
            })
        }
        Ok((dt, ans))
    }
}

fn split<H: Hardware>(e: &Expression<H>) -> Result<(&ReduceOp, &Node<H>), LaunchError> {
    match (&e.lhs, &e.rhs) {
        (Leaf::Scalar { .. }, Node::Reduce(op, x)) => Ok((op, &**x)),
        _ => Err(invalid_input("dot expects `scalar = reduce(vector expression)`")),
    }
}

fn length<H: Hardware>(x: &Node<H>) -> Result<usize, LaunchError> {
    match x.first_vector() {
        Some(Leaf::Vector { len, .. }) => Ok(*len),
        _ => Err(invalid_input("reduction without a vector operand")),
    }
}

impl<H: Hardware> Template<H> for Reduction {
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        let (_, x) = split(batch.first()?)?;
        Ok(vec![length(x)?])
    }

    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        _device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError> {
        let (dt, bound) = self.bind(batch)?;
        let mut ans = vec![String::new(); 3];
        for (i, b) in bound.iter().enumerate() {
            let common = |code| {
                CodeGen::new(code)
                    .define("T", dt.cl_name())
                    .define("LS", self.local_size)
                    .define("IDENTITY", identity(b.op, dt))
                    .define("COMBINE(a,b)", combine(b.op))
            };
            for (unit, fallback) in [(PRIMARY, false), (FALLBACK, true)] {
                let gen = common(include_str!("reduction.cl"))
                    .define("PARTIAL", format!("dot_{label}_{i}_0"))
                    .define("SIMD", self.simd);
                let src = self
                    .fetch
                    .lanes(gen)
                    .define("PARAMS", &b.partial.0)
                    .define("ELEMENT(i)", &b.element)
                    .define_if(fallback, "FALLBACK")
                    .to_string();
                ans[unit].push_str(&src)
            }
            let src = common(include_str!("finalize.cl"))
                .define("FINALIZE", format!("dot_{label}_{i}_1"))
                .define("PARAMS", &b.finalize.0)
                .define("ASSIGN(x)", format!("{} = (x);", b.assign))
                .to_string();
            ans[FINALIZE].push_str(&src)
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
        let (dt, bound) = self.bind(batch)?;
        let ls = self.local_size;
        let partial = H::alloc(queue, self.num_groups * dt.nbytes());
        let ptr = partial.as_ptr();

        let launch = || -> Result<(), LaunchError> {
            for (i, b) in bound.iter().enumerate() {
                let ng = groups(b.n, ls * self.simd, self.num_groups);
                let unit = if self.fetch.aligned(b.n, self.simd, ng * ls) {
                    PRIMARY
                } else {
                    FALLBACK
                };
                let mut args = vec![KernelArg::Uint(uint(b.n)?), KernelArg::Mem(ptr)];
                args.extend_from_slice(&b.partial.1);
                let name = format!("dot_{label}_{i}_0");
                H::launch(queue, programs.unit(unit)?, &name, &args, &[ng * ls], &[ls])?;

                let mut args = vec![KernelArg::Uint(uint(ng)?), KernelArg::Mem(ptr)];
                args.extend_from_slice(&b.finalize.1);
                let name = format!("dot_{label}_{i}_1");
                H::launch(queue, programs.unit(FINALIZE)?, &name, &args, &[ls], &[ls])?;
            }
            Ok(())
        };
        let result = launch();
        H::free(queue, partial);
        result
    }
}
