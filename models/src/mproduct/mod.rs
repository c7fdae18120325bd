//! 矩阵乘 `C = op(A) op(B)`，四种转置组合各是一个算子。
//!
//! 每个线程组计算 `(LS0 * MS) x (LS1 * NS)` 的分块，每个线程计算 `MS x NS` 的小块，
//! 沿 K 方向每次推进 `KL`。以局部存储取数的操作数由全组线程按 `LF0 x LF1` 协作搬运。

use crate::{
    args_mismatch,
    model::Programs,
    template::{
        check_matrices, logical_shape, uint, FetchPolicy, Index, Operands, Template, FALLBACK,
        PRIMARY,
    },
    utils::{is_multiple, positive, simd_width},
    invalid_input, invalid_parameter, shape_mismatch, CodeGen, ConfigError, DeviceInfo,
    Expression, ExpressionBatch, Hardware, KernelArg, Leaf, LaunchError, Node, OperationKind,
    QueueOf,
};
use log::warn;

/// 矩阵乘的分块参数，字段顺序即模型文件中的参数顺序。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tiling {
    pub simd: usize,
    pub ls0: usize,
    pub kl: usize,
    pub ls1: usize,
    pub ms: usize,
    pub ks: usize,
    pub ns: usize,
    pub fetch_a: FetchPolicy,
    pub fetch_b: FetchPolicy,
    pub lf0: usize,
    pub lf1: usize,
}

impl Tiling {
    pub const DEFAULT: Self = Self {
        simd: 1,
        ls0: 8,
        kl: 8,
        ls1: 8,
        ms: 4,
        ks: 1,
        ns: 4,
        fetch_a: FetchPolicy::Local,
        fetch_b: FetchPolicy::Local,
        lf0: 8,
        lf1: 8,
    };

    /// `[simd, ls0, kl, ls1, ms, ks, ns, fetch_a, fetch_b, lf0, lf1]`
    pub fn from_profile(args: &[i64]) -> Result<Self, ConfigError> {
        let &[simd, ls0, kl, ls1, ms, ks, ns, fa, fb, lf0, lf1] = args else {
            return Err(args_mismatch(format!("gemm takes 11 arguments, got {args:?}")));
        };
        let ans = Self {
            simd: simd_width(simd)?,
            ls0: positive("ls0", ls0)?,
            kl: positive("kl", kl)?,
            ls1: positive("ls1", ls1)?,
            ms: positive("ms", ms)?,
            ks: positive("ks", ks)?,
            ns: positive("ns", ns)?,
            fetch_a: FetchPolicy::from_index(fa)?,
            fetch_b: FetchPolicy::from_index(fb)?,
            lf0: positive("lf0", lf0)?,
            lf1: positive("lf1", lf1)?,
        };
        if !is_multiple(ans.kl, ans.ks) {
            return Err(invalid_parameter(format!(
                "kl = {} is not a multiple of ks = {}",
                ans.kl, ans.ks
            )));
        }
        if ans.lf0 * ans.lf1 != ans.ls0 * ans.ls1 {
            return Err(invalid_parameter(format!(
                "fetch shape {}x{} does not cover the {}x{} group",
                ans.lf0, ans.lf1, ans.ls0, ans.ls1
            )));
        }
        Ok(ans)
    }

    #[inline]
    const fn ml(&self) -> usize {
        self.ls0 * self.ms
    }

    #[inline]
    const fn nl(&self) -> usize {
        self.ls1 * self.ns
    }
}

/// 小块在分块中的排布，连续取数时线程负责相邻的行或列。
fn micro_tile(fetch: FetchPolicy, local: &str, micro: &str, ls: &str, i: &str) -> String {
    match fetch {
        FetchPolicy::GlobalContiguous => format!("({local} * {micro} + ({i}))"),
        FetchPolicy::Local | FetchPolicy::GlobalStrided => format!("({local} + ({i}) * {ls})"),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MProduct {
    trans: (bool, bool),
    tiling: Tiling,
}

struct Bound<H: Hardware> {
    mnk: [usize; 3],
    a: String,
    b: String,
    assign: String,
    params: String,
    args: Vec<KernelArg<H>>,
}

impl MProduct {
    /// `trans` 表示 A 和 B 是否以转置形式参与乘法。
    pub const fn new(trans: (bool, bool), tiling: Tiling) -> Self {
        Self { trans, tiling }
    }

    pub fn from_profile(trans: (bool, bool), args: &[i64]) -> Result<Self, ConfigError> {
        Tiling::from_profile(args).map(|tiling| Self::new(trans, tiling))
    }

    #[inline]
    pub fn tiling(&self) -> &Tiling {
        &self.tiling
    }

    fn kind(&self) -> OperationKind {
        match self.trans {
            (false, false) => OperationKind::MatrixProductNN,
            (false, true) => OperationKind::MatrixProductNT,
            (true, false) => OperationKind::MatrixProductTN,
            (true, true) => OperationKind::MatrixProductTT,
        }
    }

    fn bind<H: Hardware>(&self, batch: &ExpressionBatch<H>) -> Result<Vec<Bound<H>>, LaunchError> {
        let mut ops = Operands::new(batch.dtype()?);
        let mut ans = Vec::with_capacity(batch.expressions().len());
        for e in batch.expressions() {
            if e.kind()? != self.kind() {
                return Err(invalid_input(format!("{:?} expected", self.kind())));
            }
            let [m, n, k] = mnk(e)?;
            let (c, a, b) = split(e)?;
            let (k_b, n_b) = logical_shape(b)?;
            if k_b != k || n_b != n {
                return Err(shape_mismatch(format!(
                    "{m}x{k} by {k_b}x{n_b} into {m}x{n}"
                )));
            }
            check_matrices(a, m, k)?;
            check_matrices(b, k, n)?;

            ops.restart();
            let assign = ops.access(c, Index::Matrix("r", "c"))?;
            let a = ops.expr(a, Index::Matrix("r", "p"))?;
            let b = ops.expr(b, Index::Matrix("p", "c"))?;
            ans.push(Bound {
                mnk: [m, n, k],
                a,
                b,
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
        Node::Product(a, b) => Ok((&e.lhs, &**a, &**b)),
        _ => Err(invalid_input("gemm expects `matrix = matrix @ matrix`")),
    }
}

fn mnk<H: Hardware>(e: &Expression<H>) -> Result<[usize; 3], LaunchError> {
    let (c, a, _) = split(e)?;
    let Leaf::Matrix { rows, cols, .. } = c else {
        return Err(invalid_input("gemm assigns to a matrix"));
    };
    let (m, k) = logical_shape(a)?;
    if m != *rows {
        return Err(shape_mismatch(format!("{m} rows into {rows}")));
    }
    Ok([m, *cols, k])
}

impl<H: Hardware> Template<H> for MProduct {
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        mnk(batch.first()?).map(|mnk| mnk.to_vec())
    }

    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError> {
        let t = &self.tiling;
        if device.max_group_size != 0 && t.ls0 * t.ls1 > device.max_group_size {
            warn!(
                "gemm {label}: {}x{} group exceeds {} on {}",
                t.ls0, t.ls1, device.max_group_size, device.name
            )
        }
        let dt = batch.dtype()?;
        let row = micro_tile(t.fetch_a, "l0", "MS", "LS0", "i");
        let col = micro_tile(t.fetch_b, "l1", "NS", "LS1", "j");
        let mut ans = vec![String::new(); 2];
        for (i, b) in self.bind(batch)?.iter().enumerate() {
            for (unit, fallback) in [(PRIMARY, false), (FALLBACK, true)] {
                let src = CodeGen::new(include_str!("mproduct.cl"))
                    .define("KERNEL", format!("gemm_{label}_{i}"))
                    .define("T", dt.cl_name())
                    .define("LS0", t.ls0)
                    .define("LS1", t.ls1)
                    .define("KL", t.kl)
                    .define("KS", t.ks)
                    .define("MS", t.ms)
                    .define("NS", t.ns)
                    .define("LF0", t.lf0)
                    .define("LF1", t.lf1)
                    .define("ROW(i)", &row)
                    .define("COL(j)", &col)
                    .define_if(t.fetch_a == FetchPolicy::Local, "A_LOCAL")
                    .define_if(t.fetch_b == FetchPolicy::Local, "B_LOCAL")
                    .define("PARAMS", &b.params)
                    .define("A_AT(r,p)", &b.a)
                    .define("B_AT(p,c)", &b.b)
                    .define("ASSIGN(r,c,x)", format!("{} = (x);", b.assign))
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
        let t = &self.tiling;
        for (i, b) in self.bind(batch)?.into_iter().enumerate() {
            let [m, n, k] = b.mnk;
            let aligned =
                is_multiple(m, t.ml()) && is_multiple(n, t.nl()) && is_multiple(k, t.kl);
            let unit = if aligned { PRIMARY } else { FALLBACK };
            let mut args = vec![
                KernelArg::Uint(uint(m)?),
                KernelArg::Uint(uint(n)?),
                KernelArg::Uint(uint(k)?),
            ];
            args.extend(b.args);
            H::launch(
                queue,
                programs.unit(unit)?,
                &format!("gemm_{label}_{i}"),
                &args,
                &[m.div_ceil(t.ml()) * t.ls0, n.div_ceil(t.nl()) * t.ls1],
                &[t.ls0, t.ls1],
            )?
        }
        Ok(())
    }
}
