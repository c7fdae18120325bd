mod emit;

pub(crate) use emit::{combine, identity, uint, Index, Operands};

use crate::{
    invalid_fetch, invalid_input, model::Programs, shape_mismatch, CodeGen, ConfigError,
    DeviceInfo, ExpressionBatch, Hardware, Leaf, LaunchError, Node, QueueOf,
};

/// 一个参数化的内核变体。
///
/// 同一个模型中的所有变体生成的源码拼接在同一组程序单元里，
/// 因此生成的内核名必须带上变体序号 `label`。
/// 单元 0 假设规模是分块的整数倍，单元 1 带边界检查，其余单元由变体自行约定。
pub trait Template<H: Hardware> {
    /// 从表达式批提取规模特征。
    fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError>;

    /// 生成各程序单元的源码，第 j 项追加到第 j 个单元。
    fn generate(
        &self,
        label: usize,
        batch: &ExpressionBatch<H>,
        device: &DeviceInfo,
    ) -> Result<Vec<String>, LaunchError>;

    /// 在已编译的程序上发射计算，不等待完成。
    fn enqueue(
        &self,
        queue: &QueueOf<H>,
        programs: &Programs<H>,
        label: usize,
        batch: &ExpressionBatch<H>,
    ) -> Result<(), LaunchError>;
}

/// 主单元与回退单元。
pub(crate) const PRIMARY: usize = 0;
pub(crate) const FALLBACK: usize = 1;

/// 内核读取操作数的方式。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FetchPolicy {
    Local,
    GlobalStrided,
    GlobalContiguous,
}

impl FetchPolicy {
    /// 模型文件中的取数方式序号。
    pub fn from_index(index: i64) -> Result<Self, ConfigError> {
        match index {
            0 => Ok(Self::Local),
            1 => Ok(Self::GlobalStrided),
            2 => Ok(Self::GlobalContiguous),
            _ => Err(invalid_fetch(format!("fetch policy {index} out of 0..=2"))),
        }
    }

    /// 定义 `FIRST(id)` 和 `LANE(base,k,width)`。
    ///
    /// 连续取数时每个线程处理相邻的 `SIMD` 个元素，
    /// 否则相邻线程处理相邻元素，线程的各路间隔 `width`。
    pub(crate) fn lanes(self, gen: CodeGen) -> CodeGen {
        match self {
            Self::GlobalContiguous => gen
                .define("FIRST(id)", "((id)*SIMD)")
                .define("LANE(base,k,width)", "((base)+(k))"),
            Self::Local | Self::GlobalStrided => gen
                .define("FIRST(id)", "(id)")
                .define("LANE(base,k,width)", "((base)+(k)*(width))"),
        }
    }

    /// `width` 个线程以 `simd` 路处理 `n` 个元素时是否不需要边界检查。
    pub(crate) const fn aligned(self, n: usize, simd: usize, width: usize) -> bool {
        match self {
            Self::GlobalContiguous => n % simd == 0,
            Self::Local | Self::GlobalStrided => n % (simd * width) == 0,
        }
    }
}

/// 检查逐元素表达式中所有向量的长度都是 `n`，不允许出现矩阵。
pub(crate) fn check_vectors<H: Hardware>(node: &Node<H>, n: usize) -> Result<(), LaunchError> {
    for leaf in node.leaves() {
        match leaf {
            Leaf::Vector { len, .. } if *len != n => {
                return Err(shape_mismatch(format!("vector of {len} in a {n} elements expression")))
            }
            Leaf::Matrix { .. } => return Err(invalid_input("matrix in a vector expression")),
            _ => {}
        }
    }
    Ok(())
}

/// 检查逐元素表达式中所有矩阵转置后的形状都是 `rows x cols`，不允许出现向量。
pub(crate) fn check_matrices<H: Hardware>(
    node: &Node<H>,
    rows: usize,
    cols: usize,
) -> Result<(), LaunchError> {
    fn walk<H: Hardware>(
        node: &Node<H>,
        trans: bool,
        shape: (usize, usize),
    ) -> Result<(), LaunchError> {
        match node {
            Node::Leaf(Leaf::Matrix { rows, cols, .. }) => {
                let actual = if trans { (*cols, *rows) } else { (*rows, *cols) };
                if actual == shape {
                    Ok(())
                } else {
                    Err(shape_mismatch(format!(
                        "{}x{} matrix in a {}x{} expression",
                        actual.0, actual.1, shape.0, shape.1
                    )))
                }
            }
            Node::Leaf(Leaf::Vector { .. }) => Err(invalid_input("vector in a matrix expression")),
            Node::Leaf(_) => Ok(()),
            Node::Unary(_, x) => walk(x, trans, shape),
            Node::Trans(x) => walk(x, !trans, shape),
            Node::Binary(_, a, b) => {
                walk(a, trans, shape)?;
                walk(b, trans, shape)
            }
            Node::Reduce(..) | Node::Product(..) => {
                Err(invalid_input("nested reduction or product is not elementwise"))
            }
        }
    }
    walk(node, false, (rows, cols))
}

/// 矩阵表达式的逻辑形状，取第一个矩阵并按外层转置交换。
pub(crate) fn logical_shape<H: Hardware>(node: &Node<H>) -> Result<(usize, usize), LaunchError> {
    match node {
        Node::Leaf(Leaf::Matrix { rows, cols, .. }) => Ok((*rows, *cols)),
        Node::Trans(x) => logical_shape(x).map(|(r, c)| (c, r)),
        Node::Unary(_, x) => logical_shape(x),
        Node::Binary(_, a, b) => logical_shape(a).or_else(|_| logical_shape(b)),
        _ => Err(invalid_input("no matrix operand")),
    }
}

/// 规模不足一个线程组时不值得发射过多的组。
#[inline]
pub(crate) fn groups(n: usize, per_group: usize, limit: usize) -> usize {
    n.div_ceil(per_group).clamp(1, limit)
}
