// #![deny(warnings)]

mod common;
mod config;
mod handle;

pub mod expression;
pub mod model;
pub mod predictor;
pub mod template;

pub mod maxpy;
pub mod mproduct;
pub mod mreduction;
pub mod reduction;
pub mod vaxpy;

pub use common::*;
pub use config::{ModelConfig, MODEL_FILE_ENV};
pub use expression::{
    BinaryOp, Expression, ExpressionBatch, Handle, Leaf, Node, OperationKind, Order, ReduceOp,
    UnaryOp,
};
pub use model::{select_variant, Backend, Model, ModelMap};
pub use predictor::{Predictor, RandomForest};
pub use template::{FetchPolicy, Template};

#[cfg(any(use_recorder, test))]
pub use handle::recorder;

use std::{fmt::Debug, hash::Hash, ops::DerefMut};

/// 算力硬件抽象。
///
/// 约定硬件上下文、任务队列、程序编译和内核发射的方式。
/// 引擎只把上下文和队列当作可比较的不透明标识使用。
pub trait Hardware: Sized + 'static {
    /// 硬件的存储单元类型。
    type Byte;
    /// 硬件上下文标识，编译缓存以此区分。
    type Context: Clone + Eq + Hash + Debug;
    /// 硬件的任务队列类型。
    type Queue;
    /// 任务队列标识，每个队列拥有独立的模型表。
    type QueueId: Clone + Eq + Hash + Debug;
    /// 编译完成的程序单元。
    type Program;
    /// 队列上分配的临时存储。
    type Blob: DerefMut<Target = [Self::Byte]>;

    fn queue_context(queue: &Self::Queue) -> Self::Context;
    fn queue_id(queue: &Self::Queue) -> Self::QueueId;
    fn device_info(queue: &Self::Queue) -> DeviceInfo;

    /// 编译程序单元，失败时错误信息中携带编译日志。
    fn build(ctx: &Self::Context, name: &str, src: &str) -> Result<Self::Program, LaunchError>;

    /// 发射内核到任务队列，不等待完成。
    fn launch(
        queue: &Self::Queue,
        program: &Self::Program,
        kernel: &str,
        args: &[KernelArg<Self>],
        global: &[usize],
        local: &[usize],
    ) -> Result<(), LaunchError>;

    fn alloc(queue: &Self::Queue, size: usize) -> Self::Blob;
    /// 按队列顺序释放，先前发射的任务完成后才真正回收。
    fn free(queue: &Self::Queue, blob: Self::Blob);

    /// 阻塞直到队列中的任务全部完成。
    fn finish(queue: &Self::Queue);
}

pub type ContextOf<H> = <H as Hardware>::Context;
pub type QueueOf<H> = <H as Hardware>::Queue;
pub type ProgramOf<H> = <H as Hardware>::Program;
pub(crate) type ConstPtr<H> = *const <H as Hardware>::Byte;

/// 设备能力查询结果。
#[derive(Clone, Default, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub extensions: String,
    pub max_group_size: usize,
}

impl DeviceInfo {
    #[inline]
    pub fn supports(&self, ext: &str) -> bool {
        self.extensions.split_whitespace().any(|e| e == ext)
    }
}

/// 内核参数。
pub enum KernelArg<H: Hardware> {
    Mem(ConstPtr<H>),
    Uint(u32),
    Value(Value),
}

impl<H: Hardware> Clone for KernelArg<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Hardware> Copy for KernelArg<H> {}

impl<H: Hardware> Debug for KernelArg<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mem(ptr) => write!(f, "Mem({ptr:?})"),
            Self::Uint(n) => write!(f, "Uint({n})"),
            Self::Value(v) => write!(f, "Value({v:?})"),
        }
    }
}
