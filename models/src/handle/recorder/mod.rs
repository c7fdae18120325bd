//! 在主机上记录编译和发射的测试硬件。
//!
//! 不执行任何计算，只检查程序和内核参数的基本合法性，
//! 并在 `finish` 时按内核名模拟耗时。

use crate::{build_failed, execution_failed, DeviceInfo, Hardware, KernelArg, LaunchError};
use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc, Mutex, MutexGuard,
    },
    thread::sleep,
    time::Duration,
};

#[derive(Clone, Copy, Debug)]
pub struct Recorder;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Relaxed)
}

/// 一次编译。
#[derive(Clone, Debug)]
pub struct Build {
    pub name: String,
    pub source: String,
}

/// 一次内核发射。
#[derive(Clone, Debug)]
pub struct Launch {
    pub program: String,
    pub kernel: String,
    pub args: usize,
    pub global: Vec<usize>,
    pub local: Vec<usize>,
}

#[derive(Default, Debug)]
struct Log {
    builds: Vec<Build>,
    launches: Vec<Launch>,
    failing: bool,
}

/// 上下文之间只按标识比较，克隆共享同一份记录。
#[derive(Clone, Debug)]
pub struct RecordContext {
    id: usize,
    log: Arc<Mutex<Log>>,
}

impl PartialEq for RecordContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RecordContext {}

impl Hash for RecordContext {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id.hash(state)
    }
}

impl Default for RecordContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordContext {
    pub fn new() -> Self {
        Self {
            id: next_id(),
            log: Default::default(),
        }
    }

    #[inline]
    pub fn queue(&self) -> RecordQueue {
        RecordQueue::new(self)
    }

    /// 之后的编译全部失败。
    pub fn fail_builds(&self, failing: bool) {
        self.lock().failing = failing
    }

    pub fn builds(&self) -> Vec<Build> {
        self.lock().builds.clone()
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.lock().launches.clone()
    }

    fn lock(&self) -> MutexGuard<Log> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct RecordQueue {
    id: usize,
    context: RecordContext,
    info: DeviceInfo,
    delays: HashMap<String, Duration>,
    pending: Mutex<Duration>,
}

impl RecordQueue {
    pub fn new(context: &RecordContext) -> Self {
        Self {
            id: next_id(),
            context: context.clone(),
            info: DeviceInfo {
                name: "recorder".into(),
                extensions: String::new(),
                max_group_size: 1024,
            },
            delays: Default::default(),
            pending: Mutex::new(Duration::ZERO),
        }
    }

    pub fn with_extensions(mut self, extensions: &str) -> Self {
        self.info.extensions = extensions.into();
        self
    }

    /// 名为 `kernel` 的内核每次发射在 `finish` 时耗时 `delay`。
    pub fn with_delay(mut self, kernel: &str, delay: Duration) -> Self {
        self.delays.insert(kernel.into(), delay);
        self
    }

    #[inline]
    pub fn context(&self) -> &RecordContext {
        &self.context
    }

    #[inline]
    pub fn builds(&self) -> Vec<Build> {
        self.context.builds()
    }

    #[inline]
    pub fn launches(&self) -> Vec<Launch> {
        self.context.launches()
    }

    fn pending(&self) -> MutexGuard<Duration> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// 编译好的程序保留源码，发射时据此检查内核名。
#[derive(Debug)]
pub struct RecordProgram {
    pub name: String,
    pub source: String,
}

fn contains_word(src: &str, word: &str) -> bool {
    src.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|w| w == word)
}

impl Hardware for Recorder {
    type Byte = u8;
    type Context = RecordContext;
    type Queue = RecordQueue;
    type QueueId = usize;
    type Program = RecordProgram;
    type Blob = Vec<u8>;

    #[inline]
    fn queue_context(queue: &Self::Queue) -> Self::Context {
        queue.context.clone()
    }

    #[inline]
    fn queue_id(queue: &Self::Queue) -> Self::QueueId {
        queue.id
    }

    #[inline]
    fn device_info(queue: &Self::Queue) -> DeviceInfo {
        queue.info.clone()
    }

    fn build(ctx: &Self::Context, name: &str, src: &str) -> Result<Self::Program, LaunchError> {
        let mut log = ctx.lock();
        log.builds.push(Build {
            name: name.into(),
            source: src.into(),
        });
        if log.failing {
            return Err(build_failed(format!("{name}: build rejected by recorder")));
        }
        Ok(RecordProgram {
            name: name.into(),
            source: src.into(),
        })
    }

    fn launch(
        queue: &Self::Queue,
        program: &Self::Program,
        kernel: &str,
        args: &[KernelArg<Self>],
        global: &[usize],
        local: &[usize],
    ) -> Result<(), LaunchError> {
        if !contains_word(&program.source, kernel) {
            return Err(execution_failed(format!(
                "kernel {kernel} not found in {}",
                program.name
            )));
        }
        if global.len() != local.len()
            || global.is_empty()
            || global.iter().zip(local).any(|(&g, &l)| l == 0 || g % l != 0)
        {
            return Err(execution_failed(format!(
                "invalid work size {global:?} / {local:?} for {kernel}"
            )));
        }
        queue.context.lock().launches.push(Launch {
            program: program.name.clone(),
            kernel: kernel.into(),
            args: args.len(),
            global: global.into(),
            local: local.into(),
        });
        if let Some(delay) = queue.delays.get(kernel) {
            *queue.pending() += *delay
        }
        Ok(())
    }

    #[inline]
    fn alloc(_queue: &Self::Queue, size: usize) -> Self::Blob {
        vec![0; size]
    }

    #[inline]
    fn free(_queue: &Self::Queue, _blob: Self::Blob) {}

    fn finish(queue: &Self::Queue) {
        let delay = std::mem::take(&mut *queue.pending());
        if !delay.is_zero() {
            sleep(delay)
        }
    }
}

#[cfg(test)]
mod test {
    use super::{contains_word, RecordContext, Recorder};
    use crate::{Hardware, LaunchErrorKind};

    #[test]
    fn test_word() {
        let src = "#define KERNEL vaxpy_1\n__kernel void KERNEL() {}";
        assert!(contains_word(src, "vaxpy_1"));
        assert!(!contains_word(src, "vaxpy_"));
        assert!(!contains_word(src, "vaxpy_10"));
    }

    #[test]
    fn test_launch() {
        let ctx = RecordContext::new();
        let queue = ctx.queue();
        let program = Recorder::build(&ctx, "p", "#define KERNEL k0\n").unwrap();

        Recorder::launch(&queue, &program, "k0", &[], &[64], &[16]).unwrap();
        let e = Recorder::launch(&queue, &program, "k1", &[], &[64], &[16]).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ExecutionFailed);
        let e = Recorder::launch(&queue, &program, "k0", &[], &[60], &[16]).unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::ExecutionFailed);

        assert_eq!(ctx.builds().len(), 1);
        assert_eq!(queue.launches().len(), 1);
        assert_ne!(ctx, RecordContext::new());
        assert_eq!(ctx, queue.context().clone());
    }

    #[test]
    fn test_build_failure() {
        let ctx = RecordContext::new();
        ctx.fail_builds(true);
        let e = Recorder::build(&ctx, "p", "").unwrap_err();
        assert_eq!(e.kind, LaunchErrorKind::BuildFailed);
    }
}
