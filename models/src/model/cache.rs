use crate::{execution_failed, ContextOf, Hardware, LaunchError, ProgramOf};
use log::debug;
use std::{collections::HashMap, sync::Arc, sync::OnceLock};

/// 惰性编译的程序单元。
///
/// 源码在构造时就固定下来，第一次使用时才交给设备编译，之后不会再编译。
pub struct LazyProgram<H: Hardware> {
    context: ContextOf<H>,
    name: String,
    source: String,
    program: OnceLock<ProgramOf<H>>,
}

impl<H: Hardware> LazyProgram<H> {
    fn new(context: ContextOf<H>, name: String, pragma: &str) -> Self {
        Self {
            context,
            name,
            source: pragma.to_string(),
            program: OnceLock::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.program.get().is_some()
    }

    /// 取得编译好的程序，必要时编译。
    pub fn get(&self) -> Result<&ProgramOf<H>, LaunchError> {
        if let Some(program) = self.program.get() {
            return Ok(program);
        }
        debug!("build program unit {} ({} bytes)", self.name, self.source.len());
        let program = H::build(&self.context, &self.name, &self.source)?;
        Ok(self.program.get_or_init(|| program))
    }
}

/// 一个结构签名对应的全部程序单元。
pub struct Programs<H: Hardware> {
    pragma: &'static str,
    units: Vec<LazyProgram<H>>,
}

impl<H: Hardware> Programs<H> {
    /// 创建主单元和回退单元，所有单元都以 `pragma` 开头。
    pub(super) fn new(context: &ContextOf<H>, signature: &str, pragma: &'static str) -> Self {
        Self {
            pragma,
            units: vec![
                LazyProgram::new(context.clone(), signature.to_string(), pragma),
                LazyProgram::new(context.clone(), format!("{signature}_fb"), pragma),
            ],
        }
    }

    /// 把源码追加到第 `j` 个单元，单元不存在时创建。
    pub(super) fn append(&mut self, context: &ContextOf<H>, signature: &str, j: usize, src: &str) {
        while self.units.len() <= j {
            let name = format!("{signature}_{}", self.units.len());
            self.units.push(LazyProgram::new(context.clone(), name, self.pragma))
        }
        self.units[j].source.push_str(src)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[inline]
    pub fn units(&self) -> &[LazyProgram<H>] {
        &self.units
    }

    /// 第 `j` 个单元编译好的程序。
    pub fn unit(&self, j: usize) -> Result<&ProgramOf<H>, LaunchError> {
        self.units
            .get(j)
            .ok_or_else(|| execution_failed(format!("program unit {j} does not exist")))?
            .get()
    }
}

/// 按硬件上下文和结构签名索引的程序缓存，条目只增不减。
pub struct ProgramCache<H: Hardware>(HashMap<ContextOf<H>, HashMap<String, Arc<Programs<H>>>>);

impl<H: Hardware> Default for ProgramCache<H> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<H: Hardware> ProgramCache<H> {
    #[inline]
    pub fn get(&self, context: &ContextOf<H>, signature: &str) -> Option<&Arc<Programs<H>>> {
        self.0.get(context)?.get(signature)
    }

    /// 插入或原地替换，返回共享的程序集。
    pub fn insert(
        &mut self,
        context: ContextOf<H>,
        signature: String,
        programs: Programs<H>,
    ) -> Arc<Programs<H>> {
        let programs = Arc::new(programs);
        self.0
            .entry(context)
            .or_default()
            .insert(signature, programs.clone());
        programs
    }

    /// 所有上下文中的条目总数。
    pub fn len(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(HashMap::is_empty)
    }
}
