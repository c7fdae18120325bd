mod cache;
mod import;
mod map;

pub use cache::{LazyProgram, ProgramCache, Programs};
pub use map::{Backend, ModelMap};

use crate::{
    expression::{signature, BindToHandle},
    invalid_input, model_not_found, DeviceInfo, ExpressionBatch, Hardware, LaunchError,
    NumericType, Predictor, QueueOf, Template,
};
use log::{debug, info, trace};
use std::{collections::HashMap, sync::Arc, time::Instant};

const FP64: &str = "cl_khr_fp64";
const FP64_PRAGMA: &str = "#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n";

/// 一个 (算子, 元素类型) 的全部候选变体。
///
/// 持有变体列表、可选的开销预测器、按规模特征记录的强制选择，以及本模型的程序缓存。
/// 强制选择和程序缓存都只增不减。
pub struct Model<H: Hardware> {
    templates: Vec<Box<dyn Template<H>>>,
    predictor: Option<Arc<dyn Predictor>>,
    overrides: HashMap<Vec<usize>, usize>,
    cache: ProgramCache<H>,
}

impl<H: Hardware> Model<H> {
    pub fn new(templates: Vec<Box<dyn Template<H>>>) -> Self {
        assert!(!templates.is_empty(), "a model needs at least one template");
        Self {
            templates,
            predictor: None,
            overrides: HashMap::new(),
            cache: ProgramCache::default(),
        }
    }

    pub fn with_predictor(
        templates: Vec<Box<dyn Template<H>>>,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            predictor: Some(predictor),
            ..Self::new(templates)
        }
    }

    #[inline]
    pub fn from_template(template: impl Template<H> + 'static) -> Self {
        Self::new(vec![Box::new(template)])
    }

    #[inline]
    pub fn templates(&self) -> &[Box<dyn Template<H>>] {
        &self.templates
    }

    #[inline]
    pub fn predictor(&self) -> Option<&Arc<dyn Predictor>> {
        self.predictor.as_ref()
    }

    #[inline]
    pub fn overrides(&self) -> &HashMap<Vec<usize>, usize> {
        &self.overrides
    }

    /// 对规模特征 `key` 强制选择变体 `label`，覆盖已有的记录。
    pub fn set_override(&mut self, key: Vec<usize>, label: usize) -> Option<usize> {
        self.overrides.insert(key, label)
    }

    #[inline]
    pub fn cache(&self) -> &ProgramCache<H> {
        &self.cache
    }

    /// 规模特征由变体 0 提取，所有变体对同一个批提取出的特征形状相同。
    pub fn input_sizes(&self, batch: &ExpressionBatch<H>) -> Result<Vec<usize>, LaunchError> {
        batch.first()?;
        let key = self.templates[0].input_sizes(batch)?;
        if key.is_empty() {
            Err(invalid_input("empty size key"))
        } else {
            Ok(key)
        }
    }

    /// 取得批的结构签名对应的程序集，缺失时生成全部变体的源码。
    ///
    /// `force` 时重新生成并原地替换缓存条目。程序单元在第一次使用时才编译。
    pub fn ensure_compiled(
        &mut self,
        batch: &ExpressionBatch<H>,
        device: &DeviceInfo,
        force: bool,
    ) -> Result<Arc<Programs<H>>, LaunchError> {
        self.input_sizes(batch)?;
        let signature = signature(batch, &mut BindToHandle::default())?;
        let context = batch.context();
        if !force {
            if let Some(programs) = self.cache.get(context, &signature) {
                return Ok(programs.clone());
            }
        }

        debug!(
            "generate {} variants for {signature} on {context:?}",
            self.templates.len()
        );
        let pragma = if device.supports(FP64) && batch.dtype()? == NumericType::F64 {
            FP64_PRAGMA
        } else {
            ""
        };
        let mut programs = Programs::new(context, &signature, pragma);
        for (label, template) in self.templates.iter().enumerate() {
            for (j, src) in template.generate(label, batch, device)?.iter().enumerate() {
                programs.append(context, &signature, j, src)
            }
        }
        Ok(self.cache.insert(context.clone(), signature, programs))
    }

    /// 选择并发射一个变体，不等待完成，返回变体序号。
    pub fn execute(
        &mut self,
        queue: &QueueOf<H>,
        batch: &ExpressionBatch<H>,
        bypass_predictor: bool,
        force_recompile: bool,
    ) -> Result<usize, LaunchError> {
        check_context(queue, batch);
        let programs = self.ensure_compiled(batch, &H::device_info(queue), force_recompile)?;
        let key = self.input_sizes(batch)?;
        let label = select_variant(
            &key,
            self.predictor.as_deref(),
            &self.overrides,
            bypass_predictor,
        );
        trace!("select variant {label} for {key:?}");
        self.template(label)?.enqueue(queue, &programs, label, batch)?;
        Ok(label)
    }

    /// 逐个测量所有变体，把最快的记为这个规模的强制选择，返回其序号。
    ///
    /// 每个变体发射后都阻塞到队列排空，不要在延迟敏感的路径上调用。
    pub fn tune(
        &mut self,
        queue: &QueueOf<H>,
        batch: &ExpressionBatch<H>,
    ) -> Result<usize, LaunchError> {
        check_context(queue, batch);
        let programs = self.ensure_compiled(batch, &H::device_info(queue), false)?;
        for unit in programs.units() {
            unit.get()?;
        }
        let key = self.input_sizes(batch)?;

        H::finish(queue);
        let mut timings = Vec::with_capacity(self.templates.len());
        for (label, template) in self.templates.iter().enumerate() {
            let time = Instant::now();
            template.enqueue(queue, &programs, label, batch)?;
            H::finish(queue);
            timings.push(time.elapsed())
        }

        let best = argmin(&timings);
        info!("tune {key:?}: variant {best} in {timings:?}");
        self.overrides.insert(key, best);
        Ok(best)
    }

    fn template(&self, label: usize) -> Result<&dyn Template<H>, LaunchError> {
        self.templates
            .get(label)
            .map(|t| &**t)
            .ok_or_else(|| model_not_found(format!("variant {label} of {}", self.templates.len())))
    }
}

fn check_context<H: Hardware>(queue: &QueueOf<H>, batch: &ExpressionBatch<H>) {
    let context = H::queue_context(queue);
    assert!(
        batch.context() == &context,
        "expression batch on {:?} submitted to a queue of {context:?}",
        batch.context()
    )
}

/// 强制选择优先，其次是预测器，都没有时是变体 0。
pub fn select_variant(
    key: &[usize],
    predictor: Option<&dyn Predictor>,
    overrides: &HashMap<Vec<usize>, usize>,
    bypass: bool,
) -> usize {
    if let Some(&label) = overrides.get(key) {
        return label;
    }
    match predictor {
        Some(predictor) if !bypass => argmin(&predictor.predict(key)),
        _ => 0,
    }
}

/// 第一个最小值的位置。
pub fn argmin<T: PartialOrd>(values: &[T]) -> usize {
    let mut ans = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v < values[ans] {
            ans = i
        }
    }
    ans
}
