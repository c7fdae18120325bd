use super::{import::parse, Model};
use crate::{
    io_failed, maxpy::Maxpy, model_not_found, mproduct::{MProduct, Tiling},
    mreduction::MReduction, reduction::Reduction, vaxpy::Vaxpy, ConfigError, ExpressionBatch,
    FetchPolicy, Hardware, LaunchError, ModelConfig, NumericType, OperationKind, QueueOf,
    Template,
};
use log::info;
use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    path::Path,
};

/// 按 (算子, 元素类型) 索引的模型表。
pub struct ModelMap<H: Hardware>(HashMap<(OperationKind, NumericType), Model<H>>);

impl<H: Hardware> Default for ModelMap<H> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<H: Hardware> ModelMap<H> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个 (算子, 元素类型) 都装入一个保守的单变体模型。
    pub fn with_defaults() -> Self {
        let mut map = Self::new();
        for kind in OperationKind::ALL {
            for dt in NumericType::ALL {
                map.insert(kind, dt, Model::new(vec![default_template(kind)]));
            }
        }
        map
    }

    /// 插入或替换，返回被替换的模型。
    #[inline]
    pub fn insert(&mut self, kind: OperationKind, dt: NumericType, model: Model<H>) -> Option<Model<H>> {
        self.0.insert((kind, dt), model)
    }

    pub fn get(&self, kind: OperationKind, dt: NumericType) -> Result<&Model<H>, LaunchError> {
        self.0.get(&(kind, dt)).ok_or_else(|| not_found(kind, dt))
    }

    pub fn get_mut(
        &mut self,
        kind: OperationKind,
        dt: NumericType,
    ) -> Result<&mut Model<H>, LaunchError> {
        self.0.get_mut(&(kind, dt)).ok_or_else(|| not_found(kind, dt))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| io_failed(format!("{}: {e}", path.display())))?;
        self.import_str(&text)
    }

    /// 导入模型文档，替换其中声明的条目，返回导入的条目数。
    ///
    /// 文档中任何一处出错都不会改变模型表。
    pub fn import_str(&mut self, s: &str) -> Result<usize, ConfigError> {
        let models = parse(s)?;
        let n = models.len();
        for ((kind, dt), model) in models {
            info!("import {} variants for {kind:?} {dt}", model.templates().len());
            self.insert(kind, dt, model);
        }
        Ok(n)
    }
}

fn not_found(kind: OperationKind, dt: NumericType) -> LaunchError {
    model_not_found(format!("no model for {kind:?} {dt}"))
}

fn default_template<H: Hardware>(kind: OperationKind) -> Box<dyn Template<H>> {
    use FetchPolicy::GlobalStrided as G;
    use OperationKind as K;
    match kind {
        K::ScalarAxpy | K::VectorAxpy => Box::new(Vaxpy::new(1, 64, 128, G)),
        K::Reduction => Box::new(Reduction::new(1, 64, 128, G)),
        K::MatrixAxpy => Box::new(Maxpy::new(1, [8, 8], [8, 8], G)),
        K::RowWiseReduction => Box::new(MReduction::rows(1, [8, 8], 16, G)),
        K::ColWiseReduction => Box::new(MReduction::cols(1, [8, 8], 16, G)),
        K::MatrixProductNN => Box::new(MProduct::new((false, false), Tiling::DEFAULT)),
        K::MatrixProductNT => Box::new(MProduct::new((false, true), Tiling::DEFAULT)),
        K::MatrixProductTN => Box::new(MProduct::new((true, false), Tiling::DEFAULT)),
        K::MatrixProductTT => Box::new(MProduct::new((true, true), Tiling::DEFAULT)),
    }
}

/// 为每个任务队列维护一张模型表。
///
/// 队列第一次出现时装入默认模型，如果配置了模型文件则再导入它。
pub struct Backend<H: Hardware> {
    config: ModelConfig,
    maps: HashMap<H::QueueId, ModelMap<H>>,
}

impl<H: Hardware> Backend<H> {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            maps: HashMap::new(),
        }
    }

    #[inline]
    pub fn from_env() -> Self {
        Self::new(ModelConfig::from_env())
    }

    #[inline]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn model_map(&mut self, queue: &QueueOf<H>) -> Result<&mut ModelMap<H>, ConfigError> {
        match self.maps.entry(H::queue_id(queue)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let mut map = ModelMap::with_defaults();
                if let Some(path) = &self.config.model_file {
                    let n = map.import_file(path)?;
                    info!("{n} models imported from {} for {:?}", path.display(), entry.key());
                }
                Ok(entry.insert(map))
            }
        }
    }

    pub fn model(
        &mut self,
        queue: &QueueOf<H>,
        kind: OperationKind,
        dt: NumericType,
    ) -> Result<&mut Model<H>, LaunchError> {
        Ok(self.model_map(queue)?.get_mut(kind, dt)?)
    }

    pub fn execute(
        &mut self,
        queue: &QueueOf<H>,
        batch: &ExpressionBatch<H>,
        bypass_predictor: bool,
        force_recompile: bool,
    ) -> Result<usize, LaunchError> {
        self.model(queue, batch.kind()?, batch.dtype()?)?
            .execute(queue, batch, bypass_predictor, force_recompile)
    }

    pub fn tune(
        &mut self,
        queue: &QueueOf<H>,
        batch: &ExpressionBatch<H>,
    ) -> Result<usize, LaunchError> {
        self.model(queue, batch.kind()?, batch.dtype()?)?
            .tune(queue, batch)
    }
}
