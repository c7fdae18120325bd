use std::{env::var_os, path::PathBuf};

/// 指定持久化模型文件路径的环境变量。
pub const MODEL_FILE_ENV: &str = "KERNEL_MODELS_FILE";

/// 模型表构造配置。
#[derive(Clone, Default, Debug)]
pub struct ModelConfig {
    /// 构造模型表时导入的模型文件，缺省时只有内置的默认变体。
    pub model_file: Option<PathBuf>,
}

impl ModelConfig {
    pub fn from_env() -> Self {
        Self {
            model_file: var_os(MODEL_FILE_ENV)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }

    #[inline]
    pub fn with_model_file(path: impl Into<PathBuf>) -> Self {
        Self {
            model_file: Some(path.into()),
        }
    }
}
