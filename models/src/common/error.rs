use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigErrorKind {
    Io,
    Parse,
    UnknownOperation,
    UnknownType,
    ArgsMismatch,
    InvalidFetch,
    InvalidParameter,
    PredictorInvalid,
}

/// 模型配置错误，在导入模型文件或构造模板时立即报告。
#[derive(Clone, Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub info: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaunchErrorKind {
    InvalidInput,
    TypeMismatch,
    ShapeMismatch,
    TooManyOperands,
    ModelNotFound,
    ModelConfig,
    BuildFailed,
    ExecutionFailed,
}

/// 选择、编译、发射过程中的错误，原样传播给调用者，不做重试。
#[derive(Clone, Debug)]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub info: String,
}

impl From<ConfigError> for LaunchError {
    fn from(e: ConfigError) -> Self {
        Self {
            kind: LaunchErrorKind::ModelConfig,
            info: format!("{:?}: {}", e.kind, e.info),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for LaunchError {}

pub(super) mod functions {
    use super::{
        ConfigError, ConfigErrorKind::*, LaunchError,
        LaunchErrorKind::{
            BuildFailed, ExecutionFailed, InvalidInput, ModelNotFound, ShapeMismatch,
            TooManyOperands, TypeMismatch,
        },
    };

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(ConfigError: io_failed          Io              );
    builder!(ConfigError: parse_failed       Parse           );
    builder!(ConfigError: unknown_operation  UnknownOperation);
    builder!(ConfigError: unknown_type       UnknownType     );
    builder!(ConfigError: args_mismatch      ArgsMismatch    );
    builder!(ConfigError: invalid_fetch      InvalidFetch    );
    builder!(ConfigError: invalid_parameter  InvalidParameter);
    builder!(ConfigError: predictor_invalid  PredictorInvalid);

    builder!(LaunchError: invalid_input      InvalidInput    );
    builder!(LaunchError: type_mismatch      TypeMismatch    );
    builder!(LaunchError: shape_mismatch     ShapeMismatch   );
    builder!(LaunchError: too_many_operands  TooManyOperands );
    builder!(LaunchError: model_not_found    ModelNotFound   );

    builder!(LaunchError: build_failed       BuildFailed     );
    builder!(LaunchError: execution_failed   ExecutionFailed );
}
