mod codegen;
mod error;
mod numeric;

pub use error::{functions::*, ConfigError, ConfigErrorKind, LaunchError, LaunchErrorKind};
pub use numeric::{NumericType, Value};

pub(crate) use codegen::CodeGen;

pub mod utils {
    use super::{invalid_parameter, ConfigError};

    /// 检查模板参数为正数并转换为 `usize`。
    pub(crate) fn positive(name: &str, value: i64) -> Result<usize, ConfigError> {
        if value > 0 {
            Ok(value as usize)
        } else {
            Err(invalid_parameter(format!("{name} = {value}, positive expected")))
        }
    }

    /// 树形归约的线程数必须是 2 的幂。
    pub(crate) fn power_of_two(name: &str, value: i64) -> Result<usize, ConfigError> {
        let n = positive(name, value)?;
        if n.is_power_of_two() {
            Ok(n)
        } else {
            Err(invalid_parameter(format!("{name} = {n}, power of 2 expected")))
        }
    }

    /// 检查向量化宽度。
    pub(crate) fn simd_width(value: i64) -> Result<usize, ConfigError> {
        match value {
            1 | 2 | 4 | 8 | 16 => Ok(value as usize),
            _ => Err(invalid_parameter(format!(
                "simd width = {value}, one of 1/2/4/8/16 expected"
            ))),
        }
    }

    #[inline]
    pub(crate) const fn is_multiple(n: usize, d: usize) -> bool {
        n % d == 0
    }
}
