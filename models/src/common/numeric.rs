use crate::{unknown_type, ConfigError};
use digit_layout::{types as ty, DigitLayout};
use std::fmt;

/// 算子支持的元素类型。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum NumericType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl NumericType {
    pub const ALL: [Self; 10] = [
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::I64,
        Self::U64,
        Self::F32,
        Self::F64,
    ];

    /// 模型文件中使用的类型名，只有浮点类型会被持久化。
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "float32" => Ok(Self::F32),
            "float64" => Ok(Self::F64),
            _ => Err(unknown_type(format!("\"{name}\" is not a persisted datatype"))),
        }
    }

    /// OpenCL C 中的类型名。
    pub const fn cl_name(self) -> &'static str {
        match self {
            Self::I8 => "char",
            Self::U8 => "uchar",
            Self::I16 => "short",
            Self::U16 => "ushort",
            Self::I32 => "int",
            Self::U32 => "uint",
            Self::I64 => "long",
            Self::U64 => "ulong",
            Self::F32 => "float",
            Self::F64 => "double",
        }
    }

    /// 结构签名中的类型记号。
    pub(crate) const fn token(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[inline]
    pub fn nbytes(self) -> usize {
        self.layout().nbytes()
    }

    pub fn layout(self) -> DigitLayout {
        match self {
            Self::I8 => ty::I8,
            Self::U8 => ty::U8,
            Self::I16 => ty::I16,
            Self::U16 => ty::U16,
            Self::I32 => ty::I32,
            Self::U32 => ty::U32,
            Self::I64 => ty::I64,
            Self::U64 => ty::U64,
            Self::F32 => ty::F32,
            Self::F64 => ty::F64,
        }
    }
}

impl TryFrom<DigitLayout> for NumericType {
    type Error = DigitLayout;

    fn try_from(dt: DigitLayout) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.layout() == dt)
            .ok_or(dt)
    }
}

impl fmt::Display for NumericType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// 由主机传入的标量值。
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub const fn dtype(&self) -> NumericType {
        match self {
            Self::I8(_) => NumericType::I8,
            Self::U8(_) => NumericType::U8,
            Self::I16(_) => NumericType::I16,
            Self::U16(_) => NumericType::U16,
            Self::I32(_) => NumericType::I32,
            Self::U32(_) => NumericType::U32,
            Self::I64(_) => NumericType::I64,
            Self::U64(_) => NumericType::U64,
            Self::F32(_) => NumericType::F32,
            Self::F64(_) => NumericType::F64,
        }
    }
}
