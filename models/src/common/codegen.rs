use std::fmt::{self, Display};

/// 为 OpenCL 代码模板注入宏定义。
///
/// 同一个程序单元中会拼接多个模板生成的代码，因此宏定义只在本段代码内有效，
/// 结尾处逐个 `#undef`。
pub(crate) struct CodeGen {
    code: &'static str,
    defines: Vec<(String, String)>,
}

impl CodeGen {
    pub fn new(code: &'static str) -> Self {
        Self {
            code,
            defines: Default::default(),
        }
    }

    pub fn define(mut self, name: impl Display, value: impl Display) -> Self {
        self.defines.push((name.to_string(), value.to_string()));
        self
    }

    pub fn define_if(self, cond: bool, name: impl Display) -> Self {
        if cond {
            self.define(name, 1)
        } else {
            self
        }
    }
}

impl Display for CodeGen {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (k, v) in &self.defines {
            writeln!(f, "#define {k} {v}")?;
        }
        writeln!(f, "{}", self.code)?;
        for (k, _) in self.defines.iter().rev() {
            let name = k.split_once('(').map_or(k.as_str(), |(name, _)| name);
            writeln!(f, "#undef {name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::CodeGen;

    #[test]
    fn test_scoped_defines() {
        let code = CodeGen::new("__kernel void KERNEL() {}")
            .define("KERNEL", "axpy0")
            .define_if(true, "FALLBACK")
            .define_if(false, "UNUSED")
            .to_string();
        assert_eq!(
            code,
            "#define KERNEL axpy0\n\
             #define FALLBACK 1\n\
             __kernel void KERNEL() {}\n\
             #undef FALLBACK\n\
             #undef KERNEL\n"
        );
    }

    #[test]
    fn test_function_like_macro() {
        let code = CodeGen::new("x")
            .define("LANE(base,k,width)", "((base)+(k))")
            .to_string();
        assert_eq!(
            code,
            "#define LANE(base,k,width) ((base)+(k))\n\
             x\n\
             #undef LANE\n"
        );
    }
}
