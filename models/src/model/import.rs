//! 持久化模型文件的解析和模板工厂。

use super::Model;
use crate::{
    invalid_parameter, maxpy::Maxpy, mproduct::MProduct, mreduction::MReduction, parse_failed,
    predictor_invalid, reduction::Reduction, vaxpy::Vaxpy, ConfigError, Hardware, NumericType,
    OperationKind, Predictor, RandomForest, Template,
};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Deserialize)]
struct Entry {
    profiles: Vec<Vec<i64>>,
    #[serde(default)]
    predictor: Option<Value>,
}

/// 算子名 -> 类型名 -> 条目。
type Document = BTreeMap<String, BTreeMap<String, Entry>>;

/// 按算子类型把参数表交给对应模板的构造函数。
pub(super) fn create<H: Hardware>(
    kind: OperationKind,
    profile: &[i64],
) -> Result<Box<dyn Template<H>>, ConfigError> {
    use OperationKind as K;
    Ok(match kind {
        K::ScalarAxpy | K::VectorAxpy => Box::new(Vaxpy::from_profile(profile)?),
        K::Reduction => Box::new(Reduction::from_profile(profile)?),
        K::MatrixAxpy => Box::new(Maxpy::from_profile(profile)?),
        K::RowWiseReduction => Box::new(MReduction::from_profile(false, profile)?),
        K::ColWiseReduction => Box::new(MReduction::from_profile(true, profile)?),
        K::MatrixProductNN => Box::new(MProduct::from_profile((false, false), profile)?),
        K::MatrixProductNT => Box::new(MProduct::from_profile((false, true), profile)?),
        K::MatrixProductTN => Box::new(MProduct::from_profile((true, false), profile)?),
        K::MatrixProductTT => Box::new(MProduct::from_profile((true, true), profile)?),
    })
}

/// 解析整个文档，任何一个条目出错则整体失败。
pub(super) fn parse<H: Hardware>(
    s: &str,
) -> Result<Vec<((OperationKind, NumericType), Model<H>)>, ConfigError> {
    let doc = serde_json::from_str::<Document>(s)
        .map_err(|e| parse_failed(format!("model file: {e}")))?;

    let mut ans = Vec::new();
    for (op, types) in doc {
        let kind = OperationKind::from_name(&op)?;
        for (ty, entry) in types {
            let dt = NumericType::from_name(&ty)?;
            let model = entry.build(kind).map_err(|e| ConfigError {
                info: format!("{op}/{ty}: {}", e.info),
                ..e
            })?;
            ans.push(((kind, dt), model))
        }
    }
    Ok(ans)
}

impl Entry {
    fn build<H: Hardware>(self, kind: OperationKind) -> Result<Model<H>, ConfigError> {
        let templates = self
            .profiles
            .iter()
            .map(|profile| create(kind, profile))
            .collect::<Result<Vec<_>, _>>()?;
        match templates.len() {
            0 => Err(invalid_parameter("no profiles")),
            1 => Ok(Model::new(templates)),
            n => {
                let Some(value) = &self.predictor else {
                    return Err(predictor_invalid(format!("{n} profiles without a predictor")));
                };
                let forest = RandomForest::from_value(value)?;
                if forest.width() != n {
                    return Err(predictor_invalid(format!(
                        "predictor of width {} for {n} profiles",
                        forest.width()
                    )));
                }
                Ok(Model::with_predictor(templates, Arc::new(forest)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{create, parse};
    use crate::{
        predictor::test::FOREST, recorder::Recorder, ConfigErrorKind, NumericType,
        OperationKind,
    };

    #[test]
    fn test_create() {
        use OperationKind as K;
        let product = [1, 8, 8, 8, 4, 1, 4, 0, 0, 8, 8];
        for kind in K::ALL {
            let profile: &[i64] = match kind {
                K::ScalarAxpy | K::VectorAxpy | K::Reduction => &[1, 64, 128, 1],
                K::MatrixAxpy => &[1, 8, 8, 8, 8, 1],
                K::RowWiseReduction | K::ColWiseReduction => &[1, 8, 8, 16, 1],
                _ => &product,
            };
            assert!(create::<Recorder>(kind, profile).is_ok(), "{kind:?}");
            let e = create::<Recorder>(kind, &profile[1..]).err().unwrap();
            assert_eq!(e.kind, ConfigErrorKind::ArgsMismatch, "{kind:?}");
        }
        let e = create::<Recorder>(K::VectorAxpy, &[1, 64, 128, 3]).err().unwrap();
        assert_eq!(e.kind, ConfigErrorKind::InvalidFetch);
    }

    #[test]
    fn test_parse() {
        let doc = format!(
            r#"{{
                "dot": {{
                    "float32": {{ "profiles": [[1, 64, 128, 1], [1, 32, 64, 0]], "predictor": {FOREST} }},
                    "float64": {{ "profiles": [[1, 64, 128, 1]] }}
                }},
                "gemmTN": {{
                    "float32": {{ "profiles": [[1, 8, 8, 8, 4, 1, 4, 0, 0, 8, 8]] }}
                }}
            }}"#
        );
        let models = parse::<Recorder>(&doc).unwrap();
        assert_eq!(models.len(), 3);

        let (key, model) = &models[0];
        assert_eq!(*key, (OperationKind::Reduction, NumericType::F32));
        assert_eq!(model.templates().len(), 2);
        assert!(model.predictor().is_some());

        let (key, model) = &models[1];
        assert_eq!(*key, (OperationKind::Reduction, NumericType::F64));
        assert_eq!(model.templates().len(), 1);
        assert!(model.predictor().is_none());

        assert_eq!(models[2].0 .0, OperationKind::MatrixProductTN);
    }

    #[test]
    fn test_errors() {
        let cases = [
            (r#"{"axpy": {"float32": {"profiles": [[1, 64, 128, 1]]}}}"#, ConfigErrorKind::UnknownOperation),
            (r#"{"dot": {"int32": {"profiles": [[1, 64, 128, 1]]}}}"#, ConfigErrorKind::UnknownType),
            (r#"{"dot": {"float32": {"profiles": []}}}"#, ConfigErrorKind::InvalidParameter),
            (r#"{"dot": {"float32": {"profiles": [[1, 64, 128, 1], [1, 32, 64, 0]]}}}"#, ConfigErrorKind::PredictorInvalid),
            (r#"{"dot": {"float32": {"profiles": [[1, 64, 128]]}}}"#, ConfigErrorKind::ArgsMismatch),
            (r#"{"dot": {"float32": {"profile": [[1, 64, 128, 1]]}}}"#, ConfigErrorKind::Parse),
            (r#"{"dot": "#, ConfigErrorKind::Parse),
        ];
        for (doc, kind) in cases {
            let e = parse::<Recorder>(doc).err().unwrap();
            assert_eq!(e.kind, kind, "{doc}");
        }

        // 三个模板配两列的预测器
        let doc = format!(
            r#"{{"dot": {{"float32": {{"profiles": [[1, 64, 128, 1], [1, 32, 64, 0], [1, 16, 32, 2]], "predictor": {FOREST}}}}}}}"#
        );
        let e = parse::<Recorder>(&doc).err().unwrap();
        assert_eq!(e.kind, ConfigErrorKind::PredictorInvalid);
        assert!(e.info.starts_with("dot/float32: "));
    }
}
