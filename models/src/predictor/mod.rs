use crate::{parse_failed, predictor_invalid, ConfigError};
use serde::Deserialize;
use serde_json::Value;

/// 从规模特征预测每个变体的开销。
pub trait Predictor: Send + Sync {
    /// 返回的开销与模型中模板的顺序一一对应。
    fn predict(&self, x: &[usize]) -> Vec<f32>;
    /// 每次预测输出的开销个数。
    fn width(&self) -> usize;
}

/// 回归树的数组表示，叶子的 `children_left` 为 -1。
#[derive(Clone, Deserialize, Debug)]
struct Tree {
    children_left: Vec<i64>,
    children_right: Vec<i64>,
    feature: Vec<i64>,
    threshold: Vec<f64>,
    value: Vec<Vec<f32>>,
}

#[derive(Deserialize)]
struct Document {
    estimators: Vec<Tree>,
}

/// 随机森林，预测值是各棵树叶子值的平均。
#[derive(Clone, Debug)]
pub struct RandomForest {
    trees: Vec<Tree>,
    width: usize,
}

impl RandomForest {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let doc = Document::deserialize(value)
            .map_err(|e| parse_failed(format!("random forest: {e}")))?;
        Self::new(doc.estimators)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let value = serde_json::from_str::<Value>(s)
            .map_err(|e| parse_failed(format!("random forest: {e}")))?;
        Self::from_value(&value)
    }

    fn new(trees: Vec<Tree>) -> Result<Self, ConfigError> {
        let Some(first) = trees.first() else {
            return Err(predictor_invalid("random forest without estimators"));
        };
        let width = first.value.first().map_or(0, Vec::len);
        if width == 0 {
            return Err(predictor_invalid("random forest predicts nothing"));
        }
        for (i, tree) in trees.iter().enumerate() {
            tree.check(width)
                .map_err(|info| predictor_invalid(format!("tree {i}: {info}")))?
        }
        Ok(Self { trees, width })
    }
}

impl Tree {
    fn check(&self, width: usize) -> Result<(), String> {
        let n = self.children_left.len();
        if n == 0 {
            return Err("empty tree".into());
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err("arrays of different lengths".into());
        }
        for node in 0..n {
            if self.value[node].len() != width {
                return Err(format!("node {node} predicts {} values", self.value[node].len()));
            }
            let left = self.children_left[node];
            if left == -1 {
                continue;
            }
            let right = self.children_right[node];
            let in_range = |child: i64| child > node as i64 && (child as usize) < n;
            if !in_range(left) || !in_range(right) {
                return Err(format!("node {node} has children {left} and {right}"));
            }
            if self.feature[node] < 0 {
                return Err(format!("node {node} splits on feature {}", self.feature[node]));
            }
        }
        Ok(())
    }

    fn leaf(&self, x: &[usize]) -> &[f32] {
        let mut node = 0;
        while self.children_left[node] != -1 {
            let f = self.feature[node] as usize;
            let v = x.get(f).map_or(0., |&v| v as f64);
            let child = if v <= self.threshold[node] {
                self.children_left[node]
            } else {
                self.children_right[node]
            };
            node = child as usize
        }
        &self.value[node]
    }
}

impl Predictor for RandomForest {
    fn predict(&self, x: &[usize]) -> Vec<f32> {
        let mut ans = vec![0.; self.width];
        for tree in &self.trees {
            for (a, v) in ans.iter_mut().zip(tree.leaf(x)) {
                *a += v
            }
        }
        let n = self.trees.len() as f32;
        ans.iter_mut().for_each(|a| *a /= n);
        ans
    }

    #[inline]
    fn width(&self) -> usize {
        self.width
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Predictor, RandomForest};
    use crate::ConfigErrorKind;

    /// 长度不超过 1000 时变体 0 更快，否则变体 1 更快。
    pub(crate) const FOREST: &str = r#"{
        "estimators": [
            {
                "children_left":  [1, -1, -1],
                "children_right": [2, -1, -1],
                "feature":        [0, -2, -2],
                "threshold":      [1000.0, -2.0, -2.0],
                "value":          [[0.0, 0.0], [1.0, 2.0], [4.0, 3.0]]
            },
            {
                "children_left":  [-1],
                "children_right": [-1],
                "feature":        [-2],
                "threshold":      [-2.0],
                "value":          [[1.0, 1.5]]
            }
        ]
    }"#;

    #[test]
    fn test_predict() {
        let forest = RandomForest::from_str(FOREST).unwrap();
        assert_eq!(forest.width(), 2);
        assert_eq!(forest.predict(&[64]), [1.0, 1.75]);
        assert_eq!(forest.predict(&[4096]), [2.5, 2.25]);
        // 缺失的特征按 0 处理
        assert_eq!(forest.predict(&[]), [1.0, 1.75]);
    }

    #[test]
    fn test_malformed() {
        let e = RandomForest::from_str(r#"{"estimators": []}"#).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::PredictorInvalid);

        let bad = FOREST.replace("[1, -1, -1]", "[3, -1, -1]");
        let e = RandomForest::from_str(&bad).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::PredictorInvalid);

        let bad = FOREST.replace("[[1.0, 1.5]]", "[[1.0]]");
        let e = RandomForest::from_str(&bad).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::PredictorInvalid);

        let e = RandomForest::from_str(r#"{"trees": []}"#).unwrap_err();
        assert_eq!(e.kind, ConfigErrorKind::Parse);
    }
}
