// 错题库本地存储：单个 JSON 文件保存完整题目数组
// - 文件缺失或空数组 → 返回内置种子题
// - 读取/解析失败 → 返回种子题并附带非致命警告（UI 显示横幅）
// - 每次变更整体覆写，最后写入者胜出

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(rename = "questionText", default)]
    pub question_text: String,
}

fn default_subject() -> String {
    "未知科目".into()
}

/// 新题目的唯一 id，每次提取都重新生成
pub fn new_question_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 内置种子题：首次运行时的示例错题（数学/物理/化学各一道）
pub fn default_bank() -> Vec<Question> {
    vec![
        Question {
            id: "default-1".into(),
            subject: "数学".into(),
            question_text: "已知函数 $f(x) = \\sin(\\omega x + \\phi)$ ($\\omega > 0, |\\phi| < \\pi/2$) 的图像相邻两条对称轴之间的距离为 $\\pi/2$，且 $f(\\pi/6) = 1$。求 $f(x)$ 的解析式。".into(),
        },
        Question {
            id: "default-2".into(),
            subject: "物理".into(),
            question_text: "一个质量为 2kg 的物体，在水平拉力 F 的作用下，从静止开始沿粗糙水平面做匀加速直线运动。经过 3s，物体的速度达到 6m/s。已知物体与水平面间的动摩擦因数为 0.2，$g=10m/s^2$。求拉力 F 的大小。".into(),
        },
        Question {
            id: "default-3".into(),
            subject: "化学".into(),
            question_text: "将 23g 钠投入到 100g 水中，完全反应后，所得溶液的溶质质量分数是多少？（Na=23, H=1, O=16）".into(),
        },
    ]
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub bank: Vec<Question>,
    /// 解析失败时的用户可见警告；正常路径为 None
    pub warning: Option<String>,
}

#[derive(Debug)]
pub struct BankStore {
    path: PathBuf,
}

impl BankStore {
    pub fn open(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> LoadOutcome {
        if !self.path.exists() {
            return LoadOutcome {
                bank: default_bank(),
                warning: None,
            };
        }
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("读取错题库失败: {}: {}", self.path.display(), e);
                return LoadOutcome {
                    bank: default_bank(),
                    warning: Some("无法从本地加载错题库。".into()),
                };
            }
        };
        match serde_json::from_str::<Vec<Question>>(&s) {
            Ok(bank) if !bank.is_empty() => LoadOutcome {
                bank,
                warning: None,
            },
            // 空数组视为首次运行，回落到种子题，不算错误
            Ok(_) => LoadOutcome {
                bank: default_bank(),
                warning: None,
            },
            Err(e) => {
                tracing::warn!("解析错题库 JSON 失败: {}: {}", self.path.display(), e);
                LoadOutcome {
                    bank: default_bank(),
                    warning: Some("无法从本地加载错题库。".into()),
                }
            }
        }
    }

    pub fn save(&self, bank: &[Question]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let s = serde_json::to_string_pretty(bank)?;
        fs::write(&self.path, s)
            .with_context(|| format!("写入错题库失败: {}", self.path.display()))?;
        Ok(())
    }
}

/// 数据文件路径：--file 参数 > 环境变量 CUOTIBEN_DATA > 平台数据目录
pub fn resolve_data_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(p) = flag {
        return p;
    }
    if let Ok(envp) = std::env::var("CUOTIBEN_DATA") {
        return PathBuf::from(envp);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cuotiben")
        .join("bank.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir, name: &str) -> BankStore {
        BankStore::open(dir.path().join(name))
    }

    #[test]
    fn missing_file_yields_seed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = store_in(&dir, "bank.json").load();
        assert!(out.warning.is_none());
        let subjects: Vec<&str> = out.bank.iter().map(|q| q.subject.as_str()).collect();
        assert_eq!(subjects, ["数学", "物理", "化学"]);
        assert_eq!(out.bank[0].id, "default-1");
    }

    #[test]
    fn corrupt_json_yields_seed_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.json");
        fs::write(&path, "{ not valid json").unwrap();
        let out = BankStore::open(path).load();
        assert_eq!(out.bank, default_bank());
        assert_eq!(out.warning.as_deref(), Some("无法从本地加载错题库。"));
    }

    #[test]
    fn empty_array_yields_seed_without_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.json");
        fs::write(&path, "[]").unwrap();
        let out = BankStore::open(path).load();
        assert_eq!(out.bank, default_bank());
        assert!(out.warning.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, "nested/bank.json");
        let bank = vec![
            Question {
                id: new_question_id(),
                subject: "数学".into(),
                question_text: "解方程 $2x = 4$。".into(),
            },
            Question {
                id: new_question_id(),
                subject: "物理".into(),
                question_text: "画出受力分析图。".into(),
            },
        ];
        store.save(&bank).unwrap();
        let out = store.load();
        assert!(out.warning.is_none());
        assert_eq!(out.bank, bank);
    }

    #[test]
    fn persisted_layout_is_camel_case_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir, "bank.json");
        let bank = vec![Question {
            id: "q-1".into(),
            subject: "化学".into(),
            question_text: "配平方程式。".into(),
        }];
        store.save(&bank).unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v[0]["questionText"], "配平方程式。");
        assert!(v[0].get("question_text").is_none());
    }
}
