//! Where a run reads and writes its files.
//!
//! ```text
//! <root>/testset/<release>.{csv,xlsx,xls}
//! <root>/plots/<model>/<release>/<index>.png
//! <root>/result/<model>/<scenario>_<release>.json
//! <root>/result/<model>/<scenario>_<release>/units/<index>.json
//! <root>/result/<model>/<scenario>_<release>_eval_all.json
//! ```

use std::path::{Path, PathBuf};

/// Test-set extensions, in lookup order.
const TESTSET_EXTENSIONS: [&str; 3] = ["csv", "xlsx", "xls"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
    model_dir: String,
    scenario: String,
    release: String,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>, model: &str, scenario: &str, release: &str) -> Self {
        Self {
            root: root.into(),
            model_dir: path_component(model),
            scenario: path_component(scenario),
            release: path_component(release),
        }
    }

    /// Directory that dataset paths in the test set are relative to.
    pub fn testset_dir(&self) -> PathBuf {
        self.root.join("testset")
    }

    /// The first existing `<release>.<ext>`; the CSV path when none exists.
    pub fn testset(&self) -> PathBuf {
        let dir = self.testset_dir();
        TESTSET_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", self.release, ext)))
            .find(|path| path.is_file())
            .unwrap_or_else(|| dir.join(format!("{}.csv", self.release)))
    }

    pub fn plot_dir(&self) -> PathBuf {
        self.root
            .join("plots")
            .join(&self.model_dir)
            .join(&self.release)
    }

    fn result_dir(&self) -> PathBuf {
        self.root.join("result").join(&self.model_dir)
    }

    fn stem(&self) -> String {
        format!("{}_{}", self.scenario, self.release)
    }

    pub fn batch_file(&self) -> PathBuf {
        self.result_dir().join(format!("{}.json", self.stem()))
    }

    pub fn unit_dir(&self) -> PathBuf {
        self.result_dir().join(self.stem()).join("units")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.result_dir()
            .join(format!("{}_eval_all.json", self.stem()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Model names such as `Qwen/Qwen2.5-72B` become one path component.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
