use std::path::{Path, PathBuf};

/// The file layout of a model directory.
///
/// ```text
/// <root>/model_description.json
/// <root>/train/train_config.json
/// <root>/train/s-train_data.json
/// <root>/train/r-train_data.json
/// <root>/Saved_<version>/
/// ```
#[derive(Debug, Clone)]
pub struct ModelPaths {
    root: PathBuf,
}

impl ModelPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn description(&self) -> PathBuf {
        self.root.join("model_description.json")
    }

    pub fn train_config(&self) -> PathBuf {
        self.root.join("train").join("train_config.json")
    }

    pub fn supervised_data(&self) -> PathBuf {
        self.root.join("train").join("s-train_data.json")
    }

    pub fn reward_data(&self) -> PathBuf {
        self.root.join("train").join("r-train_data.json")
    }

    /// The directory of a versioned snapshot.
    pub fn snapshot(&self, version: &str) -> PathBuf {
        self.root.join(format!("Saved_{version}"))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::ModelPaths;

    #[test]
    fn paths_follow_the_model_directory_convention() {
        let paths = ModelPaths::new("models/cartpole");

        assert_eq!(paths.description(), Path::new("models/cartpole/model_description.json"));
        assert_eq!(paths.reward_data(), Path::new("models/cartpole/train/r-train_data.json"));
        assert_eq!(paths.snapshot("3"), Path::new("models/cartpole/Saved_3"));
    }
}
