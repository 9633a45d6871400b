use std::path::{Path, PathBuf};
use std::str::FromStr;

/// path to an existing regular file that gets uploaded to the swarm.
#[derive(Debug, Clone)]
pub struct SourceFilePath(PathBuf);

impl SourceFilePath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, anyhow::Error> {
        let path: PathBuf = path.into();

        if !path.is_file() {
            anyhow::bail!("could not find file at {}", path.display());
        }

        Ok(SourceFilePath(path))
    }
}

impl FromStr for SourceFilePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(PathBuf::from(s))
    }
}

impl AsRef<Path> for SourceFilePath {
    fn as_ref(&self) -> &Path {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_existing_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("shardfetch-source-{}", std::process::id()));
        std::fs::write(&path, b"source")?;

        let parsed = path.to_string_lossy().parse::<SourceFilePath>();
        std::fs::remove_file(&path)?;

        assert_eq!(parsed?.as_ref(), path.as_path());
        Ok(())
    }

    #[rstest]
    #[case("/definitely/not/a/file")]
    #[case("/")]
    fn test_rejects_missing_or_directory(#[case] path: &str) {
        assert!(path.parse::<SourceFilePath>().is_err());
    }
}
