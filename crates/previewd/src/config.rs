use crate::{PreviewError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Project coordinates for the xcodebuild invocation. Exactly one of
/// `project_path` / `workspace_path` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub project_path: Option<PathBuf>,
    pub workspace_path: Option<PathBuf>,
    pub scheme: String,
    pub configuration: Option<String>,
}

impl ProjectConfig {
    pub fn new(
        project: Option<PathBuf>,
        workspace: Option<PathBuf>,
        scheme: String,
        configuration: Option<String>,
    ) -> Result<Self> {
        if project.is_some() && workspace.is_some() {
            return Err(PreviewError::ConfigInvalid(
                "project and workspace are mutually exclusive".into(),
            ));
        }
        if project.is_none() && workspace.is_none() {
            return Err(PreviewError::ConfigInvalid(
                "either a project or a workspace is required (flag or PROJECT/WORKSPACE in .axerc)"
                    .into(),
            ));
        }
        if scheme.is_empty() {
            return Err(PreviewError::ConfigInvalid(
                "a scheme is required (flag or SCHEME in .axerc)".into(),
            ));
        }
        Ok(Self {
            project_path: project,
            workspace_path: workspace,
            scheme,
            configuration,
        })
    }

    /// Whichever of project/workspace is set.
    pub fn primary_path(&self) -> &Path {
        self.project_path
            .as_deref()
            .or(self.workspace_path.as_deref())
            .expect("validated at construction")
    }

    pub fn configuration_or_default(&self) -> &str {
        self.configuration.as_deref().unwrap_or("Debug")
    }

    /// Cache partition key: (project|workspace, scheme, configuration).
    pub fn project_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.primary_path().display(),
            self.scheme,
            self.configuration_or_default()
        )
    }
}

/// Reads `.axerc` from `dir`. Key/value lines (`KEY=VALUE`); `#` comments
/// and blank lines are skipped. A missing file yields an empty map.
pub fn read_rc(dir: &Path) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let contents = match fs::read_to_string(dir.join(".axerc")) {
        Ok(c) => c,
        Err(_) => return values,
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_project_and_workspace_together() {
        let err = ProjectConfig::new(
            Some("/a/App.xcodeproj".into()),
            Some("/a/App.xcworkspace".into()),
            "App".into(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PreviewError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_missing_scheme() {
        let err =
            ProjectConfig::new(Some("/a/App.xcodeproj".into()), None, String::new(), None)
                .unwrap_err();
        assert!(matches!(err, PreviewError::ConfigInvalid(_)));
    }

    #[test]
    fn project_key_includes_configuration_default() {
        let pc = ProjectConfig::new(Some("/a/App.xcodeproj".into()), None, "App".into(), None)
            .unwrap();
        assert_eq!(pc.project_key(), "/a/App.xcodeproj|App|Debug");

        let release = ProjectConfig::new(
            Some("/a/App.xcodeproj".into()),
            None,
            "App".into(),
            Some("Release".into()),
        )
        .unwrap();
        assert_ne!(pc.project_key(), release.project_key());
    }

    #[test]
    fn reads_rc_skipping_comments() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".axerc"),
            "# build settings\nSCHEME=MyApp\nWORKSPACE = MyApp.xcworkspace\n\nDEVICE=ABCD-1234\n",
        )
        .unwrap();

        let rc = read_rc(dir.path());
        assert_eq!(rc.get("SCHEME").map(String::as_str), Some("MyApp"));
        assert_eq!(
            rc.get("WORKSPACE").map(String::as_str),
            Some("MyApp.xcworkspace")
        );
        assert_eq!(rc.get("DEVICE").map(String::as_str), Some("ABCD-1234"));
        assert!(!rc.contains_key("# build settings"));
    }

    #[test]
    fn missing_rc_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_rc(dir.path()).is_empty());
    }
}
