use crate::config::ProjectConfig;
use crate::dirs::PreviewDirs;
use crate::{PreviewError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

/// Stub symbols the host application exposes for dynamic replacement.
const HOST_STUB_SYMBOLS: &[&str] = &["previewBody()"];

/// Immutable output of one application build, shared by every stream of
/// the project.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub app_bundle_path: PathBuf,
    pub executable_path: PathBuf,
    pub bundle_id: String,
    pub module_name: String,
    pub swift_module_dir: PathBuf,
    pub sdk_path: PathBuf,
    pub arch: &'static str,
    pub entry_symbols: Vec<String>,
}

type Settled = Option<std::result::Result<Arc<BuildArtifact>, String>>;

enum Slot {
    InFlight(watch::Receiver<Settled>),
    Ready(Arc<BuildArtifact>),
}

enum Arrival {
    Ready(Arc<BuildArtifact>),
    Wait(watch::Receiver<Settled>),
    Run(watch::Sender<Settled>),
}

/// At most one xcodebuild per project key; concurrent requests coalesce
/// onto the in-flight build. Failures clear the slot so the next request
/// retries.
pub struct BuildCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl BuildCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn build_or_reuse(
        &self,
        config: &ProjectConfig,
        dirs: &PreviewDirs,
        reuse_hint: bool,
    ) -> Result<Arc<BuildArtifact>> {
        let key = config.project_key();
        let config = config.clone();
        let dirs = dirs.clone();
        self.get_or_run(&key, move || async move {
            run_build(&config, &dirs, reuse_hint).await
        })
        .await
    }

    async fn get_or_run<F, Fut>(&self, key: &str, run: F) -> Result<Arc<BuildArtifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BuildArtifact>>,
    {
        let arrival = {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(Slot::Ready(artifact)) => Arrival::Ready(artifact.clone()),
                Some(Slot::InFlight(rx)) => Arrival::Wait(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.to_string(), Slot::InFlight(rx));
                    Arrival::Run(tx)
                }
            }
        };

        match arrival {
            Arrival::Ready(artifact) => Ok(artifact),
            // First arrival runs the build outside the lock and settles
            // the promise for everyone who coalesced onto it.
            Arrival::Run(tx) => {
                let result = run().await;
                let mut slots = self.slots.lock().await;
                match result {
                    Ok(artifact) => {
                        let artifact = Arc::new(artifact);
                        slots.insert(key.to_string(), Slot::Ready(artifact.clone()));
                        let _ = tx.send(Some(Ok(artifact.clone())));
                        Ok(artifact)
                    }
                    Err(err) => {
                        slots.remove(key);
                        let _ = tx.send(Some(Err(err.to_string())));
                        Err(err)
                    }
                }
            }
            Arrival::Wait(mut rx) => loop {
                let settled = rx.borrow().clone();
                match settled {
                    Some(Ok(artifact)) => return Ok(artifact),
                    Some(Err(message)) => return Err(PreviewError::BuildFailed(message)),
                    None => {
                        if rx.changed().await.is_err() {
                            return Err(PreviewError::BuildFailed(
                                "build task dropped without a result".into(),
                            ));
                        }
                    }
                }
            },
        }
    }
}

impl Default for BuildCache {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_build(
    config: &ProjectConfig,
    dirs: &PreviewDirs,
    reuse_hint: bool,
) -> Result<BuildArtifact> {
    dirs.ensure_created()?;

    if reuse_hint {
        if let Ok(artifact) = discover_artifact(config, dirs).await {
            eprintln!(
                "[BuildCache] Reusing build artifacts at {}",
                artifact.app_bundle_path.display()
            );
            return Ok(artifact);
        }
        eprintln!("[BuildCache] No reusable artifacts found, building");
    }

    let (kind_flag, path) = match (&config.project_path, &config.workspace_path) {
        (Some(project), _) => ("-project", project),
        (_, Some(workspace)) => ("-workspace", workspace),
        _ => unreachable!("validated at construction"),
    };

    eprintln!(
        "[BuildCache] Building scheme {} ({})",
        config.scheme,
        config.configuration_or_default()
    );
    let output = Command::new("xcodebuild")
        .arg(kind_flag)
        .arg(path)
        .args(["-scheme", &config.scheme])
        .args(["-configuration", config.configuration_or_default()])
        .args(["-destination", "generic/platform=iOS Simulator"])
        .arg("-derivedDataPath")
        .arg(&dirs.build)
        .arg("ARCHS=arm64")
        .arg("build")
        .output()
        .await
        .map_err(|e| PreviewError::ToolchainMissing(format!("xcodebuild: {}", e)))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PreviewError::BuildFailed(format!(
            "{}\n{}",
            tail_of(&stdout, 40),
            stderr.trim()
        )));
    }

    discover_artifact(config, dirs).await
}

/// Locates the built .app bundle and its metadata under the derived-data
/// products directory.
async fn discover_artifact(config: &ProjectConfig, dirs: &PreviewDirs) -> Result<BuildArtifact> {
    let products = dirs
        .build
        .join("Build")
        .join("Products")
        .join(format!("{}-iphonesimulator", config.configuration_or_default()));
    let app_bundle_path = find_app_bundle(&products)?;

    let plist_json = Command::new("plutil")
        .args(["-convert", "json", "-o", "-"])
        .arg(app_bundle_path.join("Info.plist"))
        .output()
        .await
        .map_err(|e| PreviewError::ToolchainMissing(format!("plutil: {}", e)))?;
    if !plist_json.status.success() {
        return Err(PreviewError::BuildFailed(format!(
            "cannot read Info.plist of {}",
            app_bundle_path.display()
        )));
    }
    let (executable_name, bundle_id) = parse_bundle_plist(&plist_json.stdout, &app_bundle_path)?;

    let sdk = Command::new("xcrun")
        .args(["--sdk", "iphonesimulator", "--show-sdk-path"])
        .output()
        .await
        .map_err(|e| PreviewError::ToolchainMissing(format!("xcrun: {}", e)))?;
    if !sdk.status.success() {
        return Err(PreviewError::ToolchainMissing(
            "cannot resolve the iphonesimulator SDK path".into(),
        ));
    }
    let sdk_path = PathBuf::from(String::from_utf8_lossy(&sdk.stdout).trim().to_string());

    Ok(BuildArtifact {
        executable_path: app_bundle_path.join(&executable_name),
        module_name: executable_name.replace([' ', '-'], "_"),
        bundle_id,
        swift_module_dir: products,
        sdk_path,
        arch: "arm64",
        entry_symbols: HOST_STUB_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        app_bundle_path,
    })
}

fn find_app_bundle(products: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(products).map_err(|_| {
        PreviewError::BuildFailed(format!("no build products at {}", products.display()))
    })?;
    let mut bundles: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "app"))
        .collect();
    bundles.sort();
    bundles.into_iter().next().ok_or_else(|| {
        PreviewError::BuildFailed(format!("no .app bundle under {}", products.display()))
    })
}

fn parse_bundle_plist(json: &[u8], bundle: &Path) -> Result<(String, String)> {
    let plist: serde_json::Value = serde_json::from_slice(json)?;
    let executable = plist
        .get("CFBundleExecutable")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| {
            bundle
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
        })
        .ok_or_else(|| {
            PreviewError::BuildFailed(format!("no executable name for {}", bundle.display()))
        })?;
    let bundle_id = plist
        .get("CFBundleIdentifier")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            PreviewError::BuildFailed(format!("no CFBundleIdentifier in {}", bundle.display()))
        })?
        .to_string();
    Ok((executable, bundle_id))
}

fn tail_of(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn artifact(tag: &str) -> BuildArtifact {
        BuildArtifact {
            app_bundle_path: PathBuf::from(format!("/tmp/{}.app", tag)),
            executable_path: PathBuf::from(format!("/tmp/{0}.app/{0}", tag)),
            bundle_id: format!("com.example.{}", tag),
            module_name: tag.to_string(),
            swift_module_dir: "/tmp".into(),
            sdk_path: "/sdk".into(),
            arch: "arm64",
            entry_symbols: vec!["previewBody()".into()],
        }
    }

    #[tokio::test]
    async fn concurrent_requests_coalesce_onto_one_build() {
        let cache = Arc::new(BuildCache::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let builds = builds.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_run("key", || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(artifact("app"))
                    })
                    .await
            }));
        }
        for task in tasks {
            let artifact = task.await.unwrap().unwrap();
            assert_eq!(artifact.bundle_id, "com.example.app");
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_sticky() {
        let cache = BuildCache::new();
        let err = cache
            .get_or_run("key", || async {
                Err(PreviewError::BuildFailed("ld: undefined symbol".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::BuildFailed(_)));

        // The slot was cleared; a second request runs again and succeeds.
        let artifact = cache
            .get_or_run("key", || async { Ok(artifact("retry")) })
            .await
            .unwrap();
        assert_eq!(artifact.bundle_id, "com.example.retry");
    }

    #[tokio::test]
    async fn ready_artifact_is_returned_without_rebuilding() {
        let cache = BuildCache::new();
        let builds = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let builds = builds.clone();
            cache
                .get_or_run("key", || async move {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(artifact("app"))
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_build_independently() {
        let cache = BuildCache::new();
        let a = cache
            .get_or_run("a", || async { Ok(artifact("a")) })
            .await
            .unwrap();
        let b = cache
            .get_or_run("b", || async { Ok(artifact("b")) })
            .await
            .unwrap();
        assert_ne!(a.bundle_id, b.bundle_id);
    }

    #[test]
    fn find_app_bundle_picks_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("MyApp.app")).unwrap();
        std::fs::create_dir(dir.path().join("MyApp.swiftmodule")).unwrap();
        let found = find_app_bundle(dir.path()).unwrap();
        assert!(found.ends_with("MyApp.app"));

        let empty = tempfile::tempdir().unwrap();
        assert!(find_app_bundle(empty.path()).is_err());
    }

    #[test]
    fn parse_bundle_plist_reads_keys() {
        let json = br#"{"CFBundleExecutable":"MyApp","CFBundleIdentifier":"com.example.MyApp"}"#;
        let (exe, id) = parse_bundle_plist(json, Path::new("/x/MyApp.app")).unwrap();
        assert_eq!(exe, "MyApp");
        assert_eq!(id, "com.example.MyApp");

        // Executable falls back to the bundle stem.
        let json = br#"{"CFBundleIdentifier":"com.example.MyApp"}"#;
        let (exe, _) = parse_bundle_plist(json, Path::new("/x/MyApp.app")).unwrap();
        assert_eq!(exe, "MyApp");
    }

    #[test]
    fn tail_of_keeps_last_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail_of(text, 2), "c\nd");
        assert_eq!(tail_of(text, 10), text);
    }
}
