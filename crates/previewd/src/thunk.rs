use crate::build_cache::BuildArtifact;
use crate::dirs::PreviewDirs;
use crate::{PreviewError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

/// Host type that declares the replaceable preview stub.
const HOST_STUB_TYPE: &str = "PreviewHost";

/// One staged-and-published thunk dylib.
#[derive(Debug, Clone)]
pub struct InjectionRecord {
    pub thunk_dylib_path: PathBuf,
    pub staged_at: DateTime<Utc>,
}

pub enum CompileOutcome {
    Done(InjectionRecord),
    Cancelled,
}

/// Hands out cancellation tokens for rebuilds; beginning a new rebuild
/// invalidates every token from earlier generations.
pub struct RebuildGate {
    tx: watch::Sender<u64>,
    generation: u64,
}

impl RebuildGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx, generation: 0 }
    }

    pub fn begin(&mut self) -> CancelToken {
        self.generation += 1;
        let _ = self.tx.send(self.generation);
        CancelToken {
            rx: self.tx.subscribe(),
            generation: self.generation,
        }
    }

    /// Invalidates all outstanding tokens without starting a new rebuild.
    pub fn cancel_all(&mut self) {
        self.generation += 1;
        let _ = self.tx.send(self.generation);
    }
}

impl Default for RebuildGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<u64>,
    generation: u64,
}

impl CancelToken {
    /// Resolves once a newer rebuild has superseded this one.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() != self.generation {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Gate dropped: nothing will ever cancel us.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Compiles preview bodies into dylibs and publishes them atomically at
/// `thunk/current.dylib` for the host-side loader to pick up.
pub struct ThunkCompiler {
    dirs: PreviewDirs,
    artifact: Arc<BuildArtifact>,
    seq: AtomicU64,
}

impl ThunkCompiler {
    pub fn new(dirs: PreviewDirs, artifact: Arc<BuildArtifact>) -> Self {
        Self {
            dirs,
            artifact,
            seq: AtomicU64::new(0),
        }
    }

    /// Generates, compiles, and publishes one thunk. Cancellation kills
    /// the compiler and removes staging partials; `current.dylib` is only
    /// ever touched by the final atomic rename.
    pub async fn compile(
        &self,
        body_text: &str,
        mut cancel: CancelToken,
    ) -> Result<CompileOutcome> {
        self.dirs.ensure_created()?;
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let source_path = self.dirs.staging.join(format!("thunk-{}.swift", n));
        let dylib_path = self.dirs.staging.join(format!("thunk-{}.dylib", n));

        let stub = self
            .artifact
            .entry_symbols
            .first()
            .map(String::as_str)
            .unwrap_or("previewBody()");
        std::fs::write(
            &source_path,
            generate_thunk(body_text, &self.artifact.module_name, stub),
        )?;

        let mut child = Command::new("xcrun")
            .arg("swiftc")
            .arg("-sdk")
            .arg(&self.artifact.sdk_path)
            .args(["-target", "arm64-apple-ios15.0-simulator"])
            .arg("-emit-library")
            .args(["-module-name", "PreviewThunk"])
            .arg("-I")
            .arg(&self.artifact.swift_module_dir)
            .arg("-F")
            .arg(&self.artifact.swift_module_dir)
            .args(["-Xlinker", "-undefined", "-Xlinker", "dynamic_lookup"])
            .arg("-o")
            .arg(&dylib_path)
            .arg(&source_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PreviewError::ToolchainMissing(format!("xcrun swiftc: {}", e)))?;

        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let diagnostics = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                let stderr = diagnostics.await.unwrap_or_default();
                if !status.success() {
                    let _ = std::fs::remove_file(&dylib_path);
                    let _ = std::fs::remove_file(&source_path);
                    return Err(PreviewError::CompileError {
                        diagnostic: stderr.trim().to_string(),
                    });
                }
                let _ = std::fs::remove_file(&source_path);
                let record = self.publish(&dylib_path)?;
                Ok(CompileOutcome::Done(record))
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                diagnostics.abort();
                let _ = std::fs::remove_file(&dylib_path);
                let _ = std::fs::remove_file(&source_path);
                Ok(CompileOutcome::Cancelled)
            }
        }
    }

    /// Atomic stage→current swap; staging and thunk share a filesystem so
    /// the loader never observes a partial file.
    fn publish(&self, staged: &Path) -> Result<InjectionRecord> {
        let current = self.dirs.current_dylib();
        std::fs::rename(staged, &current)?;
        Ok(InjectionRecord {
            thunk_dylib_path: current,
            staged_at: Utc::now(),
        })
    }
}

/// Swift source that dynamically replaces the host's preview stub with
/// the selected preview body.
pub fn generate_thunk(body_text: &str, module_name: &str, stub_symbol: &str) -> String {
    let mut body = String::new();
    for line in body_text.lines() {
        body.push_str("            ");
        body.push_str(line);
        body.push('\n');
    }
    format!(
        "import SwiftUI\nimport {module}\n\n\
         extension {host} {{\n\
         \x20   @_dynamicReplacement(for: {stub})\n\
         \x20   func __previewd_replacement() -> AnyView {{\n\
         \x20       AnyView(\n\
         {body}\
         \x20       )\n\
         \x20   }}\n\
         }}\n",
        module = module_name,
        host = HOST_STUB_TYPE,
        stub = stub_symbol,
        body = body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn thunk_source_declares_dynamic_replacement() {
        let source = generate_thunk("ContentView()\n    .padding()", "MyApp", "previewBody()");
        assert!(source.contains("import SwiftUI"));
        assert!(source.contains("import MyApp"));
        assert!(source.contains("@_dynamicReplacement(for: previewBody())"));
        assert!(source.contains("ContentView()"));
        assert!(source.contains(".padding()"));
        assert!(source.contains("extension PreviewHost"));
    }

    #[tokio::test]
    async fn newer_generation_cancels_older_token() {
        let mut gate = RebuildGate::new();
        let mut first = gate.begin();
        let mut second = gate.begin();

        // The superseded token resolves immediately.
        tokio::time::timeout(Duration::from_secs(1), first.cancelled())
            .await
            .expect("first token should be cancelled");

        // The current token stays pending.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), second.cancelled())
                .await
                .is_err()
        );

        gate.cancel_all();
        tokio::time::timeout(Duration::from_secs(1), second.cancelled())
            .await
            .expect("cancel_all should cancel the current token");
    }

    #[test]
    fn publish_renames_into_current() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        let session = root.join("devices").join("UDID");
        let dirs = PreviewDirs {
            build: root.join("build"),
            thunk: session.join("thunk"),
            loader: session.join("loader"),
            staging: session.join("staging"),
            socket: root.join("s.sock"),
            session,
            root,
        };
        dirs.ensure_created().unwrap();

        let compiler = ThunkCompiler::new(
            dirs.clone(),
            Arc::new(BuildArtifact {
                app_bundle_path: "/x/App.app".into(),
                executable_path: "/x/App.app/App".into(),
                bundle_id: "com.example.App".into(),
                module_name: "App".into(),
                swift_module_dir: "/x".into(),
                sdk_path: "/sdk".into(),
                arch: "arm64",
                entry_symbols: vec!["previewBody()".into()],
            }),
        );

        let staged = dirs.staging.join("thunk-0.dylib");
        std::fs::write(&staged, b"dylib-bytes").unwrap();
        let record = compiler.publish(&staged).unwrap();

        assert_eq!(record.thunk_dylib_path, dirs.current_dylib());
        assert_eq!(
            std::fs::read(dirs.current_dylib()).unwrap(),
            b"dylib-bytes"
        );
        assert!(!staged.exists());

        // A second publish replaces the first.
        let staged2 = dirs.staging.join("thunk-1.dylib");
        std::fs::write(&staged2, b"newer-bytes").unwrap();
        compiler.publish(&staged2).unwrap();
        assert_eq!(std::fs::read(dirs.current_dylib()).unwrap(), b"newer-bytes");
    }
}
