use crate::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const SIMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// A simulator inside the previewd device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedSimulator {
    pub udid: String,
    pub name: String,
    pub state: String,
    #[serde(default, rename = "deviceTypeIdentifier")]
    pub device_type: String,
    #[serde(skip_deserializing)]
    pub runtime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailableRuntime {
    pub identifier: String,
    pub name: String,
}

/// A device type together with the runtimes that can host it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailableDeviceType {
    pub identifier: String,
    pub name: String,
    pub runtimes: Vec<AvailableRuntime>,
}

/// Runs `xcrun simctl <args>` with the standard 30 s control timeout.
/// Children die with their future so a cancelled stream leaves no
/// orphaned simctl behind.
async fn simctl(args: &[&str]) -> Result<std::process::Output> {
    let mut cmd = Command::new("xcrun");
    cmd.arg("simctl").args(args).kill_on_drop(true);
    let output = timeout(SIMCTL_TIMEOUT, cmd.output())
        .await
        .map_err(|_| {
            PreviewError::Simctl(format!("simctl {} timed out after 30s", args.join(" ")))
        })?
        .map_err(|e| PreviewError::ToolchainMissing(format!("xcrun: {}", e)))?;
    Ok(output)
}

fn simctl_failure(context: &str, output: &std::process::Output) -> PreviewError {
    PreviewError::Simctl(format!(
        "{}: {}",
        context,
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// Root of previewd's isolated device set, created on first use.
pub fn device_set_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| PreviewError::ConfigInvalid("HOME is not set".into()))?;
    let path = home
        .join("Library")
        .join("Developer")
        .join("previewd")
        .join("Simulator Devices");
    fs::create_dir_all(&path)?;
    Ok(path)
}

fn config_store_path() -> Result<PathBuf> {
    Ok(device_set_path()?
        .parent()
        .expect("device set has a parent")
        .join("config.json"))
}

/// Persisted default-simulator choice.
pub fn get_default() -> Result<Option<String>> {
    let path = config_store_path()?;
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return Ok(None),
    };
    let value: serde_json::Value = serde_json::from_str(&contents)?;
    Ok(value
        .get("defaultSimulator")
        .and_then(|v| v.as_str())
        .map(String::from))
}

pub fn set_default(udid: &str) -> Result<()> {
    let path = config_store_path()?;
    fs::write(
        &path,
        serde_json::to_string_pretty(&serde_json::json!({ "defaultSimulator": udid }))?,
    )?;
    Ok(())
}

/// All devices in the isolated set, name-sorted for stable output.
pub async fn list() -> Result<Vec<ManagedSimulator>> {
    let set = device_set_path()?;
    let output = simctl(&[
        "--set",
        set.to_str().unwrap_or_default(),
        "list",
        "devices",
        "--json",
    ])
    .await?;
    if !output.status.success() {
        return Err(simctl_failure("simctl list devices", &output));
    }
    parse_devices(&output.stdout)
}

fn parse_devices(json: &[u8]) -> Result<Vec<ManagedSimulator>> {
    #[derive(Deserialize)]
    struct Listing {
        devices: std::collections::HashMap<String, Vec<ManagedSimulator>>,
    }
    let listing: Listing = serde_json::from_slice(json)?;
    let mut all = Vec::new();
    for (runtime, devices) in listing.devices {
        for mut device in devices {
            device.runtime = runtime.clone();
            all.push(device);
        }
    }
    all.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(all)
}

/// Device types that have at least one available runtime, in devicetypes
/// listing order.
pub async fn list_available() -> Result<Vec<AvailableDeviceType>> {
    let runtimes = simctl(&["list", "runtimes", "--json"]).await?;
    if !runtimes.status.success() {
        return Err(simctl_failure("simctl list runtimes", &runtimes));
    }
    let devicetypes = simctl(&["list", "devicetypes", "--json"]).await?;
    if !devicetypes.status.success() {
        return Err(simctl_failure("simctl list devicetypes", &devicetypes));
    }
    parse_available(&runtimes.stdout, &devicetypes.stdout)
}

fn parse_available(
    runtimes_json: &[u8],
    devicetypes_json: &[u8],
) -> Result<Vec<AvailableDeviceType>> {
    #[derive(Deserialize)]
    struct RuntimeEntry {
        identifier: String,
        name: String,
        #[serde(default, rename = "supportedDeviceTypes")]
        supported_device_types: Vec<DeviceTypeEntry>,
    }
    #[derive(Deserialize)]
    struct DeviceTypeEntry {
        identifier: String,
        name: String,
    }
    #[derive(Deserialize)]
    struct Runtimes {
        runtimes: Vec<RuntimeEntry>,
    }
    #[derive(Deserialize)]
    struct DeviceTypes {
        devicetypes: Vec<DeviceTypeEntry>,
    }

    let runtimes: Runtimes = serde_json::from_slice(runtimes_json)?;
    let devicetypes: DeviceTypes = serde_json::from_slice(devicetypes_json)?;

    let mut result = Vec::new();
    for dt in devicetypes.devicetypes {
        let supported: Vec<AvailableRuntime> = runtimes
            .runtimes
            .iter()
            .filter(|rt| {
                rt.supported_device_types
                    .iter()
                    .any(|s| s.identifier == dt.identifier)
            })
            .map(|rt| AvailableRuntime {
                identifier: rt.identifier.clone(),
                name: rt.name.clone(),
            })
            .collect();
        if !supported.is_empty() {
            result.push(AvailableDeviceType {
                identifier: dt.identifier,
                name: dt.name,
                runtimes: supported,
            });
        }
    }
    Ok(result)
}

/// Creates a device in the isolated set with an auto-numbered name.
/// Returns the new UDID.
pub async fn add(device_type_id: &str, runtime_id: &str) -> Result<String> {
    let set = device_set_path()?;
    let base = device_type_base_name(device_type_id).await?;
    let existing = list().await.unwrap_or_default();
    let name = format!(
        "previewd {} ({})",
        base,
        next_sequence_number(&existing, &base)
    );

    let output = simctl(&[
        "--set",
        set.to_str().unwrap_or_default(),
        "create",
        &name,
        device_type_id,
        runtime_id,
    ])
    .await?;
    if !output.status.success() {
        return Err(simctl_failure("simctl create", &output));
    }
    // simctl create prints the new UDID on stdout.
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub async fn remove(udid: &str) -> Result<()> {
    let set = device_set_path()?;
    let output = simctl(&[
        "--set",
        set.to_str().unwrap_or_default(),
        "delete",
        udid,
    ])
    .await?;
    if !output.status.success() {
        return Err(simctl_failure("simctl delete", &output));
    }
    if get_default()?.as_deref() == Some(udid) {
        let _ = fs::remove_file(config_store_path()?);
    }
    Ok(())
}

pub async fn shutdown(udid: &str) -> Result<()> {
    let set = device_set_path()?;
    let output = simctl(&[
        "--set",
        set.to_str().unwrap_or_default(),
        "shutdown",
        udid,
    ])
    .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Already shut down is not a failure.
        if !stderr.contains("current state: Shutdown") {
            return Err(simctl_failure("simctl shutdown", &output));
        }
    }
    Ok(())
}

/// Installs the built app bundle on a device in the isolated set.
pub async fn install_app(udid: &str, app_bundle: &Path) -> Result<()> {
    let set = device_set_path()?;
    let output = simctl(&[
        "--set",
        set.to_str().unwrap_or_default(),
        "install",
        udid,
        app_bundle.to_str().unwrap_or_default(),
    ])
    .await?;
    if !output.status.success() {
        return Err(simctl_failure("simctl install", &output));
    }
    Ok(())
}

/// Launches `bundle_id`, terminating a previous instance, with
/// `SIMCTL_CHILD_`-prefixed environment handed to the app process.
pub async fn launch_app(udid: &str, bundle_id: &str, child_env: &[(&str, &str)]) -> Result<()> {
    let set = device_set_path()?;
    let mut cmd = Command::new("xcrun");
    cmd.arg("simctl")
        .arg("--set")
        .arg(&set)
        .args(["launch", "--terminate-running-process", udid, bundle_id])
        .kill_on_drop(true);
    for (key, value) in child_env {
        cmd.env(format!("SIMCTL_CHILD_{}", key), value);
    }
    let output = timeout(SIMCTL_TIMEOUT, cmd.output())
        .await
        .map_err(|_| PreviewError::Simctl("simctl launch timed out after 30s".into()))?
        .map_err(|e| PreviewError::ToolchainMissing(format!("xcrun: {}", e)))?;
    if !output.status.success() {
        return Err(simctl_failure("simctl launch", &output));
    }
    Ok(())
}

async fn device_type_base_name(device_type_id: &str) -> Result<String> {
    if let Ok(available) = list_available().await {
        if let Some(dt) = available.iter().find(|d| d.identifier == device_type_id) {
            return Ok(dt.name.clone());
        }
    }
    // Fallback: derive from the identifier tail.
    Ok(device_type_id
        .rsplit('.')
        .next()
        .unwrap_or(device_type_id)
        .replace('-', " "))
}

/// Finds or creates the simulator to preview on.
///
/// Resolution priority:
///  1. `preferred_udid` — must exist in the set, `DeviceNotFound` otherwise
///  2. persisted default — warn and fall through if missing
///  3. first existing device in the set
///  4. auto-create from the newest available iPhone
pub async fn resolve(preferred_udid: Option<&str>) -> Result<(String, PathBuf)> {
    let set = device_set_path()?;
    let devices = list().await.unwrap_or_default();

    if let Some(preferred) = preferred_udid.filter(|u| !u.is_empty()) {
        return match devices.iter().find(|d| d.udid == preferred) {
            Some(d) => {
                eprintln!("[Simulator] Using specified simulator {} ({})", d.name, d.udid);
                Ok((d.udid.clone(), set))
            }
            None => Err(PreviewError::DeviceNotFound(format!(
                "{} is not in the previewd device set; run 'previewd devices list'",
                preferred
            ))),
        };
    }

    if let Some(default) = get_default()? {
        match devices.iter().find(|d| d.udid == default) {
            Some(d) => {
                eprintln!("[Simulator] Using default simulator {} ({})", d.name, d.udid);
                return Ok((d.udid.clone(), set));
            }
            None => eprintln!(
                "[Simulator] Default simulator {} not found, falling back to auto-select",
                default
            ),
        }
    }

    if let Some(d) = devices.first() {
        eprintln!("[Simulator] Reusing simulator {} ({})", d.name, d.udid);
        return Ok((d.udid.clone(), set));
    }

    let (device_type_id, device_type_name, runtime_id) = find_latest_iphone().await?;
    eprintln!(
        "[Simulator] Creating {} on {} in the previewd device set",
        device_type_name, runtime_id
    );
    let udid = add(&device_type_id, &runtime_id).await?;
    Ok((udid, set))
}

/// Newest iOS runtime first (major, then minor), lexicographically largest
/// iPhone device type as tie-break. Returns (device_type_id, name,
/// runtime_id).
pub async fn find_latest_iphone() -> Result<(String, String, String)> {
    let available = list_available().await?;
    let mut best: Option<(String, String, String, (i32, i32))> = None;
    for dt in &available {
        if !dt.name.contains("iPhone") {
            continue;
        }
        for rt in &dt.runtimes {
            let version = parse_ios_version(&rt.identifier);
            if version.0 < 0 {
                continue;
            }
            let candidate = (
                dt.identifier.clone(),
                dt.name.clone(),
                rt.identifier.clone(),
                version,
            );
            let better = match &best {
                None => true,
                Some((_, name, _, v)) => {
                    candidate.3 > *v || (candidate.3 == *v && candidate.1 > *name)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best.map(|(id, name, rt, _)| (id, name, rt))
        .ok_or_else(|| PreviewError::DeviceNotFound("no available iPhone simulator".into()))
}

/// Extracts (major, minor) from a simctl runtime key such as
/// `com.apple.CoreSimulator.SimRuntime.iOS-18-2`. Returns (-1, -1) for
/// keys that are not an iOS runtime.
pub fn parse_ios_version(runtime_key: &str) -> (i32, i32) {
    let Some(idx) = runtime_key.find("iOS-") else {
        return (-1, -1);
    };
    // Reject keys like tvOS-… where "iOS-" is a suffix of another word.
    if idx > 0
        && runtime_key.as_bytes()[idx - 1].is_ascii_alphanumeric()
    {
        return (-1, -1);
    }
    let rest = &runtime_key[idx + 4..];
    let mut parts = rest.splitn(3, '-');
    let major = parts.next().and_then(|p| p.parse::<i32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<i32>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => (major, minor),
        _ => (-1, -1),
    }
}

/// Next free auto-number for names of the form `previewd <base> (N)`.
/// Names without a sequence suffix are ignored.
pub fn next_sequence_number(devices: &[ManagedSimulator], base: &str) -> u32 {
    let prefix = format!("previewd {} (", base);
    let max = devices
        .iter()
        .filter_map(|d| {
            d.name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .max();
    max.map_or(1, |n| n + 1)
}

/// `com.apple.CoreSimulator.SimRuntime.iOS-18-2` → `iOS 18.2`.
/// Unrecognized keys are returned unchanged.
pub fn human_readable_runtime(runtime_key: &str) -> String {
    let Some(tail) = runtime_key.strip_prefix("com.apple.CoreSimulator.SimRuntime.") else {
        return runtime_key.to_string();
    };
    let mut parts = tail.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(os), Some(major), Some(minor)) => format!("{} {}.{}", os, major, minor),
        _ => runtime_key.to_string(),
    }
}
