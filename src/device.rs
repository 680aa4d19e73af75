//! Simulator and device selection.
//!
//! Before a test binary can be launched we have to decide where it runs.
//! The selector takes the devices reported by an enumerator and picks the
//! single best match for the configured [`SelectionCriteria`].
//!
//! # Selection Rules
//!
//! 1. Keep only candidates of the requested [`DeviceFamily`]
//! 2. Drop candidates whose name differs from `criteria.name` (if set)
//! 3. Drop candidates whose version differs from `criteria.version` (if set)
//! 4. Among the rest, the highest [`PlatformVersion`] wins; ties go to the
//!    lexicographically smallest name, then the smallest identifier
//!
//! Versions are compared segment by segment as numbers, so `10.0` is newer
//! than `9.2` even though a plain string compare says otherwise.
//!
//! # Example
//!
//! ```
//! use robovm_test::device::{
//!     DeviceDescriptor, DeviceFamily, SelectionCriteria, select_best_device,
//! };
//!
//! let devices = vec![
//!     DeviceDescriptor::new(DeviceFamily::IPhone, "9.2", "iPhone-6", "A"),
//!     DeviceDescriptor::new(DeviceFamily::IPhone, "10.0", "iPhone-6", "B"),
//! ];
//! let best = select_best_device(&devices, &SelectionCriteria::new(DeviceFamily::IPhone))?;
//! assert_eq!(best.id, "B");
//! # Ok::<(), robovm_test::device::SelectionError>(())
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result type for selection and enumeration.
pub type SelectionResult<T> = Result<T, SelectionError>;

/// Errors raised while enumerating or selecting devices.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// The enumerator returned no devices at all.
    #[error("Unable to enumerate simulator devices")]
    NoDevicesEnumerated,

    /// Devices exist, but none matched the criteria.
    #[error("Unable to find a matching device [family={family}, name={name:?}, sdk={version:?}]")]
    NoMatchFound {
        family: DeviceFamily,
        name: Option<String>,
        version: Option<String>,
    },

    /// The enumeration command itself failed.
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
}

/// Hardware family of a simulator or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    IPhone,
    IPad,
    Tv,
}

impl DeviceFamily {
    /// Infers the family from a human readable device name.
    ///
    /// Returns `None` for families we cannot run tests on (watches, vision).
    pub fn from_device_name(name: &str) -> Option<Self> {
        if name.starts_with("iPhone") || name.starts_with("iPod") {
            Some(DeviceFamily::IPhone)
        } else if name.starts_with("iPad") {
            Some(DeviceFamily::IPad)
        } else if name.starts_with("Apple TV") {
            Some(DeviceFamily::Tv)
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceFamily::IPhone => "iphone",
            DeviceFamily::IPad => "ipad",
            DeviceFamily::Tv => "tv",
        };
        f.write_str(s)
    }
}

impl FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iphone" | "phone" => Ok(DeviceFamily::IPhone),
            "ipad" | "tablet" => Ok(DeviceFamily::IPad),
            "tv" | "appletv" => Ok(DeviceFamily::Tv),
            other => Err(format!("unknown device family: {}", other)),
        }
    }
}

/// A dotted platform version such as `9.0` or `17.2.1`.
///
/// Ordering and equality are numeric per segment; missing trailing segments
/// count as zero, so `17.2` and `17.2.0` are equal. The original text is kept
/// for display.
#[derive(Debug, Clone)]
pub struct PlatformVersion {
    raw: String,
    segments: Vec<u64>,
}

impl PlatformVersion {
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .trim()
            .split('.')
            .map(|seg| {
                let digits: String = seg.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect();
        Self {
            raw: raw.trim().to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for PlatformVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for PlatformVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PlatformVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PlatformVersion {}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A candidate execution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub family: DeviceFamily,
    pub version: PlatformVersion,
    /// Simple name, e.g. `iPhone-15-Pro`.
    pub name: String,
    /// Unique identifier (simulator UDID).
    pub id: String,
}

impl DeviceDescriptor {
    pub fn new(
        family: DeviceFamily,
        version: &str,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            family,
            version: PlatformVersion::parse(version),
            name: name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {}) [{}]", self.name, self.family, self.version, self.id)
    }
}

/// Filters applied when picking a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCriteria {
    pub family: DeviceFamily,
    pub name: Option<String>,
    pub version: Option<String>,
}

impl SelectionCriteria {
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            name: None,
            version: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    fn accepts(&self, device: &DeviceDescriptor) -> bool {
        if device.family != self.family {
            return false;
        }
        if let Some(name) = &self.name
            && name != &device.name
        {
            return false;
        }
        if let Some(version) = &self.version
            && PlatformVersion::parse(version) != device.version
        {
            return false;
        }
        true
    }
}

/// Picks the best device for the given criteria.
///
/// # Errors
///
/// - [`SelectionError::NoDevicesEnumerated`] if `candidates` is empty
/// - [`SelectionError::NoMatchFound`] if no candidate passes the filters
pub fn select_best_device(
    candidates: &[DeviceDescriptor],
    criteria: &SelectionCriteria,
) -> SelectionResult<DeviceDescriptor> {
    if candidates.is_empty() {
        return Err(SelectionError::NoDevicesEnumerated);
    }

    let best = candidates
        .iter()
        .filter(|d| criteria.accepts(d))
        .min_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });

    match best {
        Some(device) => {
            debug!("Selected device {}", device);
            Ok(device.clone())
        }
        None => Err(SelectionError::NoMatchFound {
            family: criteria.family,
            name: criteria.name.clone(),
            version: criteria.version.clone(),
        }),
    }
}

/// Source of candidate devices.
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    /// Lists the devices currently available. Called once per selection.
    async fn list_devices(&self) -> SelectionResult<Vec<DeviceDescriptor>>;
}

/// Enumerator over a fixed list, used for hosts without `simctl` and in tests.
pub struct StaticEnumerator {
    devices: Vec<DeviceDescriptor>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceEnumerator for StaticEnumerator {
    async fn list_devices(&self) -> SelectionResult<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }
}

/// Enumerates simulators with `xcrun simctl list devices available -j`.
pub struct SimctlEnumerator {
    xcrun: String,
}

impl SimctlEnumerator {
    pub fn new() -> Self {
        Self {
            xcrun: "xcrun".to_string(),
        }
    }
}

impl Default for SimctlEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceEnumerator for SimctlEnumerator {
    async fn list_devices(&self) -> SelectionResult<Vec<DeviceDescriptor>> {
        let output = tokio::process::Command::new(&self.xcrun)
            .args(["simctl", "list", "devices", "available", "-j"])
            .output()
            .await
            .map_err(|e| SelectionError::Enumeration(format!("failed to run simctl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SelectionError::Enumeration(format!(
                "simctl list failed: {}",
                stderr.trim()
            )));
        }

        parse_simctl_devices(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct SimctlListing {
    devices: BTreeMap<String, Vec<SimctlDevice>>,
}

#[derive(Deserialize)]
struct SimctlDevice {
    name: String,
    udid: String,
    #[serde(default = "default_available", rename = "isAvailable")]
    is_available: bool,
}

fn default_available() -> bool {
    true
}

static RUNTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SimRuntime\.(iOS|tvOS)-(\d+(?:-\d+)*)$").expect("runtime pattern is valid")
});

/// Parses the JSON printed by `simctl list devices -j`.
///
/// Runtimes other than iOS and tvOS are skipped, as are devices whose
/// family cannot be inferred from their name.
pub fn parse_simctl_devices(json: &str) -> SelectionResult<Vec<DeviceDescriptor>> {
    let listing: SimctlListing = serde_json::from_str(json)
        .map_err(|e| SelectionError::Enumeration(format!("failed to parse simctl output: {}", e)))?;

    let mut result = Vec::new();
    for (runtime, devices) in listing.devices {
        let Some(caps) = RUNTIME_RE.captures(&runtime) else {
            debug!("Skipping unsupported runtime {}", runtime);
            continue;
        };
        let version = caps[2].replace('-', ".");

        for device in devices.into_iter().filter(|d| d.is_available) {
            let Some(family) = DeviceFamily::from_device_name(&device.name) else {
                continue;
            };
            result.push(DeviceDescriptor::new(
                family,
                &version,
                device.name.replace(' ', "-"),
                device.udid,
            ));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone(version: &str, name: &str, id: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(DeviceFamily::IPhone, version, name, id)
    }

    #[test]
    fn test_highest_version_wins_numerically() {
        let devices = vec![
            phone("9.0", "iPhone-6", "a"),
            phone("9.2", "iPhone-6", "b"),
            phone("10.0", "iPhone-6", "c"),
        ];
        let best = select_best_device(&devices, &SelectionCriteria::new(DeviceFamily::IPhone))
            .unwrap();
        assert_eq!(best.version.as_str(), "10.0");
    }

    #[test]
    fn test_empty_list_is_no_devices() {
        let err = select_best_device(&[], &SelectionCriteria::new(DeviceFamily::IPhone))
            .unwrap_err();
        assert!(matches!(err, SelectionError::NoDevicesEnumerated));
    }

    #[test]
    fn test_no_family_match() {
        let devices = vec![phone("17.0", "iPhone-15", "a")];
        let err = select_best_device(&devices, &SelectionCriteria::new(DeviceFamily::Tv))
            .unwrap_err();
        assert!(matches!(err, SelectionError::NoMatchFound { .. }));
    }

    #[test]
    fn test_name_and_version_filters() {
        let devices = vec![
            phone("17.2", "iPhone-15", "a"),
            phone("17.2", "iPhone-SE", "b"),
            phone("16.4", "iPhone-SE", "c"),
        ];
        let criteria = SelectionCriteria::new(DeviceFamily::IPhone)
            .with_name("iPhone-SE")
            .with_version("16.4");
        assert_eq!(select_best_device(&devices, &criteria).unwrap().id, "c");

        let criteria = SelectionCriteria::new(DeviceFamily::IPhone).with_name("iPhone-SE");
        assert_eq!(select_best_device(&devices, &criteria).unwrap().id, "b");

        let criteria = SelectionCriteria::new(DeviceFamily::IPhone).with_version("15.0");
        assert!(select_best_device(&devices, &criteria).is_err());
    }

    #[test]
    fn test_tie_break_is_order_independent() {
        let a = phone("17.2", "iPhone-15", "z");
        let b = phone("17.2", "iPhone-14", "y");
        let criteria = SelectionCriteria::new(DeviceFamily::IPhone);

        let first = select_best_device(&[a.clone(), b.clone()], &criteria).unwrap();
        let second = select_best_device(&[b, a], &criteria).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "iPhone-14");
    }

    #[test]
    fn test_version_ordering() {
        assert!(PlatformVersion::parse("10.0") > PlatformVersion::parse("9.2"));
        assert!(PlatformVersion::parse("9.10") > PlatformVersion::parse("9.9"));
        assert_eq!(PlatformVersion::parse("17.2"), PlatformVersion::parse("17.2.0"));
    }

    #[test]
    fn test_parse_simctl_devices() {
        let json = r#"{
          "devices": {
            "com.apple.CoreSimulator.SimRuntime.iOS-17-2": [
              {"name": "iPhone 15", "udid": "AAA", "isAvailable": true, "state": "Shutdown"},
              {"name": "iPad Air (5th generation)", "udid": "BBB", "isAvailable": true}
            ],
            "com.apple.CoreSimulator.SimRuntime.tvOS-17-0": [
              {"name": "Apple TV 4K (3rd generation)", "udid": "CCC", "isAvailable": true}
            ],
            "com.apple.CoreSimulator.SimRuntime.watchOS-10-2": [
              {"name": "Apple Watch Series 9 (45mm)", "udid": "DDD", "isAvailable": true}
            ]
          }
        }"#;

        let devices = parse_simctl_devices(json).unwrap();
        assert_eq!(devices.len(), 3);

        let phone = devices.iter().find(|d| d.id == "AAA").unwrap();
        assert_eq!(phone.family, DeviceFamily::IPhone);
        assert_eq!(phone.version.as_str(), "17.2");
        assert_eq!(phone.name, "iPhone-15");

        let tv = devices.iter().find(|d| d.id == "CCC").unwrap();
        assert_eq!(tv.family, DeviceFamily::Tv);
    }

    #[tokio::test]
    async fn test_static_enumerator() {
        let enumerator = StaticEnumerator::new(vec![phone("17.0", "iPhone-15", "a")]);
        let devices = enumerator.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
    }
}
