//! Configuration schema definitions for robovm-test.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── TargetConfig     - Where the tests run (simulator, device, host) and device filters
//! ├── CompileSettings  - Compiler front-end, target OS/arch, classpath, signing
//! ├── RunConfig        - Timeouts, listener address, test selection
//! └── ReportConfig     - JUnit output settings
//! ```
//!
//! Every section is optional; an empty file runs the tests found in
//! `target/test-classes` on the newest iPhone simulator.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceFamily;

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use robovm_test::config::{Config, TargetType};
///
/// let config: Config = toml::from_str(r#"
///     [target]
///     type = "simulator"
///     family = "ipad"
///     sdk = "17.2"
///
///     [run]
///     tests = ["com.example.FooTest"]
/// "#).unwrap();
/// assert_eq!(config.target.kind, TargetType::Simulator);
/// assert_eq!(config.run.quiet_timeout_secs, 120);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,

    #[serde(default)]
    pub compile: CompileSettings,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Kind of execution target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Simulator,
    Device,
    Host,
}

/// Target selection.
///
/// | Field | Default |
/// |-------|---------|
/// | `type` | `"simulator"` |
/// | `family` | `"iphone"` |
/// | `device_name` | any |
/// | `sdk` | newest available |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    #[serde(rename = "type", default)]
    pub kind: TargetType,

    #[serde(default = "default_family")]
    pub family: DeviceFamily,

    /// Exact simulator name, e.g. `iPhone-15-Pro`.
    pub device_name: Option<String>,

    /// Exact platform version, e.g. `17.2`.
    pub sdk: Option<String>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            kind: TargetType::default(),
            family: default_family(),
            device_name: None,
            sdk: None,
        }
    }
}

fn default_family() -> DeviceFamily {
    DeviceFamily::IPhone
}

/// Compiler settings.
///
/// Relative paths are resolved against the project directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompileSettings {
    /// Compiler front-end command, split shell-style.
    ///
    /// Default: `"robovm"`
    #[serde(default = "default_compile_command")]
    pub command: String,

    /// One of `ios`, `tvos`, `macosx`.
    #[serde(default = "default_os")]
    pub os: String,

    /// One of `x86`, `x86_64`, `thumbv7`, `arm64`.
    #[serde(default = "default_arch")]
    pub arch: String,

    /// Toolchain home; `~` and environment variables are expanded.
    pub home: Option<String>,

    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    #[serde(default = "default_executable_name")]
    pub executable_name: String,

    #[serde(default = "default_classpath")]
    pub classpath: Vec<PathBuf>,

    /// Additional class patterns to force-link.
    #[serde(default)]
    pub force_link: Vec<String>,

    pub sign_identity: Option<String>,

    pub provisioning_profile: Option<String>,

    #[serde(default)]
    pub skip_signing: bool,

    /// Must exist when set; otherwise `robovm-test.properties` or `robovm.properties` is used if present.
    pub properties_file: Option<PathBuf>,

    /// Must exist when set; otherwise `robovm-test.xml` or `robovm.xml` is used if present.
    pub config_file: Option<PathBuf>,
}

impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            command: default_compile_command(),
            os: default_os(),
            arch: default_arch(),
            home: None,
            install_dir: default_install_dir(),
            executable_name: default_executable_name(),
            classpath: default_classpath(),
            force_link: Vec::new(),
            sign_identity: None,
            provisioning_profile: None,
            skip_signing: false,
            properties_file: None,
            config_file: None,
        }
    }
}

fn default_compile_command() -> String {
    "robovm".to_string()
}

fn default_os() -> String {
    "ios".to_string()
}

fn default_arch() -> String {
    "x86_64".to_string()
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("target/robovm")
}

fn default_executable_name() -> String {
    "RoboVMTests".to_string()
}

fn default_classpath() -> Vec<PathBuf> {
    vec![
        PathBuf::from("target/test-classes"),
        PathBuf::from("target/classes"),
    ]
}

/// Run policy and test selection.
///
/// | Field | Default |
/// |-------|---------|
/// | `quiet_timeout_secs` | 120 |
/// | `connect_timeout_secs` | 300 |
/// | `listen_addr` | `"127.0.0.1:0"` |
/// | `test_classes_dirs` | `["target/test-classes"]` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Abort when no test event arrives for this long.
    #[serde(default = "default_quiet_timeout")]
    pub quiet_timeout_secs: u64,

    /// Time allowed for the test binary to start and connect.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Host name given to the test binary; a device needs a routable address.
    pub advertise_host: Option<String>,

    /// Turns on debug logging inside the test binary.
    #[serde(default)]
    pub server_debugging: bool,

    /// Turns on DEBUG logging in this tool.
    #[serde(default)]
    pub debug_logging: bool,

    /// Explicit test classes (`Class` or `Class#m1+m2`); disables scanning.
    #[serde(default)]
    pub tests: Vec<String>,

    /// Directories scanned for test classes.
    #[serde(default = "default_test_classes_dirs")]
    pub test_classes_dirs: Vec<PathBuf>,

    /// Include patterns for scanning; empty uses the standard test patterns.
    #[serde(default)]
    pub includes: Vec<String>,

    /// Surefire-style request, e.g. `FooTest#testA+testB,Bar*`.
    pub test_filter: Option<String>,

    /// Extra arguments for the test binary.
    #[serde(default)]
    pub launch_args: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            quiet_timeout_secs: default_quiet_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            listen_addr: default_listen_addr(),
            advertise_host: None,
            server_debugging: false,
            debug_logging: false,
            tests: Vec::new(),
            test_classes_dirs: default_test_classes_dirs(),
            includes: Vec::new(),
            test_filter: None,
            launch_args: Vec::new(),
        }
    }
}

fn default_quiet_timeout() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    300
}

fn default_listen_addr() -> String {
    "127.0.0.1:0".to_string()
}

fn default_test_classes_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("target/test-classes")]
}

/// Report output.
///
/// ```toml
/// [report]
/// output_dir = "build/test-reports"
/// junit = true
/// suite_name = "device-tests"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Created if missing. Default: `"target/robovm-test-reports"`
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Write one `TEST-<class>.xml` per test class. Default: `true`
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Name of the aggregate `<testsuites>` element.
    #[serde(default = "default_suite_name")]
    pub suite_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            suite_name: default_suite_name(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("target/robovm-test-reports")
}

fn default_true() -> bool {
    true
}

fn default_suite_name() -> String {
    "robovm-tests".to_string()
}
