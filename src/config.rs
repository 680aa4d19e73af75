//! Configuration loading for robovm-test.
//!
//! Configuration comes from a TOML file (see [`schema`]) with command line
//! overrides applied on top ([`Config::apply_overrides`]). The loaded
//! [`Config`] is then turned into the inputs of a run: a [`CompileConfig`],
//! a [`TargetSpec`], [`RunSettings`] and the list of test units.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::compiler::CompileConfig;
use crate::coordinator::{RunPlan, RunSettings, TargetSpec};
use crate::device::SelectionCriteria;
use crate::units::{TestFilter, UnitSource};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "robovm-test.toml";

const PROPERTIES_CANDIDATES: &[&str] = &["robovm-test.properties", "robovm.properties"];
const CONFIG_CANDIDATES: &[&str] = &["robovm-test.xml", "robovm.xml"];
const VALID_OS: &[&str] = &["ios", "tvos", "macosx"];
const VALID_ARCH: &[&str] = &["x86", "x86_64", "thumbv7", "arm64"];

/// Bridge tool used to install and debug on connected devices.
pub const DEVICE_BRIDGE: &str = "ios-deploy";

/// Loads configuration from a TOML file.
///
/// # Example
///
/// ```no_run
/// use robovm_test::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("robovm-test.toml"))?;
/// println!("Quiet timeout: {}s", config.run.quiet_timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use robovm_test::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [compile]
///     os = "tvos"
///     arch = "arm64"
///
///     [target]
///     type = "device"
/// "#)?;
/// assert_eq!(config.compile.arch, "arm64");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Command line overrides; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<TargetType>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub device_name: Option<String>,
    pub sdk: Option<String>,
    pub sign_identity: Option<String>,
    pub provisioning_profile: Option<String>,
    pub skip_signing: bool,
    pub test_filter: Option<String>,
    pub quiet_timeout_secs: Option<u64>,
    pub server_debugging: bool,
    pub debug_logging: bool,
}

/// Picks the explicit file, or the first existing candidate in `basedir`.
///
/// An explicit file that does not exist is an error.
pub fn resolve_project_file(
    basedir: &Path,
    explicit: Option<&Path>,
    candidates: &[&str],
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let path = basedir.join(path);
        if !path.is_file() {
            bail!("Configured file does not exist: {}", path.display());
        }
        return Ok(Some(path));
    }
    Ok(candidates
        .iter()
        .map(|name| basedir.join(name))
        .find(|path| path.is_file()))
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(kind) = overrides.target {
            self.target.kind = kind;
        }
        if let Some(os) = &overrides.os {
            self.compile.os = os.clone();
        }
        if let Some(arch) = &overrides.arch {
            self.compile.arch = arch.clone();
        }
        if let Some(name) = &overrides.device_name {
            self.target.device_name = Some(name.clone());
        }
        if let Some(sdk) = &overrides.sdk {
            self.target.sdk = Some(sdk.clone());
        }
        if let Some(identity) = &overrides.sign_identity {
            self.compile.sign_identity = Some(identity.clone());
        }
        if let Some(profile) = &overrides.provisioning_profile {
            self.compile.provisioning_profile = Some(profile.clone());
        }
        if overrides.skip_signing {
            self.compile.skip_signing = true;
        }
        if let Some(filter) = &overrides.test_filter {
            self.run.test_filter = Some(filter.clone());
        }
        if let Some(secs) = overrides.quiet_timeout_secs {
            self.run.quiet_timeout_secs = secs;
        }
        if overrides.server_debugging {
            self.run.server_debugging = true;
        }
        if overrides.debug_logging {
            self.run.debug_logging = true;
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !VALID_OS.contains(&self.compile.os.as_str()) {
            bail!(
                "Unsupported os '{}' (expected one of {})",
                self.compile.os,
                VALID_OS.join(", ")
            );
        }
        if !VALID_ARCH.contains(&self.compile.arch.as_str()) {
            bail!(
                "Unsupported arch '{}' (expected one of {})",
                self.compile.arch,
                VALID_ARCH.join(", ")
            );
        }
        if shell_words::split(&self.compile.command).map_or(true, |w| w.is_empty()) {
            bail!("Invalid compile command '{}'", self.compile.command);
        }
        if let Some(sdk) = &self.target.sdk {
            if sdk.split('.').any(|segment| segment.parse::<u32>().is_err()) {
                bail!("Invalid sdk version '{}'", sdk);
            }
        }
        if self.run.quiet_timeout_secs == 0 || self.run.connect_timeout_secs == 0 {
            bail!("Timeouts must be greater than zero");
        }
        if self.target.kind == TargetType::Device && self.compile.home.is_none() {
            bail!("A device target needs compile.home to locate {}", DEVICE_BRIDGE);
        }
        if self.target.kind == TargetType::Host && self.compile.os != "macosx" {
            bail!("A host target needs os = \"macosx\"");
        }
        if let Some(filter) = &self.run.test_filter {
            TestFilter::parse(filter).context("Invalid test_filter")?;
        }
        Ok(())
    }

    fn home(&self) -> Option<PathBuf> {
        self.compile
            .home
            .as_ref()
            .map(|h| PathBuf::from(shellexpand::tilde(h).into_owned()))
    }

    /// Builds the compiler input, resolving project files against `basedir`.
    pub fn compile_config(&self, basedir: &Path) -> Result<CompileConfig> {
        let c = &self.compile;
        let properties_file =
            resolve_project_file(basedir, c.properties_file.as_deref(), PROPERTIES_CANDIDATES)?;
        let config_file =
            resolve_project_file(basedir, c.config_file.as_deref(), CONFIG_CANDIDATES)?;

        Ok(CompileConfig {
            os: c.os.clone(),
            arch: c.arch.clone(),
            home: self.home(),
            install_dir: basedir.join(&c.install_dir),
            executable_name: c.executable_name.clone(),
            classpath: c.classpath.iter().map(|p| basedir.join(p)).collect(),
            force_link: c.force_link.clone(),
            sign_identity: c.sign_identity.clone(),
            provisioning_profile: c.provisioning_profile.clone(),
            skip_signing: c.skip_signing,
            properties_file,
            config_file,
            verbose: self.run.debug_logging,
            ..CompileConfig::default()
        })
    }

    pub fn selection_criteria(&self) -> SelectionCriteria {
        let mut criteria = SelectionCriteria::new(self.target.family);
        if let Some(name) = &self.target.device_name {
            criteria = criteria.with_name(name.clone());
        }
        if let Some(sdk) = &self.target.sdk {
            criteria = criteria.with_version(sdk.clone());
        }
        criteria
    }

    pub fn target_spec(&self) -> Result<TargetSpec> {
        Ok(match self.target.kind {
            TargetType::Host => TargetSpec::Host,
            TargetType::Simulator => TargetSpec::Simulator(self.selection_criteria()),
            TargetType::Device => {
                let home = self
                    .home()
                    .with_context(|| format!("compile.home is required to locate {}", DEVICE_BRIDGE))?;
                TargetSpec::Device {
                    bridge: home.join("bin").join(DEVICE_BRIDGE),
                }
            }
        })
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            quiet_timeout: Duration::from_secs(self.run.quiet_timeout_secs),
            connect_timeout: Duration::from_secs(self.run.connect_timeout_secs),
            listen_addr: self.run.listen_addr.clone(),
            advertise_host: self.run.advertise_host.clone(),
            server_debugging: self.run.server_debugging,
            launch_args: self.run.launch_args.clone(),
            ..RunSettings::default()
        }
    }

    pub fn unit_source(&self, basedir: &Path) -> UnitSource {
        UnitSource {
            tests: self.run.tests.clone(),
            classes_dirs: self
                .run
                .test_classes_dirs
                .iter()
                .map(|d| basedir.join(d))
                .collect(),
            includes: self.run.includes.clone(),
            filter: self.run.test_filter.clone(),
        }
    }

    /// Everything needed to start a run from this configuration.
    pub fn run_plan(&self, basedir: &Path) -> Result<RunPlan> {
        let units = self
            .unit_source(basedir)
            .resolve()
            .context("Failed to resolve test classes")?;
        Ok(RunPlan {
            target: self.target_spec()?,
            compile: self.compile_config(basedir)?,
            units,
        })
    }
}

/// Starter configuration written by `robovm-test init`.
pub const INIT_TEMPLATE: &str = r#"# robovm-test configuration

[target]
type = "simulator"          # simulator | device | host
family = "iphone"           # iphone | ipad | tv
# device_name = "iPhone-15"
# sdk = "17.2"

[compile]
command = "robovm"
os = "ios"                  # ios | tvos | macosx
arch = "x86_64"             # x86 | x86_64 | thumbv7 | arm64
# home = "~/robovm"
install_dir = "target/robovm"
classpath = ["target/test-classes", "target/classes"]
# sign_identity = "iPhone Developer"
# provisioning_profile = ""
skip_signing = false

[run]
quiet_timeout_secs = 120
connect_timeout_secs = 300
listen_addr = "127.0.0.1:0"
# tests = ["com.example.FooTest"]
# test_filter = "FooTest#testA+testB"

[report]
output_dir = "target/robovm-test-reports"
junit = true
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFamily;
    use std::fs;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.target.kind, TargetType::Simulator);
        assert_eq!(config.target.family, DeviceFamily::IPhone);
        assert_eq!(config.compile.command, "robovm");
        assert_eq!(config.run.connect_timeout_secs, 300);
        assert!(config.report.junit);
        config.validate().unwrap();
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = load_config_str(INIT_TEMPLATE).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let mut config = load_config_str(
            r#"
            [target]
            sdk = "16.4"
            [compile]
            sign_identity = "file identity"
            "#,
        )
        .unwrap();
        config.apply_overrides(&Overrides {
            arch: Some("arm64".to_string()),
            sdk: Some("17.2".to_string()),
            skip_signing: true,
            quiet_timeout_secs: Some(30),
            ..Overrides::default()
        });
        assert_eq!(config.compile.arch, "arm64");
        assert_eq!(config.target.sdk.as_deref(), Some("17.2"));
        assert_eq!(config.compile.sign_identity.as_deref(), Some("file identity"));
        assert!(config.compile.skip_signing);
        assert_eq!(config.run_settings().quiet_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = load_config_str("[compile]\nos = \"android\"").unwrap();
        assert!(config.validate().is_err());

        let config = load_config_str("[target]\ntype = \"device\"").unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("compile.home"));

        let config = load_config_str("[run]\ntest_filter = \"Foo#\"").unwrap();
        assert!(config.validate().is_err());

        let config = load_config_str("[target]\nsdk = \"latest\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_project_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        assert_eq!(resolve_project_file(base, None, PROPERTIES_CANDIDATES).unwrap(), None);

        fs::write(base.join("robovm.properties"), "app.id=x").unwrap();
        assert_eq!(
            resolve_project_file(base, None, PROPERTIES_CANDIDATES).unwrap(),
            Some(base.join("robovm.properties"))
        );

        fs::write(base.join("robovm-test.properties"), "app.id=y").unwrap();
        assert_eq!(
            resolve_project_file(base, None, PROPERTIES_CANDIDATES).unwrap(),
            Some(base.join("robovm-test.properties"))
        );

        assert!(resolve_project_file(base, Some(Path::new("missing.xml")), CONFIG_CANDIDATES).is_err());
    }

    #[test]
    fn test_compile_config_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("robovm.xml"), "<config/>").unwrap();
        let config = load_config_str("[compile]\nhome = \"/opt/robovm\"").unwrap();
        let compile = config.compile_config(dir.path()).unwrap();
        assert_eq!(compile.config_file, Some(dir.path().join("robovm.xml")));
        assert_eq!(compile.properties_file, None);
        assert_eq!(compile.install_dir, dir.path().join("target/robovm"));
        assert_eq!(compile.home, Some(PathBuf::from("/opt/robovm")));
    }

    #[test]
    fn test_target_specs() {
        let config = load_config_str(
            r#"
            [target]
            type = "device"
            [compile]
            home = "/opt/robovm"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.target_spec().unwrap(),
            TargetSpec::Device {
                bridge: PathBuf::from("/opt/robovm/bin/ios-deploy")
            }
        );

        let config = load_config_str("[target]\nfamily = \"tv\"\ndevice_name = \"Apple-TV\"").unwrap();
        match config.target_spec().unwrap() {
            TargetSpec::Simulator(criteria) => {
                assert_eq!(criteria.family, DeviceFamily::Tv);
                assert_eq!(criteria.name.as_deref(), Some("Apple-TV"));
            }
            other => panic!("unexpected target {:?}", other),
        }
    }
}
