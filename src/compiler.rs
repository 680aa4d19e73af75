//! The external ahead-of-time compile step.
//!
//! The coordinator treats compilation as one opaque operation behind the
//! [`Compiler`] trait. [`CommandCompiler`] drives the RoboVM command line
//! front-end: it force-links the test classes and the bridge server, passes
//! the classpath explicitly and skips installation.
//!
//! ```text
//! robovm -os ios -arch x86_64 -d target/robovm -o Tests \
//!        -cp target/test-classes:target/classes \
//!        -forcelinkclasses com.example.FooTest:org.robovm.junitbridge.** \
//!        -skipsign -skipinstall org.robovm.junitbridge.Main
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

/// Result type for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The compile command string is empty or unparseable.
    #[error("Invalid compile command '{0}'")]
    InvalidCommand(String),

    /// The compiler could not be started.
    #[error("Failed to run compiler: {0}")]
    SpawnFailed(#[from] std::io::Error),

    /// The compiler exited with an error.
    #[error("Compiler exited with status {status}: {output}")]
    Failed { status: i32, output: String },

    /// The compiler succeeded but the executable is not where expected.
    #[error("Compiled executable not found at {0}")]
    MissingArtifact(PathBuf),
}

/// Main class of the on-device test server.
pub const BRIDGE_MAIN_CLASS: &str = "org.robovm.junitbridge.Main";

/// Classes that must always be linked for the bridge server to work.
pub const BRIDGE_FORCE_LINK: &str = "org.robovm.junitbridge.**";

/// Everything the compiler needs for one build.
#[derive(Debug, Clone)]
pub struct CompileConfig {
    pub os: String,
    pub arch: String,
    pub home: Option<PathBuf>,
    pub install_dir: PathBuf,
    pub executable_name: String,
    pub main_class: String,
    pub classpath: Vec<PathBuf>,
    /// Class name patterns linked even if unreferenced.
    pub force_link: Vec<String>,
    pub sign_identity: Option<String>,
    pub provisioning_profile: Option<String>,
    pub skip_signing: bool,
    pub properties_file: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            os: "ios".to_string(),
            arch: "x86_64".to_string(),
            home: None,
            install_dir: PathBuf::from("target/robovm"),
            executable_name: "RoboVMTests".to_string(),
            main_class: BRIDGE_MAIN_CLASS.to_string(),
            classpath: Vec::new(),
            force_link: Vec::new(),
            sign_identity: None,
            provisioning_profile: None,
            skip_signing: false,
            properties_file: None,
            config_file: None,
            verbose: false,
        }
    }
}

impl CompileConfig {
    /// Adds the test classes to the force-link list.
    pub fn with_test_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for class in classes {
            let class = class.into();
            if !self.force_link.contains(&class) {
                self.force_link.push(class);
            }
        }
        self
    }

    /// Whether the output is a plain executable rather than an app bundle.
    fn is_host_build(&self) -> bool {
        self.os == "macosx"
    }

    /// Where the compiler will put its output.
    pub fn expected_artifact(&self) -> CompiledArtifact {
        if self.is_host_build() {
            CompiledArtifact {
                executable: self.install_dir.join(&self.executable_name),
                app_dir: self.install_dir.clone(),
            }
        } else {
            let app_dir = self
                .install_dir
                .join(format!("{}.app", self.executable_name));
            CompiledArtifact {
                executable: app_dir.join(&self.executable_name),
                app_dir,
            }
        }
    }

    /// Command line arguments for the compiler front-end.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-os".to_string(),
            self.os.clone(),
            "-arch".to_string(),
            self.arch.clone(),
            "-d".to_string(),
            self.install_dir.to_string_lossy().into_owned(),
            "-o".to_string(),
            self.executable_name.clone(),
        ];
        if let Some(home) = &self.home {
            args.push("-home".to_string());
            args.push(home.to_string_lossy().into_owned());
        }
        if !self.classpath.is_empty() {
            let cp: Vec<String> = self
                .classpath
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            args.push("-cp".to_string());
            args.push(cp.join(":"));
        }

        let mut force_link = self.force_link.clone();
        if !force_link.iter().any(|p| p == BRIDGE_FORCE_LINK) {
            force_link.push(BRIDGE_FORCE_LINK.to_string());
        }
        args.push("-forcelinkclasses".to_string());
        args.push(force_link.join(":"));

        if let Some(file) = &self.properties_file {
            args.push("-properties".to_string());
            args.push(file.to_string_lossy().into_owned());
        }
        if let Some(file) = &self.config_file {
            args.push("-config".to_string());
            args.push(file.to_string_lossy().into_owned());
        }

        if self.skip_signing {
            args.push("-skipsign".to_string());
        } else {
            if let Some(identity) = &self.sign_identity {
                args.push("-signidentity".to_string());
                args.push(identity.clone());
            }
            if let Some(profile) = &self.provisioning_profile {
                args.push("-provisioningprofile".to_string());
                args.push(profile.clone());
            }
        }

        if self.verbose {
            args.push("-verbose".to_string());
        }
        args.push("-skipinstall".to_string());
        args.push(self.main_class.clone());
        args
    }
}

/// Output of a successful compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub executable: PathBuf,
    /// App bundle (or output directory for host builds); the launch working directory.
    pub app_dir: PathBuf,
}

/// Produces a test binary.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, config: &CompileConfig) -> CompileResult<CompiledArtifact>;
}

/// Runs an external compiler command.
pub struct CommandCompiler {
    command: String,
}

impl CommandCompiler {
    /// `command` is split shell-style, so `java -jar robovm.jar` works.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(&self, config: &CompileConfig) -> CompileResult<CompiledArtifact> {
        let words = shell_words::split(&self.command)
            .map_err(|_| CompileError::InvalidCommand(self.command.clone()))?;
        let Some((program, base_args)) = words.split_first() else {
            return Err(CompileError::InvalidCommand(self.command.clone()));
        };

        let args = config.to_args();
        info!(
            "Compiling {} for {}/{}",
            config.executable_name, config.os, config.arch
        );
        debug!("Compiler: {} {} {}", program, base_args.join(" "), args.join(" "));

        let output = tokio::process::Command::new(program)
            .args(base_args)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            debug!("compiler: {}", line);
        }

        if !output.status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(CompileError::Failed {
                status: output.status.code().unwrap_or(-1),
                output: tail.join("\n"),
            });
        }

        let artifact = config.expected_artifact();
        if !artifact.executable.exists() {
            return Err(CompileError::MissingArtifact(artifact.executable));
        }
        Ok(artifact)
    }
}
