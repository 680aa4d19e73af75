//! robovm-test CLI - run JUnit tests on simulators, devices and the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use robovm_test::compiler::CommandCompiler;
use robovm_test::config::{self, Config, DEFAULT_CONFIG_FILE, Overrides, TargetType};
use robovm_test::coordinator::Coordinator;
use robovm_test::device::{
    DeviceEnumerator, DeviceFamily, SelectionCriteria, SimctlEnumerator, StaticEnumerator,
    parse_simctl_devices, select_best_device,
};
use robovm_test::launcher::{OutputLine, OutputSink};
use robovm_test::relay::MultiListener;
use robovm_test::report::{ConsoleReporter, JUnitReporter, print_failure};

#[derive(Parser)]
#[command(name = "robovm-test")]
#[command(about = "Run JUnit tests inside RoboVM-compiled binaries", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Project directory; relative paths in the configuration start here
    #[arg(short, long, default_value = ".")]
    basedir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile, launch and run the tests
    Run {
        /// Target kind (simulator, device, host)
        #[arg(short, long, value_parser = parse_target)]
        target: Option<TargetType>,

        /// Target OS (ios, tvos, macosx)
        #[arg(long)]
        os: Option<String>,

        /// Target architecture (x86, x86_64, thumbv7, arm64)
        #[arg(long)]
        arch: Option<String>,

        /// Simulator name, e.g. iPhone-15
        #[arg(long)]
        device_name: Option<String>,

        /// Platform version, e.g. 17.2
        #[arg(long)]
        sdk: Option<String>,

        #[arg(long)]
        sign_identity: Option<String>,

        #[arg(long)]
        provisioning_profile: Option<String>,

        #[arg(long)]
        skip_signing: bool,

        /// Test request, e.g. FooTest#testA+testB,Bar*
        #[arg(long)]
        test: Option<String>,

        /// Seconds without a test event before the run is aborted
        #[arg(long)]
        quiet_timeout: Option<u64>,

        /// Turn on debug logging inside the test binary
        #[arg(long)]
        server_debug: bool,

        /// Report directory, overrides report.output_dir
        #[arg(long)]
        reports: Option<PathBuf>,
    },

    /// List available simulators
    Devices {
        /// Only list this family (iphone, ipad, tv) and show the one a run would pick
        #[arg(short, long)]
        family: Option<DeviceFamily>,

        /// Read `simctl list devices -j` output from a file instead of running simctl
        #[arg(long)]
        from_json: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

fn parse_target(s: &str) -> std::result::Result<TargetType, String> {
    match s {
        "simulator" => Ok(TargetType::Simulator),
        "device" => Ok(TargetType::Device),
        "host" => Ok(TargetType::Host),
        other => Err(format!(
            "unknown target '{}' (expected simulator, device or host)",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            target,
            os,
            arch,
            device_name,
            sdk,
            sign_identity,
            provisioning_profile,
            skip_signing,
            test,
            quiet_timeout,
            server_debug,
            reports,
        } => {
            let overrides = Overrides {
                target,
                os,
                arch,
                device_name,
                sdk,
                sign_identity,
                provisioning_profile,
                skip_signing,
                test_filter: test,
                quiet_timeout_secs: quiet_timeout,
                server_debugging: server_debug,
                debug_logging: cli.verbose,
            };
            let code = run_tests(&cli.config, &cli.basedir, overrides, reports, cli.verbose).await?;
            std::process::exit(code);
        }
        Commands::Devices { family, from_json } => list_devices(family, from_json).await,
        Commands::Validate => validate_config(&cli.config, &cli.basedir),
        Commands::Init => init_config(&cli.basedir),
    }
}

/// Loads the configuration; a missing default file means all defaults.
fn load(config_path: &Path, basedir: &Path) -> Result<Config> {
    let path = basedir.join(config_path);
    if !path.exists() && config_path == Path::new(DEFAULT_CONFIG_FILE) {
        info!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
        return Ok(Config::default());
    }
    let config = config::load_config(&path)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

async fn run_tests(
    config_path: &Path,
    basedir: &Path,
    overrides: Overrides,
    reports: Option<PathBuf>,
    verbose: bool,
) -> Result<i32> {
    let mut config = load(config_path, basedir)?;
    config.apply_overrides(&overrides);
    if let Some(dir) = reports {
        config.report.output_dir = dir;
    }
    config.validate()?;

    let plan = config.run_plan(basedir)?;
    info!("Running {} test classes", plan.units.len());

    let mut listener = MultiListener::new().with_listener(ConsoleReporter::new(verbose));
    if config.report.junit {
        listener = listener.with_listener(
            JUnitReporter::new(basedir.join(&config.report.output_dir))
                .with_testsuite_name(config.report.suite_name.clone()),
        );
    }

    let span = tracing::info_span!("run", run_id = %uuid::Uuid::new_v4());
    let coordinator = Coordinator::new(
        Arc::new(CommandCompiler::new(config.compile.command.clone())),
        Arc::new(SimctlEnumerator::new()),
        Arc::new(listener),
        config.run_settings(),
        span,
    )
    .with_output(console_sink());

    match coordinator.run(&plan).await {
        Ok(result) => Ok(if result.success() { 0 } else { 1 }),
        Err(failure) => {
            print_failure(&failure);
            Ok(2)
        }
    }
}

fn console_sink() -> OutputSink {
    Arc::new(|line: &OutputLine| match line {
        OutputLine::Stdout(text) => println!("{}", text),
        OutputLine::Stderr(text) => eprintln!("{}", text),
    })
}

async fn list_devices(family: Option<DeviceFamily>, from_json: Option<PathBuf>) -> Result<()> {
    let enumerator: Box<dyn DeviceEnumerator> = match from_json {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Box::new(StaticEnumerator::new(parse_simctl_devices(&json)?))
        }
        None => Box::new(SimctlEnumerator::new()),
    };
    let mut devices = enumerator
        .list_devices()
        .await
        .context("Failed to list simulators")?;

    let selected = family.and_then(|f| select_best_device(&devices, &SelectionCriteria::new(f)).ok());
    if let Some(family) = family {
        devices.retain(|d| d.family == family);
    }
    devices.sort_by(|a, b| {
        a.family
            .to_string()
            .cmp(&b.family.to_string())
            .then_with(|| b.version.cmp(&a.version))
            .then_with(|| a.name.cmp(&b.name))
    });

    println!("Found {} devices:", devices.len());
    for device in &devices {
        println!("  {}", device);
    }
    if let Some(device) = selected {
        println!();
        println!("Selected: {}", device);
    }
    Ok(())
}

fn validate_config(config_path: &Path, basedir: &Path) -> Result<()> {
    let config = match load(config_path, basedir).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    let target = match config.target.kind {
        TargetType::Simulator => "simulator",
        TargetType::Device => "device",
        TargetType::Host => "host",
    };
    println!("  Target: {} ({})", target, config.target.family);
    println!("  OS/arch: {}/{}", config.compile.os, config.compile.arch);
    println!("  Quiet timeout: {}s", config.run.quiet_timeout_secs);
    println!("  Connect timeout: {}s", config.run.connect_timeout_secs);
    if config.report.junit {
        println!("  JUnit reports: {}", config.report.output_dir.display());
    }
    Ok(())
}

fn init_config(basedir: &Path) -> Result<()> {
    let path = basedir.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(&path, config::INIT_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  robovm-test run");

    Ok(())
}
