use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use porttool::config::ConfigDoc;
use porttool::executor::{ExecCtx, ExecSink, StdoutSink};
use porttool::profile::PortProfile;
use porttool::tools::ToolSet;
use porttool::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputArg {
    Zip,
    Image,
}

#[derive(Debug, clap::Args)]
struct Overrides {
    /// Base device boot image
    #[arg(long)]
    base_boot: Option<String>,
    /// Base device system image
    #[arg(long)]
    base_system: Option<String>,
    /// Donor (port) package zip
    #[arg(long)]
    port_zip: Option<String>,
    /// Output kind
    #[arg(long, value_enum)]
    output: Option<OutputArg>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the porting pipeline for a chipset profile
    Port {
        /// Path to a profile TOML
        profile: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
        /// Log what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the computed task plan
    Plan {
        profile: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the fully-resolved profile TOML (after imports/extends)
    Resolve { profile: PathBuf },
    /// Synthesize fs_config/file_contexts for an unpacked donor tree
    Metadata {
        /// Directory holding system/ and META-INF/
        rom_dir: PathBuf,
        /// Output directory (default: <rom_dir>/../config)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Read or edit a key=value property file
    Props {
        #[command(subcommand)]
        cmd: PropsCommand,
    },
    /// Print the SHA-256 content digest used by the base system cache
    Digest { file: PathBuf },
}

#[derive(Debug, Subcommand)]
enum PropsCommand {
    Get { file: PathBuf, key: String },
    Set { file: PathBuf, key: String, value: String },
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Port {
            profile,
            overrides,
            dry_run,
        } => cmd_port(&profile, &overrides, dry_run),
        Command::Plan {
            profile,
            overrides,
            dot,
        } => cmd_plan(&profile, &overrides, dot),
        Command::Resolve { profile } => cmd_resolve(&profile),
        Command::Metadata { rom_dir, out } => cmd_metadata(&rom_dir, out),
        Command::Props { cmd } => cmd_props(cmd),
        Command::Digest { file } => {
            println!("{}", porttool::cache::file_digest(&file)?);
            Ok(())
        }
    }
}

fn load_profile(path: &Path, o: &Overrides) -> Result<PortProfile> {
    let mut doc: ConfigDoc = porttool::config::load(path)?;
    for (key, value) in [
        ("inputs.base_boot", &o.base_boot),
        ("inputs.base_system", &o.base_system),
        ("inputs.port_zip", &o.port_zip),
    ] {
        if let Some(v) = value {
            doc.set_path(key, toml::Value::String(v.clone()))?;
        }
    }
    if let Some(kind) = o.output {
        let kind = match kind {
            OutputArg::Zip => "zip",
            OutputArg::Image => "image",
        };
        doc.set_path("output.kind", toml::Value::String(kind.into()))?;
    }
    PortProfile::from_doc(&doc)
}

fn cmd_port(path: &Path, overrides: &Overrides, dry_run: bool) -> Result<()> {
    let profile = load_profile(path, overrides)?;
    let tools = ToolSet::from_config(&profile.tools);
    let handle = porttool::runner::spawn(profile, tools, dry_run);

    let sink = StdoutSink::default();
    for ev in handle.events.iter() {
        sink.emit(ev);
    }
    handle.join()
}

fn cmd_plan(path: &Path, overrides: &Overrides, dot: bool) -> Result<()> {
    let profile = load_profile(path, overrides)?;
    let plan = porttool::runner::build_plan(&profile)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    println!("profile: {}", profile.name());
    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<14}  {:<8} {:<9}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    for op in profile.ops() {
        println!("    op: {op:?}");
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = porttool::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_metadata(rom_dir: &Path, out: Option<PathBuf>) -> Result<()> {
    let out = match out {
        Some(o) => o,
        None => rom_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("config"),
    };
    let updater = rom_dir
        .join(porttool::modules::package::SCRIPT_DIR)
        .join("updater-script");
    let script = match std::fs::read(&updater) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(Error::from(e).context(updater.display())),
    };

    let mut ctx = ExecCtx::new(false, Arc::new(StdoutSink::default()));
    ctx.set_task("metadata");
    let tables = porttool::metadata::synthesize(&ctx, rom_dir, script.as_deref())?;
    let (fs_config, file_contexts) = tables.write(&out)?;
    println!("{}", fs_config.display());
    println!("{}", file_contexts.display());
    Ok(())
}

fn cmd_props(cmd: PropsCommand) -> Result<()> {
    match cmd {
        PropsCommand::Get { file, key } => {
            let props = porttool::props::PropFile::read_only(&file)?;
            match props.get(&key) {
                Some(v) => {
                    println!("{v}");
                    Ok(())
                }
                None => Err(Error::msg(format!("{key} not set in {}", file.display()))),
            }
        }
        PropsCommand::Set { file, key, value } => porttool::props::edit(&file, |p| {
            p.set(&key, &value);
            Ok(())
        }),
    }
}
