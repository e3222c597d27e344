//! Phoenix CLI
//!
//! Split containers into fragment directories, check and join them, or keep a
//! directory live-linked to its container.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use phoenix_rs::{
    AutoSaveMode, FileNamingMode, PhoenixBuilder, Registry, SessionConfig, SessionEvent,
};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "phoenix")]
#[command(about = "Decompose binary containers into live, self-validating fragment trees")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List format modules and their open filters
    Modules,

    /// Decompose a container into a working directory
    Split {
        container: PathBuf,
        dir: PathBuf,

        /// Module display name [default: picked from the container extension]
        #[arg(short, long)]
        module: Option<String>,

        /// Fragment file extension
        #[arg(short, long, default_value = "bin")]
        extension: String,

        /// Apply the extension even where the module chose one
        #[arg(long)]
        force_extension: bool,

        /// Clear a non-empty working directory
        #[arg(short, long)]
        yes: bool,
    },

    /// Validate a fragment directory
    Check {
        dir: PathBuf,

        #[arg(short, long)]
        module: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reassemble a fragment directory
    Join {
        dir: PathBuf,
        output: PathBuf,

        #[arg(short, long)]
        module: String,
    },

    /// Keep a working directory live until stdin closes
    Watch {
        dir: PathBuf,

        #[arg(short, long)]
        module: String,

        /// Container to decompose first
        #[arg(short, long)]
        container: Option<PathBuf>,

        /// Save after every change that leaves all fragments valid
        #[arg(long)]
        auto_save: Option<PathBuf>,

        /// Session configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Module whose save filters list the container's extension
fn module_for(registry: &Registry, container: &Path) -> Option<&'static str> {
    let ext = container.extension()?.to_string_lossy().to_lowercase();
    let wanted = format!("*.{ext}");
    registry.names().into_iter().find(|name| {
        registry
            .create(name, &Default::default())
            .map(|m| {
                m.save_filters()
                    .iter()
                    .filter_map(|f| f.split('|').nth(1))
                    .any(|patterns| patterns.split(';').any(|p| p.eq_ignore_ascii_case(&wanted)))
            })
            .unwrap_or(false)
    })
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Modules => {
            let registry = Registry::builtin();
            println!("Modules:");
            for name in registry.names() {
                println!("  {name}");
            }
            println!("Open filters:");
            for (i, filter) in registry.open_dialog_filters().into_iter().enumerate() {
                let owner = registry.module_for_filter_index(i).unwrap_or("-");
                println!("  {i:>3}  {filter}  [{owner}]");
            }
        }

        Command::Split {
            container,
            dir,
            module,
            extension,
            force_extension,
            yes,
        } => {
            let module = match module {
                Some(module) => module,
                None => match module_for(&Registry::builtin(), &container) {
                    Some(name) => name.to_string(),
                    None => bail!("no module handles {:?}; pass --module", container),
                },
            };
            let mut builder = PhoenixBuilder::new()
                .module(&module)
                .container(&container)
                .working_directory(&dir)
                .extension(extension, force_extension);
            if yes {
                builder = builder.always_clear();
            }
            let phoenix = builder
                .build()
                .with_context(|| format!("failed to split {:?} with '{}'", container, module))?;
            println!("{}", phoenix.report());
        }

        Command::Check { dir, module, json } => {
            let phoenix = PhoenixBuilder::new()
                .module(&module)
                .working_directory(&dir)
                .build()
                .with_context(|| format!("failed to load {:?}", dir))?;
            let report = phoenix.report();
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("{report}");
            }
            if !report.is_acceptable() {
                std::process::exit(1);
            }
        }

        Command::Join { dir, output, module } => {
            let phoenix = PhoenixBuilder::new()
                .module(&module)
                .working_directory(&dir)
                .build()
                .with_context(|| format!("failed to load {:?}", dir))?;
            let path = phoenix
                .join(&output)
                .with_context(|| format!("failed to write {:?}", output))?;
            info!("Wrote {:?}", path);
        }

        Command::Watch {
            dir,
            module,
            container,
            auto_save,
            config,
        } => {
            let mut settings = match &config {
                Some(path) => SessionConfig::load(path)
                    .with_context(|| format!("failed to read config {:?}", path))?,
                None => SessionConfig::default(),
            };
            if let Some(path) = auto_save {
                settings = settings.with_auto_save(AutoSaveMode::ValidOnly, path, FileNamingMode::Iterate);
            }
            let mut builder = PhoenixBuilder::from_config(settings)
                .module(&module)
                .working_directory(&dir)
                .watch();
            if let Some(container) = container {
                builder = builder.container(container).always_clear();
            }
            let phoenix = builder.build().context("failed to start session")?;

            let events = phoenix.session().subscribe();
            thread::spawn(move || {
                for event in events {
                    match event {
                        SessionEvent::VirtualFileUpdated => info!("Fragments updated"),
                        SessionEvent::Saved(path) => info!("Saved {:?}", path),
                        SessionEvent::Disabled => info!("Session stopped"),
                    }
                }
            });

            info!("Watching {:?}; close stdin to stop", dir);
            for line in io::stdin().lock().lines() {
                if line?.trim() == "report" {
                    println!("{}", phoenix.report());
                }
            }
            phoenix.session().disable();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    run(Args::parse())
}
