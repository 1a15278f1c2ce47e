//! # vmlab
//!
//! Command-line front end for disposable test VMs: inventory with live
//! reachability status, power transitions, remote commands and snapshot-based
//! reset between test runs.
//!
//! ## Usage
//! ```bash
//! vmlab list
//! vmlab start web1
//! vmlab exec web1 -- systemctl restart httpd
//! vmlab snapshot restore-last web1
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use vmlab_core::config::{Config, HypervisorBackend, DEFAULT_CONFIG_PATH};
use vmlab_core::mock::{MockConnector, MockProbe, ScriptedShell};
use vmlab_core::{DomainAttributes, Lab, RunOptions, VmStatus};
use vmlab_core::shell::quote;
use vmlab_hypervisor::MockDirectory;

mod cli;

use cli::{Args, Command, SnapshotAction};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        vmlab_common::init_logging_json(&args.log_level)?;
    } else {
        vmlab_common::init_logging(&args.log_level)?;
    }

    let config = load_config(&args)?;
    info!(
        hypervisor = ?config.hypervisor.backend,
        interface = %config.network.interface,
        "vmlab configured"
    );

    let lab = build_lab(config).await?;
    lab.reload().await?;

    let result = run(&lab, args.command).await;
    lab.close_all().await;

    if let Err(ref e) = result {
        error!(error = %e, "Command failed");
    }
    result
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            match Config::load(config_path) {
                Ok(cfg) => {
                    info!(config_path = %config_path, "Configuration loaded");
                    cfg
                }
                Err(e) => {
                    error!(error = %e, path = %config_path, "Failed to load configuration");
                    return Err(e);
                }
            }
        }
        None => {
            // Try default location, fall back to defaults
            match Config::load(DEFAULT_CONFIG_PATH) {
                Ok(cfg) => {
                    info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                    cfg
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default()
                }
            }
        }
    };

    let config = args.apply_overrides(config);
    config.validate()?;
    Ok(config)
}

async fn build_lab(config: Config) -> Result<Lab> {
    let lab = match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock domain directory");
            dev_lab(config)?
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                let uri = config.hypervisor.libvirt_uri.clone();
                info!(uri = %uri, "Connecting to libvirt");
                let directory: Arc<dyn vmlab_hypervisor::DomainDirectory> =
                    Arc::new(vmlab_hypervisor::LibvirtDirectory::new(&uri).await?);
                Lab::builder(config, directory).build()
            }
            #[cfg(not(feature = "libvirt"))]
            {
                tracing::warn!("Libvirt backend requested but not compiled in, falling back to mock");
                dev_lab(config)?
            }
        }
    };
    Ok(lab)
}

/// A self-contained lab: two mock domains on a scripted network.
fn dev_lab(config: Config) -> Result<Lab> {
    let directory = Arc::new(MockDirectory::new());
    let shell = Arc::new(ScriptedShell::new());
    let probe = Arc::new(MockProbe::new(Arc::clone(&directory)));

    let mut scan = String::new();
    for (i, (name, os)) in [("dev-fedora", "Fedora 39"), ("dev-rhel", "Red Hat Enterprise Linux 9")]
        .into_iter()
        .enumerate()
    {
        let mac = directory.define_with_random_mac(name, os)?;
        let ip = format!("192.168.122.{}", i + 10);
        probe.bind(&ip, name);
        scan.push_str(&format!("{}\t{}\tQEMU\n", ip, mac));
    }

    let tools = &config.tools;
    shell.respond(&config.network.scan_command, true, &scan);
    shell.respond(&tools.clone_command, true, "");
    shell.respond(&tools.resources_command, true, "");

    Ok(Lab::builder(config, directory)
        .shell(shell)
        .connector(Arc::new(MockConnector::new()))
        .probe(probe)
        .build())
}

#[derive(Serialize)]
struct ListEntry {
    #[serde(flatten)]
    attributes: DomainAttributes,
    status: VmStatus,
}

async fn run(lab: &Lab, command: Command) -> Result<()> {
    match command {
        Command::List { json } => {
            if json {
                let mut entries = Vec::new();
                for vm in lab.vms() {
                    entries.push(ListEntry {
                        attributes: vm.attributes()?,
                        status: vm.status().await?,
                    });
                }
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", lab.table().await?);
            }
        }

        Command::Status { vm } => {
            println!("{}", lab.vm(&vm)?.status().await?);
        }

        Command::Start { vm } => lab.vm(&vm)?.run_and_wait().await?,

        Command::Stop { vm } => lab.vm(&vm)?.stop_and_wait().await?,

        Command::PowerOff { vm } => lab.vm(&vm)?.power_off().await?,

        Command::Clone {
            source,
            name,
            snapshot,
        } => {
            let cloned = lab.vm(&source)?.clone_vm(&name, &snapshot).await?;
            println!("{}", cloned);
        }

        Command::Delete { vm } => lab.vm(&vm)?.delete().await?,

        Command::Exec {
            vm,
            command,
            user,
            password,
        } => {
            let options = RunOptions {
                password,
                no_warn: false,
            };
            let result = lab
                .vm(&vm)?
                .run(&user, &guest_command(&command), &options)
                .await?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if !result.success {
                bail!("command failed on {}", vm);
            }
        }

        Command::Connect { vm, user, tunnel } => {
            let vm = lab.vm(&vm)?;
            vm.run_and_wait().await?;
            let argv = vm.connect_command(&user, tunnel)?;

            info!(vm = %vm.name(), "connecting: {}", argv.join(" "));
            if tunnel {
                info!("creating ssh tunnel, logout will destroy the tunnel");
            }
            lab.close_all().await;
            return exec_interactive(&argv);
        }

        Command::Resources { vm, ram, cpus } => {
            lab.vm(&vm)?.setup_resources(ram, cpus).await?;
        }

        Command::Snapshot { action } => snapshot(lab, action).await?,

        Command::Wait {
            vm,
            status,
            timeout,
        } => {
            let target: VmStatus = status.parse()?;
            let reached = lab
                .vm(&vm)?
                .wait_for(target, timeout.map(Duration::from_secs))
                .await?;
            if !reached {
                bail!("{} did not reach {}", vm, target);
            }
        }
    }
    Ok(())
}

/// Join command-line words into one guest shell command, keeping each word
/// intact.
fn guest_command(words: &[String]) -> String {
    words
        .iter()
        .map(|word| quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn snapshot(lab: &Lab, action: SnapshotAction) -> Result<()> {
    match action {
        SnapshotAction::Take { vm, name } => lab.vm(&vm)?.snapshots().take(&name).await?,
        SnapshotAction::Restore { vm, name } => {
            lab.vm(&vm)?.snapshots().restore(&name).await?
        }
        SnapshotAction::RestoreLast { vm } => lab.vm(&vm)?.snapshots().restore_last().await?,
        SnapshotAction::Delete { vm, name } => lab.vm(&vm)?.snapshots().delete(&name).await?,
        SnapshotAction::List { vm } => {
            for name in lab.vm(&vm)?.snapshots().list().await? {
                println!("{}", name);
            }
        }
        SnapshotAction::Current { vm } => {
            let vm = lab.vm(&vm)?;
            let snapshots = vm.snapshots();
            match snapshots.current().await {
                Some(current) => println!(
                    "{} (parent: {})",
                    current.name,
                    current.parent.as_deref().unwrap_or("-")
                ),
                None => println!("-"),
            }
        }
    }
    Ok(())
}

/// Replace this process with the interactive login.
#[cfg(unix)]
fn exec_interactive(argv: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let Some((program, rest)) = argv.split_first() else {
        bail!("empty command line");
    };
    let err = std::process::Command::new(program).args(rest).exec();
    Err(err.into())
}

#[cfg(not(unix))]
fn exec_interactive(argv: &[String]) -> Result<()> {
    let Some((program, rest)) = argv.split_first() else {
        bail!("empty command line");
    };
    let status = std::process::Command::new(program).args(rest).status()?;
    if !status.success() {
        bail!("{} exited with {}", program, status);
    }
    Ok(())
}
