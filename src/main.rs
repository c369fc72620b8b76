/// Image capture
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use thiserror::Error;
use crate::context::{BuildContext, GalleryTarget};
use crate::gateway::CloudGateway;
use crate::naming::Names;
use crate::pipeline::{CapturePipeline, Outcome};

mod auth;
mod azure;
mod cleanup;
mod config;
mod context;
mod gateway;
mod naming;
mod pipeline;
mod poll;
mod resources;
mod script;

/// Capture a generalized image from a running VM, without touching the VM.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Snapshot the VM's OS disk, generalize a copy of it in a temporary VM,
    /// and capture the result as an image.
    Capture(config::runtime::Params),
    /// Print the resource names a capture started now would use.
    Names {
        #[arg(long)]
        vm_name: String,

        #[arg(long)]
        image_version_major: Option<u32>,
    },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration file: {0}")]
    ConfigParse(#[from] config::file::Error),

    #[error("configuration: {0}")]
    Config(#[from] config::runtime::Error),

    #[error("resource names: {0}")]
    Naming(#[from] naming::Error),

    #[error("authenticate: {0}")]
    Auth(#[from] auth::Error),

    #[error("resource manager client: {0}")]
    Gateway(#[from] gateway::Error),

    #[error("gallery image definition: {0}")]
    Gallery(gateway::Error),

    #[error("generalization script: {0}")]
    Script(#[from] script::Error),

    #[error("capture: {0}")]
    Capture(#[from] pipeline::Error),

    #[error("image {} was captured, but cleanup left {problems} problem(s) behind; remove the listed resources manually", .outcome.image)]
    Cleanup { problems: usize, outcome: Outcome },
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, this function will
/// detect whether a config file with the default file name exists in the
/// working directory. If it does, it is used implicitly. If not, we ignore any read errors.
fn read_config(args: &Cli) -> Result<config::file::File, Error> {
    const DEFAULT_CONFIG_FILE: &str = "imgcap.toml";

    let config_file = match &args.config {
        None => {
            if std::fs::metadata(DEFAULT_CONFIG_FILE)
                .map(|metadata| metadata.is_file())
                .unwrap_or(false)
            {
                Some(DEFAULT_CONFIG_FILE.to_string())
            } else {
                None
            }
        }
        Some(c) => Some(c.clone()),
    };

    Ok(if let Some(config_file) = config_file {
        config::file::File::default_with_user_config_file(&config_file)?
    } else {
        config::file::File::default()
    })
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {}", err);
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    let cfg_file = read_config(&args)?;

    info!("imgcap {}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Names {
            vm_name,
            image_version_major,
        } => {
            let major = image_version_major.unwrap_or(cfg_file.image_version_major);
            let names = Names::derive(&vm_name, Local::now().naive_local(), major)?;
            print_names(&names);
            Ok(())
        }
        Commands::Capture(params) => {
            let cfg = config::runtime::Config::new(&cfg_file, params)?;
            info!("Capturing {} in {}", cfg.vm_name, cfg.resource_group);

            let token = auth::token(&cfg.azure).await?;
            let gateway = azure::ArmClient::new(
                &cfg.azure.management_endpoint,
                &cfg.subscription,
                token,
                cfg.operation_policy,
            )?;

            let result = capture(&gateway, &cfg, Local::now().naive_local()).await;
            if let Ok(outcome) | Err(Error::Cleanup { outcome, .. }) = &result {
                print_outcome(outcome);
            }
            result.map(|_| ())
        }
    }
}

/// Check preconditions, run the pipeline, and fold its report into one result.
///
/// Preconditions run before anything is created: a failure there leaves
/// nothing to clean up. A run whose cleanup failed is a failed run, even
/// when the image was captured.
async fn capture<G: CloudGateway + ?Sized>(
    gateway: &G,
    cfg: &config::runtime::Config,
    built_at: NaiveDateTime,
) -> Result<Outcome, Error> {
    let script = cfg.script.verify().await?;

    let gallery = match &cfg.gallery {
        Some(coordinates) => Some(
            GalleryTarget::resolve(gateway, coordinates.clone())
                .await
                .map_err(Error::Gallery)?,
        ),
        None => None,
    };

    let context = BuildContext::new(cfg, built_at, gallery, script)?;
    info!(
        "Build time {built_at}: temporary resources go to {}, the image will be {}",
        context.names.resource_group, context.names.image
    );

    let report = CapturePipeline::new(gateway, context).run().await;
    info!("Pipeline finished in state {:?}", report.state);
    for retained in &report.cleanup.retained {
        warn!("Left in place: {retained}");
    }
    for err in &report.cleanup.errors {
        error!("{err}");
    }

    let outcome = report.result?;
    if !report.cleanup.is_clean() {
        return Err(Error::Cleanup {
            problems: report.cleanup.errors.len(),
            outcome,
        });
    }
    Ok(outcome)
}

fn print_outcome(outcome: &Outcome) {
    println!("image: {}", outcome.image);
    if let Some(version) = &outcome.image_version {
        println!("image version: {version}");
    }
}

fn print_names(names: &Names) {
    println!("snapshot:           {}", names.snapshot);
    println!("resource group:     {}", names.resource_group);
    println!("disk:               {}", names.disk);
    println!("virtual network:    {}", names.virtual_network);
    println!("subnet:             {}", names.subnet);
    println!("security group:     {}", names.security_group);
    println!("public address:     {}", names.public_address);
    println!("network interface:  {}", names.network_interface);
    println!("virtual machine:    {}", names.virtual_machine);
    println!("image:              {}", names.image);
    println!("image version:      {}", names.image_version);
}
