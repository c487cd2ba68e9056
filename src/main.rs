//! rust_acq command line interface.
//!
//! `devices` lists what the registry exposes; `capture` runs a bounded
//! acquisition from a simulated camera into one of the storage sinks.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_acq::config::Settings;
use rust_acq::properties::StorageDimension;
use rust_acq::registry::DeviceRegistry;
use rust_acq::runtime::{setup, Runtime};
use rust_acq::storage::capabilities_for;
use std::path::Path;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "rust_acq", version, about = "Multi-stream video acquisition runtime")]
struct Cli {
    /// Settings file to load (TOML, path without the extension).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the cameras and storage sinks the registry exposes.
    Devices,

    /// Capture frames from a simulated camera into a storage sink.
    Capture {
        /// Camera selection pattern (case-insensitive regex).
        #[arg(long, default_value = "simulated.*radial.*")]
        camera: String,

        /// Storage selection pattern (case-insensitive regex).
        #[arg(long, default_value = "tiff")]
        storage: String,

        /// Output uri.
        #[arg(long, default_value = "out.tif")]
        uri: String,

        /// Number of frames to capture.
        #[arg(long, default_value_t = 100)]
        frames: u64,

        /// Frame width in pixels.
        #[arg(long, default_value_t = 640)]
        width: u32,

        /// Frame height in pixels.
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref())?;
    init_tracing(&settings);

    match cli.command {
        Command::Devices => {
            let registry = DeviceRegistry::with_simulated_devices();
            for descriptor in registry.devices() {
                println!(
                    "{:<8} {}",
                    descriptor.identifier.kind.to_string(),
                    descriptor.identifier.name
                );
            }
            Ok(())
        }
        Command::Capture {
            camera,
            storage,
            uri,
            frames,
            width,
            height,
        } => {
            // Bare output names land under the configured data root.
            let uri = if uri.starts_with("file://") || Path::new(&uri).is_absolute() {
                uri
            } else {
                settings.data_root.join(&uri).to_string_lossy().into_owned()
            };

            let mut runtime = Runtime::new(settings)?;
            let mut properties = setup(&mut runtime, &camera, &storage)?;
            let stream = &mut properties.video[0];
            stream.camera.settings.shape = (width, height);
            stream.storage.settings.uri = uri.clone();
            stream.max_frame_count = frames;

            // Chunked sinks need a dimension layout; default to whole-frame
            // spatial chunks, 32 frames deep.
            let chunked = capabilities_for(&stream.storage.identifier)?.chunking_is_supported;
            if chunked && stream.storage.settings.acquisition_dimensions.is_empty() {
                stream.storage.settings.acquisition_dimensions = vec![
                    StorageDimension::space("x", width, width),
                    StorageDimension::space("y", height, height),
                    StorageDimension::time("t", 0, 32),
                ];
            }

            runtime.apply_configuration(&properties)?;
            runtime.start()?;
            runtime.stop()?;
            println!("wrote {frames} frames to '{uri}'");
            Ok(())
        }
    }
}
