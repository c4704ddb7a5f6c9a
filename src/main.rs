/**
 * m2m100-local: offline M2M100 translation.
 *
 * `serve` loads the model and answers HTTP requests, `fetch` downloads the
 * artifacts, `verify` checks a model directory against its manifest.
 */
use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use m2m100_local::cli::{Args, Commands};
use m2m100_local::config::FileConfig;
use m2m100_local::downloads::{self, ArtifactManifest};
use m2m100_local::{onnx_runtime, paths, server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let file = args.config.as_deref().map(FileConfig::load).transpose()?;

    match args.command {
        Commands::Serve(serve) => {
            let (runtime, server_config) = serve.into_configs(file.as_ref());
            runtime.validate()?;
            runtime.ensure_artifacts()?;

            info!(
                model_id = %runtime.model_id,
                model_path = %runtime.model_path.display(),
                preload = runtime.preload,
                "starting translation service"
            );
            server::serve(onnx_runtime(runtime), &server_config).await?;
        }
        Commands::Fetch(fetch) => {
            let options = fetch.into_options();
            let manifest = downloads::fetch(&options).await?;
            info!(
                files = manifest.artifacts.len(),
                bytes = manifest.total_bytes(),
                "download complete, manifest saved to {}",
                ArtifactManifest::path_in(&paths::expand_home(&options.target_dir)).display()
            );
        }
        Commands::Verify { model_path } => {
            let model_path = paths::expand_home(&model_path.unwrap_or_else(paths::default_model_path));
            let manifest = ArtifactManifest::load(&model_path)?;
            let issues = manifest.verify(&model_path)?;
            if !issues.is_empty() {
                for issue in &issues {
                    tracing::error!("{issue}");
                }
                bail!("{} of {} artifacts failed verification", issues.len(), manifest.artifacts.len());
            }
            info!(
                "{} artifacts verified in {}",
                manifest.artifacts.len(),
                model_path.display()
            );
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
