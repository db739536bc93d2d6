use tracing_subscriber::EnvFilter;

mod actuator;
mod analytics;
mod api;
mod config;
mod frame;
mod pipeline;
mod process;

use actuator::{ActuatorController, GpioLine};
use analytics::ObjectDetector;
use config::{AutostartConfig, Config};
use pipeline::{PipelineController, PipelineHandle, SourceDescriptor};
use process::FfmpegLauncher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=debug".parse()?))
        .init();

    let config = Config::load()?;
    let geometry = config.geometry()?;
    tracing::info!(
        geometry = %geometry,
        stream = %config.stream.url,
        target_class = config.accumulator.target_class,
        "loaded config"
    );

    let mut detector = ObjectDetector::new(&config.detector)?;
    detector.warm_up(geometry)?;

    let line = GpioLine::open(&config.actuator)?;

    let controller = PipelineController::new(
        &config,
        Box::new(FfmpegLauncher::new(&config, geometry)),
        Box::new(detector),
        ActuatorController::new(Box::new(line)),
    )?;
    let (pipeline, controller_task) = PipelineHandle::spawn(controller);

    if let Some(autostart) = &config.pipeline.autostart {
        let source = match autostart {
            AutostartConfig::Camera => SourceDescriptor::Camera {
                device: config.decoder.camera_device.clone(),
            },
            AutostartConfig::File(path) => SourceDescriptor::File(path.clone()),
        };
        if let Err(e) = pipeline.start(source).await {
            tracing::error!(error = %e, "autostart failed");
        }
    }

    let state = api::AppState::new(pipeline.clone(), config.decoder.camera_device.clone());
    let port = config.http.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(state, port).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    server_handle.abort();
    if let Err(e) = pipeline.shutdown().await {
        tracing::warn!(error = %e, "pipeline shutdown failed");
    }
    if let Err(e) = controller_task.await {
        tracing::error!("controller task failed: {}", e);
    }

    tracing::info!("shutdown complete");
    Ok(())
}
