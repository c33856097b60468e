use ffmpeg_ingest::status::Status;

mod config;
mod pipeline;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("ffmpeg_ingest", log::LevelFilter::Debug)
        .filter_module("av_ingest", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    ffmpeg_ingest::init().unwrap_or_else(|e| {
        eprintln!("Error initializing ffmpeg: {}", e);
        std::process::exit(1);
    });

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: av-ingest <pipeline.json>");
        std::process::exit(2);
    };
    let config = config::PipelineConfig::load(&path).unwrap_or_else(|e| {
        eprintln!("Error loading {}: {:#}", path, e);
        std::process::exit(2);
    });

    let status = Status::new();
    let pipeline_status = status.clone();
    let mut pipeline =
        tokio::task::spawn_blocking(move || pipeline::run(config, pipeline_status));

    let result = loop {
        tokio::select! {
            result = &mut pipeline => break result,
            _ = tokio::signal::ctrl_c(), if !status.is_emergency() => {
                log::warn!("interrupted, stopping");
                status.set_emergency();
            },
        }
    };

    match result {
        Ok(Ok(summary)) => {
            log::info!(
                "done: {}",
                serde_json::to_string(&summary).unwrap_or_default()
            );
            std::process::exit(0);
        }
        Ok(Err(e)) => {
            log::error!("pipeline failed: {:#}", e);
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("pipeline task panicked: {}", e);
            std::process::exit(1);
        }
    }
}
