//! vcam host: pulls paced frames from the virtual camera and hands them to
//! a consumer task

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vcam::capture::SensorProbe;
use vcam::pipeline::{pull_frames, MonotonicClock};
use vcam::{ConfigHandle, FrameSample, VirtualCamera};

/// Frames in flight between the pulling thread and the consumer
const CHANNEL_DEPTH: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vcam=debug")))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("vcam launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = ConfigHandle::load(config_path);
    let probe = SensorProbe::run(&config.snapshot().sensors);
    info!("Sensor probe: {:?}", probe);

    let mut camera = VirtualCamera::open(config.clone(), &probe, Arc::new(MonotonicClock::new()));
    camera.start()?;
    let counters = camera.counters();

    let (tx, rx) = bounded::<(FrameSample, Bytes)>(CHANNEL_DEPTH);
    let running = Arc::new(AtomicBool::new(true));

    // single pulling thread: pacing sleeps must not stall the runtime
    let pull_running = running.clone();
    let puller = thread::Builder::new()
        .name("vcam-pull".into())
        .spawn(move || {
            let result = pull_frames(&mut camera, &tx, &pull_running);
            if let Err(e) = &result {
                error!("Failed to fill frame: {}", e);
            }
            camera.stop();
            result
        })?;

    let mut consumer = tokio::spawn(async move {
        while let Ok((sample, frame)) = rx.recv_async().await {
            if sample.discontinuity {
                warn!("Discontinuity at {} ticks", sample.start);
            }
            if counters.frames_delivered() % 300 == 0 {
                info!(
                    "{} frames delivered, {} dropped, {} bytes/frame",
                    counters.frames_delivered(),
                    counters.frames_dropped(),
                    frame.len()
                );
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let config = config.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading configuration");
                config.reload();
            }
        });
    }

    // the consumer finishes on its own once the pulling thread drops the sender
    let source_ended = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
            false
        }
        done = &mut consumer => {
            done?;
            warn!("Frame source ended");
            true
        }
    };
    running.store(false, Ordering::Relaxed);

    let pulled = puller.join().map_err(|_| eyre!("pulling thread panicked"))?;
    if !source_ended {
        consumer.await?;
    }

    info!("vcam shutting down");
    pulled.map_err(Into::into)
}
