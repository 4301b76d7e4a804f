//! packcam-watch - Operator console for the session controller
//!
//! Connects to the backend, opens a session per camera and logs every view
//! change together with the idle countdown until Ctrl-C.

use clap::Parser;
use packcam_session::camera_session::{SessionHandle, SessionView};
use packcam_session::models::CameraId;
use packcam_session::{ControllerConfig, SessionController};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "packcam-watch", version, about = "Watch packing-station camera sessions")]
struct Args {
    /// REST base URL (stream URL is derived from it)
    #[arg(long, env = "PACKCAM_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the stream and REST commands
    #[arg(long, env = "PACKCAM_TOKEN", hide_env_values = true)]
    token: String,

    /// Cameras to open, e.g. `7 8 12`
    #[arg(required = true)]
    cameras: Vec<CameraId>,
}

fn log_view(view: &SessionView, percent: f64, warning: bool) {
    tracing::info!(
        camera_id = %view.camera_id,
        connection = ?view.connection,
        recording = %view.recording,
        order_code = ?view.active_order_code,
        pending = ?view.pending_command.as_ref().map(|p| p.kind()),
        synced = view.synced,
        last_scan = ?view.last_scanned_code,
        timeout_percent = %format!("{:.0}", percent),
        timeout_warning = warning,
        "Session view"
    );
    if let Some(error) = &view.last_error {
        tracing::warn!(camera_id = %view.camera_id, error = %error, "Session error");
    }
}

async fn follow(session: SessionHandle) {
    let mut views = session.subscribe();
    loop {
        let view = views.borrow_and_update().clone();
        let reading = session.presence().await;
        log_view(&view, reading.timeout_percent, reading.is_warning);

        if views.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "packcam_session=debug,packcam_watch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting packcam-watch v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ControllerConfig::default();
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url()?,
        threshold_sec = config.watchdog_threshold.as_secs(),
        "Configuration loaded"
    );

    let controller = SessionController::new(config)?;
    controller.start(&args.token).await;

    let mut connection = controller.transport.subscribe_status();
    tokio::spawn(async move {
        while connection.changed().await.is_ok() {
            let info = connection.borrow_and_update().clone();
            tracing::info!(
                status = ?info.status,
                retry_count = info.retry_count,
                degraded = info.degraded,
                "Stream connection"
            );
        }
    });

    for camera_id in args.cameras {
        let session = controller.open_camera(camera_id).await;
        tokio::spawn(follow(session));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    controller.shutdown().await;

    Ok(())
}
