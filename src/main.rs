use env_logger::Env;
use log::{debug, error, info, warn};
use mal_client::{
    app::{build_context, AppContext},
    env_flags,
    model::{NoticeTone, Task},
    tracker::{ConnectionState, TrackerEvent},
};
use tokio::sync::broadcast::error::RecvError;

fn main() -> anyhow::Result<()> {
    let verbose = std::env::args().any(|arg| arg.eq_ignore_ascii_case("--verbose"))
        || env_flags::verbose_logging();
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let context = build_context()?;
    info!("Settings loaded from {:?}", context.config.config_path());
    let runtime = context.runtime.clone();
    runtime.block_on(monitor(context))
}

async fn monitor(context: AppContext) -> anyhow::Result<()> {
    let mut events = context.tracker.subscribe();
    context.start();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("Failed to listen for Ctrl-C: {err}");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Monitor fell behind; skipped {skipped} task event(s)");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    context.shutdown().await;
    Ok(())
}

fn log_event(event: &TrackerEvent) {
    match event {
        TrackerEvent::Connection(ConnectionState::Connected) => info!("Backend connected"),
        TrackerEvent::Connection(ConnectionState::Disconnected { reason }) => {
            warn!("Backend disconnected ({reason}); reconnecting")
        }
        TrackerEvent::Snapshot(tasks) => {
            let in_flight = tasks.iter().filter(|task| task.is_in_flight()).count();
            info!("{} task(s) known, {in_flight} in flight", tasks.len());
            for task in tasks {
                debug!("  {}", describe(task));
            }
        }
        TrackerEvent::Updated(task) => match task.notice() {
            Some(notice) => match notice.tone {
                NoticeTone::Success => info!("{}", notice.message),
                NoticeTone::Failure => error!("{}", notice.message),
                NoticeTone::Cancelled => warn!("{}", notice.message),
            },
            None => debug!("{}", describe(task)),
        },
        TrackerEvent::Removed(id) => info!("Task {id} removed"),
        TrackerEvent::InstallationsChanged => info!("Managed UI installations changed"),
    }
}

fn describe(task: &Task) -> String {
    let mut line = format!(
        "[{}] {} {} {:.1}%",
        task.kind.label(),
        task.label,
        task.status.slug(),
        task.progress
    );
    if task.total_bytes > 0 {
        line.push_str(&format!(
            " ({}/{} bytes)",
            task.transferred_bytes, task.total_bytes
        ));
    }
    if let Some(text) = task.status_text.as_deref() {
        line.push_str(" - ");
        line.push_str(text);
    }
    line
}
