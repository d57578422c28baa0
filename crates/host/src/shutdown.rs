use tokio::sync::mpsc;

use faunaproc_engine::ShutdownSignal;

/// Translate CTRL+C into shutdown signals: the first asks for a graceful
/// drain, the second for an immediate stop.
pub fn spawn_ctrl_c_handler(shutdown_tx: mpsc::UnboundedSender<ShutdownSignal>) {
    tokio::spawn(async move {
        let mut stops: u8 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            stops += 1;
            if stops == 1 {
                eprintln!(
                    "Stop requested - finishing current work before exiting (press CTRL+C again to exit immediately)."
                );
                let _ = shutdown_tx.send(ShutdownSignal::Graceful);
            } else {
                let _ = shutdown_tx.send(ShutdownSignal::Immediate);
                return;
            }
        }
    });
}
