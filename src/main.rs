use std::process::ExitCode;
use std::time::Duration;

/// Grace period after a second shutdown signal before force-exiting.
const FORCE_EXIT_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    // The first signal lets the engine cancel attempts and persist state;
    // a second one (or a hung shutdown) force-exits after the grace period.
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
        shutdown_signal().await;
        eprintln!("Second shutdown signal, forcing exit in {:?}.", FORCE_EXIT_GRACE);
        tokio::time::sleep(FORCE_EXIT_GRACE).await;
        std::process::exit(1);
    });

    let shutdown = async {
        let _ = signalled_rx.await;
    };

    match resilience::cli::run(shutdown).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(resilience::errors::exit_code(&e))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                eprintln!("Cannot listen for SIGTERM ({}), waiting for Ctrl-C only", e);
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
