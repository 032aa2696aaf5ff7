//! Worker entrypoint, forked by the supervisor. Stdout belongs to the IPC
//! protocol; logs go to stderr.

use faaslet::ipc::{self, WorkerMsg};
use faaslet::logger::{self, LogTarget};

#[tokio::main]
async fn main() {
    let _guard = logger::init("info", LogTarget::Stderr, None).ok().flatten();

    if let Err(e) = faaslet::worker::run().await {
        tracing::error!(error = %e, "worker failed");
        // best-effort fatal report to the supervisor before exiting
        println!(
            "{}",
            ipc::encode(&WorkerMsg::Error {
                error: format!("{e:#}"),
            })
        );
        std::process::exit(1);
    }
}
