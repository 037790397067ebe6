pub mod correlate;
pub mod icmp;
pub mod merge;
pub mod tcp;

pub use correlate::*;
pub use icmp::*;
pub use merge::*;
pub use tcp::*;

use anyhow::Result;

/// Run a blocking receive loop on a dedicated OS thread, converting panics
/// into errors the caller can surface.
pub(crate) fn spawn_receiver_thread<F>(
    name: &'static str,
    f: F,
) -> std::thread::JoinHandle<Result<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    std::thread::spawn(move || {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(anyhow::anyhow!("{} receiver panicked: {}", name, msg))
            }
        }
    })
}
