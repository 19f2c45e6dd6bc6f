//! Process signal handling for the supervising process.
//!
//! On SIGINT or SIGTERM the handler shuts the supervisor down, then puts
//! back whatever disposition the signal had before installation and raises
//! it again, so the host process behaves exactly as it would have without
//! the supervisor in the way.

use std::{mem::MaybeUninit, ptr, sync::Arc, time::Duration};

use nix::{
    libc,
    sys::signal::{raise, Signal},
};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::supervisor::TaskSupervisor;

/// Installed shutdown-on-signal hook.
pub struct SignalHandler {
    requested: CancellationToken,
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Installs handlers for SIGINT and SIGTERM.
    ///
    /// The previous dispositions are captured first. When a signal arrives,
    /// [`shutdown_requested`](Self::shutdown_requested) fires, the supervisor
    /// is shut down with `timeout`, and the captured disposition is restored
    /// and the signal re-raised.
    ///
    /// # Errors
    ///
    /// Returns error if the dispositions cannot be read or the tokio signal
    /// streams cannot be registered.
    pub fn install(supervisor: Arc<dyn TaskSupervisor>, timeout: Duration) -> std::io::Result<Self> {
        let mut previous = Vec::with_capacity(2);
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            previous.push((sig, current_disposition(sig)?));
        }

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let requested = CancellationToken::new();
        let token = requested.clone();

        let task = tokio::spawn(async move {
            let received = tokio::select! {
                _ = interrupt.recv() => Signal::SIGINT,
                _ = terminate.recv() => Signal::SIGTERM,
            };

            info!(signal = received.as_str(), "shutdown signal received");
            token.cancel();

            let report = supervisor.shutdown(timeout).await;
            info!(
                signal = received.as_str(),
                stopped = report.total(),
                "supervisor stopped, re-raising signal"
            );

            if let Some((_, action)) = previous.iter().find(|(sig, _)| *sig == received) {
                restore_and_raise(received, action);
            }
        });

        Ok(Self { requested, task })
    }

    /// Token cancelled as soon as a shutdown signal arrives.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.requested.clone()
    }

    /// Waits until a received signal has been fully handled.
    ///
    /// Only returns if the re-raised signal did not end the process, for
    /// example because its previous disposition was to ignore it.
    pub async fn finished(self) {
        if let Err(error) = self.task.await {
            warn!(%error, "signal handler task failed");
        }
    }
}

/// Reads the disposition of `sig` without changing it.
#[allow(unsafe_code)]
fn current_disposition(sig: Signal) -> std::io::Result<libc::sigaction> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    // SAFETY: a null new action makes sigaction(2) a pure query; `current`
    // is valid writable storage for the old action.
    if unsafe { libc::sigaction(sig as libc::c_int, ptr::null(), current.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: initialised by the successful call above.
    Ok(unsafe { current.assume_init() })
}

#[allow(unsafe_code)]
fn restore_and_raise(sig: Signal, previous: &libc::sigaction) {
    // SAFETY: `previous` came from the kernel for this same signal, so it is
    // a disposition the process already ran with.
    if unsafe { libc::sigaction(sig as libc::c_int, previous, ptr::null_mut()) } != 0 {
        let error = std::io::Error::last_os_error();
        warn!(signal = sig.as_str(), %error, "failed to restore previous signal disposition");
        return;
    }
    if let Err(errno) = raise(sig) {
        warn!(signal = sig.as_str(), %errno, "failed to re-raise signal");
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use nix::{
        sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet},
        unistd::Pid,
    };

    use super::*;

    #[test]
    fn reading_a_disposition_never_resets_it() {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_IGN runs no code.
        unsafe { sigaction(Signal::SIGUSR2, &ignore) }.unwrap();

        // A default disposition, even briefly, would let one of these
        // signals terminate the test process.
        let stop = Arc::new(AtomicBool::new(false));
        let sender = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    kill(Pid::this(), Signal::SIGUSR2).unwrap();
                }
            })
        };

        for _ in 0..10_000 {
            let current = current_disposition(Signal::SIGUSR2).unwrap();
            assert_eq!(current.sa_sigaction, libc::SIG_IGN);
        }

        stop.store(true, Ordering::Relaxed);
        sender.join().unwrap();
    }
}
