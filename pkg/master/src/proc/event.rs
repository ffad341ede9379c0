use std::io;
use std::process::ExitStatus;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGCHLD, SIGINT};
use signal_hook::iterator::{Handle, Signals};

/// Everything that can move the orchestrator's state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The run time limit expired.
    Timeout,
    /// Interrupt from the terminal, or an `AbortHandle`.
    Abort,
    /// A child was reaped.
    WorkerExited {
        slot: usize,
        status: Option<ExitStatus>,
    },
    /// Some child changed state; reap before deciding anything.
    Reap,
}

/// Cloneable way to request an interactive abort from another thread.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Sender<Event>,
}

impl AbortHandle {
    pub(super) fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    /// Returns false when the run is already over.
    pub fn abort(&self) -> bool {
        self.tx.send(Event::Abort).is_ok()
    }
}

/// Turns SIGINT and SIGCHLD into events on the orchestrator's queue.
///
/// The handlers themselves only record the signal; all the work happens on
/// the listener thread and, after that, on the orchestrator thread.
#[derive(Debug)]
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    pub fn spawn(tx: Sender<Event>) -> io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGCHLD])?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("master-signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    let event = match signal {
                        SIGINT => Event::Abort,
                        _ => Event::Reap,
                    };
                    trace!("Signal {} -> {:?}", signal, event);
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })?;

        debug!("Signal listener started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Signal listener panicked");
            }
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop();
    }
}
