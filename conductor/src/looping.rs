//! The main loop behind `conductor run`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::console::dispatch;
use crate::io::llm::InferenceBackend;
use crate::io::notifier::Notifier;
use crate::pipeline::Pipeline;

const SHUTDOWN_CHECK: Duration = Duration::from_millis(100);

/// Why `run_loop` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// Every task is completed or stuck (non-interactive runs only).
    Finished,
    /// The shutdown flag was raised.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Keep polling after every task is terminal.
    pub interactive: bool,
    /// Log file tailed by `show-log`.
    pub log_file: PathBuf,
}

/// Drain console commands, tick the pipeline, sleep; repeat.
///
/// `out` receives command replies and operator notices. A failed console
/// command is reported through `out`; errors from a tick stop the loop.
pub fn run_loop<N, B, F>(
    pipeline: &mut Pipeline<N, B>,
    mut commands: Option<Receiver<String>>,
    shutdown: &AtomicBool,
    options: &LoopOptions,
    mut out: F,
) -> Result<LoopStop>
where
    N: Notifier,
    B: InferenceBackend,
    F: FnMut(&str),
{
    info!(
        interval_secs = options.interval.as_secs(),
        interactive = options.interactive,
        "polling mailboxes"
    );
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("shutdown requested");
            return Ok(LoopStop::Interrupted);
        }

        if let Some(rx) = &commands {
            let mut closed = false;
            loop {
                match rx.try_recv() {
                    Ok(line) => {
                        match dispatch(pipeline, &line, &options.log_file) {
                            Ok(reply) => out(&reply),
                            Err(err) => {
                                warn!(command = %line, error = %format!("{err:#}"), "console command failed");
                                out(&format!("Command failed: {err:#}"));
                            }
                        }
                        for notice in pipeline.take_notices() {
                            out(&notice);
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
            if closed {
                debug!("console closed; continuing without commands");
                commands = None;
            }
        }

        pipeline.tick()?;
        for notice in pipeline.take_notices() {
            out(&notice);
        }
        if !options.interactive && pipeline.is_finished() {
            let counts = pipeline.tasks().counts();
            info!(completed = counts.completed, stuck = counts.stuck, "run finished");
            return Ok(LoopStop::Finished);
        }

        sleep_unless_shutdown(options.interval, shutdown);
    }
}

fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + interval;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SHUTDOWN_CHECK.min(deadline - now));
    }
}
