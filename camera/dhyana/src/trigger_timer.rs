use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use tucam::{Device, TucamSdk};

use crate::Result;

#[derive(Default)]
struct StopFlag {
    stop: Mutex<bool>,
    cond: Condvar,
}

/// Fires software triggers at a fixed period on its own thread.
///
/// The first trigger is fired immediately. With a non-zero `nb_triggers`
/// the thread ends by itself after that many successful triggers.
pub(crate) struct SoftTriggerTimer {
    flag: Arc<StopFlag>,
    join_handle: Option<JoinHandle<()>>,
}

impl SoftTriggerTimer {
    pub(crate) fn start<S>(device: Arc<Device<S>>, period: Duration, nb_triggers: u64) -> Result<Self>
    where
        S: TucamSdk + 'static,
    {
        let flag = Arc::new(StopFlag::default());
        let thread_flag = flag.clone();
        let join_handle = std::thread::Builder::new()
            .name("dhyana-soft-trigger".to_string())
            .spawn(move || run(&thread_flag, &device, period, nb_triggers))?;
        debug!("software trigger timer started, period {} ms", period.as_millis());
        Ok(Self {
            flag,
            join_handle: Some(join_handle),
        })
    }

    /// Stop firing and wait for the timer thread to end.
    pub(crate) fn stop(&mut self) {
        *self.flag.stop.lock() = true;
        self.flag.cond.notify_all();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("software trigger thread panicked");
            }
        }
    }
}

impl Drop for SoftTriggerTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<S: TucamSdk>(flag: &StopFlag, device: &Device<S>, period: Duration, nb_triggers: u64) {
    let mut fired = 0;
    let mut stop = flag.stop.lock();
    while !*stop && (nb_triggers == 0 || fired < nb_triggers) {
        let next = Instant::now() + period;
        match MutexGuard::unlocked(&mut stop, || device.do_software_trigger()) {
            Ok(()) => fired += 1,
            Err(e) => debug!("software trigger failed: {e}"),
        }
        while !*stop {
            if flag.cond.wait_until(&mut stop, next).timed_out() {
                break;
            }
        }
    }
    debug!(
        "closing thread {:?} ({:?}) after {fired} triggers",
        std::thread::current().name(),
        std::thread::current().id(),
    );
}
