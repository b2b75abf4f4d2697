//! Background thread that drives the dispatch loop.

use super::InputDispatcher;
use log::{debug, info};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Runs [`InputDispatcher::dispatch_once`] until stopped.
pub struct InputDispatcherThread {
    dispatcher: Arc<InputDispatcher>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl InputDispatcherThread {
    pub fn new(dispatcher: Arc<InputDispatcher>) -> Self {
        Self {
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn dispatcher(&self) -> &Arc<InputDispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the dispatch thread. Starting a running thread is a no-op.
    pub fn start(&mut self) -> io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let dispatcher = Arc::clone(&self.dispatcher);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("InputDispatcher".to_string())
            .spawn(move || {
                debug!("Dispatch loop started");
                while running.load(Ordering::SeqCst) {
                    dispatcher.dispatch_once();
                }
                debug!("Dispatch loop exited");
            });

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                info!("🚀 Input dispatcher thread started");
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Asks the loop to exit, wakes it and joins the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            self.dispatcher.looper().wake();
            let _ = handle.join();
            info!("🛑 Input dispatcher thread stopped");
        }
    }
}

impl Drop for InputDispatcherThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, MonotonicClock, Nsecs};
    use crate::dispatcher::{InjectionResult, InjectionSyncMode};
    use crate::input::{InputEvent, InputSource, KeyAction, KeyEvent, PolicyFlags};
    use crate::policy::DispatcherPolicy;
    use crate::window::{InputApplication, WindowHandle};
    use std::time::Duration;

    struct NoAnrPolicy;

    impl DispatcherPolicy for NoAnrPolicy {
        fn notify_anr(&self, _application: Option<&Arc<InputApplication>>, _window: Option<&WindowHandle>) -> Nsecs {
            0
        }
    }

    /// Test the thread starts, stops and can be restarted
    #[test]
    fn test_start_and_stop() -> anyhow::Result<()> {
        let dispatcher = Arc::new(InputDispatcher::new(Arc::new(NoAnrPolicy), Arc::new(MonotonicClock::new())));
        let mut thread = InputDispatcherThread::new(dispatcher);
        thread.start()?;
        assert!(thread.is_running());
        thread.stop();
        assert!(!thread.is_running());
        thread.start()?;
        assert!(thread.is_running());
        Ok(())
    }

    /// Test a running thread fails injections while dispatch is disabled
    #[test]
    fn test_running_thread_resolves_injection() -> anyhow::Result<()> {
        let clock = Arc::new(MonotonicClock::new());
        let dispatcher = Arc::new(InputDispatcher::new(Arc::new(NoAnrPolicy), clock.clone()));
        let mut thread = InputDispatcherThread::new(Arc::clone(&dispatcher));
        thread.start()?;

        // Disabled dispatch drops every event, which fails injections.
        dispatcher.set_input_dispatch_mode(false, false);
        let key = KeyEvent::new(1, InputSource::KEYBOARD, KeyAction::Down, 29, clock.now());
        let result = dispatcher.inject_input_event(
            &InputEvent::Key(key),
            1,
            0,
            InjectionSyncMode::WaitForResult,
            Duration::from_secs(5),
            PolicyFlags::empty(),
        );
        assert_eq!(result, InjectionResult::Failed);
        Ok(())
    }
}
