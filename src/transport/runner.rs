/// 单线程任务执行器
///
/// 每个服务端/客户端实例拥有两个执行器：I/O 执行器（独占所有 QUIC 状态与 socket）
/// 和事件执行器（投递访问者回调）。投递到同一执行器的任务按投递顺序执行。
use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOCAL_STATE: RefCell<Option<Box<dyn Any>>> = RefCell::new(None);
}

pub struct TaskRunner {
    name: String,
    sender: Mutex<Option<flume::Sender<Task>>>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Plain worker thread; tasks run in post order.
    pub fn spawn(name: &str) -> io::Result<Arc<Self>> {
        let (sender, receiver) = flume::unbounded::<Task>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            while let Ok(task) = receiver.recv() {
                task();
            }
            clear_local_state();
        })?;
        Ok(Self::from_parts(name, sender, handle))
    }

    /// Worker thread hosting a current-thread tokio runtime and a `LocalSet`,
    /// so tasks may `spawn_local` futures that live on this thread.
    pub fn spawn_with_runtime(name: &str) -> io::Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (sender, receiver) = flume::unbounded::<Task>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                while let Ok(task) = receiver.recv_async().await {
                    task();
                    tokio::task::consume_budget().await;
                }
                // Drop I/O state while the runtime is still alive.
                clear_local_state();
            });
        })?;
        Ok(Self::from_parts(name, sender, handle))
    }

    fn from_parts(name: &str, sender: flume::Sender<Task>, handle: JoinHandle<()>) -> Arc<Self> {
        tracing::debug!("[START] task runner {}", name);
        Arc::new(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueue `task` without waiting. Returns false once the runner is stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Run `task` on this runner and block until it returns its result.
    ///
    /// Called on the runner's own thread the task runs inline, since waiting
    /// for our own queue would never return. `None` means the runner stopped
    /// before the task could run.
    pub fn invoke<F, R>(&self, task: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.belongs_to_current_thread() {
            return Some(task());
        }

        let (reply_tx, reply_rx) = flume::bounded(1);
        let posted = self.post(move || {
            let _ = reply_tx.send(task());
        });
        if !posted {
            return None;
        }
        reply_rx.recv().ok()
    }

    /// Stop accepting tasks, let the queued ones finish and join the thread.
    pub fn stop(&self) {
        // Dropping the only sender ends the receive loop after the backlog.
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if self.belongs_to_current_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[ERROR] task runner {} panicked", self.name);
            }
        }
        tracing::debug!("[STOP] task runner {}", self.name);
    }

    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner").field("name", &self.name).finish()
    }
}

/// Install the state owned by the current runner thread, replacing any previous one.
pub fn set_local_state<S: 'static>(state: S) {
    LOCAL_STATE.with(|slot| {
        *slot.borrow_mut() = Some(Box::new(state));
    });
}

/// Remove the current thread's state if it has type `S`.
pub fn take_local_state<S: 'static>() -> Option<S> {
    LOCAL_STATE
        .try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            if slot.as_ref().map_or(false, |state| state.is::<S>()) {
                slot.take().and_then(|state| state.downcast::<S>().ok()).map(|state| *state)
            } else {
                None
            }
        })
        .ok()
        .flatten()
}

/// Run `f` against the current thread's state.
///
/// Returns `None` when no state of type `S` is installed, which is how a task
/// that outlived its owner turns into a no-op. A nested call from inside `f`
/// also gets `None`.
pub fn with_local_state<S: 'static, R>(f: impl FnOnce(&mut S) -> R) -> Option<R> {
    LOCAL_STATE
        .try_with(|slot| {
            let mut slot = slot.try_borrow_mut().ok()?;
            let state = slot.as_mut()?.downcast_mut::<S>()?;
            Some(f(state))
        })
        .ok()
        .flatten()
}

fn clear_local_state() {
    let state = LOCAL_STATE.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
    drop(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_post_order() {
        let runner = TaskRunner::spawn("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            assert!(runner.post(move || seen.lock().push(i)));
        }
        runner.invoke(|| ()).unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_invoke_blocks_until_result() {
        let runner = TaskRunner::spawn("test-invoke").unwrap();
        let value = runner.invoke(|| {
            thread::sleep(Duration::from_millis(20));
            42
        });
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_invoke_on_own_thread_takes_fast_path() {
        let runner = TaskRunner::spawn("test-fast-path").unwrap();
        let inner = runner.clone();
        let result = runner.invoke(move || {
            assert!(inner.belongs_to_current_thread());
            // Nested invoke on the same runner must not deadlock.
            inner.invoke(|| 7)
        });
        assert_eq!(result, Some(Some(7)));
    }

    #[test]
    fn test_invoke_after_stop_returns_none() {
        let runner = TaskRunner::spawn("test-stopped").unwrap();
        runner.stop();
        assert!(runner.is_stopped());
        assert!(!runner.post(|| ()));
        assert_eq!(runner.invoke(|| 1), None);
    }

    #[test]
    fn test_stop_drains_backlog() {
        let runner = TaskRunner::spawn("test-drain").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            runner.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        runner.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_nested_local_state_access_yields_none() {
        let runner = TaskRunner::spawn("test-nested").unwrap();
        runner.invoke(|| set_local_state(1u32)).unwrap();
        let nested = runner
            .invoke(|| with_local_state::<u32, _>(|_| with_local_state::<u32, _>(|n| *n)))
            .unwrap();
        assert_eq!(nested, Some(None));
        let taken = runner
            .invoke(|| with_local_state::<u32, _>(|_| take_local_state::<u32>()))
            .unwrap();
        assert_eq!(taken, Some(None));
        // The outer borrow is released afterwards.
        assert_eq!(runner.invoke(|| with_local_state::<u32, _>(|n| *n)).unwrap(), Some(1));
    }

    #[test]
    fn test_local_state_is_per_thread() {
        let runner = TaskRunner::spawn("test-state").unwrap();
        runner.invoke(|| set_local_state(5u32)).unwrap();
        let inside = runner.invoke(|| with_local_state::<u32, _>(|n| { *n += 1; *n })).unwrap();
        assert_eq!(inside, Some(6));
        // The test thread has no state installed.
        assert_eq!(with_local_state::<u32, _>(|n| *n), None);
        // A state of another type is invisible.
        assert_eq!(runner.invoke(|| with_local_state::<String, _>(|s| s.len())).unwrap(), None);
        assert_eq!(runner.invoke(take_local_state::<u32>).unwrap(), Some(6));
        assert_eq!(runner.invoke(|| with_local_state::<u32, _>(|n| *n)).unwrap(), None);
    }

    #[test]
    fn test_runtime_runner_can_spawn_local() {
        let runner = TaskRunner::spawn_with_runtime("test-runtime").unwrap();
        let (tx, rx) = flume::bounded(1);
        runner.post(move || {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.send("done");
            });
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "done");
    }
}
