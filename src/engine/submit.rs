use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use log::{error, info};
use openxr as xr;
use thread_priority::{set_current_thread_priority, ThreadPriority};

use crate::engine::bridge::{BootInfo, EngineBridge, EngineDirective};
use crate::engine::haptics::HapticsEngine;
use crate::engine::input::HapticBinding;
use crate::engine::renderer::{FrameRequest, Renderer};
use crate::engine::WgpuContext;

/// One unit of work for a submitter. Each variant carries only what its
/// frame needs.
pub enum RenderTask {
    /// Steady-state frame with latched tracking and input.
    Frame {
        request: FrameRequest,
        haptic_bindings: Vec<HapticBinding>,
    },
    /// Boot-time placeholder frame, before the engine exists.
    LoadingIcon { display_time: xr::Time },
    /// Last frame before session exit; shows nothing.
    FinalBlack { display_time: xr::Time },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Continue,
    /// The engine asked to end the session.
    ExitRequested,
}

/// Frame submission strategy. The direct implementation runs everything
/// inline; the threaded one hands work to a dedicated render thread. Both
/// produce the same observable frame stream.
pub trait FrameSubmitter {
    /// Runs the engine's one-time boot. Must be called after the first
    /// loading frame and before the first `RenderTask::Frame`.
    fn boot(&mut self, boot: BootInfo) -> Result<()>;

    fn submit(&mut self, task: RenderTask) -> Result<SubmitOutcome>;

    /// Blocks until any in-flight task has fully completed. `submit` may
    /// return while the task is still rendering on a worker; the session
    /// must not be wound down under such a frame.
    fn flush(&mut self);

    fn set_paused(&mut self, paused: bool) -> Result<()>;

    /// Tears the submitter down, waiting for any in-flight render work to
    /// fully complete first. GPU teardown during an in-flight render is
    /// undefined behavior on the target hardware, so this is a hard join.
    fn shutdown(self: Box<Self>) -> Result<()>;
}

fn run_task(
    ctx: &WgpuContext,
    renderer: &mut Renderer,
    bridge: &mut dyn EngineBridge,
    haptics: &mut HapticsEngine,
    task: RenderTask,
) -> Result<SubmitOutcome> {
    match task {
        RenderTask::LoadingIcon { display_time } | RenderTask::FinalBlack { display_time } => {
            renderer.flush_frame(display_time)?;
            Ok(SubmitOutcome::Continue)
        }
        RenderTask::Frame {
            request,
            haptic_bindings,
        } => {
            haptics.begin_frame();
            for binding in haptic_bindings {
                haptics.register(
                    binding.slot,
                    binding.device_id,
                    binding.mode,
                    binding.caps,
                    binding.sink,
                );
            }
            let directive = renderer.render_frame(ctx, bridge, haptics, &request)?;
            Ok(match directive {
                EngineDirective::Continue => SubmitOutcome::Continue,
                EngineDirective::RequestExit => SubmitOutcome::ExitRequested,
            })
        }
    }
}

/// Inline submitter: the default single-threaded model, everything on the
/// calling thread.
pub struct DirectSubmitter {
    ctx: Arc<WgpuContext>,
    renderer: Renderer,
    bridge: Box<dyn EngineBridge>,
    haptics: HapticsEngine,
}

impl DirectSubmitter {
    pub fn new(ctx: Arc<WgpuContext>, renderer: Renderer, bridge: Box<dyn EngineBridge>) -> Self {
        Self {
            ctx,
            renderer,
            bridge,
            haptics: HapticsEngine::new(),
        }
    }
}

impl FrameSubmitter for DirectSubmitter {
    fn boot(&mut self, boot: BootInfo) -> Result<()> {
        self.bridge.boot(&self.ctx, &boot)
    }

    fn submit(&mut self, task: RenderTask) -> Result<SubmitOutcome> {
        run_task(
            &self.ctx,
            &mut self.renderer,
            self.bridge.as_mut(),
            &mut self.haptics,
            task,
        )
    }

    fn flush(&mut self) {}

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.bridge.set_paused(paused);
        Ok(())
    }

    fn shutdown(mut self: Box<Self>) -> Result<()> {
        self.ctx.device.poll(wgpu::Maintain::Wait);
        self.bridge.shutdown();
        Ok(())
    }
}

struct MailboxState<T> {
    slot: Option<T>,
    busy: bool,
    closed: bool,
}

/// Single-slot rendezvous between a producer and one worker. Latching a
/// new item blocks until the previous item has been taken AND finished;
/// at most one item is ever pending or running.
pub struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    signal: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                slot: None,
                busy: false,
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Producer side. Returns false when the mailbox has been closed.
    pub fn latch(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        while (state.slot.is_some() || state.busy) && !state.closed {
            state = self.signal.wait(state).unwrap();
        }
        if state.closed {
            return false;
        }
        state.slot = Some(item);
        self.signal.notify_all();
        true
    }

    /// Worker side. Blocks for the next item; returns None once the
    /// mailbox is closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        while state.slot.is_none() && !state.closed {
            state = self.signal.wait(state).unwrap();
        }
        let item = state.slot.take();
        if item.is_some() {
            state.busy = true;
        }
        self.signal.notify_all();
        item
    }

    /// Worker side: marks the taken item fully processed.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.busy = false;
        self.signal.notify_all();
    }

    /// Blocks until no item is latched or running.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.slot.is_some() || state.busy {
            state = self.signal.wait(state).unwrap();
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.signal.notify_all();
    }
}

enum WorkerMsg {
    Boot(BootInfo),
    Task(RenderTask),
    SetPaused(bool),
}

struct WorkerFlags {
    exit_requested: AtomicBool,
    failed: AtomicBool,
}

/// Dual-threaded submitter: a dedicated render thread consumes latched
/// frame parameters through the mailbox rendezvous while the caller goes
/// back to gathering the next frame's input.
pub struct ThreadedSubmitter {
    mailbox: Arc<Mailbox<WorkerMsg>>,
    flags: Arc<WorkerFlags>,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedSubmitter {
    pub fn new(
        ctx: Arc<WgpuContext>,
        mut renderer: Renderer,
        mut bridge: Box<dyn EngineBridge>,
    ) -> Result<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let flags = Arc::new(WorkerFlags {
            exit_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });

        let worker_mailbox = Arc::clone(&mailbox);
        let worker_flags = Arc::clone(&flags);
        let worker = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                if set_current_thread_priority(ThreadPriority::Max).is_err() {
                    info!("Render thread keeps default priority");
                }
                let mut haptics = HapticsEngine::new();
                while let Some(msg) = worker_mailbox.take() {
                    let result = match msg {
                        WorkerMsg::Boot(boot) => bridge.boot(&ctx, &boot),
                        WorkerMsg::SetPaused(paused) => {
                            bridge.set_paused(paused);
                            Ok(())
                        }
                        WorkerMsg::Task(task) => {
                            match run_task(&ctx, &mut renderer, bridge.as_mut(), &mut haptics, task)
                            {
                                Ok(SubmitOutcome::ExitRequested) => {
                                    worker_flags.exit_requested.store(true, Ordering::SeqCst);
                                    Ok(())
                                }
                                Ok(SubmitOutcome::Continue) => Ok(()),
                                Err(err) => Err(err),
                            }
                        }
                    };
                    if let Err(err) = result {
                        error!("Render thread failed: {:?}", err);
                        worker_flags.failed.store(true, Ordering::SeqCst);
                    }
                    worker_mailbox.finish();
                }
                ctx.device.poll(wgpu::Maintain::Wait);
                bridge.shutdown();
            })
            .context("Cannot spawn render thread")?;

        Ok(Self {
            mailbox,
            flags,
            worker: Some(worker),
        })
    }

    fn latch(&self, msg: WorkerMsg) -> Result<()> {
        if self.flags.failed.load(Ordering::SeqCst) {
            bail!("Render thread reported a failure");
        }
        if !self.mailbox.latch(msg) {
            bail!("Render thread is shut down");
        }
        Ok(())
    }
}

impl FrameSubmitter for ThreadedSubmitter {
    fn boot(&mut self, boot: BootInfo) -> Result<()> {
        self.latch(WorkerMsg::Boot(boot))?;
        // Boot errors must surface before the first frame is latched.
        self.mailbox.wait_idle();
        if self.flags.failed.load(Ordering::SeqCst) {
            bail!("Engine boot failed on the render thread");
        }
        Ok(())
    }

    fn submit(&mut self, task: RenderTask) -> Result<SubmitOutcome> {
        self.latch(WorkerMsg::Task(task))?;
        Ok(if self.flags.exit_requested.load(Ordering::SeqCst) {
            SubmitOutcome::ExitRequested
        } else {
            SubmitOutcome::Continue
        })
    }

    fn flush(&mut self) {
        self.mailbox.wait_idle();
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.latch(WorkerMsg::SetPaused(paused))
    }

    fn shutdown(mut self: Box<Self>) -> Result<()> {
        self.mailbox.wait_idle();
        self.mailbox.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                bail!("Render thread panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::Mailbox;

    #[test]
    fn latch_waits_for_the_previous_item_to_finish() {
        let mailbox = Arc::new(Mailbox::new());
        let first_done = Arc::new(AtomicBool::new(false));

        let worker_mailbox = Arc::clone(&mailbox);
        let worker_done = Arc::clone(&first_done);
        let worker = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(item) = worker_mailbox.take() {
                seen.push(item);
                if seen.len() == 1 {
                    std::thread::sleep(Duration::from_millis(50));
                    worker_done.store(true, Ordering::SeqCst);
                }
                worker_mailbox.finish();
            }
            seen
        });

        assert!(mailbox.latch(1));
        // Must block until the worker finished item 1.
        assert!(mailbox.latch(2));
        assert!(first_done.load(Ordering::SeqCst));

        mailbox.wait_idle();
        mailbox.close();
        assert_eq!(worker.join().unwrap(), vec![1, 2]);
    }

    #[test]
    fn closed_mailbox_refuses_new_items() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        mailbox.close();
        assert!(!mailbox.latch(1));
        assert!(mailbox.take().is_none());
    }

    #[test]
    fn wait_idle_returns_immediately_when_empty() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        mailbox.wait_idle();
    }

    #[test]
    fn wait_idle_joins_the_item_still_running_after_latch() {
        let mailbox = Arc::new(Mailbox::new());
        let render_done = Arc::new(AtomicBool::new(false));

        let worker_mailbox = Arc::clone(&mailbox);
        let worker_done = Arc::clone(&render_done);
        let worker = std::thread::spawn(move || {
            while let Some(_item) = worker_mailbox.take() {
                std::thread::sleep(Duration::from_millis(50));
                worker_done.store(true, Ordering::SeqCst);
                worker_mailbox.finish();
            }
        });

        // Latching hands the item over without joining it; only wait_idle
        // guarantees the worker is done with it.
        assert!(mailbox.latch(1u32));
        mailbox.wait_idle();
        assert!(render_done.load(Ordering::SeqCst));

        mailbox.close();
        worker.join().unwrap();
    }
}
