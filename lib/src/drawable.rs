//! Off-thread animation scheduling.
//!
//! An [`AnimatedDrawable`] owns one [`Renderer`] and drives its
//! `reset`/`advance` calls on a dedicated worker thread, so the consuming
//! (UI) thread never pays for frame decoding. All cross-thread
//! communication is asynchronous: the consumer appends commands to a FIFO
//! queue the worker blocks on, and the worker reports each applied frame
//! back through the redraw callback, lending out the renderer so the
//! consumer can repaint from its surface.
//!
//! Redraw timing stays with the consumer: each completion carries the
//! command's enqueue timestamp and, for scheduling commands, the delay of
//! the frame that was just produced. The consumer repaints immediately and
//! arms its own timer at `queued_at + next_delay`, calling
//! [`AnimatedDrawable::tick`] when it fires.
//!
//! The `Recycle` sentinel is always the last command processed: it clears
//! everything still queued, makes later enqueues silent no-ops, and lets
//! the worker recycle the renderer exactly once before terminating.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::renderer::Renderer;

/// Report of one applied frame command, delivered on the worker thread.
pub struct FrameUpdate {
    /// When the command that produced this frame was enqueued.
    pub queued_at: Instant,
    /// Delay of the produced frame, present only for scheduling commands.
    /// The consumer should arm its next redraw at `queued_at + next_delay`.
    pub next_delay: Option<Duration>,
}

/// Callback invoked from the worker thread every time a frame command has
/// been applied. The renderer is borrowed for the duration of the call, so
/// the consumer can repaint from [`Renderer::bitmap`] without any locking:
/// the worker does not touch the surface again until the callback returns.
/// If [`FrameUpdate::next_delay`] is set, the consumer arms the next
/// [`AnimatedDrawable::tick`].
pub trait RedrawCallback: Fn(&Renderer, FrameUpdate) + Send + 'static {}
impl<F> RedrawCallback for F where F: Fn(&Renderer, FrameUpdate) + Send + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Reset,
    ResetAndSchedule,
    Advance,
    AdvanceAndSchedule,
    Recycle,
}

struct QueueInner {
    commands: VecDeque<(Command, Instant)>,
    recycled: bool,
}

/// FIFO command queue between the consumer and the worker. The worker
/// blocks on `pop` while the queue is empty; it never sleeps while holding
/// the lock.
struct CommandQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
}

impl CommandQueue {
    fn new() -> Self {
        CommandQueue {
            inner: Mutex::new(QueueInner {
                commands: VecDeque::new(),
                recycled: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, command: Command) {
        let mut inner = self.inner.lock().unwrap();
        if inner.recycled {
            trace!("dropping {:?} enqueued after recycle", command);
            return;
        }
        if command == Command::Recycle {
            // Nothing queued behind this point will ever run.
            inner.commands.clear();
            inner.recycled = true;
        }
        inner.commands.push_back((command, Instant::now()));
        self.not_empty.notify_one();
    }

    fn pop(&self) -> (Command, Instant) {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.commands.pop_front() {
                return entry;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    fn is_recycled(&self) -> bool {
        self.inner.lock().unwrap().recycled
    }
}

struct Worker<Cb: RedrawCallback> {
    renderer: Renderer,
    queue: Arc<CommandQueue>,
    redraw_cb: Cb,
}

impl<Cb: RedrawCallback> Worker<Cb> {
    fn run(mut self) {
        loop {
            let (command, queued_at) = self.queue.pop();
            trace!("processing {:?}", command);
            // Frame failures are handled inside the renderer (logged and
            // skipped), and a recycled renderer makes these no-ops, so one
            // bad frame never takes the loop down.
            match command {
                Command::Reset => {
                    self.renderer.reset();
                    self.report(queued_at, false);
                }
                Command::ResetAndSchedule => {
                    self.renderer.reset();
                    self.report(queued_at, true);
                }
                Command::Advance => {
                    self.renderer.advance();
                    self.report(queued_at, false);
                }
                Command::AdvanceAndSchedule => {
                    self.renderer.advance();
                    self.report(queued_at, true);
                }
                Command::Recycle => break,
            }
        }
        debug!("animation worker terminating");
        self.renderer.recycle();
    }

    fn report(&self, queued_at: Instant, schedule: bool) {
        let next_delay = if schedule {
            self.renderer.current_delay()
        } else {
            None
        };
        (self.redraw_cb)(
            &self.renderer,
            FrameUpdate {
                queued_at,
                next_delay,
            },
        );
    }
}

/// Drives one [`Renderer`] from a dedicated worker thread.
///
/// The drawable itself lives on the consuming thread; `start`, `stop`,
/// `tick` and `set_visible` are meant to be called from there only, which
/// is why they take `&mut self`.
pub struct AnimatedDrawable {
    queue: Arc<CommandQueue>,
    handle: Option<JoinHandle<()>>,

    width: u32,
    height: u32,
    opaque: bool,
    animated: bool,

    /// An animation frame is scheduled or in flight.
    running: bool,
    /// The consumer wants the animation to play while visible.
    animating: bool,
    visible: bool,
}

impl AnimatedDrawable {
    /// Take ownership of `renderer` and spawn the worker thread that will
    /// apply frame commands to it.
    pub fn new(renderer: Renderer, redraw_cb: impl RedrawCallback) -> io::Result<Self> {
        let queue = Arc::new(CommandQueue::new());
        let (width, height, opaque, animated) = (
            renderer.width(),
            renderer.height(),
            renderer.is_opaque(),
            renderer.is_animated(),
        );

        let worker = Worker {
            renderer,
            queue: Arc::clone(&queue),
            redraw_cb,
        };
        let handle = std::thread::Builder::new()
            .name("framecell animation".into())
            .spawn(move || worker.run())?;

        Ok(AnimatedDrawable {
            queue,
            handle: Some(handle),
            width,
            height,
            opaque,
            animated,
            running: false,
            animating: false,
            visible: true,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    pub fn is_animated(&self) -> bool {
        self.animated
    }

    /// Whether an animation frame is currently scheduled or in flight.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_recycled(&self) -> bool {
        self.queue.is_recycled()
    }

    // advance: false rewinds to frame 0, true moves to the next frame.
    fn set_frame(&mut self, advance: bool, animate: bool) {
        if self.queue.is_recycled() {
            return;
        }
        self.animating = animate;
        self.running = animate;
        self.queue.push(match (advance, animate) {
            (false, false) => Command::Reset,
            (false, true) => Command::ResetAndSchedule,
            (true, false) => Command::Advance,
            (true, true) => Command::AdvanceAndSchedule,
        });
    }

    /// Start (or restart) the animation from frame 0.
    pub fn start(&mut self) {
        self.animating = true;
        if self.animated && !self.running {
            self.set_frame(false, true);
        }
    }

    /// Stop animating. The consumer must also disarm any redraw it has
    /// scheduled; a command already picked up by the worker still completes
    /// but [`FrameUpdate`]s received while not running schedule nothing.
    pub fn stop(&mut self) {
        self.animating = false;
        if self.animated && self.running {
            self.running = false;
        }
    }

    /// The armed redraw fired: advance to the next frame and keep going.
    pub fn tick(&mut self) {
        if self.running {
            self.set_frame(true, true);
        }
    }

    /// Visibility change from the hosting surface.
    ///
    /// Becoming invisible stops scheduling without touching the worker.
    /// Becoming visible resumes from the current frame, or from frame 0 if
    /// `restart` is set.
    pub fn set_visible(&mut self, visible: bool, restart: bool) {
        let changed = self.visible != visible;
        self.visible = visible;
        if !self.animated {
            return;
        }
        if visible {
            if restart || changed {
                let advance = !restart && self.running;
                self.set_frame(advance, self.animating);
            }
        } else {
            // The consumer disarms its pending redraw; an in-flight
            // command still completes.
            self.running = false;
        }
    }

    /// Release the owned renderer.
    ///
    /// Asynchronous: the pending queue is cleared and the worker recycles
    /// the renderer after finishing the command it may currently be
    /// applying. Idempotent; every later operation is a no-op.
    pub fn recycle(&mut self) {
        self.running = false;
        self.animating = false;
        self.queue.push(Command::Recycle);
    }
}

impl Drop for AnimatedDrawable {
    /// Joining the short remainder of the worker's life makes the renderer
    /// release deterministic.
    fn drop(&mut self) {
        self.recycle();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
