//! Frame pacing: aligning decoded-frame presentation with display vertical
//! blanks while bounding queue depth.
//!
//! Two queues under one lock. The decoder submits into `pacing` (or
//! straight into `render` when no vsync source exists); the vsync tick moves
//! one frame per blank into `render`; the render tick presents. Both queues
//! cap at `MAX_QUEUED_FRAMES` and always drop the oldest frame, freeing it
//! outside the queue lock. The sum of both queues can never exceed twice
//! the cap, which keeps the decoder's surface pool from starving.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

pub const MAX_QUEUED_FRAMES: usize = 4;

/// We may be woken slightly late, and rendering itself takes time, so never
/// wait all the way to the next vertical blank.
pub const TIMER_SLACK_MS: u64 = 3;

/// The renderer presents immediately with no internal buffering; keep one
/// frame queued so it never starves while waiting to present.
pub const RENDERER_ATTRIBUTE_NO_BUFFERING: u32 = 0x01;

/// An opaque decoded-frame handle. The timestamp field carries the
/// arrival time in microseconds, used for pacer latency statistics.
#[derive(Debug)]
pub struct Frame {
    pub handle: u64,
    pub arrival_time_us: u64,
}

/// The renderer capability surface the pacer drives.
pub trait FrameRenderer: Send {
    fn attributes(&self) -> u32 {
        0
    }

    /// Whether frames may be rendered off the main thread. When false, the
    /// pacer posts a frame-ready event instead and the owner calls
    /// [`Pacer::render_on_main_thread`].
    fn is_render_thread_supported(&self) -> bool {
        true
    }

    /// Block until the renderer can accept another frame.
    fn wait_to_render(&mut self) {}

    fn render_frame(&mut self, frame: Frame);

    /// Called on the rendering thread as it winds down.
    fn cleanup_render_context(&mut self) {}
}

/// Blocks until the display's next vertical blank.
pub trait VsyncSource: Send {
    fn wait_for_vsync(&mut self);
}

/// Session video statistics (lock-free atomics).
#[derive(Debug, Default)]
pub struct VideoStats {
    pub rendered_frames: AtomicU64,
    pub pacer_dropped_frames: AtomicU64,
    pub total_pacer_time_us: AtomicU64,
    pub total_render_time_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStatsSnapshot {
    pub rendered_frames: u64,
    pub pacer_dropped_frames: u64,
    pub total_pacer_time_us: u64,
    pub total_render_time_us: u64,
}

impl VideoStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> VideoStatsSnapshot {
        VideoStatsSnapshot {
            rendered_frames: self.rendered_frames.load(Ordering::Relaxed),
            pacer_dropped_frames: self.pacer_dropped_frames.load(Ordering::Relaxed),
            total_pacer_time_us: self.total_pacer_time_us.load(Ordering::Relaxed),
            total_render_time_us: self.total_render_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Monotonic microsecond clock for frame arrival stamps.
pub fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Serializing a high-rate stream behind a slower display's refresh adds a
/// frame of latency per blank; disable vsync when the stream clearly
/// outruns the display.
pub fn should_disable_vsync(stream_fps: i32, display_hz: i32) -> bool {
    display_hz + 5 < stream_fps
}

struct FrameQueues {
    pacing: VecDeque<Frame>,
    render: VecDeque<Frame>,
    stopping: bool,
    /// Rolling pacing-queue depths over the last display_fps/2 vsyncs.
    pacing_history: VecDeque<usize>,
    /// Rolling render-queue depths over the last max_video_fps/2 renders.
    /// Kept separate from the pacing history; the windows differ whenever
    /// the stream rate exceeds the display rate.
    render_history: VecDeque<usize>,
}

struct PacerShared {
    queues: Mutex<FrameQueues>,
    pacing_not_empty: Condvar,
    render_not_empty: Condvar,
    stats: Arc<VideoStats>,
    renderer: Mutex<Box<dyn FrameRenderer>>,
    attributes: u32,
    max_video_fps: u32,
    display_fps: u32,
    has_vsync: bool,
    has_render_thread: bool,
    frame_ready: Option<Box<dyn Fn() + Send + Sync>>,
}

pub struct Pacer {
    shared: Arc<PacerShared>,
    vsync_thread: Option<JoinHandle<()>>,
    render_thread: Option<JoinHandle<()>>,
}

impl Pacer {
    /// Build the pacer and spawn its threads: a vsync thread when a source
    /// exists, a render thread when the renderer supports one. Renderers
    /// confined to the main thread receive `frame_ready` callbacks instead
    /// and are driven through [`Pacer::render_on_main_thread`].
    pub fn new(
        renderer: Box<dyn FrameRenderer>,
        stats: Arc<VideoStats>,
        max_video_fps: u32,
        display_fps: u32,
        vsync_source: Option<Box<dyn VsyncSource>>,
        frame_ready: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let attributes = renderer.attributes();
        let has_render_thread = renderer.is_render_thread_supported();
        let has_vsync = vsync_source.is_some();

        debug!(
            max_video_fps,
            display_fps, has_vsync, has_render_thread, "Starting frame pacer"
        );

        let shared = Arc::new(PacerShared {
            queues: Mutex::new(FrameQueues {
                pacing: VecDeque::new(),
                render: VecDeque::new(),
                stopping: false,
                pacing_history: VecDeque::new(),
                render_history: VecDeque::new(),
            }),
            pacing_not_empty: Condvar::new(),
            render_not_empty: Condvar::new(),
            stats,
            renderer: Mutex::new(renderer),
            attributes,
            max_video_fps,
            display_fps,
            has_vsync,
            has_render_thread,
            frame_ready,
        });

        let vsync_thread = vsync_source.map(|mut source| {
            let shared = Arc::clone(&shared);
            let interval_ms = 1000 / u64::from(display_fps.max(1));
            std::thread::Builder::new()
                .name("pacer-vsync".to_string())
                .spawn(move || loop {
                    source.wait_for_vsync();
                    if shared.queues.lock().unwrap().stopping {
                        break;
                    }
                    Pacer::handle_vsync_on(&shared, interval_ms);
                })
                .expect("spawn vsync thread")
        });

        let render_thread = if has_render_thread {
            let shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("pacer-render".to_string())
                    .spawn(move || Pacer::render_loop(shared))
                    .expect("spawn render thread"),
            )
        } else {
            None
        };

        Self {
            shared,
            vsync_thread,
            render_thread,
        }
    }

    /// Called by the decoder thread with each decoded frame. FIFO order is
    /// preserved until a drop decision fires; drops always take the oldest
    /// frame, so the just-submitted frame is always retained.
    pub fn submit_frame(&self, frame: Frame) {
        let shared = &self.shared;
        let q = shared.queues.lock().unwrap();
        if q.stopping {
            return;
        }

        if shared.has_vsync {
            let mut q = q;
            let dropped = Self::drop_frame_for_enqueue(&mut q.pacing);
            q.pacing.push_back(frame);
            drop(q);

            // Free the dropped frame outside the lock.
            if let Some(dropped) = dropped {
                shared.stats.pacer_dropped_frames.fetch_add(1, Ordering::Relaxed);
                drop(dropped);
            }
            shared.pacing_not_empty.notify_one();
        } else {
            Self::enqueue_for_rendering_locked(shared, q, frame);
        }
    }

    /// One vsync tick: trim the pacing queue to the drop target, wait out
    /// most of the blank interval if it's empty, then move one frame to the
    /// render queue.
    pub fn handle_vsync(&self, time_until_next_vsync_ms: u64) {
        Self::handle_vsync_on(&self.shared, time_until_next_vsync_ms);
    }

    fn handle_vsync_on(shared: &PacerShared, time_until_next_vsync_ms: u64) {
        let mut q = shared.queues.lock().unwrap();
        if q.stopping {
            return;
        }

        let mut frame_drop_target = 1;
        if shared.max_video_fps > shared.display_fps {
            // More frames can arrive per second than we can display. Stay
            // lenient only while the queue depth has consistently resolved
            // to one frame or less across the history window.
            if !q.pacing_history.is_empty() && q.pacing_history.iter().all(|&depth| depth <= 1) {
                frame_drop_target = 3;
            }

            // Rolling ~500 ms of pacing queue history.
            let window = (shared.display_fps / 2).max(1) as usize;
            if q.pacing_history.len() >= window {
                q.pacing_history.pop_front();
            }
            let depth = q.pacing.len();
            q.pacing_history.push_back(depth);
        }

        // Catch up if we're several frames ahead.
        while q.pacing.len() > frame_drop_target {
            let dropped = q.pacing.pop_front();
            drop(q);
            shared.stats.pacer_dropped_frames.fetch_add(1, Ordering::Relaxed);
            drop(dropped);
            q = shared.queues.lock().unwrap();
            if q.stopping {
                return;
            }
        }

        if q.pacing.is_empty() {
            // Wait for a frame or for the blank interval (less slack) to
            // pass.
            let wait = Duration::from_millis(
                time_until_next_vsync_ms.max(TIMER_SLACK_MS) - TIMER_SLACK_MS,
            );
            let (guard, _) = shared.pacing_not_empty.wait_timeout(q, wait).unwrap();
            q = guard;
            if q.stopping || q.pacing.is_empty() {
                return;
            }
        }

        let Some(frame) = q.pacing.pop_front() else {
            return;
        };
        Self::enqueue_for_rendering_locked(shared, q, frame);
    }

    fn drop_frame_for_enqueue(queue: &mut VecDeque<Frame>) -> Option<Frame> {
        debug_assert!(queue.len() <= MAX_QUEUED_FRAMES);
        if queue.len() == MAX_QUEUED_FRAMES {
            queue.pop_front()
        } else {
            None
        }
    }

    fn enqueue_for_rendering_locked(
        shared: &PacerShared,
        mut q: MutexGuard<'_, FrameQueues>,
        frame: Frame,
    ) {
        let dropped = Self::drop_frame_for_enqueue(&mut q.render);
        q.render.push_back(frame);
        drop(q);

        if let Some(dropped) = dropped {
            shared.stats.pacer_dropped_frames.fetch_add(1, Ordering::Relaxed);
            drop(dropped);
        }

        if shared.has_render_thread {
            shared.render_not_empty.notify_one();
        } else if let Some(frame_ready) = &shared.frame_ready {
            frame_ready();
        }
    }

    fn render_loop(shared: Arc<PacerShared>) {
        loop {
            // Let the renderer gate us before touching the queue.
            shared.renderer.lock().unwrap().wait_to_render();

            let frame = {
                let mut q = shared.queues.lock().unwrap();
                while !q.stopping && q.render.is_empty() {
                    q = shared.render_not_empty.wait(q).unwrap();
                }
                if q.stopping {
                    break;
                }
                q.render.pop_front()
            };

            if let Some(frame) = frame {
                Self::render_frame_on(&shared, frame);
            }
        }

        shared.renderer.lock().unwrap().cleanup_render_context();
    }

    /// For renderers confined to the main thread: called by the event loop
    /// on each frame-ready event.
    pub fn render_on_main_thread(&self) {
        if self.render_thread.is_some() {
            return;
        }
        let frame = self.shared.queues.lock().unwrap().render.pop_front();
        if let Some(frame) = frame {
            Self::render_frame_on(&self.shared, frame);
        }
    }

    fn render_frame_on(shared: &PacerShared, frame: Frame) {
        let before = monotonic_micros();
        shared.stats.total_pacer_time_us.fetch_add(
            before.saturating_sub(frame.arrival_time_us),
            Ordering::Relaxed,
        );

        shared.renderer.lock().unwrap().render_frame(frame);

        let after = monotonic_micros();
        shared
            .stats
            .total_render_time_us
            .fetch_add(after - before, Ordering::Relaxed);
        shared.stats.rendered_frames.fetch_add(1, Ordering::Relaxed);

        // Trim the render queue if it has been deep for a while.
        let mut q = shared.queues.lock().unwrap();
        let frame_drop_target = if shared.attributes & RENDERER_ATTRIBUTE_NO_BUFFERING != 0 {
            1
        } else {
            let mut target = 0;
            if !q.render_history.is_empty() && q.render_history.iter().all(|&depth| depth == 0) {
                target = 2;
            }

            // Rolling ~500 ms of render queue history.
            let window = (shared.max_video_fps / 2).max(1) as usize;
            if q.render_history.len() >= window {
                q.render_history.pop_front();
            }
            let depth = q.render.len();
            q.render_history.push_back(depth);
            target
        };

        while q.render.len() > frame_drop_target {
            let dropped = q.render.pop_front();
            drop(q);
            shared.stats.pacer_dropped_frames.fetch_add(1, Ordering::Relaxed);
            drop(dropped);
            q = shared.queues.lock().unwrap();
            if q.stopping {
                return;
            }
        }
    }

    /// Current (pacing, render) queue depths.
    pub fn queue_depths(&self) -> (usize, usize) {
        let q = self.shared.queues.lock().unwrap();
        (q.pacing.len(), q.render.len())
    }

    fn stop(&mut self) {
        {
            let mut q = self.shared.queues.lock().unwrap();
            q.stopping = true;
        }
        self.shared.pacing_not_empty.notify_all();
        self.shared.render_not_empty.notify_all();

        if let Some(thread) = self.vsync_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.render_thread.take() {
            let _ = thread.join();
        } else {
            // No render thread: the cleanup must run on the thread that
            // rendered, which is the caller's.
            self.shared.renderer.lock().unwrap().cleanup_render_context();
        }
    }
}

impl Drop for Pacer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct RecordingRenderer {
        rendered: Arc<Mutex<Vec<u64>>>,
        attributes: u32,
        render_thread: bool,
    }

    impl FrameRenderer for RecordingRenderer {
        fn attributes(&self) -> u32 {
            self.attributes
        }

        fn is_render_thread_supported(&self) -> bool {
            self.render_thread
        }

        fn render_frame(&mut self, frame: Frame) {
            self.rendered.lock().unwrap().push(frame.handle);
        }
    }

    struct ChannelVsync {
        ticks: mpsc::Receiver<()>,
    }

    impl VsyncSource for ChannelVsync {
        fn wait_for_vsync(&mut self) {
            let _ = self.ticks.recv();
        }
    }

    fn frame(handle: u64) -> Frame {
        Frame {
            handle,
            arrival_time_us: monotonic_micros(),
        }
    }

    fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition never became true");
    }

    /// A pacer whose frames pile up in the render queue: no vsync source,
    /// main-thread-only renderer, no frame-ready callback.
    fn parked_pacer(stats: Arc<VideoStats>) -> (Pacer, Arc<Mutex<Vec<u64>>>) {
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let renderer = RecordingRenderer {
            rendered: Arc::clone(&rendered),
            attributes: 0,
            render_thread: false,
        };
        let pacer = Pacer::new(Box::new(renderer), stats, 60, 60, None, None);
        (pacer, rendered)
    }

    mod submit_path {
        use super::*;

        #[test]
        fn oldest_frame_is_dropped_at_the_cap() {
            let stats = VideoStats::new();
            let (pacer, rendered) = parked_pacer(stats.clone());

            for handle in 1..=(MAX_QUEUED_FRAMES as u64 + 1) {
                pacer.submit_frame(frame(handle));
            }

            assert_eq!(pacer.queue_depths(), (0, MAX_QUEUED_FRAMES));
            assert_eq!(stats.snapshot().pacer_dropped_frames, 1);

            // The oldest frame (1) was the casualty; the next render
            // presents frame 2 and the just-submitted frame survived.
            pacer.render_on_main_thread();
            assert_eq!(rendered.lock().unwrap().as_slice(), &[2]);
        }

        #[test]
        fn every_submitted_frame_is_accounted() {
            let stats = VideoStats::new();
            let (pacer, _rendered) = parked_pacer(stats.clone());

            let total = 20u64;
            for handle in 0..total {
                pacer.submit_frame(frame(handle));
            }
            while pacer.queue_depths().1 > 0 {
                pacer.render_on_main_thread();
            }

            let snapshot = stats.snapshot();
            assert_eq!(
                snapshot.rendered_frames + snapshot.pacer_dropped_frames,
                total
            );
        }
    }

    mod vsync_tick {
        use super::*;

        /// Pacer with a vsync thread parked on a channel we never tick, so
        /// tests drive handle_vsync() directly.
        fn vsync_pacer(
            stats: Arc<VideoStats>,
            max_video_fps: u32,
            display_fps: u32,
        ) -> (Pacer, mpsc::Sender<()>, Arc<Mutex<Vec<u64>>>) {
            let rendered = Arc::new(Mutex::new(Vec::new()));
            let renderer = RecordingRenderer {
                rendered: Arc::clone(&rendered),
                attributes: 0,
                render_thread: true,
            };
            let (tx, rx) = mpsc::channel();
            let pacer = Pacer::new(
                Box::new(renderer),
                stats,
                max_video_fps,
                display_fps,
                Some(Box::new(ChannelVsync { ticks: rx })),
                None,
            );
            (pacer, tx, rendered)
        }

        #[test]
        fn strict_target_drops_down_to_one() {
            let stats = VideoStats::new();
            let (pacer, _tx, rendered) = vsync_pacer(stats.clone(), 120, 60);

            for handle in 1..=3 {
                pacer.submit_frame(frame(handle));
            }
            // Empty history: strict target of 1. Two oldest dropped, one
            // moved to the render queue.
            pacer.handle_vsync(16);

            wait_until(|| rendered.lock().unwrap().len() == 1);
            assert_eq!(stats.snapshot().pacer_dropped_frames, 2);
            assert_eq!(rendered.lock().unwrap().as_slice(), &[3]);
            assert_eq!(pacer.queue_depths().0, 0);
        }

        #[test]
        fn consistently_shallow_history_is_lenient() {
            let stats = VideoStats::new();
            let (pacer, _tx, rendered) = vsync_pacer(stats.clone(), 120, 60);

            // Build up a history of shallow queues.
            for handle in 0..5 {
                pacer.submit_frame(frame(handle));
                pacer.handle_vsync(16);
                wait_until(|| rendered.lock().unwrap().len() == handle as usize + 1);
            }

            // Now a burst of 3: lenient target keeps them all queued.
            for handle in 10..13 {
                pacer.submit_frame(frame(handle));
            }
            pacer.handle_vsync(16);

            assert_eq!(stats.snapshot().pacer_dropped_frames, 0);
        }

        #[test]
        fn stream_at_or_below_display_rate_is_always_strict() {
            let stats = VideoStats::new();
            let (pacer, _tx, _rendered) = vsync_pacer(stats.clone(), 60, 60);

            // Prime several shallow ticks; equality must not enable the
            // lenient history path.
            for handle in 0..5 {
                pacer.submit_frame(frame(handle));
                pacer.handle_vsync(16);
            }
            for handle in 10..13 {
                pacer.submit_frame(frame(handle));
            }
            pacer.handle_vsync(16);

            // Strict target of 1 dropped the overflow.
            wait_until(|| stats.snapshot().pacer_dropped_frames == 2);
            assert_eq!(pacer.queue_depths().0, 0);
        }
    }

    mod overload {
        use super::*;

        #[test]
        fn oversubscribed_stream_accounts_every_frame() {
            let stats = VideoStats::new();
            let rendered = Arc::new(Mutex::new(Vec::new()));
            let renderer = RecordingRenderer {
                rendered: Arc::clone(&rendered),
                attributes: 0,
                render_thread: true,
            };
            let (tx, rx) = mpsc::channel();
            let pacer = Pacer::new(
                Box::new(renderer),
                stats.clone(),
                120,
                60,
                Some(Box::new(ChannelVsync { ticks: rx })),
                None,
            );

            // 120 frames at roughly 120 fps against a 60 Hz display: a
            // vsync tick for every second frame.
            let total = 120u64;
            for handle in 0..total {
                pacer.submit_frame(frame(handle));
                let (pacing, render) = pacer.queue_depths();
                assert!(pacing + render <= 2 * MAX_QUEUED_FRAMES);
                if handle % 2 == 1 {
                    tx.send(()).unwrap();
                }
                std::thread::sleep(Duration::from_millis(1));
            }

            // Drain what's left.
            for _ in 0..32 {
                tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }

            wait_until(|| {
                let s = stats.snapshot();
                let (pacing, render) = pacer.queue_depths();
                pacing == 0 && render == 0
                    && s.rendered_frames + s.pacer_dropped_frames == total
            });

            let s = stats.snapshot();
            assert_eq!(s.rendered_frames + s.pacer_dropped_frames, total);
            assert!(s.pacer_dropped_frames > 0);

            // Unblock the vsync thread before the pacer joins it.
            drop(tx);
            drop(pacer);
        }
    }

    mod render_tick {
        use super::*;

        #[test]
        fn no_buffering_renderer_keeps_one_frame_queued() {
            let stats = VideoStats::new();
            let rendered = Arc::new(Mutex::new(Vec::new()));
            let renderer = RecordingRenderer {
                rendered: Arc::clone(&rendered),
                attributes: RENDERER_ATTRIBUTE_NO_BUFFERING,
                render_thread: false,
            };
            let pacer = Pacer::new(Box::new(renderer), stats.clone(), 60, 60, None, None);

            for handle in 0..4 {
                pacer.submit_frame(frame(handle));
            }
            pacer.render_on_main_thread();

            // One rendered; the fixed target of 1 trimmed the backlog of 3
            // down to a single queued frame.
            assert_eq!(rendered.lock().unwrap().len(), 1);
            assert_eq!(pacer.queue_depths().1, 1);
            assert_eq!(stats.snapshot().pacer_dropped_frames, 2);
        }
    }

    mod vsync_override {
        use super::*;

        #[test]
        fn vsync_disabled_only_when_stream_clearly_outruns_display() {
            assert!(should_disable_vsync(120, 60));
            assert!(should_disable_vsync(66, 60));
            assert!(!should_disable_vsync(65, 60));
            assert!(!should_disable_vsync(60, 60));
            assert!(!should_disable_vsync(30, 60));
        }
    }
}
