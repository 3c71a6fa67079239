// =============================================================================
// FRAME SCHEDULER - Main loop orchestration
// =============================================================================
//
// One iteration:
//   WaitFence -> AcquireImage -> [RecreateSwapchain] -> RecordCommands
//     -> Submit -> Present -> Advance
//
// The scheduler owns only loop state. Everything that touches the GPU lives
// behind `FrameLoop`, which the renderer implements.

use std::time::{Duration, Instant};

use crate::backend::{BackendError, BackendResult};

/// Image handed out by a successful acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub image_index: u32,
    /// Still presentable, but the swapchain should be rebuilt soon
    pub suboptimal: bool,
}

/// GPU side of one frame iteration. `slot` is always `frame_counter mod N`.
pub trait FrameLoop {
    /// Block until the last submission from `slot` has retired
    fn wait_for_frame(&mut self, slot: usize) -> BackendResult<()>;

    /// Out-of-date swapchains are reported as `BackendError::SwapchainStale`
    fn acquire_image(&mut self, slot: usize) -> BackendResult<AcquiredImage>;

    /// Quiesce the device and rebuild the swapchain with its dependents.
    /// Returns `false` if the window has no area and creation was deferred.
    fn recreate_swapchain(&mut self) -> BackendResult<bool>;

    fn record_commands(&mut self, slot: usize, image_index: u32, frame_counter: u64) -> BackendResult<()>;

    fn submit(&mut self, slot: usize) -> BackendResult<()>;

    /// Returns `true` if presentation found the swapchain stale or suboptimal
    fn present(&mut self, slot: usize, image_index: u32) -> BackendResult<bool>;
}

/// What a call to `run_iteration` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Presented,
    /// Paused, holding in single-frame mode, or minimized
    Skipped,
    /// Acquire hit a stale swapchain; it was rebuilt and nothing was drawn
    Restarted,
}

/// Frame rate measured over roughly one-second windows
#[derive(Debug, Clone)]
pub struct FrameStats {
    started: Instant,
    window_start: Instant,
    window_frames: u32,
    frames_presented: u64,
    fps: f32,
}

impl FrameStats {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            window_start: now,
            window_frames: 0,
            frames_presented: 0,
            fps: 0.0,
        }
    }

    /// Count one presented frame. Returns the new rate when a window closes.
    pub fn record_frame(&mut self, now: Instant) -> Option<f32> {
        self.frames_presented += 1;
        self.window_frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        self.fps = self.window_frames as f32 / elapsed;
        self.window_frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn running_for(&self, now: Instant) -> Duration {
        now.duration_since(self.started)
    }
}

pub struct FrameScheduler {
    frame_counter: u64,
    concurrent_frames: usize,
    needs_recreation: bool,
    paused: bool,
    single_frame: bool,
    // Single-frame mode: set after a present, cleared by a step request
    holding: bool,
    stats: FrameStats,
}

impl FrameScheduler {
    pub fn new(concurrent_frames: usize, single_frame: bool) -> Self {
        Self {
            frame_counter: 0,
            concurrent_frames: concurrent_frames.max(1),
            needs_recreation: false,
            paused: false,
            single_frame,
            holding: false,
            stats: FrameStats::new(Instant::now()),
        }
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn concurrent_frames(&self) -> usize {
        self.concurrent_frames
    }

    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.concurrent_frames as u64) as usize
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }

    /// Resize, fullscreen toggle or a stale present
    pub fn request_recreation(&mut self) {
        self.needs_recreation = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
        log::info!("{}", if self.paused { "Paused" } else { "Resumed" });
    }

    pub fn is_single_frame(&self) -> bool {
        self.single_frame
    }

    /// Render exactly one more frame while in single-frame mode
    pub fn request_step(&mut self) {
        if self.single_frame {
            self.holding = false;
        }
    }

    /// Whether the window should keep asking for redraws
    pub fn wants_frames(&self) -> bool {
        !self.paused && !self.holding
    }

    pub fn run_iteration(&mut self, frame_loop: &mut impl FrameLoop) -> BackendResult<Iteration> {
        self.run_iteration_at(frame_loop, Instant::now())
    }

    pub fn run_iteration_at(
        &mut self,
        frame_loop: &mut impl FrameLoop,
        now: Instant,
    ) -> BackendResult<Iteration> {
        if !self.wants_frames() {
            return Ok(Iteration::Skipped);
        }

        // Deferred from the previous present or from a resize
        if self.needs_recreation {
            if !frame_loop.recreate_swapchain()? {
                return Ok(Iteration::Skipped);
            }
            self.needs_recreation = false;
        }

        let slot = self.current_slot();
        frame_loop.wait_for_frame(slot)?;

        let acquired = match frame_loop.acquire_image(slot) {
            Ok(acquired) => acquired,
            Err(BackendError::SwapchainStale) => {
                log::debug!("Swapchain out of date on acquire, recreating");
                self.needs_recreation = !frame_loop.recreate_swapchain()?;
                return Ok(Iteration::Restarted);
            }
            Err(err) => return Err(err),
        };
        if acquired.suboptimal {
            self.needs_recreation = true;
        }

        frame_loop.record_commands(slot, acquired.image_index, self.frame_counter)?;
        frame_loop.submit(slot)?;

        if frame_loop.present(slot, acquired.image_index)? {
            self.needs_recreation = true;
        }

        self.frame_counter += 1;
        self.stats.record_frame(now);
        if self.single_frame {
            self.holding = true;
        }

        Ok(Iteration::Presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Swapchain images tagged with the generation they were created in
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct View {
        generation: u32,
    }

    struct MockLoop {
        concurrent_frames: usize,
        image_count: usize,
        generation: u32,
        images: Vec<u32>,
        views: Vec<View>,
        next_image: u32,
        in_flight: BTreeSet<usize>,
        max_in_flight: usize,
        waits: Vec<usize>,
        recreations: u32,
        stale_acquires: u32,
        suboptimal_presents: u32,
        failed_submits: u32,
        minimized: bool,
        recorded_views: Vec<View>,
    }

    impl MockLoop {
        fn new(concurrent_frames: usize, image_count: usize) -> Self {
            let mut mock = Self {
                concurrent_frames,
                image_count,
                generation: 0,
                images: Vec::new(),
                views: Vec::new(),
                next_image: 0,
                in_flight: BTreeSet::new(),
                max_in_flight: 0,
                waits: Vec::new(),
                recreations: 0,
                stale_acquires: 0,
                suboptimal_presents: 0,
                failed_submits: 0,
                minimized: false,
                recorded_views: Vec::new(),
            };
            mock.build_swapchain();
            mock
        }

        fn build_swapchain(&mut self) {
            self.generation += 1;
            self.images = (0..self.image_count as u32).collect();
            self.views = vec![
                View {
                    generation: self.generation
                };
                self.image_count
            ];
        }
    }

    impl FrameLoop for MockLoop {
        fn wait_for_frame(&mut self, slot: usize) -> BackendResult<()> {
            assert!(slot < self.concurrent_frames);
            self.waits.push(slot);
            self.in_flight.remove(&slot);
            Ok(())
        }

        fn acquire_image(&mut self, _slot: usize) -> BackendResult<AcquiredImage> {
            if self.stale_acquires > 0 {
                self.stale_acquires -= 1;
                return Err(BackendError::SwapchainStale);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.images.len() as u32;
            Ok(AcquiredImage {
                image_index,
                suboptimal: false,
            })
        }

        fn recreate_swapchain(&mut self) -> BackendResult<bool> {
            if self.minimized {
                return Ok(false);
            }
            self.recreations += 1;
            self.build_swapchain();
            self.next_image = 0;
            Ok(true)
        }

        fn record_commands(&mut self, _slot: usize, image_index: u32, _frame: u64) -> BackendResult<()> {
            let view = self.views[image_index as usize];
            assert_eq!(view.generation, self.generation, "recorded against a stale view");
            self.recorded_views.push(view);
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> BackendResult<()> {
            // A rejected submit leaves the slot's fence signaled, nothing in flight
            if self.failed_submits > 0 {
                self.failed_submits -= 1;
                return Err(BackendError::Vulkan {
                    what: "queue submit",
                    code: ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                });
            }
            self.in_flight.insert(slot);
            self.max_in_flight = self.max_in_flight.max(self.in_flight.len());
            assert!(self.in_flight.len() <= self.concurrent_frames);
            Ok(())
        }

        fn present(&mut self, _slot: usize, _image_index: u32) -> BackendResult<bool> {
            if self.suboptimal_presents > 0 {
                self.suboptimal_presents -= 1;
                return Ok(true);
            }
            Ok(false)
        }
    }

    #[test]
    fn two_slots_five_iterations_alternate_fence_waits() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);

        for _ in 0..5 {
            assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        }

        assert_eq!(mock.waits, vec![0, 1, 0, 1, 0]);
        assert_eq!(scheduler.frame_counter(), 5);
        assert_eq!(scheduler.stats().frames_presented(), 5);
        assert_eq!(mock.recreations, 0);
    }

    #[test]
    fn in_flight_frames_never_exceed_slot_count() {
        for slots in 1..=4 {
            let mut scheduler = FrameScheduler::new(slots, false);
            let mut mock = MockLoop::new(slots, 3);

            for _ in 0..20 {
                scheduler.run_iteration(&mut mock).unwrap();
            }

            assert_eq!(mock.max_in_flight, slots);
        }
    }

    #[test]
    fn stale_acquire_recreates_without_advancing() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);
        scheduler.run_iteration(&mut mock).unwrap();

        mock.stale_acquires = 1;
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Restarted);
        assert_eq!(scheduler.frame_counter(), 1);
        assert_eq!(mock.recreations, 1);
        assert!(!scheduler.needs_recreation());

        // Same slot is retried
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        assert_eq!(mock.waits, vec![0, 1, 1]);
        assert_eq!(scheduler.frame_counter(), 2);
    }

    #[test]
    fn failed_submit_is_fatal_and_leaves_the_slot_reusable() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);
        scheduler.run_iteration(&mut mock).unwrap();

        mock.failed_submits = 1;
        let err = scheduler.run_iteration(&mut mock).unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(scheduler.frame_counter(), 1);
        assert!(!mock.in_flight.contains(&1));

        // Teardown or a retry waits on the same slot and gets through
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        assert_eq!(mock.waits, vec![0, 1, 1]);
    }

    #[test]
    fn recreation_never_leaves_stale_views() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);

        for i in 0..12 {
            if i % 4 == 3 {
                scheduler.request_recreation();
            }
            scheduler.run_iteration(&mut mock).unwrap();
            assert_eq!(mock.images.len(), mock.views.len());
        }

        assert_eq!(mock.recreations, 3);
        assert_eq!(mock.recorded_views.last().map(|v| v.generation), Some(4));
    }

    #[test]
    fn suboptimal_present_defers_recreation_to_next_iteration() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 2);
        mock.suboptimal_presents = 1;

        scheduler.run_iteration(&mut mock).unwrap();
        assert!(scheduler.needs_recreation());
        assert_eq!(mock.recreations, 0);

        scheduler.run_iteration(&mut mock).unwrap();
        assert!(!scheduler.needs_recreation());
        assert_eq!(mock.recreations, 1);
        assert_eq!(scheduler.frame_counter(), 2);
    }

    #[test]
    fn minimized_window_skips_until_it_has_area() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);
        mock.minimized = true;
        scheduler.request_recreation();

        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Skipped);
        assert!(scheduler.needs_recreation());
        assert!(mock.waits.is_empty());

        mock.minimized = false;
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        assert_eq!(scheduler.frame_counter(), 1);
    }

    #[test]
    fn pause_skips_iterations() {
        let mut scheduler = FrameScheduler::new(2, false);
        let mut mock = MockLoop::new(2, 3);

        scheduler.toggle_pause();
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Skipped);
        assert_eq!(scheduler.frame_counter(), 0);

        scheduler.toggle_pause();
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
    }

    #[test]
    fn single_frame_mode_steps_one_frame_at_a_time() {
        let mut scheduler = FrameScheduler::new(2, true);
        let mut mock = MockLoop::new(2, 3);

        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        assert!(!scheduler.wants_frames());
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Skipped);

        scheduler.request_step();
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Presented);
        assert_eq!(scheduler.run_iteration(&mut mock).unwrap(), Iteration::Skipped);
        assert_eq!(scheduler.frame_counter(), 2);
    }

    #[test]
    fn step_request_is_ignored_outside_single_frame_mode() {
        let mut scheduler = FrameScheduler::new(1, false);
        scheduler.toggle_pause();
        scheduler.request_step();
        assert!(!scheduler.wants_frames());
    }

    #[test]
    fn zero_slots_is_treated_as_one() {
        let scheduler = FrameScheduler::new(0, false);
        assert_eq!(scheduler.concurrent_frames(), 1);
        assert_eq!(scheduler.current_slot(), 0);
    }

    #[test]
    fn frame_rate_is_reported_once_per_second() {
        let start = Instant::now();
        let mut stats = FrameStats::new(start);

        for i in 1..60 {
            assert_eq!(stats.record_frame(start + Duration::from_millis(i * 16)), None);
        }
        let fps = stats.record_frame(start + Duration::from_secs(1)).unwrap();

        assert!((fps - 60.0).abs() < 0.01);
        assert_eq!(stats.frames_presented(), 60);
        assert_eq!(stats.running_for(start + Duration::from_secs(3)), Duration::from_secs(3));
    }
}
