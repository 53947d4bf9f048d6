//! The Controller: the per-node fixed-cadence control loop driving a tree
//! of [`crate::agent::Agent`]s (`spec.md` §4.13, component C13).
//!
//! A single compute node runs one local path through the control tree —
//! leaf at index `0` up to a root at the top index. Each level gets its
//! own OS thread (`spec.md` §9 "Controller — one OS thread per level");
//! levels are coupled only through [`LevelLink`], a `parking_lot::Mutex`-
//! guarded child-sample/policy buffer, never by a back-pointer or shared
//! mutable state. The wider, across-node fan-in that a real job-wide tree
//! exhibits is out of scope here (MPI/PMPI glue is an explicit non-goal in
//! `spec.md` §1); see `DESIGN.md` for how tests exercise an agent's
//! `aggregate_sample`/`split_policy` against a synthetic multi-child fan-in
//! without a second process.

mod report;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{Span, debug, error, info_span};

pub use report::{NullTracer, RecordingTracer, Report, TraceRow, Tracer};

use crate::agent::{Agent, DEFAULT_CADENCE};
use crate::endpoint::EndpointUser;
use crate::error::{Error, Result};
use crate::pio::PlatformIO;

/// The child-sample/policy buffer shared between one tree level and the
/// level directly below it.
struct LevelLink {
    /// One slot per child of the level above; the local path always
    /// writes its own ascended sample into slot `0`. Tests populate the
    /// remaining slots to simulate sibling nodes (`DESIGN.md`).
    child_samples: Mutex<Vec<Option<Vec<f64>>>>,
    /// The most recent policy the level above sent down.
    policy_down: Mutex<Option<Vec<f64>>>,
}

impl LevelLink {
    fn new(fan_in: usize) -> Self {
        Self {
            child_samples: Mutex::new(vec![None; fan_in.max(1)]),
            policy_down: Mutex::new(None),
        }
    }
}

/// One level of the local control tree.
struct TreeLevel {
    agent: Arc<Mutex<Box<dyn Agent>>>,
    tracer: Mutex<Box<dyn Tracer>>,
}

/// Builds a [`Controller`] one level at a time, leaf first.
pub struct ControllerBuilder {
    levels: Vec<TreeLevel>,
    fan_in: Vec<usize>,
    platform_io: Option<Arc<Mutex<PlatformIO>>>,
    endpoint: Option<Arc<EndpointUser>>,
    agent_name: String,
    profile_name: String,
    hostlist: Vec<String>,
    cadence: Duration,
}

impl ControllerBuilder {
    /// Starts a builder with no levels. `agent_name` is published to the
    /// [`EndpointUser`] once a root level with an endpoint is added.
    #[must_use]
    pub fn new(agent_name: impl Into<String>, profile_name: impl Into<String>) -> Self {
        Self {
            levels: Vec::new(),
            fan_in: Vec::new(),
            platform_io: None,
            endpoint: None,
            agent_name: agent_name.into(),
            profile_name: profile_name.into(),
            hostlist: Vec::new(),
            cadence: DEFAULT_CADENCE,
        }
    }

    /// Overrides the default 5 ms cadence (tests use a shorter one).
    #[must_use]
    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    /// Sets the hostnames this node publishes to the Endpoint's sample
    /// region once attached.
    #[must_use]
    pub fn with_hostlist(mut self, hosts: Vec<String>) -> Self {
        self.hostlist = hosts;
        self
    }

    /// Adds a level above every level added so far. The level added first
    /// is the leaf; `fan_in` is the number of children feeding *this*
    /// level from below (the number of local slots in the link beneath
    /// it; `1` for every level except where a test wants to simulate
    /// siblings).
    #[must_use]
    pub fn push_level(mut self, agent: Box<dyn Agent>, fan_in: usize) -> Self {
        self.levels.push(TreeLevel {
            agent: Arc::new(Mutex::new(agent)),
            tracer: Mutex::new(Box::new(NullTracer)),
        });
        self.fan_in.push(fan_in.max(1));
        self
    }

    /// The leaf level's [`PlatformIO`], used for `read_batch`/`write_batch`
    /// around `sample_platform`/`adjust_platform`.
    #[must_use]
    pub fn with_platform_io(mut self, platform_io: Arc<Mutex<PlatformIO>>) -> Self {
        self.platform_io = Some(platform_io);
        self
    }

    /// The root level's channel to the out-of-band policy producer.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Arc<EndpointUser>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Attaches a tracer to a specific level (by index, leaf = `0`),
    /// replacing its [`NullTracer`].
    ///
    /// # Panics
    ///
    /// Panics if `level` is out of range; call after every
    /// [`ControllerBuilder::push_level`] for the levels you want traced.
    #[must_use]
    pub fn with_tracer(mut self, level: usize, tracer: Box<dyn Tracer>) -> Self {
        self.levels[level].tracer = Mutex::new(tracer);
        self
    }

    /// Finishes the tree and runs every level's [`Agent::init`].
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::Kind::Logic`] if no levels were added, or
    /// propagates any level's `init` error.
    pub fn build(self) -> Result<Controller> {
        if self.levels.is_empty() {
            return Err(Error::logic("controller has no tree levels"));
        }
        let height = self.levels.len();
        let links: Vec<Arc<LevelLink>> = (0..height.saturating_sub(1))
            .map(|i| Arc::new(LevelLink::new(self.fan_in[i + 1])))
            .collect();

        for (idx, level) in self.levels.iter().enumerate() {
            let is_root = idx == height - 1;
            level
                .agent
                .lock()
                .init(idx as u32, &self.fan_in, is_root)?;
        }

        Ok(Controller {
            levels: self.levels,
            links,
            platform_io: self.platform_io,
            endpoint: self.endpoint,
            agent_name: self.agent_name,
            profile_name: self.profile_name,
            hostlist: self.hostlist,
            cadence: self.cadence,
            failure: Mutex::new(None),
        })
    }
}

/// The per-node control loop: `sample → ascend → split → adjust → wait`,
/// run independently per tree level on its own thread (`spec.md` §4.13).
pub struct Controller {
    levels: Vec<TreeLevel>,
    links: Vec<Arc<LevelLink>>,
    platform_io: Option<Arc<Mutex<PlatformIO>>>,
    endpoint: Option<Arc<EndpointUser>>,
    agent_name: String,
    profile_name: String,
    hostlist: Vec<String>,
    cadence: Duration,
    failure: Mutex<Option<(u32, String)>>,
}

impl Controller {
    /// The number of tree levels this controller drives (leaf through
    /// root, inclusive).
    #[must_use]
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Runs every level's tick loop on its own thread until `stop` is set,
    /// then joins them. The first level to report an error stops the
    /// whole controller; its cause is recorded for [`Controller::report`].
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any level.
    pub fn run(&self, stop: &Arc<AtomicBool>) -> Result<()> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.levels.len())
                .map(|idx| {
                    let stop = Arc::clone(stop);
                    scope.spawn(move || self.run_level_loop(idx, &stop))
                })
                .collect();
            let mut first_err = None;
            for handle in handles {
                if let Err(e) = handle.join().expect("tree level thread panicked") {
                    stop.store(true, Ordering::SeqCst);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        })
    }

    /// Runs [`Controller::run`] for `duration`, then stops and joins every
    /// level.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any level.
    pub fn run_for(&self, duration: Duration) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_timer = Arc::clone(&stop);
        std::thread::scope(|scope| {
            scope.spawn(move || {
                std::thread::sleep(duration);
                stop_timer.store(true, Ordering::SeqCst);
            });
            self.run(&stop)
        })
    }

    fn run_level_loop(&self, idx: usize, stop: &Arc<AtomicBool>) -> Result<()> {
        let span = info_span!("controller_level", level = idx);
        let _guard = span.enter();
        // Drift-free cadence: accumulate the next wake boundary rather than
        // sleeping a fixed duration after each tick (`spec.md` §4.13 step
        // 6). A tick that runs late is skipped forward to "now" rather than
        // queued, so a slow tick never causes a catch-up burst.
        let mut next_tick = Instant::now();
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            if let Err(err) = self.step_level(idx, &span) {
                error!(level = idx, error = %err, "tree level terminated");
                self.mark_failure(idx as u32, &err);
                return Err(err);
            }
            self.levels[idx].agent.lock().wait();
            next_tick += self.cadence;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }
    }

    /// Records the terminating level/cause for [`Controller::report`], and
    /// forces that level's `IS_CONVERGED` sample slot (if it declares one)
    /// to `false` wherever the sample is still visible — upward to the
    /// level above, or to the Endpoint if this is the root (`spec.md` §7).
    fn mark_failure(&self, level: u32, err: &Error) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some((level, err.to_string()));
            }
        }

        let idx = level as usize;
        let agent = self.levels[idx].agent.lock();
        let Some(converged_slot) = agent.sample_names().iter().position(|&n| n == "IS_CONVERGED") else {
            return;
        };
        let mut sample = vec![f64::NAN; agent.sample_names().len()];
        sample[converged_slot] = 0.0;
        drop(agent);

        let is_root = idx == self.levels.len() - 1;
        if is_root {
            if let Some(endpoint) = &self.endpoint {
                let _ = endpoint.write_sample(&sample);
            }
        } else {
            let above = &self.links[idx];
            let mut slots = above.child_samples.lock();
            if slots.is_empty() {
                slots.push(None);
            }
            slots[0] = Some(sample);
        }
    }

    /// Executes exactly one tick of level `idx`: ascend, (root: read
    /// policy), split, (leaf: adjust + batch write), tracer emission.
    fn step_level(&self, idx: usize, span: &Span) -> Result<()> {
        let is_leaf = idx == 0;
        let is_root = idx == self.levels.len() - 1;
        let mut agent = self.levels[idx].agent.lock();

        // 1. Ascend: produce this level's own sample.
        let mut sample = Vec::new();
        if is_leaf {
            if let Some(pio) = &self.platform_io {
                pio.lock().read_batch()?;
            }
            agent.sample_platform(&mut sample)?;
        } else {
            let below = &self.links[idx - 1];
            let children: Vec<Vec<f64>> = below
                .child_samples
                .lock()
                .iter()
                .filter_map(Clone::clone)
                .collect();
            agent.aggregate_sample(&children, &mut sample)?;
        }
        if sample.len() != agent.sample_names().len() && !sample.is_empty() {
            return Err(Error::logic(format!(
                "level {idx} produced a sample of {} slots, expected {}",
                sample.len(),
                agent.sample_names().len()
            )));
        }

        if is_root {
            if let Some(endpoint) = &self.endpoint {
                endpoint.publish_identity(&self.agent_name, &self.profile_name, &self.hostlist)?;
                if agent.do_send_sample() {
                    endpoint.write_sample(&sample)?;
                }
            }
        } else if agent.do_send_sample() {
            let above = &self.links[idx];
            let mut slots = above.child_samples.lock();
            if slots.is_empty() {
                slots.push(None);
            }
            slots[0] = Some(sample.clone());
        }

        // 2. Descend: obtain the policy this level should apply/split.
        let mut in_policy = if is_root {
            match &self.endpoint {
                Some(endpoint) => endpoint.read_policy().map(|(values, _age)| values)?,
                None => Vec::new(),
            }
        } else {
            self.links[idx].policy_down.lock().clone().unwrap_or_default()
        };
        if !in_policy.is_empty() {
            agent.validate_policy(&mut in_policy)?;
        }

        if is_leaf {
            if !in_policy.is_empty() || !agent.policy_names().is_empty() {
                agent.adjust_platform(&in_policy)?;
            }
            if agent.do_write_batch() {
                if let Some(pio) = &self.platform_io {
                    pio.lock().write_batch()?;
                }
            }
        } else {
            let children_below = self.links[idx - 1].child_samples.lock().len();
            let mut out_policy = vec![Vec::new(); children_below.max(1)];
            agent.split_policy(&in_policy, &mut out_policy)?;
            if agent.do_send_policy() {
                *self.links[idx - 1].policy_down.lock() = Some(out_policy[0].clone());
            }
        }

        debug!(parent: span, level = idx, "tick complete");
        let columns: Vec<(&'static str, crate::types::Format, f64)> = agent
            .trace_names()
            .into_iter()
            .zip(agent.trace_formats())
            .zip(agent.trace_values())
            .map(|((name, format), value)| (name, format, value))
            .collect();
        let row = TraceRow {
            level: idx as u32,
            columns: &columns,
        };
        self.levels[idx].tracer.lock().on_tick(&row);

        Ok(())
    }

    /// Runs exactly `n` ticks of every level synchronously, in leaf-to-root
    /// order, on the calling thread. Deterministic and thread-free, for
    /// tests that need an exact tick count rather than wall-clock timing.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any level's tick.
    pub fn run_ticks(&self, n: u32) -> Result<()> {
        let span = info_span!("controller_sync_ticks");
        for _ in 0..n {
            for idx in 0..self.levels.len() {
                if let Err(err) = self.step_level(idx, &span) {
                    self.mark_failure(idx as u32, &err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// One-shot policy application at the leaf with no sampling loop
    /// (`spec.md` §4.12 `enforce_policy`, the admin path).
    ///
    /// # Errors
    ///
    /// Propagates the leaf agent's `enforce_policy` error.
    pub fn enforce_policy(&self, policy: &[f64]) -> Result<()> {
        let mut leaf = self.levels[0].agent.lock();
        let mut validated = policy.to_vec();
        if !validated.is_empty() {
            leaf.validate_policy(&mut validated)?;
        }
        leaf.enforce_policy(&validated)?;
        if leaf.do_write_batch() {
            if let Some(pio) = &self.platform_io {
                pio.lock().write_batch()?;
            }
        }
        Ok(())
    }

    /// Injects a sample into link `link_idx` at child slot `ordinal`,
    /// simulating a sibling node's ascended sample for testing a level's
    /// `aggregate_sample` under a fan-in greater than the local path's own.
    pub fn inject_sibling_sample(&self, link_idx: usize, ordinal: usize, sample: Vec<f64>) {
        let mut slots = self.links[link_idx].child_samples.lock();
        if ordinal >= slots.len() {
            slots.resize(ordinal + 1, None);
        }
        slots[ordinal] = Some(sample);
    }

    /// Assembles the end-of-run [`Report`] from every level's
    /// `report_header`/`report_host`/`report_region`, plus the cause of
    /// any level that terminated early.
    #[must_use]
    pub fn report(&self, region_hashes: &[u64]) -> Report {
        let mut report = Report::default();
        for level in &self.levels {
            let agent = level.agent.lock();
            report.header.extend(agent.report_header());
            report.host.extend(agent.report_host());
            for &hash in region_hashes {
                report
                    .regions
                    .entry(hash)
                    .or_default()
                    .extend(agent.report_region(hash));
            }
        }
        report.failure = self.failure.lock().clone();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ReportField;
    use std::sync::atomic::AtomicU32;

    /// A leaf agent that counts `adjust_platform` calls and echoes the
    /// policy's first slot as its sole sample, for cadence and
    /// propagation tests.
    struct CountingLeaf {
        adjusts: Arc<AtomicU32>,
        last_policy: f64,
    }

    impl Agent for CountingLeaf {
        fn policy_names(&self) -> &'static [&'static str] {
            &["LIMIT"]
        }
        fn sample_names(&self) -> &'static [&'static str] {
            &["ECHO"]
        }
        fn init(&mut self, _level: u32, _fan_in: &[usize], _is_level_root: bool) -> Result<()> {
            Ok(())
        }
        fn split_policy(&mut self, _in_policy: &[f64], _out_policy: &mut [Vec<f64>]) -> Result<()> {
            Ok(())
        }
        fn do_send_policy(&self) -> bool {
            false
        }
        fn aggregate_sample(&mut self, _in_samples: &[Vec<f64>], _out_sample: &mut Vec<f64>) -> Result<()> {
            Ok(())
        }
        fn do_send_sample(&self) -> bool {
            true
        }
        fn adjust_platform(&mut self, in_policy: &[f64]) -> Result<()> {
            self.adjusts.fetch_add(1, Ordering::SeqCst);
            self.last_policy = in_policy.first().copied().unwrap_or(f64::NAN);
            Ok(())
        }
        fn do_write_batch(&self) -> bool {
            true
        }
        fn sample_platform(&mut self, out_sample: &mut Vec<f64>) -> Result<()> {
            out_sample.clear();
            out_sample.push(self.last_policy);
            Ok(())
        }
        fn wait(&mut self) {}

        fn report_header(&self) -> Vec<ReportField> {
            vec![("agent", "counting_leaf".to_string())]
        }
    }

    /// A root agent that forwards its lone child's sample downward as the
    /// next policy unchanged (used to test propagation depth > 1).
    struct PassThroughRoot;

    impl Agent for PassThroughRoot {
        fn policy_names(&self) -> &'static [&'static str] {
            &["LIMIT"]
        }
        fn sample_names(&self) -> &'static [&'static str] {
            &["ECHO"]
        }
        fn init(&mut self, _level: u32, _fan_in: &[usize], _is_level_root: bool) -> Result<()> {
            Ok(())
        }
        fn split_policy(&mut self, in_policy: &[f64], out_policy: &mut [Vec<f64>]) -> Result<()> {
            for slot in out_policy.iter_mut() {
                slot.clear();
                slot.extend_from_slice(in_policy);
            }
            Ok(())
        }
        fn do_send_policy(&self) -> bool {
            true
        }
        fn aggregate_sample(&mut self, in_samples: &[Vec<f64>], out_sample: &mut Vec<f64>) -> Result<()> {
            out_sample.clear();
            if let Some(first) = in_samples.first() {
                out_sample.extend_from_slice(first);
            }
            Ok(())
        }
        fn do_send_sample(&self) -> bool {
            true
        }
        fn adjust_platform(&mut self, _in_policy: &[f64]) -> Result<()> {
            Ok(())
        }
        fn do_write_batch(&self) -> bool {
            false
        }
        fn sample_platform(&mut self, _out_sample: &mut Vec<f64>) -> Result<()> {
            Ok(())
        }
        fn wait(&mut self) {}
    }

    fn build_chain(height: usize) -> (Controller, Arc<AtomicU32>) {
        let adjusts = Arc::new(AtomicU32::new(0));
        let mut builder = ControllerBuilder::new("test_agent", "test_profile")
            .with_cadence(Duration::from_millis(1))
            .push_level(
                Box::new(CountingLeaf {
                    adjusts: Arc::clone(&adjusts),
                    last_policy: f64::NAN,
                }),
                1,
            );
        for _ in 1..height {
            builder = builder.push_level(Box::new(PassThroughRoot), 1);
        }
        (builder.build().unwrap(), adjusts)
    }

    #[test]
    fn single_level_run_ticks_counts_exactly() {
        let (controller, adjusts) = build_chain(1);
        controller.run_ticks(50).unwrap();
        assert_eq!(adjusts.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn policy_propagates_to_leaf_within_height_ticks() {
        let (controller, adjusts) = build_chain(3);
        // Seed the link directly above the leaf, as if the level above had
        // just split a policy down to it.
        *controller.links[0].policy_down.lock() = Some(vec![55.0]);
        controller.run_ticks(1).unwrap();
        assert_eq!(adjusts.load(Ordering::SeqCst), 1);
        // The next tick's split at the level above resets the link (no
        // endpoint is attached in this test, so the root has nothing to
        // forward); the leaf still picked up the seeded value on tick one.
    }

    #[test]
    fn aggregate_sample_sees_injected_sibling() {
        let (controller, _adjusts) = build_chain(2);
        controller.inject_sibling_sample(0, 0, vec![1.5]);
        controller.run_ticks(1).unwrap();
        let report = controller.report(&[]);
        assert!(report.failure.is_none());
    }

    #[test]
    fn report_surfaces_header_from_every_level() {
        let (controller, _adjusts) = build_chain(2);
        controller.run_ticks(1).unwrap();
        let report = controller.report(&[]);
        assert!(report.header.iter().any(|(_, v)| v == "counting_leaf"));
    }

    #[test]
    fn enforce_policy_bypasses_sampling_loop() {
        let (controller, adjusts) = build_chain(1);
        controller.enforce_policy(&[7.0]).unwrap();
        assert_eq!(adjusts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_builder_fails_to_build() {
        let result = ControllerBuilder::new("a", "p").build();
        assert!(result.is_err());
    }

    #[test]
    fn failing_leaf_is_surfaced_in_report() {
        struct AlwaysFails;
        impl Agent for AlwaysFails {
            fn policy_names(&self) -> &'static [&'static str] {
                &[]
            }
            fn sample_names(&self) -> &'static [&'static str] {
                &["IS_CONVERGED"]
            }
            fn init(&mut self, _level: u32, _fan_in: &[usize], _is_level_root: bool) -> Result<()> {
                Ok(())
            }
            fn split_policy(&mut self, _in_policy: &[f64], _out_policy: &mut [Vec<f64>]) -> Result<()> {
                Ok(())
            }
            fn do_send_policy(&self) -> bool {
                false
            }
            fn aggregate_sample(&mut self, _in_samples: &[Vec<f64>], _out_sample: &mut Vec<f64>) -> Result<()> {
                Ok(())
            }
            fn do_send_sample(&self) -> bool {
                true
            }
            fn adjust_platform(&mut self, _in_policy: &[f64]) -> Result<()> {
                Ok(())
            }
            fn do_write_batch(&self) -> bool {
                false
            }
            fn sample_platform(&mut self, _out_sample: &mut Vec<f64>) -> Result<()> {
                Err(Error::runtime("hardware gone"))
            }
        }

        let controller = ControllerBuilder::new("a", "p")
            .push_level(Box::new(AlwaysFails), 1)
            .build()
            .unwrap();
        assert!(controller.run_ticks(1).is_err());
        let report = controller.report(&[]);
        assert!(report.failure.is_some());
    }
}
