use anyhow::{Context, Result};
use log::{debug, info, warn};
use rand::{rngs::SmallRng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::channel,
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    adapt_strategy::AdaptOptions,
    chain::{DrawStats, NutsChain, SamplingWarning},
    density::{CpuLogpFunc, LogDensity},
    model::Model,
    nuts::{NutsError, NutsOptions},
    trace::{ChainTrace, Trace},
};

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy)]
pub struct NutsSettings {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub num_chains: usize,
    pub seed: u64,
    /// Size of the thread pool. Zero uses the rayon default.
    pub num_threads: usize,
    /// Keep the draws of the warmup phase in the trace.
    pub store_warmup: bool,
    pub adapt_options: AdaptOptions,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            num_chains: 4,
            seed: 0,
            num_threads: 0,
            store_warmup: false,
            adapt_options: AdaptOptions::default(),
        }
    }
}

/// Cooperative cancellation of a running sampler.
///
/// Chains check the signal between iterations and keep all draws they
/// finished so far.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_draws: usize,
    pub total_draws: usize,
    pub divergences: usize,
    pub tuning: bool,
    pub started: bool,
    pub latest_num_steps: usize,
    pub total_num_steps: usize,
    pub step_size: f64,
    pub runtime: Duration,
    pub divergent_draws: Vec<usize>,
}

impl ChainProgress {
    fn new(total: usize) -> Self {
        Self {
            finished_draws: 0,
            total_draws: total,
            divergences: 0,
            tuning: true,
            started: false,
            latest_num_steps: 0,
            step_size: 0f64,
            total_num_steps: 0,
            runtime: Duration::ZERO,
            divergent_draws: Vec::new(),
        }
    }

    fn update(&mut self, stats: &DrawStats, draw_duration: Duration) {
        if stats.diverging & !stats.tuning {
            self.divergences += 1;
            self.divergent_draws.push(self.finished_draws);
        }
        self.finished_draws += 1;
        self.tuning = stats.tuning;

        self.latest_num_steps = stats.n_steps as usize;
        self.total_num_steps += stats.n_steps as usize;
        self.step_size = stats.step_size;
        self.runtime += draw_duration;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Draw posterior samples from a model on a thread pool, one chain per task.
///
/// This freezes the model.
pub fn sample(model: &Model, settings: &NutsSettings) -> Result<Trace> {
    sample_with_stop(model, settings, &StopSignal::new())
}

/// Like [`sample`], but returns early with the draws finished so far once
/// `stop` is signaled.
pub fn sample_with_stop(model: &Model, settings: &NutsSettings, stop: &StopSignal) -> Result<Trace> {
    let progress = new_progress(settings);
    run_chains(model, settings, stop, &progress)
}

fn new_progress(settings: &NutsSettings) -> Vec<Arc<Mutex<ChainProgress>>> {
    let total = (settings.num_tune + settings.num_draws) as usize;
    (0..settings.num_chains)
        .map(|_| Arc::new(Mutex::new(ChainProgress::new(total))))
        .collect()
}

fn run_chains(
    model: &Model,
    settings: &NutsSettings,
    stop: &StopSignal,
    progress: &[Arc<Mutex<ChainProgress>>],
) -> Result<Trace> {
    let density = LogDensity::new(model).context("Could not create the model density")?;
    info!(
        "Sampling {} chains with {} tuning steps and {} draws in {} dimensions",
        settings.num_chains,
        settings.num_tune,
        settings.num_draws,
        density.dim()
    );
    let start = Instant::now();

    let pool = ThreadPoolBuilder::new()
        .num_threads(settings.num_threads)
        .thread_name(|i| format!("nuts-graph-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let (results_tx, results_rx) = channel();
    pool.scope_fifo(|scope| {
        for (chain, progress) in progress.iter().enumerate() {
            let results = results_tx.clone();
            let density = density.clone();
            scope.spawn_fifo(move |_| {
                let result = run_chain(density, chain as u64, settings, stop, progress);
                // The receiver outlives the scope
                let _ = results.send(result);
            });
        }
    });
    drop(results_tx);

    let chains = results_rx
        .into_iter()
        .collect::<Result<Vec<_>>>()
        .context("Sampling failed")?;
    let trace = Trace::new(density.variables().to_vec(), chains);

    info!(
        "Finished {} draws in {:.2?} with {} divergences",
        trace.num_draws(),
        start.elapsed(),
        trace.num_divergences()
    );
    Ok(trace)
}

fn run_chain(
    density: LogDensity<'_>,
    chain: u64,
    settings: &NutsSettings,
    stop: &StopSignal,
    progress: &Mutex<ChainProgress>,
) -> Result<ChainTrace> {
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain);

    let options = NutsOptions {
        maxdepth: settings.maxdepth,
    };
    let mut sampler = NutsChain::new(
        density,
        &settings.adapt_options,
        settings.num_tune,
        options,
        settings.max_energy_error,
        SmallRng::from_rng(&mut rng),
        chain,
    );

    let mut initval = vec![0f64; sampler.dim()];
    let mut error = None;
    let mut tries = 0;
    for _ in 0..500 {
        tries += 1;
        sampler.logp_func().init_position(&mut rng, &mut initval);
        if let Err(err) = sampler.set_position(&initval) {
            error = Some(err);
            continue;
        }
        error = None;
        break;
    }

    if let Some(error) = error {
        return Err(error.context(format!("All initialization points failed in chain {chain}")));
    }
    if tries > 1 {
        warn!("Chain {chain} needed {tries} attempts to find a valid initial point");
    }
    lock(progress).started = true;

    let mut trace = ChainTrace::new(chain);
    let total = settings.num_tune + settings.num_draws;
    let mut warmup_divergences = 0;
    let mut warmup_invalid = 0;
    let mut divergences = 0;
    let mut completed = 0;

    for draw in 0..total {
        if stop.is_stopped() {
            warn!("Chain {chain} stopped after {draw} of {total} iterations");
            break;
        }

        let now = Instant::now();
        let (values, stats) = sampler.expanded_draw()?;
        lock(progress).update(&stats, now.elapsed());

        if stats.diverging {
            if stats.tuning {
                warmup_divergences += 1;
            } else {
                divergences += 1;
            }
        }
        if stats.warning == Some(SamplingWarning::NoValidTrajectory) {
            if stats.tuning {
                warmup_invalid += 1;
            }
            warn!("Chain {chain} found no valid trajectory in iteration {draw}");
        }

        trace.push(values, stats, settings.store_warmup);
        completed += 1;

        if completed == settings.num_tune {
            debug!(
                "Chain {chain} finished warmup with step size {}",
                sampler.step_size()
            );
            // No trajectory of the warmup moved away from its start
            if warmup_invalid == settings.num_tune {
                return Err(NutsError::SamplerDivergenceExceeded {
                    chain,
                    divergences: warmup_divergences,
                    iterations: settings.num_tune,
                }
                .into());
            }
        }
    }

    if divergences > 0 {
        warn!("Chain {chain} had {divergences} divergences after warmup");
    }
    trace.finished = completed == total;
    Ok(trace)
}

/// Samples a model in the background.
///
/// The handle owns the model through an `Arc`, so its data can not be
/// rebound while the sampler runs.
pub struct Sampler {
    main_thread: JoinHandle<Result<Trace>>,
    stop: StopSignal,
    progress: Vec<Arc<Mutex<ChainProgress>>>,
}

impl Sampler {
    pub fn new(model: Arc<Model>, settings: NutsSettings) -> Self {
        let stop = StopSignal::new();
        let progress = new_progress(&settings);

        let stop_inner = stop.clone();
        let progress_inner = progress.clone();
        let main_thread =
            spawn(move || run_chains(&model, &settings, &stop_inner, &progress_inner));

        Self {
            main_thread,
            stop,
            progress,
        }
    }

    /// The current progress of every chain.
    pub fn progress(&self) -> Box<[ChainProgress]> {
        self.progress
            .iter()
            .map(|progress| lock(progress).clone())
            .collect()
    }

    /// Ask all chains to stop after their current iteration.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.main_thread.is_finished()
    }

    /// Wait for all chains and return the trace.
    pub fn wait(self) -> Result<Trace> {
        match self.main_thread.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}
