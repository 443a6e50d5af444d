//! Adversarial training: a discriminator loop that drives a generator loop and
//! a periodic test loop as sub-loops.

use std::sync::{Arc, Mutex};
use trellis_core::callbacks::{
    CallRecipe, Checkpoint, CheckpointTrigger, Counter, Log, MetricLogger, WindowedMetricAvg,
};
use trellis_core::module::{freeze, unfreeze};
use trellis_core::{CheckpointManager, DataSource, Module, Recipe, RecipeConfig, RecipeError, Result, State, Steps, Value};

/// Everything a GAN step may touch: both networks, locked for the duration
/// of the step and already switched to the right modes, and the calling
/// loop's state.
pub struct GanContext<'a, G, D> {
    pub g: &'a mut G,
    pub d: &'a mut D,
    pub state: &'a State,
}

/// One GAN step over a batch.
pub type GanStep<G, D> = Box<dyn for<'a> FnMut(&Value, GanContext<'a, G, D>) -> Result<State> + Send>;

/// The three user steps of a GAN recipe.
///
/// The generator step must return `loss` and `imgs`; they are logged into the
/// generator loop's metrics and surface in the discriminator loop as
/// `G_loss` / `G_imgs`. The discriminator step must return `loss`.
pub struct GanSteps<G, D> {
    pub generator: GanStep<G, D>,
    pub discriminator: GanStep<G, D>,
    pub test: GanStep<G, D>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Discriminator,
    Generator,
    Test,
}

fn set_modes<G: Module, D: Module>(phase: Phase, g: &mut G, d: &mut D) {
    match phase {
        Phase::Discriminator => {
            freeze(g);
            g.eval();
            unfreeze(d);
            d.train();
        }
        Phase::Generator => {
            freeze(d);
            d.eval();
            unfreeze(g);
            g.train();
        }
        Phase::Test => {
            freeze(g);
            freeze(d);
            g.eval();
            d.eval();
        }
    }
}

fn wrap<G, D>(
    phase: Phase,
    g: Arc<Mutex<G>>,
    d: Arc<Mutex<D>>,
    mut step: GanStep<G, D>,
) -> impl FnMut(&Value, &State) -> Result<State> + Send + 'static
where
    G: Module + 'static,
    D: Module + 'static,
{
    move |batch, state| {
        // Always G before D.
        let mut g = g.lock().map_err(|e| RecipeError::poisoned("generator", e))?;
        let mut d = d.lock().map_err(|e| RecipeError::poisoned("discriminator", e))?;
        set_modes(phase, &mut *g, &mut *d);
        step(
            batch,
            GanContext {
                g: &mut *g,
                d: &mut *d,
                state,
            },
        )
    }
}

/// Discriminator loop over `data`, with the generator loop run after every
/// discriminator batch and the test loop every `test_every` iterations.
pub struct GanRecipe<G, D> {
    g: Arc<Mutex<G>>,
    d: Arc<Mutex<D>>,
    d_loop: Recipe,
}

impl<G, D> GanRecipe<G, D>
where
    G: Module + 'static,
    D: Module + 'static,
{
    pub fn generator(&self) -> Arc<Mutex<G>> {
        Arc::clone(&self.g)
    }

    pub fn discriminator(&self) -> Arc<Mutex<D>> {
        Arc::clone(&self.d)
    }

    pub fn recipe(&self) -> &Recipe {
        &self.d_loop
    }

    /// The discriminator loop, e.g. to register extra callbacks.
    pub fn recipe_mut(&mut self) -> &mut Recipe {
        &mut self.d_loop
    }

    pub fn run(&mut self, epochs: usize) -> Result<&State> {
        self.d_loop.run(epochs)
    }
}

/// Wire `g` and `d` into a discriminator loop with generator and test
/// sub-loops.
///
/// Discriminator loop epilogues, in order: generator sub-loop (`G_metrics`),
/// windowed `loss`, `G_loss`, `G_imgs`, logger, test sub-loop
/// (`Test_metrics`), and a checkpoint of both networks every `test_every`
/// iterations when enabled.
pub fn gan_recipe<G, D>(
    mut g: G,
    mut d: D,
    steps: GanSteps<G, D>,
    data: impl DataSource + 'static,
    config: &RecipeConfig,
) -> GanRecipe<G, D>
where
    G: Module + 'static,
    D: Module + 'static,
{
    g.to_device(config.device);
    d.to_device(config.device);
    let g = Arc::new(Mutex::new(g));
    let d = Arc::new(Mutex::new(d));
    let handles = || (Arc::clone(&g), Arc::clone(&d));

    let (gh, dh) = handles();
    let mut g_loop = Recipe::new("G", wrap(Phase::Generator, gh, dh, steps.generator), Steps(1)).to(config.device);
    g_loop
        .callbacks_mut()
        .add_epilogue(Log::new("loss", "loss"))
        .add_epilogue(Log::new("imgs", "imgs"))
        .add_epilogue(WindowedMetricAvg::with_window("loss", config.window));

    let (gh, dh) = handles();
    let test_loop = Recipe::new("Test", wrap(Phase::Test, gh, dh, steps.test), Steps(1)).to(config.device);

    let (gh, dh) = handles();
    let mut d_loop = Recipe::new("D", wrap(Phase::Discriminator, gh, dh, steps.discriminator), data).to(config.device);
    d_loop
        .callbacks_mut()
        .add_prologue(Counter::new())
        .add_epilogue(CallRecipe::new(g_loop, 1, "G"))
        .add_epilogue(WindowedMetricAvg::with_window("loss", config.window))
        .add_epilogue(Log::new("G_metrics.loss", "G_loss"))
        .add_epilogue(Log::new("G_metrics.imgs", "G_imgs"))
        .add_epilogue(MetricLogger::new(config.log_every))
        .add_epilogue(CallRecipe::new(test_loop, config.test_every, "Test"));

    if config.checkpoint.enabled {
        let manager = CheckpointManager::new(&config.checkpoint.dir, config.checkpoint.max_checkpoints);
        let (gh, dh) = handles();
        d_loop.callbacks_mut().add_epilogue(
            Checkpoint::new(
                manager,
                config.checkpoint.name.clone(),
                CheckpointTrigger::Every(config.test_every),
            )
            .register("G", gh)
            .register("D", dh),
        );
    }

    GanRecipe { g, d, d_loop }
}
