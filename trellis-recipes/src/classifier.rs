//! Supervised classification: a training loop with a periodic evaluation
//! sub-loop, metrics, logging and checkpoints.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::info;
use trellis_core::callbacks::{
    AccAvg, CallRecipe, Checkpoint, CheckpointTrigger, Counter, EpochMetricAvg, MetricLogger, WindowedMetricAvg,
    sync_counters,
};
use trellis_core::{
    Callback, CallbackRunner, CheckpointManager, DataSource, Model, Optimizer, OptimizerHandle, Recipe, RecipeConfig,
    RecipeError, Result, State, Value,
};

/// Callbacks supplied by the caller, run before the built-in ones.
#[derive(Default)]
pub struct ClassifierCallbacks {
    pub train: Vec<Box<dyn Callback>>,
    pub test: Vec<Box<dyn Callback>>,
}

/// What a finished classification run hands back.
#[derive(Debug, Clone)]
pub struct ClassifierOutcome {
    pub state: State,
    pub test_metrics: BTreeMap<String, Value>,
}

/// A model trained on one data source and evaluated on another every
/// `test_every` iterations.
///
/// The train loop carries a [`Counter`], the caller's callbacks, a windowed
/// loss average, accuracy, a logger and the evaluation sub-loop. The test loop
/// carries the caller's test callbacks, epoch loss and accuracy, an epoch-end
/// logger and, when enabled, a checkpoint of the model and optimizer.
pub struct ImageClassifier<M> {
    model: Arc<Mutex<M>>,
    optimizer: Arc<Mutex<Box<dyn Optimizer>>>,
    train: Recipe,
}

impl<M: Model + 'static> ImageClassifier<M> {
    pub fn new(
        mut model: M,
        train_data: impl DataSource + 'static,
        test_data: impl DataSource + 'static,
        config: &RecipeConfig,
        callbacks: ClassifierCallbacks,
    ) -> Self {
        model.to_device(config.device);
        let optimizer = Arc::new(Mutex::new(model.make_optimizer()));
        let model = Arc::new(Mutex::new(model));

        let mut test = Recipe::new("test", test_step(Arc::clone(&model)), test_data).to(config.device);
        build_test_callbacks(test.callbacks_mut(), callbacks.test, config, &model, &optimizer);

        let mut train = Recipe::new(
            "train",
            train_step(Arc::clone(&model), Arc::clone(&optimizer)),
            train_data,
        )
        .to(config.device);
        train
            .callbacks_mut()
            .add_prologue(Counter::new())
            .add_callbacks(callbacks.train)
            .add_epilogue(WindowedMetricAvg::with_window("loss", config.window))
            .add_epilogue(AccAvg::new(true))
            .add_epilogue(MetricLogger::new(config.log_every).with_prefix("train"))
            .add_epilogue(CallRecipe::new(test, config.test_every, "test").with_init(fresh_evaluation));

        Self {
            model,
            optimizer,
            train,
        }
    }

    /// Shared handle to the model, e.g. for inspection after training.
    pub fn model(&self) -> Arc<Mutex<M>> {
        Arc::clone(&self.model)
    }

    pub fn optimizer(&self) -> Arc<Mutex<Box<dyn Optimizer>>> {
        Arc::clone(&self.optimizer)
    }

    pub fn recipe(&self) -> &Recipe {
        &self.train
    }

    pub fn recipe_mut(&mut self) -> &mut Recipe {
        &mut self.train
    }

    /// Train for `epochs`, leaving the model in eval mode.
    pub fn run(&mut self, epochs: usize) -> Result<ClassifierOutcome> {
        let state = self.train.run(epochs)?.clone();
        self.model
            .lock()
            .map_err(|e| RecipeError::poisoned("model", e))?
            .eval();

        let test_metrics = state
            .get("test_metrics")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        info!(epochs, ?test_metrics, "Classifier finished");
        Ok(ClassifierOutcome { state, test_metrics })
    }
}

/// Sync counters into the test loop and start each evaluation with no metrics.
fn fresh_evaluation(parent: &State, test: &mut Recipe) -> Result<()> {
    sync_counters(parent, test)?;
    test.state_mut().replace_metrics("metrics", BTreeMap::new());
    Ok(())
}

fn build_test_callbacks<M: Model + 'static>(
    runner: &mut CallbackRunner,
    user: Vec<Box<dyn Callback>>,
    config: &RecipeConfig,
    model: &Arc<Mutex<M>>,
    optimizer: &Arc<Mutex<Box<dyn Optimizer>>>,
) {
    runner
        .add_callbacks(user)
        .add_epilogue(EpochMetricAvg::new("loss", false))
        .add_epilogue(AccAvg::new(false))
        .add_epilogue(MetricLogger::new(-1).with_prefix("test"));
    if config.checkpoint.enabled {
        let manager = CheckpointManager::new(&config.checkpoint.dir, config.checkpoint.max_checkpoints);
        runner.add_epilogue(
            Checkpoint::new(manager, config.checkpoint.name.clone(), CheckpointTrigger::EpochEnd)
                .register("model", Arc::clone(model))
                .register("opt", OptimizerHandle(Arc::clone(optimizer))),
        );
    }
}

fn train_step<M: Model>(
    model: Arc<Mutex<M>>,
    optimizer: Arc<Mutex<Box<dyn Optimizer>>>,
) -> impl FnMut(&Value, &State) -> Result<State> + Send + 'static
where
    M: 'static,
{
    move |batch, _| {
        let mut model = model.lock().map_err(|e| RecipeError::poisoned("model", e))?;
        let mut opt = optimizer
            .lock()
            .map_err(|e| RecipeError::poisoned("optimizer", e))?;
        model.train();
        model.train_step(batch, &mut **opt)
    }
}

fn test_step<M: Model + 'static>(model: Arc<Mutex<M>>) -> impl FnMut(&Value, &State) -> Result<State> + Send + 'static {
    move |batch, _| {
        let mut model = model.lock().map_err(|e| RecipeError::poisoned("model", e))?;
        model.eval();
        let out = model.validation_step(batch);
        model.train();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::SoftmaxProbe;
    use trellis_core::{Module, Tensor, VecSource};

    fn tiny_batch() -> Value {
        Value::Tuple(vec![
            Value::Tensor(Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]).unwrap()),
            Value::Tensor(Tensor::from_slice(&[0.0, 1.0])),
        ])
    }

    #[test]
    fn test_model_left_in_eval_mode() {
        let config = RecipeConfig {
            test_every: 1,
            log_every: -1,
            checkpoint: trellis_core::CheckpointConfig {
                enabled: false,
                ..Default::default()
            },
            ..RecipeConfig::default()
        };
        let mut clf = ImageClassifier::new(
            SoftmaxProbe::new(2, 2),
            VecSource::new(vec![tiny_batch()]),
            VecSource::new(vec![tiny_batch()]),
            &config,
            ClassifierCallbacks::default(),
        );
        let outcome = clf.run(2).unwrap();
        assert!(!clf.model().lock().unwrap().is_training());
        assert!(outcome.test_metrics.contains_key("acc"));
        assert!(outcome.test_metrics.contains_key("loss"));
    }
}
