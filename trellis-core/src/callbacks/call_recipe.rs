use crate::callback::Callback;
use crate::error::Result;
use crate::recipe::Recipe;
use crate::state::State;
use tracing::debug;

/// Counters copied from the parent into the child before each child run.
pub const SYNCED_KEYS: [&str; 3] = ["epoch", "iters", "epoch_batch"];

/// Custom parent-to-child synchronization.
pub type InitFn = Box<dyn FnMut(&State, &mut Recipe) -> Result<()> + Send>;

/// Runs a child loop for one pass every `every` parent iterations.
///
/// Before the run, the parent's counters are copied into the child (one way),
/// or `init` is called instead when set. After it, the child's `metrics` are
/// published in the parent under `"{prefix}_metrics"`.
pub struct CallRecipe {
    recipe: Recipe,
    every: u64,
    prefix: String,
    init: Option<InitFn>,
}

impl CallRecipe {
    pub fn new(mut recipe: Recipe, every: u64, prefix: impl Into<String>) -> Self {
        recipe.set_nested(true);
        Self {
            recipe,
            every: every.max(1),
            prefix: prefix.into(),
            init: None,
        }
    }

    /// Replace the default counter sync.
    pub fn with_init(mut self, init: impl FnMut(&State, &mut Recipe) -> Result<()> + Send + 'static) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn metrics_key(&self) -> String {
        format!("{}_metrics", self.prefix)
    }
}

/// Copy `epoch`, `iters` and `epoch_batch` from `parent` into `child`.
pub fn sync_counters(parent: &State, child: &mut Recipe) -> Result<()> {
    let partial = SYNCED_KEYS
        .iter()
        .filter_map(|&key| parent.get(key).map(|v| (key.to_string(), v.clone())))
        .collect();
    child.update_state(partial)
}

impl Callback for CallRecipe {
    fn name(&self) -> &str {
        "CallRecipe"
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        let iters = state.iters()?;
        if iters % self.every != 0 {
            return Ok(());
        }

        match self.init.as_mut() {
            Some(init) => init(&*state, &mut self.recipe)?,
            None => sync_counters(&*state, &mut self.recipe)?,
        }
        debug!(child = self.recipe.name(), iters, "Running sub-loop");
        self.recipe.run(1)?;

        let key = self.metrics_key();
        state.replace_metrics(&key, self.recipe.state().metrics());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Hook;
    use crate::data::Steps;
    use crate::error::RecipeError;
    use crate::value::Value;

    fn echo_iters(_: &Value, state: &State) -> Result<State> {
        let mut metrics = std::collections::BTreeMap::new();
        metrics.insert("seen_iters".to_string(), Value::Int(state.int("iters")?));
        State::partial().with("metrics", metrics)
    }

    #[test]
    fn test_runs_on_multiples_and_publishes_metrics() {
        let child = Recipe::new("child", echo_iters, Steps(1));
        let mut cb = CallRecipe::new(child, 2, "G");
        let mut parent = State::new();
        parent.insert("epoch", 0).unwrap();
        parent.insert("epoch_batch", 1).unwrap();
        parent.insert("loss", 1.0).unwrap();

        parent.insert("iters", 1).unwrap();
        cb.call(Hook::OnBatchEnd, &mut parent).unwrap();
        assert!(!parent.contains("G_metrics"));

        parent.insert("iters", 4).unwrap();
        cb.call(Hook::OnBatchEnd, &mut parent).unwrap();
        assert_eq!(parent.by_key("G_metrics.seen_iters").unwrap(), &Value::Int(4));
        assert_eq!(parent.get("loss"), Some(&Value::Float(1.0)));

        let child_state = cb.recipe().state();
        for key in SYNCED_KEYS {
            assert_eq!(child_state.get(key), parent.get(key));
        }
    }

    #[test]
    fn test_wrapped_recipe_is_nested() {
        let plain = Recipe::new("child", echo_iters, Steps(1));
        assert!(!plain.is_nested());
        let cb = CallRecipe::new(plain, 1, "G");
        assert!(cb.recipe().is_nested());
    }

    #[test]
    fn test_custom_init_replaces_sync() {
        let child = Recipe::new("child", echo_iters, Steps(1));
        let mut cb = CallRecipe::new(child, 1, "Test").with_init(|_, child| {
            child.update_state(State::partial().with("iters", 100)?)
        });
        let mut parent = State::new();
        parent.insert("iters", 3).unwrap();
        cb.call(Hook::OnBatchEnd, &mut parent).unwrap();
        assert_eq!(parent.by_key("Test_metrics.seen_iters").unwrap(), &Value::Int(100));
        assert!(!cb.recipe().state().contains("epoch"));
    }

    #[test]
    fn test_child_failure_propagates() {
        let failing = |_: &Value, _: &State| -> Result<State> { Err(RecipeError::step("child broke")) };
        let mut cb = CallRecipe::new(Recipe::new("child", failing, Steps(1)), 1, "G");
        let mut parent = State::new();
        parent.insert("iters", 0).unwrap();
        assert!(matches!(
            cb.call(Hook::OnBatchEnd, &mut parent),
            Err(RecipeError::Step(_))
        ));
    }
}
