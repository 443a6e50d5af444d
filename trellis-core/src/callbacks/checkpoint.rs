use crate::callback::Callback;
use crate::checkpoint::{CheckpointManager, Checkpointable};
use crate::error::Result;
use crate::state::State;
use crate::value::Value;
use std::collections::BTreeMap;

/// When a [`Checkpoint`] callback writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTrigger {
    EpochEnd,
    /// After every batch whose `iters` is a multiple of `n`.
    Every(u64),
}

/// Saves the loop state plus registered objects through a
/// [`CheckpointManager`].
///
/// The payload is a mapping with the state snapshot under `"state"` and
/// each registered object's `state_dict` under its name. The file name
/// template may contain `{iters}` and `{epoch}`.
pub struct Checkpoint {
    manager: CheckpointManager,
    name_template: String,
    trigger: CheckpointTrigger,
    objects: Vec<(String, Box<dyn Checkpointable>)>,
}

impl Checkpoint {
    pub fn new(manager: CheckpointManager, name_template: impl Into<String>, trigger: CheckpointTrigger) -> Self {
        Self {
            manager,
            name_template: name_template.into(),
            trigger,
            objects: Vec::new(),
        }
    }

    /// Include `object` in every snapshot under `name`.
    pub fn register(mut self, name: impl Into<String>, object: impl Checkpointable + 'static) -> Self {
        self.objects.push((name.into(), Box::new(object)));
        self
    }

    fn save(&self, state: &State) -> Result<()> {
        let counter = |key| state.get(key).and_then(Value::as_int).unwrap_or(0);
        let (epoch, iters) = (counter("epoch"), counter("iters"));

        let mut payload = BTreeMap::new();
        payload.insert("state".to_string(), state.snapshot());
        for (name, object) in &self.objects {
            payload.insert(name.clone(), object.state_dict()?);
        }

        let name = self
            .name_template
            .replace("{iters}", &iters.to_string())
            .replace("{epoch}", &epoch.to_string());
        self.manager.save(&name, epoch, iters, &Value::Map(payload))?;
        Ok(())
    }
}

impl Callback for Checkpoint {
    fn name(&self) -> &str {
        "Checkpoint"
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        if let CheckpointTrigger::Every(n) = self.trigger {
            if state.iters()? % n.max(1) == 0 {
                self.save(state)?;
            }
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &mut State) -> Result<()> {
        if self.trigger == CheckpointTrigger::EpochEnd {
            self.save(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Hook;
    use tempfile::TempDir;

    #[test]
    fn test_epoch_end_checkpoint_payload() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 3);
        let mut cb = Checkpoint::new(manager.clone(), "ckpt_{epoch}_{iters}.json", CheckpointTrigger::EpochEnd)
            .register("extra", Value::Str("opaque".into()));

        let mut state = State::new();
        state.insert("epoch", 1).unwrap();
        state.insert("iters", 7).unwrap();
        state.insert("batch", Value::Int(99)).unwrap();
        cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        assert!(manager.list().unwrap().is_empty());

        cb.call(Hook::OnEpochEnd, &mut state).unwrap();
        let payload = manager.load("ckpt_1_7.json").unwrap();
        let payload = payload.as_map().unwrap();
        assert_eq!(payload["extra"], Value::Str("opaque".into()));
        let saved_state = payload["state"].as_map().unwrap();
        assert_eq!(saved_state["iters"], Value::Int(7));
        assert!(!saved_state.contains_key("batch"));
    }

    #[test]
    fn test_every_n_iterations() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(dir.path(), 10);
        let mut cb = Checkpoint::new(manager.clone(), "ckpt_{iters}.json", CheckpointTrigger::Every(3));
        let mut state = State::new();
        for iters in 0..7 {
            state.insert("iters", iters).unwrap();
            cb.call(Hook::OnBatchEnd, &mut state).unwrap();
        }
        cb.call(Hook::OnEpochEnd, &mut state).unwrap();
        let iters: Vec<_> = manager.list().unwrap().iter().map(|r| r.iters).collect();
        assert_eq!(iters, vec![0, 3, 6]);
    }
}
