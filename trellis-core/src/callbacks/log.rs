use crate::callback::Callback;
use crate::error::Result;
use crate::state::State;

/// Copies the value at a dotted path into `metrics[to]` after every batch.
///
/// `Log::new("G_metrics.loss", "G_loss")` surfaces a sub-loop's loss in the
/// parent's metrics. A path that does not resolve is an error.
#[derive(Debug, Clone)]
pub struct Log {
    from: String,
    to: String,
}

impl Log {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl Callback for Log {
    fn name(&self) -> &str {
        "Log"
    }

    fn on_batch_end(&mut self, state: &mut State) -> Result<()> {
        let value = state.by_key(&self.from)?.clone();
        state.metrics_mut().insert(self.to.clone(), value);
        Ok(())
    }
}
